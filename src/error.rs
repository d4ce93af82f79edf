use thiserror::Error;

use crate::url::BluetoothObjectUrl;

/// Errors produced by the governor and manager layer.
///
/// Errors from the transport backend itself are not modelled here: they are
/// boxed into [`Error::Transport`] so that this crate stays independent of any
/// concrete backend's error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A governor does not currently hold a native handle, and an on-demand
    /// update did not manage to acquire one.
    #[error("{0} is not ready")]
    NotReady(BluetoothObjectUrl),

    /// A call into the transport backend failed.
    #[error("transport error for {url}: {source}")]
    Transport {
        url: BluetoothObjectUrl,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A governor has already been disposed and can no longer be used.
    #[error("{0} has been disposed")]
    Disposed(BluetoothObjectUrl),

    /// Misuse of a [`crate::bitmap::ConcurrentBitMap`].
    #[error("invalid bitmap index {0}, must be in 0..=63")]
    InvalidBitmapIndex(u8),

    /// [`crate::bitmap::ConcurrentBitMap::unique_index`] was called when more
    /// than one bit was set.
    #[error("bitmap has {0} bits set, expected exactly one")]
    NotUnique(u32),

    /// A URL could not be parsed.
    #[error("invalid bluetooth object url {0:?}: {1}")]
    UrlParseError(String, &'static str),
}

impl Error {
    pub fn transport(
        url: BluetoothObjectUrl,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport {
            url,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
