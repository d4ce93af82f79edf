//! Listener interfaces the core exposes to user code. All methods are
//! synchronous and run on whichever task triggered the underlying state
//! transition — usually a refresh task — so implementations must be fast and
//! non-blocking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use crate::transport::{DiscoveredAdapter, DiscoveredDevice};
use crate::url::BluetoothObjectUrl;

/// Notified of a governor's own lifecycle transitions.
pub trait GovernorListener: Send + Sync {
    /// The governor acquired (`true`) or lost (`false`) its native handle.
    fn ready(&self, _ready: bool) {}
    /// The governor completed an update pass with observable effect.
    fn last_updated_changed(&self, _timestamp: Instant) {}
}

/// Notified of GATT-level state for a device: connection and service
/// resolution.
pub trait BluetoothSmartDeviceListener: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn services_resolved(&self, _services: &[BluetoothObjectUrl]) {}
    fn services_unresolved(&self) {}
    fn characteristic_changed(&self, _url: &BluetoothObjectUrl, _value: &[u8]) {}
}

/// Notified of advertisement-level state for a device: presence, signal, and
/// advertised data.
pub trait GenericBluetoothDeviceListener: Send + Sync {
    fn online(&self) {}
    fn offline(&self) {}
    fn rssi_changed(&self, _rssi: i16) {}
    fn blocked(&self, _blocked: bool) {}
    fn manufacturer_data_changed(&self, _data: &HashMap<u16, Vec<u8>>) {}
    fn service_data_changed(&self, _data: &HashMap<Uuid, Vec<u8>>) {}
}

/// Notified as the [`crate::manager::Manager`]'s discovery pass sees adapters
/// appear and disappear.
pub trait AdapterDiscoveryListener: Send + Sync {
    fn discovered(&self, adapter: &DiscoveredAdapter);
    fn lost(&self, url: &BluetoothObjectUrl);
}

/// Notified as the discovery pass sees devices appear and disappear.
pub trait DeviceDiscoveryListener: Send + Sync {
    fn discovered(&self, device: &DiscoveredDevice);
    fn lost(&self, url: &BluetoothObjectUrl);
}

/// A `Vec<Arc<dyn Listener>>` guarded by a plain mutex, with fan-out that
/// never lets one listener's panic take down the rest.
///
/// This is the one piece of machinery shared by the base governor's
/// `GovernorListener` set and every concrete governor's extra listener sets
/// (device/smart-device/discovery), so the "never abort iteration" contract
/// only has to be implemented once.
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    pub fn new() -> Self {
        ListenerSet {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn remove(&self, listener: &Arc<L>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }

    /// Invokes `f` on a snapshot of the current listeners. A listener that
    /// panics is logged and skipped; it never aborts the remaining fan-out
    /// and never propagates to the caller.
    pub fn notify(&self, url: &BluetoothObjectUrl, mut f: impl FnMut(&L)) {
        let snapshot: Vec<Arc<L>> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(listener.as_ref())));
            if let Err(payload) = result {
                log::error!("listener for {} panicked: {}", url, describe_panic(&payload));
            }
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_panic(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
