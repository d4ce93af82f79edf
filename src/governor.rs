//! The shared acquire/init/update/reset state machine every concrete governor
//! (adapter, device, characteristic) is built on top of.
//!
//! [`Lifecycle<O>`] owns all of the bookkeeping — state, cached handle,
//! locking, listener fan-out — while `O: GovernorOps` supplies the three
//! operations that differ per entity kind. A concrete governor is a struct
//! that *contains* a `Lifecycle<Self>` and implements `GovernorOps` for
//! itself; `Lifecycle`'s methods take `owner: &O` rather than holding a
//! reference back to it, which sidesteps the self-referential-struct problem
//! that an inheritance hierarchy would otherwise force.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::listener::{GovernorListener, ListenerSet};
use crate::manager::Manager;
use crate::transport::{Handle, Transport};
use crate::url::BluetoothObjectUrl;

/// A governor's position in its acquire/init/maintain/reset/dispose cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GovernorState {
    /// No handle has ever been acquired.
    New,
    /// A handle is cached and initialized; `update_handle` runs each refresh.
    Ready,
    /// The handle was torn down (by failure or explicit reset) and has not
    /// yet been reacquired.
    Reset,
    /// Terminal. No further state change or listener notification occurs.
    Disposed,
}

/// The three operations a concrete governor supplies to the shared lifecycle.
///
/// `acquire` is also entity-specific because the lookup goes through a
/// different `Transport` method (`get_adapter_handle` vs. `get_device_handle`
/// vs. `get_characteristic_handle`) depending on the handle type.
#[async_trait]
pub trait GovernorOps: Send + Sync {
    type Handle: Handle + ?Sized;

    async fn acquire(
        &self,
        transport: &dyn Transport,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<Self::Handle>>>;

    /// Runs once, right after a handle is first acquired. Any error here is
    /// treated exactly like an `update_handle` error: it triggers a reset.
    async fn init_handle(&self, handle: &Arc<Self::Handle>) -> Result<()>;

    /// Runs on every update pass once the handle is ready: reconciles
    /// user-requested state with the handle.
    async fn update_handle(&self, handle: &Arc<Self::Handle>) -> Result<()>;

    /// Runs once, as part of tearing a handle down. Errors are logged and
    /// swallowed: teardown must not itself fail the reset it's part of.
    async fn reset_handle(&self, handle: &Arc<Self::Handle>);
}

/// A minimal, object-safe view of a governor, used by the
/// [`Manager`](crate::manager::Manager) registry to hold adapter/device/
/// characteristic governors uniformly.
#[async_trait]
pub trait GovernorHandle: Send + Sync {
    fn url(&self) -> &BluetoothObjectUrl;
    fn is_ready(&self) -> bool;
    fn last_activity(&self) -> Option<Instant>;
    async fn update(&self);
    async fn reset(&self);
    async fn dispose(&self);
}

pub struct Lifecycle<O: GovernorOps> {
    url: BluetoothObjectUrl,
    manager: Weak<Manager>,
    transport: Arc<dyn Transport>,
    state: StdMutex<GovernorState>,
    handle: StdMutex<Option<Arc<O::Handle>>>,
    protocol_cache: StdMutex<Option<String>>,
    last_activity: StdMutex<Option<Instant>>,
    last_notified_activity: StdMutex<Option<Instant>>,
    listeners: ListenerSet<dyn GovernorListener>,
    update_lock: AsyncMutex<()>,
}

impl<O: GovernorOps> Lifecycle<O> {
    pub fn new(url: BluetoothObjectUrl, manager: Weak<Manager>, transport: Arc<dyn Transport>) -> Self {
        Lifecycle {
            url,
            manager,
            transport,
            state: StdMutex::new(GovernorState::New),
            handle: StdMutex::new(None),
            protocol_cache: StdMutex::new(None),
            last_activity: StdMutex::new(None),
            last_notified_activity: StdMutex::new(None),
            listeners: ListenerSet::new(),
            update_lock: AsyncMutex::new(()),
        }
    }

    pub fn url(&self) -> &BluetoothObjectUrl {
        &self.url
    }

    pub fn manager(&self) -> Option<Arc<Manager>> {
        self.manager.upgrade()
    }

    fn state(&self) -> GovernorState {
        *self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == GovernorState::Ready
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == GovernorState::Disposed
    }

    pub fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock().unwrap()
    }

    pub fn add_listener(&self, listener: Arc<dyn GovernorListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GovernorListener>) {
        self.listeners.remove(listener);
    }

    /// The handle currently cached, if any, cloned out from under the lock.
    pub fn handle(&self) -> Option<Arc<O::Handle>> {
        self.handle.lock().unwrap().clone()
    }

    /// `update()`: attempts a non-blocking acquisition of the update lock.
    /// If another task already owns it, waits for that pass to finish (so
    /// the caller observes at least one completed pass) and returns without
    /// re-entering.
    pub async fn update(&self, owner: &O) {
        if self.is_disposed() {
            return;
        }
        let _guard = match self.update_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                drop(self.update_lock.lock().await);
                return;
            }
        };
        if self.is_disposed() {
            return;
        }
        match self.acquire_and_run(owner).await {
            Ok(true) => {
                let now = Instant::now();
                *self.last_activity.lock().unwrap() = Some(now);
                let changed = {
                    let mut last_notified = self.last_notified_activity.lock().unwrap();
                    let changed = *last_notified != Some(now);
                    *last_notified = Some(now);
                    changed
                };
                if changed {
                    self.listeners
                        .notify(&self.url, |l| l.last_updated_changed(now));
                }
            }
            // No handle could be acquired: nothing was reconciled, so this
            // pass leaves last-activity and listeners untouched.
            Ok(false) => {}
            Err(error) => {
                log::warn!("{}: update failed, resetting: {}", self.url, error);
                self.do_reset(owner).await;
            }
        }
    }

    /// Steps 3a-3d of the `update()` algorithm, run with the update lock held.
    /// Returns `Ok(true)` iff `update_handle` actually ran against an
    /// acquired handle; `Ok(false)` means step 3a found no handle available
    /// and the caller must treat this pass as a no-op rather than a
    /// completed update.
    async fn acquire_and_run(&self, owner: &O) -> Result<bool> {
        let handle = match self.handle() {
            Some(handle) => handle,
            None => {
                let lookup_url = match self.protocol_cache.lock().unwrap().clone() {
                    Some(protocol) => self.url.copy_with_protocol(protocol),
                    None => self.url.clone(),
                };
                let handle = match owner.acquire(self.transport.as_ref(), &lookup_url).await? {
                    Some(handle) => handle,
                    None => return Ok(false),
                };
                if let Some(protocol) = handle.url().protocol() {
                    *self.protocol_cache.lock().unwrap() = Some(protocol.to_owned());
                }
                owner.init_handle(&handle).await?;
                *self.handle.lock().unwrap() = Some(handle.clone());
                *self.state.lock().unwrap() = GovernorState::Ready;
                self.listeners.notify(&self.url, |l| l.ready(true));
                if let Some(manager) = self.manager.upgrade() {
                    manager.governor_ready(&self.url, true).await;
                }
                handle
            }
        };
        owner.update_handle(&handle).await?;
        Ok(true)
    }

    /// `reset()`: guarded purely by the `state` field, not the update lock, so
    /// it can safely be called both from within a locked `update()` pass and
    /// from any other task without risking a self-deadlock on the (non
    /// reentrant) async update lock. See DESIGN.md.
    pub async fn reset(&self, owner: &O) {
        self.do_reset(owner).await;
    }

    async fn do_reset(&self, owner: &O) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, GovernorState::Reset | GovernorState::Disposed) {
                return;
            }
            *state = GovernorState::Reset;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.reset_descendants(&self.url).await;
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            owner.reset_handle(&handle).await;
            self.listeners.notify(&self.url, |l| l.ready(false));
            handle.dispose().await;
        }
    }

    pub async fn dispose(&self, owner: &O) {
        self.do_reset(owner).await;
        *self.state.lock().unwrap() = GovernorState::Disposed;
        self.listeners.clear();
    }

    /// The read/write conduit: ensures a handle is ready (performing one more
    /// `update()` if not), invokes `f`, and resets on any failure before
    /// propagating it.
    pub async fn interact<T, F, Fut>(&self, owner: &O, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<O::Handle>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>>
            + Send,
        T: Send,
    {
        if !self.is_ready() {
            self.update(owner).await;
            if !self.is_ready() {
                return Err(Error::NotReady(self.url.clone()));
            }
        }
        let handle = self
            .handle()
            .ok_or_else(|| Error::NotReady(self.url.clone()))?;
        match f(handle).await {
            Ok(value) => {
                *self.last_activity.lock().unwrap() = Some(Instant::now());
                Ok(value)
            }
            Err(source) => {
                log::warn!(
                    "{}: interact({}) failed (update in progress: {}): {}",
                    self.url,
                    name,
                    self.update_lock.try_lock().is_err(),
                    source
                );
                self.do_reset(owner).await;
                Err(Error::transport(self.url.clone(), StringError(source)))
            }
        }
    }
}

/// Wraps a boxed `interact` failure so it can flow through [`Error::Transport`]
/// without this crate needing to know the backend's concrete error type.
#[derive(Debug)]
struct StringError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}
