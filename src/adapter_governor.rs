//! The adapter governor: reconciles a local Bluetooth adapter's powered and
//! discovering state, and exposes the devices it currently sees.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use crate::error::Result;
use crate::governor::{GovernorHandle, GovernorOps, Lifecycle};
use crate::listener::GovernorListener;
use crate::manager::Manager;
use crate::transport::{AdapterEvent, AdapterHandle, Transport};
use crate::url::BluetoothObjectUrl;

pub struct AdapterGovernor {
    lifecycle: Lifecycle<AdapterGovernor>,
    discovering_control: AtomicBool,
    powered_control: AtomicBool,
    alias_control: Mutex<Option<String>>,
    events: Mutex<Option<BoxStream<'static, AdapterEvent>>>,
    powered_actual: AtomicBool,
    discovering_actual: AtomicBool,
}

impl AdapterGovernor {
    pub(crate) fn new(
        url: BluetoothObjectUrl,
        manager: Weak<Manager>,
        transport: Arc<dyn Transport>,
        start_discovering: bool,
    ) -> Arc<Self> {
        Arc::new(AdapterGovernor {
            lifecycle: Lifecycle::new(url, manager, transport),
            discovering_control: AtomicBool::new(start_discovering),
            powered_control: AtomicBool::new(true),
            alias_control: Mutex::new(None),
            events: Mutex::new(None),
            powered_actual: AtomicBool::new(false),
            discovering_actual: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &BluetoothObjectUrl {
        self.lifecycle.url()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    pub fn is_powered(&self) -> bool {
        self.powered_actual.load(Ordering::Relaxed)
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering_actual.load(Ordering::Relaxed)
    }

    pub fn set_powered_control(&self, powered: bool) {
        self.powered_control.store(powered, Ordering::Relaxed);
    }

    pub fn set_discovering_control(&self, discovering: bool) {
        self.discovering_control.store(discovering, Ordering::Relaxed);
    }

    pub fn set_alias(&self, alias: impl Into<String>) {
        *self.alias_control.lock().unwrap() = Some(alias.into());
    }

    pub fn add_listener(&self, listener: Arc<dyn GovernorListener>) {
        self.lifecycle.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GovernorListener>) {
        self.lifecycle.remove_listener(listener);
    }

    pub async fn update(&self) {
        self.lifecycle.update(self).await;
    }

    pub async fn reset(&self) {
        self.lifecycle.reset(self).await;
    }

    pub async fn dispose(&self) {
        self.lifecycle.dispose(self).await;
    }

    /// Device URLs the handle currently reports, or an empty list if not
    /// ready.
    pub async fn devices(&self) -> Vec<BluetoothObjectUrl> {
        match self.lifecycle.handle() {
            Some(handle) => handle.device_urls().await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn drain_events(&self) {
        let mut guard = self.events.lock().unwrap();
        if let Some(stream) = guard.as_mut() {
            while let Some(Some(event)) = stream.next().now_or_never() {
                match event {
                    AdapterEvent::PowerChanged(powered) => {
                        self.powered_actual.store(powered, Ordering::Relaxed);
                    }
                    AdapterEvent::DiscoveringChanged(discovering) => {
                        self.discovering_actual
                            .store(discovering, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GovernorOps for AdapterGovernor {
    type Handle = dyn AdapterHandle;

    async fn acquire(
        &self,
        transport: &dyn Transport,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<Self::Handle>>> {
        transport.get_adapter_handle(url).await
    }

    async fn init_handle(&self, handle: &Arc<Self::Handle>) -> Result<()> {
        *self.events.lock().unwrap() = Some(handle.subscribe());
        self.powered_actual
            .store(handle.is_powered().await?, Ordering::Relaxed);
        self.discovering_actual
            .store(handle.is_discovering().await?, Ordering::Relaxed);
        Ok(())
    }

    async fn update_handle(&self, handle: &Arc<Self::Handle>) -> Result<()> {
        self.drain_events();

        let desired_powered = self.powered_control.load(Ordering::Relaxed);
        if handle.is_powered().await? != desired_powered {
            handle.set_powered(desired_powered).await?;
            self.powered_actual.store(desired_powered, Ordering::Relaxed);
        }

        let desired_discovering = self.discovering_control.load(Ordering::Relaxed);
        if handle.is_discovering().await? != desired_discovering {
            if desired_discovering {
                handle.start_discovery().await?;
            } else {
                handle.stop_discovery().await?;
            }
            self.discovering_actual
                .store(desired_discovering, Ordering::Relaxed);
        }

        if let Some(alias) = self.alias_control.lock().unwrap().clone() {
            if handle.alias().await? != alias {
                handle.set_alias(&alias).await?;
            }
        }

        Ok(())
    }

    async fn reset_handle(&self, handle: &Arc<Self::Handle>) {
        if self.discovering_control.load(Ordering::Relaxed) {
            if let Err(error) = handle.stop_discovery().await {
                log::debug!("{}: stop_discovery on reset failed: {}", self.url(), error);
            }
        }
        *self.events.lock().unwrap() = None;
        self.powered_actual.store(false, Ordering::Relaxed);
        self.discovering_actual.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl GovernorHandle for AdapterGovernor {
    fn url(&self) -> &BluetoothObjectUrl {
        self.lifecycle.url()
    }

    fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    fn last_activity(&self) -> Option<std::time::Instant> {
        self.lifecycle.last_activity()
    }

    async fn update(&self) {
        AdapterGovernor::update(self).await;
    }

    async fn reset(&self) {
        AdapterGovernor::reset(self).await;
    }

    async fn dispose(&self) {
        AdapterGovernor::dispose(self).await;
    }
}
