//! The characteristic governor: notification subscription plus the
//! read/write conduit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;
use crate::governor::{GovernorHandle, GovernorOps, Lifecycle};
use crate::listener::GovernorListener;
use crate::manager::Manager;
use crate::transport::{CharacteristicHandle, Transport};
use crate::url::BluetoothObjectUrl;

pub struct CharacteristicGovernor {
    lifecycle: Lifecycle<CharacteristicGovernor>,
    notify_control: AtomicBool,
    notify_subscribed: AtomicBool,
    cached_value: Mutex<Option<Vec<u8>>>,
    events: Mutex<Option<BoxStream<'static, Vec<u8>>>>,
    /// Serializes writes so concurrent callers' values reach the handle in
    /// submission order, standing in for the platform SDK's write queue
    /// (see SPEC_FULL.md's characteristic governor section).
    write_queue: AsyncMutex<()>,
}

impl CharacteristicGovernor {
    pub(crate) fn new(
        url: BluetoothObjectUrl,
        manager: Weak<Manager>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(CharacteristicGovernor {
            lifecycle: Lifecycle::new(url, manager, transport),
            notify_control: AtomicBool::new(false),
            notify_subscribed: AtomicBool::new(false),
            cached_value: Mutex::new(None),
            events: Mutex::new(None),
            write_queue: AsyncMutex::new(()),
        })
    }

    pub fn url(&self) -> &BluetoothObjectUrl {
        self.lifecycle.url()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    pub fn cached_value(&self) -> Option<Vec<u8>> {
        self.cached_value.lock().unwrap().clone()
    }

    pub fn set_notify_control(&self, enabled: bool) {
        self.notify_control.store(enabled, Ordering::Relaxed);
    }

    pub fn is_notify_subscribed(&self) -> bool {
        self.notify_subscribed.load(Ordering::Relaxed)
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

    /// Reads the characteristic's current value through the interact
    /// conduit: resets the governor and propagates on any transport failure.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let value = self
            .lifecycle
            .interact(self, "read", |handle| async move {
                handle.read().await.map_err(|e| Box::new(e) as _)
            })
            .await?;
        *self.cached_value.lock().unwrap() = Some(value.clone());
        Ok(value)
    }

    /// Writes a value through the interact conduit. Writes from concurrent
    /// callers are serialized so they reach the handle in submission order.
    pub async fn write(&self, value: Vec<u8>) -> Result<()> {
        let _order = self.write_queue.lock().await;
        self.lifecycle
            .interact(self, "write", move |handle| async move {
                handle.write(&value).await.map_err(|e| Box::new(e) as _)
            })
            .await
    }

    /// Drains whatever notified values are currently buffered on the
    /// subscription stream, updating the cached value and forwarding each
    /// one to the owning device's `BluetoothSmartDeviceListener`s as
    /// `characteristic_changed`.
    fn drain_events(&self) {
        let mut guard = self.events.lock().unwrap();
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return,
        };
        while let Some(Some(value)) = stream.next().now_or_never() {
            *self.cached_value.lock().unwrap() = Some(value.clone());
            if let Some(device) = self
                .lifecycle
                .manager()
                .zip(self.url().device_url())
                .and_then(|(manager, device_url)| manager.existing_device_governor(&device_url))
            {
                device.notify_characteristic_changed(self.url(), &value);
            }
        }
    }
}

#[async_trait]
impl GovernorOps for CharacteristicGovernor {
    type Handle = dyn CharacteristicHandle;

    async fn acquire(
        &self,
        transport: &dyn Transport,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<Self::Handle>>> {
        transport.get_characteristic_handle(url).await
    }

    async fn init_handle(&self, handle: &Arc<Self::Handle>) -> Result<()> {
        if self.notify_control.load(Ordering::Relaxed) {
            handle.start_notify().await?;
            self.notify_subscribed.store(true, Ordering::Relaxed);
            *self.events.lock().unwrap() = Some(handle.subscribe());
        }
        Ok(())
    }

    async fn update_handle(&self, handle: &Arc<Self::Handle>) -> Result<()> {
        self.drain_events();

        let wants_notify = self.notify_control.load(Ordering::Relaxed);
        let is_subscribed = handle.is_notifying().await?;
        if wants_notify && !is_subscribed {
            handle.start_notify().await?;
            self.notify_subscribed.store(true, Ordering::Relaxed);
            *self.events.lock().unwrap() = Some(handle.subscribe());
        } else if !wants_notify && is_subscribed {
            handle.stop_notify().await?;
            self.notify_subscribed.store(false, Ordering::Relaxed);
            *self.events.lock().unwrap() = None;
        }
        Ok(())
    }

    async fn reset_handle(&self, _handle: &Arc<Self::Handle>) {
        self.notify_subscribed.store(false, Ordering::Relaxed);
        *self.events.lock().unwrap() = None;
    }
}

#[async_trait]
impl GovernorHandle for CharacteristicGovernor {
    fn url(&self) -> &BluetoothObjectUrl {
        self.lifecycle.url()
    }

    fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    fn last_activity(&self) -> Option<Instant> {
        self.lifecycle.last_activity()
    }

    async fn update(&self) {
        CharacteristicGovernor::update(self).await;
    }

    async fn reset(&self) {
        CharacteristicGovernor::reset(self).await;
    }

    async fn dispose(&self) {
        CharacteristicGovernor::dispose(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_no_cached_value_and_notify_off() {
        let url = BluetoothObjectUrl::characteristic(
            "hci0",
            "11:22:33:44:55:66",
            uuid::Uuid::from_u128(1),
        );
        let governor = CharacteristicGovernor::new(url, Weak::new(), transport_stub());
        assert_eq!(governor.cached_value(), None);
        assert!(!governor.is_notify_subscribed());
    }

    fn transport_stub() -> Arc<dyn Transport> {
        use crate::transport::{AdapterHandle, DeviceHandle, DiscoveredAdapter, DiscoveredDevice};

        struct NoopTransport;

        #[async_trait]
        impl Transport for NoopTransport {
            async fn get_adapter_handle(
                &self,
                _url: &BluetoothObjectUrl,
            ) -> Result<Option<Arc<dyn AdapterHandle>>> {
                Ok(None)
            }

            async fn get_device_handle(
                &self,
                _url: &BluetoothObjectUrl,
            ) -> Result<Option<Arc<dyn DeviceHandle>>> {
                Ok(None)
            }

            async fn get_characteristic_handle(
                &self,
                _url: &BluetoothObjectUrl,
            ) -> Result<Option<Arc<dyn CharacteristicHandle>>> {
                Ok(None)
            }

            async fn discovered_adapters(&self) -> Result<Vec<DiscoveredAdapter>> {
                Ok(Vec::new())
            }

            async fn discovered_devices(&self) -> Result<Option<Vec<DiscoveredDevice>>> {
                Ok(None)
            }
        }

        Arc::new(NoopTransport)
    }
}
