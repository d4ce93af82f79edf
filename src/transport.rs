//! The contract this crate expects of a concrete Bluetooth transport backend.
//!
//! Nothing in this module talks to a real adapter. It exists so the governor
//! and manager layer can be exercised (and tested) against any backend —
//! BlueZ over D-Bus, a mock for unit tests, or something else entirely —
//! without depending on one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;
use crate::url::BluetoothObjectUrl;

/// Common operations every native handle supports, regardless of whether it
/// represents an adapter, a device, or a characteristic.
#[async_trait]
pub trait Handle: Send + Sync {
    /// The URL this handle is bound to, including the protocol scheme of the
    /// backend that produced it.
    fn url(&self) -> &BluetoothObjectUrl;

    /// Releases whatever native resources back the handle. Called exactly
    /// once, after `reset_handle` has run, when a governor tears down.
    async fn dispose(&self);
}

/// An event pushed by an [`AdapterHandle`]'s subscription stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterEvent {
    PowerChanged(bool),
    DiscoveringChanged(bool),
}

#[async_trait]
pub trait AdapterHandle: Handle {
    async fn is_powered(&self) -> Result<bool>;
    async fn set_powered(&self, powered: bool) -> Result<()>;
    async fn is_discovering(&self) -> Result<bool>;
    async fn start_discovery(&self) -> Result<()>;
    async fn stop_discovery(&self) -> Result<()>;
    async fn alias(&self) -> Result<String>;
    async fn set_alias(&self, alias: &str) -> Result<()>;
    /// URLs of the devices currently known to this adapter.
    async fn device_urls(&self) -> Result<Vec<BluetoothObjectUrl>>;
    /// A stream of power/discovering changes, subscribed once in `init_handle`.
    fn subscribe(&self) -> BoxStream<'static, AdapterEvent>;
}

/// An event pushed by a [`DeviceHandle`]'s subscription stream.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    Rssi(i16),
    Connected,
    Disconnected,
    ServicesResolved(Vec<BluetoothObjectUrl>),
    ServicesUnresolved,
    Blocked(bool),
    ManufacturerData(HashMap<u16, Vec<u8>>),
    ServiceData(HashMap<Uuid, Vec<u8>>),
}

#[async_trait]
pub trait DeviceHandle: Handle {
    async fn is_connected(&self) -> Result<bool>;
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_blocked(&self) -> Result<bool>;
    async fn set_blocked(&self, blocked: bool) -> Result<()>;
    /// The device's advertised transmit power, if it advertises one.
    async fn tx_power(&self) -> Result<Option<i16>>;
    /// URLs of the characteristics currently resolved for this device.
    async fn characteristic_urls(&self) -> Result<Vec<BluetoothObjectUrl>>;
    fn subscribe(&self) -> BoxStream<'static, DeviceEvent>;
}

#[async_trait]
pub trait CharacteristicHandle: Handle {
    async fn read(&self) -> Result<Vec<u8>>;
    async fn write(&self, value: &[u8]) -> Result<()>;
    async fn is_notifying(&self) -> Result<bool>;
    async fn start_notify(&self) -> Result<()>;
    async fn stop_notify(&self) -> Result<()>;
    /// A stream of notified values, subscribed once notifications are enabled.
    fn subscribe(&self) -> BoxStream<'static, Vec<u8>>;
}

/// One adapter visible to a discovery pass. Identity is `url` alone (the
/// adapter address); `name`/`alias`/`powered`/`discovering` are mutable and
/// excluded from the diff the [`crate::manager::Manager`] runs between
/// passes.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredAdapter {
    pub url: BluetoothObjectUrl,
    pub name: Option<String>,
    pub alias: String,
    pub powered: bool,
    pub discovering: bool,
}

/// One device visible to a discovery pass. Identity is `url` (adapter
/// address, device address); the rest is mutable advertisement state.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredDevice {
    pub url: BluetoothObjectUrl,
    pub name: Option<String>,
    pub rssi: i16,
    pub tx_power: Option<i16>,
    pub connected: bool,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// The abstract factory that produces native handles and discovery snapshots.
///
/// Implemented by a concrete backend (BlueZ, a simulator, ...); never by this
/// crate. `get_*_handle` returning `Ok(None)` means "not currently available",
/// which is not an error: the governor simply leaves its handle unset and
/// tries again on the next refresh.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_adapter_handle(
        &self,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<dyn AdapterHandle>>>;

    async fn get_device_handle(
        &self,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<dyn DeviceHandle>>>;

    async fn get_characteristic_handle(
        &self,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<dyn CharacteristicHandle>>>;

    /// Adapters currently visible on the system.
    async fn discovered_adapters(&self) -> Result<Vec<DiscoveredAdapter>>;

    /// Devices currently visible on the system, or `None` if the backend
    /// cannot currently enumerate them (e.g. no powered adapter).
    async fn discovered_devices(&self) -> Result<Option<Vec<DiscoveredDevice>>>;
}
