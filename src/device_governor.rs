//! The device governor: connection reconciliation, online tracking, and the
//! RSSI filtering / distance-estimation pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use uuid::Uuid;

use crate::bitmap::{ConcurrentBitMap, WriteMode};
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::governor::{GovernorHandle, GovernorOps, Lifecycle};
use crate::listener::{BluetoothSmartDeviceListener, GenericBluetoothDeviceListener, GovernorListener, ListenerSet};
use crate::manager::Manager;
use crate::rssi::{estimate_distance, FilterKind, RssiFilter};
use crate::transport::{DeviceEvent, DeviceHandle, Transport};
use crate::url::BluetoothObjectUrl;

pub struct DeviceGovernor {
    lifecycle: Lifecycle<DeviceGovernor>,
    config: DeviceConfig,
    connection_control: ConcurrentBitMap,
    blocked_control: AtomicBool,
    events: Mutex<Option<BoxStream<'static, DeviceEvent>>>,
    rssi_filter: Mutex<Option<Box<dyn RssiFilter>>>,
    rssi_filter_kind: Mutex<FilterKind>,
    current_rssi: Mutex<Option<i16>>,
    advertised_tx_power: Mutex<Option<i16>>,
    last_advertised: Mutex<Option<Instant>>,
    last_rssi_notified: Mutex<Option<Instant>>,
    manufacturer_data: Mutex<HashMap<u16, Vec<u8>>>,
    service_data: Mutex<HashMap<Uuid, Vec<u8>>>,
    connected_actual: AtomicBool,
    blocked_actual: AtomicBool,
    online_actual: AtomicBool,
    generic_listeners: ListenerSet<dyn GenericBluetoothDeviceListener>,
    smart_listeners: ListenerSet<dyn BluetoothSmartDeviceListener>,
}

impl DeviceGovernor {
    pub(crate) fn new(
        url: BluetoothObjectUrl,
        manager: Weak<Manager>,
        transport: Arc<dyn Transport>,
        config: DeviceConfig,
    ) -> Arc<Self> {
        let filter_kind = config.rssi_filter.clone();
        let initial_filter = if config.rssi_filtering_enabled {
            filter_kind.instantiate()
        } else {
            None
        };
        Arc::new(DeviceGovernor {
            lifecycle: Lifecycle::new(url, manager, transport),
            config,
            connection_control: ConcurrentBitMap::new(),
            blocked_control: AtomicBool::new(false),
            events: Mutex::new(None),
            rssi_filter: Mutex::new(initial_filter),
            rssi_filter_kind: Mutex::new(filter_kind),
            current_rssi: Mutex::new(None),
            advertised_tx_power: Mutex::new(None),
            last_advertised: Mutex::new(None),
            last_rssi_notified: Mutex::new(None),
            manufacturer_data: Mutex::new(HashMap::new()),
            service_data: Mutex::new(HashMap::new()),
            connected_actual: AtomicBool::new(false),
            blocked_actual: AtomicBool::new(false),
            online_actual: AtomicBool::new(false),
            generic_listeners: ListenerSet::new(),
            smart_listeners: ListenerSet::new(),
        })
    }

    pub fn url(&self) -> &BluetoothObjectUrl {
        self.lifecycle.url()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    pub fn is_connected(&self) -> bool {
        self.connected_actual.load(Ordering::Relaxed)
    }

    pub fn is_online(&self) -> bool {
        self.online_actual.load(Ordering::Relaxed)
    }

    pub fn current_rssi(&self) -> Option<i16> {
        *self.current_rssi.lock().unwrap()
    }

    /// Distance estimate in metres from the last reported RSSI, per the
    /// log-distance path loss model. Returns `0.0` (the documented sentinel)
    /// if no TX power is known.
    pub fn estimated_distance(&self) -> f64 {
        let rssi = match self.current_rssi() {
            Some(rssi) => rssi,
            None => return 0.0,
        };
        estimate_distance(
            rssi,
            self.config.measured_tx_power,
            *self.advertised_tx_power.lock().unwrap(),
            self.config.signal_propagation_exponent,
        )
    }

    /// The adapter URL this device is currently best reached through. If
    /// several adapters see the same device address, the one with the
    /// smallest estimated distance wins (ties broken by adapter address).
    pub fn location(&self) -> BluetoothObjectUrl {
        let own_adapter = self.url().adapter_url();
        let device_address = match self.url().device_address() {
            Some(address) => address.to_owned(),
            None => return own_adapter,
        };
        let manager = match self.lifecycle.manager() {
            Some(manager) => manager,
            None => return own_adapter,
        };
        let mut best: (BluetoothObjectUrl, f64) = (own_adapter, self.estimated_distance());
        for sibling in manager.device_governors_with_address(&device_address) {
            if sibling.url() == self.url() {
                continue;
            }
            let candidate = sibling.url().adapter_url();
            let distance = sibling.estimated_distance();
            let better = distance < best.1
                || (distance == best.1
                    && candidate.adapter_address() < best.0.adapter_address());
            if better {
                best = (candidate, distance);
            }
        }
        best.0
    }

    /// Sets or clears the connection-control bit for `caller_index` (0..=63).
    /// Any caller's bit being set keeps the device connected; all clear lets
    /// it disconnect on the next refresh.
    pub fn set_connection_control(&self, caller_index: u8, value: bool) -> Result<()> {
        self.connection_control
            .set(caller_index, value, WriteMode::Cumulative, |_| {}, |_| {})
    }

    pub fn set_blocked_control(&self, blocked: bool) {
        self.blocked_control.store(blocked, Ordering::Relaxed);
    }

    /// Replaces the RSSI filter, discarding whatever smoothing state the
    /// previous one held.
    pub fn set_rssi_filter(&self, kind: FilterKind) {
        *self.rssi_filter.lock().unwrap() = kind.instantiate();
        *self.rssi_filter_kind.lock().unwrap() = kind;
    }

    pub fn add_listener(&self, listener: Arc<dyn GovernorListener>) {
        self.lifecycle.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GovernorListener>) {
        self.lifecycle.remove_listener(listener);
    }

    pub fn add_generic_listener(&self, listener: Arc<dyn GenericBluetoothDeviceListener>) {
        self.generic_listeners.add(listener);
    }

    pub fn remove_generic_listener(&self, listener: &Arc<dyn GenericBluetoothDeviceListener>) {
        self.generic_listeners.remove(listener);
    }

    pub fn add_smart_listener(&self, listener: Arc<dyn BluetoothSmartDeviceListener>) {
        self.smart_listeners.add(listener);
    }

    pub fn remove_smart_listener(&self, listener: &Arc<dyn BluetoothSmartDeviceListener>) {
        self.smart_listeners.remove(listener);
    }

    /// Forwards a notified value from one of this device's characteristic
    /// governors to this device's `BluetoothSmartDeviceListener`s.
    pub(crate) fn notify_characteristic_changed(&self, url: &BluetoothObjectUrl, value: &[u8]) {
        self.smart_listeners
            .notify(self.url(), |l| l.characteristic_changed(url, value));
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

    /// Feeds one raw RSSI sample through the filtering/throttling pipeline.
    /// Called for every `DeviceEvent::Rssi` drained from the subscription,
    /// and directly by tests exercising the pipeline in isolation.
    pub(crate) fn on_rssi_sample(&self, raw_rssi: i16) {
        let now = Instant::now();
        *self.last_advertised.lock().unwrap() = Some(now);
        let reportable = {
            let mut filter = self.rssi_filter.lock().unwrap();
            match filter.as_mut() {
                Some(filter) => filter.filter(raw_rssi),
                None => raw_rssi,
            }
        };
        *self.current_rssi.lock().unwrap() = Some(reportable);

        let rate = self.config.rssi_reporting_rate;
        let mut last_notified = self.last_rssi_notified.lock().unwrap();
        let should_emit = rate.is_zero()
            || last_notified.map_or(true, |t| now.duration_since(t) >= rate);
        if should_emit {
            *last_notified = Some(now);
            drop(last_notified);
            self.generic_listeners
                .notify(self.url(), |l| l.rssi_changed(reportable));
        }
    }

    fn set_manufacturer_data(&self, data: HashMap<u16, Vec<u8>>) {
        let mut cached = self.manufacturer_data.lock().unwrap();
        if *cached != data {
            *cached = data.clone();
            drop(cached);
            self.generic_listeners
                .notify(self.url(), |l| l.manufacturer_data_changed(&data));
        }
    }

    fn set_service_data(&self, data: HashMap<Uuid, Vec<u8>>) {
        let mut cached = self.service_data.lock().unwrap();
        if *cached != data {
            *cached = data.clone();
            drop(cached);
            self.generic_listeners
                .notify(self.url(), |l| l.service_data_changed(&data));
        }
    }

    fn set_blocked_actual(&self, blocked: bool) {
        if self.blocked_actual.swap(blocked, Ordering::Relaxed) != blocked {
            self.generic_listeners.notify(self.url(), |l| l.blocked(blocked));
        }
    }

    fn drain_events(&self) {
        let mut guard = self.events.lock().unwrap();
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return,
        };
        while let Some(Some(event)) = stream.next().now_or_never() {
            match event {
                DeviceEvent::Rssi(rssi) => self.on_rssi_sample(rssi),
                DeviceEvent::Connected => {
                    self.connected_actual.store(true, Ordering::Relaxed);
                    self.smart_listeners.notify(self.url(), |l| l.connected());
                }
                DeviceEvent::Disconnected => {
                    self.connected_actual.store(false, Ordering::Relaxed);
                    self.smart_listeners.notify(self.url(), |l| l.disconnected());
                }
                DeviceEvent::ServicesResolved(services) => {
                    self.smart_listeners
                        .notify(self.url(), |l| l.services_resolved(&services));
                }
                DeviceEvent::ServicesUnresolved => {
                    self.smart_listeners
                        .notify(self.url(), |l| l.services_unresolved());
                }
                DeviceEvent::Blocked(blocked) => self.set_blocked_actual(blocked),
                DeviceEvent::ManufacturerData(data) => self.set_manufacturer_data(data),
                DeviceEvent::ServiceData(data) => self.set_service_data(data),
            }
        }
    }

    fn update_online(&self) {
        let now_online = self
            .lifecycle
            .last_activity()
            .map(|last| last.elapsed() <= self.config.online_timeout)
            .unwrap_or(false);
        if self.online_actual.swap(now_online, Ordering::Relaxed) != now_online {
            if now_online {
                self.generic_listeners.notify(self.url(), |l| l.online());
            } else {
                self.generic_listeners.notify(self.url(), |l| l.offline());
            }
        }
    }
}

#[async_trait]
impl GovernorOps for DeviceGovernor {
    type Handle = dyn DeviceHandle;

    async fn acquire(
        &self,
        transport: &dyn Transport,
        url: &BluetoothObjectUrl,
    ) -> Result<Option<Arc<Self::Handle>>> {
        transport.get_device_handle(url).await
    }

    async fn init_handle(&self, handle: &Arc<Self::Handle>) -> Result<()> {
        *self.events.lock().unwrap() = Some(handle.subscribe());
        *self.advertised_tx_power.lock().unwrap() = handle.tx_power().await?;
        self.connected_actual
            .store(handle.is_connected().await?, Ordering::Relaxed);
        self.blocked_actual
            .store(handle.is_blocked().await?, Ordering::Relaxed);
        Ok(())
    }

    async fn update_handle(&self, handle: &Arc<Self::Handle>) -> Result<()> {
        self.drain_events();

        let desired_blocked = self.blocked_control.load(Ordering::Relaxed);
        if handle.is_blocked().await? != desired_blocked {
            handle.set_blocked(desired_blocked).await?;
            self.set_blocked_actual(desired_blocked);
        }

        let wants_connection = self.connection_control.any();
        let is_connected = handle.is_connected().await?;
        if wants_connection && !is_connected {
            handle.connect().await?;
        } else if !wants_connection && is_connected {
            handle.disconnect().await?;
        }

        self.update_online();
        Ok(())
    }

    async fn reset_handle(&self, _handle: &Arc<Self::Handle>) {
        *self.events.lock().unwrap() = None;
        self.connected_actual.store(false, Ordering::Relaxed);
        self.online_actual.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl GovernorHandle for DeviceGovernor {
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
        DeviceGovernor::update(self).await;
    }

    async fn reset(&self) {
        DeviceGovernor::reset(self).await;
    }

    async fn dispose(&self) {
        DeviceGovernor::dispose(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AdapterHandle, CharacteristicHandle, DiscoveredAdapter, DiscoveredDevice};
    use std::time::Duration;

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

    fn new_for_test() -> Arc<DeviceGovernor> {
        let url = BluetoothObjectUrl::device("hci0", "11:22:33:44:55:66");
        DeviceGovernor::new(
            url,
            Weak::new(),
            Arc::new(NoopTransport),
            DeviceConfig {
                rssi_reporting_rate: Duration::from_millis(1000),
                ..DeviceConfig::default()
            },
        )
    }

    #[test]
    fn connection_control_round_trips_to_zero() {
        let governor = new_for_test();
        governor.set_connection_control(3, true).unwrap();
        assert!(governor.connection_control.any());
        governor.set_connection_control(3, false).unwrap();
        assert!(!governor.connection_control.any());
    }

    #[test]
    fn distance_sentinel_without_tx_power() {
        let governor = new_for_test();
        governor.on_rssi_sample(-70);
        assert_eq!(governor.estimated_distance(), 0.0);
    }
}
