//! The singleton registry, scheduler, and discovery loop: the one place that
//! knows how to construct a governor for a URL, keep it refreshed, and walk
//! the adapter→device→characteristic hierarchy for cascading operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::adapter_governor::AdapterGovernor;
use crate::characteristic_governor::CharacteristicGovernor;
use crate::config::{DeviceConfig, ManagerConfig};
use crate::device_governor::DeviceGovernor;
use crate::governor::GovernorHandle;
use crate::listener::{AdapterDiscoveryListener, DeviceDiscoveryListener, ListenerSet};
use crate::transport::{DiscoveredAdapter, DiscoveredDevice, Transport};
use crate::url::BluetoothObjectUrl;

/// A governor of unknown concrete kind, as stored in the registry. Callers
/// that need the concrete type go through `Manager::{adapter,device,
/// characteristic}_governor`, which construct-or-look-up the right variant;
/// cascading/registry-walking code uses the `GovernorHandle` view instead.
#[derive(Clone)]
enum AnyGovernor {
    Adapter(Arc<AdapterGovernor>),
    Device(Arc<DeviceGovernor>),
    Characteristic(Arc<CharacteristicGovernor>),
}

impl AnyGovernor {
    fn as_handle(&self) -> &dyn GovernorHandle {
        match self {
            AnyGovernor::Adapter(g) => g.as_ref(),
            AnyGovernor::Device(g) => g.as_ref(),
            AnyGovernor::Characteristic(g) => g.as_ref(),
        }
    }

    fn url(&self) -> &BluetoothObjectUrl {
        self.as_handle().url()
    }

    async fn update(&self) {
        self.as_handle().update().await;
    }

    async fn reset(&self) {
        self.as_handle().reset().await;
    }

    async fn dispose(&self) {
        self.as_handle().dispose().await;
    }
}

pub struct Manager {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    default_device_config: DeviceConfig,
    pending_device_configs: Mutex<HashMap<BluetoothObjectUrl, DeviceConfig>>,
    start_discovering: AtomicBool,
    registry: Mutex<HashMap<BluetoothObjectUrl, AnyGovernor>>,
    refresh_tasks: Mutex<HashMap<BluetoothObjectUrl, JoinHandle<()>>>,
    refresh_semaphore: Arc<Semaphore>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    discovered_adapters: Mutex<HashMap<String, DiscoveredAdapter>>,
    discovered_devices: Mutex<HashMap<(String, String), DiscoveredDevice>>,
    adapter_listeners: ListenerSet<dyn AdapterDiscoveryListener>,
    device_listeners: ListenerSet<dyn DeviceDiscoveryListener>,
}

impl Manager {
    pub fn new(transport: Arc<dyn Transport>, config: ManagerConfig) -> Arc<Self> {
        let refresh_concurrency = config.refresh_concurrency.max(1);
        let start_discovering = config.start_discovering;
        Arc::new(Manager {
            transport,
            config,
            default_device_config: DeviceConfig::default(),
            pending_device_configs: Mutex::new(HashMap::new()),
            start_discovering: AtomicBool::new(start_discovering),
            registry: Mutex::new(HashMap::new()),
            refresh_tasks: Mutex::new(HashMap::new()),
            refresh_semaphore: Arc::new(Semaphore::new(refresh_concurrency)),
            discovery_task: Mutex::new(None),
            discovered_adapters: Mutex::new(HashMap::new()),
            discovered_devices: Mutex::new(HashMap::new()),
            adapter_listeners: ListenerSet::new(),
            device_listeners: ListenerSet::new(),
        })
    }

    pub fn add_adapter_discovery_listener(&self, listener: Arc<dyn AdapterDiscoveryListener>) {
        self.adapter_listeners.add(listener);
    }

    pub fn remove_adapter_discovery_listener(&self, listener: &Arc<dyn AdapterDiscoveryListener>) {
        self.adapter_listeners.remove(listener);
    }

    pub fn add_device_discovery_listener(&self, listener: Arc<dyn DeviceDiscoveryListener>) {
        self.device_listeners.add(listener);
    }

    pub fn remove_device_discovery_listener(&self, listener: &Arc<dyn DeviceDiscoveryListener>) {
        self.device_listeners.remove(listener);
    }

    /// Overrides the `DeviceConfig` used the first time `url` is looked up.
    /// Has no effect once the device governor already exists.
    pub fn set_device_config(&self, url: BluetoothObjectUrl, config: DeviceConfig) {
        // Configs for not-yet-created governors are staged in the registry's
        // lock-protected map keyed by URL, reusing `discovered_devices`'s
        // sibling storage would conflate identity with config, so this gets
        // its own map.
        self.pending_device_configs
            .lock()
            .unwrap()
            .insert(url, config);
    }

    /// Starts the periodic discovery pass, if not already running.
    /// Idempotent under concurrent calls.
    pub async fn start(self: &Arc<Self>, start_discovering: bool) {
        let mut task = self.discovery_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        self.start_discovering.store(start_discovering, Ordering::Relaxed);
        let manager = self.clone();
        let period = if self.config.discovery_rate.is_zero() {
            None
        } else {
            Some(self.config.discovery_rate)
        };
        *task = Some(tokio::spawn(async move {
            loop {
                manager.run_discovery_pass().await;
                match period {
                    Some(period) => tokio::time::sleep(period).await,
                    None => tokio::task::yield_now().await,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.discovery_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub async fn adapter_governor(self: &Arc<Self>, url: &BluetoothObjectUrl) -> Arc<AdapterGovernor> {
        let adapter_url = url.adapter_url();
        let (governor, created) = {
            let mut registry = self.registry.lock().unwrap();
            if let Some(existing) = registry.get(&adapter_url) {
                (existing.clone(), false)
            } else {
                let governor = AnyGovernor::Adapter(AdapterGovernor::new(
                    adapter_url.clone(),
                    Arc::downgrade(self),
                    self.transport.clone(),
                    self.start_discovering.load(Ordering::Relaxed),
                ));
                registry.insert(adapter_url.clone(), governor.clone());
                (governor, true)
            }
        };
        if created {
            governor.update().await;
            self.schedule_refresh(adapter_url, governor.clone());
        }
        match governor {
            AnyGovernor::Adapter(g) => g,
            _ => unreachable!("adapter_url always maps to an AnyGovernor::Adapter"),
        }
    }

    pub async fn device_governor(self: &Arc<Self>, url: &BluetoothObjectUrl) -> Arc<DeviceGovernor> {
        let device_url = url.device_url().unwrap_or_else(|| url.clone());
        let (governor, created) = {
            let mut registry = self.registry.lock().unwrap();
            if let Some(existing) = registry.get(&device_url) {
                (existing.clone(), false)
            } else {
                let config = self
                    .pending_device_configs
                    .lock()
                    .unwrap()
                    .remove(&device_url)
                    .unwrap_or_else(|| self.default_device_config.clone());
                let governor = AnyGovernor::Device(DeviceGovernor::new(
                    device_url.clone(),
                    Arc::downgrade(self),
                    self.transport.clone(),
                    config,
                ));
                registry.insert(device_url.clone(), governor.clone());
                (governor, true)
            }
        };
        if created {
            governor.update().await;
            self.schedule_refresh(device_url, governor.clone());
        }
        match governor {
            AnyGovernor::Device(g) => g,
            _ => unreachable!("device_url always maps to an AnyGovernor::Device"),
        }
    }

    pub async fn characteristic_governor(
        self: &Arc<Self>,
        url: &BluetoothObjectUrl,
    ) -> Arc<CharacteristicGovernor> {
        let (governor, created) = {
            let mut registry = self.registry.lock().unwrap();
            if let Some(existing) = registry.get(url) {
                (existing.clone(), false)
            } else {
                let governor = AnyGovernor::Characteristic(CharacteristicGovernor::new(
                    url.clone(),
                    Arc::downgrade(self),
                    self.transport.clone(),
                ));
                registry.insert(url.clone(), governor.clone());
                (governor, true)
            }
        };
        if created {
            governor.update().await;
            self.schedule_refresh(url.clone(), governor.clone());
        }
        match governor {
            AnyGovernor::Characteristic(g) => g,
            _ => unreachable!("url always maps to an AnyGovernor::Characteristic here"),
        }
    }

    fn existing_adapter_governor(&self, url: &BluetoothObjectUrl) -> Option<Arc<AdapterGovernor>> {
        match self.registry.lock().unwrap().get(url) {
            Some(AnyGovernor::Adapter(g)) => Some(g.clone()),
            _ => None,
        }
    }

    /// Looks up an already-registered device governor without creating one,
    /// used by a characteristic governor to forward notified values to its
    /// parent device's listeners.
    pub(crate) fn existing_device_governor(&self, url: &BluetoothObjectUrl) -> Option<Arc<DeviceGovernor>> {
        match self.registry.lock().unwrap().get(url) {
            Some(AnyGovernor::Device(g)) => Some(g.clone()),
            _ => None,
        }
    }

    /// All device governors sharing `device_address`, across every adapter
    /// that has seen them. Used by `DeviceGovernor::location` to pick the
    /// closest adapter when a device is visible through several.
    pub(crate) fn device_governors_with_address(&self, device_address: &str) -> Vec<Arc<DeviceGovernor>> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter_map(|g| match g {
                AnyGovernor::Device(device) if device.url().device_address() == Some(device_address) => {
                    Some(device.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub async fn dispose_governor(&self, url: &BluetoothObjectUrl) {
        let governor = self.registry.lock().unwrap().remove(url);
        if let Some(task) = self.refresh_tasks.lock().unwrap().remove(url) {
            task.abort();
        }
        if let Some(governor) = governor {
            governor.dispose().await;
        }
    }

    /// Called by a governor's `Lifecycle` right after it transitions to
    /// `Ready`. The base manager has no bookkeeping of its own to do here;
    /// the hook exists so a future extension (metrics, dependent-governor
    /// warm-up) has somewhere to plug in without changing the lifecycle.
    pub(crate) async fn governor_ready(&self, url: &BluetoothObjectUrl, ready: bool) {
        log::trace!("{}: governor_ready({})", url, ready);
    }

    pub(crate) async fn reset_descendants(&self, parent: &BluetoothObjectUrl) {
        let descendants: Vec<AnyGovernor> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .filter(|g| g.url().is_descendant(parent))
            .cloned()
            .collect();
        for governor in descendants {
            governor.reset().await;
        }
    }

    pub async fn update_descendants(&self, parent: &BluetoothObjectUrl) {
        let descendants: Vec<AnyGovernor> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .filter(|g| g.url().is_descendant(parent))
            .cloned()
            .collect();
        for governor in descendants {
            governor.update().await;
        }
    }

    pub async fn dispose(&self) {
        self.stop().await;
        let tasks: Vec<JoinHandle<()>> = self.refresh_tasks.lock().unwrap().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.abort();
        }
        self.adapter_listeners.clear();
        self.device_listeners.clear();
        let governors: Vec<AnyGovernor> = self.registry.lock().unwrap().drain().map(|(_, g)| g).collect();
        for governor in governors {
            governor.dispose().await;
        }
    }

    fn schedule_refresh(&self, url: BluetoothObjectUrl, governor: AnyGovernor) {
        let period = self.config.refresh_rate;
        let semaphore = self.refresh_semaphore.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let permit = semaphore.acquire().await.expect("refresh semaphore is never closed");
                governor.update().await;
                drop(permit);
            }
        });
        self.refresh_tasks.lock().unwrap().insert(url, handle);
    }

    async fn run_discovery_pass(self: &Arc<Self>) {
        if let Err(error) = self.run_adapter_discovery().await {
            log::warn!("adapter discovery pass failed: {}", error);
        }
        if let Err(error) = self.run_device_discovery().await {
            log::warn!("device discovery pass failed: {}", error);
        }
    }

    async fn run_adapter_discovery(self: &Arc<Self>) -> crate::error::Result<()> {
        let seen = self.transport.discovered_adapters().await?;
        let mut previous = self.discovered_adapters.lock().unwrap().clone();
        let mut current = HashMap::new();

        for adapter in seen {
            let key = adapter.url.adapter_address().to_owned();
            let is_new = !previous.contains_key(&key);
            if is_new || self.config.rediscover {
                self.adapter_listeners
                    .notify(&adapter.url, |l| l.discovered(&adapter));
            }
            if is_new && self.start_discovering.load(Ordering::Relaxed) {
                self.adapter_governor(&adapter.url).await;
            }
            previous.remove(&key);
            current.insert(key, adapter);
        }

        for (_, lost) in previous {
            self.adapter_listeners.notify(&lost.url, |l| l.lost(&lost.url));
            if let Some(governor) = self.existing_adapter_governor(&lost.url) {
                governor.reset().await;
            }
        }

        *self.discovered_adapters.lock().unwrap() = current;
        Ok(())
    }

    async fn run_device_discovery(self: &Arc<Self>) -> crate::error::Result<()> {
        let seen = match self.transport.discovered_devices().await? {
            Some(devices) => devices,
            None => return Ok(()),
        };
        let mut previous = self.discovered_devices.lock().unwrap().clone();
        let mut current = HashMap::new();

        for device in seen {
            // Devices with RSSI=0 are transient/invalid advertisements.
            if device.rssi == 0 {
                continue;
            }
            let key = (
                device.url.adapter_address().to_owned(),
                device.url.device_address().unwrap_or_default().to_owned(),
            );
            let is_new = !previous.contains_key(&key);
            if is_new || self.config.rediscover {
                self.device_listeners
                    .notify(&device.url, |l| l.discovered(&device));
            }
            previous.remove(&key);
            current.insert(key, device);
        }

        for (_, lost) in previous {
            self.device_listeners.notify(&lost.url, |l| l.lost(&lost.url));
        }

        *self.discovered_devices.lock().unwrap() = current;
        Ok(())
    }
}
