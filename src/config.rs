//! Defaults for every tunable the governor and manager layer expose. Loading
//! these from a file or environment is a downstream concern (as it is for
//! `mijia-homie`'s own `Config`): this crate only carries the struct and its
//! defaults.

use std::time::Duration;

use crate::rssi::FilterKind;

const DEFAULT_DISCOVERY_RATE: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_RATE: Duration = Duration::from_secs(5);
const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RSSI_REPORTING_RATE: Duration = Duration::from_millis(1000);
const DEFAULT_PROPAGATION_EXPONENT: f64 = 2.0;
const DEFAULT_REFRESH_CONCURRENCY: usize = 5;

/// Manager-wide configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Period of the discovery pass. `Duration::ZERO` reschedules immediately
    /// after each pass completes rather than being rejected (see DESIGN.md).
    pub discovery_rate: Duration,
    /// Whether a freshly observed adapter's governor defaults to discovering.
    pub start_discovering: bool,
    /// Whether to re-emit `discovered` for entities already in the known set.
    pub rediscover: bool,
    /// Period of each governor's refresh task.
    pub refresh_rate: Duration,
    /// Number of governor refreshes that may run concurrently.
    pub refresh_concurrency: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            discovery_rate: DEFAULT_DISCOVERY_RATE,
            start_discovering: false,
            rediscover: false,
            refresh_rate: DEFAULT_REFRESH_RATE,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
        }
    }
}

/// Per-device configuration, read by a [`crate::device_governor::DeviceGovernor`]
/// when it is first created.
#[derive(Clone)]
pub struct DeviceConfig {
    pub online_timeout: Duration,
    pub measured_tx_power: Option<i16>,
    pub signal_propagation_exponent: f64,
    pub rssi_reporting_rate: Duration,
    pub rssi_filtering_enabled: bool,
    pub rssi_filter: FilterKind,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            online_timeout: DEFAULT_ONLINE_TIMEOUT,
            measured_tx_power: None,
            signal_propagation_exponent: DEFAULT_PROPAGATION_EXPONENT,
            rssi_reporting_rate: DEFAULT_RSSI_REPORTING_RATE,
            rssi_filtering_enabled: true,
            rssi_filter: FilterKind::default(),
        }
    }
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("online_timeout", &self.online_timeout)
            .field("measured_tx_power", &self.measured_tx_power)
            .field(
                "signal_propagation_exponent",
                &self.signal_propagation_exponent,
            )
            .field("rssi_reporting_rate", &self.rssi_reporting_rate)
            .field("rssi_filtering_enabled", &self.rssi_filtering_enabled)
            .finish_non_exhaustive()
    }
}
