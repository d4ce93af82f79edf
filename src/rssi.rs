use std::sync::Arc;

/// A stateful smoothing filter applied to a stream of raw RSSI samples.
pub trait RssiFilter: Send {
    /// Feeds one raw RSSI sample (dBm) and returns the filter's current
    /// smoothed estimate.
    fn filter(&mut self, raw_rssi: i16) -> i16;
}

/// One-dimensional Kalman filter tuned for RSSI smoothing. This is the
/// default filter: BLE RSSI readings are noisy but track a slowly-varying
/// true value, which is exactly what a Kalman filter is good at.
pub struct KalmanRssiFilter {
    process_variance: f64,
    measurement_variance: f64,
    estimate: f64,
    error_covariance: f64,
    initialized: bool,
}

impl KalmanRssiFilter {
    pub fn new() -> Self {
        KalmanRssiFilter {
            process_variance: 0.125,
            measurement_variance: 4.0,
            estimate: 0.0,
            error_covariance: 1.0,
            initialized: false,
        }
    }
}

impl Default for KalmanRssiFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RssiFilter for KalmanRssiFilter {
    fn filter(&mut self, raw_rssi: i16) -> i16 {
        let measurement = raw_rssi as f64;
        if !self.initialized {
            self.estimate = measurement;
            self.initialized = true;
            return raw_rssi;
        }
        let predicted_covariance = self.error_covariance + self.process_variance;
        let gain = predicted_covariance / (predicted_covariance + self.measurement_variance);
        self.estimate += gain * (measurement - self.estimate);
        self.error_covariance = (1.0 - gain) * predicted_covariance;
        self.estimate.round() as i16
    }
}

/// Simple sliding-window average, offered as a cheaper alternative to the
/// Kalman filter for callers who don't need its responsiveness to sudden
/// moves.
pub struct MovingAverageRssiFilter {
    window: Vec<i16>,
    capacity: usize,
}

impl MovingAverageRssiFilter {
    pub fn new(capacity: usize) -> Self {
        MovingAverageRssiFilter {
            window: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MovingAverageRssiFilter {
    fn default() -> Self {
        Self::new(8)
    }
}

impl RssiFilter for MovingAverageRssiFilter {
    fn filter(&mut self, raw_rssi: i16) -> i16 {
        if self.window.len() == self.capacity {
            self.window.remove(0);
        }
        self.window.push(raw_rssi);
        let sum: i32 = self.window.iter().map(|&v| v as i32).sum();
        (sum / self.window.len() as i32) as i16
    }
}

/// Selects which [`RssiFilter`] a device governor should instantiate.
#[derive(Clone)]
pub enum FilterKind {
    /// No smoothing; raw samples are reported as-is.
    None,
    /// [`KalmanRssiFilter`], the default.
    Kalman,
    /// [`MovingAverageRssiFilter`] with the given window size.
    MovingAverage(usize),
    /// A caller-supplied filter constructor, for anything not covered above.
    Custom(Arc<dyn Fn() -> Box<dyn RssiFilter> + Send + Sync>),
}

impl Default for FilterKind {
    fn default() -> Self {
        FilterKind::Kalman
    }
}

impl FilterKind {
    pub fn instantiate(&self) -> Option<Box<dyn RssiFilter>> {
        match self {
            FilterKind::None => None,
            FilterKind::Kalman => Some(Box::new(KalmanRssiFilter::new())),
            FilterKind::MovingAverage(window) => {
                Some(Box::new(MovingAverageRssiFilter::new(*window)))
            }
            FilterKind::Custom(factory) => Some(factory()),
        }
    }
}

/// Estimates distance in metres from a (possibly filtered) RSSI reading using
/// the log-distance path loss model `d = 10^((txPower - rssi) / (10 * n))`.
///
/// `measured_tx_power` takes precedence over `advertised_tx_power`; if
/// neither is available (both `None`) the function returns `0.0`, the
/// sentinel for "distance unavailable".
pub fn estimate_distance(
    rssi: i16,
    measured_tx_power: Option<i16>,
    advertised_tx_power: Option<i16>,
    propagation_exponent: f64,
) -> f64 {
    let tx_power = match measured_tx_power.or(advertised_tx_power) {
        Some(0) | None => return 0.0,
        Some(tx_power) => tx_power,
    };
    let exponent = (tx_power - rssi) as f64 / (10.0 * propagation_exponent);
    10f64.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_unavailable_without_tx_power() {
        assert_eq!(estimate_distance(-70, None, None, 2.0), 0.0);
        assert_eq!(estimate_distance(-70, Some(0), Some(0), 2.0), 0.0);
    }

    #[test]
    fn distance_prefers_measured_tx_power() {
        let via_measured = estimate_distance(-69, Some(-59), Some(-40), 2.0);
        let expected = 10f64.powf((-59.0 - -69.0) / 20.0);
        assert!((via_measured - expected).abs() < 1e-9);
    }

    #[test]
    fn distance_example_from_scenario() {
        let distance = estimate_distance(-69, Some(-59), None, 2.0);
        assert!((distance - 3.1623).abs() < 1e-3);
    }

    #[test]
    fn kalman_filter_converges_toward_constant_input() {
        let mut filter = KalmanRssiFilter::new();
        let mut last = filter.filter(-70);
        for _ in 0..20 {
            last = filter.filter(-70);
        }
        assert_eq!(last, -70);
    }

    #[test]
    fn moving_average_smooths_a_spike() {
        let mut filter = MovingAverageRssiFilter::new(4);
        filter.filter(-70);
        filter.filter(-70);
        filter.filter(-70);
        let smoothed = filter.filter(-40);
        assert!(smoothed > -70 && smoothed < -40);
    }
}
