//! A self-healing lifecycle and supervision layer over volatile Bluetooth
//! adapter/device/characteristic handles.
//!
//! User code never talks to a native handle directly. Instead it asks a
//! [`Manager`] for the [`AdapterGovernor`]/[`DeviceGovernor`]/
//! [`CharacteristicGovernor`] for a [`BluetoothObjectUrl`]; the governor
//! lazily acquires a handle from whatever [`Transport`](transport::Transport)
//! backend was supplied, keeps it initialized against a periodic refresh,
//! and tears itself (and its descendants) down the moment anything goes
//! wrong, ready to reacquire on the next pass.
//!
//! This crate carries no transport implementation of its own — see
//! [`transport`] for the contract a backend must satisfy.

pub mod adapter_governor;
pub mod bitmap;
pub mod characteristic_governor;
pub mod config;
pub mod device_governor;
pub mod error;
pub mod governor;
pub mod listener;
pub mod manager;
pub mod rssi;
pub mod transport;
pub mod url;

pub use adapter_governor::AdapterGovernor;
pub use characteristic_governor::CharacteristicGovernor;
pub use config::{DeviceConfig, ManagerConfig};
pub use device_governor::DeviceGovernor;
pub use error::{Error, Result};
pub use governor::GovernorState;
pub use manager::Manager;
pub use url::BluetoothObjectUrl;
