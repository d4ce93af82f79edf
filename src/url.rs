use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use uuid::Uuid;

use crate::error::Error;

/// Hierarchical identifier for an adapter, device, or characteristic.
///
/// Takes the form `protocol://adapterAddress/deviceAddress/characteristicUUID`,
/// with the device and characteristic segments optional. Two URLs compare
/// equal if their address segments match, even when one has a `protocol` and
/// the other doesn't — the protocol is metadata recording which backend
/// produced a handle for this URL, not part of its identity.
#[derive(Clone, Debug, Eq)]
pub struct BluetoothObjectUrl {
    protocol: Option<String>,
    adapter_address: String,
    device_address: Option<String>,
    characteristic_uuid: Option<Uuid>,
}

impl BluetoothObjectUrl {
    /// Builds an adapter-level URL.
    pub fn adapter(adapter_address: impl Into<String>) -> Self {
        BluetoothObjectUrl {
            protocol: None,
            adapter_address: adapter_address.into(),
            device_address: None,
            characteristic_uuid: None,
        }
    }

    /// Builds a device-level URL.
    pub fn device(adapter_address: impl Into<String>, device_address: impl Into<String>) -> Self {
        BluetoothObjectUrl {
            protocol: None,
            adapter_address: adapter_address.into(),
            device_address: Some(device_address.into()),
            characteristic_uuid: None,
        }
    }

    /// Builds a characteristic-level URL.
    pub fn characteristic(
        adapter_address: impl Into<String>,
        device_address: impl Into<String>,
        characteristic_uuid: Uuid,
    ) -> Self {
        BluetoothObjectUrl {
            protocol: None,
            adapter_address: adapter_address.into(),
            device_address: Some(device_address.into()),
            characteristic_uuid: Some(characteristic_uuid),
        }
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn adapter_address(&self) -> &str {
        &self.adapter_address
    }

    pub fn device_address(&self) -> Option<&str> {
        self.device_address.as_deref()
    }

    pub fn characteristic_uuid(&self) -> Option<Uuid> {
        self.characteristic_uuid
    }

    pub fn is_adapter(&self) -> bool {
        self.device_address.is_none()
    }

    pub fn is_device(&self) -> bool {
        self.device_address.is_some() && self.characteristic_uuid.is_none()
    }

    pub fn is_characteristic(&self) -> bool {
        self.characteristic_uuid.is_some()
    }

    /// The URL of the adapter this entity lives under.
    pub fn adapter_url(&self) -> BluetoothObjectUrl {
        BluetoothObjectUrl {
            protocol: self.protocol.clone(),
            adapter_address: self.adapter_address.clone(),
            device_address: None,
            characteristic_uuid: None,
        }
    }

    /// The URL of the device this entity lives under, if any.
    pub fn device_url(&self) -> Option<BluetoothObjectUrl> {
        let device_address = self.device_address.clone()?;
        Some(BluetoothObjectUrl {
            protocol: self.protocol.clone(),
            adapter_address: self.adapter_address.clone(),
            device_address: Some(device_address),
            characteristic_uuid: None,
        })
    }

    pub fn characteristic_url(&self) -> &BluetoothObjectUrl {
        self
    }

    /// True iff `self` names an entity strictly below `parent` in the
    /// adapter → device → characteristic hierarchy.
    pub fn is_descendant(&self, parent: &BluetoothObjectUrl) -> bool {
        if self.adapter_address != parent.adapter_address {
            return false;
        }
        match (&parent.device_address, &parent.characteristic_uuid) {
            (None, _) => !self.is_adapter(),
            (Some(parent_device), None) => {
                self.device_address.as_deref() == Some(parent_device.as_str())
                    && self.characteristic_uuid.is_some()
            }
            (Some(_), Some(_)) => false,
        }
    }

    /// Returns a copy of this URL bound to a specific backend protocol.
    pub fn copy_with_protocol(&self, protocol: impl Into<String>) -> BluetoothObjectUrl {
        BluetoothObjectUrl {
            protocol: Some(protocol.into()),
            ..self.clone()
        }
    }
}

impl PartialEq for BluetoothObjectUrl {
    fn eq(&self, other: &Self) -> bool {
        let protocol_matches = match (&self.protocol, &other.protocol) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        protocol_matches
            && self.adapter_address == other.adapter_address
            && self.device_address == other.device_address
            && self.characteristic_uuid == other.characteristic_uuid
    }
}

impl std::hash::Hash for BluetoothObjectUrl {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Protocol is deliberately excluded so that two URLs which compare
        // equal (see `PartialEq`) hash the same.
        self.adapter_address.hash(state);
        self.device_address.hash(state);
        self.characteristic_uuid.hash(state);
    }
}

impl Display for BluetoothObjectUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(protocol) = &self.protocol {
            write!(f, "{}://", protocol)?;
        }
        write!(f, "{}", self.adapter_address)?;
        if let Some(device_address) = &self.device_address {
            write!(f, "/{}", device_address)?;
            if let Some(uuid) = self.characteristic_uuid {
                write!(f, "/{}", uuid)?;
            }
        }
        Ok(())
    }
}

impl FromStr for BluetoothObjectUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = match s.split_once("://") {
            Some((protocol, rest)) => (Some(protocol.to_owned()), rest),
            None => (None, s),
        };
        let mut segments = rest.split('/');
        let adapter_address = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::UrlParseError(s.to_owned(), "missing adapter address"))?
            .to_owned();
        let device_address = segments.next().map(|s| s.to_owned());
        let characteristic_uuid = segments
            .next()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| Error::UrlParseError(s.to_owned(), "invalid characteristic uuid"))
            })
            .transpose()?;
        if segments.next().is_some() {
            return Err(Error::UrlParseError(s.to_owned(), "too many segments"));
        }
        Ok(BluetoothObjectUrl {
            protocol,
            adapter_address,
            device_address,
            characteristic_uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adapter_only() {
        let url: BluetoothObjectUrl = "hci0".parse().unwrap();
        assert!(url.is_adapter());
        assert_eq!(url.adapter_address(), "hci0");
    }

    #[test]
    fn parses_device_with_protocol() {
        let url: BluetoothObjectUrl = "gatt://hci0/11:22:33:44:55:66".parse().unwrap();
        assert!(url.is_device());
        assert_eq!(url.protocol(), Some("gatt"));
        assert_eq!(url.device_address(), Some("11:22:33:44:55:66"));
    }

    #[test]
    fn equality_ignores_missing_protocol() {
        let a: BluetoothObjectUrl = "hci0/11:22:33:44:55:66".parse().unwrap();
        let b: BluetoothObjectUrl = "gatt://hci0/11:22:33:44:55:66".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn equality_rejects_different_protocol() {
        let a: BluetoothObjectUrl = "gatt://hci0/11:22:33:44:55:66".parse().unwrap();
        let b: BluetoothObjectUrl = "other://hci0/11:22:33:44:55:66".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn device_is_descendant_of_adapter() {
        let adapter = BluetoothObjectUrl::adapter("hci0");
        let device = BluetoothObjectUrl::device("hci0", "11:22:33:44:55:66");
        assert!(device.is_descendant(&adapter));
        assert!(!adapter.is_descendant(&device));
    }

    #[test]
    fn characteristic_is_descendant_of_device_not_sibling_device() {
        let uuid = Uuid::from_u128(1);
        let device = BluetoothObjectUrl::device("hci0", "11:22:33:44:55:66");
        let other_device = BluetoothObjectUrl::device("hci0", "aa:bb:cc:dd:ee:ff");
        let characteristic = BluetoothObjectUrl::characteristic("hci0", "11:22:33:44:55:66", uuid);
        assert!(characteristic.is_descendant(&device));
        assert!(!characteristic.is_descendant(&other_device));
    }

    #[test]
    fn copy_with_protocol_preserves_address() {
        let url = BluetoothObjectUrl::adapter("hci0");
        let bound = url.copy_with_protocol("gatt");
        assert_eq!(bound.protocol(), Some("gatt"));
        assert_eq!(bound, url);
    }

    #[test]
    fn display_roundtrips_through_parse() {
        let url = BluetoothObjectUrl::device("hci0", "11:22:33:44:55:66").copy_with_protocol("gatt");
        let text = url.to_string();
        let parsed: BluetoothObjectUrl = text.parse().unwrap();
        assert_eq!(parsed, url);
    }

    #[test]
    fn too_many_segments_is_rejected() {
        let uuid = Uuid::from_u128(1);
        let text = format!("hci0/11:22:33:44:55:66/{}/extra", uuid);
        assert!(text.parse::<BluetoothObjectUrl>().is_err());
    }
}
