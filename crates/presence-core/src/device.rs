//! Device and interface types for tracking physical devices on the home network

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Property key a tracker may set to suggest an identifier for a new device
pub const PROPERTY_SUGGESTED_IDENTIFIER: &str = "suggested_identifier";

/// Property key a tracker may set to suggest a description for a new device
pub const PROPERTY_SUGGESTED_DESCRIPTION: &str = "suggested_description";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid device status: {0}")]
    InvalidStatus(String),
    #[error("invalid interface type: {0}")]
    InvalidInterfaceType(String),
}

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// No status set. As a filter it selects every device.
    #[default]
    Undefined,
    /// Found by a tracker and not confirmed yet
    Discovered,
    /// Known but deliberately not watched
    Ignored,
    /// Watched: presence changes are published and the device is actively probed
    Tracked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Discovered => "discovered",
            Self::Ignored => "ignored",
            Self::Tracked => "tracked",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "undefined" => Ok(Self::Undefined),
            "discovered" => Ok(Self::Discovered),
            "ignored" => Ok(Self::Ignored),
            "tracked" => Ok(Self::Tracked),
            _ => Err(ParseError::InvalidStatus(s.to_string())),
        }
    }
}

/// Kind of network interface a device can be observed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// Matches any interface type when used in a lookup
    #[default]
    Unknown,
    Ethernet,
    Wifi,
    Bluetooth,
    Ble,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ethernet => "ethernet",
            Self::Wifi => "wifi",
            Self::Bluetooth => "bluetooth",
            Self::Ble => "ble",
        }
    }

    /// Whether devices on this interface answer IPv4 probes
    pub fn is_ip(&self) -> bool {
        matches!(self, Self::Ethernet | Self::Wifi)
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterfaceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "ethernet" => Ok(Self::Ethernet),
            "wifi" => Ok(Self::Wifi),
            "bluetooth" => Ok(Self::Bluetooth),
            "ble" => Ok(Self::Ble),
            _ => Err(ParseError::InvalidInterfaceType(s.to_string())),
        }
    }
}

/// A network identity through which a device may be detected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(rename = "type", default)]
    pub kind: InterfaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<Ipv4Addr>,
}

impl Interface {
    /// Interface identified by its hardware address
    pub fn with_mac(kind: InterfaceType, mac: impl Into<String>) -> Self {
        Self {
            kind,
            mac_address: Some(mac.into()),
            ipv4_address: None,
        }
    }

    /// Interface identified by its IPv4 address
    pub fn with_ipv4(kind: InterfaceType, ip: Ipv4Addr) -> Self {
        Self {
            kind,
            mac_address: None,
            ipv4_address: Some(ip),
        }
    }

    /// Normalized copy: MAC lower-cased and trimmed, empty MAC dropped
    pub fn sanitized(&self) -> Self {
        let mac_address = self
            .mac_address
            .as_deref()
            .map(|mac| mac.trim().to_lowercase())
            .filter(|mac| !mac.is_empty());
        Self {
            kind: self.kind,
            mac_address,
            ipv4_address: self.ipv4_address,
        }
    }

    /// True when neither a MAC nor an IPv4 address is known
    pub fn is_anonymous(&self) -> bool {
        self.mac_address.is_none() && self.ipv4_address.is_none()
    }

    /// Check whether `stored` satisfies this interface used as a query.
    ///
    /// Only the fields this query knows are compared: an `Unknown` type
    /// matches any type, a missing MAC or IPv4 address matches anything.
    pub fn matches(&self, stored: &Interface) -> bool {
        if self.kind != InterfaceType::Unknown && self.kind != stored.kind {
            return false;
        }
        if let Some(mac) = &self.mac_address {
            match &stored.mac_address {
                Some(other) if other.eq_ignore_ascii_case(mac) => {}
                _ => return false,
            }
        }
        if let Some(ip) = self.ipv4_address {
            if stored.ipv4_address != Some(ip) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(mac) = &self.mac_address {
            write!(f, " {}", mac)?;
        }
        if let Some(ip) = &self.ipv4_address {
            write!(f, " {}", ip)?;
        }
        Ok(())
    }
}

/// A physical device tracked by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique key, immutable once assigned
    pub identifier: String,
    /// Human-readable label
    #[serde(default)]
    pub description: String,
    /// Network identities the device can be observed through
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub status: DeviceStatus,
    /// Current presence flag
    #[serde(default)]
    pub present: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Start of the current presence streak
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<DateTime<Utc>>,
    /// Most recent detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last mutation time
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata, mostly suggested by trackers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl Device {
    /// Create an absent device with no interfaces
    pub fn new(
        identifier: impl Into<String>,
        description: impl Into<String>,
        status: DeviceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            identifier: identifier.into(),
            description: description.into(),
            interfaces: Vec::new(),
            status,
            present: false,
            created_at: now,
            first_seen_at: None,
            last_seen_at: None,
            updated_at: now,
            properties: HashMap::new(),
        }
    }

    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Time elapsed since the last detection, `None` if never seen
    pub fn unseen_for(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.last_seen_at.map(|seen| now - seen)
    }

    /// Whether the device has not been seen for at least `threshold`.
    /// A device that was never seen is always stale.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        self.unseen_for(now).map_or(true, |elapsed| elapsed >= threshold)
    }

    /// Whether any interface of this device satisfies `query`
    pub fn has_interface(&self, query: &Interface) -> bool {
        self.interfaces.iter().any(|itf| query.matches(itf))
    }

    /// Mark present at `now`, starting a new presence streak
    pub fn mark_present(&mut self, now: DateTime<Utc>) {
        self.present = true;
        self.first_seen_at = Some(now);
        self.last_seen_at = Some(now);
        self.updated_at = now;
    }

    /// Forget any presence state
    pub fn reset_presence(&mut self) {
        self.present = false;
        self.first_seen_at = None;
        self.last_seen_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!("tracked".parse::<DeviceStatus>().unwrap(), DeviceStatus::Tracked);
        assert_eq!("Ignored".parse::<DeviceStatus>().unwrap(), DeviceStatus::Ignored);
        assert!("bogus".parse::<DeviceStatus>().is_err());
        assert_eq!(DeviceStatus::Discovered.to_string(), "discovered");
    }

    #[test]
    fn test_sanitized_lowercases_mac() {
        let itf = Interface::with_mac(InterfaceType::Ble, "BB:77:33:00:00:00").sanitized();
        assert_eq!(itf.mac_address.as_deref(), Some("bb:77:33:00:00:00"));

        let empty = Interface::with_mac(InterfaceType::Wifi, "  ").sanitized();
        assert!(empty.mac_address.is_none());
        assert!(empty.is_anonymous());
    }

    #[test]
    fn test_matches_compares_known_fields_only() {
        let stored = Interface {
            kind: InterfaceType::Wifi,
            mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ipv4_address: Some(Ipv4Addr::new(192, 168, 1, 20)),
        };

        let by_ip = Interface::with_ipv4(InterfaceType::Unknown, Ipv4Addr::new(192, 168, 1, 20));
        assert!(by_ip.matches(&stored));

        let by_mac = Interface::with_mac(InterfaceType::Wifi, "AA:BB:CC:DD:EE:FF");
        assert!(by_mac.matches(&stored));

        let wrong_type =
            Interface::with_ipv4(InterfaceType::Ethernet, Ipv4Addr::new(192, 168, 1, 20));
        assert!(!wrong_type.matches(&stored));

        let wrong_ip = Interface::with_ipv4(InterfaceType::Wifi, Ipv4Addr::new(192, 168, 1, 21));
        assert!(!wrong_ip.matches(&stored));
    }

    #[test]
    fn test_never_seen_device_is_stale() {
        let device = Device::new("phone", "Phone", DeviceStatus::Tracked);
        assert!(device.is_stale(Utc::now(), TimeDelta::minutes(5)));
    }

    #[test]
    fn test_device_deserialize_defaults() {
        let json = r#"{
            "identifier": "phone",
            "interfaces": [{"type": "wifi", "ipv4_address": "10.0.0.2"}],
            "status": "tracked"
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.status, DeviceStatus::Tracked);
        assert!(!device.present);
        assert!(device.last_seen_at.is_none());
        assert_eq!(device.interfaces[0].ipv4_address, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
