//! Domain events published when the presence state of a device changes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::Device;

/// Event published by the registry
///
/// Serializes as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum DeviceEvent {
    /// A device became tracked
    Added(DeviceAdded),
    /// A tracked device appeared or disappeared
    PresenceUpdated(DevicePresenceUpdated),
    /// A tracked device changed
    Updated(DeviceUpdated),
    /// A device is no longer tracked
    Removed(DeviceRemoved),
}

impl DeviceEvent {
    pub fn added(device: &Device) -> Self {
        Self::Added(DeviceAdded {
            identifier: device.identifier.clone(),
            description: device.description.clone(),
            present: device.present,
            properties: device.properties.clone(),
            last_seen_at: device.last_seen_at,
        })
    }

    pub fn presence_updated(device: &Device) -> Self {
        Self::PresenceUpdated(DevicePresenceUpdated {
            identifier: device.identifier.clone(),
            present: device.present,
            last_seen_at: device.last_seen_at,
        })
    }

    pub fn updated(device: &Device) -> Self {
        Self::Updated(DeviceUpdated {
            identifier: device.identifier.clone(),
            description: device.description.clone(),
            present: device.present,
            properties: device.properties.clone(),
            last_seen_at: device.last_seen_at,
        })
    }

    pub fn removed(device: &Device) -> Self {
        Self::Removed(DeviceRemoved {
            identifier: device.identifier.clone(),
        })
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::PresenceUpdated(_) => "presenceupdated",
            Self::Updated(_) => "updated",
            Self::Removed(_) => "removed",
        }
    }

    /// Identifier of the device the event is about
    pub fn identifier(&self) -> &str {
        match self {
            Self::Added(e) => &e.identifier,
            Self::PresenceUpdated(e) => &e.identifier,
            Self::Updated(e) => &e.identifier,
            Self::Removed(e) => &e.identifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAdded {
    pub identifier: String,
    pub description: String,
    pub present: bool,
    pub properties: HashMap<String, String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePresenceUpdated {
    pub identifier: String,
    pub present: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdated {
    pub identifier: String,
    pub description: String,
    pub present: bool,
    pub properties: HashMap<String, String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRemoved {
    pub identifier: String,
}
