//! Presence Core - Device, interface and event types
//!
//! This crate provides the data model shared by the presence system:
//! - Devices with their lifecycle status and presence timestamps
//! - Typed network interfaces and the matching rules used for lookups
//! - Domain events published when tracked devices change

pub mod device;
pub mod event;

pub use device::{
    Device, DeviceStatus, Interface, InterfaceType, ParseError, PROPERTY_SUGGESTED_DESCRIPTION,
    PROPERTY_SUGGESTED_IDENTIFIER,
};
pub use event::{DeviceAdded, DeviceEvent, DevicePresenceUpdated, DeviceRemoved, DeviceUpdated};
