//! Presence Discovery - Device registry and presence trackers
//!
//! This crate keeps track of which devices are on the home network:
//! - The registry holding every known device and its presence state
//! - The watchdog pinging missing devices and aging stale ones
//! - ICMP echo probing for IPv4 devices
//! - L2CAP echo probing for Bluetooth classic devices

pub mod bluetooth;
pub mod icmp;
pub mod l2cap;
pub mod registry;
pub mod sink;
pub mod tracker;
pub mod watchdog;

pub use bluetooth::BluetoothTracker;
pub use icmp::{IcmpSettings, IcmpTracker};
pub use l2cap::{BdAddr, EchoSettings, ProbeOutcome};
pub use registry::{DeviceAction, PresenceConfig, Registry, RegistryError};
pub use sink::{BroadcastSink, EventSink, LogSink};
pub use tracker::{
    Detection, QueueClosed, Reporter, Tracker, TrackerError, TrackerFactories, TrackerSettings,
};
pub use watchdog::Watchdog;
