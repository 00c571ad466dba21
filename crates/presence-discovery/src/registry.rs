//! Device registry: the single table of known devices and their presence

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use presence_core::{
    Device, DeviceEvent, DeviceStatus, Interface, PROPERTY_SUGGESTED_DESCRIPTION,
    PROPERTY_SUGGESTED_IDENTIFIER,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sink::EventSink;
use crate::tracker::{Detection, Reporter, Tracker};
use crate::watchdog::Watchdog;

const UNIDENTIFIED_DEVICE: &str = "unidentified-device";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid device identifier")]
    InvalidIdentifier,
    #[error("device identifier already taken")]
    IdentifierAlreadyTaken,
    #[error("missing device status")]
    MissingStatus,
    #[error("device not found")]
    NotFound,
    #[error("invalid device action: {0}")]
    InvalidAction(String),
}

/// Timing of the watchdog and presence thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Watchdog tick; ticks alternate between pinging and aging
    pub cycle_secs: u64,
    /// Delay before the first tick
    pub initial_delay_secs: u64,
    /// Tracked devices unseen this long get pinged
    pub missing_after_secs: u64,
    /// Present devices unseen this long become absent
    pub absent_after_secs: u64,
    /// Discovered devices unseen longer than this are deleted
    pub discovered_expiry_secs: u64,
    /// Minimum gap between two "updated" events of a device
    pub update_event_interval_secs: u64,
    /// Capacity of the detection queue
    pub detection_queue_size: usize,
    /// Bound on the wait for tasks at shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cycle_secs: 30,
            initial_delay_secs: 5,
            missing_after_secs: 5 * 60,
            absent_after_secs: 10 * 60,
            discovered_expiry_secs: 60 * 60,
            update_event_interval_secs: 60,
            detection_queue_size: 64,
            shutdown_timeout_secs: 30,
        }
    }
}

fn delta(secs: u64) -> TimeDelta {
    TimeDelta::from_std(Duration::from_secs(secs)).unwrap_or(TimeDelta::MAX)
}

impl PresenceConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn missing_after(&self) -> TimeDelta {
        delta(self.missing_after_secs)
    }

    pub fn absent_after(&self) -> TimeDelta {
        delta(self.absent_after_secs)
    }

    pub fn discovered_expiry(&self) -> TimeDelta {
        delta(self.discovered_expiry_secs)
    }

    pub fn update_event_interval(&self) -> TimeDelta {
        delta(self.update_event_interval_secs)
    }
}

/// Action requested on a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// Ping the device through every tracker
    Contact,
    Ignore,
    Track,
}

impl FromStr for DeviceAction {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(Self::Contact),
            "ignore" => Ok(Self::Ignore),
            "track" => Ok(Self::Track),
            _ => Err(RegistryError::InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Contact => "contact",
            Self::Ignore => "ignore",
            Self::Track => "track",
        })
    }
}

#[derive(Default)]
struct DeviceTable {
    devices: HashMap<String, Device>,
    /// Time of the last "updated" event, per device
    update_events: HashMap<String, DateTime<Utc>>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Registry of all known devices.
///
/// Every operation locks the whole table, shared for reads and exclusive
/// for mutations. Events are published while the lock is held so that
/// their order matches the order of mutations.
pub struct Registry {
    table: RwLock<DeviceTable>,
    sink: Arc<dyn EventSink>,
    config: PresenceConfig,
    watchdog: Arc<Watchdog>,
    running: Mutex<Option<Running>>,
}

impl Registry {
    /// Build a registry holding the initial devices and driving `trackers`
    pub fn new(
        devices: Vec<Device>,
        trackers: Vec<(String, Arc<dyn Tracker>)>,
        sink: Arc<dyn EventSink>,
        config: PresenceConfig,
    ) -> Arc<Self> {
        let mut table = DeviceTable::default();
        for mut device in devices {
            let id = device.identifier.trim().to_string();
            if id.is_empty() {
                warn!(description = %device.description, "Skipping device without identifier");
                continue;
            }
            if table.devices.contains_key(&id) {
                warn!(device = %id, "Skipping duplicate device");
                continue;
            }
            if device.status == DeviceStatus::Undefined {
                warn!(device = %id, "Skipping device without status");
                continue;
            }
            device.identifier = id.clone();
            device.interfaces = device.interfaces.iter().map(Interface::sanitized).collect();
            if device.present && device.last_seen_at.is_none() {
                device.present = false;
            }
            table.devices.insert(id, device);
        }

        Arc::new(Self {
            table: RwLock::new(table),
            sink,
            watchdog: Arc::new(Watchdog::new(trackers, config.clone())),
            config,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Add a new device, absent until a tracker reports it
    pub async fn add_device(&self, mut device: Device) -> Result<(), RegistryError> {
        let mut table = self.table.write().await;

        device.identifier = device.identifier.trim().to_string();
        if device.identifier.is_empty() {
            return Err(RegistryError::InvalidIdentifier);
        }
        if table.devices.contains_key(&device.identifier) {
            return Err(RegistryError::IdentifierAlreadyTaken);
        }
        if device.status == DeviceStatus::Undefined {
            return Err(RegistryError::MissingStatus);
        }

        let now = Utc::now();
        device.created_at = now;
        device.updated_at = now;
        device.reset_presence();
        device.interfaces = device.interfaces.iter().map(Interface::sanitized).collect();

        self.on_added(&device);
        info!(device = %device.identifier, status = %device.status, "Device added");
        table.devices.insert(device.identifier.clone(), device);
        Ok(())
    }

    pub async fn find_device(&self, id: &str) -> Result<Device, RegistryError> {
        let table = self.table.read().await;
        table.devices.get(id).cloned().ok_or(RegistryError::NotFound)
    }

    /// Devices with the given status, or all of them for `Undefined`.
    /// Sorted by identifier.
    pub async fn get_devices(&self, status: DeviceStatus) -> Vec<Device> {
        let table = self.table.read().await;
        let mut devices: Vec<Device> = table
            .devices
            .values()
            .filter(|d| status == DeviceStatus::Undefined || d.status == status)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        devices
    }

    /// First device owning an interface matching `interface`.
    /// Ambiguous queries resolve to an unspecified device.
    pub async fn lookup_device(&self, interface: &Interface) -> Option<Device> {
        let query = interface.sanitized();
        let table = self.table.read().await;
        table.devices.values().find(|d| d.has_interface(&query)).cloned()
    }

    pub async fn remove_device(&self, id: &str) -> Result<(), RegistryError> {
        let mut table = self.table.write().await;
        let device = table.devices.remove(id).ok_or(RegistryError::NotFound)?;
        table.update_events.remove(id);
        self.on_removed(&device);
        info!(device = %id, "Device removed");
        Ok(())
    }

    /// Replace description, interfaces, properties and status of a device.
    /// Identifier, creation time and presence are kept.
    pub async fn update_device(&self, id: &str, patch: Device) -> Result<Device, RegistryError> {
        let mut table = self.table.write().await;
        let DeviceTable {
            devices,
            update_events,
        } = &mut *table;

        let device = devices.get_mut(id).ok_or(RegistryError::NotFound)?;
        if patch.identifier != id {
            return Err(RegistryError::InvalidIdentifier);
        }
        if patch.status == DeviceStatus::Undefined {
            return Err(RegistryError::MissingStatus);
        }

        let now = Utc::now();
        let previous_status = device.status;
        device.description = patch.description;
        device.interfaces = patch.interfaces.iter().map(Interface::sanitized).collect();
        device.properties = patch.properties;
        device.status = patch.status;
        device.updated_at = now;
        self.on_updated(update_events, device, previous_status, now);
        debug!(device = %id, status = %device.status, "Device updated");
        Ok(device.clone())
    }

    /// Apply an action to a device
    pub async fn execute_device_action(
        &self,
        id: &str,
        action: DeviceAction,
    ) -> Result<(), RegistryError> {
        match action {
            DeviceAction::Contact => {
                let device = self.find_device(id).await?;
                debug!(device = %id, "Contacting device");
                self.watchdog.ping(std::slice::from_ref(&device)).await;
                Ok(())
            }
            DeviceAction::Ignore => self.set_status(id, DeviceStatus::Ignored).await,
            DeviceAction::Track => self.set_status(id, DeviceStatus::Tracked).await,
        }
    }

    async fn set_status(&self, id: &str, status: DeviceStatus) -> Result<(), RegistryError> {
        let mut table = self.table.write().await;
        let DeviceTable {
            devices,
            update_events,
        } = &mut *table;

        let device = devices.get_mut(id).ok_or(RegistryError::NotFound)?;
        let now = Utc::now();
        let previous_status = device.status;
        device.status = status;
        device.updated_at = now;
        self.on_updated(update_events, device, previous_status, now);
        Ok(())
    }

    /// Record a detection of `interface`, creating a discovered device when
    /// no known device owns it
    pub async fn report_presence(
        &self,
        interface: Interface,
        properties: Option<HashMap<String, String>>,
    ) {
        self.report_presence_at(interface, properties, Utc::now()).await
    }

    pub(crate) async fn report_presence_at(
        &self,
        interface: Interface,
        properties: Option<HashMap<String, String>>,
        now: DateTime<Utc>,
    ) {
        let interface = interface.sanitized();
        if interface.is_anonymous() {
            warn!(interface = %interface, "Ignoring report without address");
            return;
        }

        let mut table = self.table.write().await;
        let DeviceTable {
            devices,
            update_events,
        } = &mut *table;

        let Some(device) = devices.values_mut().find(|d| d.has_interface(&interface)) else {
            let device = new_device(devices, interface, properties, now);
            info!(device = %device.identifier, "Discovered a new device");
            devices.insert(device.identifier.clone(), device);
            return;
        };

        if let Some(properties) = properties {
            device.properties.extend(properties);
        }

        if !device.present {
            device.mark_present(now);
            self.on_presence_updated(device);
        } else {
            device.last_seen_at = Some(now);
            device.updated_at = now;
            let status = device.status;
            self.on_updated(update_events, device, status, now);
        }
    }

    /// Aging sweep: mark stale devices absent, delete expired discovered ones
    pub async fn update_devices_presence(&self, now: DateTime<Utc>) {
        let absent_after = self.config.absent_after();
        let discovered_expiry = self.config.discovered_expiry();

        let mut table = self.table.write().await;
        let mut expired = Vec::new();
        for device in table.devices.values_mut() {
            let expired_discovered = device.status == DeviceStatus::Discovered
                && device.unseen_for(now).map_or(true, |elapsed| elapsed > discovered_expiry);
            if expired_discovered {
                expired.push(device.identifier.clone());
            } else if device.present && device.is_stale(now, absent_after) {
                device.present = false;
                device.updated_at = now;
                self.on_presence_updated(device);
            }
        }

        for id in expired {
            table.devices.remove(&id);
            table.update_events.remove(&id);
            debug!(device = %id, "Discovered device expired");
        }
    }

    /// Start the detection consumer and the watchdog
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Registry already started");
            return;
        }
        info!("Starting: registry");

        let cancel = CancellationToken::new();
        let (reporter, rx) = Reporter::channel(self.config.detection_queue_size);
        let consumer = tokio::spawn(self.clone().consume_detections(rx, cancel.clone()));
        let watchdog =
            tokio::spawn(self.watchdog.clone().run(self.clone(), reporter, cancel.clone()));

        *running = Some(Running {
            cancel,
            tasks: vec![watchdog, consumer],
        });
    }

    /// Signal every task to stop and wait for them, aborting the ones still
    /// running once the shutdown timeout expires
    pub async fn stop(&self) {
        let Some(Running { cancel, tasks }) = self.running.lock().await.take() else {
            return;
        };
        info!("Stopping: registry");
        cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Registry task failed"),
                Err(_) => {
                    warn!("Registry task didn't stop in time, aborting");
                    task.abort();
                }
            }
        }
        info!("Stopped: registry");
    }

    async fn consume_detections(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Detection>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                detection = rx.recv() => match detection {
                    Some(Detection { interface, properties }) => {
                        self.report_presence(interface, properties).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Detection consumer stopped");
    }

    fn publish(&self, event: DeviceEvent) {
        self.sink.publish(&event);
    }

    fn on_added(&self, device: &Device) {
        if device.status == DeviceStatus::Tracked {
            self.publish(DeviceEvent::added(device));
        }
    }

    fn on_removed(&self, device: &Device) {
        if device.status == DeviceStatus::Tracked {
            self.publish(DeviceEvent::removed(device));
        }
    }

    fn on_presence_updated(&self, device: &Device) {
        if device.status != DeviceStatus::Tracked {
            return;
        }
        if device.present {
            info!(device = %device.identifier, "Device '{}' is present", device.description);
        } else {
            info!(device = %device.identifier, "Device '{}' is not present", device.description);
        }
        self.publish(DeviceEvent::presence_updated(device));
    }

    fn on_updated(
        &self,
        update_events: &mut HashMap<String, DateTime<Utc>>,
        device: &Device,
        previous_status: DeviceStatus,
        now: DateTime<Utc>,
    ) {
        match (previous_status, device.status) {
            (DeviceStatus::Discovered | DeviceStatus::Ignored, DeviceStatus::Tracked) => {
                info!(
                    device = %device.identifier,
                    "Device '{}' is now tracked", device.description
                );
                self.publish(DeviceEvent::added(device));
            }
            (DeviceStatus::Tracked, DeviceStatus::Ignored) => {
                info!(
                    device = %device.identifier,
                    "Device '{}' is now ignored", device.description
                );
                self.publish(DeviceEvent::removed(device));
            }
            (DeviceStatus::Tracked, DeviceStatus::Tracked) => {
                let throttled = update_events
                    .get(&device.identifier)
                    .is_some_and(|last| now - *last <= self.config.update_event_interval());
                if !throttled {
                    update_events.insert(device.identifier.clone(), now);
                    self.publish(DeviceEvent::updated(device));
                }
            }
            _ => {}
        }
    }
}

/// Discovered device for an interface no known device owns
fn new_device(
    devices: &HashMap<String, Device>,
    interface: Interface,
    properties: Option<HashMap<String, String>>,
    now: DateTime<Utc>,
) -> Device {
    let properties = properties.unwrap_or_default();
    let suggested = properties
        .get(PROPERTY_SUGGESTED_IDENTIFIER)
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| UNIDENTIFIED_DEVICE.to_string());

    let mut identifier = suggested.clone();
    if devices.contains_key(&identifier) {
        let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        identifier = format!("{}-{}", suggested, stamp);
        let mut n = 1;
        while devices.contains_key(&identifier) {
            n += 1;
            identifier = format!("{}-{}-{}", suggested, stamp, n);
        }
    }

    let description = properties
        .get(PROPERTY_SUGGESTED_DESCRIPTION)
        .cloned()
        .unwrap_or_else(|| format!("Unidentified device seen at {}", now.to_rfc2822()));

    let mut device =
        Device::new(identifier, description, DeviceStatus::Discovered).with_interface(interface);
    device.properties = properties;
    device.created_at = now;
    device.mark_present(now);
    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::InterfaceType;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<DeviceEvent>>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
        }

        fn clear(&self) {
            self.events.lock().unwrap().clear();
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: &DeviceEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    /// Tracker remembering which devices it was asked to ping
    #[derive(Default)]
    struct PingRecorder {
        pings: StdMutex<Vec<Vec<String>>>,
    }

    impl PingRecorder {
        fn pinged(&self) -> Vec<Vec<String>> {
            self.pings.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Tracker for PingRecorder {
        async fn run(&self, _reporter: Reporter, cancel: CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn ping(&self, devices: &[Device]) {
            let ids = devices.iter().map(|d| d.identifier.clone()).collect();
            self.pings.lock().unwrap().push(ids);
        }
    }

    fn registry_with(devices: Vec<Device>) -> (Arc<Registry>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = Registry::new(devices, Vec::new(), sink.clone(), PresenceConfig::default());
        (registry, sink)
    }

    fn phone() -> Device {
        Device::new("phone", "Phone", DeviceStatus::Tracked).with_interface(Interface {
            kind: InterfaceType::Wifi,
            mac_address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ipv4_address: Some(Ipv4Addr::new(192, 168, 1, 20)),
        })
    }

    fn ip(last: u8) -> Interface {
        Interface::with_ipv4(InterfaceType::Unknown, Ipv4Addr::new(192, 168, 1, last))
    }

    #[tokio::test]
    async fn test_add_device_validation() {
        let (registry, sink) = registry_with(Vec::new());

        let err = registry
            .add_device(Device::new("  ", "Nameless", DeviceStatus::Tracked))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::InvalidIdentifier);
        assert!(registry.get_devices(DeviceStatus::Undefined).await.is_empty());

        let err = registry
            .add_device(Device::new("tv", "TV", DeviceStatus::Undefined))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::MissingStatus);

        registry.add_device(Device::new("tv", "TV", DeviceStatus::Ignored)).await.unwrap();
        let err = registry
            .add_device(Device::new("tv", "TV", DeviceStatus::Tracked))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::IdentifierAlreadyTaken);

        // ignored devices are not announced
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_add_device_trims_identifier() {
        let (registry, _) = registry_with(Vec::new());

        registry.add_device(Device::new(" phone ", "Phone", DeviceStatus::Ignored)).await.unwrap();
        let err = registry
            .add_device(Device::new("phone", "Phone", DeviceStatus::Ignored))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::IdentifierAlreadyTaken);

        let devices = registry.get_devices(DeviceStatus::Undefined).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "phone");
        assert!(registry.find_device("phone").await.is_ok());
    }

    #[tokio::test]
    async fn test_add_device_resets_presence() {
        let (registry, sink) = registry_with(Vec::new());
        let mut device = phone();
        device.mark_present(Utc::now());
        registry.add_device(device).await.unwrap();

        let stored = registry.find_device("phone").await.unwrap();
        assert!(!stored.present);
        assert!(stored.first_seen_at.is_none());
        assert!(stored.last_seen_at.is_none());
        assert_eq!(stored.interfaces[0].mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(sink.kinds(), vec!["added"]);
    }

    #[tokio::test]
    async fn test_report_is_idempotent_on_identity() {
        let (registry, _) = registry_with(Vec::new());
        let mut props = HashMap::new();
        props.insert(PROPERTY_SUGGESTED_IDENTIFIER.to_string(), "Printer".to_string());

        registry.report_presence(ip(50), Some(props.clone())).await;
        registry.report_presence(ip(50), Some(props)).await;

        let devices = registry.get_devices(DeviceStatus::Undefined).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "printer");
        assert_eq!(devices[0].status, DeviceStatus::Discovered);
        assert!(devices[0].present);
        assert_eq!(registry.lookup_device(&ip(50)).await.unwrap().identifier, "printer");
    }

    #[tokio::test]
    async fn test_unmatched_report_creates_discovered_device() {
        let (registry, sink) = registry_with(Vec::new());
        registry.add_device(Device::new("bar", "Bar", DeviceStatus::Ignored)).await.unwrap();

        registry.report_presence(ip(77), None).await;

        let devices = registry.get_devices(DeviceStatus::Undefined).await;
        assert_eq!(devices.len(), 2);
        let discovered = registry.get_devices(DeviceStatus::Discovered).await;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].identifier, UNIDENTIFIED_DEVICE);
        assert!(discovered[0].description.starts_with("Unidentified device seen at "));
        assert_eq!(registry.get_devices(DeviceStatus::Ignored).await[0].identifier, "bar");
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_suggested_identifier_collision_gets_suffix() {
        let (registry, _) = registry_with(vec![phone()]);
        let mut props = HashMap::new();
        props.insert(PROPERTY_SUGGESTED_IDENTIFIER.to_string(), "PHONE".to_string());
        props.insert(PROPERTY_SUGGESTED_DESCRIPTION.to_string(), "Second phone".to_string());

        registry.report_presence(ip(99), Some(props)).await;

        let discovered = registry.get_devices(DeviceStatus::Discovered).await;
        assert_eq!(discovered.len(), 1);
        assert!(discovered[0].identifier.starts_with("phone-"));
        assert_eq!(discovered[0].description, "Second phone");
    }

    #[tokio::test]
    async fn test_anonymous_report_is_dropped() {
        let (registry, _) = registry_with(vec![phone()]);
        registry.report_presence(Interface::with_mac(InterfaceType::Wifi, " "), None).await;

        let devices = registry.get_devices(DeviceStatus::Undefined).await;
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].present);
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive_on_mac() {
        let device = Device::new("tag", "Tag", DeviceStatus::Tracked)
            .with_interface(Interface::with_mac(InterfaceType::Ble, "bb:77:33:00:00:00"));
        let (registry, _) = registry_with(vec![device]);

        let query = Interface::with_mac(InterfaceType::Unknown, "BB:77:33:00:00:00");
        assert_eq!(registry.lookup_device(&query).await.unwrap().identifier, "tag");
    }

    #[tokio::test]
    async fn test_report_marks_present_and_merges_properties() {
        let (registry, sink) = registry_with(vec![phone()]);
        let mut props = HashMap::new();
        props.insert("vendor".to_string(), "acme".to_string());

        let query = Interface::with_mac(InterfaceType::Wifi, "aa:bb:cc:dd:ee:ff");
        registry.report_presence(query, Some(props)).await;

        let stored = registry.find_device("phone").await.unwrap();
        assert!(stored.present);
        assert_eq!(stored.first_seen_at, stored.last_seen_at);
        assert_eq!(stored.properties.get("vendor").map(String::as_str), Some("acme"));
        assert_eq!(sink.kinds(), vec!["presenceupdated"]);
    }

    #[tokio::test]
    async fn test_updated_events_are_throttled() {
        let (registry, sink) = registry_with(vec![phone()]);
        let t0 = Utc::now();

        registry.report_presence_at(ip(20), None, t0).await;
        registry.report_presence_at(ip(20), None, t0 + TimeDelta::seconds(10)).await;
        registry.report_presence_at(ip(20), None, t0 + TimeDelta::seconds(40)).await;
        registry.report_presence_at(ip(20), None, t0 + TimeDelta::seconds(71)).await;

        assert_eq!(sink.kinds(), vec!["presenceupdated", "updated", "updated"]);
        let stored = registry.find_device("phone").await.unwrap();
        assert_eq!(stored.last_seen_at, Some(t0 + TimeDelta::seconds(71)));
        assert_eq!(stored.first_seen_at, Some(t0));
    }

    #[tokio::test]
    async fn test_aging_flips_presence_once() {
        let (registry, sink) = registry_with(vec![phone()]);
        let now = Utc::now();
        registry.report_presence_at(ip(20), None, now - TimeDelta::minutes(11)).await;
        sink.clear();

        registry.update_devices_presence(now).await;
        let stored = registry.find_device("phone").await.unwrap();
        assert!(!stored.present);
        assert_eq!(stored.updated_at, now);
        assert_eq!(sink.kinds(), vec!["presenceupdated"]);

        registry.update_devices_presence(now + TimeDelta::seconds(30)).await;
        assert_eq!(sink.kinds().len(), 1);
        assert_eq!(registry.find_device("phone").await.unwrap().updated_at, now);
    }

    #[tokio::test]
    async fn test_aging_expires_discovered_devices() {
        let (registry, _) = registry_with(Vec::new());
        let now = Utc::now();
        registry.report_presence_at(ip(61), None, now - TimeDelta::minutes(61)).await;
        let mut props = HashMap::new();
        props.insert(PROPERTY_SUGGESTED_IDENTIFIER.to_string(), "recent".to_string());
        registry.report_presence_at(ip(5), Some(props), now - TimeDelta::minutes(5)).await;

        registry.update_devices_presence(now).await;

        let devices = registry.get_devices(DeviceStatus::Undefined).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "recent");
        assert!(devices[0].present);

        registry.update_devices_presence(now + TimeDelta::minutes(6)).await;
        let recent = registry.find_device("recent").await.unwrap();
        assert!(!recent.present);
    }

    #[tokio::test]
    async fn test_update_device_rejections_leave_device_unchanged() {
        let (registry, _) = registry_with(vec![phone()]);
        let before = registry.find_device("phone").await.unwrap();

        let mut patch = before.clone();
        patch.identifier = "tablet".to_string();
        patch.description = "Renamed".to_string();
        assert_eq!(
            registry.update_device("phone", patch).await.unwrap_err(),
            RegistryError::InvalidIdentifier
        );

        let mut patch = before.clone();
        patch.status = DeviceStatus::Undefined;
        patch.description = "Renamed".to_string();
        assert_eq!(
            registry.update_device("phone", patch).await.unwrap_err(),
            RegistryError::MissingStatus
        );

        assert_eq!(
            registry.update_device("tablet", before.clone()).await.unwrap_err(),
            RegistryError::NotFound
        );
        assert_eq!(registry.find_device("phone").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_device_status_transitions() {
        let (registry, sink) =
            registry_with(vec![Device::new("tv", "TV", DeviceStatus::Discovered)]);

        let mut patch = registry.find_device("tv").await.unwrap();
        patch.status = DeviceStatus::Tracked;
        patch.description = "Living room TV".to_string();
        let updated = registry.update_device("tv", patch.clone()).await.unwrap();
        assert_eq!(updated.description, "Living room TV");

        patch.status = DeviceStatus::Ignored;
        registry.update_device("tv", patch).await.unwrap();

        assert_eq!(sink.kinds(), vec!["added", "removed"]);
    }

    #[tokio::test]
    async fn test_remove_device() {
        let (registry, sink) =
            registry_with(vec![phone(), Device::new("tv", "TV", DeviceStatus::Ignored)]);

        registry.remove_device("tv").await.unwrap();
        registry.remove_device("phone").await.unwrap();
        assert_eq!(registry.remove_device("phone").await, Err(RegistryError::NotFound));
        assert_eq!(sink.kinds(), vec!["removed"]);
    }

    #[tokio::test]
    async fn test_execute_device_action() {
        let (registry, sink) = registry_with(vec![phone()]);

        registry.execute_device_action("phone", DeviceAction::Ignore).await.unwrap();
        assert_eq!(registry.find_device("phone").await.unwrap().status, DeviceStatus::Ignored);
        registry.execute_device_action("phone", DeviceAction::Track).await.unwrap();
        assert_eq!(sink.kinds(), vec!["removed", "added"]);

        assert_eq!(
            registry.execute_device_action("tablet", DeviceAction::Contact).await,
            Err(RegistryError::NotFound)
        );
        assert_eq!(
            "reboot".parse::<DeviceAction>(),
            Err(RegistryError::InvalidAction("reboot".to_string()))
        );
        assert_eq!("track".parse::<DeviceAction>(), Ok(DeviceAction::Track));
    }

    #[tokio::test]
    async fn test_contact_pings_only_the_requested_device() {
        let tracker = Arc::new(PingRecorder::default());
        let registry = Registry::new(
            vec![phone(), Device::new("tv", "TV", DeviceStatus::Tracked)],
            vec![("recorder".to_string(), tracker.clone() as Arc<dyn Tracker>)],
            Arc::new(RecordingSink::default()),
            PresenceConfig::default(),
        );

        registry.execute_device_action("phone", DeviceAction::Contact).await.unwrap();
        assert_eq!(tracker.pinged(), vec![vec!["phone".to_string()]]);

        assert_eq!(
            registry.execute_device_action("tablet", DeviceAction::Contact).await,
            Err(RegistryError::NotFound)
        );
        assert_eq!(tracker.pinged().len(), 1);
    }

    #[tokio::test]
    async fn test_initial_devices_are_sanitized_and_deduplicated() {
        let mut present_without_timestamp = Device::new("tag", "Tag", DeviceStatus::Tracked);
        present_without_timestamp.present = true;
        let (registry, _) = registry_with(vec![
            phone(),
            Device::new("phone", "Duplicate", DeviceStatus::Ignored),
            Device::new("", "Nameless", DeviceStatus::Ignored),
            Device::new("lamp", "Lamp", DeviceStatus::Undefined),
            present_without_timestamp,
        ]);

        let devices = registry.get_devices(DeviceStatus::Undefined).await;
        let ids: Vec<&str> = devices.iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, vec!["phone", "tag"]);
        assert_eq!(devices[0].description, "Phone");
        assert_eq!(devices[0].interfaces[0].mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(!devices[1].present);
    }

    #[test]
    fn test_presence_config_defaults() {
        let config = PresenceConfig::default();
        assert_eq!(config.missing_after(), TimeDelta::minutes(5));
        assert_eq!(config.absent_after(), TimeDelta::minutes(10));
        assert_eq!(config.discovered_expiry(), TimeDelta::minutes(60));
        assert_eq!(config.cycle(), Duration::from_secs(30));
    }
}
