//! Bluetooth classic tracker
//!
//! There is no passive scanning: `run` only keeps the detection queue
//! around until cancellation. `ping` probes each Bluetooth interface of
//! the missing devices with L2CAP echo requests and reports the first one
//! that answers.

use async_trait::async_trait;
use presence_core::{Device, Interface, InterfaceType};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::l2cap::{self, BdAddr, EchoSettings};
use crate::tracker::{parse_settings, Reporter, Tracker, TrackerError, TrackerSettings};

pub const TRACKER_NAME: &str = "bluetooth";

pub struct BluetoothTracker {
    settings: EchoSettings,
    reporter: Mutex<Option<Reporter>>,
    /// Held for a whole ping batch
    ping_lock: Mutex<()>,
}

impl BluetoothTracker {
    pub fn new(settings: EchoSettings) -> Self {
        Self {
            settings,
            reporter: Mutex::new(None),
            ping_lock: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &TrackerSettings) -> Result<Arc<dyn Tracker>, TrackerError> {
        let settings = parse_settings(TRACKER_NAME, settings)?;
        Ok(Arc::new(Self::new(settings)))
    }

    pub fn settings(&self) -> &EchoSettings {
        &self.settings
    }
}

/// Bluetooth addresses worth probing, grouped per device
fn probe_targets(device: &Device) -> Vec<(String, BdAddr)> {
    device
        .interfaces
        .iter()
        .filter(|itf| itf.kind == InterfaceType::Bluetooth)
        .filter_map(|itf| itf.mac_address.as_deref())
        .filter_map(|mac| match mac.parse::<BdAddr>() {
            Ok(addr) => Some((mac.to_string(), addr)),
            Err(e) => {
                debug!(device = %device.identifier, error = %e, "Skipping interface");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Tracker for BluetoothTracker {
    async fn run(&self, reporter: Reporter, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Starting: bluetooth tracker");
        *self.reporter.lock().await = Some(reporter);
        cancel.cancelled().await;
        *self.reporter.lock().await = None;
        info!("Stopped: bluetooth tracker");
        Ok(())
    }

    async fn ping(&self, devices: &[Device]) {
        // one connection per address at a time
        let _batch = self.ping_lock.lock().await;
        let Some(reporter) = self.reporter.lock().await.clone() else {
            warn!("bluetooth tracker is not running, ping skipped");
            return;
        };

        for device in devices {
            for (mac, addr) in probe_targets(device) {
                let settings = self.settings.clone();
                let task = tokio::task::spawn_blocking(move || l2cap::probe(addr, &settings));
                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(device = %device.identifier, error = %e, "L2CAP probe task failed");
                        continue;
                    }
                };
                debug!(device = %device.identifier, mac = %mac, ?outcome, "L2CAP probe done");
                if outcome.is_reachable() {
                    let itf = Interface::with_mac(InterfaceType::Bluetooth, mac);
                    if reporter.report(itf, None).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
