//! Watchdog: runs the trackers and drives the periodic presence work

use chrono::{DateTime, Utc};
use presence_core::{Device, DeviceStatus};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{PresenceConfig, Registry};
use crate::tracker::{Reporter, Tracker};

/// Owns the configured trackers.
///
/// While running, every tick alternates between pinging missing tracked
/// devices and the registry aging sweep, starting with a ping.
pub struct Watchdog {
    trackers: Vec<(String, Arc<dyn Tracker>)>,
    config: PresenceConfig,
}

impl Watchdog {
    pub fn new(trackers: Vec<(String, Arc<dyn Tracker>)>, config: PresenceConfig) -> Self {
        Self { trackers, config }
    }

    pub fn tracker_names(&self) -> Vec<&str> {
        self.trackers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Ask every tracker, one after the other, to ping `devices`
    pub async fn ping(&self, devices: &[Device]) {
        for (name, tracker) in &self.trackers {
            debug!(tracker = %name, count = devices.len(), "Pinging devices");
            tracker.ping(devices).await;
        }
    }

    /// Ping the tracked devices not seen for a while
    pub async fn ping_missing_devices(&self, registry: &Registry, now: DateTime<Utc>) {
        let missing_after = self.config.missing_after();
        let missing: Vec<Device> = registry
            .get_devices(DeviceStatus::Tracked)
            .await
            .into_iter()
            .filter(|d| d.is_stale(now, missing_after))
            .collect();

        if missing.is_empty() {
            debug!("No missing devices to ping");
            return;
        }
        self.ping(&missing).await;
    }

    /// Run the trackers and the tick loop until `cancel` fires, then wait
    /// for the trackers to return
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<Registry>,
        reporter: Reporter,
        cancel: CancellationToken,
    ) {
        info!(trackers = ?self.tracker_names(), "Starting: device watchdog");

        let mut trackers = JoinSet::new();
        for (name, tracker) in &self.trackers {
            let name = name.clone();
            let tracker = tracker.clone();
            let reporter = reporter.clone();
            let token = cancel.child_token();
            trackers.spawn(async move {
                if let Err(e) = tracker.run(reporter, token).await {
                    warn!(tracker = %name, error = %e, "Tracker stopped");
                }
            });
        }
        drop(reporter);

        let start = Instant::now() + self.config.initial_delay();
        let mut ticker = interval_at(start, self.config.cycle());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut need_update = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.tick(&registry, now, need_update) => {}
                    }
                    need_update = !need_update;
                }
            }
        }

        info!("Stopping: trackers...");
        let drained = tokio::time::timeout(self.config.shutdown_timeout(), async {
            while let Some(result) = trackers.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Tracker task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = trackers.len(), "Trackers didn't stop in time, aborting");
            trackers.abort_all();
        }
        info!("Stopped: device watchdog");
    }

    async fn tick(&self, registry: &Registry, now: DateTime<Utc>, need_update: bool) {
        if need_update {
            registry.update_devices_presence(now).await;
        } else {
            self.ping_missing_devices(registry, now).await;
        }
    }
}
