//! Destinations for registry events

use presence_core::DeviceEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Receives every event the registry emits.
///
/// Called with the device table locked, so implementations must not
/// block and must swallow their own failures.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DeviceEvent);
}

/// Fallback sink used when event publishing is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &DeviceEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                debug!(event = event.kind(), device = %event.identifier(), %payload, "Event")
            }
            Err(e) => debug!(event = event.kind(), error = %e, "Event not serializable"),
        }
    }
}

/// Fan-out to any number of subscribers. Events published while nobody
/// listens are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<DeviceEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &DeviceEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(event = event.kind(), "No event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{Device, DeviceStatus};

    #[tokio::test]
    async fn test_broadcast_sink_fans_out() {
        let sink = BroadcastSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        let device = Device::new("phone", "Phone", DeviceStatus::Tracked);
        sink.publish(&DeviceEvent::added(&device));

        assert_eq!(first.recv().await.unwrap().identifier(), "phone");
        assert_eq!(second.recv().await.unwrap().kind(), "added");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(8);
        let device = Device::new("phone", "Phone", DeviceStatus::Tracked);
        sink.publish(&DeviceEvent::removed(&device));
        LogSink.publish(&DeviceEvent::removed(&device));
    }
}
