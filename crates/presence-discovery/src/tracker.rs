//! Tracker abstraction, detection queue and the tracker factory table

use async_trait::async_trait;
use presence_core::{Device, Interface};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-tracker settings table, as found under `[trackers.<name>]`
pub type TrackerSettings = toml::Table;

/// Constructor stored in the factory table
pub type TrackerConstructor = fn(&TrackerSettings) -> Result<Arc<dyn Tracker>, TrackerError>;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("no such tracker: {0}")]
    Unknown(String),
    #[error("invalid settings for tracker {name}: {source}")]
    InvalidSettings {
        name: String,
        #[source]
        source: toml::de::Error,
    },
}

/// The detection queue was closed by the registry
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("detection queue closed")]
pub struct QueueClosed;

/// An interface seen by a tracker, with optional metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub interface: Interface,
    pub properties: Option<HashMap<String, String>>,
}

/// Sending half of the bounded detection queue handed to trackers
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Detection>,
}

impl Reporter {
    /// Create a reporter and the receiving end consumed by the registry
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Detection>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a detection, waiting for room when the queue is full
    pub async fn report(
        &self,
        interface: Interface,
        properties: Option<HashMap<String, String>>,
    ) -> Result<(), QueueClosed> {
        self.tx
            .send(Detection { interface, properties })
            .await
            .map_err(|_| QueueClosed)
    }

    /// Same as [`report`](Self::report), for code running outside the runtime
    /// (e.g. inside `spawn_blocking`)
    pub fn blocking_report(
        &self,
        interface: Interface,
        properties: Option<HashMap<String, String>>,
    ) -> Result<(), QueueClosed> {
        self.tx
            .blocking_send(Detection { interface, properties })
            .map_err(|_| QueueClosed)
    }
}

/// A pluggable source of detections over one transport.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Report detections through `reporter` until `cancel` fires.
    ///
    /// An error means the tracker could not run at all (e.g. the socket
    /// could not be opened); it stops this tracker only.
    async fn run(&self, reporter: Reporter, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Best effort attempt to make the given missing devices show up.
    /// Replies, if any, come back through the reporter given to `run`.
    async fn ping(&self, devices: &[Device]);
}

/// Name to constructor table used to instantiate configured trackers
#[derive(Clone, Default)]
pub struct TrackerFactories {
    constructors: HashMap<&'static str, TrackerConstructor>,
}

impl TrackerFactories {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every tracker shipped in this crate
    pub fn builtin() -> Self {
        Self::new()
            .with(crate::icmp::TRACKER_NAME, crate::icmp::IcmpTracker::from_settings)
            .with(
                crate::bluetooth::TRACKER_NAME,
                crate::bluetooth::BluetoothTracker::from_settings,
            )
    }

    pub fn with(mut self, name: &'static str, constructor: TrackerConstructor) -> Self {
        self.constructors.insert(name, constructor);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Instantiate every configured tracker, in name order
    pub fn build(
        &self,
        configured: &BTreeMap<String, TrackerSettings>,
    ) -> Result<Vec<(String, Arc<dyn Tracker>)>, TrackerError> {
        configured
            .iter()
            .map(|(name, settings)| {
                let constructor = self
                    .constructors
                    .get(name.as_str())
                    .ok_or_else(|| TrackerError::Unknown(name.clone()))?;
                Ok((name.clone(), constructor(settings)?))
            })
            .collect()
    }
}

/// Deserialize a settings table into a typed settings struct
pub(crate) fn parse_settings<T>(name: &str, settings: &TrackerSettings) -> Result<T, TrackerError>
where
    T: serde::de::DeserializeOwned,
{
    toml::Value::Table(settings.clone())
        .try_into()
        .map_err(|source| TrackerError::InvalidSettings {
            name: name.to_string(),
            source,
        })
}
