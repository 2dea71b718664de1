#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Event bus used by the overwatcher to publish state changes.
//!
//! Events are plain JSON records tagged with an [`EventKind`]. Publishers are
//! fire-and-forget: a failed publish is reported to the caller but never blocks
//! the component that raised the event.

use std::{
    collections::VecDeque,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::{broadcast, Mutex as AsyncMutex},
};
use uuid::Uuid;

/// Kinds of events raised by the observatory control system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The control loop moved between states.
    StateTransition,
    /// A safety alert became active.
    AlertRaised,
    /// A safety alert returned to nominal.
    AlertCleared,
    /// The enclosure started opening.
    DomeOpening,
    /// The enclosure is open.
    DomeOpen,
    /// The enclosure started closing.
    DomeClosing,
    /// The enclosure is closed.
    DomeClosed,
    /// An emergency shutdown was started.
    EmergencyShutdown,
    /// An operator notification was emitted.
    Notification,
    /// A calibration task started.
    CalibrationStarted,
    /// A calibration task finished (any outcome).
    CalibrationFinished,
    /// A science observation finished.
    ObservationFinished,
    /// The troubleshooter handled a failure.
    TroubleshootingAttempt,
    /// Anything else.
    Uncategorised,
}

impl EventKind {
    /// Dotted label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::StateTransition => "overwatcher.state.transition",
            Self::AlertRaised => "safety.alert.raised",
            Self::AlertCleared => "safety.alert.cleared",
            Self::DomeOpening => "dome.opening",
            Self::DomeOpen => "dome.open",
            Self::DomeClosing => "dome.closing",
            Self::DomeClosed => "dome.closed",
            Self::EmergencyShutdown => "overwatcher.emergency_shutdown",
            Self::Notification => "overwatcher.notification",
            Self::CalibrationStarted => "calibration.started",
            Self::CalibrationFinished => "calibration.finished",
            Self::ObservationFinished => "observer.observation.finished",
            Self::TroubleshootingAttempt => "troubleshooter.attempt",
            Self::Uncategorised => "uncategorised",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Event record encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Component producing the event.
    pub source: String,
    /// Event kind.
    pub kind: EventKind,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns a receiver that yields every event published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>>;
}

/// In-memory broadcast bus. The most recent events stay readable without a
/// subscription, which is what tests and the status console use.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    tx: broadcast::Sender<EventRecord>,
    recent: Arc<Mutex<VecDeque<EventRecord>>>,
    retain: usize,
}

impl MemoryEventBus {
    /// Bus retaining the last `retain` events.
    #[must_use]
    pub fn new(retain: usize) -> Self {
        let retain = retain.max(1);
        Self {
            tx: broadcast::channel(retain).0,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(retain))),
            retain,
        }
    }

    /// Retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Retained events of one kind, oldest first.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<EventRecord> {
        self.recent
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    fn retain_event(&self, event: &EventRecord) {
        let mut recent = self.recent.lock();
        while recent.len() >= self.retain {
            recent.pop_front();
        }
        recent.push_back(event.clone());
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        self.retain_event(&event);
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>> {
        Ok(self.tx.subscribe())
    }
}

/// Durable event log: one JSON object per line, appended to a file that stays
/// open for the life of the publisher.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
    file: Arc<AsyncMutex<File>>,
}

impl FileEventPublisher {
    /// Opens (or creates) the event log at `path`, creating parent
    /// directories as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(AsyncMutex::new(File::from_std(file))),
        })
    }

    /// Location of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dome_closed() -> EventRecord {
        EventRecord::new(
            "dome",
            EventKind::DomeClosed,
            serde_json::json!({ "requestor": "safety" }),
        )
    }

    #[tokio::test]
    async fn publishes_and_receives() {
        let bus = MemoryEventBus::new(16);
        let mut rx = bus.subscribe().await.unwrap();
        bus.publish(dome_closed()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::DomeClosed);
    }

    #[tokio::test]
    async fn backlog_is_bounded() {
        let bus = MemoryEventBus::new(2);
        for _ in 0..5 {
            bus.publish(dome_closed()).await.unwrap();
        }
        assert_eq!(bus.snapshot().len(), 2);
        assert_eq!(bus.of_kind(EventKind::DomeClosed).len(), 2);
        assert!(bus.of_kind(EventKind::DomeOpen).is_empty());
    }

    #[tokio::test]
    async fn file_publisher_appends_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let publisher = FileEventPublisher::new(&path).unwrap();
        publisher.publish(dome_closed()).await.unwrap();
        publisher
            .publish(EventRecord::new(
                "control",
                EventKind::StateTransition,
                serde_json::json!({ "from": "IDLE", "to": "PRE_OBSERVING" }),
            ))
            .await
            .unwrap();

        let kinds: Vec<EventKind> = std::fs::read_to_string(publisher.path())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<EventRecord>(line).unwrap().kind)
            .collect();
        assert_eq!(kinds, [EventKind::DomeClosed, EventKind::StateTransition]);
    }
}
