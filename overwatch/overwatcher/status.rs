//! Process-wide overwatcher status: one writer, many snapshot readers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{control::state::LoopState, module::NightId, safety::alerts::AlertKind};

/// Subsystems that escalation can disable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Science observing.
    Observing,
    /// Calibration tasks.
    Calibrations,
}

/// Snapshot of the overwatcher status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverwatcherStatus {
    /// Operator enabled autonomous operation.
    pub enabled: bool,
    /// Decisions are logged instead of executed.
    pub dry_run: bool,
    /// Current observing night.
    pub night: Option<NightId>,
    /// No critical alert is active or awaiting acknowledgement.
    pub safe: bool,
    /// No operation is in flight.
    pub idle: bool,
    /// A science observation is running.
    pub observing: bool,
    /// A calibration is running.
    pub calibrating: bool,
    /// Calibrations may be scheduled.
    pub allow_calibrations: bool,
    /// Active alerts, including cleared criticals awaiting acknowledgement.
    pub active_alerts: BTreeSet<AlertKind>,
    /// Control loop state.
    pub state: LoopState,
    /// Subsystems disabled by escalation.
    pub disabled_subsystems: BTreeSet<Subsystem>,
    /// An emergency shutdown could not be confirmed.
    pub shutdown_unresolved: bool,
    /// Time of the last update.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for OverwatcherStatus {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            night: None,
            safe: true,
            idle: true,
            observing: false,
            calibrating: false,
            allow_calibrations: true,
            active_alerts: BTreeSet::new(),
            state: LoopState::Disabled,
            disabled_subsystems: BTreeSet::new(),
            shutdown_unresolved: false,
            updated_at: None,
        }
    }
}

impl OverwatcherStatus {
    /// Whether the status respects its invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let critical = self.active_alerts.iter().any(|kind| kind.is_critical());
        !(self.observing && self.calibrating) && self.safe != critical
    }
}

/// The single writer of [`OverwatcherStatus`].
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<OverwatcherStatus>,
}

impl StatusPublisher {
    /// Creates the publisher and a first reader.
    #[must_use]
    pub fn new(initial: OverwatcherStatus) -> (Self, StatusReader) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, StatusReader { rx })
    }

    /// Applies a mutation and publishes the result.
    pub fn update(&self, mutate: impl FnOnce(&mut OverwatcherStatus)) {
        self.tx.send_modify(|status| {
            mutate(status);
            status.updated_at = Some(Utc::now());
            debug_assert!(status.is_consistent(), "inconsistent status: {status:?}");
        });
    }

    /// Current value.
    #[must_use]
    pub fn current(&self) -> OverwatcherStatus {
        self.tx.borrow().clone()
    }

    /// New reader.
    #[must_use]
    pub fn reader(&self) -> StatusReader {
        StatusReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the status.
#[derive(Debug, Clone)]
pub struct StatusReader {
    rx: watch::Receiver<OverwatcherStatus>,
}

impl StatusReader {
    /// Copy of the latest status. Never blocks the writer for longer than the clone.
    #[must_use]
    pub fn snapshot(&self) -> OverwatcherStatus {
        self.rx.borrow().clone()
    }

    /// Waits for the next update. Returns `false` once the writer is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_see_published_updates() {
        let (publisher, mut reader) = StatusPublisher::new(OverwatcherStatus::default());
        let other = publisher.reader();
        publisher.update(|status| {
            status.enabled = true;
            status.state = LoopState::Idle;
        });
        assert!(reader.changed().await);
        assert!(reader.snapshot().enabled);
        assert_eq!(other.snapshot().state, LoopState::Idle);
    }

    #[test]
    fn safe_tracks_critical_alerts() {
        let mut status = OverwatcherStatus::default();
        status.active_alerts.insert(AlertKind::DoorOpen);
        assert!(status.is_consistent());
        status.active_alerts.insert(AlertKind::Rain);
        assert!(!status.is_consistent());
        status.safe = false;
        assert!(status.is_consistent());
        status.observing = true;
        status.calibrating = true;
        assert!(!status.is_consistent());
    }
}
