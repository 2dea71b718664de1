//! Seams to the observing stack: target selection and the per-target
//! workflow. The overwatcher only schedules and supervises them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{errors::OverwatcherError, module::CancelToken};

/// A science target handed out by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Scheduler identifier.
    pub name: String,
    /// Right ascension in degrees.
    #[serde(default)]
    pub ra: f64,
    /// Declination in degrees.
    #[serde(default)]
    pub dec: f64,
    /// Exposure time in seconds.
    pub exposure_time: f64,
}

impl Target {
    /// Target with zero coordinates.
    #[must_use]
    pub fn named(name: impl Into<String>, exposure_time: f64) -> Self {
        Self {
            name: name.into(),
            ra: 0.0,
            dec: 0.0,
            exposure_time,
        }
    }
}

/// Result of a completed observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationOutcome {
    /// Observed target.
    pub target: Target,
    /// Exposures taken.
    pub exposures: u32,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

/// Picks the next target to observe.
#[async_trait]
pub trait TargetSelector: Send + Sync + std::fmt::Debug {
    /// Next target, or `None` when nothing is observable.
    async fn next_target(&self) -> Option<Target>;
}

/// Observes a single target.
///
/// Implementations must poll `cancel` and, once it fires, stop guiding,
/// abort exposures and return [`OverwatcherError::Cancelled`].
#[async_trait]
pub trait ObservingWorkflow: Send + Sync + std::fmt::Debug {
    /// Runs acquisition, guiding and exposure for `target`.
    async fn observe(
        &self,
        target: Target,
        cancel: CancelToken,
    ) -> Result<ObservationOutcome, OverwatcherError>;
}
