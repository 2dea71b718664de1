//! Failure classification and bounded recovery.
//!
//! Each failure is reduced to a [`FailureSignature`] and counted in a sliding
//! window per signature and device. Within the budget the matching recipe is
//! run; past it the failure is escalated one class up instead of retried.
//! The caller reports a confirmed recovery with [`Troubleshooter::reset`],
//! which empties the window.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::EventKind;
use shared_logging::LogLevel;
use tokio::time::Instant;

use crate::{
    config::{secs, ConfigWatch},
    device::wrappers::Devices,
    errors::{DeviceError, DomeError, ObservationFailure, OverwatcherError, SequenceError},
    module::ErrorClass,
    telemetry::OverwatcherTelemetry,
};

/// Recipe steps and execution.
pub mod recipes;

use recipes::{default_recipes, Recipe, RecipeContext, RecipeOutcome, RecipeStep};

/// Kind of failure, used to pick a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignature {
    /// A device stopped answering.
    DeviceUnreachable,
    /// A command timed out.
    CommandTimeout,
    /// An exposure never completed.
    ExposureStuck,
    /// A camera dropped off.
    CameraDisconnected,
    /// Acquisition did not converge.
    AcquisitionFailed,
    /// Guiding was lost.
    GuiderFailed,
    /// The dome could not be closed.
    DomeFault,
    /// Anything else.
    Uncategorised,
}

impl FailureSignature {
    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceUnreachable => "device_unreachable",
            Self::CommandTimeout => "command_timeout",
            Self::ExposureStuck => "exposure_stuck",
            Self::CameraDisconnected => "camera_disconnected",
            Self::AcquisitionFailed => "acquisition_failed",
            Self::GuiderFailed => "guider_failed",
            Self::DomeFault => "dome_fault",
            Self::Uncategorised => "uncategorised",
        }
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Signature.
    pub signature: FailureSignature,
    /// Device involved, when known.
    pub device: Option<String>,
    /// Error text.
    pub message: String,
    /// Class of the underlying error.
    pub class: ErrorClass,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{} on {device}: {}", self.signature, self.message),
            None => write!(f, "{}: {}", self.signature, self.message),
        }
    }
}

impl Failure {
    /// Classifies an operation error.
    #[must_use]
    pub fn from_error(err: &OverwatcherError) -> Self {
        let (signature, device) = match err {
            OverwatcherError::Device(device_err)
            | OverwatcherError::Dome(DomeError::Device(device_err))
            | OverwatcherError::Sequence(SequenceError::Device(device_err)) => {
                let signature = match device_err {
                    DeviceError::Unreachable { .. } => FailureSignature::DeviceUnreachable,
                    DeviceError::Timeout { .. } => FailureSignature::CommandTimeout,
                    DeviceError::Failed { .. } | DeviceError::InvalidReply { .. } => {
                        FailureSignature::Uncategorised
                    }
                };
                (signature, Some(device_err.device().to_string()))
            }
            OverwatcherError::Dome(DomeError::Fault { .. }) => (FailureSignature::DomeFault, None),
            OverwatcherError::Observation { kind, .. } => {
                let signature = match kind {
                    ObservationFailure::ExposureStuck => FailureSignature::ExposureStuck,
                    ObservationFailure::CameraDisconnected => FailureSignature::CameraDisconnected,
                    ObservationFailure::AcquisitionFailed => FailureSignature::AcquisitionFailed,
                    ObservationFailure::GuiderFailed => FailureSignature::GuiderFailed,
                    ObservationFailure::Other => FailureSignature::Uncategorised,
                };
                (signature, None)
            }
            _ => (FailureSignature::Uncategorised, None),
        };
        Self {
            signature,
            device,
            message: err.to_string(),
            class: err.class(),
        }
    }
}

/// Result of handling one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The recipe ran; the operation may be retried.
    Recovered,
    /// Nothing fixed yet; retry within budget.
    Retrying,
    /// Budget exhausted or unrecoverable; the caller must act on `class`.
    Escalated,
}

/// Record of one troubleshooting attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TroubleshootingAttempt {
    /// Failure signature.
    pub trigger_kind: FailureSignature,
    /// Device involved.
    pub device: Option<String>,
    /// Recipe run, if any.
    pub recipe_name: Option<String>,
    /// Occurrences of this failure within the window, this one included.
    pub attempt_number: u32,
    /// Outcome.
    pub outcome: Outcome,
    /// Class after escalation.
    pub class: ErrorClass,
}

type HistoryKey = (FailureSignature, Option<String>);

/// Maps failures to recipes under a per-signature retry budget.
#[derive(Debug)]
pub struct Troubleshooter {
    devices: Devices,
    config: ConfigWatch,
    telemetry: OverwatcherTelemetry,
    history: Mutex<HashMap<HistoryKey, VecDeque<Instant>>>,
}

impl Troubleshooter {
    /// Creates a troubleshooter.
    #[must_use]
    pub fn new(devices: Devices, config: ConfigWatch, telemetry: OverwatcherTelemetry) -> Self {
        Self {
            devices,
            config,
            telemetry,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Recipe table: built-ins overridden by configuration.
    #[must_use]
    pub fn recipes(&self) -> IndexMap<FailureSignature, Vec<RecipeStep>> {
        let mut recipes: IndexMap<_, _> = default_recipes().into_iter().collect();
        let overrides = self.config.borrow().troubleshooter.recipes.clone();
        recipes.extend(overrides);
        recipes
    }

    fn record(&self, key: HistoryKey) -> u32 {
        let window = secs(self.config.borrow().troubleshooter.window);
        let now = Instant::now();
        let mut history = self.history.lock();
        let occurrences = history.entry(key).or_default();
        while occurrences
            .front()
            .is_some_and(|first| now.duration_since(*first) > window)
        {
            occurrences.pop_front();
        }
        occurrences.push_back(now);
        u32::try_from(occurrences.len()).unwrap_or(u32::MAX)
    }

    /// Occurrences of `signature` on `device` within the window.
    #[must_use]
    pub fn occurrences(&self, signature: FailureSignature, device: Option<&str>) -> usize {
        self.history
            .lock()
            .get(&(signature, device.map(str::to_string)))
            .map_or(0, VecDeque::len)
    }

    /// Forgets earlier occurrences after a confirmed recovery.
    pub fn reset(&self, signature: FailureSignature, device: Option<&str>) {
        self.history
            .lock()
            .remove(&(signature, device.map(str::to_string)));
    }

    /// Forgets every occurrence.
    pub fn reset_all(&self) {
        self.history.lock().clear();
    }

    /// Handles one failure.
    pub async fn handle(&self, failure: &Failure) -> TroubleshootingAttempt {
        let budget = self.config.borrow().troubleshooter.budget;
        let attempt_number = self.record((failure.signature, failure.device.clone()));
        let mut attempt = TroubleshootingAttempt {
            trigger_kind: failure.signature,
            device: failure.device.clone(),
            recipe_name: None,
            attempt_number,
            outcome: Outcome::Escalated,
            class: failure.class,
        };

        if failure.signature == FailureSignature::DomeFault {
            attempt.class = ErrorClass::FatalGlobal;
        } else if attempt_number > budget {
            attempt.class = failure.class.escalate();
        } else if let Some(steps) = self.recipes().get(&failure.signature).cloned() {
            let recipe = Recipe {
                name: failure.signature.as_str().to_string(),
                steps,
            };
            let ctx = RecipeContext {
                devices: &self.devices,
                failure,
            };
            attempt.outcome = match recipe.run(ctx).await {
                RecipeOutcome::Succeeded => Outcome::Recovered,
                RecipeOutcome::Failed { .. } => Outcome::Retrying,
            };
            attempt.recipe_name = Some(recipe.name);
        } else if failure.class == ErrorClass::Transient {
            attempt.outcome = Outcome::Retrying;
        } else if failure.class == ErrorClass::Recoverable {
            attempt.class = ErrorClass::FatalLocal;
        }

        let level = match attempt.outcome {
            Outcome::Escalated => LogLevel::Error,
            Outcome::Retrying | Outcome::Recovered => LogLevel::Warn,
        };
        let payload = json!({
            "trigger_kind": attempt.trigger_kind,
            "device": attempt.device,
            "recipe_name": attempt.recipe_name,
            "attempt_number": attempt.attempt_number,
            "outcome": attempt.outcome,
            "class": attempt.class,
            "message": failure.message,
        });
        let _ = self.telemetry.log(level, "troubleshooter.attempt", payload.clone());
        let _ = self
            .telemetry
            .event(EventKind::TroubleshootingAttempt, payload);
        attempt
    }
}
