//! Recovery recipes: short sequences of device operations.

use serde::{Deserialize, Serialize};

use super::{Failure, FailureSignature};
use crate::{device::wrappers::Devices, errors::DeviceError};

/// One recovery action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecipeStep {
    /// Power-cycles an outlet of the power switch.
    PowerCycle {
        /// Outlet name.
        outlet: String,
    },
    /// Reconnects a device; defaults to the failing device.
    Reconnect {
        /// Device to reconnect.
        #[serde(default)]
        device: Option<String>,
    },
    /// Resets a device; defaults to the failing device.
    Reset {
        /// Device to reset.
        #[serde(default)]
        device: Option<String>,
    },
    /// Aborts exposures in progress.
    AbortExposures,
    /// Resets the spectrograph controllers.
    ResetSpectrographs,
    /// Reconnects the spectrograph controllers.
    ReconnectSpectrographs,
    /// Stops every guider.
    StopGuider,
    /// Reconnects every guider.
    ReconnectGuider,
    /// Pings a device; defaults to the failing device.
    Ping {
        /// Device to ping.
        #[serde(default)]
        device: Option<String>,
    },
}

impl RecipeStep {
    async fn run(&self, devices: &Devices, failure: &Failure) -> Result<(), DeviceError> {
        let target = |device: &Option<String>| {
            device
                .clone()
                .or_else(|| failure.device.clone())
                .ok_or_else(|| DeviceError::InvalidReply {
                    device: "troubleshooter".into(),
                    reason: format!("no device to target for {failure}"),
                })
        };
        match self {
            Self::PowerCycle { outlet } => devices.power.cycle(outlet).await,
            Self::Reconnect { device } => devices.client.reconnect(&target(device)?).await,
            Self::Reset { device } => devices.client.reset(&target(device)?).await,
            Self::Ping { device } => devices.client.ping(&target(device)?).await,
            Self::AbortExposures => devices.spectrographs.abort().await,
            Self::ResetSpectrographs => devices.spectrographs.reset().await,
            Self::ReconnectSpectrographs => {
                devices.client.reconnect(devices.spectrographs.id()).await
            }
            Self::StopGuider => devices.guiders.stop_all().await,
            Self::ReconnectGuider => devices.guiders.reconnect_all().await,
        }
    }
}

/// Result of running a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeOutcome {
    /// Every step succeeded.
    Succeeded,
    /// A step failed; later steps were not run.
    Failed {
        /// Index of the failing step.
        step: usize,
        /// Error text.
        error: String,
    },
}

/// Devices and failure a recipe acts on.
#[derive(Debug, Clone, Copy)]
pub struct RecipeContext<'a> {
    /// Device wrappers.
    pub devices: &'a Devices,
    /// Failure being handled.
    pub failure: &'a Failure,
}

/// A named recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    /// Recipe name.
    pub name: String,
    /// Steps, run in order.
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    /// Runs the steps in order, stopping at the first failure.
    pub async fn run(&self, ctx: RecipeContext<'_>) -> RecipeOutcome {
        for (index, step) in self.steps.iter().enumerate() {
            if let Err(err) = step.run(ctx.devices, ctx.failure).await {
                tracing::warn!(
                    recipe = %self.name,
                    step = ?step,
                    error = %err,
                    "recovery step failed"
                );
                return RecipeOutcome::Failed {
                    step: index,
                    error: err.to_string(),
                };
            }
        }
        RecipeOutcome::Succeeded
    }
}

/// Built-in recipes. Dome faults and uncategorised failures have none.
#[must_use]
pub fn default_recipes() -> Vec<(FailureSignature, Vec<RecipeStep>)> {
    let failing = || None;
    vec![
        (
            FailureSignature::DeviceUnreachable,
            vec![
                RecipeStep::Reconnect { device: failing() },
                RecipeStep::Ping { device: failing() },
            ],
        ),
        (
            FailureSignature::CommandTimeout,
            vec![
                RecipeStep::Reset { device: failing() },
                RecipeStep::Ping { device: failing() },
            ],
        ),
        (
            FailureSignature::ExposureStuck,
            vec![RecipeStep::AbortExposures, RecipeStep::ResetSpectrographs],
        ),
        (
            FailureSignature::CameraDisconnected,
            vec![
                RecipeStep::PowerCycle {
                    outlet: "cameras".into(),
                },
                RecipeStep::ReconnectSpectrographs,
            ],
        ),
        (
            FailureSignature::AcquisitionFailed,
            vec![RecipeStep::StopGuider, RecipeStep::ReconnectGuider],
        ),
        (
            FailureSignature::GuiderFailed,
            vec![RecipeStep::StopGuider, RecipeStep::ReconnectGuider],
        ),
    ]
}
