//! Typed errors returned by overwatcher components.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::{ErrorClass, Requestor};

/// Errors returned by remote device invocations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The device did not reply within the command timeout.
    #[error("{device}: command '{command}' timed out after {after:?}")]
    Timeout {
        /// Device identifier.
        device: String,
        /// Command name.
        command: String,
        /// Timeout that elapsed.
        after: Duration,
    },
    /// The device replied with a failure.
    #[error("{device}: command '{command}' failed: {reason}")]
    Failed {
        /// Device identifier.
        device: String,
        /// Command name.
        command: String,
        /// Reason reported by the device.
        reason: String,
    },
    /// The device could not be reached at all.
    #[error("{device}: device unreachable")]
    Unreachable {
        /// Device identifier.
        device: String,
    },
    /// The reply could not be interpreted.
    #[error("{device}: invalid reply: {reason}")]
    InvalidReply {
        /// Device identifier.
        device: String,
        /// What was wrong with the reply.
        reason: String,
    },
}

impl DeviceError {
    /// Device the error refers to.
    #[must_use]
    pub fn device(&self) -> &str {
        match self {
            Self::Timeout { device, .. }
            | Self::Failed { device, .. }
            | Self::Unreachable { device }
            | Self::InvalidReply { device, .. } => device,
        }
    }

    /// Failure class of the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::Failed { .. } => ErrorClass::Transient,
            Self::Unreachable { .. } | Self::InvalidReply { .. } => ErrorClass::Recoverable,
        }
    }
}

/// Errors returned by the dome controller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomeError {
    /// The enclosure is under local (manual) control.
    #[error("enclosure is in local mode")]
    LocalMode,
    /// Opening was refused because conditions are unsafe.
    #[error("conditions are unsafe; refusing to open")]
    Unsafe,
    /// The command was cancelled by a higher-priority requestor.
    #[error("dome command preempted by {by}")]
    Preempted {
        /// Requestor that took the dome.
        by: Requestor,
    },
    /// Normal and forced closes both failed.
    #[error("dome fault: {reason}")]
    Fault {
        /// Last failure observed.
        reason: String,
    },
    /// Underlying device failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl DomeError {
    /// Failure class of the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Preempted { .. } => ErrorClass::Transient,
            Self::LocalMode | Self::Unsafe => ErrorClass::FatalLocal,
            Self::Fault { .. } => ErrorClass::FatalGlobal,
            Self::Device(err) => err.class(),
        }
    }
}

/// Errors raised while validating or executing a calibration sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequenceError {
    /// The sequence failed validation.
    #[error("invalid calibration sequence: {0}")]
    Invalid(String),
    /// The sequence was cancelled.
    #[error("calibration sequence cancelled")]
    Cancelled,
    /// A device command failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Configuration problems.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The document could not be parsed.
    #[error("cannot parse configuration: {0}")]
    Parse(String),
    /// The document parsed but is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ways an observation can fail inside the observing workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObservationFailure {
    /// An exposure never completed.
    ExposureStuck,
    /// A camera dropped off.
    CameraDisconnected,
    /// Target acquisition did not converge.
    AcquisitionFailed,
    /// Guiding was lost.
    GuiderFailed,
    /// Anything else.
    Other,
}

/// Umbrella error for control-loop operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OverwatcherError {
    /// Device failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Dome failure.
    #[error(transparent)]
    Dome(#[from] DomeError),
    /// Calibration failure.
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The observing workflow failed.
    #[error("observation failed ({kind:?}): {message}")]
    Observation {
        /// Failure kind.
        kind: ObservationFailure,
        /// Details.
        message: String,
    },
    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,
    /// Shutdown could not be confirmed.
    #[error("shutdown unconfirmed: {0}")]
    ShutdownUnconfirmed(String),
    /// A spawned operation panicked or was aborted.
    #[error("{0} ended abnormally")]
    Aborted(String),
}

impl OverwatcherError {
    /// Failure class of the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Device(err) | Self::Sequence(SequenceError::Device(err)) => err.class(),
            Self::Dome(err) => err.class(),
            Self::Sequence(SequenceError::Invalid(_)) | Self::Config(_) | Self::Aborted(_) => {
                ErrorClass::FatalLocal
            }
            Self::Sequence(SequenceError::Cancelled) | Self::Cancelled => ErrorClass::Transient,
            Self::Observation { .. } => ErrorClass::Recoverable,
            Self::ShutdownUnconfirmed(_) => ErrorClass::FatalGlobal,
        }
    }

    /// Whether the error is a cooperative cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Sequence(SequenceError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_device_failure() {
        let timeout = DeviceError::Timeout {
            device: "lvmecp".into(),
            command: "close".into(),
            after: Duration::from_secs(5),
        };
        let failed = DeviceError::Failed {
            device: "lvmecp".into(),
            command: "close".into(),
            reason: "motor".into(),
        };
        assert_ne!(timeout, failed);
        assert_eq!(timeout.device(), "lvmecp");
        assert!(timeout.to_string().contains("timed out"));
    }

    #[test]
    fn dome_fault_is_global() {
        let err = OverwatcherError::from(DomeError::Fault {
            reason: "stuck".into(),
        });
        assert!(err.class().is_global());
        assert!(OverwatcherError::Cancelled.is_cancellation());
    }
}
