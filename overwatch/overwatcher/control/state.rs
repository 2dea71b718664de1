//! Control loop states and their legal transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Not allowed to act; waits for an operator.
    #[default]
    Disabled,
    /// Enabled and safe, nothing scheduled right now.
    Idle,
    /// Preparing for the night: bias, dome.
    PreObserving,
    /// Running observations.
    Observing,
    /// Running a calibration task.
    Calibrating,
    /// Running a recovery recipe.
    Troubleshooting,
    /// Securing the observatory.
    EmergencyShutdown,
}

impl LoopState {
    /// Whether the loop may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use LoopState::{
            Calibrating, Disabled, EmergencyShutdown, Idle, Observing, PreObserving,
            Troubleshooting,
        };
        if self as u8 == next as u8 {
            return true;
        }
        match (self, next) {
            (_, EmergencyShutdown) => true,
            (EmergencyShutdown, next) => matches!(next, Idle | Disabled),
            (Disabled, next) => matches!(next, Idle),
            (Idle, next) => matches!(next, PreObserving | Calibrating | Troubleshooting | Disabled),
            (PreObserving, next) => matches!(next, Observing | Troubleshooting | Idle | Disabled),
            (Observing, next) => matches!(next, Calibrating | Idle | Troubleshooting | Disabled),
            (Calibrating, next) => matches!(next, Observing | Idle | Troubleshooting | Disabled),
            (Troubleshooting, next) => matches!(next, Idle | Disabled),
        }
    }

    /// Whether observations or calibrations may be running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::PreObserving | Self::Observing | Self::Calibrating | Self::Troubleshooting
        )
    }

    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Idle => "idle",
            Self::PreObserving => "pre_observing",
            Self::Observing => "observing",
            Self::Calibrating => "calibrating",
            Self::Troubleshooting => "troubleshooting",
            Self::EmergencyShutdown => "emergency_shutdown",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LoopState::{
        Calibrating, Disabled, EmergencyShutdown, Idle, Observing, PreObserving, Troubleshooting,
    };

    #[test]
    fn emergency_is_reachable_from_everywhere_else() {
        for state in [Disabled, Idle, PreObserving, Observing, Calibrating, Troubleshooting] {
            assert!(state.can_transition_to(EmergencyShutdown), "{state}");
        }
    }

    #[test]
    fn emergency_only_resolves_to_idle_or_disabled() {
        assert!(EmergencyShutdown.can_transition_to(Idle));
        assert!(EmergencyShutdown.can_transition_to(Disabled));
        assert!(!EmergencyShutdown.can_transition_to(Observing));
        assert!(!EmergencyShutdown.can_transition_to(Calibrating));
    }

    #[test]
    fn disabled_must_pass_through_idle() {
        assert!(!Disabled.can_transition_to(Observing));
        assert!(!Disabled.can_transition_to(PreObserving));
        assert!(Disabled.can_transition_to(Idle));
        assert!(Idle.can_transition_to(PreObserving));
        assert!(PreObserving.can_transition_to(Observing));
    }
}
