#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Autonomous supervision of a robotic observatory.
//!
//! The crate holds the control loop, the safety watchdog and heartbeat, the
//! calibration scheduler, the dome serializer and the troubleshooter.

/// Telemetry handle shared by every component.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Night identifiers, requestors, error classes and clocks.
#[path = "../module.rs"]
pub mod module;

/// Typed errors.
#[path = "../errors.rs"]
pub mod errors;

/// TOML configuration and live reload.
#[path = "../config.rs"]
pub mod config;

/// Deduplicated operator notifications.
#[path = "../notifier.rs"]
pub mod notifier;

/// Process-wide status snapshot.
#[path = "../status.rs"]
pub mod status;

/// Sun ephemeris.
#[path = "../ephemeris.rs"]
pub mod ephemeris;

/// Remote device commands, wrappers and the simulator.
#[path = "../device/main.rs"]
pub mod device;

/// Serialized dome control.
#[path = "../dome/main.rs"]
pub mod dome;

/// Safety watchdog and heartbeat.
#[path = "../safety/main.rs"]
pub mod safety;

/// Calibration schedule and sequences.
#[path = "../calibration/main.rs"]
pub mod calibration;

/// Failure recovery.
#[path = "../troubleshooter/main.rs"]
pub mod troubleshooter;

/// Control loop, operator commands and emergency shutdown.
#[path = "../control/main.rs"]
pub mod control;

/// Runtime wiring.
#[path = "../main.rs"]
pub mod runtime;

pub use calibration::{CalibrationScheduler, CalibrationSequence, SequenceRunner};
pub use config::{ConfigSource, OverwatcherConfig};
pub use control::{
    shutdown::{ShutdownHandle, ShutdownOutcome, ShutdownReason},
    state::LoopState,
    CommandReply, OperatorCommand, Overwatcher, OverwatcherHandle, StatusReport,
};
pub use dome::DomeController;
pub use errors::{DeviceError, DomeError, OverwatcherError};
pub use module::{CancelToken, ErrorClass, NightId, Requestor};
pub use runtime::{OverwatcherRuntime, OverwatcherRuntimeBuilder, Simulation};
pub use safety::{heartbeat::HeartbeatPublisher, SafetyMonitor};
pub use status::{OverwatcherStatus, StatusReader};
pub use telemetry::{OverwatcherTelemetry, OverwatcherTelemetryBuilder};
pub use troubleshooter::Troubleshooter;
