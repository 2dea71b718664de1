//! Calibrations: what a sequence contains and when tasks run.

/// Nightly task list.
pub mod schedule;
/// Sequence schema and runner.
pub mod sequence;

pub use schedule::{CalibrationScheduler, CalibrationTask, TaskKind, TaskStatus};
pub use sequence::{CalibrationSequence, SequenceRunner};
