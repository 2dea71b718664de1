//! Shared domain primitives: night identifiers, requestors, error classes,
//! cancellation tokens and clocks.

use std::{fmt, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};

/// Modified Julian date of the unix epoch.
const MJD_UNIX_EPOCH: f64 = 40_587.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Integer key of one observing night.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct NightId(pub i64);

impl NightId {
    /// Night identifier at `now`: the MJD of `now + rollover_days`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn at(now: DateTime<Utc>, rollover_days: f64) -> Self {
        let mjd = now.timestamp_millis() as f64 / 1_000.0 / SECONDS_PER_DAY + MJD_UNIX_EPOCH;
        Self((mjd + rollover_days).floor() as i64)
    }

    /// Instant at which this night identifier becomes current.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn starts_at(self, rollover_days: f64) -> DateTime<Utc> {
        let seconds = (self.0 as f64 - rollover_days - MJD_UNIX_EPOCH) * SECONDS_PER_DAY;
        Utc.timestamp_opt(seconds.round() as i64, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Number of nights elapsed since `earlier`.
    #[must_use]
    pub const fn nights_since(self, earlier: Self) -> i64 {
        self.0 - earlier.0
    }
}

impl fmt::Display for NightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Component asking for a shared resource such as the dome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Requestor {
    /// Routine decisions of the control loop.
    ControlLoop,
    /// The independent safety watchdog.
    SafetyMonitor,
    /// A running calibration task.
    Calibration(String),
    /// A human operator.
    Operator,
}

impl Requestor {
    /// Whether routine requests from this requestor may be preempted.
    #[must_use]
    pub const fn is_preemptible(&self) -> bool {
        !matches!(self, Self::SafetyMonitor)
    }
}

impl fmt::Display for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlLoop => f.write_str("control-loop"),
            Self::SafetyMonitor => f.write_str("safety-monitor"),
            Self::Calibration(name) => write!(f, "calibration:{name}"),
            Self::Operator => f.write_str("operator"),
        }
    }
}

/// Failure taxonomy, ordered by gravity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Eligible for bounded retry with backoff.
    Transient,
    /// Matches a troubleshooting recipe.
    Recoverable,
    /// Disables the affected subsystem; the loop continues.
    FatalLocal,
    /// Always routes to an emergency shutdown.
    FatalGlobal,
}

impl ErrorClass {
    /// Re-classifies one level up once a retry budget is exhausted.
    #[must_use]
    pub const fn escalate(self) -> Self {
        match self {
            Self::Transient => Self::Recoverable,
            Self::Recoverable => Self::FatalLocal,
            Self::FatalLocal | Self::FatalGlobal => Self::FatalGlobal,
        }
    }

    /// Whether the error must trigger an emergency shutdown.
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::FatalGlobal)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Recoverable => "recoverable",
            Self::FatalLocal => "fatal-local",
            Self::FatalGlobal => "fatal-global",
        };
        f.write_str(label)
    }
}

/// Cooperative cancellation token shared between a workflow and its owner.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Creates a live token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that advances with the tokio clock from a fixed origin.
///
/// Under a paused tokio runtime this lets wall-clock windows (twilight, task
/// start times) move in lockstep with `tokio::time::advance`.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    /// Starts the clock at `base`.
    #[must_use]
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}

/// Last time the control loop completed a decision cycle.
#[derive(Debug, Clone)]
pub struct Liveness {
    last: Arc<Mutex<Instant>>,
}

impl Liveness {
    /// Creates a liveness marker touched now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Marks the loop as alive.
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last touch.
    #[must_use]
    pub fn stalled_for(&self) -> std::time::Duration {
        self.last.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
