//! Independent safety watchdog.
//!
//! The monitor evaluates telemetry on its own interval, folds the result into
//! a debounced alert set and publishes it. Critical alerts latch: once raised
//! they keep the observatory unsafe until an operator re-enables it, even if
//! the condition has cleared. If the dome is still open `grace_window` after
//! conditions turned unsafe, the monitor closes it itself.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_event_bus::EventKind;
use shared_logging::LogLevel;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::instrument;

use crate::{
    config::{secs, ConfigWatch, SafetyConfig},
    control::shutdown::{ShutdownHandle, ShutdownReason},
    dome::{DomeController, DomeStatus},
    module::CancelToken,
    notifier::Notifier,
    telemetry::OverwatcherTelemetry,
};

/// Alert catalogue and evaluation.
pub mod alerts;
/// Heartbeat publisher.
pub mod heartbeat;

use alerts::{Alert, AlertEvaluator, AlertKind, Severity, TelemetrySnapshot, TelemetrySource};

/// Progress of the forced-close escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedClose {
    /// Armed while unsafe; nothing done yet.
    Idle,
    /// The dome was already closed when the grace window ran out.
    NotRequired,
    /// The monitor closed the dome.
    Closed,
    /// The forced close failed; not retried.
    Failed,
}

/// Published safety state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyState {
    /// No critical alert is active or latched.
    pub safe: bool,
    /// Active alerts plus latched criticals.
    pub alerts: Vec<Alert>,
    /// Consecutive failed telemetry fetches.
    pub telemetry_failures: u32,
    /// Forced-close progress.
    pub forced_close: ForcedClose,
    /// Time of the evaluation.
    pub updated_at: DateTime<Utc>,
}

impl SafetyState {
    fn initial() -> Self {
        Self {
            safe: true,
            alerts: Vec::new(),
            telemetry_failures: 0,
            forced_close: ForcedClose::Idle,
            updated_at: Utc::now(),
        }
    }

    /// Kinds of every reported alert.
    #[must_use]
    pub fn alert_kinds(&self) -> BTreeSet<AlertKind> {
        self.alerts.iter().map(|alert| alert.kind).collect()
    }

    /// Critical kinds, active or latched.
    #[must_use]
    pub fn critical_kinds(&self) -> Vec<AlertKind> {
        self.alerts
            .iter()
            .filter(|alert| alert.severity == Severity::Critical)
            .map(|alert| alert.kind)
            .collect()
    }
}

#[derive(Debug)]
struct Tracked {
    alert: Alert,
    nominal_since: Option<Instant>,
}

#[derive(Debug)]
struct Tracker {
    alerts: BTreeMap<AlertKind, Tracked>,
    external: BTreeSet<AlertKind>,
    failures: u32,
    unsafe_since: Option<Instant>,
    forced: ForcedClose,
}

impl Tracker {
    fn safe(&self) -> bool {
        !self
            .alerts
            .values()
            .any(|tracked| tracked.alert.severity == Severity::Critical)
    }

    fn active_kinds(&self) -> BTreeSet<AlertKind> {
        self.alerts
            .iter()
            .filter(|(_, tracked)| tracked.alert.is_active())
            .map(|(kind, _)| *kind)
            .collect()
    }

    fn snapshot(&self) -> SafetyState {
        SafetyState {
            safe: self.safe(),
            alerts: self.alerts.values().map(|t| t.alert.clone()).collect(),
            telemetry_failures: self.failures,
            forced_close: self.forced,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Changes {
    raised: Vec<AlertKind>,
    cleared: Vec<AlertKind>,
    became_unsafe: bool,
}

/// The safety watchdog.
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    inner: Arc<SafetyInner>,
}

#[derive(Debug)]
struct SafetyInner {
    source: Arc<dyn TelemetrySource>,
    evaluator: Mutex<AlertEvaluator>,
    tracker: Mutex<Tracker>,
    state_tx: watch::Sender<SafetyState>,
    gate_tx: watch::Sender<bool>,
    dome: DomeController,
    shutdown: ShutdownHandle,
    notifier: Notifier,
    telemetry: OverwatcherTelemetry,
    config: ConfigWatch,
}

impl SafetyMonitor {
    /// Creates the monitor and gates dome opening on its verdict.
    #[must_use]
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        dome: DomeController,
        shutdown: ShutdownHandle,
        notifier: Notifier,
        telemetry: OverwatcherTelemetry,
        config: ConfigWatch,
    ) -> Self {
        let thresholds = config.borrow().safety.thresholds.clone();
        let (state_tx, _) = watch::channel(SafetyState::initial());
        let (gate_tx, gate_rx) = watch::channel(true);
        dome.set_safety_gate(gate_rx);
        Self {
            inner: Arc::new(SafetyInner {
                source,
                evaluator: Mutex::new(AlertEvaluator::new(thresholds)),
                tracker: Mutex::new(Tracker {
                    alerts: BTreeMap::new(),
                    external: BTreeSet::new(),
                    failures: 0,
                    unsafe_since: None,
                    forced: ForcedClose::Idle,
                }),
                state_tx,
                gate_tx,
                dome,
                shutdown,
                notifier,
                telemetry,
                config,
            }),
        }
    }

    /// Latest published state.
    #[must_use]
    pub fn state(&self) -> SafetyState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver of state updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SafetyState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether no critical alert is active or latched.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.inner.tracker.lock().safe()
    }

    /// Alerts present in `snapshot` under the current thresholds.
    pub fn evaluate(
        &self,
        snapshot: &TelemetrySnapshot,
    ) -> Result<Vec<Alert>, alerts::MissingReading> {
        self.inner.evaluator.lock().evaluate(snapshot)
    }

    fn safety_config(&self) -> SafetyConfig {
        self.inner.config.borrow().safety.clone()
    }

    /// Fetches telemetry once, folds the result and runs the grace check.
    pub async fn poll_once(&self) {
        let config = self.safety_config();
        self.inner
            .evaluator
            .lock()
            .set_thresholds(config.thresholds.clone());
        let fetched = self.inner.source.fetch().await;
        let evaluated = match fetched {
            Ok(snapshot) => self
                .inner
                .evaluator
                .lock()
                .conditions(&snapshot)
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let changes = {
            let mut tracker = self.inner.tracker.lock();
            let kinds = match &evaluated {
                Ok(kinds) => {
                    tracker.failures = 0;
                    kinds.clone()
                }
                Err(_) => {
                    tracker.failures += 1;
                    let mut held = tracker.active_kinds();
                    if tracker.failures >= config.telemetry_failure_limit {
                        held.insert(AlertKind::TelemetryUnavailable);
                    }
                    held
                }
            };
            Self::fold(&mut tracker, kinds, &config)
        };
        if let Err(reason) = evaluated {
            self.log(
                LogLevel::Warn,
                "safety.telemetry.failed",
                json!({ "error": reason }),
            );
        }
        self.publish(changes);
        self.check_grace().await;
    }

    /// Raises an alert that does not come from telemetry, such as a lost
    /// heartbeat. It stays active until [`Self::clear_external`].
    pub fn raise_external(&self, kind: AlertKind) {
        let config = self.safety_config();
        let changes = {
            let mut tracker = self.inner.tracker.lock();
            tracker.external.insert(kind);
            let kinds = tracker.active_kinds();
            Self::fold(&mut tracker, kinds, &config)
        };
        self.publish(changes);
    }

    /// Lets an external alert start its clear debounce.
    pub fn clear_external(&self, kind: AlertKind) {
        self.inner.tracker.lock().external.remove(&kind);
    }

    /// Operator acknowledgement: drops latched criticals whose condition has
    /// cleared. Returns whether the observatory is now safe.
    pub fn acknowledge(&self) -> bool {
        let safe = {
            let mut tracker = self.inner.tracker.lock();
            let before = tracker.alerts.len();
            tracker.alerts.retain(|_, tracked| tracked.alert.is_active());
            let acknowledged = before - tracker.alerts.len();
            let safe = tracker.safe();
            if safe {
                tracker.unsafe_since = None;
                tracker.forced = ForcedClose::Idle;
            }
            if acknowledged > 0 {
                tracing::info!(acknowledged, safe, "latched alerts acknowledged");
            }
            safe
        };
        self.publish(Changes::default());
        safe
    }

    fn fold(
        tracker: &mut Tracker,
        mut kinds: BTreeSet<AlertKind>,
        config: &SafetyConfig,
    ) -> Changes {
        let now = Instant::now();
        let now_utc = Utc::now();
        let debounce = secs(config.clear_debounce);
        let was_safe = tracker.safe();
        kinds.extend(tracker.external.iter().copied());

        let mut changes = Changes::default();
        for kind in &kinds {
            match tracker.alerts.get_mut(kind) {
                Some(tracked) => {
                    tracked.nominal_since = None;
                    if !tracked.alert.is_active() {
                        tracked.alert = Alert::raised(*kind, now_utc);
                        changes.raised.push(*kind);
                    }
                }
                None => {
                    tracker.alerts.insert(
                        *kind,
                        Tracked {
                            alert: Alert::raised(*kind, now_utc),
                            nominal_since: None,
                        },
                    );
                    changes.raised.push(*kind);
                }
            }
        }
        for (kind, tracked) in &mut tracker.alerts {
            if kinds.contains(kind) || !tracked.alert.is_active() {
                continue;
            }
            let since = *tracked.nominal_since.get_or_insert(now);
            if now.duration_since(since) >= debounce {
                tracked.alert.cleared_at = Some(now_utc);
                changes.cleared.push(*kind);
            }
        }
        tracker.alerts.retain(|_, tracked| {
            tracked.alert.is_active() || tracked.alert.severity == Severity::Critical
        });

        let safe = tracker.safe();
        if was_safe && !safe {
            tracker.unsafe_since = Some(now);
            tracker.forced = ForcedClose::Idle;
            changes.became_unsafe = true;
        }
        changes
    }

    fn publish(&self, changes: Changes) {
        let state = self.inner.tracker.lock().snapshot();
        for kind in &changes.raised {
            let level = if kind.is_critical() {
                LogLevel::Critical
            } else {
                LogLevel::Warn
            };
            self.inner.notifier.notify(
                level,
                format!("Alert raised: {kind}"),
                format!("alert:{kind}:raised"),
                None,
            );
            let _ = self
                .inner
                .telemetry
                .event(EventKind::AlertRaised, json!({ "kind": kind }));
        }
        for kind in &changes.cleared {
            self.inner.notifier.notify(
                LogLevel::Info,
                format!("Alert cleared: {kind}"),
                format!("alert:{kind}:cleared"),
                None,
            );
            let _ = self
                .inner
                .telemetry
                .event(EventKind::AlertCleared, json!({ "kind": kind }));
        }
        self.inner.gate_tx.send_replace(state.safe);
        let critical = state.critical_kinds();
        self.inner.state_tx.send_replace(state);
        if changes.became_unsafe {
            self.log(
                LogLevel::Critical,
                "safety.unsafe",
                json!({ "alerts": critical }),
            );
            self.inner
                .shutdown
                .request_shutdown(ShutdownReason::CriticalAlert { alerts: critical }, true);
        }
    }

    fn grace_deadline(&self) -> Option<Instant> {
        let grace = secs(self.safety_config().grace_window);
        let tracker = self.inner.tracker.lock();
        match (tracker.unsafe_since, tracker.forced) {
            (Some(since), ForcedClose::Idle) if !tracker.safe() => Some(since + grace),
            _ => None,
        }
    }

    /// Forces the dome closed when it is still open after the grace window.
    pub async fn check_grace(&self) {
        match self.grace_deadline() {
            Some(deadline) if Instant::now() >= deadline => {}
            _ => return,
        }
        if matches!(self.inner.dome.status().await, Ok(DomeStatus::Closed)) {
            self.inner.tracker.lock().forced = ForcedClose::NotRequired;
            return;
        }
        self.force_close().await;
    }

    /// Closes the dome, bypassing its current holder, then requests a
    /// shutdown. A failure is notified and not retried.
    #[instrument(skip(self))]
    pub async fn force_close(&self) {
        self.log(LogLevel::Critical, "safety.force_close", json!({}));
        let result = self.inner.dome.force_close().await;
        let forced = if let Err(err) = &result {
            self.inner.notifier.notify(
                LogLevel::Critical,
                format!("Safety monitor failed to force-close the dome: {err}"),
                "safety:force_close_failed",
                None,
            );
            ForcedClose::Failed
        } else {
            ForcedClose::Closed
        };
        self.inner.tracker.lock().forced = forced;
        if result.is_ok() {
            self.inner
                .shutdown
                .request_shutdown(ShutdownReason::ForcedClose, true);
        }
        let state = self.inner.tracker.lock().snapshot();
        self.inner.state_tx.send_replace(state);
    }

    /// Runs the evaluation loop until `cancel` fires.
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancelToken) {
        let mut period = secs(self.safety_config().interval);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let deadline = self.grace_deadline();
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                    let configured = secs(self.safety_config().interval);
                    if configured != period {
                        period = configured;
                        interval = tokio::time::interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                () = until(deadline) => self.check_grace().await,
                () = cancel.cancelled() => break,
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        let _ = self.inner.telemetry.log(level, message, metadata);
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
