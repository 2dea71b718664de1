//! Emergency shutdown coordination.
//!
//! Any component may call [`ShutdownHandle::request_shutdown`]. The request
//! cancels every registered operation immediately and wakes the control loop,
//! which runs the shutdown procedure. Requests arriving while a shutdown is
//! already running are merged into it instead of starting another one.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    config::{secs, ControlConfig},
    device::wrappers::Telescopes,
    dome::{DomeController, DomeStatus},
    errors::OverwatcherError,
    module::{CancelToken, Liveness, Requestor},
    safety::alerts::AlertKind,
    telemetry::OverwatcherTelemetry,
};

/// Why a shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// Critical alerts are active.
    CriticalAlert {
        /// Alerts at request time.
        alerts: Vec<AlertKind>,
    },
    /// The safety monitor had to force the dome closed.
    ForcedClose,
    /// Heartbeat publication failed repeatedly.
    HeartbeatLost,
    /// Operator `disable --now`.
    Operator,
    /// A failure was escalated to fatal-global.
    Escalation {
        /// Failure description.
        message: String,
    },
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CriticalAlert { alerts } => {
                let labels: Vec<_> = alerts.iter().map(|kind| kind.as_str()).collect();
                write!(f, "critical alerts: {}", labels.join(", "))
            }
            Self::ForcedClose => f.write_str("dome force-closed by the safety monitor"),
            Self::HeartbeatLost => f.write_str("heartbeat lost"),
            Self::Operator => f.write_str("operator requested immediate disable"),
            Self::Escalation { message } => write!(f, "escalated failure: {message}"),
        }
    }
}

/// A pending or running shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownRequest {
    /// Every reason received, in arrival order.
    pub reasons: Vec<ShutdownReason>,
    /// Time of the first request.
    pub requested_at: DateTime<Utc>,
    /// Leave the overwatcher disabled afterwards.
    pub disable: bool,
}

impl ShutdownRequest {
    fn merge(&mut self, reason: ShutdownReason, disable: bool) {
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
        self.disable |= disable;
    }
}

/// Shared handle used to request and coordinate shutdowns.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownShared>,
}

#[derive(Debug, Default)]
struct ShutdownShared {
    active: Mutex<Option<ShutdownRequest>>,
    pending: Mutex<Option<ShutdownRequest>>,
    operations: Mutex<IndexMap<Uuid, CancelToken>>,
    notify: Notify,
    requests: AtomicU32,
}

impl ShutdownHandle {
    /// New handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a shutdown. Returns `true` when this starts a new request and
    /// `false` when it was merged into a pending or running one.
    pub fn request_shutdown(&self, reason: ShutdownReason, disable: bool) -> bool {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let fresh = {
            let mut active = self.inner.active.lock();
            if let Some(running) = active.as_mut() {
                running.merge(reason, disable);
                false
            } else {
                let mut pending = self.inner.pending.lock();
                if let Some(queued) = pending.as_mut() {
                    queued.merge(reason, disable);
                    false
                } else {
                    *pending = Some(ShutdownRequest {
                        reasons: vec![reason],
                        requested_at: Utc::now(),
                        disable,
                    });
                    true
                }
            }
        };
        self.cancel_operations();
        self.inner.notify.notify_one();
        fresh
    }

    /// Whether a request is waiting for the control loop.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    /// Whether a shutdown procedure is running.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Total requests received, merged ones included.
    #[must_use]
    pub fn requests_received(&self) -> u32 {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Moves the pending request into the running slot. Returns `None` when
    /// nothing is pending or a shutdown is already running.
    #[must_use]
    pub fn begin(&self) -> Option<ShutdownGuard> {
        let mut active = self.inner.active.lock();
        if active.is_some() {
            return None;
        }
        let request = self.inner.pending.lock().take()?;
        *active = Some(request);
        Some(ShutdownGuard {
            handle: self.clone(),
        })
    }

    /// Registers a cancellable operation. Cancelled at once if a shutdown is
    /// already requested.
    pub fn register(&self, token: &CancelToken) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.operations.lock().insert(id, token.clone());
        if self.has_pending() || self.is_shutting_down() {
            token.cancel();
        }
        id
    }

    /// Forgets a finished operation.
    pub fn unregister(&self, id: Uuid) {
        self.inner.operations.lock().shift_remove(&id);
    }

    fn cancel_operations(&self) {
        for token in self.inner.operations.lock().values() {
            token.cancel();
        }
    }

    /// Resolves when a request arrives.
    pub async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

/// Marks a shutdown as running; dropping it reopens the slot.
#[derive(Debug)]
pub struct ShutdownGuard {
    handle: ShutdownHandle,
}

impl ShutdownGuard {
    /// The running request, including reasons merged since it started.
    #[must_use]
    pub fn request(&self) -> Option<ShutdownRequest> {
        self.handle.inner.active.lock().clone()
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.handle.inner.active.lock().take();
    }
}

/// Kind of long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Science observation.
    Observation,
    /// Calibration task.
    Calibration,
}

/// A spawned observation or calibration.
#[derive(Debug)]
pub struct Operation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Target or task name.
    pub label: String,
    /// Cooperative cancellation.
    pub cancel: CancelToken,
    /// Task handle.
    pub handle: JoinHandle<Result<(), OverwatcherError>>,
    /// Registration with the shutdown handle.
    pub registration: Uuid,
    /// Whether the operation needs the dome.
    pub requires_dome: bool,
}

impl Operation {
    /// Spawns `work` and registers its cancellation token with `shutdown`.
    pub fn spawn<F>(
        kind: OperationKind,
        label: impl Into<String>,
        requires_dome: bool,
        shutdown: &ShutdownHandle,
        work: impl FnOnce(CancelToken) -> F,
    ) -> Self
    where
        F: std::future::Future<Output = Result<(), OverwatcherError>> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let registration = shutdown.register(&cancel);
        let handle = tokio::spawn(work(cancel.clone()));
        Self {
            kind,
            label: label.into(),
            cancel,
            handle,
            registration,
            requires_dome,
        }
    }

    /// Whether the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Outcome of the shutdown procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Dome closed and telescopes parked.
    Confirmed {
        /// Confirmation attempts used.
        attempts: u32,
        /// Whether a stalled operation had to be aborted.
        hard_preempted: bool,
    },
    /// Confirmation could not be obtained.
    Unconfirmed {
        /// Last problem observed.
        reason: String,
        /// Whether a stalled operation had to be aborted.
        hard_preempted: bool,
    },
}

impl ShutdownOutcome {
    /// Whether the observatory is confirmed safe.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// The steps that take the observatory to a safe state.
pub struct EmergencyProcedure<'a> {
    /// Dome controller.
    pub dome: &'a DomeController,
    /// Telescopes to park.
    pub telescopes: &'a Telescopes,
    /// Grace, retry and backoff settings.
    pub config: &'a ControlConfig,
    /// Touched between steps so the heartbeat does not flag a stall.
    pub liveness: &'a Liveness,
    /// Telemetry.
    pub telemetry: &'a OverwatcherTelemetry,
}

impl EmergencyProcedure<'_> {
    /// Cancels `operations` cooperatively, aborts whatever outlives the grace
    /// period and, in that case, force-closes the dome. Returns whether any
    /// operation had to be aborted.
    pub async fn unwind(&self, operations: Vec<Operation>) -> bool {
        for operation in &operations {
            operation.cancel.cancel();
        }
        let deadline = Instant::now() + secs(self.config.shutdown_grace);
        let mut hard_preempted = false;
        for mut operation in operations {
            if tokio::time::timeout_at(deadline, &mut operation.handle)
                .await
                .is_err()
            {
                operation.handle.abort();
                hard_preempted = true;
                self.log(
                    LogLevel::Error,
                    "shutdown.operation.aborted",
                    json!({ "kind": operation.kind, "label": operation.label }),
                );
            }
        }
        self.liveness.touch();
        if hard_preempted {
            if let Err(err) = self.dome.force_close().await {
                self.log(
                    LogLevel::Critical,
                    "shutdown.force_close.failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
        hard_preempted
    }

    /// Closes the dome and parks the telescopes, retrying with exponential
    /// backoff until both are confirmed.
    pub async fn secure(&self, hard_preempted: bool) -> ShutdownOutcome {
        let attempts = self.config.confirm_retries.max(1);
        let mut backoff = secs(self.config.confirm_backoff);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            self.liveness.touch();
            if let Err(err) = self.dome.close(Requestor::ControlLoop).await {
                reason = format!("dome close failed: {err}");
            }
            if let Err(err) = self.telescopes.park_all().await {
                reason = format!("park failed: {err}");
            }
            let closed = matches!(self.dome.status().await, Ok(DomeStatus::Closed));
            let parked = matches!(self.telescopes.all_parked().await, Ok(true));
            self.log(
                LogLevel::Info,
                "shutdown.confirmation",
                json!({ "attempt": attempt, "closed": closed, "parked": parked }),
            );
            if closed && parked {
                return ShutdownOutcome::Confirmed {
                    attempts: attempt,
                    hard_preempted,
                };
            }
            if reason.is_empty() {
                reason = format!("dome closed: {closed}, telescopes parked: {parked}");
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(600));
            }
        }
        ShutdownOutcome::Unconfirmed {
            reason,
            hard_preempted,
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        let _ = self.telemetry.log(level, message, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DevicesConfig, OverwatcherConfig},
        device::{sim::SimulatedObservatory, wrappers::Enclosure, DeviceClient},
        errors::DeviceError,
        notifier::Notifier,
    };

    #[test]
    fn requests_merge_while_shutting_down() {
        let handle = ShutdownHandle::new();
        assert!(handle.request_shutdown(ShutdownReason::HeartbeatLost, false));
        assert!(!handle.request_shutdown(ShutdownReason::Operator, true));

        let guard = handle.begin().unwrap();
        assert!(handle.begin().is_none());
        assert!(!handle.request_shutdown(ShutdownReason::ForcedClose, false));
        assert!(!handle.has_pending());

        let request = guard.request().unwrap();
        assert_eq!(request.reasons.len(), 3);
        assert!(request.disable);
        drop(guard);
        assert!(!handle.is_shutting_down());
        assert!(handle.begin().is_none());
        assert_eq!(handle.requests_received(), 3);
    }

    #[tokio::test]
    async fn request_cancels_registered_operations() {
        let handle = ShutdownHandle::new();
        let token = CancelToken::new();
        let id = handle.register(&token);
        handle.request_shutdown(ShutdownReason::Operator, false);
        assert!(token.is_cancelled());
        handle.unregister(id);

        let late = CancelToken::new();
        handle.register(&late);
        assert!(late.is_cancelled());
    }

    struct Fixture {
        sim: Arc<SimulatedObservatory>,
        dome: DomeController,
        telescopes: Telescopes,
        control: ControlConfig,
    }

    fn fixture() -> Fixture {
        let config = OverwatcherConfig::default();
        let sim = Arc::new(SimulatedObservatory::new(&config.devices));
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        let telemetry = OverwatcherTelemetry::disabled("shutdown");
        let notifier = Notifier::new(telemetry.clone(), Duration::from_secs(60));
        let control = ControlConfig {
            shutdown_grace: 10.0,
            confirm_retries: 2,
            confirm_backoff: 1.0,
            ..config.control.clone()
        };
        let (_tx, rx) = config.into_watch();
        let dome = DomeController::new(Enclosure::new(client.clone(), "lvmecp"), rx, notifier, telemetry);
        let telescopes = Telescopes::new(client, DevicesConfig::default().telescopes);
        Fixture {
            sim,
            dome,
            telescopes,
            control,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_operation_is_aborted_after_grace() {
        let f = fixture();
        f.sim.set_dome(DomeStatus::Open);
        let shutdown = ShutdownHandle::new();
        let cooperative = Operation::spawn(
            OperationKind::Calibration,
            "arcs",
            false,
            &shutdown,
            |cancel| async move {
                cancel.cancelled().await;
                Err(OverwatcherError::Cancelled)
            },
        );
        let stalled = Operation::spawn(
            OperationKind::Observation,
            "stuck",
            true,
            &shutdown,
            |_cancel| async move {
                std::future::pending::<()>().await;
                Ok(())
            },
        );
        let liveness = Liveness::new();
        let telemetry = OverwatcherTelemetry::disabled("shutdown");
        let procedure = EmergencyProcedure {
            dome: &f.dome,
            telescopes: &f.telescopes,
            config: &f.control,
            liveness: &liveness,
            telemetry: &telemetry,
        };
        let start = Instant::now();
        let hard = procedure.unwind(vec![cooperative, stalled]).await;
        assert!(hard);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(f.sim.dome(), DomeStatus::Closed);
        let outcome = procedure.secure(hard).await;
        assert_eq!(
            outcome,
            ShutdownOutcome::Confirmed {
                attempts: 1,
                hard_preempted: true
            }
        );
        assert!(f.sim.all_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_when_parking_keeps_failing() {
        let f = fixture();
        let broken = DeviceError::Failed {
            device: "lvm.sci.pwi".into(),
            command: "park".into(),
            reason: "axis fault".into(),
        };
        f.sim.fail_next("lvm.sci.pwi", "park", 5, broken);
        let liveness = Liveness::new();
        let telemetry = OverwatcherTelemetry::disabled("shutdown");
        let procedure = EmergencyProcedure {
            dome: &f.dome,
            telescopes: &f.telescopes,
            config: &f.control,
            liveness: &liveness,
            telemetry: &telemetry,
        };
        let outcome = procedure.secure(false).await;
        assert!(!outcome.is_confirmed());
        assert_eq!(f.sim.count("lvm.sci.pwi", "park"), 2);
    }
}
