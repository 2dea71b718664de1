//! Serialized enclosure control.
//!
//! Every motion command runs while holding the motion mutex, so two motion
//! commands are never in flight together. Requests from the safety monitor
//! cancel routine holders instead of queueing behind them.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_event_bus::EventKind;
use shared_logging::LogLevel;
use tokio::sync::watch;
use uuid::Uuid;

pub use crate::device::wrappers::DomeStatus;
use crate::{
    config::{secs, ConfigWatch, DomeConfig},
    device::wrappers::Enclosure,
    errors::DomeError,
    module::Requestor,
    notifier::Notifier,
    telemetry::OverwatcherTelemetry,
};

/// Current owner of the dome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomeLock {
    /// Lease identifier.
    pub id: Uuid,
    /// Holder.
    pub held_by: Requestor,
    /// Acquisition time.
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Preemption {
    generation: u64,
    by: Option<Requestor>,
}

/// Serializes open/close/stop commands on the enclosure.
#[derive(Debug, Clone)]
pub struct DomeController {
    inner: Arc<DomeInner>,
}

#[derive(Debug)]
struct DomeInner {
    enclosure: Enclosure,
    config: ConfigWatch,
    motion: tokio::sync::Mutex<()>,
    holder: Mutex<Option<DomeLock>>,
    preempt: watch::Sender<Preemption>,
    safety_gate: Mutex<Option<watch::Receiver<bool>>>,
    notifier: Notifier,
    telemetry: OverwatcherTelemetry,
}

impl DomeController {
    /// Creates the controller.
    #[must_use]
    pub fn new(
        enclosure: Enclosure,
        config: ConfigWatch,
        notifier: Notifier,
        telemetry: OverwatcherTelemetry,
    ) -> Self {
        let (preempt, _) = watch::channel(Preemption::default());
        Self {
            inner: Arc::new(DomeInner {
                enclosure,
                config,
                motion: tokio::sync::Mutex::new(()),
                holder: Mutex::new(None),
                preempt,
                safety_gate: Mutex::new(None),
                notifier,
                telemetry,
            }),
        }
    }

    /// Refuses to open while `gate` reads `false`.
    pub fn set_safety_gate(&self, gate: watch::Receiver<bool>) {
        *self.inner.safety_gate.lock() = Some(gate);
    }

    /// Current lock holder.
    #[must_use]
    pub fn holder(&self) -> Option<DomeLock> {
        self.inner.holder.lock().clone()
    }

    /// Reported dome position.
    pub async fn status(&self) -> Result<DomeStatus, DomeError> {
        Ok(self.inner.enclosure.status().await?.dome)
    }

    /// Opens the dome.
    pub async fn open(&self, requestor: Requestor) -> Result<(), DomeError> {
        self.log(
            LogLevel::Info,
            "dome.open.requested",
            json!({ "requestor": requestor }),
        );
        if !self.is_safe() {
            return Err(DomeError::Unsafe);
        }
        self.with_lock(&requestor, self.open_locked(&requestor))
            .await
    }

    /// Closes the dome. A close that finds the dome closed is a no-op. Closes
    /// from the safety monitor preempt routine holders.
    pub async fn close(&self, requestor: Requestor) -> Result<(), DomeError> {
        self.log(
            LogLevel::Info,
            "dome.close.requested",
            json!({ "requestor": requestor }),
        );
        if !requestor.is_preemptible() {
            self.preempt(requestor.clone());
        }
        self.with_lock(&requestor, self.close_locked(&requestor, false))
            .await
    }

    /// Cancels whoever holds the dome and closes it in overcurrent mode,
    /// without a normal-mode attempt first.
    pub async fn force_close(&self) -> Result<(), DomeError> {
        let requestor = Requestor::SafetyMonitor;
        self.log(
            LogLevel::Warn,
            "dome.force_close.requested",
            json!({ "holder": self.holder().map(|lock| lock.held_by) }),
        );
        self.preempt(requestor.clone());
        self.with_lock(&requestor, self.close_locked(&requestor, true))
            .await
    }

    /// Stops any motion, preempting routine holders.
    pub async fn stop(&self, requestor: Requestor) -> Result<(), DomeError> {
        self.preempt(requestor.clone());
        self.with_lock(&requestor, async {
            self.inner.enclosure.stop().await?;
            Ok(())
        })
        .await
    }

    fn preempt(&self, by: Requestor) {
        self.inner.preempt.send_modify(|preemption| {
            preemption.generation += 1;
            preemption.by = Some(by);
        });
    }

    async fn preempted(rx: &mut watch::Receiver<Preemption>) -> Requestor {
        if rx.changed().await.is_ok() {
            rx.borrow_and_update()
                .by
                .clone()
                .unwrap_or(Requestor::SafetyMonitor)
        } else {
            std::future::pending().await
        }
    }

    async fn with_lock<T>(
        &self,
        requestor: &Requestor,
        op: impl Future<Output = Result<T, DomeError>>,
    ) -> Result<T, DomeError> {
        let mut preempt_rx = self.inner.preempt.subscribe();
        let preemptible = requestor.is_preemptible();
        let guard = if preemptible {
            tokio::select! {
                guard = self.inner.motion.lock() => guard,
                by = Self::preempted(&mut preempt_rx) => {
                    return Err(DomeError::Preempted { by });
                }
            }
        } else {
            self.inner.motion.lock().await
        };
        let lease = DomeLock {
            id: Uuid::new_v4(),
            held_by: requestor.clone(),
            acquired_at: Utc::now(),
        };
        let lease_id = lease.id;
        *self.inner.holder.lock() = Some(lease);

        tokio::pin!(op);
        let result = if preemptible {
            tokio::select! {
                result = &mut op => result,
                by = Self::preempted(&mut preempt_rx) => {
                    self.log(
                        LogLevel::Warn,
                        "dome.preempted",
                        json!({ "holder": requestor, "by": by }),
                    );
                    Err(DomeError::Preempted { by })
                }
            }
        } else {
            op.await
        };

        {
            let mut holder = self.inner.holder.lock();
            if holder.as_ref().is_some_and(|lock| lock.id == lease_id) {
                *holder = None;
            }
        }
        drop(guard);
        result
    }

    async fn open_locked(&self, requestor: &Requestor) -> Result<(), DomeError> {
        let status = self.checked_status().await?;
        if status == DomeStatus::Open {
            return Ok(());
        }
        if status == DomeStatus::Unknown || status.is_moving() {
            self.inner.enclosure.stop().await?;
        }
        if !self.is_safe() {
            return Err(DomeError::Unsafe);
        }
        let config = self.dome_config();
        self.event(EventKind::DomeOpening, json!({ "requestor": requestor }));
        if let Err(err) = self.inner.enclosure.open(secs(config.open_timeout)).await {
            if self.reached(DomeStatus::Open).await {
                self.log(
                    LogLevel::Warn,
                    "dome.open.reported_failure_but_open",
                    json!({ "error": err.to_string() }),
                );
            } else {
                return Err(err.into());
            }
        }
        self.event(EventKind::DomeOpen, json!({ "requestor": requestor }));
        Ok(())
    }

    async fn close_locked(&self, requestor: &Requestor, forced_only: bool) -> Result<(), DomeError> {
        let status = self.checked_status().await?;
        if status == DomeStatus::Closed {
            self.log(
                LogLevel::Debug,
                "dome.close.already_closed",
                json!({ "requestor": requestor }),
            );
            return Ok(());
        }
        if status == DomeStatus::Unknown || status.is_moving() {
            self.inner.enclosure.stop().await?;
        }
        let config = self.dome_config();
        self.event(
            EventKind::DomeClosing,
            json!({ "requestor": requestor, "forced": forced_only }),
        );

        if !forced_only {
            let normal = self
                .inner
                .enclosure
                .close(false, secs(config.close_timeout))
                .await;
            let confirmed = normal.is_ok() && self.reached(DomeStatus::Closed).await;
            if confirmed {
                self.event(
                    EventKind::DomeClosed,
                    json!({ "requestor": requestor, "forced": false }),
                );
                return Ok(());
            }
            let error = normal.err().map(|err| err.to_string());
            self.log(
                LogLevel::Warn,
                "dome.close.escalating_to_overcurrent",
                json!({ "error": error }),
            );
        }

        let forced = self
            .inner
            .enclosure
            .close(true, secs(config.forced_close_timeout))
            .await;
        if self.reached(DomeStatus::Closed).await {
            self.event(
                EventKind::DomeClosed,
                json!({ "requestor": requestor, "forced": true }),
            );
            return Ok(());
        }
        let reason = match forced {
            Ok(()) => "overcurrent close reported success but the dome is not closed".to_string(),
            Err(err) => err.to_string(),
        };
        self.inner.notifier.notify(
            LogLevel::Critical,
            format!("Dome failed to close: {reason}"),
            "dome:fault",
            None,
        );
        Err(DomeError::Fault { reason })
    }

    async fn checked_status(&self) -> Result<DomeStatus, DomeError> {
        let status = self.inner.enclosure.status().await?;
        if status.local {
            self.inner.notifier.notify(
                LogLevel::Warn,
                "Enclosure is in local mode; refusing to move the dome",
                "dome:local",
                None,
            );
            return Err(DomeError::LocalMode);
        }
        Ok(status.dome)
    }

    async fn reached(&self, target: DomeStatus) -> bool {
        matches!(self.status().await, Ok(status) if status == target)
    }

    fn is_safe(&self) -> bool {
        self.inner
            .safety_gate
            .lock()
            .as_ref()
            .map_or(true, |gate| *gate.borrow())
    }

    fn dome_config(&self) -> DomeConfig {
        self.inner.config.borrow().dome.clone()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        let _ = self.inner.telemetry.log(level, message, metadata);
    }

    fn event(&self, kind: EventKind, payload: serde_json::Value) {
        let _ = self.inner.telemetry.log(LogLevel::Info, kind.label(), payload.clone());
        let _ = self.inner.telemetry.event(kind, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DevicesConfig, OverwatcherConfig},
        device::{sim::SimulatedObservatory, DeviceClient},
        errors::DeviceError,
    };
    use std::time::Duration;
    use tokio::time::Instant;

    struct Fixture {
        sim: Arc<SimulatedObservatory>,
        dome: DomeController,
        notifier: Notifier,
    }

    fn fixture() -> Fixture {
        let mut config = OverwatcherConfig::default();
        config.dome.close_timeout = 60.0;
        config.dome.forced_close_timeout = 60.0;
        config.dome.open_timeout = 60.0;
        let sim = Arc::new(SimulatedObservatory::new(&DevicesConfig::default()));
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        let telemetry = OverwatcherTelemetry::disabled("dome");
        let notifier = Notifier::new(telemetry.clone(), Duration::from_secs(600));
        let (_tx, rx) = config.into_watch();
        let dome = DomeController::new(
            Enclosure::new(client, "lvmecp"),
            rx,
            notifier.clone(),
            telemetry,
        );
        Fixture {
            sim,
            dome,
            notifier,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let f = fixture();
        f.sim.set_dome(DomeStatus::Open);
        f.dome.close(Requestor::ControlLoop).await.unwrap();
        f.dome.close(Requestor::ControlLoop).await.unwrap();
        assert_eq!(f.sim.count("lvmecp", "close"), 1);

        let g = fixture();
        g.dome.close(Requestor::ControlLoop).await.unwrap();
        g.dome.close(Requestor::ControlLoop).await.unwrap();
        assert_eq!(g.sim.count("lvmecp", "close"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_close_preempts_routine_open() {
        let f = fixture();
        let opener = f.dome.clone();
        let open = tokio::spawn(async move { opener.open(Requestor::ControlLoop).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.sim.dome(), DomeStatus::Opening);
        assert_eq!(
            f.dome.holder().map(|lock| lock.held_by),
            Some(Requestor::ControlLoop)
        );

        f.dome.close(Requestor::SafetyMonitor).await.unwrap();
        let opened = open.await.unwrap();
        assert_eq!(
            opened,
            Err(DomeError::Preempted {
                by: Requestor::SafetyMonitor
            })
        );
        assert_eq!(f.sim.dome(), DomeStatus::Closed);
        assert!(f.dome.holder().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn routine_requests_are_serialized() {
        let f = fixture();
        let opener = f.dome.clone();
        let closer = f.dome.clone();
        let open = tokio::spawn(async move { opener.open(Requestor::ControlLoop).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let close = tokio::spawn(async move {
            closer
                .close(Requestor::Calibration("twilight_flats".into()))
                .await
        });
        open.await.unwrap().unwrap();
        close.await.unwrap().unwrap();

        let journal = f.sim.journal();
        let open_at = journal.iter().find(|e| e.command == "open").unwrap().at;
        let close_at = journal.iter().find(|e| e.command == "close").unwrap().at;
        assert!(close_at >= open_at + Duration::from_secs(30));
        assert_eq!(f.sim.dome(), DomeStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_close_falls_back_to_overcurrent() {
        let f = fixture();
        f.sim.set_dome(DomeStatus::Open);
        f.sim.hang_next("lvmecp", "close", 1);
        let start = Instant::now();
        f.dome.close(Requestor::ControlLoop).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        let closes: Vec<_> = f
            .sim
            .journal()
            .into_iter()
            .filter(|e| e.command == "close")
            .collect();
        assert_eq!(closes.len(), 2);
        assert_eq!(closes[1].args["force"], serde_json::json!(true));
        assert_eq!(f.sim.dome(), DomeStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn double_failure_reports_dome_fault() {
        let f = fixture();
        f.sim.set_dome(DomeStatus::Open);
        let jam = DeviceError::Failed {
            device: "lvmecp".into(),
            command: "close".into(),
            reason: "motor overcurrent".into(),
        };
        f.sim.fail_next("lvmecp", "close", 2, jam);
        let err = f.dome.close(Requestor::ControlLoop).await.unwrap_err();
        assert!(matches!(err, DomeError::Fault { .. }));
        assert!(err.class().is_global());
        assert_eq!(f.notifier.count_with_prefix("dome:fault"), 1);
        assert_eq!(f.sim.count("lvmecp", "close"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_local_mode_and_unsafe_conditions() {
        let f = fixture();
        f.sim.set_local(true);
        assert_eq!(
            f.dome.open(Requestor::ControlLoop).await,
            Err(DomeError::LocalMode)
        );
        f.sim.set_local(false);
        let (gate_tx, gate_rx) = watch::channel(false);
        f.dome.set_safety_gate(gate_rx);
        assert_eq!(
            f.dome.open(Requestor::ControlLoop).await,
            Err(DomeError::Unsafe)
        );
        gate_tx.send_replace(true);
        f.dome.open(Requestor::ControlLoop).await.unwrap();
        assert_eq!(f.sim.count("lvmecp", "open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_cancels_the_holder() {
        let f = fixture();
        f.sim.set_dome(DomeStatus::Closed);
        let opener = f.dome.clone();
        let open = tokio::spawn(async move { opener.open(Requestor::Operator).await });
        tokio::time::sleep(Duration::from_secs(10)).await;
        f.dome.force_close().await.unwrap();
        assert!(matches!(
            open.await.unwrap(),
            Err(DomeError::Preempted { .. })
        ));
        let last_close = f
            .sim
            .journal()
            .into_iter()
            .filter(|e| e.command == "close")
            .last()
            .unwrap();
        assert_eq!(last_close.args["force"], serde_json::json!(true));
        assert_eq!(f.sim.count("lvmecp", "close"), 1);
        assert_eq!(f.sim.dome(), DomeStatus::Closed);
    }
}
