//! Liveness signal towards the external heartbeat actor.
//!
//! A beat is only published while the control loop keeps completing decision
//! cycles, so a wedged loop lets the external watchdog time out. Consecutive
//! failed beats raise [`AlertKind::HeartbeatLost`] and request a shutdown.

use parking_lot::Mutex;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use super::{alerts::AlertKind, SafetyMonitor};
use crate::{
    config::{secs, ConfigWatch, HeartbeatConfig},
    control::shutdown::{ShutdownHandle, ShutdownReason},
    device::wrappers::HeartbeatChannel,
    module::{CancelToken, Liveness},
    telemetry::OverwatcherTelemetry,
};

/// Result of one heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// The beat was delivered.
    Sent,
    /// The loop is stalled; no beat was sent.
    Withheld,
    /// Delivery failed.
    Missed,
}

/// Publishes heartbeats on a fixed interval.
#[derive(Debug)]
pub struct HeartbeatPublisher {
    channel: HeartbeatChannel,
    liveness: Liveness,
    safety: SafetyMonitor,
    shutdown: ShutdownHandle,
    telemetry: OverwatcherTelemetry,
    config: ConfigWatch,
    missed: Mutex<u32>,
}

impl HeartbeatPublisher {
    /// Creates a publisher.
    #[must_use]
    pub fn new(
        channel: HeartbeatChannel,
        liveness: Liveness,
        safety: SafetyMonitor,
        shutdown: ShutdownHandle,
        telemetry: OverwatcherTelemetry,
        config: ConfigWatch,
    ) -> Self {
        Self {
            channel,
            liveness,
            safety,
            shutdown,
            telemetry,
            config,
            missed: Mutex::new(0),
        }
    }

    fn heartbeat_config(&self) -> HeartbeatConfig {
        self.config.borrow().heartbeat.clone()
    }

    /// Consecutive missed beats.
    #[must_use]
    pub fn missed(&self) -> u32 {
        *self.missed.lock()
    }

    /// Attempts a single beat.
    pub async fn beat_once(&self) -> Beat {
        let config = self.heartbeat_config();
        let stalled_for = self.liveness.stalled_for();
        if stalled_for >= secs(config.stall_timeout) {
            let _ = self.telemetry.log(
                LogLevel::Error,
                "heartbeat.withheld",
                json!({ "stalled_for": stalled_for.as_secs_f64() }),
            );
            return Beat::Withheld;
        }
        match self.channel.beat(&config.component).await {
            Ok(()) => {
                let recovered = std::mem::take(&mut *self.missed.lock()) >= config.missed_limit;
                if recovered {
                    let _ = self
                        .telemetry
                        .log(LogLevel::Info, "heartbeat.restored", json!({}));
                    self.safety.clear_external(AlertKind::HeartbeatLost);
                }
                Beat::Sent
            }
            Err(err) => {
                let missed = {
                    let mut missed = self.missed.lock();
                    *missed += 1;
                    *missed
                };
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "heartbeat.missed",
                    json!({ "missed": missed, "error": err.to_string() }),
                );
                if missed == config.missed_limit {
                    self.safety.raise_external(AlertKind::HeartbeatLost);
                    self.shutdown
                        .request_shutdown(ShutdownReason::HeartbeatLost, true);
                }
                Beat::Missed
            }
        }
    }

    /// Beats until `cancel` fires.
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancelToken) {
        let mut interval = tokio::time::interval(secs(self.heartbeat_config().interval));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.beat_once().await;
                }
                () = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OverwatcherConfig,
        device::{
            sim::{ScriptedTelemetry, SimulatedObservatory},
            wrappers::Enclosure,
            DeviceClient,
        },
        dome::DomeController,
        errors::DeviceError,
        notifier::Notifier,
    };
    use std::{sync::Arc, time::Duration};

    fn publisher(liveness: Liveness) -> (Arc<SimulatedObservatory>, HeartbeatPublisher) {
        let mut config = OverwatcherConfig::default();
        config.heartbeat.stall_timeout = 60.0;
        config.heartbeat.missed_limit = 2;
        let sim = Arc::new(SimulatedObservatory::new(&config.devices));
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        let telemetry = OverwatcherTelemetry::disabled("heartbeat");
        let notifier = Notifier::new(telemetry.clone(), Duration::from_secs(900));
        let (_tx, rx) = config.into_watch();
        let dome = DomeController::new(
            Enclosure::new(client.clone(), "lvmecp"),
            rx.clone(),
            notifier.clone(),
            telemetry.clone(),
        );
        let shutdown = ShutdownHandle::new();
        let safety = SafetyMonitor::new(
            Arc::new(ScriptedTelemetry::new()),
            dome,
            shutdown.clone(),
            notifier,
            telemetry.clone(),
            rx.clone(),
        );
        let publisher = HeartbeatPublisher::new(
            HeartbeatChannel::new(client, "lvmbeat"),
            liveness,
            safety,
            shutdown,
            telemetry,
            rx,
        );
        (sim, publisher)
    }

    #[tokio::test(start_paused = true)]
    async fn beats_stop_when_the_loop_stalls() {
        let liveness = Liveness::new();
        let (sim, publisher) = publisher(liveness.clone());
        assert_eq!(publisher.beat_once().await, Beat::Sent);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(publisher.beat_once().await, Beat::Withheld);
        assert_eq!(sim.beats(), 1);
        liveness.touch();
        assert_eq!(publisher.beat_once().await, Beat::Sent);
        assert_eq!(sim.beats(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_beats_raise_a_critical_alert() {
        let (sim, publisher) = publisher(Liveness::new());
        let unreachable = DeviceError::Unreachable {
            device: "lvmbeat".into(),
        };
        sim.fail_next("lvmbeat", "set", 2, unreachable);
        assert_eq!(publisher.beat_once().await, Beat::Missed);
        assert!(publisher.safety.is_safe());
        assert_eq!(publisher.beat_once().await, Beat::Missed);
        assert!(!publisher.safety.is_safe());
        assert!(publisher.shutdown.has_pending());
        assert_eq!(publisher.beat_once().await, Beat::Sent);
        assert_eq!(publisher.missed(), 0);
    }
}
