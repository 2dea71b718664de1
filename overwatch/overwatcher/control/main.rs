//! The overwatcher control loop.
//!
//! One task owns every routine decision: it ticks on a fixed interval, folds
//! the safety verdict and the night's ephemeris into the status, advances the
//! calibration schedule and spawns observations or calibrations. Operator
//! commands reach it over a channel through [`OverwatcherHandle`]; shutdown
//! requests from any component wake it immediately.

/// Observing seams.
pub mod observing;
/// Emergency shutdown coordination.
pub mod shutdown;
/// Loop states.
pub mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::EventKind;
use shared_logging::LogLevel;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::{
    calibration::{
        schedule::ScheduleError, CalibrationScheduler, CalibrationTask, SequenceRunner, TaskKind,
        TaskStatus,
    },
    config::{secs, ConfigSource, ConfigWatch, OverwatcherConfig},
    device::wrappers::{Devices, Telescopes},
    dome::DomeController,
    ephemeris::{Ephemeris, EphemerisSource},
    errors::{DomeError, OverwatcherError},
    module::{CancelToken, Clock, Liveness, NightId, Requestor},
    notifier::Notifier,
    safety::{alerts::AlertKind, SafetyMonitor},
    status::{OverwatcherStatus, StatusPublisher, StatusReader, Subsystem},
    telemetry::OverwatcherTelemetry,
    troubleshooter::{Failure, FailureSignature, Outcome, Troubleshooter},
};

use observing::{ObservingWorkflow, Target, TargetSelector};
use shutdown::{
    EmergencyProcedure, Operation, OperationKind, ShutdownGuard, ShutdownHandle, ShutdownOutcome,
    ShutdownReason,
};
use state::LoopState;

const COMMAND_QUEUE: usize = 16;

/// Operator commands accepted by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Enable autonomous operation, acknowledging cleared critical alerts.
    Enable,
    /// Disable autonomous operation.
    Disable {
        /// Run the emergency shutdown instead of waiting for the current
        /// operation to finish.
        now: bool,
        /// Close the dome once idle.
        close_dome: bool,
    },
    /// Report the current status.
    Status,
    /// Re-read the configuration file.
    ReloadConfig,
}

/// An operation in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Target or task name.
    pub label: String,
}

/// A calibration task and its status tonight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    /// Task name.
    pub name: String,
    /// Current status.
    pub status: TaskStatus,
}

/// Answer to [`OperatorCommand::Status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Status snapshot.
    pub status: OverwatcherStatus,
    /// Operations in flight.
    pub operations: Vec<RunningOperation>,
    /// Tonight's calibration tasks.
    pub calibrations: Vec<TaskSummary>,
}

/// Reply to an operator command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CommandReply {
    /// The command was applied.
    Accepted {
        /// Loop state after the command.
        state: LoopState,
    },
    /// The command was refused.
    Rejected {
        /// Why.
        reason: String,
    },
    /// Status report.
    Status(Box<StatusReport>),
    /// Result of an immediate disable.
    Shutdown {
        /// Shutdown outcome.
        outcome: ShutdownOutcome,
    },
    /// The configuration was reloaded and applied.
    ConfigReloaded,
}

/// The control loop is no longer running.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("the overwatcher control loop is not running")]
pub struct LoopStopped;

#[derive(Debug)]
struct CommandEnvelope {
    command: OperatorCommand,
    reply: oneshot::Sender<CommandReply>,
}

/// Cloneable front door to a running [`Overwatcher`].
#[derive(Debug, Clone)]
pub struct OverwatcherHandle {
    commands: mpsc::Sender<CommandEnvelope>,
    shutdown: ShutdownHandle,
    status: StatusReader,
}

impl OverwatcherHandle {
    /// Sends `command` and waits for the loop's reply.
    pub async fn send(&self, command: OperatorCommand) -> Result<CommandReply, LoopStopped> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CommandEnvelope { command, reply })
            .await
            .map_err(|_| LoopStopped)?;
        rx.await.map_err(|_| LoopStopped)
    }

    /// Enables autonomous operation.
    pub async fn enable(&self) -> Result<CommandReply, LoopStopped> {
        self.send(OperatorCommand::Enable).await
    }

    /// Disables autonomous operation. With `now` the reply arrives once the
    /// emergency shutdown has finished.
    pub async fn disable(&self, now: bool, close_dome: bool) -> Result<CommandReply, LoopStopped> {
        self.send(OperatorCommand::Disable { now, close_dome }).await
    }

    /// Current status, operations and calibrations.
    pub async fn status(&self) -> Result<CommandReply, LoopStopped> {
        self.send(OperatorCommand::Status).await
    }

    /// Reloads the configuration file.
    pub async fn reload_config(&self) -> Result<CommandReply, LoopStopped> {
        self.send(OperatorCommand::ReloadConfig).await
    }

    /// Requests an emergency shutdown without disabling the overwatcher.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        self.shutdown.request_shutdown(reason, false)
    }

    /// Read-only status view that never waits on the loop.
    #[must_use]
    pub fn status_reader(&self) -> StatusReader {
        self.status.clone()
    }
}

/// Everything the control loop drives.
pub struct OverwatcherParts {
    /// Live configuration.
    pub config: ConfigWatch,
    /// File-backed source used by `reload-config`.
    pub config_source: Option<Arc<ConfigSource>>,
    /// Device wrappers.
    pub devices: Devices,
    /// Dome controller shared with the safety monitor.
    pub dome: DomeController,
    /// Safety monitor.
    pub safety: SafetyMonitor,
    /// Troubleshooter.
    pub troubleshooter: Troubleshooter,
    /// Science target source.
    pub selector: Arc<dyn TargetSelector>,
    /// Per-target observing workflow.
    pub workflow: Arc<dyn ObservingWorkflow>,
    /// Sun ephemeris.
    pub ephemeris: Arc<dyn EphemerisSource>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Shutdown coordination.
    pub shutdown: ShutdownHandle,
    /// Operator notifications.
    pub notifier: Notifier,
    /// Marker read by the heartbeat publisher.
    pub liveness: Liveness,
    /// Telemetry.
    pub telemetry: OverwatcherTelemetry,
}

/// The control loop.
pub struct Overwatcher {
    config_rx: ConfigWatch,
    config: Arc<OverwatcherConfig>,
    config_source: Option<Arc<ConfigSource>>,
    devices: Devices,
    dome: DomeController,
    safety: SafetyMonitor,
    troubleshooter: Troubleshooter,
    runner: SequenceRunner,
    selector: Arc<dyn TargetSelector>,
    workflow: Arc<dyn ObservingWorkflow>,
    ephemeris: Arc<dyn EphemerisSource>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownHandle,
    notifier: Notifier,
    liveness: Liveness,
    telemetry: OverwatcherTelemetry,
    status: StatusPublisher,
    state: LoopState,
    scheduler: CalibrationScheduler,
    commands: mpsc::Receiver<CommandEnvelope>,
    observation: Option<Operation>,
    calibration: Option<Operation>,
    dome_open: bool,
    close_dome_when_idle: bool,
    shutdown_waiters: Vec<oneshot::Sender<CommandReply>>,
    preflight_night: Option<NightId>,
    last_failure: Option<(FailureSignature, Option<String>)>,
    transparency_hold: bool,
}

impl Overwatcher {
    /// Builds the loop and the handle used to command it.
    #[must_use]
    pub fn new(parts: OverwatcherParts) -> (Self, OverwatcherHandle) {
        let OverwatcherParts {
            mut config,
            config_source,
            devices,
            dome,
            safety,
            troubleshooter,
            selector,
            workflow,
            ephemeris,
            clock,
            shutdown,
            notifier,
            liveness,
            telemetry,
        } = parts;
        let current = Arc::clone(&*config.borrow_and_update());
        notifier.set_default_cooldown(secs(current.notifications.cooldown));
        let (status, reader) = StatusPublisher::new(OverwatcherStatus {
            dry_run: current.control.dry_run,
            allow_calibrations: current.control.allow_calibrations,
            ..OverwatcherStatus::default()
        });
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = OverwatcherHandle {
            commands: tx,
            shutdown: shutdown.clone(),
            status: reader,
        };
        let overwatcher = Self {
            scheduler: CalibrationScheduler::new(current.calibrations.clone()),
            runner: SequenceRunner::new(devices.clone(), telemetry.scoped("calibration")),
            config_rx: config,
            config: current,
            config_source,
            devices,
            dome,
            safety,
            troubleshooter,
            selector,
            workflow,
            ephemeris,
            clock,
            shutdown,
            notifier,
            liveness,
            telemetry,
            status,
            state: LoopState::Disabled,
            commands: rx,
            observation: None,
            calibration: None,
            dome_open: false,
            close_dome_when_idle: false,
            shutdown_waiters: Vec::new(),
            preflight_night: None,
            last_failure: None,
            transparency_hold: false,
        };
        (overwatcher, handle)
    }

    /// Current loop state.
    #[must_use]
    pub const fn state(&self) -> LoopState {
        self.state
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> OverwatcherStatus {
        self.status.current()
    }

    /// Tonight's calibration schedule.
    #[must_use]
    pub const fn scheduler(&self) -> &CalibrationScheduler {
        &self.scheduler
    }

    /// Runs until `cancel` fires. Operations still in flight are cancelled on
    /// the way out.
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancelToken) {
        self.log(LogLevel::Info, "control.started", json!({ "state": self.state }));
        loop {
            self.tick().await;
            let interval = self.config.tick_interval();
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.shutdown.notified() => {}
                Some(envelope) = self.commands.recv() => self.handle_command(envelope),
                () = cancel.cancelled() => break,
            }
        }
        for operation in [self.observation.take(), self.calibration.take()]
            .into_iter()
            .flatten()
        {
            operation.cancel.cancel();
            self.shutdown.unregister(operation.registration);
        }
        self.log(LogLevel::Info, "control.stopped", json!({ "state": self.state }));
    }

    /// One decision cycle.
    pub async fn tick(&mut self) -> LoopState {
        self.liveness.touch();
        self.apply_config();
        while let Ok(envelope) = self.commands.try_recv() {
            self.handle_command(envelope);
        }
        self.fold_safety();
        let now = self.clock.now();
        let ephemeris = self.refresh_night(now);
        if !self.run_pending_shutdown().await {
            self.reap().await;
            self.decide(now, &ephemeris).await;
            self.run_pending_shutdown().await;
        }
        self.publish_activity();
        self.liveness.touch();
        self.state
    }

    fn apply_config(&mut self) {
        if !self.config_rx.has_changed().unwrap_or(false) {
            return;
        }
        let config = Arc::clone(&*self.config_rx.borrow_and_update());
        self.scheduler.set_config(config.calibrations.clone());
        self.notifier
            .set_default_cooldown(secs(config.notifications.cooldown));
        self.status.update(|status| {
            status.dry_run = config.control.dry_run;
            status.allow_calibrations = config.control.allow_calibrations;
        });
        self.log(
            LogLevel::Info,
            "control.config.applied",
            json!({ "dry_run": config.control.dry_run, "tasks": config.calibrations.tasks.len() }),
        );
        self.config = config;
    }

    fn handle_command(&mut self, envelope: CommandEnvelope) {
        let CommandEnvelope { command, reply } = envelope;
        self.log(LogLevel::Info, "control.command", json!({ "command": command }));
        let response = match command {
            OperatorCommand::Enable => self.enable(),
            OperatorCommand::Disable { now: true, .. } => {
                self.status.update(|status| status.enabled = false);
                self.shutdown_waiters.push(reply);
                self.shutdown
                    .request_shutdown(ShutdownReason::Operator, true);
                return;
            }
            OperatorCommand::Disable {
                now: false,
                close_dome,
            } => {
                self.status.update(|status| status.enabled = false);
                self.close_dome_when_idle |= close_dome;
                CommandReply::Accepted { state: self.state }
            }
            OperatorCommand::Status => CommandReply::Status(Box::new(self.report())),
            OperatorCommand::ReloadConfig => self.reload_config(),
        };
        let _ = reply.send(response);
    }

    fn enable(&mut self) -> CommandReply {
        if self.status.current().shutdown_unresolved {
            return CommandReply::Rejected {
                reason: "emergency shutdown is unresolved; secure the observatory manually".into(),
            };
        }
        if !self.safety.acknowledge() {
            let labels: Vec<_> = self
                .safety
                .state()
                .critical_kinds()
                .iter()
                .map(|kind| kind.as_str())
                .collect();
            self.fold_safety();
            return CommandReply::Rejected {
                reason: format!("critical alerts active: {}", labels.join(", ")),
            };
        }
        self.troubleshooter.reset_all();
        self.close_dome_when_idle = false;
        self.status.update(|status| {
            status.enabled = true;
            status.disabled_subsystems.clear();
        });
        self.fold_safety();
        CommandReply::Accepted { state: self.state }
    }

    fn reload_config(&mut self) -> CommandReply {
        let Some(source) = &self.config_source else {
            return CommandReply::Rejected {
                reason: "no configuration file to reload".into(),
            };
        };
        match source.reload() {
            Ok(_) => {
                self.apply_config();
                CommandReply::ConfigReloaded
            }
            Err(err) => CommandReply::Rejected {
                reason: format!("{err:#}"),
            },
        }
    }

    fn report(&self) -> StatusReport {
        StatusReport {
            status: self.status.current(),
            operations: self
                .observation
                .iter()
                .chain(self.calibration.iter())
                .map(|operation| RunningOperation {
                    kind: operation.kind,
                    label: operation.label.clone(),
                })
                .collect(),
            calibrations: self
                .scheduler
                .tasks()
                .iter()
                .map(|task| TaskSummary {
                    name: task.name.clone(),
                    status: task.status,
                })
                .collect(),
        }
    }

    fn fold_safety(&self) {
        let safety = self.safety.state();
        self.status.update(|status| {
            status.safe = safety.safe;
            status.active_alerts = safety.alert_kinds();
        });
    }

    fn refresh_night(&mut self, now: DateTime<Utc>) -> Ephemeris {
        let night = NightId::at(now, self.config.night.rollover_days);
        let ephemeris = self.ephemeris.ephemeris(night);
        if self.scheduler.refresh(&ephemeris) {
            self.telemetry.set_night(night);
            self.status.update(|status| status.night = Some(night));
            self.log(
                LogLevel::Info,
                "control.night",
                json!({
                    "night": night,
                    "sunset": ephemeris.sunset,
                    "sunrise": ephemeris.sunrise,
                    "tasks": self.scheduler.tasks().len(),
                }),
            );
        }
        ephemeris
    }

    fn publish_activity(&self) {
        let idle = self.observation.is_none() && self.calibration.is_none();
        if self.status.current().idle != idle {
            self.status.update(|status| status.idle = idle);
        }
    }

    fn transition(&mut self, next: LoopState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            tracing::error!(%from, %next, "refusing illegal state transition");
            return;
        }
        self.state = next;
        self.status.update(|status| {
            status.state = next;
            status.observing = next == LoopState::Observing;
            status.calibrating = next == LoopState::Calibrating;
        });
        let payload = json!({ "from": from, "to": next });
        self.log(LogLevel::Info, "control.transition", payload.clone());
        let _ = self.telemetry.event(EventKind::StateTransition, payload);
        self.notifier.notify(
            LogLevel::Info,
            format!("overwatcher {from} -> {next}"),
            format!("transition:{from}->{next}"),
            None,
        );
    }

    fn dry_run(&self) -> bool {
        self.config.control.dry_run
    }

    fn transparency_poor(&self) -> bool {
        self.status
            .current()
            .active_alerts
            .contains(&AlertKind::Transparency)
    }

    fn observing_allowed(&self) -> bool {
        !self
            .status
            .current()
            .disabled_subsystems
            .contains(&Subsystem::Observing)
    }

    fn calibrations_allowed(&self) -> bool {
        let status = self.status.current();
        status.allow_calibrations && !status.disabled_subsystems.contains(&Subsystem::Calibrations)
    }

    fn is_safe(&self) -> bool {
        self.status.current().safe
    }

    async fn run_pending_shutdown(&mut self) -> bool {
        let Some(guard) = self.shutdown.begin() else {
            return false;
        };
        self.emergency_shutdown(&guard).await;
        drop(guard);
        true
    }

    async fn emergency_shutdown(&mut self, guard: &ShutdownGuard) {
        let reasons = guard.request().map(|request| request.reasons).unwrap_or_default();
        self.transition(LoopState::EmergencyShutdown);
        let summary: Vec<_> = reasons.iter().map(ToString::to_string).collect();
        self.notifier.notify(
            LogLevel::Critical,
            format!("emergency shutdown: {}", summary.join("; ")),
            "shutdown:started",
            None,
        );
        let _ = self
            .telemetry
            .event(EventKind::EmergencyShutdown, json!({ "reasons": reasons }));

        let now = self.clock.now();
        let mut operations = Vec::new();
        for operation in [self.observation.take(), self.calibration.take()]
            .into_iter()
            .flatten()
        {
            self.shutdown.unregister(operation.registration);
            if operation.kind == OperationKind::Calibration {
                let _ = self.scheduler.mark_failed(&operation.label, now);
            }
            operations.push(operation);
        }

        let config = Arc::clone(&self.config);
        let procedure = EmergencyProcedure {
            dome: &self.dome,
            telescopes: &self.devices.telescopes,
            config: &config.control,
            liveness: &self.liveness,
            telemetry: &self.telemetry,
        };
        let hard_preempted = procedure.unwind(operations).await;
        let outcome = procedure.secure(hard_preempted).await;
        // Reasons merged while the procedure ran count as well.
        let disable = guard.request().map_or(true, |request| request.disable);
        self.resolve_shutdown(outcome, disable);
    }

    fn resolve_shutdown(&mut self, outcome: ShutdownOutcome, disable: bool) {
        self.log(
            LogLevel::Info,
            "control.shutdown.outcome",
            json!({ "outcome": outcome, "disable": disable }),
        );
        self.dome_open = false;
        if outcome.is_confirmed() {
            let enabled = self.status.current().enabled && !disable;
            self.status.update(|status| {
                status.shutdown_unresolved = false;
                status.enabled = enabled;
            });
            self.transition(if enabled {
                LoopState::Idle
            } else {
                LoopState::Disabled
            });
        } else {
            let reason = match &outcome {
                ShutdownOutcome::Unconfirmed { reason, .. } => reason.clone(),
                ShutdownOutcome::Confirmed { .. } => String::new(),
            };
            self.status.update(|status| {
                status.shutdown_unresolved = true;
                status.enabled = false;
            });
            self.notifier.notify(
                LogLevel::Critical,
                format!("emergency shutdown unconfirmed, manual intervention required: {reason}"),
                "shutdown:unconfirmed",
                None,
            );
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(CommandReply::Shutdown {
                outcome: outcome.clone(),
            });
        }
    }

    async fn retry_unresolved_shutdown(&mut self) {
        let config = Arc::clone(&self.config);
        let procedure = EmergencyProcedure {
            dome: &self.dome,
            telescopes: &self.devices.telescopes,
            config: &config.control,
            liveness: &self.liveness,
            telemetry: &self.telemetry,
        };
        let outcome = procedure.secure(false).await;
        self.resolve_shutdown(outcome, true);
    }

    async fn reap(&mut self) {
        if self.observation.as_ref().is_some_and(Operation::is_finished) {
            if let Some(operation) = self.observation.take() {
                let result = self.join(operation).await;
                self.observation_finished(result).await;
            }
        }
        if self.calibration.as_ref().is_some_and(Operation::is_finished) {
            if let Some(operation) = self.calibration.take() {
                let name = operation.label.clone();
                let result = self.join(operation).await;
                self.calibration_finished(&name, result).await;
            }
        }
    }

    async fn join(&self, operation: Operation) -> Result<(), OverwatcherError> {
        self.shutdown.unregister(operation.registration);
        match operation.handle.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(label = %operation.label, ?err, "operation task failed");
                Err(OverwatcherError::Aborted(operation.label))
            }
        }
    }

    async fn observation_finished(&mut self, result: Result<(), OverwatcherError>) {
        match result {
            Ok(()) => {
                if let Some((signature, device)) = self.last_failure.take() {
                    self.troubleshooter.reset(signature, device.as_deref());
                }
            }
            Err(err) if err.is_cancellation() => {
                self.log(LogLevel::Info, "control.observation.cancelled", json!({}));
            }
            Err(err) => self.troubleshoot(Subsystem::Observing, err).await,
        }
    }

    async fn calibration_finished(&mut self, name: &str, result: Result<(), OverwatcherError>) {
        let now = self.clock.now();
        match result {
            Ok(()) => {
                if let Err(err) = self.scheduler.mark_done(name) {
                    tracing::warn!(%err, "calibration finished outside the schedule");
                }
                let _ = self.telemetry.event(
                    EventKind::CalibrationFinished,
                    json!({ "task": name, "status": TaskStatus::Done }),
                );
                let Some(task) = self.scheduler.task(name).cloned() else {
                    return;
                };
                if task.kind == TaskKind::PostObserving {
                    for recoverable in self.scheduler.recoverable() {
                        if self.scheduler.requeue_for_recovery(&recoverable, now).is_ok() {
                            self.log(
                                LogLevel::Info,
                                "calibration.recovery.requeued",
                                json!({ "task": recoverable }),
                            );
                        }
                    }
                }
                if task.close_dome_after {
                    if let Err(err) = self.close_dome().await {
                        self.troubleshoot(Subsystem::Calibrations, err.into()).await;
                    }
                }
            }
            Err(err) => {
                let status = self.scheduler.mark_failed(name, now).ok();
                let _ = self.telemetry.event(
                    EventKind::CalibrationFinished,
                    json!({ "task": name, "status": status, "error": err.to_string() }),
                );
                if !err.is_cancellation() {
                    self.troubleshoot(Subsystem::Calibrations, err).await;
                }
            }
        }
    }

    /// Hands a failure to the troubleshooter and acts on the verdict.
    async fn troubleshoot(&mut self, subsystem: Subsystem, err: OverwatcherError) {
        let failure = Failure::from_error(&err);
        self.transition(LoopState::Troubleshooting);
        let attempt = self.troubleshooter.handle(&failure).await;
        self.last_failure = Some((failure.signature, failure.device.clone()));
        if attempt.outcome == Outcome::Escalated {
            if attempt.class.is_global() {
                self.notifier.notify(
                    LogLevel::Critical,
                    format!("fatal error, shutting down: {failure}"),
                    format!("fatal:{}", failure.signature),
                    None,
                );
                self.shutdown.request_shutdown(
                    ShutdownReason::Escalation {
                        message: failure.to_string(),
                    },
                    true,
                );
                return;
            }
            self.notifier.notify(
                LogLevel::Error,
                format!("{subsystem:?} disabled after repeated failures: {failure}"),
                format!("disabled:{subsystem:?}:{}", failure.signature),
                None,
            );
            self.status.update(|status| {
                status.disabled_subsystems.insert(subsystem);
            });
        }
        if self.state == LoopState::Troubleshooting {
            self.transition(LoopState::Idle);
        }
    }

    async fn open_dome(&mut self, requestor: Requestor) -> Result<(), DomeError> {
        if self.dry_run() {
            self.log(LogLevel::Info, "dry_run.dome.open", json!({ "requestor": requestor }));
        } else {
            self.dome.open(requestor).await?;
        }
        self.dome_open = true;
        Ok(())
    }

    async fn close_dome(&mut self) -> Result<(), DomeError> {
        if self.dry_run() {
            self.log(LogLevel::Info, "dry_run.dome.close", json!({}));
        } else {
            self.dome.close(Requestor::ControlLoop).await?;
        }
        self.dome_open = false;
        Ok(())
    }

    async fn decide(&mut self, now: DateTime<Utc>, ephemeris: &Ephemeris) {
        if self.shutdown.has_pending() || self.shutdown.is_shutting_down() {
            return;
        }
        if self.state == LoopState::EmergencyShutdown {
            if self.status.current().shutdown_unresolved {
                self.retry_unresolved_shutdown().await;
            }
            return;
        }
        if !self.status.current().enabled {
            self.wind_down().await;
            return;
        }
        match self.state {
            LoopState::Disabled => {
                let night_ahead = self.observing_allowed()
                    && ephemeris.is_imminent_night(now, self.imminent_window());
                if night_ahead || self.next_calibration(now).is_some() {
                    self.transition(LoopState::Idle);
                }
            }
            LoopState::Idle => self.decide_idle(now, ephemeris).await,
            LoopState::PreObserving => self.decide_pre_observing(now, ephemeris).await,
            LoopState::Observing => self.decide_observing(now, ephemeris).await,
            LoopState::Calibrating => self.decide_calibrating(now, ephemeris),
            LoopState::Troubleshooting => self.transition(LoopState::Idle),
            LoopState::EmergencyShutdown => {}
        }
    }

    fn imminent_window(&self) -> std::time::Duration {
        secs(self.config.control.imminent_night_window)
    }

    /// Disabled without `--now`: let the current operation finish, then stop.
    async fn wind_down(&mut self) {
        if self.observation.is_some() || self.calibration.is_some() {
            return;
        }
        if self.close_dome_when_idle {
            self.close_dome_when_idle = false;
            if let Err(err) = self.close_dome().await {
                self.troubleshoot(Subsystem::Observing, err.into()).await;
            }
        }
        self.transition(LoopState::Disabled);
    }

    fn next_calibration(&mut self, now: DateTime<Utc>) -> Option<CalibrationTask> {
        if !self.calibrations_allowed() {
            return None;
        }
        match self.scheduler.next_ready(now) {
            Some(task) if task.requires_dome && !self.is_safe() => {
                self.scheduler.next_ready_for(now, false)
            }
            other => other,
        }
    }

    async fn decide_idle(&mut self, now: DateTime<Utc>, ephemeris: &Ephemeris) {
        if !self.is_safe() {
            return;
        }
        if let Some(task) = self.next_calibration(now) {
            self.start_calibration(task).await;
            return;
        }
        if self.observing_allowed() && ephemeris.is_imminent_night(now, self.imminent_window()) {
            self.transition(LoopState::PreObserving);
            return;
        }
        if self.dome_open {
            if let Err(err) = self.close_dome().await {
                self.troubleshoot(Subsystem::Observing, err.into()).await;
            }
        }
    }

    async fn decide_pre_observing(&mut self, now: DateTime<Utc>, ephemeris: &Ephemeris) {
        if !self.is_safe()
            || !self.observing_allowed()
            || !ephemeris.is_imminent_night(now, self.imminent_window())
        {
            self.transition(LoopState::Idle);
            return;
        }
        if self.next_calibration(now).is_some() {
            self.transition(LoopState::Idle);
            return;
        }
        if self.preflight_night != Some(ephemeris.night) {
            if self.dry_run() {
                self.log(LogLevel::Info, "dry_run.preflight", json!({}));
            } else if let Err(err) =
                preflight(&self.devices, self.config.control.preflight_bias).await
            {
                self.troubleshoot(Subsystem::Observing, err).await;
                return;
            }
            self.preflight_night = Some(ephemeris.night);
            self.log(LogLevel::Info, "control.preflight.passed", json!({ "night": ephemeris.night }));
        }
        if !ephemeris.is_night(now) {
            return;
        }
        if let Err(err) = self.open_dome(Requestor::ControlLoop).await {
            self.troubleshoot(Subsystem::Observing, err.into()).await;
            return;
        }
        if let Some(target) = self.selector.next_target().await {
            self.transition(LoopState::Observing);
            self.spawn_observation(target);
        } else {
            tracing::debug!("no target available");
        }
    }

    async fn decide_observing(&mut self, now: DateTime<Utc>, ephemeris: &Ephemeris) {
        if self.observation.is_some() {
            return;
        }
        if !ephemeris.is_night(now) || !self.observing_allowed() || !self.is_safe() {
            self.end_observing().await;
            return;
        }
        if let Some(task) = self.next_calibration(now) {
            self.start_calibration(task).await;
            return;
        }
        // Poor transparency holds new targets; the dome stays open.
        let poor = self.transparency_poor();
        if poor != self.transparency_hold {
            self.transparency_hold = poor;
            let (level, message) = if poor {
                (LogLevel::Warn, "observing.held.transparency")
            } else {
                (LogLevel::Info, "observing.resumed.transparency")
            };
            self.log(level, message, json!({}));
        }
        if poor {
            return;
        }
        match self.selector.next_target().await {
            Some(target) => self.spawn_observation(target),
            None => tracing::debug!("no target available"),
        }
    }

    async fn end_observing(&mut self) {
        if let Err(err) = self.close_dome().await {
            self.troubleshoot(Subsystem::Observing, err.into()).await;
            return;
        }
        if !self.dry_run() {
            if let Err(err) = self.devices.telescopes.park_all().await {
                self.troubleshoot(Subsystem::Observing, err.into()).await;
                return;
            }
        }
        self.log(LogLevel::Info, "control.night.ended", json!({}));
        self.transition(LoopState::Idle);
    }

    fn decide_calibrating(&mut self, now: DateTime<Utc>, ephemeris: &Ephemeris) {
        if self.calibration.is_some() {
            return;
        }
        let resume = self.dome_open
            && ephemeris.is_night(now)
            && self.observing_allowed()
            && self.is_safe();
        self.transition(if resume {
            LoopState::Observing
        } else {
            LoopState::Idle
        });
    }

    fn spawn_observation(&mut self, target: Target) {
        if self.dry_run() {
            self.log(LogLevel::Info, "dry_run.observe", json!({ "target": target }));
            return;
        }
        let workflow = Arc::clone(&self.workflow);
        let telemetry = self.telemetry.clone();
        let label = target.name.clone();
        self.observation = Some(Operation::spawn(
            OperationKind::Observation,
            label,
            true,
            &self.shutdown,
            move |cancel| async move {
                let outcome = workflow.observe(target, cancel).await?;
                let _ = telemetry.event(
                    EventKind::ObservationFinished,
                    json!({
                        "target": outcome.target.name,
                        "exposures": outcome.exposures,
                        "finished_at": outcome.finished_at,
                    }),
                );
                Ok::<(), OverwatcherError>(())
            },
        ));
    }

    async fn start_calibration(&mut self, task: CalibrationTask) {
        if task.requires_dome {
            if let Err(err) = self.open_dome(Requestor::Calibration(task.name.clone())).await {
                self.troubleshoot(Subsystem::Calibrations, err.into()).await;
                return;
            }
        }
        // Opening the dome can outlast the window.
        match self.scheduler.mark_running(&task.name, self.clock.now()) {
            Ok(()) => {}
            Err(err @ ScheduleError::WindowClosed { .. }) => {
                self.log(
                    LogLevel::Warn,
                    "calibration.window.missed",
                    json!({ "task": task.name, "error": err.to_string() }),
                );
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "calibration not started");
                return;
            }
        }
        let _ = self.telemetry.event(
            EventKind::CalibrationStarted,
            json!({ "task": task.name, "requires_dome": task.requires_dome }),
        );
        self.transition(LoopState::Calibrating);
        if self.dry_run() {
            self.log(LogLevel::Info, "dry_run.calibration", json!({ "task": task.name }));
            let _ = self.scheduler.mark_done(&task.name);
            return;
        }
        let operation = match &task.kind {
            TaskKind::Sequence(_) => {
                let Some(sequence) = self.scheduler.sequence_for(&task) else {
                    let _ = self.scheduler.mark_failed(&task.name, self.clock.now());
                    self.notifier.notify(
                        LogLevel::Error,
                        format!("calibration '{}' references an unknown sequence", task.name),
                        format!("calibration:{}:sequence", task.name),
                        None,
                    );
                    return;
                };
                let runner = self.runner.clone();
                let defaults = self.config.calibrations.defaults.clone();
                let name = task.name.clone();
                Operation::spawn(
                    OperationKind::Calibration,
                    task.name.clone(),
                    task.requires_dome,
                    &self.shutdown,
                    move |cancel| async move {
                        runner
                            .run(&name, &sequence, &defaults, &cancel)
                            .await
                            .map(|_| ())
                            .map_err(OverwatcherError::from)
                    },
                )
            }
            TaskKind::PreObserving => {
                let devices = self.devices.clone();
                let bias = self.config.control.preflight_bias;
                Operation::spawn(
                    OperationKind::Calibration,
                    task.name.clone(),
                    task.requires_dome,
                    &self.shutdown,
                    move |cancel| async move {
                        tokio::select! {
                            result = preflight(&devices, bias) => result,
                            () = cancel.cancelled() => Err(OverwatcherError::Cancelled),
                        }
                    },
                )
            }
            TaskKind::PostObserving => {
                let dome = self.dome.clone();
                let telescopes = self.devices.telescopes.clone();
                Operation::spawn(
                    OperationKind::Calibration,
                    task.name.clone(),
                    task.requires_dome,
                    &self.shutdown,
                    move |cancel| async move {
                        post_observing(&dome, &telescopes, &cancel).await
                    },
                )
            }
        };
        self.calibration = Some(operation);
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        let _ = self.telemetry.log(level, message, metadata);
    }
}

/// Device checks run before a night: every mount, the spectrographs and the
/// enclosure must answer, and optionally a bias frame is taken.
async fn preflight(devices: &Devices, bias: bool) -> Result<(), OverwatcherError> {
    devices.telescopes.ping_all().await?;
    devices.spectrographs.ping().await?;
    devices.enclosure.status().await?;
    if bias {
        devices.spectrographs.expose("bias", 0.0).await?;
    }
    Ok(())
}

/// End-of-night recipe: close the dome, then park. A cancelled run stops
/// before the next step.
async fn post_observing(
    dome: &DomeController,
    telescopes: &Telescopes,
    cancel: &CancelToken,
) -> Result<(), OverwatcherError> {
    if cancel.is_cancelled() {
        return Err(OverwatcherError::Cancelled);
    }
    dome.close(Requestor::ControlLoop).await?;
    if cancel.is_cancelled() {
        return Err(OverwatcherError::Cancelled);
    }
    telescopes.park_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{sim::SimulatedObservatory, wrappers::DomeStatus, DeviceClient},
        errors::ObservationFailure,
        runtime::{OverwatcherRuntime, Simulation},
    };
    use chrono::TimeZone;
    use std::time::Duration;

    fn night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap()
    }

    fn afternoon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap()
    }

    fn config(mutate: impl FnOnce(&mut OverwatcherConfig)) -> OverwatcherConfig {
        let mut config = OverwatcherConfig::default();
        config.control.preflight_bias = false;
        config.control.shutdown_grace = 10.0;
        config.control.confirm_backoff = 1.0;
        config.calibrations.day_tasks = false;
        config.safety.clear_debounce = 0.0;
        mutate(&mut config);
        config
    }

    struct Running {
        handle: OverwatcherHandle,
        sim: Simulation,
        safety: SafetyMonitor,
        cancel: CancelToken,
    }

    fn start(config: OverwatcherConfig, at: DateTime<Utc>) -> Running {
        let (runtime, sim) = OverwatcherRuntime::simulated(config, at).unwrap();
        let parts = runtime.into_parts();
        let cancel = CancelToken::new();
        tokio::spawn(parts.overwatcher.run(cancel.clone()));
        Running {
            handle: parts.handle,
            sim,
            safety: parts.safety,
            cancel,
        }
    }

    async fn settle(seconds: u64) {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_at_night_opens_and_observes_then_disables_now() {
        let run = start(config(|_| {}), night());
        let reply = run.handle.enable().await.unwrap();
        assert!(matches!(reply, CommandReply::Accepted { .. }));
        settle(300).await;

        assert_eq!(run.sim.observatory.dome(), DomeStatus::Open);
        assert!(run.sim.observer.completed() >= 1);
        let status = run.handle.status_reader().snapshot();
        assert_eq!(status.state, LoopState::Observing);
        assert!(status.observing && !status.calibrating);

        let reply = run.handle.disable(true, false).await.unwrap();
        let CommandReply::Shutdown { outcome } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert!(outcome.is_confirmed());
        let status = run.handle.status_reader().snapshot();
        assert_eq!(status.state, LoopState::Disabled);
        assert!(!status.enabled);
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Closed);
        assert!(run.sim.observatory.all_parked());
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn critical_alert_shuts_down_and_blocks_enable_until_cleared() {
        let run = start(config(|_| {}), night());
        run.handle.enable().await.unwrap();
        settle(300).await;
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Open);

        run.safety.raise_external(AlertKind::HeartbeatLost);
        settle(120).await;
        let status = run.handle.status_reader().snapshot();
        assert_eq!(status.state, LoopState::Disabled);
        assert!(!status.safe);
        assert!(status.active_alerts.contains(&AlertKind::HeartbeatLost));
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Closed);

        let reply = run.handle.enable().await.unwrap();
        assert!(matches!(reply, CommandReply::Rejected { .. }));
        settle(60).await;
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Closed);

        run.safety.clear_external(AlertKind::HeartbeatLost);
        run.safety.poll_once().await;
        settle(1).await;
        run.safety.poll_once().await;
        let reply = run.handle.enable().await.unwrap();
        assert!(matches!(reply, CommandReply::Accepted { .. }));
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn poor_transparency_holds_new_targets_until_it_clears() {
        let run = start(config(|_| {}), night());
        run.sim.weather.update(|snapshot| snapshot.zero_point = Some(-22.0));
        run.safety.poll_once().await;
        run.handle.enable().await.unwrap();
        settle(300).await;

        let status = run.handle.status_reader().snapshot();
        assert!(status.active_alerts.contains(&AlertKind::Transparency));
        assert!(status.safe);
        assert_eq!(status.state, LoopState::Observing);
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Open);
        assert_eq!(run.sim.observer.completed(), 0);

        run.sim.weather.update(|snapshot| snapshot.zero_point = Some(-23.0));
        run.safety.poll_once().await;
        settle(1).await;
        run.safety.poll_once().await;
        settle(600).await;
        let status = run.handle.status_reader().snapshot();
        assert!(!status.active_alerts.contains(&AlertKind::Transparency));
        assert!(run.sim.observer.completed() >= 1);
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn observation_failure_is_troubleshot_and_observing_resumes() {
        let run = start(config(|_| {}), night());
        run.sim.observer.fail_next(ObservationFailure::ExposureStuck);
        run.handle.enable().await.unwrap();
        settle(600).await;

        assert!(run.sim.observatory.aborts() >= 1);
        assert!(run.sim.observer.completed() >= 1);
        let status = run.handle.status_reader().snapshot();
        assert_eq!(status.state, LoopState::Observing);
        assert!(status.disabled_subsystems.is_empty());
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_never_moves_hardware() {
        let run = start(config(|c| c.control.dry_run = true), night());
        run.handle.enable().await.unwrap();
        settle(300).await;

        let status = run.handle.status_reader().snapshot();
        assert!(status.dry_run);
        assert_eq!(status.state, LoopState::Observing);
        assert_eq!(run.sim.observatory.count("lvmecp", "open"), 0);
        assert!(run.sim.observatory.exposures().is_empty());
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn daytime_calibration_runs_and_loop_returns_to_idle() {
        let config = config(|c| {
            c.calibrations.tasks = toml::from_str::<OverwatcherConfig>(
                r#"
                [[calibrations.tasks]]
                name = "afternoon_biases"
                anchor = "sunset"
                start_offset = -360.0
                max_start_offset = -60.0
                sequence = { biases = { count = 3 } }
                "#,
            )
            .unwrap()
            .calibrations
            .tasks;
        });
        let run = start(config, afternoon());
        run.handle.enable().await.unwrap();
        settle(120).await;

        let CommandReply::Status(report) = run.handle.status().await.unwrap() else {
            panic!("expected a status report");
        };
        let task = report
            .calibrations
            .iter()
            .find(|task| task.name == "afternoon_biases")
            .unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(report.status.state, LoopState::Idle);
        assert!(report.operations.is_empty());
        let biases = run
            .sim
            .observatory
            .exposures()
            .iter()
            .filter(|exposure| exposure.flavour == "bias")
            .count();
        assert_eq!(biases, 3);
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Closed);
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_is_skipped_when_the_dome_opens_after_its_window() {
        let config = config(|c| {
            c.calibrations.tasks = toml::from_str::<OverwatcherConfig>(
                r#"
                [[calibrations.tasks]]
                name = "dome_flats"
                anchor = "sunset"
                start_offset = -300.0
                max_start_offset = -299.5
                dome = true
                sequence = { biases = { count = 2 } }
                "#,
            )
            .unwrap()
            .calibrations
            .tasks;
        });
        let run = start(config, afternoon());
        run.sim.observatory.set_motion_time(Duration::from_secs(60));
        run.handle.enable().await.unwrap();
        settle(300).await;

        let CommandReply::Status(report) = run.handle.status().await.unwrap() else {
            panic!("expected a status report");
        };
        let task = report
            .calibrations
            .iter()
            .find(|task| task.name == "dome_flats")
            .unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(run.sim.observatory.count("lvmecp", "open"), 1);
        assert!(run.sim.observatory.exposures().is_empty());
        assert!(report.operations.is_empty());
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_post_observing_stops_before_parking() {
        let config = OverwatcherConfig::default();
        let sim = Arc::new(SimulatedObservatory::new(&config.devices));
        sim.set_dome(DomeStatus::Open);
        sim.unpark_all();
        let devices = Devices::new(
            DeviceClient::new(sim.clone(), Duration::from_secs(5)),
            &config.devices,
        );
        let telemetry = OverwatcherTelemetry::disabled("control");
        let notifier = Notifier::new(telemetry.clone(), Duration::from_secs(600));
        let (_tx, rx) = config.into_watch();
        let dome = DomeController::new(devices.enclosure.clone(), rx, notifier, telemetry);
        let cancel = CancelToken::new();
        let recipe = {
            let (dome, telescopes, cancel) =
                (dome.clone(), devices.telescopes.clone(), cancel.clone());
            tokio::spawn(async move { post_observing(&dome, &telescopes, &cancel).await })
        };
        settle(5).await;
        cancel.cancel();

        let result = recipe.await.unwrap();
        assert!(matches!(result, Err(OverwatcherError::Cancelled)));
        assert_eq!(sim.dome(), DomeStatus::Closed);
        assert_eq!(sim.count("lvm.sci.pwi", "park"), 0);
        assert!(!sim.all_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn disable_waits_for_the_observation_and_closes_when_asked() {
        let run = start(config(|_| {}), night());
        run.handle.enable().await.unwrap();
        settle(300).await;
        let reply = run.handle.disable(false, true).await.unwrap();
        assert!(matches!(reply, CommandReply::Accepted { .. }));
        settle(1_200).await;

        let status = run.handle.status_reader().snapshot();
        assert_eq!(status.state, LoopState::Disabled);
        assert!(status.idle);
        assert_eq!(run.sim.observatory.dome(), DomeStatus::Closed);
        assert_eq!(run.sim.observatory.aborts(), 0);
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_loop_is_reported() {
        let run = start(config(|_| {}), night());
        run.cancel.cancel();
        settle(10).await;
        assert_eq!(run.handle.status().await, Err(LoopStopped));
    }
}
