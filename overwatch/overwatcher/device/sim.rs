//! In-memory observatory used by the simulated runtime and by tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::{wrappers::DomeStatus, wrappers::Devices, Args, DeviceFacade, DeviceReply};
use crate::{
    config::DevicesConfig,
    control::observing::{ObservationOutcome, ObservingWorkflow, Target, TargetSelector},
    errors::{DeviceError, ObservationFailure, OverwatcherError},
    module::CancelToken,
    safety::alerts::{TelemetrySnapshot, TelemetrySource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Enclosure,
    Telescope,
    Guider,
    Spectrograph,
    Lamps,
    FibreSelector,
    PowerSwitch,
    Heartbeat,
}

/// One command received by the simulator.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Arrival time on the tokio clock.
    pub at: Instant,
    /// Target device.
    pub device: String,
    /// Command name.
    pub command: String,
    /// Arguments.
    pub args: Args,
}

/// Exposure taken by the simulated spectrographs.
#[derive(Debug, Clone)]
pub struct ExposureRecord {
    /// Image type (`bias`, `dark`, `arc`, `flat`, `object`).
    pub flavour: String,
    /// Exposure time in seconds.
    pub exposure_time: f64,
    /// Start on the tokio clock.
    pub started: Instant,
    /// Lamps lit when the exposure started.
    pub lamps_on: Vec<String>,
    /// Fibre selector position when the exposure started.
    pub fibre_position: Option<String>,
}

#[derive(Debug, Clone)]
enum FaultKind {
    Fail(DeviceError),
    Hang,
}

#[derive(Debug)]
struct Fault {
    device: String,
    command: String,
    remaining: u32,
    kind: FaultKind,
}

#[derive(Debug)]
struct SimState {
    dome: DomeStatus,
    local: bool,
    motion_time: Duration,
    parked: HashMap<String, bool>,
    lamps_on: IndexSet<String>,
    fibre_position: Option<String>,
    exposures: Vec<ExposureRecord>,
    aborts: u32,
    beats: u32,
    faults: Vec<Fault>,
    journal: Vec<JournalEntry>,
}

/// Simulated observatory implementing [`DeviceFacade`].
///
/// Motion and exposures take simulated time, so tests run it under a paused
/// tokio clock.
#[derive(Debug)]
pub struct SimulatedObservatory {
    roles: HashMap<String, Role>,
    state: Mutex<SimState>,
}

impl SimulatedObservatory {
    /// Simulator answering to the configured actor identifiers. The dome
    /// starts closed and the telescopes unparked.
    #[must_use]
    pub fn new(config: &DevicesConfig) -> Self {
        let mut roles = HashMap::new();
        roles.insert(config.enclosure.clone(), Role::Enclosure);
        for id in &config.telescopes {
            roles.insert(id.clone(), Role::Telescope);
        }
        for id in &config.guiders {
            roles.insert(id.clone(), Role::Guider);
        }
        roles.insert(config.spectrographs.clone(), Role::Spectrograph);
        roles.insert(config.calibration_lamps.clone(), Role::Lamps);
        roles.insert(config.fibre_selector.clone(), Role::FibreSelector);
        roles.insert(config.power_switch.clone(), Role::PowerSwitch);
        roles.insert(config.heartbeat.clone(), Role::Heartbeat);
        let parked = config
            .telescopes
            .iter()
            .map(|id| (id.clone(), false))
            .collect();
        Self {
            roles,
            state: Mutex::new(SimState {
                dome: DomeStatus::Closed,
                local: false,
                motion_time: Duration::from_secs(30),
                parked,
                lamps_on: IndexSet::new(),
                fibre_position: None,
                exposures: Vec::new(),
                aborts: 0,
                beats: 0,
                faults: Vec::new(),
                journal: Vec::new(),
            }),
        }
    }

    /// Forces the dome position.
    pub fn set_dome(&self, status: DomeStatus) {
        self.state.lock().dome = status;
    }

    /// Current dome position.
    #[must_use]
    pub fn dome(&self) -> DomeStatus {
        self.state.lock().dome
    }

    /// Puts the enclosure under local control.
    pub fn set_local(&self, local: bool) {
        self.state.lock().local = local;
    }

    /// Time a full dome motion takes.
    pub fn set_motion_time(&self, motion_time: Duration) {
        self.state.lock().motion_time = motion_time;
    }

    /// Makes the next `times` matching commands fail with `error`.
    pub fn fail_next(&self, device: &str, command: &str, times: u32, error: DeviceError) {
        self.push_fault(device, command, times, FaultKind::Fail(error));
    }

    /// Makes the next `times` matching commands never reply.
    pub fn hang_next(&self, device: &str, command: &str, times: u32) {
        self.push_fault(device, command, times, FaultKind::Hang);
    }

    fn push_fault(&self, device: &str, command: &str, times: u32, kind: FaultKind) {
        self.state.lock().faults.push(Fault {
            device: device.to_string(),
            command: command.to_string(),
            remaining: times,
            kind,
        });
    }

    /// Every command received so far.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Number of `command` invocations on `device`.
    #[must_use]
    pub fn count(&self, device: &str, command: &str) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|entry| entry.device == device && entry.command == command)
            .count()
    }

    /// Exposures taken so far.
    #[must_use]
    pub fn exposures(&self) -> Vec<ExposureRecord> {
        self.state.lock().exposures.clone()
    }

    /// Lamps currently lit.
    #[must_use]
    pub fn lamps_on(&self) -> Vec<String> {
        self.state.lock().lamps_on.iter().cloned().collect()
    }

    /// Exposure aborts received.
    #[must_use]
    pub fn aborts(&self) -> u32 {
        self.state.lock().aborts
    }

    /// Heartbeats received.
    #[must_use]
    pub fn beats(&self) -> u32 {
        self.state.lock().beats
    }

    /// Whether every telescope is parked.
    #[must_use]
    pub fn all_parked(&self) -> bool {
        self.state.lock().parked.values().all(|parked| *parked)
    }

    /// Unparks every telescope.
    pub fn unpark_all(&self) {
        for parked in self.state.lock().parked.values_mut() {
            *parked = false;
        }
    }

    fn take_fault(&self, device: &str, command: &str) -> Option<FaultKind> {
        let mut state = self.state.lock();
        let index = state
            .faults
            .iter()
            .position(|f| f.device == device && f.command == command && f.remaining > 0)?;
        let fault = &mut state.faults[index];
        fault.remaining -= 1;
        let kind = fault.kind.clone();
        if fault.remaining == 0 {
            state.faults.remove(index);
        }
        Some(kind)
    }

    async fn move_dome(&self, device: &str, command: &str, opening: bool) -> Result<(), DeviceError> {
        let motion_time = {
            let mut state = self.state.lock();
            if state.local {
                return Err(DeviceError::Failed {
                    device: device.to_string(),
                    command: command.to_string(),
                    reason: "enclosure in local mode".into(),
                });
            }
            let target = if opening { DomeStatus::Open } else { DomeStatus::Closed };
            if state.dome == target {
                return Ok(());
            }
            state.dome = if opening {
                DomeStatus::Opening
            } else {
                DomeStatus::Closing
            };
            state.motion_time
        };
        tokio::time::sleep(motion_time).await;
        self.state.lock().dome = if opening { DomeStatus::Open } else { DomeStatus::Closed };
        Ok(())
    }

    async fn expose(&self, args: &Args) -> Result<(), DeviceError> {
        let flavour = args
            .get("flavour")
            .and_then(Value::as_str)
            .unwrap_or("object")
            .to_string();
        let exposure_time = args
            .get("exposure_time")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        {
            let mut state = self.state.lock();
            let record = ExposureRecord {
                flavour,
                exposure_time,
                started: Instant::now(),
                lamps_on: state.lamps_on.iter().cloned().collect(),
                fibre_position: state.fibre_position.clone(),
            };
            state.exposures.push(record);
        }
        tokio::time::sleep(crate::config::secs(exposure_time)).await;
        Ok(())
    }

    fn unknown_command(device: &str, command: &str) -> DeviceError {
        DeviceError::Failed {
            device: device.to_string(),
            command: command.to_string(),
            reason: "unknown command".into(),
        }
    }
}

#[async_trait]
impl DeviceFacade for SimulatedObservatory {
    async fn invoke(
        &self,
        device: &str,
        command: &str,
        args: Args,
        _timeout: Duration,
    ) -> Result<DeviceReply, DeviceError> {
        self.state.lock().journal.push(JournalEntry {
            at: Instant::now(),
            device: device.to_string(),
            command: command.to_string(),
            args: args.clone(),
        });
        let Some(role) = self.roles.get(device).copied() else {
            return Err(DeviceError::Unreachable {
                device: device.to_string(),
            });
        };
        match self.take_fault(device, command) {
            Some(FaultKind::Fail(err)) => return Err(err),
            Some(FaultKind::Hang) => std::future::pending::<()>().await,
            None => {}
        }
        if matches!(command, "ping" | "reconnect" | "reset") {
            return Ok(DeviceReply::empty());
        }
        let reply = match (role, command) {
            (Role::Enclosure, "status") => {
                let state = self.state.lock();
                json!({ "dome": state.dome.as_str(), "local": state.local })
            }
            (Role::Enclosure, "open") => {
                self.move_dome(device, command, true).await?;
                json!({})
            }
            (Role::Enclosure, "close") => {
                self.move_dome(device, command, false).await?;
                json!({})
            }
            (Role::Enclosure, "stop") => {
                let mut state = self.state.lock();
                if state.dome.is_moving() {
                    state.dome = DomeStatus::Unknown;
                }
                json!({})
            }
            (Role::Telescope, "park") => {
                self.state.lock().parked.insert(device.to_string(), true);
                json!({})
            }
            (Role::Telescope, "status") => {
                let parked = self.state.lock().parked.get(device).copied().unwrap_or(false);
                json!({ "parked": parked })
            }
            (Role::Guider, "stop") | (Role::PowerSwitch, "cycle") => json!({}),
            (Role::Spectrograph, "expose") => {
                self.expose(&args).await?;
                json!({})
            }
            (Role::Spectrograph, "abort") => {
                self.state.lock().aborts += 1;
                json!({})
            }
            (Role::Lamps, "on" | "off") => {
                let lamp = args
                    .get("lamp")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut state = self.state.lock();
                if command == "on" {
                    state.lamps_on.insert(lamp);
                } else {
                    state.lamps_on.shift_remove(&lamp);
                }
                json!({})
            }
            (Role::Lamps, "all_off") => {
                self.state.lock().lamps_on.clear();
                json!({})
            }
            (Role::FibreSelector, "move") => {
                let position = args
                    .get("position")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.state.lock().fibre_position = position;
                json!({})
            }
            (Role::Heartbeat, "set") => {
                self.state.lock().beats += 1;
                json!({})
            }
            _ => return Err(Self::unknown_command(device, command)),
        };
        Ok(DeviceReply::from_value(reply))
    }
}

/// Scripted environmental telemetry.
#[derive(Debug)]
pub struct ScriptedTelemetry {
    current: Mutex<TelemetrySnapshot>,
    failures: AtomicU32,
    down: AtomicBool,
}

impl ScriptedTelemetry {
    /// Starts with nominal readings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(TelemetrySnapshot::nominal()),
            failures: AtomicU32::new(0),
            down: AtomicBool::new(false),
        }
    }

    /// Replaces the readings returned from now on.
    pub fn set(&self, snapshot: TelemetrySnapshot) {
        *self.current.lock() = snapshot;
    }

    /// Applies a change to the current readings.
    pub fn update(&self, change: impl FnOnce(&mut TelemetrySnapshot)) {
        change(&mut self.current.lock());
    }

    /// Fails the next `times` fetches.
    pub fn fail_next(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }

    /// Fails every fetch until cleared.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl Default for ScriptedTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn fetch(&self) -> Result<TelemetrySnapshot, DeviceError> {
        let scripted_failure = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.down.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable {
                device: "weather".into(),
            });
        }
        let mut snapshot = self.current.lock().clone();
        snapshot.taken_at = Utc::now();
        Ok(snapshot)
    }
}

/// Target selector serving a fixed queue, optionally repeating the last target.
#[derive(Debug)]
pub struct StaticTargets {
    queue: Mutex<VecDeque<Target>>,
    repeat: Option<Target>,
}

impl StaticTargets {
    /// Serves `targets` once each.
    #[must_use]
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            queue: Mutex::new(targets.into()),
            repeat: None,
        }
    }

    /// Serves `target` forever.
    #[must_use]
    pub fn repeating(target: Target) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            repeat: Some(target),
        }
    }
}

#[async_trait]
impl TargetSelector for StaticTargets {
    async fn next_target(&self) -> Option<Target> {
        self.queue
            .lock()
            .pop_front()
            .or_else(|| self.repeat.clone())
    }
}

/// Observing workflow that exposes on the simulated spectrographs.
#[derive(Debug)]
pub struct SimulatedObserver {
    devices: Devices,
    ignore_cancellation: AtomicBool,
    next_failure: Mutex<Option<ObservationFailure>>,
    completed: AtomicU32,
}

impl SimulatedObserver {
    /// Observer commanding `devices`.
    #[must_use]
    pub fn new(devices: Devices) -> Self {
        Self {
            devices,
            ignore_cancellation: AtomicBool::new(false),
            next_failure: Mutex::new(None),
            completed: AtomicU32::new(0),
        }
    }

    /// Simulates a hung workflow that never polls its cancellation token.
    pub fn ignore_cancellation(&self, ignore: bool) {
        self.ignore_cancellation.store(ignore, Ordering::SeqCst);
    }

    /// Makes the next observation fail.
    pub fn fail_next(&self, failure: ObservationFailure) {
        *self.next_failure.lock() = Some(failure);
    }

    /// Observations completed.
    #[must_use]
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObservingWorkflow for SimulatedObserver {
    async fn observe(
        &self,
        target: Target,
        cancel: CancelToken,
    ) -> Result<ObservationOutcome, OverwatcherError> {
        let failure = self.next_failure.lock().take();
        if let Some(kind) = failure {
            return Err(OverwatcherError::Observation {
                kind,
                message: format!("simulated failure observing {}", target.name),
            });
        }
        let exposure = self
            .devices
            .spectrographs
            .expose("object", target.exposure_time);
        if self.ignore_cancellation.load(Ordering::SeqCst) {
            exposure.await?;
        } else {
            tokio::select! {
                result = exposure => result?,
                () = cancel.cancelled() => {
                    let _ = self.devices.guiders.stop_all().await;
                    let _ = self.devices.spectrographs.abort().await;
                    return Err(OverwatcherError::Cancelled);
                }
            }
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ObservationOutcome {
            target,
            exposures: 1,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{args, DeviceClient};

    fn sim() -> Arc<SimulatedObservatory> {
        Arc::new(SimulatedObservatory::new(&DevicesConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn dome_motion_takes_time() {
        let sim = sim();
        sim.set_motion_time(Duration::from_secs(20));
        let start = Instant::now();
        sim.invoke("lvmecp", "open", Args::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(sim.dome(), DomeStatus::Open);
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_faults_are_consumed() {
        let sim = sim();
        let err = DeviceError::Failed {
            device: "lvmscp".into(),
            command: "reset".into(),
            reason: "boom".into(),
        };
        sim.fail_next("lvmscp", "reset", 1, err.clone());
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        assert_eq!(client.reset("lvmscp").await.unwrap_err(), err);
        client.reset("lvmscp").await.unwrap();
        sim.hang_next("lvmscp", "ping", 1);
        assert!(matches!(
            client.ping("lvmscp").await,
            Err(DeviceError::Timeout { .. })
        ));
        assert!(matches!(
            client.ping("nowhere").await,
            Err(DeviceError::Unreachable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exposures_record_lamp_state() {
        let sim = sim();
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        client
            .call("lvm.calib.lamps", "on", args([("lamp", json!("Neon"))]))
            .await
            .unwrap();
        client
            .call_with_timeout(
                "lvmscp",
                "expose",
                args([("flavour", json!("arc")), ("exposure_time", json!(10.0))]),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        let exposures = sim.exposures();
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0].lamps_on, vec!["Neon".to_string()]);
    }

    #[tokio::test]
    async fn scripted_telemetry_fails_then_recovers() {
        let telemetry = ScriptedTelemetry::new();
        telemetry.fail_next(2);
        assert!(telemetry.fetch().await.is_err());
        assert!(telemetry.fetch().await.is_err());
        let snapshot = telemetry.fetch().await.unwrap();
        assert_eq!(snapshot.rain, Some(false));
    }
}
