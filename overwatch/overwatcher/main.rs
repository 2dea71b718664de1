use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use shared_event_bus::{EventPublisher, FileEventPublisher};
use shared_logging::LogLevel;
use tokio::task::JoinHandle;

use crate::{
    config::{secs, ConfigSource, OverwatcherConfig},
    control::{
        observing::{ObservingWorkflow, Target, TargetSelector},
        shutdown::ShutdownHandle,
        Overwatcher, OverwatcherHandle, OverwatcherParts,
    },
    device::{
        sim::{ScriptedTelemetry, SimulatedObservatory, SimulatedObserver, StaticTargets},
        wrappers::Devices,
        DeviceClient, DeviceFacade,
    },
    dome::DomeController,
    ephemeris::{EphemerisSource, FixedEphemeris},
    module::{CancelToken, Clock, Liveness, SystemClock, TokioClock},
    notifier::Notifier,
    safety::{alerts::TelemetrySource, heartbeat::HeartbeatPublisher, SafetyMonitor},
    telemetry::OverwatcherTelemetry,
    troubleshooter::Troubleshooter,
};

/// Handles to the simulated observatory behind a simulated runtime.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// Simulated devices.
    pub observatory: Arc<SimulatedObservatory>,
    /// Scripted weather station.
    pub weather: Arc<ScriptedTelemetry>,
    /// Simulated observing workflow.
    pub observer: Arc<SimulatedObserver>,
}

/// The three long-running components, unstarted.
pub struct RuntimeParts {
    /// Control loop.
    pub overwatcher: Overwatcher,
    /// Safety monitor.
    pub safety: SafetyMonitor,
    /// Heartbeat publisher.
    pub heartbeat: HeartbeatPublisher,
    /// Operator handle.
    pub handle: OverwatcherHandle,
}

/// Fully wired overwatcher.
pub struct OverwatcherRuntime {
    parts: RuntimeParts,
    telemetry: OverwatcherTelemetry,
}

impl OverwatcherRuntime {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> OverwatcherRuntimeBuilder {
        OverwatcherRuntimeBuilder::default()
    }

    /// Runtime driving a simulated observatory from `config`. See
    /// [`OverwatcherRuntimeBuilder::simulated`].
    pub fn simulated(config: OverwatcherConfig, start: DateTime<Utc>) -> Result<(Self, Simulation)> {
        Self::builder().config(config).simulated(start)
    }

    /// Operator handle.
    #[must_use]
    pub fn handle(&self) -> OverwatcherHandle {
        self.parts.handle.clone()
    }

    /// Safety monitor.
    #[must_use]
    pub const fn safety(&self) -> &SafetyMonitor {
        &self.parts.safety
    }

    /// Splits the runtime for callers that drive the components themselves.
    #[must_use]
    pub fn into_parts(self) -> RuntimeParts {
        self.parts
    }

    /// Spawns the control loop, safety monitor and heartbeat publisher.
    #[must_use]
    pub fn spawn(self, cancel: CancelToken) -> RuntimeTasks {
        let RuntimeParts {
            overwatcher,
            safety,
            heartbeat,
            handle: _,
        } = self.parts;
        let _ = self
            .telemetry
            .log(LogLevel::Info, "runtime.started", json!({}));
        RuntimeTasks {
            tasks: vec![
                ("safety", tokio::spawn(safety.run(cancel.clone()))),
                ("heartbeat", tokio::spawn(heartbeat.run(cancel.clone()))),
                ("control", tokio::spawn(overwatcher.run(cancel))),
            ],
        }
    }
}

/// Spawned runtime tasks.
#[derive(Debug)]
pub struct RuntimeTasks {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RuntimeTasks {
    /// Waits for every task to stop.
    pub async fn join(self) -> Result<()> {
        for (name, task) in self.tasks {
            task.await
                .with_context(|| format!("{name} task ended abnormally"))?;
        }
        Ok(())
    }
}

/// Builder for [`OverwatcherRuntime`].
#[derive(Default)]
pub struct OverwatcherRuntimeBuilder {
    config: Option<OverwatcherConfig>,
    config_path: Option<PathBuf>,
    log_file: Option<PathBuf>,
    facade: Option<Arc<dyn DeviceFacade>>,
    weather: Option<Arc<dyn TelemetrySource>>,
    selector: Option<Arc<dyn TargetSelector>>,
    workflow: Option<Arc<dyn ObservingWorkflow>>,
    ephemeris: Option<Arc<dyn EphemerisSource>>,
    clock: Option<Arc<dyn Clock>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl OverwatcherRuntimeBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: OverwatcherConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads the configuration from a file that `reload-config` re-reads.
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = OverwatcherConfig::load(path).context("loading overwatcher configuration")?;
        self.config = Some(config);
        self.config_path = Some(path.to_path_buf());
        Ok(self)
    }

    /// Also writes every log record to a single JSON-lines file.
    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Sets the device facade.
    #[must_use]
    pub fn devices(mut self, facade: Arc<dyn DeviceFacade>) -> Self {
        self.facade = Some(facade);
        self
    }

    /// Sets the environmental telemetry source.
    #[must_use]
    pub fn telemetry_source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.weather = Some(source);
        self
    }

    /// Sets the target selector.
    #[must_use]
    pub fn selector(mut self, selector: Arc<dyn TargetSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Sets the observing workflow.
    #[must_use]
    pub fn workflow(mut self, workflow: Arc<dyn ObservingWorkflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Sets the ephemeris source.
    #[must_use]
    pub fn ephemeris(mut self, ephemeris: Arc<dyn EphemerisSource>) -> Self {
        self.ephemeris = Some(ephemeris);
        self
    }

    /// Sets the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Publishes events to `publisher` instead of the configured event log.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds a runtime around a simulated observatory. Wall-clock time
    /// starts at `start` and follows the tokio clock, so paused-time tests can
    /// move through a night.
    pub fn simulated(self, start: DateTime<Utc>) -> Result<(OverwatcherRuntime, Simulation)> {
        let devices_config = self.config.clone().unwrap_or_default().devices;
        let observatory = Arc::new(SimulatedObservatory::new(&devices_config));
        let weather = Arc::new(ScriptedTelemetry::new());
        let devices = Devices::new(
            DeviceClient::new(observatory.clone(), secs(devices_config.command_timeout)),
            &devices_config,
        );
        let observer = Arc::new(SimulatedObserver::new(devices));
        let runtime = self
            .devices(observatory.clone())
            .telemetry_source(weather.clone())
            .selector(Arc::new(StaticTargets::repeating(Target::named(
                "sim-field",
                120.0,
            ))))
            .workflow(observer.clone())
            .ephemeris(Arc::new(FixedEphemeris::default()))
            .clock(Arc::new(TokioClock::starting_at(start)))
            .build()?;
        Ok((
            runtime,
            Simulation {
                observatory,
                weather,
                observer,
            },
        ))
    }

    /// Builds the runtime.
    pub fn build(self) -> Result<OverwatcherRuntime> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let Some(facade) = self.facade else {
            bail!("no device facade configured");
        };
        let Some(weather) = self.weather else {
            bail!("no environmental telemetry source configured");
        };
        let Some(selector) = self.selector else {
            bail!("no target selector configured");
        };
        let Some(workflow) = self.workflow else {
            bail!("no observing workflow configured");
        };

        let mut telemetry = OverwatcherTelemetry::builder("overwatcher");
        if let Some(path) = self.log_file {
            telemetry = telemetry.log_path(path);
        }
        if let Some(dir) = &config.logging.dir {
            telemetry = telemetry.nightly_logs(dir, config.logging.prefix.clone());
        }
        let publisher = match (self.event_publisher, &config.logging.event_log) {
            (Some(publisher), _) => Some(publisher),
            (None, Some(path)) => Some(Arc::new(
                FileEventPublisher::new(path).context("opening the event log")?,
            ) as Arc<dyn EventPublisher>),
            (None, None) => None,
        };
        if let Some(publisher) = publisher {
            telemetry = telemetry.event_publisher(publisher);
        }
        let telemetry = telemetry.build()?;

        let client = DeviceClient::new(facade, secs(config.devices.command_timeout));
        let devices = Devices::new(client, &config.devices);
        let notifier = Notifier::new(
            telemetry.scoped("notifier"),
            secs(config.notifications.cooldown),
        );
        let (tx, config_rx) = config.into_watch();
        let source = Arc::new(ConfigSource::new(self.config_path, tx));
        let shutdown = ShutdownHandle::new();
        let liveness = Liveness::new();

        let dome = DomeController::new(
            devices.enclosure.clone(),
            config_rx.clone(),
            notifier.clone(),
            telemetry.scoped("dome"),
        );
        let safety = SafetyMonitor::new(
            weather,
            dome.clone(),
            shutdown.clone(),
            notifier.clone(),
            telemetry.scoped("safety"),
            config_rx.clone(),
        );
        let heartbeat = HeartbeatPublisher::new(
            devices.heartbeat.clone(),
            liveness.clone(),
            safety.clone(),
            shutdown.clone(),
            telemetry.scoped("heartbeat"),
            config_rx.clone(),
        );
        let troubleshooter = Troubleshooter::new(
            devices.clone(),
            config_rx.clone(),
            telemetry.scoped("troubleshooter"),
        );
        let (overwatcher, handle) = Overwatcher::new(OverwatcherParts {
            config: config_rx,
            config_source: Some(source),
            devices,
            dome,
            safety: safety.clone(),
            troubleshooter,
            selector,
            workflow,
            ephemeris: self
                .ephemeris
                .unwrap_or_else(|| Arc::new(FixedEphemeris::default())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            shutdown,
            notifier,
            liveness,
            telemetry: telemetry.scoped("control"),
        });
        Ok(OverwatcherRuntime {
            parts: RuntimeParts {
                overwatcher,
                safety,
                heartbeat,
                handle,
            },
            telemetry,
        })
    }
}

/// Stops the runtime and waits up to `grace` for its tasks.
pub async fn stop(tasks: RuntimeTasks, cancel: &CancelToken, grace: Duration) -> Result<()> {
    cancel.cancel();
    tokio::time::timeout(grace, tasks.join())
        .await
        .context("runtime did not stop in time")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{control::CommandReply, device::wrappers::DomeStatus};
    use chrono::TimeZone;
    use shared_event_bus::{EventKind, MemoryEventBus};
    use tempfile::tempdir;

    #[test]
    fn build_requires_the_observing_seams() {
        let err = OverwatcherRuntime::builder()
            .devices(Arc::new(SimulatedObservatory::new(
                &OverwatcherConfig::default().devices,
            )))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("telemetry source"));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_runtime_reloads_its_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overwatcher.toml");
        std::fs::write(&path, "[control]\ndry_run = false\n").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (runtime, _simulation) = OverwatcherRuntime::builder()
            .config_path(&path)
            .unwrap()
            .simulated(start)
            .unwrap();
        let handle = runtime.handle();
        let cancel = CancelToken::new();
        let tasks = runtime.spawn(cancel.clone());

        std::fs::write(&path, "[control]\ndry_run = true\n").unwrap();
        assert_eq!(
            handle.reload_config().await.unwrap(),
            CommandReply::ConfigReloaded
        );
        assert!(handle.status_reader().snapshot().dry_run);

        std::fs::write(&path, "[control]\ntick_interval = 0.0\n").unwrap();
        let reply = handle.reload_config().await.unwrap();
        assert!(matches!(reply, CommandReply::Rejected { .. }));
        assert!(handle.status_reader().snapshot().dry_run);

        stop(tasks, &cancel, Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_runtime_beats_and_publishes_events() {
        let dir = tempdir().unwrap();
        let mut config = OverwatcherConfig::default();
        config.control.preflight_bias = false;
        config.calibrations.day_tasks = false;
        config.logging.dir = Some(dir.path().to_path_buf());
        let bus = Arc::new(MemoryEventBus::new(256));
        let observatory = Arc::new(SimulatedObservatory::new(&config.devices));
        let devices = Devices::new(
            DeviceClient::new(observatory.clone(), Duration::from_secs(30)),
            &config.devices,
        );
        let start = Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap();
        let runtime = OverwatcherRuntime::builder()
            .config(config)
            .devices(observatory.clone())
            .telemetry_source(Arc::new(ScriptedTelemetry::new()))
            .selector(Arc::new(StaticTargets::repeating(Target::named("field", 60.0))))
            .workflow(Arc::new(SimulatedObserver::new(devices)))
            .clock(Arc::new(TokioClock::starting_at(start)))
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let handle = runtime.handle();
        let cancel = CancelToken::new();
        let tasks = runtime.spawn(cancel.clone());

        let reply = handle.enable().await.unwrap();
        assert!(matches!(reply, CommandReply::Accepted { .. }));
        tokio::time::sleep(Duration::from_secs(180)).await;

        assert_eq!(observatory.dome(), DomeStatus::Open);
        assert!(observatory.beats() >= 10);
        assert!(!bus.of_kind(EventKind::StateTransition).is_empty());
        assert!(!bus.of_kind(EventKind::DomeOpen).is_empty());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_some());

        stop(tasks, &cancel, Duration::from_secs(60)).await.unwrap();
        assert!(handle.status().await.is_err());
    }
}
