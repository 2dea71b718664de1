//! TOML configuration for the overwatcher.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Durations are expressed in seconds unless the field name says otherwise.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    calibration::{
        schedule::{SequenceRef, TaskDefinition},
        sequence::{CalibrationSequence, SequenceDefaults},
    },
    errors::ConfigError,
    troubleshooter::{recipes::RecipeStep, FailureSignature},
};

/// Receiver side of the live configuration.
pub type ConfigWatch = watch::Receiver<Arc<OverwatcherConfig>>;

/// Converts seconds to a [`Duration`], clamping invalid values to zero.
#[must_use]
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverwatcherConfig {
    /// Control loop settings.
    pub control: ControlConfig,
    /// Safety monitor settings.
    pub safety: SafetyConfig,
    /// Heartbeat publisher settings.
    pub heartbeat: HeartbeatConfig,
    /// Notification settings.
    pub notifications: NotificationConfig,
    /// Dome controller settings.
    pub dome: DomeConfig,
    /// Troubleshooter settings.
    pub troubleshooter: TroubleshooterConfig,
    /// Calibration scheduler settings.
    pub calibrations: CalibrationsConfig,
    /// Remote device identifiers.
    pub devices: DevicesConfig,
    /// Night identifier settings.
    pub night: NightConfig,
    /// Structured log output.
    pub logging: LoggingConfig,
}

impl OverwatcherConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading overwatcher config {}", path.display()))?;
        let config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("control.tick_interval", self.control.tick_interval),
            ("control.shutdown_grace", self.control.shutdown_grace),
            ("safety.interval", self.safety.interval),
            ("heartbeat.interval", self.heartbeat.interval),
            ("heartbeat.stall_timeout", self.heartbeat.stall_timeout),
            ("dome.open_timeout", self.dome.open_timeout),
            ("dome.close_timeout", self.dome.close_timeout),
            ("dome.forced_close_timeout", self.dome.forced_close_timeout),
            ("troubleshooter.window", self.troubleshooter.window),
            ("devices.command_timeout", self.devices.command_timeout),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        let non_negative = [
            ("control.confirm_backoff", self.control.confirm_backoff),
            ("safety.grace_window", self.safety.grace_window),
            ("safety.clear_debounce", self.safety.clear_debounce),
            ("notifications.cooldown", self.notifications.cooldown),
            ("calibrations.retry_backoff", self.calibrations.retry_backoff),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must not be negative")));
            }
        }
        if self.safety.telemetry_failure_limit == 0 {
            return Err(ConfigError::Invalid(
                "safety.telemetry_failure_limit must be at least 1".into(),
            ));
        }
        if self.heartbeat.missed_limit == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.missed_limit must be at least 1".into(),
            ));
        }
        if self.troubleshooter.budget == 0 {
            return Err(ConfigError::Invalid(
                "troubleshooter.budget must be at least 1".into(),
            ));
        }
        if self.devices.telescopes.is_empty() {
            return Err(ConfigError::Invalid("devices.telescopes is empty".into()));
        }
        self.calibrations.validate()
    }

    /// Monotonic tick interval of the control loop.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        secs(self.control.tick_interval)
    }

    /// Creates the watch channel used to publish configuration reloads.
    #[must_use]
    pub fn into_watch(self) -> (watch::Sender<Arc<Self>>, ConfigWatch) {
        watch::channel(Arc::new(self))
    }
}

/// Re-reads a configuration file and publishes it to running components.
#[derive(Debug)]
pub struct ConfigSource {
    path: Option<PathBuf>,
    tx: watch::Sender<Arc<OverwatcherConfig>>,
}

impl ConfigSource {
    /// Wraps a sender, optionally bound to the file it was loaded from.
    #[must_use]
    pub const fn new(path: Option<PathBuf>, tx: watch::Sender<Arc<OverwatcherConfig>>) -> Self {
        Self { path, tx }
    }

    /// New receiver of the live configuration.
    #[must_use]
    pub fn subscribe(&self) -> ConfigWatch {
        self.tx.subscribe()
    }

    /// Current configuration.
    #[must_use]
    pub fn current(&self) -> Arc<OverwatcherConfig> {
        Arc::clone(&*self.tx.borrow())
    }

    /// Reloads the file. Without a bound file the current configuration is
    /// republished unchanged.
    pub fn reload(&self) -> Result<Arc<OverwatcherConfig>> {
        let config = match &self.path {
            Some(path) => Arc::new(OverwatcherConfig::load(path)?),
            None => self.current(),
        };
        self.tx.send_replace(Arc::clone(&config));
        Ok(config)
    }
}

/// `[control]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Seconds between decision cycles.
    pub tick_interval: f64,
    /// Seconds an in-flight operation gets to unwind after cancellation.
    pub shutdown_grace: f64,
    /// Attempts to confirm dome closed and telescopes parked.
    pub confirm_retries: u32,
    /// Base backoff between confirmation attempts; doubles each attempt.
    pub confirm_backoff: f64,
    /// Seconds before sunset during which the night counts as imminent.
    pub imminent_night_window: f64,
    /// Take a bias frame as part of the pre-flight check.
    pub preflight_bias: bool,
    /// Make decisions without touching hardware.
    pub dry_run: bool,
    /// Allow calibrations at start-up.
    pub allow_calibrations: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval: 5.0,
            shutdown_grace: 30.0,
            confirm_retries: 3,
            confirm_backoff: 5.0,
            imminent_night_window: 3_600.0,
            preflight_bias: true,
            dry_run: false,
            allow_calibrations: true,
        }
    }
}

/// Thresholds that turn environmental readings into alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Relative humidity (percent) above which the dome must close.
    pub humidity_max: f64,
    /// Minimum distance (degrees C) between ambient temperature and dew point.
    pub dew_point_margin: f64,
    /// Sustained wind speed (mph) limit.
    pub wind_speed_max: f64,
    /// Wind gust (mph) limit.
    pub wind_gust_max: f64,
    /// Oxygen concentration (percent) below which the building is unsafe.
    pub oxygen_min: f64,
    /// Zero point (mag) above which transparency is too poor to observe.
    pub zero_point_max: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            humidity_max: 80.0,
            dew_point_margin: 1.0,
            wind_speed_max: 35.0,
            wind_gust_max: 45.0,
            oxygen_min: 19.5,
            zero_point_max: -22.25,
        }
    }
}

/// `[safety]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Seconds between evaluations.
    pub interval: f64,
    /// Seconds the control loop gets to close the dome before a forced close.
    pub grace_window: f64,
    /// Seconds a signal must stay nominal before its alert clears.
    pub clear_debounce: f64,
    /// Consecutive telemetry failures before the monitor declares itself blind.
    pub telemetry_failure_limit: u32,
    /// Alert thresholds.
    pub thresholds: AlertThresholds,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            interval: 10.0,
            grace_window: 600.0,
            clear_debounce: 300.0,
            telemetry_failure_limit: 5,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// `[heartbeat]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds between beats.
    pub interval: f64,
    /// Consecutive missed beats treated as a critical alert.
    pub missed_limit: u32,
    /// Seconds without a completed decision cycle before the loop counts as stalled.
    pub stall_timeout: f64,
    /// Component identifier published with each beat.
    pub component: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: 5.0,
            missed_limit: 3,
            stall_timeout: 300.0,
            component: "overwatcher".into(),
        }
    }
}

/// `[notifications]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Seconds during which identical notifications are suppressed.
    pub cooldown: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { cooldown: 900.0 }
    }
}

/// `[dome]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomeConfig {
    /// Seconds allowed for an open.
    pub open_timeout: f64,
    /// Seconds allowed for a normal close.
    pub close_timeout: f64,
    /// Seconds allowed for an overcurrent close.
    pub forced_close_timeout: f64,
}

impl Default for DomeConfig {
    fn default() -> Self {
        Self {
            open_timeout: 300.0,
            close_timeout: 300.0,
            forced_close_timeout: 300.0,
        }
    }
}

/// `[troubleshooter]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TroubleshooterConfig {
    /// Recovery attempts allowed per signature within the window.
    pub budget: u32,
    /// Sliding window (seconds) over which identical failures are counted.
    pub window: f64,
    /// Recipe overrides keyed by failure signature.
    pub recipes: IndexMap<FailureSignature, Vec<RecipeStep>>,
}

impl Default for TroubleshooterConfig {
    fn default() -> Self {
        Self {
            budget: 3,
            window: 3_600.0,
            recipes: IndexMap::new(),
        }
    }
}

/// `[calibrations]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationsConfig {
    /// Retries before a failed task becomes `Failed`.
    pub max_retries: u32,
    /// Seconds a failed task waits before becoming eligible again.
    pub retry_backoff: f64,
    /// Include the built-in pre- and post-observing day tasks.
    pub day_tasks: bool,
    /// Defaults filled into sequences.
    pub defaults: SequenceDefaults,
    /// Named sequences referenced by tasks.
    pub sequences: IndexMap<String, CalibrationSequence>,
    /// Task definitions.
    pub tasks: Vec<TaskDefinition>,
}

impl Default for CalibrationsConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff: 300.0,
            day_tasks: true,
            defaults: SequenceDefaults::default(),
            sequences: IndexMap::new(),
            tasks: Vec::new(),
        }
    }
}

impl CalibrationsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, sequence) in &self.sequences {
            sequence
                .validate()
                .map_err(|err| ConfigError::Invalid(format!("sequence '{name}': {err}")))?;
        }
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate calibration task '{}'",
                    task.name
                )));
            }
            if self.day_tasks && TaskDefinition::is_builtin(&task.name) {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' clashes with a built-in day task",
                    task.name
                )));
            }
            if task
                .max_start_offset
                .is_some_and(|latest| latest < task.start_offset)
            {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' has its latest start before its earliest start",
                    task.name
                )));
            }
            if task.sequence.is_some() == task.recipe.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' needs exactly one of sequence or recipe",
                    task.name
                )));
            }
            match &task.sequence {
                Some(SequenceRef::Named(name)) if !self.sequences.contains_key(name) => {
                    return Err(ConfigError::Invalid(format!(
                        "task '{}' references unknown sequence '{name}'",
                        task.name
                    )));
                }
                Some(SequenceRef::Inline(sequence)) => {
                    sequence.validate().map_err(|err| {
                        ConfigError::Invalid(format!("task '{}': {err}", task.name))
                    })?;
                }
                _ => {}
            }
            if task.cadence_nights == 0 {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' has a zero cadence",
                    task.name
                )));
            }
        }
        for task in &self.tasks {
            if let Some(after) = &task.after {
                let builtin = self.day_tasks && TaskDefinition::is_builtin(after);
                if !names.contains(after.as_str()) && !builtin {
                    return Err(ConfigError::Invalid(format!(
                        "task '{}' runs after unknown task '{after}'",
                        task.name
                    )));
                }
            }
        }
        self.check_dependency_cycles()
    }

    /// Each task has at most one predecessor, so a chain longer than the task
    /// list loops.
    fn check_dependency_cycles(&self) -> Result<(), ConfigError> {
        let after: HashMap<&str, &str> = self
            .tasks
            .iter()
            .filter_map(|task| Some((task.name.as_str(), task.after.as_deref()?)))
            .collect();
        for task in &self.tasks {
            let mut current = task.name.as_str();
            for _ in 0..self.tasks.len() {
                match after.get(current) {
                    Some(&next) if next == task.name => {
                        return Err(ConfigError::Invalid(format!(
                            "task '{}' depends on itself through 'after'",
                            task.name
                        )));
                    }
                    Some(&next) => current = next,
                    None => break,
                }
            }
        }
        Ok(())
    }
}

/// `[devices]` section: actor identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Enclosure controller.
    pub enclosure: String,
    /// Telescope mounts.
    pub telescopes: Vec<String>,
    /// Guiders.
    pub guiders: Vec<String>,
    /// Spectrograph controller.
    pub spectrographs: String,
    /// Calibration lamp power switch.
    pub calibration_lamps: String,
    /// Power switch holding the camera outlets.
    pub power_switch: String,
    /// Fibre selector mechanism.
    pub fibre_selector: String,
    /// Heartbeat service.
    pub heartbeat: String,
    /// Default command timeout in seconds.
    pub command_timeout: f64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            enclosure: "lvmecp".into(),
            telescopes: ["sci", "spec", "skye", "skyw"]
                .iter()
                .map(|tel| format!("lvm.{tel}.pwi"))
                .collect(),
            guiders: ["sci", "spec", "skye", "skyw"]
                .iter()
                .map(|tel| format!("lvm.{tel}.guider"))
                .collect(),
            spectrographs: "lvmscp".into(),
            calibration_lamps: "lvm.calib.lamps".into(),
            power_switch: "lvmnps".into(),
            fibre_selector: "lvm.spec.fibsel".into(),
            heartbeat: "lvmbeat".into(),
            command_timeout: 30.0,
        }
    }
}

/// `[night]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NightConfig {
    /// Fraction of a day added to the MJD before truncation.
    pub rollover_days: f64,
}

impl Default for NightConfig {
    fn default() -> Self {
        Self { rollover_days: 0.4 }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for night-keyed JSON logs; disabled when absent.
    pub dir: Option<PathBuf>,
    /// Log file prefix.
    pub prefix: String,
    /// JSON-lines event log; disabled when absent.
    pub event_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: "overwatcher".into(),
            event_log: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_is_valid() {
        let config = OverwatcherConfig::from_toml_str("").unwrap();
        assert_eq!(config, OverwatcherConfig::default());
        assert_eq!(config.tick_interval(), Duration::from_secs(5));
    }

    #[test]
    fn parses_sections_and_tasks() {
        let raw = r#"
            [safety]
            grace_window = 10
            thresholds = { humidity_max = 75.0 }

            [troubleshooter]
            budget = 2
            recipes = { exposure_stuck = [{ action = "abort_exposures" }] }

            [calibrations.sequences.arcs]
            lamps = { Neon = { exposure_time = [10, 20] } }

            [[calibrations.tasks]]
            name = "evening_arcs"
            sequence = "arcs"
            anchor = "sunset"
            start_offset = -60
        "#;
        let config = OverwatcherConfig::from_toml_str(raw).unwrap();
        assert!((config.safety.grace_window - 10.0).abs() < f64::EPSILON);
        assert!((config.safety.thresholds.humidity_max - 75.0).abs() < f64::EPSILON);
        assert_eq!(config.troubleshooter.budget, 2);
        assert_eq!(
            config.troubleshooter.recipes[&FailureSignature::ExposureStuck],
            vec![RecipeStep::AbortExposures]
        );
        assert_eq!(config.calibrations.tasks[0].name, "evening_arcs");
    }

    #[test]
    fn rejects_unknown_dependencies_and_sequences() {
        let raw = r#"
            [[calibrations.tasks]]
            name = "flats"
            sequence = { biases = { count = 1 } }
            after = "missing"
        "#;
        assert!(matches!(
            OverwatcherConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
        let raw = r#"
            [[calibrations.tasks]]
            name = "flats"
            sequence = "nope"
        "#;
        assert!(OverwatcherConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn rejects_tasks_shadowing_day_tasks() {
        let raw = r#"
            [[calibrations.tasks]]
            name = "post_observing"
            sequence = { biases = { count = 1 } }
        "#;
        assert!(matches!(
            OverwatcherConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(message)) if message.contains("built-in")
        ));
        let raw = format!("[calibrations]\nday_tasks = false\n{raw}");
        assert!(OverwatcherConfig::from_toml_str(&raw).is_ok());
    }

    #[test]
    fn rejects_after_cycles() {
        let raw = r#"
            [[calibrations.tasks]]
            name = "arcs"
            sequence = { biases = { count = 1 } }
            after = "flats"

            [[calibrations.tasks]]
            name = "flats"
            sequence = { biases = { count = 1 } }
            after = "darks"

            [[calibrations.tasks]]
            name = "darks"
            sequence = { biases = { count = 1 } }
            after = "arcs"
        "#;
        assert!(matches!(
            OverwatcherConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(message)) if message.contains("depends on itself")
        ));
    }

    #[test]
    fn rejects_inverted_start_windows() {
        let raw = r#"
            [[calibrations.tasks]]
            name = "twilight_flats"
            sequence = { biases = { count = 1 } }
            anchor = "sunset"
            start_offset = 10
            max_start_offset = -5
        "#;
        assert!(matches!(
            OverwatcherConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(message)) if message.contains("latest start")
        ));
    }

    #[test]
    fn rejects_zero_intervals() {
        let raw = "[control]\ntick_interval = 0\n";
        assert!(matches!(
            OverwatcherConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(message)) if message.contains("tick_interval")
        ));
    }

    #[test]
    fn reload_publishes_new_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overwatcher.toml");
        fs::write(&path, "[control]\ndry_run = false\n").unwrap();
        let config = OverwatcherConfig::load(&path).unwrap();
        let (tx, rx) = config.into_watch();
        let source = ConfigSource::new(Some(path.clone()), tx);
        fs::write(&path, "[control]\ndry_run = true\n").unwrap();
        source.reload().unwrap();
        assert!(rx.borrow().control.dry_run);
    }
}
