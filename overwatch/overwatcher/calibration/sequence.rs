//! Calibration sequence schema, planning and execution.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tracing::instrument;

use crate::{
    config::secs,
    device::wrappers::Devices,
    errors::{DeviceError, SequenceError},
    module::CancelToken,
    telemetry::OverwatcherTelemetry,
};

/// A scalar or a list of exposure times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExposureTimes {
    /// Single exposure time.
    One(f64),
    /// Several exposure times, taken in order.
    Many(Vec<f64>),
}

impl ExposureTimes {
    /// Exposure times as a list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            Self::One(time) => vec![*time],
            Self::Many(times) => times.clone(),
        }
    }
}

const fn one() -> u32 {
    1
}

/// Bias frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BiasSpec {
    /// Number of frames.
    #[serde(default = "one")]
    pub count: u32,
}

/// Dark frames, `count` per exposure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DarkSpec {
    /// Frames per exposure time.
    #[serde(default = "one")]
    pub count: u32,
    /// Exposure times.
    #[serde(alias = "exposureTime")]
    pub exposure_time: ExposureTimes,
}

/// One or several fibre selector positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Positions {
    /// Single position.
    One(String),
    /// Positions visited in order.
    Many(Vec<String>),
}

impl Positions {
    fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(position) => vec![position.clone()],
            Self::Many(positions) => positions.clone(),
        }
    }
}

/// Detailed fibre selector options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FibselOptions {
    /// Positions to step through.
    pub positions: Option<Positions>,
    /// Position before the exposure starts; defaults to the first position.
    pub initial_position: Option<String>,
    /// Seconds per position; defaults to the exposure time split evenly.
    pub time_per_position: Option<f64>,
}

/// Fibre selector stepping for a lamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FibselSpec {
    /// `true` steps with the default positions.
    Enabled(bool),
    /// Explicit options.
    Detailed(FibselOptions),
}

/// One lamp of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LampSpec {
    /// Warm-up in seconds before the first exposure.
    pub warmup: Option<f64>,
    /// Exposure times.
    #[serde(alias = "exposureTime")]
    pub exposure_time: ExposureTimes,
    /// Image type; defaults per lamp.
    pub flavour: Option<String>,
    /// Fibre selector stepping.
    pub fibsel: Option<FibselSpec>,
}

/// A calibration sequence: biases, darks, then lamps in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationSequence {
    /// Bias frames.
    pub biases: Option<BiasSpec>,
    /// Dark frames.
    pub darks: Option<DarkSpec>,
    /// Lamps.
    #[serde(default)]
    pub lamps: IndexMap<String, LampSpec>,
}

/// Fibre selector defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FibselDefaults {
    /// Positions stepped through when a lamp only sets `fibsel = true`.
    pub positions: Vec<String>,
    /// Initial position.
    pub initial_position: String,
}

impl Default for FibselDefaults {
    fn default() -> Self {
        Self {
            positions: (1..=12).map(|n| format!("P1-{n}")).collect(),
            initial_position: "P1-1".into(),
        }
    }
}

/// Values filled into sequences that leave them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceDefaults {
    /// Lamp warm-up in seconds.
    pub warmup: f64,
    /// Flavour per lamp, keyed by lowercase lamp name.
    pub flavours: IndexMap<String, String>,
    /// Fibre selector defaults.
    pub fibsel: FibselDefaults,
}

impl Default for SequenceDefaults {
    fn default() -> Self {
        let flavours = [
            ("argon", "arc"),
            ("neon", "arc"),
            ("hgne", "arc"),
            ("xenon", "arc"),
            ("quartz", "flat"),
            ("ldls", "flat"),
        ]
        .into_iter()
        .map(|(lamp, flavour)| (lamp.to_string(), flavour.to_string()))
        .collect();
        Self {
            warmup: 120.0,
            flavours,
            fibsel: FibselDefaults::default(),
        }
    }
}

/// Fibre selector motion during one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct FibselPlan {
    /// Position set before the exposure.
    pub initial_position: String,
    /// Positions visited while exposing.
    pub positions: Vec<String>,
    /// Seconds spent at each position.
    pub time_per_position: f64,
}

/// A single step of a planned sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    /// Bias frame.
    Bias,
    /// Dark frame.
    Dark {
        /// Seconds.
        exposure_time: f64,
    },
    /// Switch a lamp on.
    LampOn {
        /// Lamp name.
        lamp: String,
    },
    /// Wait for a lamp to stabilise.
    Warmup {
        /// Lamp name.
        lamp: String,
        /// Seconds.
        duration: f64,
    },
    /// Lamp exposure.
    Expose {
        /// Lamp name.
        lamp: String,
        /// Image type.
        flavour: String,
        /// Seconds.
        exposure_time: f64,
        /// Fibre selector stepping.
        fibsel: Option<FibselPlan>,
    },
    /// Switch a lamp off.
    LampOff {
        /// Lamp name.
        lamp: String,
    },
}

fn invalid(message: impl Into<String>) -> SequenceError {
    SequenceError::Invalid(message.into())
}

fn check_times(what: &str, times: &ExposureTimes) -> Result<(), SequenceError> {
    let times = times.to_vec();
    if times.is_empty() {
        return Err(invalid(format!("{what}: no exposure times")));
    }
    if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
        return Err(invalid(format!("{what}: exposure times must be non-negative")));
    }
    Ok(())
}

impl CalibrationSequence {
    /// Checks the parts of the sequence that do not depend on defaults.
    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.biases.is_none() && self.darks.is_none() && self.lamps.is_empty() {
            return Err(invalid("sequence is empty"));
        }
        if self.biases.as_ref().is_some_and(|b| b.count == 0) {
            return Err(invalid("biases: count must be at least 1"));
        }
        if let Some(darks) = &self.darks {
            if darks.count == 0 {
                return Err(invalid("darks: count must be at least 1"));
            }
            check_times("darks", &darks.exposure_time)?;
        }
        for (lamp, spec) in &self.lamps {
            check_times(lamp, &spec.exposure_time)?;
            if spec.warmup.is_some_and(|w| !w.is_finite() || w < 0.0) {
                return Err(invalid(format!("{lamp}: warmup must be non-negative")));
            }
            if let Some(FibselSpec::Detailed(options)) = &spec.fibsel {
                if matches!(&options.positions, Some(Positions::Many(p)) if p.is_empty()) {
                    return Err(invalid(format!("{lamp}: empty fibre selector positions")));
                }
                if options.time_per_position.is_some_and(|t| t <= 0.0) {
                    return Err(invalid(format!("{lamp}: time_per_position must be positive")));
                }
            }
        }
        Ok(())
    }

    /// Expands the sequence into steps, filling gaps from `defaults`.
    pub fn plan(&self, defaults: &SequenceDefaults) -> Result<Vec<CalibrationStep>, SequenceError> {
        self.validate()?;
        let mut steps = Vec::new();
        if let Some(biases) = &self.biases {
            steps.extend((0..biases.count).map(|_| CalibrationStep::Bias));
        }
        if let Some(darks) = &self.darks {
            for exposure_time in darks.exposure_time.to_vec() {
                steps.extend((0..darks.count).map(|_| CalibrationStep::Dark { exposure_time }));
            }
        }
        for (lamp, spec) in &self.lamps {
            let flavour = spec
                .flavour
                .clone()
                .or_else(|| defaults.flavours.get(&lamp.to_lowercase()).cloned())
                .ok_or_else(|| invalid(format!("{lamp}: no flavour and no default")))?;
            steps.push(CalibrationStep::LampOn { lamp: lamp.clone() });
            steps.push(CalibrationStep::Warmup {
                lamp: lamp.clone(),
                duration: spec.warmup.unwrap_or(defaults.warmup),
            });
            for exposure_time in spec.exposure_time.to_vec() {
                steps.push(CalibrationStep::Expose {
                    lamp: lamp.clone(),
                    flavour: flavour.clone(),
                    exposure_time,
                    fibsel: fibsel_plan(spec.fibsel.as_ref(), defaults, exposure_time),
                });
            }
            steps.push(CalibrationStep::LampOff { lamp: lamp.clone() });
        }
        Ok(steps)
    }
}

fn fibsel_plan(
    spec: Option<&FibselSpec>,
    defaults: &SequenceDefaults,
    exposure_time: f64,
) -> Option<FibselPlan> {
    let options = match spec? {
        FibselSpec::Enabled(false) => return None,
        FibselSpec::Enabled(true) => FibselOptions::default(),
        FibselSpec::Detailed(options) => options.clone(),
    };
    let positions = options
        .positions
        .as_ref()
        .map_or_else(|| defaults.fibsel.positions.clone(), Positions::to_vec);
    let initial_position = options
        .initial_position
        .or_else(|| match options.positions {
            Some(Positions::Many(_)) => positions.first().cloned(),
            _ => None,
        })
        .unwrap_or_else(|| defaults.fibsel.initial_position.clone());
    let count = u32::try_from(positions.len().max(1)).unwrap_or(u32::MAX);
    let time_per_position = options
        .time_per_position
        .unwrap_or_else(|| exposure_time / f64::from(count));
    Some(FibselPlan {
        initial_position,
        positions,
        time_per_position,
    })
}

/// Summary of an executed sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReport {
    /// Sequence name.
    pub name: String,
    /// Exposures taken.
    pub exposures: u32,
}

/// Executes calibration sequences on the calibration hardware.
#[derive(Debug, Clone)]
pub struct SequenceRunner {
    devices: Devices,
    telemetry: OverwatcherTelemetry,
}

impl SequenceRunner {
    /// Runner commanding `devices`.
    #[must_use]
    pub const fn new(devices: Devices, telemetry: OverwatcherTelemetry) -> Self {
        Self { devices, telemetry }
    }

    /// Runs `sequence`. Lamps are switched off before starting and on every
    /// exit path; cancellation aborts the exposure in progress.
    #[instrument(skip(self, sequence, defaults, cancel))]
    pub async fn run(
        &self,
        name: &str,
        sequence: &CalibrationSequence,
        defaults: &SequenceDefaults,
        cancel: &CancelToken,
    ) -> Result<SequenceReport, SequenceError> {
        let steps = sequence.plan(defaults)?;
        self.devices.lamps.all_off().await?;
        self.log(
            LogLevel::Info,
            "calibration.sequence.started",
            json!({ "sequence": name, "steps": steps.len() }),
        );
        let result = tokio::select! {
            result = self.execute(&steps) => result.map_err(SequenceError::from),
            () = cancel.cancelled() => {
                let _ = self.devices.spectrographs.abort().await;
                Err(SequenceError::Cancelled)
            }
        };
        let lamps_off = self.devices.lamps.all_off().await;
        match (&result, lamps_off) {
            (Ok(_), Err(err)) => return Err(err.into()),
            (Err(_), Err(err)) => self.log(
                LogLevel::Error,
                "calibration.sequence.lamps_off_failed",
                json!({ "sequence": name, "error": err.to_string() }),
            ),
            _ => {}
        }
        let exposures = result?;
        self.log(
            LogLevel::Info,
            "calibration.sequence.finished",
            json!({ "sequence": name, "exposures": exposures }),
        );
        Ok(SequenceReport {
            name: name.to_string(),
            exposures,
        })
    }

    async fn execute(&self, steps: &[CalibrationStep]) -> Result<u32, DeviceError> {
        let spectrographs = &self.devices.spectrographs;
        let mut exposures = 0;
        for step in steps {
            match step {
                CalibrationStep::Bias => {
                    spectrographs.expose("bias", 0.0).await?;
                    exposures += 1;
                }
                CalibrationStep::Dark { exposure_time } => {
                    spectrographs.expose("dark", *exposure_time).await?;
                    exposures += 1;
                }
                CalibrationStep::LampOn { lamp } => self.devices.lamps.on(lamp).await?,
                CalibrationStep::Warmup { lamp, duration } => {
                    tracing::debug!(%lamp, duration, "warming up lamp");
                    tokio::time::sleep(secs(*duration)).await;
                }
                CalibrationStep::Expose {
                    flavour,
                    exposure_time,
                    fibsel,
                    ..
                } => {
                    self.expose_lamp(flavour, *exposure_time, fibsel.as_ref())
                        .await?;
                    exposures += 1;
                }
                CalibrationStep::LampOff { lamp } => self.devices.lamps.off(lamp).await?,
            }
        }
        Ok(exposures)
    }

    async fn expose_lamp(
        &self,
        flavour: &str,
        exposure_time: f64,
        fibsel: Option<&FibselPlan>,
    ) -> Result<(), DeviceError> {
        let Some(plan) = fibsel else {
            return self.devices.spectrographs.expose(flavour, exposure_time).await;
        };
        self.devices
            .fibre_selector
            .move_to(&plan.initial_position)
            .await?;
        let exposure = self.devices.spectrographs.expose(flavour, exposure_time);
        tokio::pin!(exposure);
        tokio::select! {
            biased;
            result = &mut exposure => result,
            stepped = self.step_fibre_selector(plan) => {
                stepped?;
                exposure.await
            }
        }
    }

    async fn step_fibre_selector(&self, plan: &FibselPlan) -> Result<(), DeviceError> {
        let dwell = secs(plan.time_per_position).max(Duration::from_millis(1));
        for position in &plan.positions {
            self.devices.fibre_selector.move_to(position).await?;
            tokio::time::sleep(dwell).await;
        }
        Ok(())
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        let _ = self.telemetry.log(level, message, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DevicesConfig,
        device::{sim::SimulatedObservatory, DeviceClient},
    };
    use std::sync::Arc;
    use tokio::time::Instant;

    fn runner() -> (Arc<SimulatedObservatory>, SequenceRunner) {
        let config = DevicesConfig::default();
        let sim = Arc::new(SimulatedObservatory::new(&config));
        let client = DeviceClient::new(sim.clone(), Duration::from_secs(5));
        let devices = Devices::new(client, &config);
        (
            sim,
            SequenceRunner::new(devices, OverwatcherTelemetry::disabled("sequence")),
        )
    }

    fn parse(raw: &str) -> Result<CalibrationSequence, serde_json::Error> {
        serde_json::from_str(raw)
    }

    #[test]
    fn schema_accepts_scalars_lists_and_camel_case() {
        let sequence = parse(
            r#"{"darks": {"count": 2, "exposureTime": 900},
                "lamps": {"Neon": {"exposure_time": [10, 20], "fibsel": true}}}"#,
        )
        .unwrap();
        assert_eq!(sequence.darks.unwrap().exposure_time.to_vec(), vec![900.0]);
        assert_eq!(sequence.lamps["Neon"].fibsel, Some(FibselSpec::Enabled(true)));
        assert!(parse(r#"{"biases": {"count": 1, "gain": 2}}"#).is_err());
        assert!(parse(r#"{"flats": {}}"#).is_err());
    }

    #[test]
    fn plan_follows_fixed_order_and_defaults() {
        let sequence = parse(
            r#"{"lamps": {"Argon": {"exposure_time": 5}},
                "darks": {"exposure_time": [1, 2]},
                "biases": {}}"#,
        )
        .unwrap();
        let steps = sequence.plan(&SequenceDefaults::default()).unwrap();
        assert_eq!(steps[0], CalibrationStep::Bias);
        assert_eq!(steps[1], CalibrationStep::Dark { exposure_time: 1.0 });
        assert_eq!(steps[2], CalibrationStep::Dark { exposure_time: 2.0 });
        assert_eq!(
            steps[4],
            CalibrationStep::Warmup {
                lamp: "Argon".into(),
                duration: 120.0
            }
        );
        assert!(matches!(
            &steps[5],
            CalibrationStep::Expose { flavour, fibsel: None, .. } if flavour == "arc"
        ));
    }

    #[test]
    fn unknown_lamp_without_flavour_is_rejected() {
        let sequence = parse(r#"{"lamps": {"Mystery": {"exposure_time": 5}}}"#).unwrap();
        assert!(matches!(
            sequence.plan(&SequenceDefaults::default()),
            Err(SequenceError::Invalid(_))
        ));
        assert!(CalibrationSequence::default().validate().is_err());
    }

    #[test]
    fn fibre_selector_splits_the_exposure_between_positions() {
        let sequence = parse(
            r#"{"lamps": {"Quartz": {"exposure_time": 30,
                "fibsel": {"positions": ["P1-2", "P1-4", "P1-6"]}}}}"#,
        )
        .unwrap();
        let steps = sequence.plan(&SequenceDefaults::default()).unwrap();
        let CalibrationStep::Expose {
            fibsel: Some(plan), ..
        } = &steps[2]
        else {
            panic!("expected a lamp exposure, got {:?}", steps[2]);
        };
        assert_eq!(plan.initial_position, "P1-2");
        assert!((plan.time_per_position - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn biases_then_warmed_up_flat() {
        let (sim, runner) = runner();
        let sequence = parse(
            r#"{"biases": {"count": 2},
                "lamps": {"Quartz": {"warmup": 20, "exposure_time": [20], "flavour": "flat"}}}"#,
        )
        .unwrap();
        let start = Instant::now();
        let report = runner
            .run(
                "quick",
                &sequence,
                &SequenceDefaults::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.exposures, 3);

        let exposures = sim.exposures();
        let flavours: Vec<_> = exposures.iter().map(|e| e.flavour.as_str()).collect();
        assert_eq!(flavours, ["bias", "bias", "flat"]);
        let flat = &exposures[2];
        assert!((flat.exposure_time - 20.0).abs() < f64::EPSILON);
        assert_eq!(flat.lamps_on, vec!["Quartz".to_string()]);
        let warmup = flat.started.duration_since(start);
        assert!(warmup >= Duration::from_secs(20) && warmup < Duration::from_secs(21));
        assert!(sim.lamps_on().is_empty());
        assert!(start.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_and_turns_lamps_off() {
        let (sim, runner) = runner();
        let sequence = parse(r#"{"lamps": {"Neon": {"warmup": 5, "exposure_time": 300}}}"#).unwrap();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });
        let result = runner
            .run("arcs", &sequence, &SequenceDefaults::default(), &cancel)
            .await;
        assert!(matches!(result, Err(SequenceError::Cancelled)));
        assert_eq!(sim.aborts(), 1);
        assert!(sim.lamps_on().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fibre_selector_steps_during_the_exposure() {
        let (sim, runner) = runner();
        let sequence = parse(
            r#"{"lamps": {"Quartz": {"warmup": 0, "exposure_time": 30,
                "fibsel": {"positions": ["P1-2", "P1-4", "P1-6"], "initial_position": "P1-1"}}}}"#,
        )
        .unwrap();
        runner
            .run("flats", &sequence, &SequenceDefaults::default(), &CancelToken::new())
            .await
            .unwrap();
        let moves: Vec<_> = sim
            .journal()
            .into_iter()
            .filter(|e| e.command == "move")
            .filter_map(|e| e.args.get("position").and_then(|p| p.as_str().map(str::to_string)))
            .collect();
        assert_eq!(moves, ["P1-1", "P1-2", "P1-4", "P1-6"]);
        assert_eq!(sim.exposures()[0].fibre_position.as_deref(), Some("P1-1"));
    }
}
