//! Alert catalogue and the pure evaluation of telemetry snapshots.

use std::{collections::BTreeSet, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::AlertThresholds, errors::DeviceError};

/// Alert severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Operator attention, no action.
    Warning,
    /// The dome must close.
    Critical,
}

/// Kinds of alert the monitor can raise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Precipitation detected.
    Rain,
    /// Relative humidity above limit.
    Humidity,
    /// Ambient temperature too close to the dew point.
    DewPoint,
    /// Wind speed or gusts above limit.
    Wind,
    /// Low oxygen in the building.
    Oxygen,
    /// Environmental telemetry cannot be fetched.
    TelemetryUnavailable,
    /// Heartbeat publication failed repeatedly.
    HeartbeatLost,
    /// Enclosure door open.
    DoorOpen,
    /// Spectrograph camera temperature out of range.
    CameraTemperature,
    /// Building heater fault.
    Heater,
    /// Sky transparency too poor for science.
    Transparency,
}

impl AlertKind {
    /// Severity of the alert kind.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::DoorOpen | Self::CameraTemperature | Self::Heater | Self::Transparency => {
                Severity::Warning
            }
            _ => Severity::Critical,
        }
    }

    /// Whether the kind is critical.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self.severity(), Severity::Critical)
    }

    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rain => "rain",
            Self::Humidity => "humidity",
            Self::DewPoint => "dew_point",
            Self::Wind => "wind",
            Self::Oxygen => "oxygen",
            Self::TelemetryUnavailable => "telemetry_unavailable",
            Self::HeartbeatLost => "heartbeat_lost",
            Self::DoorOpen => "door_open",
            Self::CameraTemperature => "camera_temperature",
            Self::Heater => "heater",
            Self::Transparency => "transparency",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert with its lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert kind.
    pub kind: AlertKind,
    /// Severity at raise time.
    pub severity: Severity,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
    /// When the condition returned to nominal, if it has.
    pub cleared_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// New active alert.
    #[must_use]
    pub const fn raised(kind: AlertKind, raised_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            raised_at,
            cleared_at: None,
        }
    }

    /// Whether the underlying condition still holds.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// Environmental and building readings.
///
/// `rain`, `humidity` and `wind_speed` are mandatory; a snapshot missing any
/// of them counts as a failed fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Time of the readings.
    pub taken_at: DateTime<Utc>,
    /// Rain sensor.
    pub rain: Option<bool>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    /// Ambient temperature in degrees C.
    pub temperature: Option<f64>,
    /// Dew point in degrees C.
    pub dew_point: Option<f64>,
    /// Average wind speed in mph.
    pub wind_speed: Option<f64>,
    /// Wind gust in mph.
    pub wind_gust: Option<f64>,
    /// Enclosure door sensor.
    pub door_open: Option<bool>,
    /// Camera temperature alarm.
    pub camera_temperature_alert: Option<bool>,
    /// Oxygen concentration in percent.
    pub oxygen: Option<f64>,
    /// Heater alarm.
    pub heater_alert: Option<bool>,
    /// Photometric zero point of the science telescope, averaged over the
    /// last minutes. Larger (less negative) values mean a more opaque sky.
    #[serde(default)]
    pub zero_point: Option<f64>,
}

impl TelemetrySnapshot {
    /// Readings well inside every threshold.
    #[must_use]
    pub fn nominal() -> Self {
        Self {
            taken_at: Utc::now(),
            rain: Some(false),
            humidity: Some(30.0),
            temperature: Some(12.0),
            dew_point: Some(-2.0),
            wind_speed: Some(5.0),
            wind_gust: Some(8.0),
            door_open: Some(false),
            camera_temperature_alert: Some(false),
            oxygen: Some(20.9),
            heater_alert: Some(false),
            zero_point: Some(-23.1),
        }
    }
}

/// A snapshot that cannot be evaluated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("telemetry snapshot is missing '{0}'")]
pub struct MissingReading(pub &'static str);

/// Source of environmental telemetry.
#[async_trait]
pub trait TelemetrySource: Send + Sync + fmt::Debug {
    /// Fetches the latest readings.
    async fn fetch(&self) -> Result<TelemetrySnapshot, DeviceError>;
}

/// Turns snapshots into the set of unsafe conditions.
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
}

impl AlertEvaluator {
    /// Evaluator with the given thresholds.
    #[must_use]
    pub const fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    /// Replaces the thresholds.
    pub fn set_thresholds(&mut self, thresholds: AlertThresholds) {
        self.thresholds = thresholds;
    }

    /// Conditions present in `snapshot`.
    pub fn conditions(
        &self,
        snapshot: &TelemetrySnapshot,
    ) -> Result<BTreeSet<AlertKind>, MissingReading> {
        let limits = &self.thresholds;
        let rain = snapshot.rain.ok_or(MissingReading("rain"))?;
        let humidity = snapshot.humidity.ok_or(MissingReading("humidity"))?;
        let wind_speed = snapshot.wind_speed.ok_or(MissingReading("wind_speed"))?;

        let mut kinds = BTreeSet::new();
        if rain {
            kinds.insert(AlertKind::Rain);
        }
        if humidity > limits.humidity_max {
            kinds.insert(AlertKind::Humidity);
        }
        if let (Some(temperature), Some(dew_point)) = (snapshot.temperature, snapshot.dew_point) {
            if temperature - dew_point < limits.dew_point_margin {
                kinds.insert(AlertKind::DewPoint);
            }
        }
        let gusting = snapshot
            .wind_gust
            .is_some_and(|gust| gust > limits.wind_gust_max);
        if wind_speed > limits.wind_speed_max || gusting {
            kinds.insert(AlertKind::Wind);
        }
        if snapshot.oxygen.is_some_and(|o2| o2 < limits.oxygen_min) {
            kinds.insert(AlertKind::Oxygen);
        }
        if snapshot.door_open == Some(true) {
            kinds.insert(AlertKind::DoorOpen);
        }
        if snapshot.camera_temperature_alert == Some(true) {
            kinds.insert(AlertKind::CameraTemperature);
        }
        if snapshot.heater_alert == Some(true) {
            kinds.insert(AlertKind::Heater);
        }
        if snapshot
            .zero_point
            .is_some_and(|zero_point| zero_point > limits.zero_point_max)
        {
            kinds.insert(AlertKind::Transparency);
        }
        Ok(kinds)
    }

    /// Alerts present in `snapshot`, stamped with the snapshot time.
    pub fn evaluate(&self, snapshot: &TelemetrySnapshot) -> Result<Vec<Alert>, MissingReading> {
        Ok(self
            .conditions(snapshot)?
            .into_iter()
            .map(|kind| Alert::raised(kind, snapshot.taken_at))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_snapshot_has_no_alerts() {
        let evaluator = AlertEvaluator::default();
        assert!(evaluator
            .evaluate(&TelemetrySnapshot::nominal())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn flags_weather_and_building_conditions() {
        let evaluator = AlertEvaluator::default();
        let snapshot = TelemetrySnapshot {
            rain: Some(true),
            humidity: Some(92.0),
            temperature: Some(4.0),
            dew_point: Some(3.5),
            wind_gust: Some(50.0),
            door_open: Some(true),
            ..TelemetrySnapshot::nominal()
        };
        let kinds = evaluator.conditions(&snapshot).unwrap();
        let expected: BTreeSet<_> = [
            AlertKind::Rain,
            AlertKind::Humidity,
            AlertKind::DewPoint,
            AlertKind::Wind,
            AlertKind::DoorOpen,
        ]
        .into_iter()
        .collect();
        assert_eq!(kinds, expected);
        assert_eq!(AlertKind::DoorOpen.severity(), Severity::Warning);
        assert!(AlertKind::Rain.is_critical());
    }

    #[test]
    fn poor_transparency_is_a_warning() {
        let evaluator = AlertEvaluator::default();
        let cloudy = TelemetrySnapshot {
            zero_point: Some(-22.1),
            ..TelemetrySnapshot::nominal()
        };
        let alerts = evaluator.evaluate(&cloudy).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Transparency);
        assert_eq!(alerts[0].severity, Severity::Warning);

        let unknown = TelemetrySnapshot {
            zero_point: None,
            ..TelemetrySnapshot::nominal()
        };
        assert!(evaluator.conditions(&unknown).unwrap().is_empty());
    }

    #[test]
    fn missing_mandatory_reading_is_an_error() {
        let snapshot = TelemetrySnapshot {
            humidity: None,
            ..TelemetrySnapshot::nominal()
        };
        assert_eq!(
            AlertEvaluator::default().conditions(&snapshot),
            Err(MissingReading("humidity"))
        );
    }
}
