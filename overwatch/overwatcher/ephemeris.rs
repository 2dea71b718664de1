//! Sun ephemeris for an observing night.

use std::{fmt, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::module::NightId;

/// Twilight and sun times of one observing night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ephemeris {
    /// Night the times belong to.
    pub night: NightId,
    /// Sunset.
    pub sunset: DateTime<Utc>,
    /// End of evening astronomical twilight.
    pub evening_twilight: DateTime<Utc>,
    /// Start of morning astronomical twilight.
    pub morning_twilight: DateTime<Utc>,
    /// Sunrise.
    pub sunrise: DateTime<Utc>,
}

impl Ephemeris {
    /// Dark time: between evening and morning twilight.
    #[must_use]
    pub fn is_night(&self, now: DateTime<Utc>) -> bool {
        now >= self.evening_twilight && now < self.morning_twilight
    }

    /// Sunset is at most `window` away, or the night has already started.
    #[must_use]
    pub fn is_imminent_night(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        now < self.morning_twilight && now + window >= self.sunset
    }
}

/// Provides the ephemeris of a night.
pub trait EphemerisSource: Send + Sync + fmt::Debug {
    /// Ephemeris for `night`.
    fn ephemeris(&self, night: NightId) -> Ephemeris;
}

/// Ephemeris built from fixed UTC hours, used for simulation and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedEphemeris {
    sunset_hour: f64,
    sunrise_hour: f64,
    twilight: Duration,
    rollover_days: f64,
}

impl FixedEphemeris {
    /// Sunset and sunrise as UTC hours, with twilight lasting `twilight`.
    #[must_use]
    pub const fn new(sunset_hour: f64, sunrise_hour: f64, twilight: Duration) -> Self {
        Self {
            sunset_hour,
            sunrise_hour,
            twilight,
            rollover_days: 0.4,
        }
    }

    /// Overrides the night rollover used to locate the evening.
    #[must_use]
    pub const fn with_rollover(mut self, rollover_days: f64) -> Self {
        self.rollover_days = rollover_days;
        self
    }
}

impl Default for FixedEphemeris {
    fn default() -> Self {
        Self::new(23.0, 10.0, Duration::from_secs(75 * 60))
    }
}

impl EphemerisSource for FixedEphemeris {
    #[allow(clippy::cast_possible_truncation)]
    fn ephemeris(&self, night: NightId) -> Ephemeris {
        let start = night.starts_at(self.rollover_days);
        let midnight = start
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or(start, |naive| Utc.from_utc_datetime(&naive));
        let at_hour = |hour: f64| midnight + chrono::Duration::seconds((hour * 3_600.0) as i64);
        let mut sunset = at_hour(self.sunset_hour);
        if sunset < start {
            sunset += chrono::Duration::days(1);
        }
        let mut sunrise = at_hour(self.sunrise_hour);
        while sunrise <= sunset {
            sunrise += chrono::Duration::days(1);
        }
        let twilight =
            chrono::Duration::from_std(self.twilight).unwrap_or_else(|_| chrono::Duration::zero());
        Ephemeris {
            night,
            sunset,
            evening_twilight: sunset + twilight,
            morning_twilight: sunrise - twilight,
            sunrise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ephemeris_orders_events() {
        let source = FixedEphemeris::default();
        let night = NightId::at(Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap(), 0.4);
        let eph = source.ephemeris(night);
        assert_eq!(eph.sunset, Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap());
        assert_eq!(eph.sunrise, Utc.with_ymd_and_hms(2024, 6, 2, 10, 0, 0).unwrap());
        assert!(eph.evening_twilight < eph.morning_twilight);
        assert!(eph.is_night(Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap()));
        assert!(!eph.is_night(Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap()));
    }

    #[test]
    fn imminent_night_window() {
        let eph = FixedEphemeris::default().ephemeris(NightId(60_462));
        let hour = Duration::from_secs(3_600);
        assert!(eph.is_imminent_night(eph.sunset - chrono::Duration::minutes(30), hour));
        assert!(!eph.is_imminent_night(eph.sunset - chrono::Duration::hours(2), hour));
        assert!(!eph.is_imminent_night(eph.sunrise, hour));
    }
}
