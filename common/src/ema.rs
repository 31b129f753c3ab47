//! Exponential moving average of a noisy temperature signal, and the slope derived
//! from successive averages.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::round_to;

/// Time decays shorter than this are rejected and leave the average untouched.
pub const MIN_TIME_DECAY_SEC: f64 = 0.0;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    name: String,
    halflife_sec: f64,
    max_alpha: f64,
    precision: u32,
    current_ema: Option<f64>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl ExponentialMovingAverage {
    pub fn new(name: impl Into<String>, halflife_sec: f64, max_alpha: f64, precision: u32) -> Self {
        Self {
            name: name.into(),
            halflife_sec,
            max_alpha,
            precision,
            current_ema: None,
            last_timestamp: None,
        }
    }

    pub fn current(&self) -> Option<f64> {
        self.current_ema.map(|ema| round_to(ema, self.precision))
    }

    pub fn calculate_ema(&mut self, measurement: f64, timestamp: DateTime<Utc>) -> f64 {
        let (Some(previous), Some(last_timestamp)) = (self.current_ema, self.last_timestamp) else {
            self.current_ema = Some(measurement);
            self.last_timestamp = Some(timestamp);
            return round_to(measurement, self.precision);
        };

        let time_decay = (timestamp - last_timestamp).num_milliseconds() as f64 / 1000.0;
        if time_decay < MIN_TIME_DECAY_SEC {
            debug!(
                name = %self.name,
                time_decay,
                "rejecting out of order measurement"
            );
            return round_to(previous, self.precision);
        }

        let alpha = self.alpha(time_decay);
        let ema = alpha * measurement + (1.0 - alpha) * previous;

        self.current_ema = Some(ema);
        self.last_timestamp = Some(timestamp);
        round_to(ema, self.precision)
    }

    fn alpha(&self, time_decay: f64) -> f64 {
        if self.halflife_sec <= 0.0 {
            return self.max_alpha;
        }
        let alpha = 1.0 - 0.5f64.powf(time_decay / self.halflife_sec);
        alpha.min(self.max_alpha)
    }
}

/// Weight of the previous slope when smoothing a new finite difference.
const LAST_SLOPE_WEIGHT: f64 = 0.5;

/// Rate of change (°/hour) of the smoothed temperature.
#[derive(Debug, Clone)]
pub struct TemperatureSlope {
    max_gap_sec: f64,
    last: Option<(f64, DateTime<Utc>)>,
    slope: Option<f64>,
}

impl TemperatureSlope {
    pub fn new(max_gap_min: f64) -> Self {
        Self {
            max_gap_sec: max_gap_min * 60.0,
            last: None,
            slope: None,
        }
    }

    pub fn slope(&self) -> Option<f64> {
        self.slope
    }

    /// Slope in °/minute, as used by the predictive features.
    pub fn slope_per_min(&self) -> Option<f64> {
        self.slope.map(|slope| slope / 60.0)
    }

    pub fn add(&mut self, ema: f64, timestamp: DateTime<Utc>) -> Option<f64> {
        let Some((last_ema, last_timestamp)) = self.last else {
            self.last = Some((ema, timestamp));
            return self.slope;
        };

        let dt_sec = (timestamp - last_timestamp).num_milliseconds() as f64 / 1000.0;
        if dt_sec <= 0.0 {
            return self.slope;
        }
        if dt_sec > self.max_gap_sec {
            self.last = Some((ema, timestamp));
            self.slope = None;
            return None;
        }

        let instant = (ema - last_ema) / (dt_sec / 3600.0);
        let slope = match self.slope {
            Some(previous) => LAST_SLOPE_WEIGHT * previous + (1.0 - LAST_SLOPE_WEIGHT) * instant,
            None => instant,
        };

        self.last = Some((ema, timestamp));
        self.slope = Some(round_to(slope, 3));
        self.slope
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.slope = None;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    #[test]
    fn first_measurement_is_returned_raw() {
        let mut ema = ExponentialMovingAverage::new("test", 300.0, 0.5, 2);
        assert_eq!(ema.calculate_ema(19.5, t0()), 19.5);
    }

    #[test]
    fn stays_between_previous_and_measurement() {
        let mut ema = ExponentialMovingAverage::new("test", 300.0, 0.5, 4);
        let samples = [
            (20.0, 0),
            (22.0, 60),
            (18.0, 90),
            (25.0, 1_000),
            (25.0, 1_001),
            (-5.0, 4_000),
        ];

        let mut previous: Option<f64> = None;
        for (measurement, offset) in samples {
            let value = ema.calculate_ema(measurement, t0() + Duration::seconds(offset));
            if let Some(previous) = previous {
                let low = previous.min(measurement) - 1e-4;
                let high = previous.max(measurement) + 1e-4;
                assert!(
                    (low..=high).contains(&value),
                    "{value} not within [{low}, {high}]"
                );
            }
            previous = Some(value);
        }
    }

    #[test]
    fn duplicate_timestamp_keeps_value() {
        let mut ema = ExponentialMovingAverage::new("test", 300.0, 0.5, 2);
        ema.calculate_ema(20.0, t0());
        let first = ema.calculate_ema(21.0, t0() + Duration::seconds(120));

        let again = ema.calculate_ema(21.0, t0() + Duration::seconds(120));
        let once_more = ema.calculate_ema(21.0, t0() + Duration::seconds(120));

        assert_eq!(first, again);
        assert_eq!(again, once_more);
    }

    #[test]
    fn out_of_order_is_rejected() {
        let mut ema = ExponentialMovingAverage::new("test", 300.0, 0.5, 2);
        ema.calculate_ema(20.0, t0());
        let value = ema.calculate_ema(21.0, t0() + Duration::seconds(300));

        assert_eq!(ema.calculate_ema(40.0, t0() + Duration::seconds(10)), value);
    }

    #[test]
    fn alpha_is_capped_for_stale_comparisons() {
        let mut ema = ExponentialMovingAverage::new("test", 300.0, 0.5, 2);
        ema.calculate_ema(20.0, t0());

        // A day later the uncapped alpha would be ~1.0.
        let value = ema.calculate_ema(30.0, t0() + Duration::days(1));

        assert_eq!(value, 25.0);
    }

    #[test]
    fn slope_tracks_falling_temperature() {
        let mut slope = TemperatureSlope::new(30.0);
        slope.add(20.0, t0());
        let first = slope.add(19.5, t0() + Duration::minutes(6)).unwrap();

        assert_eq!(first, -5.0);

        let second = slope.add(19.0, t0() + Duration::minutes(12)).unwrap();
        assert_eq!(second, -5.0);
    }

    #[test]
    fn slope_restarts_after_long_gap() {
        let mut slope = TemperatureSlope::new(30.0);
        slope.add(20.0, t0());
        slope.add(21.0, t0() + Duration::minutes(10));

        assert_eq!(slope.add(15.0, t0() + Duration::hours(3)), None);
    }
}
