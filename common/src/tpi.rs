//! Time-proportional-integral duty cycle.
//!
//! Turns the heating demand into the fraction of the next cycle the actuator is on:
//!
//! ```text
//! on_percent = clamp(coef_int * (target - current) + coef_ext * (target - outdoor), 0, 1)
//! ```
//!
//! Cooling mirrors the deltas. A safety overlay pins `on_percent` while
//! `calculated_on_percent` keeps reporting the formula's own result.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{AutoTpiConfig, TpiConfig},
    types::{round_to, HvacMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimes {
    pub on_time_sec: i64,
    pub off_time_sec: i64,
}

#[derive(Debug, Clone)]
pub struct TpiAlgorithm {
    name: String,
    coef_int: f64,
    coef_ext: f64,
    threshold_low: Option<f64>,
    threshold_high: Option<f64>,
    max_on_percent: Option<f64>,
    minimal_activation_delay_sec: i64,
    minimal_deactivation_delay_sec: i64,
    cycle_sec: i64,

    on_percent: f64,
    calculated_on_percent: f64,
    safety_on_percent: Option<f64>,
    /// Dead band latch: demand stays suppressed until the low threshold is crossed.
    suppressed: bool,
    auto_tpi: Option<AutoTpi>,
}

impl TpiAlgorithm {
    pub fn new(name: impl Into<String>, config: &TpiConfig, cycle_sec: i64) -> Self {
        Self {
            name: name.into(),
            coef_int: config.coef_int,
            coef_ext: config.coef_ext,
            threshold_low: config.threshold_low,
            threshold_high: config.threshold_high,
            max_on_percent: config.max_on_percent,
            minimal_activation_delay_sec: config.minimal_activation_delay_sec,
            minimal_deactivation_delay_sec: config.minimal_deactivation_delay_sec,
            cycle_sec,
            on_percent: 0.0,
            calculated_on_percent: 0.0,
            safety_on_percent: None,
            suppressed: false,
            auto_tpi: config.auto_tpi.clone().map(AutoTpi::new),
        }
    }

    pub fn on_percent(&self) -> f64 {
        self.on_percent
    }

    pub fn calculated_on_percent(&self) -> f64 {
        self.calculated_on_percent
    }

    pub fn coef_int(&self) -> f64 {
        self.coef_int
    }

    pub fn coef_ext(&self) -> f64 {
        self.coef_ext
    }

    pub fn cycle_sec(&self) -> i64 {
        self.cycle_sec
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn set_safety(&mut self, default_on_percent: f64) {
        info!(name = %self.name, default_on_percent, "tpi pinned by safety");
        self.safety_on_percent = Some(default_on_percent);
        self.on_percent = default_on_percent;
    }

    pub fn unset_safety(&mut self) {
        self.safety_on_percent = None;
        self.on_percent = self.capped(self.calculated_on_percent);
    }

    pub fn is_safety(&self) -> bool {
        self.safety_on_percent.is_some()
    }

    pub fn calculate(
        &mut self,
        target: Option<f64>,
        current: Option<f64>,
        outdoor: Option<f64>,
        hvac_mode: HvacMode,
    ) {
        let (Some(target), Some(current)) = (target, current) else {
            debug!(name = %self.name, "no target or temperature, on_percent reset to 0");
            self.calculated_on_percent = 0.0;
            self.on_percent = self.safety_on_percent.unwrap_or(0.0);
            return;
        };

        let (delta_temp, delta_ext) = match hvac_mode {
            HvacMode::Cool => (current - target, outdoor.map(|ext| ext - target)),
            _ => (target - current, outdoor.map(|ext| target - ext)),
        };

        let raw = self.coef_int * delta_temp + self.coef_ext * delta_ext.unwrap_or(0.0);
        self.calculated_on_percent = round_to(raw.clamp(0.0, 1.0), 4);

        if self.apply_dead_band(delta_temp) {
            self.calculated_on_percent = 0.0;
        }

        self.on_percent = match (hvac_mode, self.safety_on_percent) {
            (HvacMode::Off | HvacMode::FanOnly, _) => 0.0,
            (_, Some(pinned)) => pinned,
            _ => self.capped(self.calculated_on_percent),
        };

        debug!(
            name = %self.name,
            delta_temp,
            ?delta_ext,
            calculated_on_percent = self.calculated_on_percent,
            on_percent = self.on_percent,
            "tpi calculated"
        );
    }

    /// Forces the next dispatch to 0 % without touching the formula's result.
    pub fn force_off(&mut self) {
        self.on_percent = 0.0;
    }

    pub fn cycle_times(&self) -> CycleTimes {
        cycle_times(
            self.on_percent,
            self.cycle_sec,
            self.minimal_activation_delay_sec,
            self.minimal_deactivation_delay_sec,
        )
    }

    /// Feeds one finished cycle to the learner; returns true when coefficients moved.
    pub fn learn(&mut self, sample: CycleSample) -> bool {
        let Some(auto) = self.auto_tpi.as_mut() else {
            return false;
        };
        let Some((coef_int, coef_ext)) = auto.learn(self.coef_int, self.coef_ext, sample) else {
            return false;
        };
        if (coef_int - self.coef_int).abs() < 1e-6 && (coef_ext - self.coef_ext).abs() < 1e-6 {
            return false;
        }
        info!(
            name = %self.name,
            coef_int,
            coef_ext,
            "auto-tpi recalibrated coefficients"
        );
        self.coef_int = coef_int;
        self.coef_ext = coef_ext;
        true
    }

    pub fn learned_coefficients(&self) -> Option<LearnedCoefficients> {
        self.auto_tpi.as_ref().map(|_| LearnedCoefficients {
            coef_int: self.coef_int,
            coef_ext: self.coef_ext,
        })
    }

    pub fn restore_learned(&mut self, learned: LearnedCoefficients) {
        if let Some(auto) = &self.auto_tpi {
            self.coef_int = learned.coef_int.clamp(auto.config.coef_min, auto.config.coef_max);
            self.coef_ext = learned.coef_ext.clamp(0.0, auto.config.coef_max);
        }
    }

    fn capped(&self, value: f64) -> f64 {
        match self.max_on_percent {
            Some(max) => value.min(max),
            None => value,
        }
    }

    /// Returns true while demand is suppressed by the dead band.
    fn apply_dead_band(&mut self, delta_temp: f64) -> bool {
        let (Some(low), Some(high)) = (self.threshold_low, self.threshold_high) else {
            return false;
        };
        // Positive when the room is past the target in the direction of the mode.
        let excess = -delta_temp;
        if self.suppressed {
            if excess <= low {
                self.suppressed = false;
            }
        } else if excess >= high {
            self.suppressed = true;
        }
        self.suppressed
    }
}

/// Converts a fraction into on/off seconds, honouring the actuator's minimum windows.
pub fn cycle_times(
    on_percent: f64,
    cycle_sec: i64,
    minimal_activation_delay_sec: i64,
    minimal_deactivation_delay_sec: i64,
) -> CycleTimes {
    let on_percent = on_percent.clamp(0.0, 1.0);
    let mut on_time_sec = (on_percent * cycle_sec as f64).round() as i64;

    if on_time_sec < minimal_activation_delay_sec {
        on_time_sec = 0;
    }
    let mut off_time_sec = cycle_sec - on_time_sec;
    if on_time_sec > 0 && off_time_sec < minimal_deactivation_delay_sec {
        on_time_sec = cycle_sec;
        off_time_sec = 0;
    }

    CycleTimes {
        on_time_sec,
        off_time_sec,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearnedCoefficients {
    pub coef_int: f64,
    pub coef_ext: f64,
}

/// What happened during one finished cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSample {
    pub on_percent: f64,
    pub target: f64,
    pub start_temp: f64,
    pub end_temp: f64,
    pub outdoor: Option<f64>,
    pub heating: bool,
}

/// Room is considered at equilibrium within this distance to target.
const EQUILIBRIUM_BAND: f64 = 0.2;
/// Weight of a new outdoor coefficient estimate.
const EXT_BLEND: f64 = 0.1;

#[derive(Debug, Clone)]
struct AutoTpi {
    config: AutoTpiConfig,
}

impl AutoTpi {
    fn new(config: AutoTpiConfig) -> Self {
        Self { config }
    }

    fn learn(&self, coef_int: f64, coef_ext: f64, sample: CycleSample) -> Option<(f64, f64)> {
        let sign = if sample.heating { 1.0 } else { -1.0 };
        let error_start = sign * (sample.target - sample.start_temp);
        let error_end = sign * (sample.target - sample.end_temp);

        if error_start.abs() < EQUILIBRIUM_BAND && error_end.abs() < EQUILIBRIUM_BAND {
            let outdoor = sample.outdoor?;
            let ext_delta = sign * (sample.target - outdoor);
            if ext_delta <= 0.0 || sample.on_percent <= 0.0 {
                return None;
            }
            let estimate = sample.on_percent / ext_delta;
            let blended = (1.0 - EXT_BLEND) * coef_ext + EXT_BLEND * estimate;
            return Some((coef_int, blended.clamp(0.0, self.config.coef_max)));
        }

        if error_start <= 0.0 {
            return None;
        }

        // Fraction of the starting error the cycle removed; 0.5 per cycle is the goal.
        let progress = (error_start - error_end) / error_start;
        let adjustment = if sample.on_percent >= 1.0 && progress < 0.5 {
            // Saturated: a larger coefficient cannot help this cycle.
            return None;
        } else if error_end < -EQUILIBRIUM_BAND {
            // Overshoot.
            -self.config.learning_rate
        } else if progress < 0.5 {
            self.config.learning_rate * (0.5 - progress)
        } else {
            -self.config.learning_rate * (progress - 0.5)
        };

        let coef_int = (coef_int * (1.0 + adjustment)).clamp(self.config.coef_min, self.config.coef_max);
        Some((coef_int, coef_ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(coef_int: f64, coef_ext: f64) -> TpiConfig {
        TpiConfig {
            coef_int,
            coef_ext,
            minimal_activation_delay_sec: 0,
            ..TpiConfig::default()
        }
    }

    #[test]
    fn full_demand_clamps_to_one() {
        let mut tpi = TpiAlgorithm::new("test", &config(0.3, 0.01), 300);
        tpi.calculate(Some(21.0), Some(15.0), Some(1.0), HvacMode::Heat);

        assert_eq!(tpi.on_percent(), 1.0);
        assert_eq!(tpi.cycle_times().on_time_sec, 300);
        assert_eq!(tpi.cycle_times().off_time_sec, 0);
    }

    #[test]
    fn on_percent_is_always_clamped() {
        let mut tpi = TpiAlgorithm::new("test", &config(50.0, 10.0), 300);
        for (target, current, outdoor, mode) in [
            (35.0, -40.0, Some(-60.0), HvacMode::Heat),
            (7.0, 60.0, Some(80.0), HvacMode::Heat),
            (18.0, 40.0, Some(45.0), HvacMode::Cool),
            (30.0, 10.0, None, HvacMode::Cool),
            (f64::MAX, f64::MIN, None, HvacMode::Heat),
        ] {
            tpi.calculate(Some(target), Some(current), outdoor, mode);
            assert!((0.0..=1.0).contains(&tpi.on_percent()));
            assert!((0.0..=1.0).contains(&tpi.calculated_on_percent()));
        }
    }

    #[test]
    fn proportional_demand() {
        let mut tpi = TpiAlgorithm::new("test", &config(0.6, 0.01), 300);
        tpi.calculate(Some(19.0), Some(18.5), Some(9.0), HvacMode::Heat);

        assert_eq!(tpi.on_percent(), 0.4);
        assert_eq!(tpi.cycle_times().on_time_sec, 120);
    }

    #[test]
    fn cooling_mirrors_deltas() {
        let mut tpi = TpiAlgorithm::new("test", &config(0.6, 0.01), 300);
        tpi.calculate(Some(24.0), Some(24.5), Some(34.0), HvacMode::Cool);

        assert_eq!(tpi.on_percent(), 0.4);
    }

    #[test]
    fn off_mode_forces_zero() {
        let mut tpi = TpiAlgorithm::new("test", &config(0.6, 0.01), 300);
        tpi.calculate(Some(21.0), Some(15.0), None, HvacMode::Off);

        assert_eq!(tpi.on_percent(), 0.0);
        assert_eq!(tpi.calculated_on_percent(), 1.0);
    }

    #[test]
    fn safety_pins_on_percent_but_reports_formula() {
        let mut tpi = TpiAlgorithm::new("test", &config(0.6, 0.01), 300);
        tpi.set_safety(0.1);
        tpi.calculate(Some(21.0), Some(19.0), Some(1.0), HvacMode::Heat);

        assert_eq!(tpi.on_percent(), 0.1);
        assert_eq!(tpi.calculated_on_percent(), 1.0);

        tpi.unset_safety();
        assert_eq!(tpi.on_percent(), 1.0);
    }

    #[test]
    fn max_on_percent_caps_result() {
        let mut cfg = config(0.6, 0.01);
        cfg.max_on_percent = Some(0.8);
        let mut tpi = TpiAlgorithm::new("test", &cfg, 300);
        tpi.calculate(Some(21.0), Some(15.0), None, HvacMode::Heat);

        assert_eq!(tpi.on_percent(), 0.8);
        assert_eq!(tpi.calculated_on_percent(), 1.0);
    }

    #[test]
    fn short_activations_collapse_to_zero() {
        assert_eq!(
            cycle_times(0.02, 300, 10, 0),
            CycleTimes {
                on_time_sec: 0,
                off_time_sec: 300
            }
        );
    }

    #[test]
    fn short_deactivations_collapse_to_full_on() {
        assert_eq!(
            cycle_times(0.97, 300, 10, 20),
            CycleTimes {
                on_time_sec: 300,
                off_time_sec: 0
            }
        );
    }

    #[test]
    fn dead_band_has_hysteresis() {
        let mut cfg = config(0.6, 0.0);
        cfg.threshold_low = Some(0.0);
        cfg.threshold_high = Some(0.5);
        let mut tpi = TpiAlgorithm::new("test", &cfg, 300);

        tpi.calculate(Some(20.0), Some(20.6), None, HvacMode::Heat);
        assert!(tpi.is_suppressed());

        // Back inside the band but above the low threshold: still suppressed.
        tpi.calculate(Some(20.0), Some(20.2), None, HvacMode::Heat);
        assert!(tpi.is_suppressed());
        assert_eq!(tpi.on_percent(), 0.0);

        tpi.calculate(Some(20.0), Some(19.5), None, HvacMode::Heat);
        assert!(!tpi.is_suppressed());
        assert_eq!(tpi.on_percent(), 0.3);
    }

    #[test]
    fn auto_tpi_raises_coef_int_when_too_slow() {
        let mut cfg = config(0.5, 0.01);
        cfg.auto_tpi = Some(AutoTpiConfig::default());
        let mut tpi = TpiAlgorithm::new("test", &cfg, 300);

        let moved = tpi.learn(CycleSample {
            on_percent: 0.5,
            target: 20.0,
            start_temp: 19.0,
            end_temp: 19.0,
            outdoor: Some(5.0),
            heating: true,
        });

        assert!(moved);
        assert!(tpi.coef_int() > 0.5);
    }

    #[test]
    fn auto_tpi_blends_coef_ext_at_equilibrium() {
        let mut cfg = config(0.5, 0.01);
        cfg.auto_tpi = Some(AutoTpiConfig::default());
        let mut tpi = TpiAlgorithm::new("test", &cfg, 300);

        tpi.learn(CycleSample {
            on_percent: 0.3,
            target: 20.0,
            start_temp: 20.0,
            end_temp: 20.1,
            outdoor: Some(10.0),
            heating: true,
        });

        // 0.9 * 0.01 + 0.1 * 0.03
        assert!((tpi.coef_ext() - 0.012).abs() < 1e-9);
        assert_eq!(tpi.coef_int(), 0.5);
    }

    #[test]
    fn learning_disabled_without_auto_tpi() {
        let mut tpi = TpiAlgorithm::new("test", &config(0.5, 0.01), 300);
        assert!(!tpi.learn(CycleSample {
            on_percent: 0.5,
            target: 20.0,
            start_temp: 19.0,
            end_temp: 19.0,
            outdoor: None,
            heating: true,
        }));
    }
}
