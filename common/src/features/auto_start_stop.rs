use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::{AutoStartStopConfig, AutoStartStopLevel},
    error::FeatureError,
    event::ThermostatEvent,
    snapshot::ThermostatSnapshot,
    state::Candidate,
    types::{HvacMode, HvacOffReason},
};

/// Margin around the target the predicted temperature must clear.
const TEMP_HYSTERESIS: f64 = 0.5;

/// `(prediction horizon in minutes, accumulated error threshold)` per level.
fn level_parameters(level: AutoStartStopLevel) -> Option<(f64, f64)> {
    match level {
        AutoStartStopLevel::None => None,
        AutoStartStopLevel::Slow => Some((30.0, 10.0)),
        AutoStartStopLevel::Medium => Some((15.0, 5.0)),
        AutoStartStopLevel::Fast => Some((7.0, 2.0)),
    }
}

/// Stops the thermostat while the room is predicted to stay on the satisfied
/// side of the target, and starts it again once the prediction crosses back.
#[derive(Debug, Clone)]
pub struct AutoStartStopManager {
    name: String,
    level: AutoStartStopLevel,
    accumulated_error: f64,
    last_calculation: Option<DateTime<Utc>>,
    stopped: bool,
}

impl AutoStartStopManager {
    pub fn new(name: &str, config: Option<&AutoStartStopConfig>) -> Self {
        Self {
            name: name.to_string(),
            level: config.map(|c| c.level).unwrap_or_default(),
            accumulated_error: 0.0,
            last_calculation: None,
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn release(&mut self, events: &mut Vec<ThermostatEvent>) -> bool {
        self.accumulated_error = 0.0;
        if !self.stopped {
            return false;
        }
        self.stopped = false;
        events.push(ThermostatEvent::AutoStartStop { stopped: false });
        true
    }
}

impl FeatureManager for AutoStartStopManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::AutoStartStop
    }

    fn is_configured(&self) -> bool {
        level_parameters(self.level).is_some()
    }

    fn stop_listening(&mut self) {
        self.last_calculation = None;
    }

    fn refresh_state(&mut self, ctx: &FeatureContext<'_>, events: &mut Vec<ThermostatEvent>) -> bool {
        let Some((horizon_min, error_threshold)) = level_parameters(self.level) else {
            return false;
        };
        let sign = match ctx.requested.hvac_mode() {
            HvacMode::Heat => 1.0,
            HvacMode::Cool => -1.0,
            _ => return self.release(events),
        };
        let (Some(target), Some(current)) = (ctx.current.target_temperature(), ctx.measurements.temperature)
        else {
            return false;
        };

        let elapsed_min = match self.last_calculation {
            Some(last) => (ctx.now - last).num_seconds() as f64 / 60.0,
            None => 1.0,
        };
        if elapsed_min < 1.0 {
            return false;
        }
        self.last_calculation = Some(ctx.now);

        let error = sign * (target - current);
        self.accumulated_error =
            (self.accumulated_error + error * elapsed_min).clamp(-error_threshold, error_threshold);

        let slope_per_min = ctx.measurements.slope.unwrap_or(0.0) / 60.0;
        let predicted = current + slope_per_min * horizon_min;
        // Positive when the prediction is past the target in the direction of the mode.
        let predicted_excess = sign * (predicted - target);

        debug!(
            name = %self.name,
            error,
            accumulated_error = self.accumulated_error,
            predicted,
            "auto-start/stop evaluated"
        );

        if !self.stopped
            && self.accumulated_error <= -error_threshold
            && predicted_excess >= TEMP_HYSTERESIS
        {
            info!(name = %self.name, predicted, target, "auto-stop: room will stay satisfied");
            self.stopped = true;
            events.push(ThermostatEvent::AutoStartStop { stopped: true });
            return true;
        }
        if self.stopped && predicted_excess <= -TEMP_HYSTERESIS {
            info!(name = %self.name, predicted, target, "auto-start: room needs heating again");
            return self.release(events);
        }
        false
    }

    fn apply(&self, candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        if self.stopped {
            candidate.force_hvac_mode(
                FeatureKind::AutoStartStop,
                HvacMode::Off,
                Some(HvacOffReason::AutoStartStop),
            );
        }
        Ok(Verdict::Continue)
    }

    fn restore_state(&mut self, snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {
        self.stopped = self.is_configured() && snapshot.auto_start_stop_stopped;
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "auto_start_stop".to_string(),
            json!({
                "level": self.level,
                "stopped": self.stopped,
                "accumulated_error": self.accumulated_error,
            }),
        );
    }
}
