use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{DebouncedSensor, FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::MotionConfig,
    error::FeatureError,
    event::ThermostatEvent,
    preset::Preset,
    state::Candidate,
    types::FeatureState,
};

/// Resolves the activity preset to the motion or no-motion preset.
///
/// The preset label stays `activity`; only the temperature behind it moves.
#[derive(Debug, Clone)]
pub struct MotionManager {
    name: String,
    config: Option<MotionConfig>,
    sensor: DebouncedSensor,
}

impl MotionManager {
    pub fn new(name: &str, config: Option<&MotionConfig>) -> Self {
        Self {
            name: name.to_string(),
            config: config.cloned(),
            sensor: DebouncedSensor::default(),
        }
    }

    pub fn sensor_entity(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.sensor.as_str())
    }

    pub fn state(&self) -> FeatureState {
        self.sensor.state()
    }

    /// Catalog preset the activity preset currently stands for.
    pub fn effective_preset(&self) -> Option<Preset> {
        self.config.as_ref().map(|config| {
            if self.sensor.state().is_on() {
                config.motion_preset
            } else {
                config.no_motion_preset
            }
        })
    }

    /// Returns true when the accepted state changed at once.
    pub fn on_sensor(&mut self, detected: bool, now: DateTime<Utc>) -> bool {
        let Some((delay, off_delay)) = self.config.as_ref().map(|c| (c.delay_sec, c.off_delay_sec)) else {
            return false;
        };
        let changed = self.sensor.update(detected, now, delay, off_delay);
        if changed {
            info!(name = %self.name, detected, "motion changed");
        }
        changed
    }
}

impl FeatureManager for MotionManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Motion
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn start_listening(&mut self, _now: DateTime<Utc>) {
        if self.is_configured() {
            self.sensor.start();
        }
    }

    fn stop_listening(&mut self) {
        self.sensor.stop();
    }

    fn refresh_state(&mut self, ctx: &FeatureContext<'_>, _events: &mut Vec<ThermostatEvent>) -> bool {
        let changed = self.sensor.fire(ctx.now);
        if changed {
            info!(name = %self.name, state = self.sensor.state().as_str(), "motion confirmed");
        }
        changed
    }

    fn apply(&self, candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        if let Some(preset) = self.effective_preset() {
            candidate.set_activity_preset(preset);
        }
        Ok(Verdict::Continue)
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "motion".to_string(),
            json!({
                "configured": self.is_configured(),
                "state": self.sensor.state().as_str(),
                "effective_preset": self.effective_preset().map(Preset::as_str),
            }),
        );
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.sensor.deadline()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{features::Measurements, preset::PresetCatalog, state::VThermState, types::*};

    fn config() -> MotionConfig {
        MotionConfig {
            sensor: "binary_sensor.motion".to_string(),
            delay_sec: 30,
            off_delay_sec: 300,
            motion_preset: Preset::Comfort,
            no_motion_preset: Preset::Eco,
        }
    }

    #[test]
    fn motion_that_vanished_before_delay_is_dropped() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let state = VThermState::new(HvacMode::Heat, None, Preset::Activity);
        let measurements = Measurements::default();
        let catalog = PresetCatalog::default();
        let ctx = |now| FeatureContext {
            now,
            name: "living",
            kind: ThermostatKind::Switch,
            requested: &state,
            current: &state,
            request_source: None,
            measurements: &measurements,
            catalog: &catalog,
            ac_mode: false,
            on_percent: 0.0,
            calculated_on_percent: 0.0,
        };
        let mut motion = MotionManager::new("living", Some(&config()));
        motion.start_listening(t0);
        motion.on_sensor(false, t0);
        motion.refresh_state(&ctx(t0 + Duration::seconds(300)), &mut Vec::new());
        assert_eq!(motion.effective_preset(), Some(Preset::Eco));

        let t1 = t0 + Duration::seconds(400);
        motion.on_sensor(true, t1);
        // The raw state flips back before the delay ran out.
        motion.on_sensor(false, t1 + Duration::seconds(10));
        motion.refresh_state(&ctx(t1 + Duration::seconds(30)), &mut Vec::new());

        assert_eq!(motion.state(), FeatureState::Off);
        assert_eq!(motion.effective_preset(), Some(Preset::Eco));
    }

    #[test]
    fn sustained_motion_selects_motion_preset() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let state = VThermState::new(HvacMode::Heat, None, Preset::Activity);
        let measurements = Measurements::default();
        let catalog = PresetCatalog::default();
        let ctx = FeatureContext {
            now: t0 + Duration::seconds(30),
            name: "living",
            kind: ThermostatKind::Switch,
            requested: &state,
            current: &state,
            request_source: None,
            measurements: &measurements,
            catalog: &catalog,
            ac_mode: false,
            on_percent: 0.0,
            calculated_on_percent: 0.0,
        };
        let mut motion = MotionManager::new("living", Some(&config()));
        motion.start_listening(t0);
        motion.on_sensor(true, t0);

        assert!(motion.refresh_state(&ctx, &mut Vec::new()));

        let mut candidate = Candidate::from_requested(&state);
        motion.apply(&mut candidate, &ctx).unwrap();
        assert_eq!(candidate.activity_preset(), Some(Preset::Comfort));
        assert_eq!(candidate.preset(), Preset::Activity);
    }
}
