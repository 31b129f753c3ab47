use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{DebouncedSensor, FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::PresenceConfig,
    error::FeatureError,
    event::ThermostatEvent,
    state::Candidate,
    types::FeatureState,
};

/// Switches preset temperatures to their away variants while nobody is home.
#[derive(Debug, Clone)]
pub struct PresenceManager {
    name: String,
    config: Option<PresenceConfig>,
    sensor: DebouncedSensor,
}

impl PresenceManager {
    pub fn new(name: &str, config: Option<&PresenceConfig>) -> Self {
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

    /// Unknown counts as present.
    pub fn is_absent(&self) -> bool {
        self.sensor.state() == FeatureState::Off
    }

    /// Returns true when the accepted state changed at once.
    pub fn on_sensor(&mut self, present: bool, now: DateTime<Utc>) -> bool {
        let Some(delay) = self.config.as_ref().map(|c| c.delay_sec) else {
            return false;
        };
        let changed = self.sensor.update(present, now, delay, delay);
        if changed {
            info!(name = %self.name, present, "presence changed");
        }
        changed
    }
}

impl FeatureManager for PresenceManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Presence
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
            info!(name = %self.name, state = self.sensor.state().as_str(), "presence confirmed");
        }
        changed
    }

    fn apply(&self, candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        candidate.set_present(!self.is_absent());
        Ok(Verdict::Continue)
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "presence".to_string(),
            json!({
                "configured": self.is_configured(),
                "state": self.sensor.state().as_str(),
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

    use super::*;

    #[test]
    fn absence_is_accepted_after_delay() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let mut presence = PresenceManager::new(
            "living",
            Some(&PresenceConfig {
                sensor: "person.alex".to_string(),
                delay_sec: 60,
            }),
        );
        presence.start_listening(t0);
        assert!(!presence.is_absent());

        assert!(!presence.on_sensor(false, t0));
        assert_eq!(presence.next_deadline(), Some(t0 + Duration::seconds(60)));
        assert!(!presence.is_absent());
    }

    #[test]
    fn zero_delay_is_immediate() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let mut presence = PresenceManager::new(
            "living",
            Some(&PresenceConfig {
                sensor: "person.alex".to_string(),
                delay_sec: 0,
            }),
        );

        assert!(presence.on_sensor(false, t0));
        assert!(presence.is_absent());
    }
}
