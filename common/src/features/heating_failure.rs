use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::HeatingFailureConfig,
    error::FeatureError,
    event::ThermostatEvent,
    state::Candidate,
    types::HvacMode,
};

/// Start of an anomaly window: when it began and the temperature at that time.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Watch {
    since: DateTime<Utc>,
    temperature: f64,
}

/// Flags a heater that runs flat out without warming the room, and one that
/// sits idle while the room keeps warming (stuck valve or relay).
#[derive(Debug, Clone)]
pub struct HeatingFailureManager {
    name: String,
    config: Option<HeatingFailureConfig>,
    applies: bool,
    heating_watch: Option<Watch>,
    cooling_watch: Option<Watch>,
    heating_failure: bool,
    cooling_failure: bool,
}

impl HeatingFailureManager {
    pub fn new(name: &str, uses_tpi: bool, config: Option<&HeatingFailureConfig>) -> Self {
        Self {
            name: name.to_string(),
            config: config.cloned(),
            applies: uses_tpi,
            heating_watch: None,
            cooling_watch: None,
            heating_failure: false,
            cooling_failure: false,
        }
    }

    pub fn is_heating_failure(&self) -> bool {
        self.heating_failure
    }

    pub fn is_cooling_failure(&self) -> bool {
        self.cooling_failure
    }

    fn reset(&mut self, events: &mut Vec<ThermostatEvent>, temperature: Option<f64>) -> bool {
        self.heating_watch = None;
        self.cooling_watch = None;
        let mut changed = false;
        if self.heating_failure {
            self.heating_failure = false;
            events.push(ThermostatEvent::HeatingFailure {
                active: false,
                on_percent: 0.0,
                temperature,
            });
            changed = true;
        }
        if self.cooling_failure {
            self.cooling_failure = false;
            events.push(ThermostatEvent::CoolingFailure {
                active: false,
                temperature,
            });
            changed = true;
        }
        changed
    }
}

impl FeatureManager for HeatingFailureManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::HeatingFailure
    }

    fn is_configured(&self) -> bool {
        self.applies && self.config.is_some()
    }

    fn stop_listening(&mut self) {
        self.heating_watch = None;
        self.cooling_watch = None;
    }

    fn refresh_state(&mut self, ctx: &FeatureContext<'_>, events: &mut Vec<ThermostatEvent>) -> bool {
        let Some(config) = self.config.clone().filter(|_| self.applies) else {
            return false;
        };
        let Some(temperature) = ctx.measurements.temperature else {
            return false;
        };
        if ctx.current.hvac_mode() != HvacMode::Heat {
            return self.reset(events, Some(temperature));
        }

        let delay = Duration::minutes(config.detection_delay_min);
        let tolerance = config.temperature_change_tolerance;
        let mut changed = false;

        if ctx.on_percent >= config.heating_failure_threshold {
            let watch = *self.heating_watch.get_or_insert(Watch {
                since: ctx.now,
                temperature,
            });
            if ctx.now - watch.since >= delay {
                let rise = temperature - watch.temperature;
                if rise < tolerance && !self.heating_failure {
                    warn!(
                        name = %self.name,
                        on_percent = ctx.on_percent,
                        rise,
                        "heating at full demand without temperature rise"
                    );
                    self.heating_failure = true;
                    events.push(ThermostatEvent::HeatingFailure {
                        active: true,
                        on_percent: ctx.on_percent,
                        temperature: Some(temperature),
                    });
                    changed = true;
                } else if rise >= tolerance {
                    // Warming up: restart the window from here.
                    self.heating_watch = Some(Watch {
                        since: ctx.now,
                        temperature,
                    });
                    changed |= self.clear_heating(events, ctx.on_percent, temperature);
                }
            }
        } else {
            self.heating_watch = None;
            changed |= self.clear_heating(events, ctx.on_percent, temperature);
        }

        if ctx.on_percent <= config.cooling_failure_threshold {
            let watch = *self.cooling_watch.get_or_insert(Watch {
                since: ctx.now,
                temperature,
            });
            if ctx.now - watch.since >= delay {
                let rise = temperature - watch.temperature;
                if rise >= tolerance && !self.cooling_failure {
                    warn!(name = %self.name, rise, "temperature rising while the heater is idle");
                    self.cooling_failure = true;
                    events.push(ThermostatEvent::CoolingFailure {
                        active: true,
                        temperature: Some(temperature),
                    });
                    changed = true;
                } else if rise < tolerance {
                    self.cooling_watch = Some(Watch {
                        since: ctx.now,
                        temperature,
                    });
                    changed |= self.clear_cooling(events, temperature);
                }
            }
        } else {
            self.cooling_watch = None;
            changed |= self.clear_cooling(events, temperature);
        }
        changed
    }

    fn apply(&self, _candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        Ok(Verdict::Continue)
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "heating_failure_detection".to_string(),
            json!({
                "configured": self.is_configured(),
                "heating_failure": self.heating_failure,
                "cooling_failure": self.cooling_failure,
                "heating_watch_since": self.heating_watch.map(|w| w.since),
                "cooling_watch_since": self.cooling_watch.map(|w| w.since),
            }),
        );
    }
}

impl HeatingFailureManager {
    fn clear_heating(&mut self, events: &mut Vec<ThermostatEvent>, on_percent: f64, temperature: f64) -> bool {
        if !self.heating_failure {
            return false;
        }
        info!(name = %self.name, "heating failure cleared");
        self.heating_failure = false;
        events.push(ThermostatEvent::HeatingFailure {
            active: false,
            on_percent,
            temperature: Some(temperature),
        });
        true
    }

    fn clear_cooling(&mut self, events: &mut Vec<ThermostatEvent>, temperature: f64) -> bool {
        if !self.cooling_failure {
            return false;
        }
        info!(name = %self.name, "cooling failure cleared");
        self.cooling_failure = false;
        events.push(ThermostatEvent::CoolingFailure {
            active: false,
            temperature: Some(temperature),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        features::Measurements,
        preset::{Preset, PresetCatalog},
        state::VThermState,
        types::ThermostatKind,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn refresh(
        manager: &mut HeatingFailureManager,
        minutes: i64,
        temperature: f64,
        on_percent: f64,
        events: &mut Vec<ThermostatEvent>,
    ) -> bool {
        let state = VThermState::new(HvacMode::Heat, Some(21.0), Preset::Comfort);
        let measurements = Measurements {
            temperature: Some(temperature),
            ..Measurements::default()
        };
        let catalog = PresetCatalog::default();
        let ctx = FeatureContext {
            now: t0() + Duration::minutes(minutes),
            name: "living",
            kind: ThermostatKind::Switch,
            requested: &state,
            current: &state,
            request_source: None,
            measurements: &measurements,
            catalog: &catalog,
            ac_mode: false,
            on_percent,
            calculated_on_percent: on_percent,
        };
        manager.refresh_state(&ctx, events)
    }

    fn manager() -> HeatingFailureManager {
        HeatingFailureManager::new("living", true, Some(&HeatingFailureConfig::default()))
    }

    #[test]
    fn full_demand_without_rise_is_a_heating_failure() {
        let mut manager = manager();
        let mut events = Vec::new();

        assert!(!refresh(&mut manager, 0, 18.0, 1.0, &mut events));
        assert!(!refresh(&mut manager, 10, 18.1, 1.0, &mut events));
        assert!(refresh(&mut manager, 15, 18.2, 1.0, &mut events));
        assert!(manager.is_heating_failure());

        // Demand drops: the anomaly clears at once.
        assert!(refresh(&mut manager, 16, 18.2, 0.4, &mut events));
        assert!(!manager.is_heating_failure());
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn rising_temperature_is_not_a_failure() {
        let mut manager = manager();
        let mut events = Vec::new();

        refresh(&mut manager, 0, 18.0, 1.0, &mut events);
        refresh(&mut manager, 15, 19.0, 1.0, &mut events);

        assert!(!manager.is_heating_failure());
        assert!(events.is_empty());
    }

    #[test]
    fn idle_heater_with_rising_room_is_a_cooling_failure() {
        let mut manager = manager();
        let mut events = Vec::new();

        refresh(&mut manager, 0, 20.0, 0.0, &mut events);
        assert!(refresh(&mut manager, 15, 21.0, 0.0, &mut events));
        assert!(manager.is_cooling_failure());
        assert!(!manager.is_heating_failure());
    }
}
