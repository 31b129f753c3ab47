use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::SafetyConfig,
    error::{FeatureError, ThermostatError},
    event::ThermostatEvent,
    preset::Preset,
    snapshot::ThermostatSnapshot,
    state::Candidate,
    types::{FeatureState, HvacMode, HvacOffReason, ThermostatKind},
};

/// Persisted part of the safety controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetySnapshot {
    pub state: FeatureState,
    pub saved_hvac_mode: Option<HvacMode>,
    pub saved_preset: Option<Preset>,
}

/// Falls back to a fixed duty cycle when temperature data went stale.
///
/// Only relay and valve thermostats are covered: a nested climate regulates
/// itself and cannot usefully be forced.
#[derive(Debug, Clone)]
pub struct SafetyManager {
    name: String,
    applies: bool,
    config: SafetyConfig,
    state: FeatureState,
    saved_hvac_mode: Option<HvacMode>,
    saved_preset: Option<Preset>,
}

impl SafetyManager {
    pub fn new(name: &str, kind: ThermostatKind, config: &SafetyConfig) -> Self {
        Self {
            name: name.to_string(),
            applies: kind.uses_tpi(),
            config: config.clone(),
            state: FeatureState::Unavailable,
            saved_hvac_mode: None,
            saved_preset: None,
        }
    }

    pub fn state(&self) -> FeatureState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state.is_on()
    }

    pub fn default_on_percent(&self) -> f64 {
        self.config.default_on_percent
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        SafetySnapshot {
            state: self.state,
            saved_hvac_mode: self.saved_hvac_mode,
            saved_preset: self.saved_preset,
        }
    }

    /// Replaces the runtime parameters. Values are validated, never clamped.
    pub fn set_parameters(&mut self, config: SafetyConfig) -> Result<(), ThermostatError> {
        config
            .validate()
            .map_err(|(name, reason)| ThermostatError::InvalidParameter { name, reason })?;
        info!(
            name = %self.name,
            delay_min = config.delay_min,
            min_on_percent = config.min_on_percent,
            default_on_percent = config.default_on_percent,
            "safety parameters updated"
        );
        self.config = config;
        Ok(())
    }

    fn is_stale(&self, ctx: &FeatureContext<'_>) -> (bool, Option<f64>, Option<f64>) {
        let delay = self.config.delay_min as f64;
        let temperature_age = ctx.measurements.temperature_age_min(ctx.now);
        let outdoor_age = ctx.measurements.outdoor_age_min(ctx.now);
        let stale = temperature_age.is_some_and(|age| age > delay)
            || outdoor_age.is_some_and(|age| age > delay);
        (stale, temperature_age, outdoor_age)
    }
}

impl FeatureManager for SafetyManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Safety
    }

    fn is_configured(&self) -> bool {
        self.applies && self.config.delay_min > 0
    }

    fn start_listening(&mut self, _now: DateTime<Utc>) {
        if self.is_configured() && self.state == FeatureState::Unavailable {
            self.state = FeatureState::Unknown;
        }
    }

    fn stop_listening(&mut self) {
        if self.state != FeatureState::On {
            self.state = FeatureState::Unavailable;
        }
    }

    fn refresh_state(&mut self, ctx: &FeatureContext<'_>, events: &mut Vec<ThermostatEvent>) -> bool {
        if !self.is_configured() {
            let changed = self.state == FeatureState::On;
            self.state = FeatureState::Unavailable;
            return changed;
        }
        if self.state == FeatureState::Unavailable {
            self.state = FeatureState::Unknown;
        }

        let (stale, temperature_age, outdoor_age) = self.is_stale(ctx);
        let mode_active = ctx.requested.hvac_mode() != HvacMode::Off;

        match self.state {
            FeatureState::On if !stale || !mode_active => {
                if ctx.current.preset() == Preset::Safety {
                    info!(name = %self.name, "temperature data is back, leaving safety");
                } else {
                    warn!(
                        name = %self.name,
                        preset = ctx.current.preset().as_str(),
                        "safety cleared while another preset is active, leaving it untouched"
                    );
                }
                self.state = FeatureState::Off;
                self.saved_hvac_mode = None;
                self.saved_preset = None;
                events.push(ThermostatEvent::SafetyEnded);
                true
            }
            FeatureState::On => false,
            _ if stale && mode_active && ctx.calculated_on_percent >= self.config.min_on_percent => {
                warn!(
                    name = %self.name,
                    ?temperature_age,
                    ?outdoor_age,
                    calculated_on_percent = ctx.calculated_on_percent,
                    default_on_percent = self.config.default_on_percent,
                    "no temperature data within {} min, entering safety",
                    self.config.delay_min
                );
                self.state = FeatureState::On;
                self.saved_hvac_mode = Some(ctx.current.hvac_mode());
                self.saved_preset = Some(ctx.current.preset());
                events.push(ThermostatEvent::SafetyStarted {
                    last_temperature_age_min: temperature_age,
                    last_outdoor_age_min: outdoor_age,
                });
                true
            }
            _ => {
                self.state = FeatureState::Off;
                false
            }
        }
    }

    fn apply(&self, candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        if !self.is_on() {
            return Ok(Verdict::Continue);
        }
        candidate.force_preset(FeatureKind::Safety, Preset::Safety);
        if self.config.default_on_percent <= 0.0 {
            candidate.force_hvac_mode(FeatureKind::Safety, HvacMode::Off, Some(HvacOffReason::Safety));
        } else {
            candidate.hold_hvac_mode(FeatureKind::Safety);
        }
        Ok(Verdict::Continue)
    }

    fn restore_state(&mut self, snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {
        if !self.is_configured() {
            return;
        }
        self.state = snapshot.safety.state;
        self.saved_hvac_mode = snapshot.safety.saved_hvac_mode;
        self.saved_preset = snapshot.safety.saved_preset;
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "safety".to_string(),
            json!({
                "state": self.state.as_str(),
                "delay_min": self.config.delay_min,
                "min_on_percent": self.config.min_on_percent,
                "default_on_percent": self.config.default_on_percent,
                "saved_hvac_mode": self.saved_hvac_mode.map(HvacMode::as_str),
                "saved_preset": self.saved_preset.map(Preset::as_str),
            }),
        );
    }
}
