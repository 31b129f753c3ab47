use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    error::{FeatureError, ThermostatError},
    event::ThermostatEvent,
    preset::Preset,
    snapshot::ThermostatSnapshot,
    state::Candidate,
    timer::Deadline,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedPresetSnapshot {
    pub preset: Preset,
    pub end: DateTime<Utc>,
}

/// A preset that replaces the requested one for a limited time.
#[derive(Debug, Clone)]
pub struct TimedPresetManager {
    name: String,
    max_duration_min: i64,
    active: Option<Preset>,
    end: Deadline,
}

impl TimedPresetManager {
    pub fn new(name: &str, max_duration_min: i64) -> Self {
        Self {
            name: name.to_string(),
            max_duration_min,
            active: None,
            end: Deadline::default(),
        }
    }

    pub fn active(&self) -> Option<Preset> {
        self.active
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end.at()
    }

    pub fn snapshot(&self) -> Option<TimedPresetSnapshot> {
        Some(TimedPresetSnapshot {
            preset: self.active?,
            end: self.end.at()?,
        })
    }

    /// The preset itself is validated by the caller against the catalog.
    pub fn set(
        &mut self,
        preset: Preset,
        duration_min: i64,
        now: DateTime<Utc>,
        events: &mut Vec<ThermostatEvent>,
    ) -> Result<(), ThermostatError> {
        if !(1..=self.max_duration_min).contains(&duration_min) {
            return Err(ThermostatError::InvalidDuration {
                got: duration_min,
                max: self.max_duration_min,
            });
        }
        let end = now + Duration::minutes(duration_min);
        self.active = Some(preset);
        self.end.arm_at(end);
        info!(name = %self.name, preset = preset.as_str(), %end, "timed preset started");
        events.push(ThermostatEvent::TimedPresetStarted { preset, end });
        Ok(())
    }

    pub fn cancel(&mut self, events: &mut Vec<ThermostatEvent>) -> Result<Preset, ThermostatError> {
        let preset = self.active.take().ok_or(ThermostatError::NoTimedPreset)?;
        self.end.cancel();
        info!(name = %self.name, preset = preset.as_str(), "timed preset cancelled");
        events.push(ThermostatEvent::TimedPresetEnded {
            preset,
            expired: false,
        });
        Ok(preset)
    }
}

impl FeatureManager for TimedPresetManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::TimedPreset
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn refresh_state(&mut self, ctx: &FeatureContext<'_>, events: &mut Vec<ThermostatEvent>) -> bool {
        if !self.end.fire_if_due(ctx.now) {
            return false;
        }
        let Some(preset) = self.active.take() else {
            return false;
        };
        info!(name = %self.name, preset = preset.as_str(), "timed preset expired");
        events.push(ThermostatEvent::TimedPresetEnded {
            preset,
            expired: true,
        });
        true
    }

    fn apply(&self, candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        if let Some(preset) = self.active {
            candidate.force_preset(FeatureKind::TimedPreset, preset);
        }
        Ok(Verdict::Continue)
    }

    /// A stored end time in the past is kept as is and reverts on the next refresh.
    fn restore_state(&mut self, snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {
        match snapshot.timed_preset {
            Some(timed) => {
                self.active = Some(timed.preset);
                self.end.arm_at(timed.end);
            }
            None => {
                self.active = None;
                self.end.cancel();
            }
        }
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "timed_preset".to_string(),
            json!({
                "is_active": self.active.is_some(),
                "preset": self.active.map(Preset::as_str),
                "end": self.end.at(),
            }),
        );
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.end.at()
    }
}
