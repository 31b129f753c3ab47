use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    features::{safety::SafetySnapshot, timed_preset::TimedPresetSnapshot},
    state::VThermState,
    tpi::LearnedCoefficients,
};

/// Everything a thermostat needs to come back after a restart.
///
/// Fields added later default when absent so older files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatSnapshot {
    pub name: String,
    pub saved_at: DateTime<Utc>,
    pub requested: VThermState,
    pub current: VThermState,
    #[serde(default)]
    pub safety: SafetySnapshot,
    #[serde(default)]
    pub window_bypass: bool,
    #[serde(default)]
    pub timed_preset: Option<TimedPresetSnapshot>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub overpowering: bool,
    #[serde(default)]
    pub auto_start_stop_stopped: bool,
    #[serde(default)]
    pub energy_wh: f64,
    #[serde(default)]
    pub learned_tpi: Option<LearnedCoefficients>,
}

impl ThermostatSnapshot {
    /// A snapshot carrying only the two states; every feature field at rest.
    pub fn bare(name: &str, saved_at: DateTime<Utc>, requested: VThermState, current: VThermState) -> Self {
        Self {
            name: name.to_string(),
            saved_at,
            requested,
            current,
            safety: SafetySnapshot::default(),
            window_bypass: false,
            timed_preset: None,
            locked: false,
            overpowering: false,
            auto_start_stop_stopped: false,
            energy_wh: 0.0,
            learned_tpi: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{preset::Preset, types::HvacMode};

    #[test]
    fn minimal_file_loads_with_defaults() {
        let raw = r#"{
            "name": "living",
            "saved_at": "2026-01-05T08:00:00Z",
            "requested": {"hvac_mode": "heat", "target_temperature": 19.0, "preset": "comfort"},
            "current": {"hvac_mode": "off", "target_temperature": 19.0, "preset": "comfort", "hvac_off_reason": "window"}
        }"#;

        let snapshot: ThermostatSnapshot = serde_json::from_str(raw).unwrap();

        assert_eq!(
            snapshot,
            ThermostatSnapshot::bare(
                "living",
                Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap(),
                VThermState::new(HvacMode::Heat, Some(19.0), Preset::Comfort),
                {
                    let mut current = VThermState::new(HvacMode::Heat, Some(19.0), Preset::Comfort);
                    current.set_hvac_mode(HvacMode::Off, Some(crate::types::HvacOffReason::Window));
                    current.reset_changes();
                    current
                },
            )
        );
    }
}
