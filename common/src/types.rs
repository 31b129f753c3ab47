use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
    FanOnly,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::FanOnly => "fan_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "heat" => Some(Self::Heat),
            "cool" => Some(Self::Cool),
            "fan_only" => Some(Self::FanOnly),
            _ => None,
        }
    }

    pub fn is_ac(self) -> bool {
        self == Self::Cool
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
    Cooling,
    Fan,
}

impl HvacAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Idle => "idle",
            Self::Heating => "heating",
            Self::Cooling => "cooling",
            Self::Fan => "fan",
        }
    }
}

/// Why the current hvac mode is `Off`. A manual off is never reopened by a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacOffReason {
    Manual,
    Window,
    Safety,
    AutoStartStop,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatKind {
    Switch,
    Valve,
    Climate,
}

impl ThermostatKind {
    /// Whether the thermostat is driven by the TPI duty cycle.
    pub fn uses_tpi(self) -> bool {
        matches!(self, Self::Switch | Self::Valve)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    User,
    Automation,
}

/// Tri-state used by the binary-sensor driven features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    #[default]
    Unavailable,
    Unknown,
    On,
    Off,
}

impl FeatureState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

pub(crate) fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hvac_mode_parses_case_insensitively() {
        assert_eq!(HvacMode::parse("HEAT"), Some(HvacMode::Heat));
        assert_eq!(HvacMode::parse("fan_only"), Some(HvacMode::FanOnly));
        assert_eq!(HvacMode::parse("dry"), None);
    }

    #[test]
    fn round_to_keeps_requested_digits() {
        assert_eq!(round_to(20.456, 2), 20.46);
        assert_eq!(round_to(-1.25, 1), -1.3);
    }
}
