use thiserror::Error;

use crate::{features::FeatureKind, preset::Preset};

/// Rejected configuration. Never coerced to a default.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name}: missing mandatory sensor '{sensor}'")]
    MissingSensor { name: String, sensor: &'static str },
    #[error("{name}: at least one underlying device is required")]
    NoUnderlying { name: String },
    #[error("{name}: '{field}' is out of range ({reason})")]
    OutOfRange {
        name: String,
        field: &'static str,
        reason: String,
    },
    #[error("{name}: preset '{preset}' has no configured temperature")]
    MissingPresetTemperature { name: String, preset: &'static str },
}

/// A service-style command that was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThermostatError {
    #[error("thermostat is locked")]
    Locked,
    #[error("wrong lock code")]
    WrongLockCode,
    #[error("preset '{}' cannot be selected", .0.as_str())]
    InvalidPreset(Preset),
    #[error("preset '{}' has no configured temperature", .0.as_str())]
    PresetNotConfigured(Preset),
    #[error("duration must be between 1 and {max} minutes, got {got}")]
    InvalidDuration { got: i64, max: i64 },
    #[error("invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("no timed preset is active")]
    NoTimedPreset,
    #[error("thermostat is not started")]
    NotStarted,
    #[error("request rejected by the {} feature", .0.as_str())]
    RejectedBy(FeatureKind),
}

impl ThermostatError {
    /// Error reported when reconciliation refuses a request.
    pub fn rejected_by(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Lock => Self::Locked,
            other => Self::RejectedBy(other),
        }
    }
}

/// A feature controller failing while building the candidate state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("no temperature configured for preset '{}'", .0.as_str())]
    MissingPresetTemperature(Preset),
    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    #[error("unknown thermostat '{0}'")]
    UnknownThermostat(String),
    #[error("a thermostat named '{0}' is already registered")]
    DuplicateName(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Thermostat(#[from] ThermostatError),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejection_names_the_feature() {
        assert_eq!(ThermostatError::rejected_by(FeatureKind::Lock), ThermostatError::Locked);

        let err = ThermostatError::rejected_by(FeatureKind::Safety);
        assert_eq!(err, ThermostatError::RejectedBy(FeatureKind::Safety));
        assert_eq!(err.to_string(), "request rejected by the safety feature");
    }
}
