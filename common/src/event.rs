use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{preset::Preset, types::HvacMode};

/// A parsed sensor payload. Anything that is not usable data never gets here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorValue {
    Number(f64),
    Bool(bool),
}

impl SensorValue {
    /// Parses a raw state. `unavailable`, `unknown`, empty, NaN and infinities are "no data".
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "unavailable" | "unknown" | "none" | "null" => None,
            "on" | "true" | "open" | "home" | "detected" => Some(Self::Bool(true)),
            "off" | "false" | "closed" | "not_home" | "clear" => Some(Self::Bool(false)),
            _ => trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Self::Number),
        }
    }

    pub fn as_number(self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(value),
            Self::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::Number(value) => Some(value != 0.0),
        }
    }
}

/// Which input of a thermostat a reading feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    OutdoorTemperature,
    Window,
    Motion,
    Presence,
    /// State reported back by an underlying device (index into the thermostat's list).
    Underlying(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorEvent {
    pub kind: SensorKind,
    pub value: SensorValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceAction {
    TurnOn,
    TurnOff,
    SetValvePosition { percent: u8 },
    SetTemperature { temperature: f64 },
    SetHvacMode { mode: HvacMode },
}

impl DeviceAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::SetValvePosition { .. } => "set_valve_position",
            Self::SetTemperature { .. } => "set_temperature",
            Self::SetHvacMode { .. } => "set_hvac_mode",
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Self::TurnOn => "on".to_string(),
            Self::TurnOff => "off".to_string(),
            Self::SetValvePosition { percent } => percent.to_string(),
            Self::SetTemperature { temperature } => format!("{temperature:.1}"),
            Self::SetHvacMode { mode } => mode.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub entity_id: String,
    #[serde(flatten)]
    pub action: DeviceAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEventKind {
    Shed,
    Restored,
    NotAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ThermostatEvent {
    SafetyStarted {
        last_temperature_age_min: Option<f64>,
        last_outdoor_age_min: Option<f64>,
    },
    SafetyEnded,
    WindowOpened {
        auto: bool,
    },
    WindowClosed {
        auto: bool,
    },
    Power {
        kind: PowerEventKind,
        device_power: f64,
    },
    HeatingFailure {
        active: bool,
        on_percent: f64,
        temperature: Option<f64>,
    },
    CoolingFailure {
        active: bool,
        temperature: Option<f64>,
    },
    AutoStartStop {
        stopped: bool,
    },
    TimedPresetStarted {
        preset: Preset,
        end: DateTime<Utc>,
    },
    TimedPresetEnded {
        preset: Preset,
        expired: bool,
    },
    DispatchFailed {
        entity_id: String,
        action: String,
    },
}

/// Side effects produced by one core operation, executed by the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub commands: Vec<DeviceCommand>,
    pub events: Vec<ThermostatEvent>,
    /// The persistable state changed and a snapshot should be written.
    pub persist: bool,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty() && !self.persist
    }

    pub fn merge(&mut self, mut other: Outcome) {
        self.commands.append(&mut other.commands);
        self.events.append(&mut other.events);
        self.persist |= other.persist;
    }
}
