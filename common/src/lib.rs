pub mod central_boiler;
pub mod central_power;
pub mod clock;
pub mod config;
pub mod ema;
pub mod error;
pub mod event;
pub mod features;
pub mod fleet;
pub mod preset;
pub mod schedule;
pub mod snapshot;
pub mod state;
pub mod thermostat;
pub mod timer;
pub mod topics;
pub mod tpi;
pub mod types;
pub mod underlying;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CentralConfig, FleetConfig, NetworkConfig, SafetyConfig, ThermostatConfig};
pub use error::{ConfigError, FeatureError, FleetError, ThermostatError};
pub use event::{DeviceAction, DeviceCommand, Outcome, SensorEvent, SensorKind, SensorValue, ThermostatEvent};
pub use fleet::{Fleet, FleetOutcome};
pub use preset::Preset;
pub use schedule::{DayOfWeek, Schedule, ScheduleEntry};
pub use snapshot::ThermostatSnapshot;
pub use state::VThermState;
pub use thermostat::Thermostat;
pub use topics::*;
pub use types::{HvacAction, HvacMode, HvacOffReason, RequestSource, ThermostatKind};
