use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    preset::{Preset, PresetCatalog},
    schedule::Schedule,
    types::ThermostatKind,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermostatConfig {
    pub name: String,
    pub kind: ThermostatKind,
    /// Entity ids of the switches, valves or nested climates driven by this thermostat.
    pub underlyings: Vec<String>,
    pub temperature_sensor: Option<String>,
    #[serde(default)]
    pub outdoor_sensor: Option<String>,
    #[serde(default = "default_cycle_min")]
    pub cycle_min: u32,
    #[serde(default = "default_min_temp")]
    pub min_temp: f64,
    #[serde(default = "default_max_temp")]
    pub max_temp: f64,
    #[serde(default)]
    pub ac_mode: bool,
    #[serde(default)]
    pub presets: PresetCatalog,
    #[serde(default)]
    pub tpi: TpiConfig,
    #[serde(default)]
    pub ema: EmaConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub window: Option<WindowConfig>,
    #[serde(default)]
    pub motion: Option<MotionConfig>,
    #[serde(default)]
    pub presence: Option<PresenceConfig>,
    #[serde(default)]
    pub power: Option<PowerConfig>,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub heating_failure: Option<HeatingFailureConfig>,
    #[serde(default)]
    pub auto_start_stop: Option<AutoStartStopConfig>,
    #[serde(default = "default_max_timed_preset_min")]
    pub max_timed_preset_min: i64,
    #[serde(default)]
    pub use_central: CentralOptIns,
}

fn default_cycle_min() -> u32 {
    5
}

fn default_min_temp() -> f64 {
    7.0
}

fn default_max_temp() -> f64 {
    35.0
}

fn default_max_timed_preset_min() -> i64 {
    1_440
}

impl ThermostatConfig {
    /// Minimal configuration for a relay thermostat; everything else at defaults.
    pub fn switch(name: &str, temperature_sensor: &str, switches: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: ThermostatKind::Switch,
            underlyings: switches.iter().map(|s| s.to_string()).collect(),
            temperature_sensor: Some(temperature_sensor.to_string()),
            outdoor_sensor: None,
            cycle_min: default_cycle_min(),
            min_temp: default_min_temp(),
            max_temp: default_max_temp(),
            ac_mode: false,
            presets: PresetCatalog::with_heat(&[
                (Preset::Frost, 7.0),
                (Preset::Eco, 17.0),
                (Preset::Comfort, 19.0),
                (Preset::Boost, 21.0),
            ]),
            tpi: TpiConfig::default(),
            ema: EmaConfig::default(),
            safety: SafetyConfig::default(),
            window: None,
            motion: None,
            presence: None,
            power: None,
            lock: LockConfig::default(),
            heating_failure: None,
            auto_start_stop: None,
            max_timed_preset_min: default_max_timed_preset_min(),
            use_central: CentralOptIns::default(),
        }
    }

    pub fn cycle_sec(&self) -> i64 {
        i64::from(self.cycle_min) * 60
    }

    /// Merges the central defaults this thermostat opted into. Run once, before
    /// [`validate`](Self::validate).
    pub fn resolve(mut self, central: &CentralConfig) -> Self {
        if self.use_central.presets {
            self.presets = central.presets.clone();
        }
        if self.use_central.safety {
            self.safety = central.safety.clone();
        }
        if self.use_central.tpi {
            self.tpi = central.tpi.clone();
        }
        if self.use_central.window {
            if let Some(defaults) = &central.window {
                let sensor = self.window.as_ref().and_then(|w| w.sensor.clone());
                let mut window = defaults.clone();
                window.sensor = sensor;
                self.window = Some(window);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = || self.name.clone();
        let out_of_range = |field: &'static str, reason: String| ConfigError::OutOfRange {
            name: self.name.clone(),
            field,
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(out_of_range("name", "must not be empty".to_string()));
        }
        if self.underlyings.is_empty() {
            return Err(ConfigError::NoUnderlying { name: name() });
        }
        if self.temperature_sensor.is_none() {
            return Err(ConfigError::MissingSensor {
                name: name(),
                sensor: "temperature_sensor",
            });
        }
        if self.cycle_min == 0 {
            return Err(out_of_range("cycle_min", "must be at least 1".to_string()));
        }
        if !(self.min_temp.is_finite() && self.max_temp.is_finite() && self.min_temp < self.max_temp) {
            return Err(out_of_range(
                "min_temp",
                format!("min_temp {} must be below max_temp {}", self.min_temp, self.max_temp),
            ));
        }
        for (preset, temp) in self.presets.all_temperatures() {
            if !(self.min_temp..=self.max_temp).contains(&temp) {
                return Err(out_of_range(
                    "presets",
                    format!(
                        "{} = {temp} outside [{}, {}]",
                        preset.as_str(),
                        self.min_temp,
                        self.max_temp
                    ),
                ));
            }
        }

        self.tpi.validate().map_err(|(field, reason)| out_of_range(field, reason))?;
        self.ema.validate().map_err(|(field, reason)| out_of_range(field, reason))?;
        self.safety.validate().map_err(|(field, reason)| out_of_range(field, reason))?;

        if let Some(window) = &self.window {
            if window.sensor.is_none() && window.auto.is_none() {
                return Err(ConfigError::MissingSensor {
                    name: name(),
                    sensor: "window.sensor",
                });
            }
            window.validate().map_err(|(field, reason)| out_of_range(field, reason))?;
            if matches!(window.action, WindowAction::FrostTemp)
                && !self.presets.is_configured(Preset::Frost, false)
            {
                return Err(ConfigError::MissingPresetTemperature {
                    name: name(),
                    preset: Preset::Frost.as_str(),
                });
            }
            if matches!(window.action, WindowAction::EcoTemp)
                && !self.presets.is_configured(Preset::Eco, false)
            {
                return Err(ConfigError::MissingPresetTemperature {
                    name: name(),
                    preset: Preset::Eco.as_str(),
                });
            }
        }
        if let Some(motion) = &self.motion {
            for preset in [motion.motion_preset, motion.no_motion_preset] {
                if !preset.has_catalog_temperature() || !self.presets.is_configured(preset, false) {
                    return Err(ConfigError::MissingPresetTemperature {
                        name: name(),
                        preset: preset.as_str(),
                    });
                }
            }
        }
        if let Some(power) = &self.power {
            if !(power.device_power.is_finite() && power.device_power > 0.0) {
                return Err(out_of_range(
                    "power.device_power",
                    "must be a positive number of watts".to_string(),
                ));
            }
            if let Some(temp) = power.power_temp {
                if !(self.min_temp..=self.max_temp).contains(&temp) {
                    return Err(out_of_range("power.power_temp", format!("{temp} outside range")));
                }
            }
        }
        if let Some(failure) = &self.heating_failure {
            failure
                .validate()
                .map_err(|(field, reason)| out_of_range(field, reason))?;
        }
        if self.max_timed_preset_min <= 0 {
            return Err(out_of_range(
                "max_timed_preset_min",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

type FieldError = (&'static str, String);

fn check_fraction(field: &'static str, value: f64) -> Result<(), FieldError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err((field, format!("{value} must be within [0, 1]")))
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), FieldError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err((field, format!("{value} must be >= 0")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpiConfig {
    pub coef_int: f64,
    pub coef_ext: f64,
    #[serde(default)]
    pub threshold_low: Option<f64>,
    #[serde(default)]
    pub threshold_high: Option<f64>,
    #[serde(default)]
    pub max_on_percent: Option<f64>,
    #[serde(default = "default_minimal_activation_delay")]
    pub minimal_activation_delay_sec: i64,
    #[serde(default)]
    pub minimal_deactivation_delay_sec: i64,
    #[serde(default)]
    pub auto_tpi: Option<AutoTpiConfig>,
}

fn default_minimal_activation_delay() -> i64 {
    10
}

impl Default for TpiConfig {
    fn default() -> Self {
        Self {
            coef_int: 0.6,
            coef_ext: 0.01,
            threshold_low: None,
            threshold_high: None,
            max_on_percent: None,
            minimal_activation_delay_sec: default_minimal_activation_delay(),
            minimal_deactivation_delay_sec: 0,
            auto_tpi: None,
        }
    }
}

impl TpiConfig {
    fn validate(&self) -> Result<(), FieldError> {
        check_non_negative("tpi.coef_int", self.coef_int)?;
        check_non_negative("tpi.coef_ext", self.coef_ext)?;
        if let Some(max) = self.max_on_percent {
            check_fraction("tpi.max_on_percent", max)?;
        }
        match (self.threshold_low, self.threshold_high) {
            (Some(low), Some(high)) if !(low < high) => {
                return Err((
                    "tpi.threshold_low",
                    format!("{low} must be below threshold_high {high}"),
                ))
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err((
                    "tpi.threshold_low",
                    "threshold_low and threshold_high must be set together".to_string(),
                ))
            }
            _ => {}
        }
        if self.minimal_activation_delay_sec < 0 || self.minimal_deactivation_delay_sec < 0 {
            return Err((
                "tpi.minimal_activation_delay_sec",
                "delays must be >= 0".to_string(),
            ));
        }
        if let Some(auto) = &self.auto_tpi {
            check_non_negative("tpi.auto_tpi.learning_rate", auto.learning_rate)?;
            if !(auto.coef_min <= auto.coef_max) {
                return Err((
                    "tpi.auto_tpi.coef_min",
                    "coef_min must not exceed coef_max".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTpiConfig {
    pub learning_rate: f64,
    pub coef_min: f64,
    pub coef_max: f64,
}

impl Default for AutoTpiConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            coef_min: 0.05,
            coef_max: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaConfig {
    pub halflife_sec: f64,
    pub max_alpha: f64,
    pub precision: u32,
    pub slope_max_gap_min: f64,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            halflife_sec: 300.0,
            max_alpha: 0.5,
            precision: 2,
            slope_max_gap_min: 30.0,
        }
    }
}

impl EmaConfig {
    fn validate(&self) -> Result<(), FieldError> {
        check_non_negative("ema.halflife_sec", self.halflife_sec)?;
        if !(self.max_alpha > 0.0 && self.max_alpha <= 1.0) {
            return Err(("ema.max_alpha", format!("{} must be within (0, 1]", self.max_alpha)));
        }
        if !(self.slope_max_gap_min > 0.0) {
            return Err(("ema.slope_max_gap_min", "must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minutes without a temperature measurement before safety engages. 0 disables.
    pub delay_min: i64,
    pub min_on_percent: f64,
    pub default_on_percent: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            delay_min: 60,
            min_on_percent: 0.5,
            default_on_percent: 0.1,
        }
    }
}

impl SafetyConfig {
    pub(crate) fn validate(&self) -> Result<(), FieldError> {
        if self.delay_min < 0 {
            return Err(("safety.delay_min", "must be >= 0".to_string()));
        }
        check_fraction("safety.min_on_percent", self.min_on_percent)?;
        check_fraction("safety.default_on_percent", self.default_on_percent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowAction {
    #[default]
    TurnOff,
    FanOnly,
    FrostTemp,
    EcoTemp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default)]
    pub sensor: Option<String>,
    /// Seconds the sensor must stay open before the window counts as open.
    #[serde(default = "default_window_delay")]
    pub delay_sec: i64,
    /// Seconds the sensor must stay closed before the window counts as closed.
    #[serde(default = "default_window_delay")]
    pub off_delay_sec: i64,
    #[serde(default)]
    pub auto: Option<WindowAutoConfig>,
    #[serde(default)]
    pub action: WindowAction,
}

fn default_window_delay() -> i64 {
    30
}

impl WindowConfig {
    fn validate(&self) -> Result<(), FieldError> {
        if self.delay_sec < 0 || self.off_delay_sec < 0 {
            return Err(("window.delay_sec", "delays must be >= 0".to_string()));
        }
        if let Some(auto) = &self.auto {
            if !(auto.open_threshold > 0.0) {
                return Err(("window.auto.open_threshold", "must be positive".to_string()));
            }
            if !auto.close_threshold.is_finite() {
                return Err(("window.auto.close_threshold", "must be finite".to_string()));
            }
            if auto.max_duration_min <= 0 {
                return Err(("window.auto.max_duration_min", "must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Slope based detection. Thresholds are in °/hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAutoConfig {
    /// Open when the slope falls below `-open_threshold`.
    pub open_threshold: f64,
    /// Close when the slope rises to `close_threshold` or above.
    pub close_threshold: f64,
    pub max_duration_min: i64,
}

impl Default for WindowAutoConfig {
    fn default() -> Self {
        Self {
            open_threshold: 3.0,
            close_threshold: 0.0,
            max_duration_min: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    pub sensor: String,
    #[serde(default = "default_motion_delay")]
    pub delay_sec: i64,
    #[serde(default = "default_motion_off_delay")]
    pub off_delay_sec: i64,
    #[serde(default = "default_motion_preset")]
    pub motion_preset: Preset,
    #[serde(default = "default_no_motion_preset")]
    pub no_motion_preset: Preset,
}

fn default_motion_delay() -> i64 {
    30
}

fn default_motion_off_delay() -> i64 {
    300
}

fn default_motion_preset() -> Preset {
    Preset::Comfort
}

fn default_no_motion_preset() -> Preset {
    Preset::Eco
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub sensor: String,
    #[serde(default)]
    pub delay_sec: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Watts drawn when the thermostat heats at 100 %.
    pub device_power: f64,
    /// Target used while shed; the previous target is kept when unset.
    #[serde(default)]
    pub power_temp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock rejects user commands.
    pub users: bool,
    /// Lock rejects automation commands (schedules).
    pub automations: bool,
    #[serde(default)]
    pub code: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            users: true,
            automations: false,
            code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatingFailureConfig {
    pub heating_failure_threshold: f64,
    pub cooling_failure_threshold: f64,
    pub detection_delay_min: i64,
    pub temperature_change_tolerance: f64,
}

impl Default for HeatingFailureConfig {
    fn default() -> Self {
        Self {
            heating_failure_threshold: 0.9,
            cooling_failure_threshold: 0.0,
            detection_delay_min: 15,
            temperature_change_tolerance: 0.5,
        }
    }
}

impl HeatingFailureConfig {
    fn validate(&self) -> Result<(), FieldError> {
        check_fraction(
            "heating_failure.heating_failure_threshold",
            self.heating_failure_threshold,
        )?;
        check_fraction(
            "heating_failure.cooling_failure_threshold",
            self.cooling_failure_threshold,
        )?;
        if self.detection_delay_min <= 0 {
            return Err(("heating_failure.detection_delay_min", "must be positive".to_string()));
        }
        check_non_negative(
            "heating_failure.temperature_change_tolerance",
            self.temperature_change_tolerance,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoStartStopLevel {
    #[default]
    None,
    Slow,
    Medium,
    Fast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AutoStartStopConfig {
    pub level: AutoStartStopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CentralOptIns {
    #[serde(default)]
    pub presets: bool,
    #[serde(default)]
    pub safety: bool,
    #[serde(default)]
    pub window: bool,
    #[serde(default)]
    pub tpi: bool,
}

/// Shared defaults and the fleet-wide power and boiler settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CentralConfig {
    #[serde(default)]
    pub presets: PresetCatalog,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub tpi: TpiConfig,
    #[serde(default)]
    pub window: Option<WindowConfig>,
    #[serde(default)]
    pub power: Option<CentralPowerConfig>,
    #[serde(default)]
    pub boiler: Option<CentralBoilerConfig>,
}

impl CentralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let out_of_range = |(field, reason): FieldError| ConfigError::OutOfRange {
            name: "central".to_string(),
            field,
            reason,
        };
        self.safety.validate().map_err(out_of_range)?;
        self.tpi.validate().map_err(out_of_range)?;
        if let Some(power) = &self.power {
            if power.shedding_debounce_sec < 0 {
                return Err(out_of_range((
                    "power.shedding_debounce_sec",
                    "must be >= 0".to_string(),
                )));
            }
        }
        if let Some(boiler) = &self.boiler {
            if boiler.active_device_threshold == 0 {
                return Err(out_of_range((
                    "boiler.active_device_threshold",
                    "must be at least 1".to_string(),
                )));
            }
            if boiler.activation_delay_sec < 0 {
                return Err(out_of_range((
                    "boiler.activation_delay_sec",
                    "must be >= 0".to_string(),
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralPowerConfig {
    pub power_sensor: String,
    pub max_power_sensor: String,
    #[serde(default = "default_shedding_debounce")]
    pub shedding_debounce_sec: i64,
}

fn default_shedding_debounce() -> i64 {
    20
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralBoilerConfig {
    /// Entity id of the boiler switch.
    pub entity: String,
    pub active_device_threshold: usize,
    #[serde(default)]
    pub activation_delay_sec: i64,
}

/// Contents of `fleet.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// IANA zone the weekly schedules are written in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub central: CentralConfig,
    #[serde(default)]
    pub thermostats: Vec<FleetThermostatConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            network: NetworkConfig::default(),
            central: CentralConfig::default(),
            thermostats: Vec::new(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetThermostatConfig {
    #[serde(flatten)]
    pub thermostat: ThermostatConfig,
    #[serde(default)]
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_user: String,
    #[serde(default)]
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_switch_config_is_valid() {
        ThermostatConfig::switch("living", "sensor.living", &["switch.heater"])
            .validate()
            .unwrap();
    }

    #[test]
    fn missing_temperature_sensor_is_rejected() {
        let mut config = ThermostatConfig::switch("living", "sensor.living", &["switch.heater"]);
        config.temperature_sensor = None;

        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingSensor {
                name: "living".to_string(),
                sensor: "temperature_sensor",
            })
        );
    }

    #[test]
    fn out_of_range_fraction_is_not_coerced() {
        let mut config = ThermostatConfig::switch("living", "sensor.living", &["switch.heater"]);
        config.safety.default_on_percent = 1.5;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "safety.default_on_percent",
                ..
            })
        ));
    }

    #[test]
    fn thresholds_must_come_in_pairs() {
        let mut config = ThermostatConfig::switch("living", "sensor.living", &["switch.heater"]);
        config.tpi.threshold_low = Some(0.1);

        assert!(config.validate().is_err());

        config.tpi.threshold_high = Some(0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn central_presets_are_merged_once() {
        let central = CentralConfig {
            presets: PresetCatalog::with_heat(&[(Preset::Comfort, 20.5)]),
            ..CentralConfig::default()
        };
        let mut config = ThermostatConfig::switch("living", "sensor.living", &["switch.heater"]);
        config.use_central.presets = true;

        let resolved = config.resolve(&central);

        assert_eq!(resolved.presets.heat.get(&Preset::Comfort), Some(&20.5));
        assert!(!resolved.presets.heat.contains_key(&Preset::Eco));
    }

    #[test]
    fn central_window_keeps_own_sensor() {
        let central = CentralConfig {
            window: Some(WindowConfig {
                sensor: Some("binary_sensor.central".to_string()),
                delay_sec: 60,
                off_delay_sec: 10,
                auto: None,
                action: WindowAction::EcoTemp,
            }),
            ..CentralConfig::default()
        };
        let mut config = ThermostatConfig::switch("living", "sensor.living", &["switch.heater"]);
        config.use_central.window = true;
        config.window = Some(WindowConfig {
            sensor: Some("binary_sensor.living_window".to_string()),
            delay_sec: 1,
            off_delay_sec: 1,
            auto: None,
            action: WindowAction::TurnOff,
        });

        let window = config.resolve(&central).window.unwrap();

        assert_eq!(window.sensor.as_deref(), Some("binary_sensor.living_window"));
        assert_eq!(window.delay_sec, 60);
        assert_eq!(window.action, WindowAction::EcoTemp);
    }

    #[test]
    fn fleet_file_loads_with_defaults() {
        let raw = r#"{
            "timezone": "Europe/Paris",
            "thermostats": [{
                "name": "living",
                "kind": "switch",
                "underlyings": ["switch.living_heater"],
                "temperature_sensor": "sensor.living_temperature",
                "presets": {"heat": {"comfort": 19.0}},
                "schedule": {"enabled": true, "entries": [{"day": "MON", "startMinutes": 420, "preset": "comfort"}]}
            }]
        }"#;

        let fleet: FleetConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(fleet.network.mqtt_port, 1883);
        assert_eq!(fleet.thermostats.len(), 1);
        let entry = &fleet.thermostats[0];
        assert_eq!(entry.thermostat.cycle_min, 5);
        assert!(entry.schedule.enabled);
        entry.thermostat.validate().unwrap();
    }
}
