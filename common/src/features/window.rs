use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{DebouncedSensor, FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::{WindowAction, WindowConfig},
    error::FeatureError,
    event::ThermostatEvent,
    preset::{find_preset_temp, Preset},
    snapshot::ThermostatSnapshot,
    state::Candidate,
    timer::Deadline,
    types::{FeatureState, HvacMode, HvacOffReason, ThermostatKind},
};

/// Open-window handling from a contact sensor and/or a fast temperature drop.
#[derive(Debug, Clone)]
pub struct WindowManager {
    name: String,
    kind: ThermostatKind,
    config: Option<WindowConfig>,
    sensor: DebouncedSensor,
    auto_state: FeatureState,
    auto_max_duration: Deadline,
    /// Set when the maximum duration forced the auto window closed. Detection
    /// stays off until the slope recovers to the close threshold.
    auto_latched: bool,
    bypass: bool,
}

impl WindowManager {
    pub fn new(name: &str, kind: ThermostatKind, config: Option<&WindowConfig>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            config: config.cloned(),
            sensor: DebouncedSensor::default(),
            auto_state: FeatureState::Unavailable,
            auto_max_duration: Deadline::default(),
            auto_latched: false,
            bypass: false,
        }
    }

    pub fn sensor_entity(&self) -> Option<&str> {
        self.config.as_ref().and_then(|c| c.sensor.as_deref())
    }

    pub fn window_state(&self) -> FeatureState {
        self.sensor.state()
    }

    pub fn auto_state(&self) -> FeatureState {
        self.auto_state
    }

    /// Open by sensor or by auto detection.
    pub fn is_open(&self) -> bool {
        self.sensor.state().is_on() || self.auto_state.is_on()
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Returns true when the override changes as a result.
    pub fn set_bypass(&mut self, bypass: bool) -> bool {
        if self.bypass == bypass {
            return false;
        }
        info!(name = %self.name, bypass, "window bypass changed");
        self.bypass = bypass;
        self.is_open()
    }

    /// Raw contact sensor reading. Returns true when the window state changed at once.
    pub fn on_sensor(&mut self, open: bool, now: DateTime<Utc>, events: &mut Vec<ThermostatEvent>) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        if config.sensor.is_none() {
            return false;
        }
        let (delay, off_delay) = (config.delay_sec, config.off_delay_sec);
        if self.sensor.update(open, now, delay, off_delay) {
            self.log_transition(false, events);
            return true;
        }
        false
    }

    fn log_transition(&self, auto: bool, events: &mut Vec<ThermostatEvent>) {
        let open = if auto {
            self.auto_state.is_on()
        } else {
            self.sensor.state().is_on()
        };
        info!(name = %self.name, auto, open, bypass = self.bypass, "window state changed");
        events.push(if open {
            ThermostatEvent::WindowOpened { auto }
        } else {
            ThermostatEvent::WindowClosed { auto }
        });
    }

    fn refresh_auto(&mut self, ctx: &FeatureContext<'_>, events: &mut Vec<ThermostatEvent>) -> bool {
        let Some(auto) = self.config.as_ref().and_then(|c| c.auto.clone()) else {
            return false;
        };
        if self.auto_state == FeatureState::Unavailable {
            self.auto_state = FeatureState::Unknown;
        }

        if self.auto_state.is_on() && self.auto_max_duration.fire_if_due(ctx.now) {
            info!(name = %self.name, "auto window open for too long, closing it");
            self.auto_state = FeatureState::Off;
            self.auto_latched = true;
            self.log_transition(true, events);
            return true;
        }

        let Some(slope) = ctx.measurements.slope else {
            return false;
        };
        if self.auto_latched {
            if slope >= auto.close_threshold {
                info!(name = %self.name, slope, "temperature recovered, auto window detection re-armed");
                self.auto_latched = false;
            }
            return false;
        }
        if !self.auto_state.is_on() {
            if slope < -auto.open_threshold && ctx.requested.hvac_mode() != HvacMode::Off {
                self.auto_state = FeatureState::On;
                self.auto_max_duration
                    .arm_in(ctx.now, Duration::minutes(auto.max_duration_min));
                self.log_transition(true, events);
                return true;
            }
            if self.auto_state == FeatureState::Unknown {
                self.auto_state = FeatureState::Off;
            }
        } else if slope >= auto.close_threshold {
            self.auto_state = FeatureState::Off;
            self.auto_max_duration.cancel();
            self.log_transition(true, events);
            return true;
        }
        false
    }
}

impl FeatureManager for WindowManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Window
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn start_listening(&mut self, _now: DateTime<Utc>) {
        if self.sensor_entity().is_some() {
            self.sensor.start();
        }
    }

    fn stop_listening(&mut self) {
        self.sensor.stop();
        self.auto_max_duration.cancel();
        self.auto_latched = false;
        if self.auto_state != FeatureState::Unavailable {
            self.auto_state = FeatureState::Unknown;
        }
    }

    fn refresh_state(&mut self, ctx: &FeatureContext<'_>, events: &mut Vec<ThermostatEvent>) -> bool {
        if !self.is_configured() {
            return false;
        }
        let mut changed = false;
        if self.sensor.fire(ctx.now) {
            self.log_transition(false, events);
            changed = true;
        }
        changed | self.refresh_auto(ctx, events)
    }

    fn apply(&self, candidate: &mut Candidate, ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        let Some(config) = &self.config else {
            return Ok(Verdict::Continue);
        };
        if !self.is_open() || self.bypass {
            return Ok(Verdict::Continue);
        }

        let mode = candidate.hvac_mode();
        let frost_or_eco = |preset: Preset| {
            find_preset_temp(ctx.catalog, preset, mode, true, ctx.ac_mode)
                .ok_or(FeatureError::MissingPresetTemperature(preset))
        };
        match config.action {
            WindowAction::TurnOff => {
                candidate.force_hvac_mode(FeatureKind::Window, HvacMode::Off, Some(HvacOffReason::Window));
            }
            WindowAction::FanOnly if self.kind == ThermostatKind::Climate => {
                if candidate.hvac_mode() != HvacMode::Off {
                    candidate.force_hvac_mode(FeatureKind::Window, HvacMode::FanOnly, None);
                }
            }
            WindowAction::FanOnly => {
                candidate.force_hvac_mode(FeatureKind::Window, HvacMode::Off, Some(HvacOffReason::Window));
            }
            WindowAction::FrostTemp => {
                let target = frost_or_eco(Preset::Frost)?;
                candidate.force_target_temperature(FeatureKind::Window, target);
            }
            WindowAction::EcoTemp => {
                let target = frost_or_eco(Preset::Eco)?;
                candidate.force_target_temperature(FeatureKind::Window, target);
            }
        }
        Ok(Verdict::Continue)
    }

    fn restore_state(&mut self, snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {
        self.bypass = snapshot.window_bypass;
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "window".to_string(),
            json!({
                "configured": self.is_configured(),
                "state": self.sensor.state().as_str(),
                "auto_state": self.auto_state.as_str(),
                "bypass": self.bypass,
                "action": self.config.as_ref().map(|c| c.action),
                "sensor_live": self.sensor.live(),
            }),
        );
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.sensor.deadline(), self.auto_max_duration.at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::WindowAutoConfig,
        features::Measurements,
        preset::PresetCatalog,
        state::VThermState,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn sensor_config(action: WindowAction) -> WindowConfig {
        WindowConfig {
            sensor: Some("binary_sensor.window".to_string()),
            delay_sec: 30,
            off_delay_sec: 10,
            auto: None,
            action,
        }
    }

    struct Fixture {
        state: VThermState,
        measurements: Measurements,
        catalog: PresetCatalog,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: VThermState::new(HvacMode::Heat, Some(19.0), Preset::Comfort),
                measurements: Measurements::default(),
                catalog: PresetCatalog::with_heat(&[(Preset::Frost, 7.0), (Preset::Eco, 17.0)]),
            }
        }

        fn ctx(&self, now: DateTime<Utc>, kind: ThermostatKind) -> FeatureContext<'_> {
            FeatureContext {
                now,
                name: "living",
                kind,
                requested: &self.state,
                current: &self.state,
                request_source: None,
                measurements: &self.measurements,
                catalog: &self.catalog,
                ac_mode: false,
                on_percent: 0.0,
                calculated_on_percent: 0.0,
            }
        }
    }

    #[test]
    fn open_is_confirmed_after_delay() {
        let fixture = Fixture::new();
        let config = sensor_config(WindowAction::TurnOff);
        let mut window = WindowManager::new("living", ThermostatKind::Switch, Some(&config));
        window.start_listening(t0());
        let mut events = Vec::new();

        assert!(!window.on_sensor(true, t0(), &mut events));
        assert!(!window.is_open());
        assert_eq!(window.next_deadline(), Some(t0() + Duration::seconds(30)));

        let ctx = fixture.ctx(t0() + Duration::seconds(30), ThermostatKind::Switch);
        assert!(window.refresh_state(&ctx, &mut events));
        assert!(window.is_open());
        assert_eq!(events, vec![ThermostatEvent::WindowOpened { auto: false }]);

        let mut candidate = Candidate::from_requested(&fixture.state);
        window.apply(&mut candidate, &ctx).unwrap();
        assert_eq!(candidate.hvac_mode(), HvacMode::Off);
        assert_eq!(candidate.state().hvac_off_reason(), Some(HvacOffReason::Window));
    }

    #[test]
    fn bypass_disables_override() {
        let fixture = Fixture::new();
        let config = WindowConfig {
            delay_sec: 0,
            ..sensor_config(WindowAction::TurnOff)
        };
        let mut window = WindowManager::new("living", ThermostatKind::Switch, Some(&config));
        window.on_sensor(true, t0(), &mut Vec::new());
        assert!(window.set_bypass(true));

        let mut candidate = Candidate::from_requested(&fixture.state);
        window
            .apply(&mut candidate, &fixture.ctx(t0(), ThermostatKind::Switch))
            .unwrap();

        assert_eq!(candidate.hvac_mode(), HvacMode::Heat);
    }

    #[test]
    fn eco_action_pins_target() {
        let fixture = Fixture::new();
        let config = WindowConfig {
            delay_sec: 0,
            ..sensor_config(WindowAction::EcoTemp)
        };
        let mut window = WindowManager::new("living", ThermostatKind::Switch, Some(&config));
        window.on_sensor(true, t0(), &mut Vec::new());

        let mut candidate = Candidate::from_requested(&fixture.state);
        window
            .apply(&mut candidate, &fixture.ctx(t0(), ThermostatKind::Switch))
            .unwrap();

        assert_eq!(candidate.hvac_mode(), HvacMode::Heat);
        assert_eq!(candidate.state().target_temperature(), Some(17.0));
        assert_eq!(candidate.pins().target_temperature, Some(FeatureKind::Window));
    }

    #[test]
    fn fan_only_needs_a_climate() {
        let fixture = Fixture::new();
        let config = WindowConfig {
            delay_sec: 0,
            ..sensor_config(WindowAction::FanOnly)
        };
        for (kind, expected) in [
            (ThermostatKind::Climate, HvacMode::FanOnly),
            (ThermostatKind::Switch, HvacMode::Off),
        ] {
            let mut window = WindowManager::new("living", kind, Some(&config));
            window.on_sensor(true, t0(), &mut Vec::new());
            let mut candidate = Candidate::from_requested(&fixture.state);
            window.apply(&mut candidate, &fixture.ctx(t0(), kind)).unwrap();
            assert_eq!(candidate.hvac_mode(), expected);
        }
    }

    #[test]
    fn auto_detection_follows_slope_with_max_duration() {
        let mut fixture = Fixture::new();
        let config = WindowConfig {
            sensor: None,
            auto: Some(WindowAutoConfig {
                open_threshold: 3.0,
                close_threshold: 0.0,
                max_duration_min: 30,
            }),
            ..sensor_config(WindowAction::TurnOff)
        };
        let mut window = WindowManager::new("living", ThermostatKind::Switch, Some(&config));
        let mut events = Vec::new();

        fixture.measurements.slope = Some(-1.0);
        assert!(!window.refresh_state(&fixture.ctx(t0(), ThermostatKind::Switch), &mut events));
        assert_eq!(window.auto_state(), FeatureState::Off);

        fixture.measurements.slope = Some(-4.5);
        assert!(window.refresh_state(&fixture.ctx(t0(), ThermostatKind::Switch), &mut events));
        assert!(window.is_open());

        // Still falling, but the maximum duration ran out.
        let later = t0() + Duration::minutes(30);
        assert!(window.refresh_state(&fixture.ctx(later, ThermostatKind::Switch), &mut events));
        assert!(!window.is_open());
        assert_eq!(
            events,
            vec![
                ThermostatEvent::WindowOpened { auto: true },
                ThermostatEvent::WindowClosed { auto: true },
            ]
        );
    }

    #[test]
    fn max_duration_holds_until_the_slope_recovers() {
        let mut fixture = Fixture::new();
        let config = WindowConfig {
            sensor: None,
            auto: Some(WindowAutoConfig {
                open_threshold: 3.0,
                close_threshold: 0.0,
                max_duration_min: 30,
            }),
            ..sensor_config(WindowAction::TurnOff)
        };
        let mut window = WindowManager::new("living", ThermostatKind::Switch, Some(&config));
        let mut events = Vec::new();

        fixture.measurements.slope = Some(-4.5);
        assert!(window.refresh_state(&fixture.ctx(t0(), ThermostatKind::Switch), &mut events));
        let expiry = t0() + Duration::minutes(30);
        assert!(window.refresh_state(&fixture.ctx(expiry, ThermostatKind::Switch), &mut events));

        // Same slope one second and one hour later: the window stays closed.
        for later in [expiry + Duration::seconds(1), expiry + Duration::hours(1)] {
            assert!(!window.refresh_state(&fixture.ctx(later, ThermostatKind::Switch), &mut events));
            assert!(!window.is_open());
        }
        assert_eq!(events.len(), 2);

        // Recovery re-arms detection; the next fast drop opens again.
        fixture.measurements.slope = Some(0.5);
        let recovered = expiry + Duration::hours(2);
        assert!(!window.refresh_state(&fixture.ctx(recovered, ThermostatKind::Switch), &mut events));
        fixture.measurements.slope = Some(-4.5);
        assert!(window.refresh_state(
            &fixture.ctx(recovered + Duration::minutes(5), ThermostatKind::Switch),
            &mut events
        ));
        assert!(window.is_open());
        assert_eq!(events.last(), Some(&ThermostatEvent::WindowOpened { auto: true }));
    }
}
