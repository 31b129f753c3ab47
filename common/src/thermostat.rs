//! One virtual thermostat: sensor ingestion, reconciliation of the requested
//! state against every feature, and the control cycle that drives the devices.
//!
//! Nothing here performs I/O. Every entry point returns an [`Outcome`] the host
//! executes: device commands, events, and whether the snapshot must be written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    central_power::{PowerDevice, SharedPowerLedger},
    clock::Clock,
    config::{SafetyConfig, ThermostatConfig},
    ema::{ExponentialMovingAverage, TemperatureSlope},
    error::{ConfigError, ThermostatError},
    event::{Outcome, SensorEvent, SensorKind, ThermostatEvent},
    features::{
        AutoStartStopManager, FeatureContext, FeatureKind, FeatureManager, HeatingFailureManager,
        LockManager, Measurements, MotionManager, PowerManager, PresenceManager, SafetyManager,
        TimedPresetManager, WindowManager, RECONCILIATION_ORDER,
    },
    preset::Preset,
    snapshot::ThermostatSnapshot,
    state::{Reconciliation, StateManager, TargetResolver, VThermState},
    tpi::{CycleSample, CycleTimes, TpiAlgorithm},
    types::{HvacAction, HvacMode, RequestSource, ThermostatKind},
    underlying::Underlyings,
};

/// Every feature, the observing ones included.
const ALL_FEATURES: [FeatureKind; 9] = [
    FeatureKind::Lock,
    FeatureKind::Safety,
    FeatureKind::Window,
    FeatureKind::AutoStartStop,
    FeatureKind::Power,
    FeatureKind::Presence,
    FeatureKind::Motion,
    FeatureKind::TimedPreset,
    FeatureKind::HeatingFailure,
];

#[derive(Debug, Clone)]
struct Features {
    lock: LockManager,
    safety: SafetyManager,
    window: WindowManager,
    auto_start_stop: AutoStartStopManager,
    power: PowerManager,
    presence: PresenceManager,
    motion: MotionManager,
    timed_preset: TimedPresetManager,
    heating_failure: HeatingFailureManager,
}

impl Features {
    fn new(config: &ThermostatConfig) -> Self {
        let name = config.name.as_str();
        Self {
            lock: LockManager::new(name, &config.lock),
            safety: SafetyManager::new(name, config.kind, &config.safety),
            window: WindowManager::new(name, config.kind, config.window.as_ref()),
            auto_start_stop: AutoStartStopManager::new(name, config.auto_start_stop.as_ref()),
            power: PowerManager::new(name, config.power.as_ref()),
            presence: PresenceManager::new(name, config.presence.as_ref()),
            motion: MotionManager::new(name, config.motion.as_ref()),
            timed_preset: TimedPresetManager::new(name, config.max_timed_preset_min),
            heating_failure: HeatingFailureManager::new(
                name,
                config.kind.uses_tpi(),
                config.heating_failure.as_ref(),
            ),
        }
    }

    fn get(&self, kind: FeatureKind) -> &dyn FeatureManager {
        match kind {
            FeatureKind::Lock => &self.lock,
            FeatureKind::Safety => &self.safety,
            FeatureKind::Window => &self.window,
            FeatureKind::AutoStartStop => &self.auto_start_stop,
            FeatureKind::Power => &self.power,
            FeatureKind::Presence => &self.presence,
            FeatureKind::Motion => &self.motion,
            FeatureKind::TimedPreset => &self.timed_preset,
            FeatureKind::HeatingFailure => &self.heating_failure,
        }
    }

    fn get_mut(&mut self, kind: FeatureKind) -> &mut dyn FeatureManager {
        match kind {
            FeatureKind::Lock => &mut self.lock,
            FeatureKind::Safety => &mut self.safety,
            FeatureKind::Window => &mut self.window,
            FeatureKind::AutoStartStop => &mut self.auto_start_stop,
            FeatureKind::Power => &mut self.power,
            FeatureKind::Presence => &mut self.presence,
            FeatureKind::Motion => &mut self.motion,
            FeatureKind::TimedPreset => &mut self.timed_preset,
            FeatureKind::HeatingFailure => &mut self.heating_failure,
        }
    }
}

/// Copy of both states handed to the features while the manager is borrowed.
struct StateView {
    requested: VThermState,
    current: VThermState,
    source: Option<RequestSource>,
}

impl StateView {
    fn of(state: &StateManager) -> Self {
        Self {
            requested: state.requested().clone(),
            current: state.current().clone(),
            source: state.pending_source(),
        }
    }
}

fn feature_context<'a>(
    now: DateTime<Utc>,
    config: &'a ThermostatConfig,
    view: &'a StateView,
    measurements: &'a Measurements,
    tpi: &TpiAlgorithm,
) -> FeatureContext<'a> {
    FeatureContext {
        now,
        name: &config.name,
        kind: config.kind,
        requested: &view.requested,
        current: &view.current,
        request_source: view.source,
        measurements,
        catalog: &config.presets,
        ac_mode: config.ac_mode,
        on_percent: tpi.on_percent(),
        calculated_on_percent: tpi.calculated_on_percent(),
    }
}

/// Conditions at the start of the running cycle, for energy and auto-TPI.
#[derive(Debug, Clone, Copy)]
struct CycleStart {
    on_percent: f64,
    mode: HvacMode,
    target: Option<f64>,
    temperature: Option<f64>,
}

pub struct Thermostat {
    config: ThermostatConfig,
    clock: Arc<dyn Clock>,
    state: StateManager,
    measurements: Measurements,
    ema: ExponentialMovingAverage,
    slope: TemperatureSlope,
    tpi: TpiAlgorithm,
    underlyings: Underlyings,
    features: Features,
    started: bool,
    hvac_action: HvacAction,
    energy_wh: f64,
    cycle_start: Option<CycleStart>,
    /// Set when a cycle was cut short and the next tick must run one.
    cycle_requested: bool,
}

impl Thermostat {
    /// Builds a stopped thermostat from a resolved configuration.
    pub fn new(config: ThermostatConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;

        let initial_target = config
            .presets
            .heat
            .get(&Preset::Comfort)
            .copied()
            .unwrap_or(config.min_temp);
        let initial = VThermState::new(HvacMode::Off, Some(initial_target), Preset::None);

        Ok(Self {
            clock,
            state: StateManager::new(initial),
            measurements: Measurements {
                outdoor_expected: config.outdoor_sensor.is_some(),
                ..Measurements::default()
            },
            ema: ExponentialMovingAverage::new(
                config.name.clone(),
                config.ema.halflife_sec,
                config.ema.max_alpha,
                config.ema.precision,
            ),
            slope: TemperatureSlope::new(config.ema.slope_max_gap_min),
            tpi: TpiAlgorithm::new(config.name.clone(), &config.tpi, config.cycle_sec()),
            underlyings: Underlyings::new(config.kind, &config.underlyings),
            features: Features::new(&config),
            started: false,
            hvac_action: HvacAction::Off,
            energy_wh: 0.0,
            cycle_start: None,
            cycle_requested: false,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ThermostatConfig {
        &self.config
    }

    pub fn kind(&self) -> ThermostatKind {
        self.config.kind
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn requested_state(&self) -> &VThermState {
        self.state.requested()
    }

    pub fn current_state(&self) -> &VThermState {
        self.state.current()
    }

    pub fn hvac_action(&self) -> HvacAction {
        self.hvac_action
    }

    pub fn temperature(&self) -> Option<f64> {
        self.measurements.temperature
    }

    pub fn on_percent(&self) -> f64 {
        self.tpi.on_percent()
    }

    pub fn calculated_on_percent(&self) -> f64 {
        self.tpi.calculated_on_percent()
    }

    pub fn cycle_times(&self) -> CycleTimes {
        self.tpi.cycle_times()
    }

    pub fn energy_wh(&self) -> f64 {
        self.energy_wh
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.features.safety
    }

    pub fn window(&self) -> &WindowManager {
        &self.features.window
    }

    pub fn power(&self) -> &PowerManager {
        &self.features.power
    }

    pub fn timed_preset(&self) -> &TimedPresetManager {
        &self.features.timed_preset
    }

    pub fn heating_failure(&self) -> &HeatingFailureManager {
        &self.features.heating_failure
    }

    pub fn is_locked(&self) -> bool {
        self.features.lock.is_locked()
    }

    pub fn attach_power_ledger(&mut self, ledger: SharedPowerLedger) {
        self.features.power.attach_ledger(ledger);
    }

    pub fn detach_power_ledger(&mut self) {
        self.features.power.detach_ledger();
    }

    /// Entity ids this thermostat listens to, and what each one feeds.
    pub fn bindings(&self) -> Vec<(String, SensorKind)> {
        let mut bindings = Vec::new();
        if let Some(sensor) = &self.config.temperature_sensor {
            bindings.push((sensor.clone(), SensorKind::Temperature));
        }
        if let Some(sensor) = &self.config.outdoor_sensor {
            bindings.push((sensor.clone(), SensorKind::OutdoorTemperature));
        }
        if let Some(sensor) = self.features.window.sensor_entity() {
            bindings.push((sensor.to_string(), SensorKind::Window));
        }
        if let Some(sensor) = self.features.motion.sensor_entity() {
            bindings.push((sensor.to_string(), SensorKind::Motion));
        }
        if let Some(sensor) = self.features.presence.sensor_entity() {
            bindings.push((sensor.to_string(), SensorKind::Presence));
        }
        for (index, entity_id) in self.underlyings.entity_ids().enumerate() {
            bindings.push((entity_id.to_string(), SensorKind::Underlying(index)));
        }
        bindings
    }

    /// Earliest armed feature timer or end of the running cycle.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let cycle_end = self
            .underlyings
            .window()
            .map(|w| w.started_at + chrono::Duration::seconds(w.cycle_sec));
        ALL_FEATURES
            .iter()
            .filter_map(|kind| self.features.get(*kind).next_deadline())
            .chain(cycle_end)
            .min()
    }

    pub fn start(&mut self) -> Outcome {
        let mut outcome = Outcome::default();
        if self.started {
            return outcome;
        }
        let now = self.clock.now();
        self.started = true;
        for kind in ALL_FEATURES {
            self.features.get_mut(kind).start_listening(now);
        }
        if self.features.safety.is_on() {
            self.tpi.set_safety(self.features.safety.default_on_percent());
        }
        info!(
            name = %self.config.name,
            kind = ?self.config.kind,
            hvac_mode = self.state.requested().hvac_mode().as_str(),
            preset = self.state.requested().preset().as_str(),
            "thermostat started"
        );
        self.reconcile_into(now, &mut outcome);
        self.control_cycle(now, true, &mut outcome);
        outcome
    }

    /// Stops feature timers and turns the devices off. Timed preset end times
    /// are kept for the snapshot.
    pub fn stop(&mut self) -> Outcome {
        for kind in ALL_FEATURES {
            self.features.get_mut(kind).stop_listening();
        }
        self.started = false;
        self.cycle_start = None;
        self.cycle_requested = false;
        let commands = self.underlyings.turn_off_all();
        self.update_hvac_action();
        info!(name = %self.config.name, "thermostat stopped");
        Outcome {
            commands,
            events: Vec::new(),
            persist: true,
        }
    }

    /// Single entry point for readings routed to this thermostat.
    pub fn handle_sensor(&mut self, event: SensorEvent) -> Outcome {
        let now = self.clock.now();
        let mut outcome = Outcome::default();

        match event.kind {
            SensorKind::Temperature => {
                let Some(value) = event.value.as_number() else {
                    debug!(name = %self.config.name, "non numeric temperature ignored");
                    return outcome;
                };
                let ema = self.ema.calculate_ema(value, event.timestamp);
                self.measurements.raw_temperature = Some(value);
                self.measurements.temperature = Some(ema);
                self.measurements.temperature_at = Some(
                    self.measurements
                        .temperature_at
                        .map_or(event.timestamp, |at| at.max(event.timestamp)),
                );
                self.measurements.slope = self.slope.add(ema, event.timestamp);
                debug!(
                    name = %self.config.name,
                    raw = value,
                    ema,
                    slope = ?self.measurements.slope,
                    "temperature updated"
                );
                if self.started {
                    self.control_cycle(now, false, &mut outcome);
                }
            }
            SensorKind::OutdoorTemperature => {
                let Some(value) = event.value.as_number() else {
                    debug!(name = %self.config.name, "non numeric outdoor temperature ignored");
                    return outcome;
                };
                self.measurements.outdoor = Some(value);
                self.measurements.outdoor_at = Some(
                    self.measurements
                        .outdoor_at
                        .map_or(event.timestamp, |at| at.max(event.timestamp)),
                );
                if self.started {
                    self.control_cycle(now, false, &mut outcome);
                }
            }
            SensorKind::Window => {
                let Some(open) = event.value.as_bool() else {
                    return outcome;
                };
                if self.features.window.on_sensor(open, now, &mut outcome.events) {
                    self.settle(now, &mut outcome);
                }
            }
            SensorKind::Motion => {
                let Some(detected) = event.value.as_bool() else {
                    return outcome;
                };
                if self.features.motion.on_sensor(detected, now) {
                    self.settle(now, &mut outcome);
                }
            }
            SensorKind::Presence => {
                let Some(present) = event.value.as_bool() else {
                    return outcome;
                };
                if self.features.presence.on_sensor(present, now) {
                    self.settle(now, &mut outcome);
                }
            }
            SensorKind::Underlying(index) => {
                let Some(on) = event.value.as_bool() else {
                    return outcome;
                };
                self.underlyings.on_reported(index, on);
                self.update_hvac_action();
            }
        }
        outcome
    }

    /// Fires due timers and runs the control cycle at cycle boundaries. Called
    /// by the host once per second.
    pub fn tick(&mut self) -> Outcome {
        let mut outcome = Outcome::default();
        if !self.started {
            return outcome;
        }
        let now = self.clock.now();

        let mut changed = false;
        for kind in [
            FeatureKind::TimedPreset,
            FeatureKind::Presence,
            FeatureKind::Motion,
            FeatureKind::Window,
        ] {
            changed |= self.refresh(kind, now, &mut outcome.events);
        }
        if changed {
            changed = self.reconcile_into(now, &mut outcome);
        }

        let requested = std::mem::take(&mut self.cycle_requested);
        if changed || requested || self.underlyings.window_elapsed(now) {
            self.control_cycle(now, true, &mut outcome);
        } else {
            // Staggered relays switch inside the running cycle.
            self.dispatch(now, &mut outcome);
        }
        outcome
    }

    pub fn set_hvac_mode(
        &mut self,
        mode: HvacMode,
        source: RequestSource,
    ) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        match mode {
            HvacMode::Cool if !self.config.ac_mode => {
                return Err(ThermostatError::InvalidParameter {
                    name: "hvac_mode",
                    reason: "cooling requires ac_mode".to_string(),
                })
            }
            HvacMode::FanOnly if self.config.kind != ThermostatKind::Climate => {
                return Err(ThermostatError::InvalidParameter {
                    name: "hvac_mode",
                    reason: "fan_only is only available on climate thermostats".to_string(),
                })
            }
            _ => {}
        }
        self.state
            .request(source, |state| state.set_hvac_mode(mode, None));
        self.apply_request()
    }

    /// A user preset change also ends a running timed preset.
    pub fn set_preset(
        &mut self,
        preset: Preset,
        source: RequestSource,
    ) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        self.check_selectable(preset)?;
        self.state.request(source, |state| state.set_preset(preset));
        let mut outcome = self.apply_request()?;

        if source == RequestSource::User && self.features.timed_preset.active().is_some() {
            let now = self.clock.now();
            if self.features.timed_preset.cancel(&mut outcome.events).is_ok() {
                self.settle(now, &mut outcome);
            }
        }
        Ok(outcome)
    }

    /// A manual target drops the preset.
    pub fn set_target_temperature(
        &mut self,
        temperature: f64,
        source: RequestSource,
    ) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        if !temperature.is_finite()
            || !(self.config.min_temp..=self.config.max_temp).contains(&temperature)
        {
            return Err(ThermostatError::InvalidParameter {
                name: "temperature",
                reason: format!(
                    "{temperature} outside [{}, {}]",
                    self.config.min_temp, self.config.max_temp
                ),
            });
        }
        self.state.request(source, |state| {
            state.set_target_temperature(Some(temperature));
            state.set_preset(Preset::None);
        });
        self.apply_request()
    }

    pub fn set_timed_preset(
        &mut self,
        preset: Preset,
        duration_min: i64,
        source: RequestSource,
    ) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        self.features.lock.check(source)?;
        if preset == Preset::None {
            return Err(ThermostatError::InvalidPreset(preset));
        }
        self.check_selectable(preset)?;

        let now = self.clock.now();
        let mut outcome = Outcome::default();
        self.features
            .timed_preset
            .set(preset, duration_min, now, &mut outcome.events)?;
        self.settle(now, &mut outcome);
        outcome.persist = true;
        Ok(outcome)
    }

    pub fn cancel_timed_preset(&mut self, source: RequestSource) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        self.features.lock.check(source)?;

        let now = self.clock.now();
        let mut outcome = Outcome::default();
        self.features.timed_preset.cancel(&mut outcome.events)?;
        self.settle(now, &mut outcome);
        outcome.persist = true;
        Ok(outcome)
    }

    pub fn set_safety_parameters(
        &mut self,
        config: SafetyConfig,
        source: RequestSource,
    ) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        self.features.lock.check(source)?;
        self.features.safety.set_parameters(config)?;

        let now = self.clock.now();
        let mut outcome = Outcome::default();
        self.control_cycle(now, false, &mut outcome);
        Ok(outcome)
    }

    pub fn set_window_bypass(
        &mut self,
        bypass: bool,
        source: RequestSource,
    ) -> Result<Outcome, ThermostatError> {
        self.ensure_started()?;
        self.features.lock.check(source)?;

        let now = self.clock.now();
        let mut outcome = Outcome::default();
        if self.features.window.set_bypass(bypass) {
            self.settle(now, &mut outcome);
        }
        outcome.persist = true;
        Ok(outcome)
    }

    pub fn lock(&mut self, code: Option<&str>) -> Result<Outcome, ThermostatError> {
        let changed = self.features.lock.lock(code)?;
        Ok(Outcome {
            persist: changed,
            ..Outcome::default()
        })
    }

    pub fn unlock(&mut self, code: Option<&str>) -> Result<Outcome, ThermostatError> {
        let changed = self.features.lock.unlock(code)?;
        Ok(Outcome {
            persist: changed,
            ..Outcome::default()
        })
    }

    /// Shedding decision from the central power coordinator.
    pub fn set_overpowering(&mut self, overpowering: bool) -> Outcome {
        let mut outcome = Outcome::default();
        if !self
            .features
            .power
            .set_overpowering(overpowering, &mut outcome.events)
        {
            return outcome;
        }
        outcome.persist = true;
        if self.started {
            let now = self.clock.now();
            self.settle(now, &mut outcome);
        }
        outcome
    }

    /// The host could not deliver a command; the device is resent on the next tick.
    pub fn dispatch_failed(&mut self, entity_id: &str, action: &str) -> Outcome {
        if !self.underlyings.invalidate(entity_id) {
            return Outcome::default();
        }
        warn!(
            name = %self.config.name,
            entity_id,
            action,
            "device command failed, it will be resent"
        );
        Outcome {
            events: vec![ThermostatEvent::DispatchFailed {
                entity_id: entity_id.to_string(),
                action: action.to_string(),
            }],
            ..Outcome::default()
        }
    }

    /// View used by the central power coordinator. `None` without power config.
    pub fn power_device(&self) -> Option<PowerDevice> {
        if !self.features.power.is_configured() {
            return None;
        }
        let current = self.state.current();
        let distance_to_target = match (current.target_temperature(), self.measurements.temperature) {
            (Some(target), Some(temperature)) if current.hvac_mode() == HvacMode::Cool => {
                temperature - target
            }
            (Some(target), Some(temperature)) => target - temperature,
            _ => 0.0,
        };
        Some(PowerDevice {
            name: self.config.name.clone(),
            device_power: self.features.power.device_power(),
            distance_to_target,
            is_consuming: current.hvac_mode() != HvacMode::Off
                && self.underlyings.is_device_active(),
            is_overpowering: self.features.power.is_overpowering_detected(),
        })
    }

    /// Underlyings currently on while the thermostat runs.
    pub fn active_device_count(&self) -> usize {
        if self.state.current().hvac_mode() == HvacMode::Off {
            return 0;
        }
        self.underlyings.active_count()
    }

    pub fn snapshot(&self) -> ThermostatSnapshot {
        ThermostatSnapshot {
            name: self.config.name.clone(),
            saved_at: self.clock.now(),
            requested: self.state.requested().clone(),
            current: self.state.current().clone(),
            safety: self.features.safety.snapshot(),
            window_bypass: self.features.window.is_bypassed(),
            timed_preset: self.features.timed_preset.snapshot(),
            locked: self.features.lock.is_locked(),
            overpowering: self.features.power.is_overpowering_detected(),
            auto_start_stop_stopped: self.features.auto_start_stop.is_stopped(),
            energy_wh: self.energy_wh,
            learned_tpi: self.tpi.learned_coefficients(),
        }
    }

    /// Loads a stored snapshot. Meant to run before [`start`](Self::start).
    pub fn restore(&mut self, snapshot: &ThermostatSnapshot) {
        if snapshot.name != self.config.name {
            warn!(
                name = %self.config.name,
                stored = %snapshot.name,
                "snapshot belongs to another thermostat, ignored"
            );
            return;
        }
        let now = self.clock.now();
        self.state
            .restore(snapshot.requested.clone(), snapshot.current.clone());
        for kind in ALL_FEATURES {
            self.features.get_mut(kind).restore_state(snapshot, now);
        }
        self.energy_wh = snapshot.energy_wh;
        if let Some(learned) = snapshot.learned_tpi {
            self.tpi.restore_learned(learned);
        }
        if self.features.safety.is_on() {
            self.tpi.set_safety(self.features.safety.default_on_percent());
        }
        info!(
            name = %self.config.name,
            saved_at = %snapshot.saved_at,
            hvac_mode = snapshot.requested.hvac_mode().as_str(),
            preset = snapshot.requested.preset().as_str(),
            "state restored"
        );
    }

    pub fn attributes(&self) -> Value {
        let current = self.state.current();
        let times = self.tpi.cycle_times();
        let mut attributes = json!({
            "name": self.config.name,
            "kind": self.config.kind,
            "started": self.started,
            "hvac_mode": current.hvac_mode(),
            "hvac_action": self.hvac_action,
            "hvac_off_reason": current.hvac_off_reason(),
            "preset": current.preset(),
            "target_temperature": current.target_temperature(),
            "current_temperature": self.measurements.temperature,
            "raw_temperature": self.measurements.raw_temperature,
            "outdoor_temperature": self.measurements.outdoor,
            "last_temperature_at": self.measurements.temperature_at,
            "slope": self.measurements.slope,
            "requested_state": self.state.requested(),
            "current_state": current,
            "on_percent": self.tpi.on_percent(),
            "calculated_on_percent": self.tpi.calculated_on_percent(),
            "power_percent": (self.tpi.on_percent() * 100.0).round(),
            "on_time_sec": times.on_time_sec,
            "off_time_sec": times.off_time_sec,
            "cycle_min": self.config.cycle_min,
            "coef_int": self.tpi.coef_int(),
            "coef_ext": self.tpi.coef_ext(),
            "energy_wh": self.energy_wh,
            "underlyings": self.underlyings.attributes(),
            "next_deadline": self.next_deadline(),
        });
        if let Value::Object(map) = &mut attributes {
            for kind in ALL_FEATURES {
                self.features.get(kind).add_attributes(map);
            }
        }
        attributes
    }

    fn ensure_started(&self) -> Result<(), ThermostatError> {
        if self.started {
            Ok(())
        } else {
            Err(ThermostatError::NotStarted)
        }
    }

    fn check_selectable(&self, preset: Preset) -> Result<(), ThermostatError> {
        if preset.is_hidden() {
            return Err(ThermostatError::InvalidPreset(preset));
        }
        let configured = match preset {
            Preset::None => true,
            Preset::Activity => self.features.motion.is_configured(),
            _ => self.config.presets.is_configured(preset, self.config.ac_mode),
        };
        if configured {
            Ok(())
        } else {
            Err(ThermostatError::PresetNotConfigured(preset))
        }
    }

    fn refresh(&mut self, kind: FeatureKind, now: DateTime<Utc>, events: &mut Vec<ThermostatEvent>) -> bool {
        let view = StateView::of(&self.state);
        let ctx = feature_context(now, &self.config, &view, &self.measurements, &self.tpi);
        self.features.get_mut(kind).refresh_state(&ctx, events)
    }

    fn reconcile(&mut self, now: DateTime<Utc>) -> Reconciliation {
        let view = StateView::of(&self.state);
        let ctx = feature_context(now, &self.config, &view, &self.measurements, &self.tpi);
        let resolver = TargetResolver {
            catalog: &self.config.presets,
            ac_mode: self.config.ac_mode,
            min_temp: self.config.min_temp,
            max_temp: self.config.max_temp,
            power_temp: self.features.power.power_temp(),
        };
        let features = &self.features;
        let result = self.state.calculate_current_state(
            &self.config.name,
            |kind| features.get(kind),
            &ctx,
            &resolver,
        );

        if result == Reconciliation::Changed {
            let current = self.state.current();
            info!(
                name = %self.config.name,
                hvac_mode = current.hvac_mode().as_str(),
                preset = current.preset().as_str(),
                target = ?current.target_temperature(),
                off_reason = ?current.hvac_off_reason(),
                "current state changed"
            );
        }
        result
    }

    /// Reconciles outside of a request. Returns true when the current state moved.
    fn reconcile_into(&mut self, now: DateTime<Utc>, outcome: &mut Outcome) -> bool {
        match self.reconcile(now) {
            Reconciliation::Changed => {
                outcome.persist = true;
                true
            }
            Reconciliation::Unchanged => false,
            Reconciliation::Rejected(kind) => {
                warn!(
                    name = %self.config.name,
                    feature = kind.as_str(),
                    "pending request rejected during refresh"
                );
                false
            }
        }
    }

    fn apply_request(&mut self) -> Result<Outcome, ThermostatError> {
        let now = self.clock.now();
        let mut outcome = Outcome {
            persist: true,
            ..Outcome::default()
        };
        match self.reconcile(now) {
            Reconciliation::Rejected(kind) => {
                info!(name = %self.config.name, feature = kind.as_str(), "request refused");
                Err(ThermostatError::rejected_by(kind))
            }
            Reconciliation::Changed => {
                self.control_cycle(now, true, &mut outcome);
                Ok(outcome)
            }
            Reconciliation::Unchanged => Ok(outcome),
        }
    }

    /// A feature moved: reconcile and restart the cycle when the state changed.
    fn settle(&mut self, now: DateTime<Utc>, outcome: &mut Outcome) {
        if !self.started {
            return;
        }
        if self.reconcile_into(now, outcome) {
            self.control_cycle(now, true, outcome);
        }
    }

    /// Window and auto-start/stop refresh, safety refresh, then the duty cycle
    /// and dispatch, then failure detection and the derived action.
    fn control_cycle(&mut self, now: DateTime<Utc>, force: bool, outcome: &mut Outcome) {
        let mut force = force;
        let mut changed = self.refresh(FeatureKind::Window, now, &mut outcome.events);
        changed |= self.refresh(FeatureKind::AutoStartStop, now, &mut outcome.events);
        if changed {
            force |= self.reconcile_into(now, outcome);
        }

        let safety_was_on = self.features.safety.is_on();
        if self.refresh(FeatureKind::Safety, now, &mut outcome.events) {
            if self.features.safety.is_on() {
                self.tpi.set_safety(self.features.safety.default_on_percent());
            } else {
                self.tpi.unset_safety();
            }
            self.reconcile_into(now, outcome);
            outcome.persist = true;
            if !safety_was_on && self.features.safety.is_on() {
                // Demand was computed from stale data; the next tick acts on the pinned duty cycle.
                self.cycle_requested = true;
                self.update_hvac_action();
                return;
            }
            force = true;
        }

        self.run_control(now, force, outcome);

        self.refresh(FeatureKind::HeatingFailure, now, &mut outcome.events);
        self.update_hvac_action();
    }

    fn run_control(&mut self, now: DateTime<Utc>, force: bool, outcome: &mut Outcome) {
        let (mode, target) = {
            let current = self.state.current();
            (current.hvac_mode(), current.target_temperature())
        };
        let uses_tpi = self.config.kind.uses_tpi();

        if uses_tpi {
            self.tpi.calculate(
                target,
                self.measurements.temperature,
                self.measurements.outdoor,
                mode,
            );
            if self.features.power.is_overpowering_detected() {
                self.tpi.force_off();
            }
        }

        let idle_window = self
            .underlyings
            .window()
            .is_some_and(|window| window.on_time_sec == 0);
        let restart = force
            || self.underlyings.window_elapsed(now)
            || (idle_window && self.tpi.cycle_times().on_time_sec > 0);

        let starting = uses_tpi
            && mode != HvacMode::Off
            && self.tpi.on_percent() > 0.0
            && !self.underlyings.is_device_active()
            && (restart || self.config.kind == ThermostatKind::Valve);
        if starting && !self.features.power.check_power_available(&mut outcome.events) {
            self.tpi.force_off();
        }

        if restart {
            self.close_cycle(now, outcome);
            let times = self.tpi.cycle_times();
            self.underlyings
                .start_window(now, self.config.cycle_sec(), times);
            self.cycle_start = Some(CycleStart {
                on_percent: self.tpi.on_percent(),
                mode,
                target,
                temperature: self.measurements.temperature,
            });
            debug!(
                name = %self.config.name,
                on_percent = self.tpi.on_percent(),
                on_time_sec = times.on_time_sec,
                off_time_sec = times.off_time_sec,
                "cycle started"
            );
        }

        self.dispatch(now, outcome);
    }

    /// Books the energy of the cycle that ends at `now` and feeds auto-TPI with
    /// cycles that ran to completion.
    fn close_cycle(&mut self, now: DateTime<Utc>, outcome: &mut Outcome) {
        let (Some(window), Some(start)) = (self.underlyings.window(), self.cycle_start.take()) else {
            return;
        };
        let elapsed_sec = (now - window.started_at)
            .num_seconds()
            .clamp(0, window.cycle_sec);

        let device_power = self.features.power.device_power();
        if device_power > 0.0 && start.on_percent > 0.0 && elapsed_sec > 0 {
            self.energy_wh += device_power * start.on_percent * elapsed_sec as f64 / 3600.0;
            outcome.persist = true;
        }

        if elapsed_sec < window.cycle_sec || self.tpi.is_safety() {
            return;
        }
        let heating = match start.mode {
            HvacMode::Heat => true,
            HvacMode::Cool => false,
            _ => return,
        };
        let (Some(target), Some(start_temp), Some(end_temp)) =
            (start.target, start.temperature, self.measurements.temperature)
        else {
            return;
        };
        let sample = CycleSample {
            on_percent: start.on_percent,
            target,
            start_temp,
            end_temp,
            outdoor: self.measurements.outdoor,
            heating,
        };
        if self.tpi.learn(sample) {
            outcome.persist = true;
        }
    }

    fn dispatch(&mut self, now: DateTime<Utc>, outcome: &mut Outcome) {
        let (mode, target) = {
            let current = self.state.current();
            (current.hvac_mode(), current.target_temperature())
        };
        let commands = self
            .underlyings
            .dispatch(now, self.tpi.on_percent(), mode, target);
        if commands.is_empty() {
            return;
        }
        for command in &commands {
            debug!(
                name = %self.config.name,
                entity_id = %command.entity_id,
                action = command.action.name(),
                "dispatching"
            );
        }
        outcome.commands.extend(commands);
        self.update_hvac_action();
    }

    fn update_hvac_action(&mut self) {
        let mode = self.state.current().hvac_mode();
        let action = if mode == HvacMode::Off {
            HvacAction::Off
        } else if !self.underlyings.is_device_active() {
            HvacAction::Idle
        } else {
            match mode {
                HvacMode::Cool => HvacAction::Cooling,
                HvacMode::FanOnly => HvacAction::Fan,
                _ => HvacAction::Heating,
            }
        };
        if action != self.hvac_action {
            debug!(name = %self.config.name, action = action.as_str(), "hvac action changed");
            self.hvac_action = action;
        }
    }
}
