//! Every thermostat of one installation plus the fleet-wide coordinators:
//! central power shedding, the central boiler and the weekly schedules.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    central_boiler::CentralBoiler,
    central_power::CentralPowerManager,
    clock::Clock,
    config::{CentralConfig, FleetConfig, ThermostatConfig},
    error::{FleetError, ThermostatError},
    event::{DeviceCommand, Outcome, SensorEvent, SensorValue, ThermostatEvent},
    preset::Preset,
    schedule::Schedule,
    snapshot::ThermostatSnapshot,
    thermostat::Thermostat,
    types::RequestSource,
};

/// Side effects of one fleet operation, attributed to the thermostats that
/// produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetOutcome {
    pub commands: Vec<DeviceCommand>,
    pub events: Vec<(String, ThermostatEvent)>,
    /// Thermostats whose snapshot must be written.
    pub persist: BTreeSet<String>,
}

impl FleetOutcome {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty() && self.persist.is_empty()
    }

    fn absorb(&mut self, name: &str, outcome: Outcome) {
        self.commands.extend(outcome.commands);
        self.events
            .extend(outcome.events.into_iter().map(|event| (name.to_string(), event)));
        if outcome.persist {
            self.persist.insert(name.to_string());
        }
    }
}

pub struct Fleet {
    clock: Arc<dyn Clock>,
    central: CentralConfig,
    thermostats: BTreeMap<String, Thermostat>,
    schedules: HashMap<String, Schedule>,
    /// Schedule entry last applied per thermostat, so only changes are issued.
    scheduled: HashMap<String, Preset>,
    central_power: CentralPowerManager,
    boiler: CentralBoiler,
}

impl Fleet {
    pub fn new(central: CentralConfig, clock: Arc<dyn Clock>) -> Result<Self, FleetError> {
        central.validate()?;
        Ok(Self {
            clock,
            central_power: CentralPowerManager::new(central.power.clone()),
            boiler: CentralBoiler::new(central.boiler.clone()),
            central,
            thermostats: BTreeMap::new(),
            schedules: HashMap::new(),
            scheduled: HashMap::new(),
        })
    }

    /// Builds the fleet described by a `fleet.json`. Thermostats stay stopped.
    pub fn from_config(config: &FleetConfig, clock: Arc<dyn Clock>) -> Result<Self, FleetError> {
        let mut fleet = Self::new(config.central.clone(), clock)?;
        for entry in &config.thermostats {
            fleet.register(entry.thermostat.clone())?;
            fleet.set_schedule(&entry.thermostat.name, entry.schedule.clone())?;
        }
        Ok(fleet)
    }

    /// Merges the central defaults into `config`, validates it and adds the thermostat.
    pub fn register(&mut self, config: ThermostatConfig) -> Result<(), FleetError> {
        if self.thermostats.contains_key(&config.name) {
            return Err(FleetError::DuplicateName(config.name));
        }
        let config = config.resolve(&self.central);
        let mut thermostat = Thermostat::new(config, self.clock.clone())?;
        if self.central_power.is_configured() {
            thermostat.attach_power_ledger(self.central_power.ledger());
        }
        info!(name = %thermostat.name(), "thermostat registered");
        self.thermostats
            .insert(thermostat.name().to_string(), thermostat);
        Ok(())
    }

    /// Stops and removes a thermostat. Its devices are turned off.
    pub fn deregister(&mut self, name: &str) -> Result<FleetOutcome, FleetError> {
        let mut thermostat = self
            .thermostats
            .remove(name)
            .ok_or_else(|| FleetError::UnknownThermostat(name.to_string()))?;
        self.schedules.remove(name);
        self.scheduled.remove(name);

        let mut outcome = FleetOutcome::default();
        outcome.absorb(name, thermostat.stop());
        thermostat.detach_power_ledger();
        info!(name, "thermostat deregistered");
        Ok(outcome)
    }

    pub fn set_schedule(&mut self, name: &str, mut schedule: Schedule) -> Result<(), FleetError> {
        if !self.thermostats.contains_key(name) {
            return Err(FleetError::UnknownThermostat(name.to_string()));
        }
        schedule.normalize();
        self.scheduled.remove(name);
        self.schedules.insert(name.to_string(), schedule);
        Ok(())
    }

    pub fn schedule(&self, name: &str) -> Option<&Schedule> {
        self.schedules.get(name)
    }

    /// Loads a stored snapshot into a stopped thermostat.
    pub fn restore(&mut self, snapshot: &ThermostatSnapshot) -> Result<(), FleetError> {
        let thermostat = self
            .thermostats
            .get_mut(&snapshot.name)
            .ok_or_else(|| FleetError::UnknownThermostat(snapshot.name.clone()))?;
        thermostat.restore(snapshot);
        Ok(())
    }

    pub fn start_all(&mut self) -> FleetOutcome {
        let mut outcome = FleetOutcome::default();
        for (name, thermostat) in &mut self.thermostats {
            outcome.absorb(name, thermostat.start());
        }
        outcome
    }

    pub fn stop_all(&mut self) -> FleetOutcome {
        let mut outcome = FleetOutcome::default();
        for (name, thermostat) in &mut self.thermostats {
            outcome.absorb(name, thermostat.stop());
        }
        self.central_power.stop();
        self.boiler.stop();
        outcome
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.thermostats.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Thermostat> {
        self.thermostats.get(name)
    }

    pub fn snapshots(&self) -> Vec<ThermostatSnapshot> {
        self.thermostats.values().map(Thermostat::snapshot).collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<ThermostatSnapshot> {
        self.thermostats.get(name).map(Thermostat::snapshot)
    }

    /// Entity ids the host must subscribe to.
    pub fn watched_entities(&self) -> BTreeSet<String> {
        let mut entities: BTreeSet<String> = self
            .thermostats
            .values()
            .flat_map(|t| t.bindings().into_iter().map(|(entity, _)| entity))
            .collect();
        entities.extend(self.central_power.power_sensor().map(str::to_string));
        entities.extend(self.central_power.max_power_sensor().map(str::to_string));
        entities.extend(self.boiler.entity().map(str::to_string));
        entities
    }

    /// Routes one raw reading to every thermostat bound to `entity_id` and to
    /// the power coordinator. Unusable payloads are dropped.
    pub fn ingest(&mut self, entity_id: &str, payload: &str, timestamp: DateTime<Utc>) -> FleetOutcome {
        let mut outcome = FleetOutcome::default();
        let Some(value) = SensorValue::parse(payload) else {
            debug!(entity_id, payload, "no usable data");
            return outcome;
        };
        let now = self.clock.now();

        if self.central_power.power_sensor() == Some(entity_id) {
            if let Some(power) = value.as_number() {
                self.central_power.on_power(power, now);
            }
        }
        if self.central_power.max_power_sensor() == Some(entity_id) {
            if let Some(max_power) = value.as_number() {
                self.central_power.on_max_power(max_power, now);
            }
        }

        for (name, thermostat) in &mut self.thermostats {
            let kinds: Vec<_> = thermostat
                .bindings()
                .into_iter()
                .filter(|(entity, _)| entity == entity_id)
                .map(|(_, kind)| kind)
                .collect();
            for kind in kinds {
                let event = SensorEvent {
                    kind,
                    value,
                    timestamp,
                };
                outcome.absorb(name, thermostat.handle_sensor(event));
            }
        }
        outcome
    }

    /// Drives every timer of the fleet. The host calls it once per second.
    pub fn tick(&mut self) -> FleetOutcome {
        let now = self.clock.now();
        let mut outcome = FleetOutcome::default();
        for (name, thermostat) in &mut self.thermostats {
            outcome.absorb(name, thermostat.tick());
        }

        if self.central_power.fire_if_due(now) {
            self.shed(&mut outcome);
        }

        let active_devices = self
            .thermostats
            .values()
            .map(Thermostat::active_device_count)
            .sum();
        outcome.commands.extend(self.boiler.evaluate(active_devices, now));
        outcome
    }

    fn shed(&mut self, outcome: &mut FleetOutcome) {
        let devices: Vec<_> = self
            .thermostats
            .values()
            .filter_map(Thermostat::power_device)
            .collect();
        let decisions = self.central_power.calculate_shedding(&devices);
        if decisions.is_empty() {
            debug!(devices = devices.len(), "shedding recalculated, nothing to change");
        }
        for decision in decisions {
            if let Some(thermostat) = self.thermostats.get_mut(&decision.name) {
                outcome.absorb(&decision.name, thermostat.set_overpowering(decision.overpowering));
            }
        }
    }

    /// Issues an automation preset change wherever the active schedule entry moved.
    pub fn apply_schedules<Tz: TimeZone>(&mut self, local_now: &DateTime<Tz>) -> FleetOutcome {
        let mut outcome = FleetOutcome::default();
        for (name, schedule) in &self.schedules {
            let Some(preset) = schedule.current_preset(local_now) else {
                continue;
            };
            if self.scheduled.get(name) == Some(&preset) {
                continue;
            }
            let Some(thermostat) = self.thermostats.get_mut(name) else {
                continue;
            };
            if !thermostat.is_started() {
                continue;
            }
            match thermostat.set_preset(preset, RequestSource::Automation) {
                Ok(result) => {
                    info!(name = %name, preset = preset.as_str(), "schedule applied");
                    outcome.absorb(name, result);
                }
                Err(err) => {
                    warn!(name = %name, preset = preset.as_str(), "schedule not applied: {err}");
                }
            }
            // A refused entry is not retried until the schedule moves on.
            self.scheduled.insert(name.clone(), preset);
        }
        outcome
    }

    /// Runs a command against one thermostat.
    pub fn command<F>(&mut self, name: &str, command: F) -> Result<FleetOutcome, FleetError>
    where
        F: FnOnce(&mut Thermostat) -> Result<Outcome, ThermostatError>,
    {
        let thermostat = self
            .thermostats
            .get_mut(name)
            .ok_or_else(|| FleetError::UnknownThermostat(name.to_string()))?;
        let mut outcome = FleetOutcome::default();
        outcome.absorb(name, command(thermostat)?);
        Ok(outcome)
    }

    /// The host could not deliver `action` to `entity_id`.
    pub fn dispatch_failed(&mut self, entity_id: &str, action: &str) -> FleetOutcome {
        let mut outcome = FleetOutcome::default();
        if self.boiler.entity() == Some(entity_id) {
            warn!(entity_id, action, "boiler command failed, it will be resent");
            self.boiler.invalidate();
            return outcome;
        }
        for (name, thermostat) in &mut self.thermostats {
            outcome.absorb(name, thermostat.dispatch_failed(entity_id, action));
        }
        outcome
    }

    pub fn attributes(&self, name: &str) -> Option<Value> {
        self.thermostats.get(name).map(Thermostat::attributes)
    }

    pub fn central_attributes(&self) -> Value {
        json!({
            "power": {
                "configured": self.central_power.is_configured(),
                "ledger": self.central_power.ledger_snapshot(),
                "next_recalculation": self.central_power.next_deadline(),
                "devices": self
                    .thermostats
                    .values()
                    .filter_map(Thermostat::power_device)
                    .map(|device| json!({
                        "name": device.name,
                        "device_power": device.device_power,
                        "distance_to_target": device.distance_to_target,
                        "consuming": device.is_consuming,
                        "overpowering": device.is_overpowering,
                    }))
                    .collect::<Vec<_>>(),
            },
            "boiler": self.boiler.attributes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, FixedOffset};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::{CentralBoilerConfig, CentralPowerConfig, PowerConfig},
        event::DeviceAction,
        schedule::{DayOfWeek, ScheduleEntry},
        types::HvacMode,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn room(name: &str, device_power: Option<f64>) -> ThermostatConfig {
        let mut config = ThermostatConfig::switch(
            name,
            &format!("sensor.{name}_temperature"),
            &[&format!("switch.{name}_heater")],
        );
        config.power = device_power.map(|device_power| PowerConfig {
            device_power,
            power_temp: None,
        });
        config
    }

    fn fleet(central: CentralConfig, rooms: &[ThermostatConfig]) -> (Fleet, ManualClock) {
        let clock = ManualClock::new(t0());
        let mut fleet = Fleet::new(central, Arc::new(clock.clone())).unwrap();
        for room in rooms {
            fleet.register(room.clone()).unwrap();
        }
        fleet.start_all();
        (fleet, clock)
    }

    fn heat_boost(fleet: &mut Fleet, name: &str) {
        fleet
            .command(name, |t| t.set_hvac_mode(HvacMode::Heat, RequestSource::User))
            .unwrap();
        fleet
            .command(name, |t| t.set_preset(Preset::Boost, RequestSource::User))
            .unwrap();
    }

    fn power_central() -> CentralConfig {
        CentralConfig {
            power: Some(CentralPowerConfig {
                power_sensor: "sensor.power".to_string(),
                max_power_sensor: "sensor.max_power".to_string(),
                shedding_debounce_sec: 20,
            }),
            ..CentralConfig::default()
        }
    }

    fn is_overpowering(fleet: &Fleet, name: &str) -> bool {
        fleet.get(name).unwrap().power().is_overpowering_detected()
    }

    #[test]
    fn deficit_sheds_rooms_closest_to_target_first() {
        let rooms = [
            room("bedroom", Some(600.0)),
            room("kitchen", Some(600.0)),
            room("office", Some(600.0)),
        ];
        let (mut fleet, clock) = fleet(power_central(), &rooms);
        // Distances to the 21° boost target: 0.5, 3.0, 1.5.
        for (name, temperature) in [("bedroom", "20.5"), ("kitchen", "18"), ("office", "19.5")] {
            heat_boost(&mut fleet, name);
            fleet.ingest(&format!("sensor.{name}_temperature"), temperature, t0());
        }

        fleet.ingest("sensor.power", "2000", t0());
        fleet.ingest("sensor.max_power", "1000", t0());
        clock.advance_secs(19);
        assert!(fleet.tick().events.is_empty());

        clock.advance_secs(1);
        let outcome = fleet.tick();

        assert!(is_overpowering(&fleet, "bedroom"));
        assert!(is_overpowering(&fleet, "office"));
        assert!(!is_overpowering(&fleet, "kitchen"));
        assert_eq!(
            outcome.persist,
            BTreeSet::from(["bedroom".to_string(), "office".to_string()])
        );
        assert!(outcome.commands.contains(&DeviceCommand {
            entity_id: "switch.bedroom_heater".to_string(),
            action: DeviceAction::TurnOff,
        }));
        assert_eq!(fleet.get("office").unwrap().current_state().preset(), Preset::Power);
    }

    #[test]
    fn spare_power_restores_neediest_room_first() {
        let rooms = [room("bedroom", Some(600.0)), room("office", Some(600.0))];
        let (mut fleet, clock) = fleet(power_central(), &rooms);
        for (name, temperature) in [("bedroom", "20.5"), ("office", "19.5")] {
            heat_boost(&mut fleet, name);
            fleet.ingest(&format!("sensor.{name}_temperature"), temperature, t0());
        }
        fleet.ingest("sensor.power", "2000", t0());
        fleet.ingest("sensor.max_power", "1000", t0());
        clock.advance_secs(20);
        fleet.tick();
        assert!(is_overpowering(&fleet, "bedroom"));
        assert!(is_overpowering(&fleet, "office"));

        // 1000 W spare: room for one 600 W heater only.
        fleet.ingest("sensor.power", "0", clock.now());
        clock.advance_secs(20);
        fleet.tick();

        assert!(!is_overpowering(&fleet, "office"));
        assert!(is_overpowering(&fleet, "bedroom"));
    }

    #[test]
    fn readings_for_unknown_entities_are_ignored() {
        let (mut fleet, _clock) = fleet(CentralConfig::default(), &[room("bedroom", None)]);

        assert!(fleet.ingest("sensor.unrelated", "21", t0()).is_empty());
        assert!(fleet.ingest("sensor.bedroom_temperature", "unavailable", t0()).is_empty());
        assert_eq!(fleet.get("bedroom").unwrap().temperature(), None);
    }

    #[test]
    fn boiler_follows_active_devices() {
        let central = CentralConfig {
            boiler: Some(CentralBoilerConfig {
                entity: "switch.boiler".to_string(),
                active_device_threshold: 1,
                activation_delay_sec: 10,
            }),
            ..CentralConfig::default()
        };
        let (mut fleet, clock) = fleet(central, &[room("bedroom", None)]);
        let boiler = |action| DeviceCommand {
            entity_id: "switch.boiler".to_string(),
            action,
        };
        assert!(fleet.tick().commands.contains(&boiler(DeviceAction::TurnOff)));

        heat_boost(&mut fleet, "bedroom");
        fleet.ingest("sensor.bedroom_temperature", "18", t0());
        assert!(!fleet.tick().commands.contains(&boiler(DeviceAction::TurnOn)));

        clock.advance_secs(10);
        assert!(fleet.tick().commands.contains(&boiler(DeviceAction::TurnOn)));

        fleet
            .command("bedroom", |t| t.set_hvac_mode(HvacMode::Off, RequestSource::User))
            .unwrap();
        assert!(fleet.tick().commands.contains(&boiler(DeviceAction::TurnOff)));
    }

    #[test]
    fn schedule_change_is_applied_once() {
        let (mut fleet, _clock) = fleet(CentralConfig::default(), &[room("bedroom", None)]);
        heat_boost(&mut fleet, "bedroom");
        fleet
            .set_schedule(
                "bedroom",
                Schedule {
                    enabled: true,
                    entries: vec![ScheduleEntry {
                        day: DayOfWeek::Mon,
                        start_minutes: 7 * 60,
                        preset: Preset::Eco,
                    }],
                },
            )
            .unwrap();
        let local = FixedOffset::east_opt(3600).unwrap();
        let monday_nine = local.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();

        let outcome = fleet.apply_schedules(&monday_nine);
        assert!(outcome.persist.contains("bedroom"));
        assert_eq!(fleet.get("bedroom").unwrap().requested_state().preset(), Preset::Eco);

        fleet
            .command("bedroom", |t| t.set_preset(Preset::Comfort, RequestSource::User))
            .unwrap();
        fleet.apply_schedules(&(monday_nine + Duration::minutes(1)));
        assert_eq!(
            fleet.get("bedroom").unwrap().requested_state().preset(),
            Preset::Comfort
        );
    }

    #[test]
    fn duplicate_and_unknown_names_are_rejected() {
        let (mut fleet, _clock) = fleet(CentralConfig::default(), &[room("bedroom", None)]);

        assert_eq!(
            fleet.register(room("bedroom", None)),
            Err(FleetError::DuplicateName("bedroom".to_string()))
        );
        assert!(matches!(
            fleet.command("attic", |t| t.lock(None)),
            Err(FleetError::UnknownThermostat(name)) if name == "attic"
        ));
    }

    #[test]
    fn deregistered_thermostat_turns_devices_off() {
        let (mut fleet, _clock) = fleet(CentralConfig::default(), &[room("bedroom", None)]);
        heat_boost(&mut fleet, "bedroom");
        fleet.ingest("sensor.bedroom_temperature", "18", t0());

        let outcome = fleet.deregister("bedroom").unwrap();

        assert_eq!(
            outcome.commands,
            vec![DeviceCommand {
                entity_id: "switch.bedroom_heater".to_string(),
                action: DeviceAction::TurnOff,
            }]
        );
        assert!(fleet.get("bedroom").is_none());
    }
}
