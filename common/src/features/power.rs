use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    central_power::SharedPowerLedger,
    config::PowerConfig,
    error::FeatureError,
    event::{PowerEventKind, ThermostatEvent},
    preset::Preset,
    snapshot::ThermostatSnapshot,
    state::Candidate,
    types::FeatureState,
};

/// Per-thermostat side of power shedding. Decisions are taken fleet-wide by
/// [`CentralPowerManager`](crate::central_power::CentralPowerManager).
#[derive(Debug, Clone)]
pub struct PowerManager {
    name: String,
    config: Option<PowerConfig>,
    ledger: Option<SharedPowerLedger>,
    state: FeatureState,
    /// Set when the coordinator restored this device; its power is already reserved.
    /// Consumed by the next availability check, whether or not the device starts.
    restore_reservation: bool,
}

impl PowerManager {
    pub fn new(name: &str, config: Option<&PowerConfig>) -> Self {
        Self {
            name: name.to_string(),
            config: config.cloned(),
            ledger: None,
            restore_reservation: false,
            state: if config.is_some() {
                FeatureState::Unknown
            } else {
                FeatureState::Unavailable
            },
        }
    }

    /// Connects to the fleet's ledger. Without one every start is allowed.
    pub fn attach_ledger(&mut self, ledger: SharedPowerLedger) {
        self.ledger = Some(ledger);
    }

    pub fn detach_ledger(&mut self) {
        self.ledger = None;
    }

    pub fn device_power(&self) -> f64 {
        self.config.as_ref().map_or(0.0, |c| c.device_power)
    }

    pub fn power_temp(&self) -> Option<f64> {
        self.config.as_ref().and_then(|c| c.power_temp)
    }

    pub fn is_overpowering_detected(&self) -> bool {
        self.state.is_on()
    }

    pub fn state(&self) -> FeatureState {
        self.state
    }

    /// One-shot: the reservation made by the coordinator covers a single start.
    fn take_restore_reservation(&mut self) -> bool {
        std::mem::take(&mut self.restore_reservation)
    }

    /// Consulted before an idle device starts. Reserves the device's power in the
    /// ledger when the start is allowed.
    pub fn check_power_available(&mut self, events: &mut Vec<ThermostatEvent>) -> bool {
        if self.take_restore_reservation() {
            return true;
        }
        let Some(ledger) = &self.ledger else {
            return true;
        };
        if self.config.is_none() {
            return true;
        }
        let device_power = self.device_power();
        let allowed = match ledger.lock() {
            Ok(mut ledger) => ledger.try_reserve(device_power),
            Err(poisoned) => poisoned.into_inner().try_reserve(device_power),
        };
        if !allowed {
            warn!(name = %self.name, device_power, "not enough power available to start");
            events.push(ThermostatEvent::Power {
                kind: PowerEventKind::NotAvailable,
                device_power,
            });
        }
        allowed
    }

    /// Returns true when the flag changed.
    pub fn set_overpowering(
        &mut self,
        overpowering: bool,
        events: &mut Vec<ThermostatEvent>,
    ) -> bool {
        if self.config.is_none() || self.is_overpowering_detected() == overpowering {
            return false;
        }
        let device_power = self.device_power();
        self.state = FeatureState::from_bool(overpowering);
        self.restore_reservation = !overpowering;
        info!(name = %self.name, overpowering, device_power, "overpowering changed");
        events.push(ThermostatEvent::Power {
            kind: if overpowering {
                PowerEventKind::Shed
            } else {
                PowerEventKind::Restored
            },
            device_power,
        });
        true
    }
}

impl FeatureManager for PowerManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Power
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn refresh_state(&mut self, _ctx: &FeatureContext<'_>, _events: &mut Vec<ThermostatEvent>) -> bool {
        false
    }

    fn apply(&self, candidate: &mut Candidate, _ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        if self.is_overpowering_detected() {
            // Safety keeps its own preset: this is a no-op when it already decided.
            candidate.force_preset(FeatureKind::Power, Preset::Power);
        }
        Ok(Verdict::Continue)
    }

    fn restore_state(&mut self, snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {
        if self.is_configured() {
            self.state = FeatureState::from_bool(snapshot.overpowering);
        }
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "power".to_string(),
            json!({
                "state": self.state.as_str(),
                "device_power": self.device_power(),
                "power_temp": self.power_temp(),
                "overpowering": self.is_overpowering_detected(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{central_power::PowerLedger, state::VThermState, types::HvacMode};

    fn manager(device_power: f64) -> PowerManager {
        PowerManager::new(
            "living",
            Some(&PowerConfig {
                device_power,
                power_temp: Some(12.0),
            }),
        )
    }

    #[test]
    fn start_is_refused_when_budget_would_be_exceeded() {
        let ledger = Arc::new(Mutex::new(PowerLedger::default()));
        {
            let mut guard = ledger.lock().unwrap();
            guard.set_current_power(1_500.0);
            guard.set_current_max_power(3_000.0);
        }
        let mut first = manager(1_000.0);
        first.attach_ledger(ledger.clone());
        let mut second = manager(1_000.0);
        second.attach_ledger(ledger.clone());
        let mut events = Vec::new();

        assert!(first.check_power_available(&mut events));
        // 1500 + 1000 reserved + 1000 >= 3000
        assert!(!second.check_power_available(&mut events));
        assert_eq!(
            events,
            vec![ThermostatEvent::Power {
                kind: PowerEventKind::NotAvailable,
                device_power: 1_000.0,
            }]
        );
    }

    #[test]
    fn overpowering_forces_power_preset() {
        let mut power = manager(1_000.0);
        let mut events = Vec::new();
        assert!(power.set_overpowering(true, &mut events));
        assert!(!power.set_overpowering(true, &mut events));
        assert_eq!(events.len(), 1);

        let requested = VThermState::new(HvacMode::Heat, Some(19.0), Preset::Comfort);
        let mut candidate = Candidate::from_requested(&requested);
        candidate.force_preset(FeatureKind::Safety, Preset::Safety);
        let mut shed = Candidate::from_requested(&requested);

        let measurements = crate::features::Measurements::default();
        let catalog = crate::preset::PresetCatalog::default();
        let ctx = FeatureContext {
            now: Utc::now(),
            name: "living",
            kind: crate::types::ThermostatKind::Switch,
            requested: &requested,
            current: &requested,
            request_source: None,
            measurements: &measurements,
            catalog: &catalog,
            ac_mode: false,
            on_percent: 0.0,
            calculated_on_percent: 0.0,
        };
        power.apply(&mut candidate, &ctx).unwrap();
        power.apply(&mut shed, &ctx).unwrap();

        assert_eq!(candidate.preset(), Preset::Safety);
        assert_eq!(shed.preset(), Preset::Power);
    }

    #[test]
    fn restored_device_starts_on_its_reservation() {
        let ledger = Arc::new(Mutex::new(PowerLedger::default()));
        {
            let mut guard = ledger.lock().unwrap();
            guard.set_current_power(500.0);
            guard.set_current_max_power(1_000.0);
        }
        let mut power = manager(1_000.0);
        power.attach_ledger(ledger);
        let mut events = Vec::new();
        power.set_overpowering(true, &mut events);
        power.set_overpowering(false, &mut events);

        assert!(power.check_power_available(&mut events));
        assert!(!power.check_power_available(&mut events));
    }
}
