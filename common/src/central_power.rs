//! Fleet-wide power budget and shedding.
//!
//! The ledger is shared with every thermostat's [`PowerManager`](crate::features::PowerManager):
//! starts reserve power in it until the next power reading arrives, which keeps
//! a burst of simultaneous starts from overshooting the budget. This is a
//! best-effort window of a few seconds, not a strict guarantee.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{config::CentralPowerConfig, timer::Deadline};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerLedger {
    current_power: Option<f64>,
    current_max_power: Option<f64>,
    /// Power of devices started since the last power reading.
    started_vtherm_total_power: f64,
    /// Power of devices shed since the last power reading.
    shed_vtherm_total_power: f64,
}

pub type SharedPowerLedger = Arc<Mutex<PowerLedger>>;

impl PowerLedger {
    pub fn current_power(&self) -> Option<f64> {
        self.current_power
    }

    pub fn current_max_power(&self) -> Option<f64> {
        self.current_max_power
    }

    pub fn started_vtherm_total_power(&self) -> f64 {
        self.started_vtherm_total_power
    }

    pub fn shed_vtherm_total_power(&self) -> f64 {
        self.shed_vtherm_total_power
    }

    /// A fresh reading already includes every earlier start and shed.
    pub fn set_current_power(&mut self, power: f64) {
        self.current_power = Some(power);
        self.reset_running_totals();
    }

    pub fn set_current_max_power(&mut self, max_power: f64) {
        self.current_max_power = Some(max_power);
        self.reset_running_totals();
    }

    fn reset_running_totals(&mut self) {
        self.started_vtherm_total_power = 0.0;
        self.shed_vtherm_total_power = 0.0;
    }

    /// `max_power - current_power`, once both are known.
    pub fn available_power(&self) -> Option<f64> {
        Some(self.current_max_power? - self.current_power?)
    }

    /// Reserves `device_power` unless it would reach the budget. Unknown readings
    /// allow everything.
    pub fn try_reserve(&mut self, device_power: f64) -> bool {
        let (Some(current), Some(max)) = (self.current_power, self.current_max_power) else {
            return true;
        };
        if current + self.started_vtherm_total_power + device_power >= max {
            return false;
        }
        self.started_vtherm_total_power += device_power;
        true
    }
}

/// What the coordinator needs to know about one thermostat.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerDevice {
    pub name: String,
    pub device_power: f64,
    /// `target - current` (mirrored when cooling): how far from satisfied the room is.
    pub distance_to_target: f64,
    pub is_consuming: bool,
    pub is_overpowering: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShedDecision {
    pub name: String,
    pub overpowering: bool,
}

#[derive(Debug)]
pub struct CentralPowerManager {
    config: Option<CentralPowerConfig>,
    ledger: SharedPowerLedger,
    debounce: Deadline,
}

impl CentralPowerManager {
    pub fn new(config: Option<CentralPowerConfig>) -> Self {
        Self {
            config,
            ledger: Arc::new(Mutex::new(PowerLedger::default())),
            debounce: Deadline::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn ledger(&self) -> SharedPowerLedger {
        self.ledger.clone()
    }

    pub fn ledger_snapshot(&self) -> PowerLedger {
        match self.ledger.lock() {
            Ok(ledger) => ledger.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn power_sensor(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.power_sensor.as_str())
    }

    pub fn max_power_sensor(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.max_power_sensor.as_str())
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.debounce.at()
    }

    pub fn on_power(&mut self, power: f64, now: DateTime<Utc>) {
        self.with_ledger(|ledger| ledger.set_current_power(power));
        self.schedule(now);
    }

    pub fn on_max_power(&mut self, max_power: f64, now: DateTime<Utc>) {
        self.with_ledger(|ledger| ledger.set_current_max_power(max_power));
        self.schedule(now);
    }

    /// Arms the recalculation unless one is already pending.
    fn schedule(&mut self, now: DateTime<Utc>) {
        let Some(config) = &self.config else {
            return;
        };
        if !self.debounce.is_armed() {
            self.debounce
                .arm_in(now, Duration::seconds(config.shedding_debounce_sec));
        }
    }

    /// True once when the debounced recalculation is due.
    pub fn fire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        self.debounce.fire_if_due(now)
    }

    pub fn stop(&mut self) {
        self.debounce.cancel();
    }

    fn with_ledger<R>(&self, f: impl FnOnce(&mut PowerLedger) -> R) -> R {
        match self.ledger.lock() {
            Ok(mut ledger) => f(&mut *ledger),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    /// Decides which devices to shed or restore.
    ///
    /// On a deficit, consuming devices are shed closest-to-target first until the
    /// shed power covers it. With spare power, shed devices are restored
    /// furthest-from-target first while the margin allows. Equal distances keep
    /// their relative order. Calling it again with unchanged readings decides nothing.
    pub fn calculate_shedding(&mut self, devices: &[PowerDevice]) -> Vec<ShedDecision> {
        self.with_ledger(|ledger| {
            let Some(available) = ledger.available_power() else {
                debug!("power readings incomplete, shedding skipped");
                return Vec::new();
            };

            let mut ordered: Vec<&PowerDevice> =
                devices.iter().filter(|d| d.device_power > 0.0).collect();
            let mut decisions = Vec::new();

            if available < 0.0 {
                ordered.sort_by(|a, b| a.distance_to_target.total_cmp(&b.distance_to_target));
                let mut needed = -available - ledger.shed_vtherm_total_power;
                for device in ordered {
                    if needed <= 0.0 {
                        break;
                    }
                    if !device.is_consuming || device.is_overpowering {
                        continue;
                    }
                    info!(
                        name = %device.name,
                        device_power = device.device_power,
                        distance_to_target = device.distance_to_target,
                        "shedding"
                    );
                    needed -= device.device_power;
                    ledger.shed_vtherm_total_power += device.device_power;
                    decisions.push(ShedDecision {
                        name: device.name.clone(),
                        overpowering: true,
                    });
                }
            } else {
                ordered.sort_by(|a, b| b.distance_to_target.total_cmp(&a.distance_to_target));
                let mut margin = available - ledger.started_vtherm_total_power;
                for device in ordered {
                    if !device.is_overpowering {
                        continue;
                    }
                    if margin - device.device_power < 0.0 {
                        continue;
                    }
                    info!(
                        name = %device.name,
                        device_power = device.device_power,
                        distance_to_target = device.distance_to_target,
                        "restoring"
                    );
                    margin -= device.device_power;
                    ledger.started_vtherm_total_power += device.device_power;
                    decisions.push(ShedDecision {
                        name: device.name.clone(),
                        overpowering: false,
                    });
                }
            }
            decisions
        })
    }
}
