//! The devices a thermostat drives, and the translation of a duty cycle or a
//! target into commands for them.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::{
    event::{DeviceAction, DeviceCommand},
    tpi::CycleTimes,
    types::{HvacMode, ThermostatKind},
};

/// On/off plan of the running cycle, shared by every relay of a thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyWindow {
    pub started_at: DateTime<Utc>,
    pub cycle_sec: i64,
    pub on_time_sec: i64,
}

impl DutyWindow {
    /// Whether relay `index` of `count` is on at `now`. Relays are staggered by
    /// `index * cycle / count` so they never all start together.
    pub fn is_on(&self, now: DateTime<Utc>, index: usize, count: usize) -> bool {
        if self.on_time_sec <= 0 {
            return false;
        }
        if self.on_time_sec >= self.cycle_sec {
            return true;
        }
        let count = count.max(1) as i64;
        let offset = index as i64 * self.cycle_sec / count;
        let elapsed = (now - self.started_at).num_seconds();
        (elapsed - offset).rem_euclid(self.cycle_sec) < self.on_time_sec
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Device {
    entity_id: String,
    /// Last command handed to the host. `None` forces a resend.
    sent: Option<DeviceAction>,
    /// Last state reported back by the device itself.
    reported_on: Option<bool>,
}

impl Device {
    fn is_active(&self) -> bool {
        match self.sent {
            Some(DeviceAction::TurnOn) => true,
            Some(DeviceAction::SetValvePosition { percent }) => percent > 0,
            Some(DeviceAction::SetHvacMode { mode }) => mode != HvacMode::Off,
            Some(DeviceAction::TurnOff) => false,
            Some(DeviceAction::SetTemperature { .. }) | None => self.reported_on.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Underlyings {
    kind: ThermostatKind,
    devices: Vec<Device>,
    /// Climate targets are tracked apart from the mode command.
    sent_temperature: Vec<Option<f64>>,
    window: Option<DutyWindow>,
}

impl Underlyings {
    pub fn new(kind: ThermostatKind, entity_ids: &[String]) -> Self {
        Self {
            kind,
            devices: entity_ids
                .iter()
                .map(|entity_id| Device {
                    entity_id: entity_id.clone(),
                    sent: None,
                    reported_on: None,
                })
                .collect(),
            sent_temperature: vec![None; entity_ids.len()],
            window: None,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|d| d.entity_id.as_str())
    }

    pub fn index_of(&self, entity_id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.entity_id == entity_id)
    }

    pub fn window(&self) -> Option<DutyWindow> {
        self.window
    }

    /// Starts a new duty window at `now`.
    pub fn start_window(&mut self, now: DateTime<Utc>, cycle_sec: i64, times: CycleTimes) {
        self.window = Some(DutyWindow {
            started_at: now,
            cycle_sec,
            on_time_sec: times.on_time_sec,
        });
    }

    /// True when the running window is over.
    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.window
            .map_or(true, |w| (now - w.started_at).num_seconds() >= w.cycle_sec)
    }

    pub fn is_device_active(&self) -> bool {
        self.devices.iter().any(Device::is_active)
    }

    pub fn active_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_active()).count()
    }

    pub fn on_reported(&mut self, index: usize, on: bool) {
        if let Some(device) = self.devices.get_mut(index) {
            device.reported_on = Some(on);
        }
    }

    /// Forgets what was sent to `entity_id` so the next dispatch resends it.
    pub fn invalidate(&mut self, entity_id: &str) -> bool {
        let Some(index) = self.index_of(entity_id) else {
            return false;
        };
        self.devices[index].sent = None;
        self.sent_temperature[index] = None;
        true
    }

    pub fn invalidate_all(&mut self) {
        for device in &mut self.devices {
            device.sent = None;
        }
        self.sent_temperature.iter_mut().for_each(|t| *t = None);
    }

    /// Commands that bring every device in line with the duty cycle or target.
    /// Only changes are emitted.
    pub fn dispatch(
        &mut self,
        now: DateTime<Utc>,
        on_percent: f64,
        hvac_mode: HvacMode,
        target: Option<f64>,
    ) -> Vec<DeviceCommand> {
        let count = self.devices.len();
        let window = self.window;
        let mut commands = Vec::new();
        for index in 0..count {
            match self.kind {
                ThermostatKind::Switch => {
                    let on = hvac_mode != HvacMode::Off
                        && window.is_some_and(|w| w.is_on(now, index, count));
                    let action = if on {
                        DeviceAction::TurnOn
                    } else {
                        DeviceAction::TurnOff
                    };
                    commands.extend(self.send(index, action));
                }
                ThermostatKind::Valve => {
                    let percent = if hvac_mode == HvacMode::Off {
                        0
                    } else {
                        (on_percent.clamp(0.0, 1.0) * 100.0).round() as u8
                    };
                    commands.extend(self.send(index, DeviceAction::SetValvePosition { percent }));
                }
                ThermostatKind::Climate => {
                    commands.extend(self.send(index, DeviceAction::SetHvacMode { mode: hvac_mode }));
                    if let Some(temperature) = target.filter(|_| hvac_mode != HvacMode::Off) {
                        if self.sent_temperature[index] != Some(temperature) {
                            self.sent_temperature[index] = Some(temperature);
                            commands.push(DeviceCommand {
                                entity_id: self.devices[index].entity_id.clone(),
                                action: DeviceAction::SetTemperature { temperature },
                            });
                        }
                    }
                }
            }
        }
        commands
    }

    /// Turns every device off regardless of the cycle.
    pub fn turn_off_all(&mut self) -> Vec<DeviceCommand> {
        self.window = None;
        let action = match self.kind {
            ThermostatKind::Switch => DeviceAction::TurnOff,
            ThermostatKind::Valve => DeviceAction::SetValvePosition { percent: 0 },
            ThermostatKind::Climate => DeviceAction::SetHvacMode { mode: HvacMode::Off },
        };
        (0..self.devices.len())
            .filter_map(|index| self.send(index, action))
            .collect()
    }

    fn send(&mut self, index: usize, action: DeviceAction) -> Option<DeviceCommand> {
        let device = &mut self.devices[index];
        if device.sent == Some(action) {
            return None;
        }
        device.sent = Some(action);
        Some(DeviceCommand {
            entity_id: device.entity_id.clone(),
            action,
        })
    }

    pub fn attributes(&self) -> Value {
        json!(self
            .devices
            .iter()
            .map(|device| json!({
                "entity_id": device.entity_id,
                "active": device.is_active(),
                "last_command": device.sent.map(|a| a.name()),
            }))
            .collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn relays_are_staggered() {
        let window = DutyWindow {
            started_at: t0(),
            cycle_sec: 300,
            on_time_sec: 100,
        };

        // Second of two relays starts half a cycle later.
        assert!(window.is_on(t0(), 0, 2));
        assert!(!window.is_on(t0(), 1, 2));
        assert!(!window.is_on(t0() + Duration::seconds(120), 0, 2));
        assert!(window.is_on(t0() + Duration::seconds(160), 1, 2));
        // Wraps around the cycle.
        assert!(!window.is_on(t0() + Duration::seconds(299), 1, 2));
        assert!(!window.is_on(t0() + Duration::seconds(20), 1, 2));
    }

    #[test]
    fn switch_only_sends_changes() {
        let mut underlyings = Underlyings::new(ThermostatKind::Switch, &ids(&["switch.a"]));
        underlyings.start_window(
            t0(),
            300,
            CycleTimes {
                on_time_sec: 120,
                off_time_sec: 180,
            },
        );

        let first = underlyings.dispatch(t0(), 0.4, HvacMode::Heat, Some(20.0));
        let again = underlyings.dispatch(t0() + Duration::seconds(10), 0.4, HvacMode::Heat, Some(20.0));
        let off = underlyings.dispatch(t0() + Duration::seconds(120), 0.4, HvacMode::Heat, Some(20.0));

        assert_eq!(
            first,
            vec![DeviceCommand {
                entity_id: "switch.a".to_string(),
                action: DeviceAction::TurnOn,
            }]
        );
        assert!(again.is_empty());
        assert_eq!(off[0].action, DeviceAction::TurnOff);
        assert!(!underlyings.is_device_active());
    }

    #[test]
    fn valve_position_follows_on_percent() {
        let mut underlyings = Underlyings::new(ThermostatKind::Valve, &ids(&["valve.a"]));

        let commands = underlyings.dispatch(t0(), 0.427, HvacMode::Heat, None);

        assert_eq!(commands[0].action, DeviceAction::SetValvePosition { percent: 43 });
        assert!(underlyings.is_device_active());
        assert!(underlyings.dispatch(t0(), 0.427, HvacMode::Heat, None).is_empty());
    }

    #[test]
    fn climate_forwards_mode_and_target() {
        let mut underlyings = Underlyings::new(ThermostatKind::Climate, &ids(&["climate.ac"]));

        let commands = underlyings.dispatch(t0(), 0.0, HvacMode::Cool, Some(24.0));

        assert_eq!(
            commands.iter().map(|c| c.action).collect::<Vec<_>>(),
            vec![
                DeviceAction::SetHvacMode { mode: HvacMode::Cool },
                DeviceAction::SetTemperature { temperature: 24.0 },
            ]
        );
    }

    #[test]
    fn invalidated_device_is_resent() {
        let mut underlyings = Underlyings::new(ThermostatKind::Valve, &ids(&["valve.a"]));
        underlyings.dispatch(t0(), 0.5, HvacMode::Heat, None);

        assert!(underlyings.invalidate("valve.a"));

        assert_eq!(underlyings.dispatch(t0(), 0.5, HvacMode::Heat, None).len(), 1);
    }
}
