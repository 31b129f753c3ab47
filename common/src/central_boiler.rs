//! Fleet-level boiler switched on when enough underlyings demand heat.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    config::CentralBoilerConfig,
    event::{DeviceAction, DeviceCommand},
    timer::Deadline,
};

#[derive(Debug, Clone)]
pub struct CentralBoiler {
    config: Option<CentralBoilerConfig>,
    /// Last state handed to the host. `None` until the first command or after a failure.
    sent: Option<bool>,
    activation: Deadline,
    active_devices: usize,
}

impl CentralBoiler {
    pub fn new(config: Option<CentralBoilerConfig>) -> Self {
        Self {
            config,
            sent: None,
            activation: Deadline::default(),
            active_devices: 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn entity(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.entity.as_str())
    }

    pub fn is_on(&self) -> bool {
        self.sent == Some(true)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.activation.at()
    }

    /// Re-evaluates against the live number of active underlyings.
    ///
    /// Reaching the threshold arms the activation delay; the boiler only starts
    /// if the threshold still holds when it expires. Falling below switches it
    /// off at once and drops any pending activation.
    pub fn evaluate(&mut self, active_devices: usize, now: DateTime<Utc>) -> Option<DeviceCommand> {
        let config = self.config.as_ref()?;
        self.active_devices = active_devices;

        if active_devices < config.active_device_threshold {
            if self.activation.is_armed() {
                info!(active_devices, "boiler activation cancelled");
                self.activation.cancel();
            }
            if self.sent == Some(false) {
                return None;
            }
            info!(active_devices, "boiler off");
            return self.send(false);
        }

        if self.is_on() {
            return None;
        }
        if !self.activation.is_armed() {
            if config.activation_delay_sec <= 0 {
                info!(active_devices, "boiler on");
                return self.send(true);
            }
            self.activation
                .arm_in(now, Duration::seconds(config.activation_delay_sec));
            info!(
                active_devices,
                delay_sec = config.activation_delay_sec,
                "boiler activation scheduled"
            );
            return None;
        }
        if self.activation.fire_if_due(now) {
            info!(active_devices, "boiler on");
            return self.send(true);
        }
        None
    }

    /// Forgets the last command so the next evaluation resends it.
    pub fn invalidate(&mut self) {
        self.sent = None;
    }

    pub fn stop(&mut self) {
        self.activation.cancel();
    }

    fn send(&mut self, on: bool) -> Option<DeviceCommand> {
        let entity_id = self.config.as_ref()?.entity.clone();
        self.sent = Some(on);
        Some(DeviceCommand {
            entity_id,
            action: if on {
                DeviceAction::TurnOn
            } else {
                DeviceAction::TurnOff
            },
        })
    }

    pub fn attributes(&self) -> Value {
        json!({
            "configured": self.is_configured(),
            "entity": self.entity(),
            "on": self.is_on(),
            "active_devices": self.active_devices,
            "threshold": self.config.as_ref().map(|c| c.active_device_threshold),
            "activation_at": self.activation.at(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn boiler(delay_sec: i64) -> CentralBoiler {
        CentralBoiler::new(Some(CentralBoilerConfig {
            entity: "switch.boiler".to_string(),
            active_device_threshold: 2,
            activation_delay_sec: delay_sec,
        }))
    }

    fn command(action: DeviceAction) -> Option<DeviceCommand> {
        Some(DeviceCommand {
            entity_id: "switch.boiler".to_string(),
            action,
        })
    }

    #[test]
    fn starts_after_delay_when_threshold_holds() {
        let mut boiler = boiler(30);

        assert_eq!(boiler.evaluate(1, t0()), command(DeviceAction::TurnOff));
        assert_eq!(boiler.evaluate(2, t0()), None);
        assert_eq!(boiler.evaluate(2, t0() + Duration::seconds(29)), None);
        assert_eq!(
            boiler.evaluate(3, t0() + Duration::seconds(30)),
            command(DeviceAction::TurnOn)
        );
        assert!(boiler.is_on());
        assert_eq!(boiler.evaluate(3, t0() + Duration::seconds(31)), None);
    }

    #[test]
    fn activation_is_dropped_when_demand_falls_back() {
        let mut boiler = boiler(30);
        boiler.evaluate(0, t0());

        boiler.evaluate(2, t0());
        assert_eq!(boiler.evaluate(1, t0() + Duration::seconds(10)), None);
        assert_eq!(boiler.next_deadline(), None);
        assert_eq!(boiler.evaluate(1, t0() + Duration::seconds(40)), None);
        assert!(!boiler.is_on());
    }

    #[test]
    fn switches_off_immediately_below_threshold() {
        let mut boiler = boiler(0);

        assert_eq!(boiler.evaluate(2, t0()), command(DeviceAction::TurnOn));
        assert_eq!(boiler.evaluate(1, t0()), command(DeviceAction::TurnOff));
    }

    #[test]
    fn failed_command_is_resent() {
        let mut boiler = boiler(0);
        boiler.evaluate(2, t0());

        boiler.invalidate();

        assert_eq!(boiler.evaluate(2, t0()), command(DeviceAction::TurnOn));
    }
}
