pub const TOPIC_STATE_PREFIX: &str = "vtherm/state/";
pub const TOPIC_STATE_WILDCARD: &str = "vtherm/state/#";
pub const TOPIC_CMND_PREFIX: &str = "vtherm/cmnd/";
pub const TOPIC_THERMOSTAT_PREFIX: &str = "vtherm/thermostat/";
pub const TOPIC_EVENT_PREFIX: &str = "vtherm/event/";

/// Entity id of a reading published on `vtherm/state/<entity_id>`.
pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_STATE_PREFIX)
        .filter(|entity| !entity.is_empty())
}

pub fn command_topic(entity_id: &str, action: &str) -> String {
    format!("{TOPIC_CMND_PREFIX}{entity_id}/{action}")
}

pub fn attributes_topic(name: &str) -> String {
    format!("{TOPIC_THERMOSTAT_PREFIX}{name}/attributes")
}

pub fn event_topic(name: &str) -> String {
    format!("{TOPIC_EVENT_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_topic_yields_entity() {
        assert_eq!(
            entity_from_state_topic("vtherm/state/sensor.living_temperature"),
            Some("sensor.living_temperature")
        );
        assert_eq!(entity_from_state_topic("vtherm/state/"), None);
        assert_eq!(entity_from_state_topic("other/state/x"), None);
    }

    #[test]
    fn command_topic_layout() {
        assert_eq!(
            command_topic("switch.heater", "turn_on"),
            "vtherm/cmnd/switch.heater/turn_on"
        );
    }
}
