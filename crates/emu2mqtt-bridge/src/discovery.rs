//! Home Assistant MQTT discovery payloads.
//!
//! One retained config message per entity on
//! `homeassistant/<component>/<object-id>/config`, carrying the shared
//! device block so HA groups everything under a single EMU-2 device.
//! Replayed on every MQTT reconnect since broker session state is not
//! assumed persistent.

use emu2mqtt_core::EmuDeviceInfo;
use serde_json::{json, Value};

use crate::cache::Publication;

/// Jinja template HA evaluates to decide whether the meter link is up.
const METER_STATUS_TEMPLATE: &str = "{% if value_json.status == \"Connected\" %}{{ value_json.status }}{% else %}Disconnected{% endif %}";

/// Build the full retained discovery set for a known device identity.
pub fn discovery_configs(prefix: &str, info: &EmuDeviceInfo) -> Vec<Publication> {
    let mac = &info.device_mac_id;
    let state = |entity: &str| format!("{prefix}/{mac}/{entity}");
    let command = |name: &str| format!("{prefix}/{mac}/{name}/set");

    let device = json!({
        "identifiers": [mac],
        "name": "EMU2",
        "manufacturer": info.manufacturer,
        "model": info.model_id,
        "hw_version": info.hw_version,
        "sw_version": info.fw_version,
    });

    // Entities that need the serial link only, vs. the meter link too.
    let serial_available = json!({
        "payload_available": true,
        "payload_not_available": false,
        "topic": state("status"),
        "value_template": "{{ value_json.connected }}",
    });
    let meter_available = json!({
        "payload_available": "Connected",
        "payload_not_available": "Disconnected",
        "topic": state("connection_status"),
        "value_template": METER_STATUS_TEMPLATE,
    });
    let serial_availability = json!([&serial_available]);
    let all_availability = json!([&serial_available, &meter_available]);

    let entities: Vec<(&str, Value)> = vec![
        (
            "binary_sensor",
            json!({
                "name": "Status",
                "device_class": "connectivity",
                "json_attributes_topic": state("status"),
                "state_topic": state("status"),
                "value_template": "{{ value_json.connected }}",
                "payload_on": true,
                "payload_off": false,
                "entity_category": "diagnostic",
                "unique_id": format!("{mac}_status"),
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Meter Connection Strength",
                "unit_of_measurement": "%",
                "icon": "mdi:signal",
                "json_attributes_topic": state("connection_status"),
                "state_topic": state("connection_status"),
                "value_template": "{{ value_json.link_strength }}",
                "entity_category": "diagnostic",
                "unique_id": format!("{mac}_meter_connection_strength"),
                "availability": &serial_availability,
                "device": &device,
            }),
        ),
        (
            "binary_sensor",
            json!({
                "name": "Meter Status",
                "device_class": "connectivity",
                "json_attributes_topic": state("connection_status"),
                "state_topic": state("connection_status"),
                "value_template": METER_STATUS_TEMPLATE,
                "payload_on": "Connected",
                "payload_off": "Disconnected",
                "entity_category": "diagnostic",
                "unique_id": format!("{mac}_meter_status"),
                "availability": &serial_availability,
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Power",
                "device_class": "power",
                "state_class": "measurement",
                "unit_of_measurement": "kW",
                "state_topic": state("instantaneous_demand"),
                "value_template": "{{ value_json.demand }}",
                "unique_id": format!("{mac}_power"),
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Total Delivered",
                "device_class": "energy",
                "state_class": "total_increasing",
                "unit_of_measurement": "kWh",
                "json_attributes_topic": state("current_summation_delivered"),
                "state_topic": state("current_summation_delivered"),
                "value_template": "{{ value_json.summation_delivered }}",
                "unique_id": format!("{mac}_energy_delivered"),
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Total Received",
                "device_class": "energy",
                "state_class": "total_increasing",
                "unit_of_measurement": "kWh",
                "json_attributes_topic": state("current_summation_delivered"),
                "state_topic": state("current_summation_delivered"),
                "value_template": "{{ value_json.summation_received }}",
                "unique_id": format!("{mac}_energy_received"),
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Current Period Usage",
                "device_class": "energy",
                "state_class": "total",
                "unit_of_measurement": "kWh",
                "json_attributes_topic": state("current_period_usage"),
                "state_topic": state("current_period_usage"),
                "value_template": "{{ value_json.current_usage }}",
                "unique_id": format!("{mac}_current_usage"),
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Current Period Start",
                "device_class": "timestamp",
                "state_topic": state("current_period_usage"),
                "value_template": "{{ as_local(as_datetime(value_json.start_date)) }}",
                "entity_category": "diagnostic",
                "unique_id": format!("{mac}_current_start"),
                "device": &device,
            }),
        ),
        (
            "button",
            json!({
                "name": "Restart",
                "device_class": "restart",
                "command_topic": command("restart"),
                "availability_mode": "all",
                "availability": &all_availability,
                "payload_press": "restart",
                "entity_category": "config",
                "unique_id": format!("{mac}_restart"),
                "device": &device,
            }),
        ),
        (
            "button",
            json!({
                "name": "Close Current Period",
                "command_topic": command("close_current_period"),
                "availability_mode": "all",
                "availability": &all_availability,
                "payload_press": "close_current_period",
                "entity_category": "config",
                "unique_id": format!("{mac}_close_current_period"),
                "device": &device,
            }),
        ),
        (
            "number",
            json!({
                "name": "Current Price",
                "mode": "box",
                "min": "0",
                "step": "0.001",
                "device_class": "monetary",
                "entity_category": "config",
                "unit_of_measurement": "¢",
                "command_topic": command("set_current_price"),
                "json_attributes_topic": state("price_cluster"),
                "state_topic": state("price_cluster"),
                "value_template": "{{ value_json.price }}",
                "availability_mode": "all",
                "availability": &all_availability,
                "unique_id": format!("{mac}_current_price"),
                "device": &device,
            }),
        ),
        (
            "sensor",
            json!({
                "name": "Energy Price",
                "device_class": "monetary",
                "unit_of_measurement": "USD/kWh",
                "json_attributes_topic": state("price_cluster"),
                "state_topic": state("price_cluster"),
                "value_template": "{{ value_json.price|float / 100 }}",
                "unique_id": format!("{mac}_energy_price"),
                "device": &device,
            }),
        ),
    ];

    entities
        .into_iter()
        .map(|(component, config)| {
            let object_id = config["unique_id"].as_str().unwrap_or_default().to_string();
            Publication::new(
                format!("homeassistant/{component}/{object_id}/config"),
                config,
                true,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> EmuDeviceInfo {
        EmuDeviceInfo {
            device_mac_id: "0xd8d5b900000113ae".to_string(),
            meter_mac_id: Some("0x00078100007a175d".to_string()),
            manufacturer: Some("Rainforest Automation, Inc.".to_string()),
            model_id: Some("Z105-2-EMU2-LEDD_JM".to_string()),
            fw_version: Some("2.0.0 (7400)".to_string()),
            hw_version: Some("2.7.3".to_string()),
        }
    }

    #[test]
    fn full_entity_set_is_announced_retained() {
        let configs = discovery_configs("emu2", &info());
        assert_eq!(configs.len(), 12);
        assert!(configs.iter().all(|p| p.retain));
        assert!(configs
            .iter()
            .all(|p| p.topic.starts_with("homeassistant/") && p.topic.ends_with("/config")));
    }

    #[test]
    fn every_entity_links_the_same_device_block() {
        for publication in discovery_configs("emu2", &info()) {
            let config: serde_json::Value = serde_json::from_str(&publication.payload).unwrap();
            assert_eq!(
                config["device"]["identifiers"][0], "0xd8d5b900000113ae",
                "entity {} lost its device block",
                publication.topic
            );
            assert_eq!(config["device"]["model"], "Z105-2-EMU2-LEDD_JM");
        }
    }

    #[test]
    fn state_and_command_topics_follow_the_convention() {
        let configs = discovery_configs("emu2", &info());
        let power = configs
            .iter()
            .find(|p| p.topic.contains("_power"))
            .unwrap();
        let config: serde_json::Value = serde_json::from_str(&power.payload).unwrap();
        assert_eq!(
            config["state_topic"],
            "emu2/0xd8d5b900000113ae/instantaneous_demand"
        );

        let restart = configs
            .iter()
            .find(|p| p.topic.contains("_restart"))
            .unwrap();
        let config: serde_json::Value = serde_json::from_str(&restart.payload).unwrap();
        assert_eq!(
            config["command_topic"],
            "emu2/0xd8d5b900000113ae/restart/set"
        );
    }

    #[test]
    fn buttons_require_both_links_available() {
        let configs = discovery_configs("emu2", &info());
        let close = configs
            .iter()
            .find(|p| p.topic.contains("_close_current_period"))
            .unwrap();
        let config: serde_json::Value = serde_json::from_str(&close.payload).unwrap();
        assert_eq!(config["availability_mode"], "all");
        assert_eq!(config["availability"].as_array().unwrap().len(), 2);
    }
}
