//! Environment-based configuration.
//!
//! The bridge reads its configuration once at startup into an immutable
//! struct; there is no hot reload. Any invalid value is a fatal
//! `ConfigError` before a single connection attempt is made.

use crate::error::ConfigError;

/// Environment variable names recognized by the bridge.
pub mod env_vars {
    pub const MQTT_HOSTNAME: &str = "MQTT_HOSTNAME";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    pub const MQTT_PREFIX: &str = "MQTT_PREFIX";
    pub const MQTT_HA_STATUS: &str = "MQTT_HA_STATUS";
    pub const SERIAL_DEVICE: &str = "SERIAL_DEVICE";
    pub const SERIAL_BAUDRATE: &str = "SERIAL_BAUDRATE";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

/// MQTT broker settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic prefix for state and command topics.
    pub prefix: String,
    /// Home Assistant birth/status topic; an `online` payload there makes
    /// the bridge re-announce discovery and re-poll the device.
    pub ha_status_topic: String,
}

/// Serial device settings.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baudrate: u32,
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mqtt: MqttSettings,
    pub serial: SerialSettings,
}

impl BridgeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary lookup, so tests do not
    /// have to mutate the process environment.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let port = parse_or_default(get(env_vars::MQTT_PORT), env_vars::MQTT_PORT, 1883u16)?;
        let baudrate = parse_or_default(
            get(env_vars::SERIAL_BAUDRATE),
            env_vars::SERIAL_BAUDRATE,
            115_200u32,
        )?;

        Ok(Self {
            mqtt: MqttSettings {
                hostname: get(env_vars::MQTT_HOSTNAME)
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                port,
                username: get(env_vars::MQTT_USERNAME),
                password: get(env_vars::MQTT_PASSWORD),
                prefix: get(env_vars::MQTT_PREFIX).unwrap_or_else(|| "emu2".to_string()),
                ha_status_topic: get(env_vars::MQTT_HA_STATUS)
                    .unwrap_or_else(|| "homeassistant/status".to_string()),
            },
            serial: SerialSettings {
                device: get(env_vars::SERIAL_DEVICE)
                    .unwrap_or_else(|| "/dev/ttyACM0".to_string()),
                baudrate,
            },
        })
    }
}

fn parse_or_default<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
