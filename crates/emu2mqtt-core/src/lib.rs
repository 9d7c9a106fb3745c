//! Shared types for the EMU-2 MQTT bridge.
//!
//! This crate is the leaf of the workspace: typed device events, the
//! error taxonomy, the per-link connection state machine with its backoff
//! policy, and environment-based configuration. Everything else depends
//! on it and nothing here performs I/O.

pub mod config;
pub mod error;
pub mod event;
pub mod link;

pub use config::{BridgeConfig, MqttSettings, SerialSettings};
pub use error::{
    ConfigError, FrameError, LinkError, MappingError, MapResult,
};
pub use event::{DeviceEvent, EmuDeviceInfo};
pub use link::{BackoffPolicy, LinkState, Reconnector};
