//! The bridge proper: link lifecycle, caching, dispatch, discovery.
//!
//! Two independent link managers ([`serial::SerialLink`],
//! [`mqtt::MqttLink`]) each own their connection state machine. Decoded
//! device events flow through a single consumer that updates the
//! [`cache::StateCache`] and forwards only changed values to the MQTT
//! publish queue; inbound command topics go the other way through the
//! [`dispatcher::CommandDispatcher`] to the serial write path.

pub mod cache;
pub mod discovery;
pub mod dispatcher;
pub mod mqtt;
pub mod serial;
pub mod service;

pub use cache::{Publication, StateCache};
pub use dispatcher::{CommandAction, CommandDispatcher};
pub use service::Bridge;

use emu2mqtt_core::DeviceEvent;

/// Everything the event consumer reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A decoded EMU-2 response.
    Device(DeviceEvent),
    /// The serial link came up or went down.
    SerialStatus { connected: bool },
}
