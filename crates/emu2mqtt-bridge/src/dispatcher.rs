//! Inbound MQTT commands → device write-commands.
//!
//! The dispatcher recognizes both the per-entity command topics the
//! discovery configs announce (`<prefix>/<id>/<name>/set`) and the flat
//! legacy topics (`<prefix>/restart`, …), plus the Home Assistant birth
//! topic. Anything unrecognized is logged and dropped; a command never
//! becomes a fatal error. Writes are fire-and-forget: confirmation, if
//! any, arrives later as an ordinary device event.

use emu2mqtt_core::{EmuDeviceInfo, LinkState};
use emu2mqtt_protocol::{format_price, DeviceCommand};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// What an inbound MQTT message asks the bridge to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Write a command to the device.
    Device(DeviceCommand),
    /// Re-poll the device and re-announce discovery (HA birth or an
    /// explicit reinitialize request).
    Reinitialize,
    /// Not for us, or malformed; already logged.
    Ignore,
}

/// Translates command topics into serial writes.
pub struct CommandDispatcher {
    prefix: String,
    ha_status_topic: String,
    serial_tx: mpsc::Sender<DeviceCommand>,
    reinit_tx: mpsc::Sender<()>,
    device_info: watch::Receiver<Option<EmuDeviceInfo>>,
    serial_state: watch::Receiver<LinkState>,
}

impl CommandDispatcher {
    pub fn new(
        prefix: impl Into<String>,
        ha_status_topic: impl Into<String>,
        serial_tx: mpsc::Sender<DeviceCommand>,
        reinit_tx: mpsc::Sender<()>,
        device_info: watch::Receiver<Option<EmuDeviceInfo>>,
        serial_state: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            ha_status_topic: ha_status_topic.into(),
            serial_tx,
            reinit_tx,
            device_info,
            serial_state,
        }
    }

    /// All topics the MQTT link must subscribe to for this dispatcher.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/command", self.prefix),
            format!("{}/reinitialize", self.prefix),
            format!("{}/restart", self.prefix),
            format!("{}/close_current_period", self.prefix),
            format!("{}/set_current_price", self.prefix),
            format!("{}/+/+/set", self.prefix),
            self.ha_status_topic.clone(),
        ]
    }

    fn meter_mac(&self) -> Option<String> {
        self.device_info
            .borrow()
            .as_ref()
            .and_then(|i| i.meter_mac_id.clone())
    }

    /// Classify one inbound message.
    pub fn action(&self, topic: &str, payload: &[u8]) -> CommandAction {
        if topic == self.ha_status_topic {
            return if payload == b"online" {
                CommandAction::Reinitialize
            } else {
                debug!(topic, "ignoring HA status payload");
                CommandAction::Ignore
            };
        }

        let Some(rest) = topic.strip_prefix(&self.prefix).and_then(|r| r.strip_prefix('/'))
        else {
            warn!(topic, "command on unrecognized topic");
            return CommandAction::Ignore;
        };

        // Per-entity form announced by discovery: <id>/<name>/set.
        let name = match rest.split('/').collect::<Vec<_>>().as_slice() {
            [name] => *name,
            [_id, name, "set"] => *name,
            _ => {
                warn!(topic, "command on unrecognized topic");
                return CommandAction::Ignore;
            }
        };

        match name {
            "restart" => CommandAction::Device(DeviceCommand::Restart),
            "reinitialize" => CommandAction::Reinitialize,
            "close_current_period" => match self.meter_mac() {
                Some(meter_mac_id) => {
                    CommandAction::Device(DeviceCommand::CloseCurrentPeriod { meter_mac_id })
                }
                None => {
                    warn!("close_current_period before the meter is known; dropping");
                    CommandAction::Ignore
                }
            },
            "set_current_price" => self.set_price_action(payload),
            "command" => match std::str::from_utf8(payload) {
                Ok(xml) => CommandAction::Device(DeviceCommand::Raw(xml.to_string())),
                Err(_) => {
                    warn!(topic, "raw command payload is not UTF-8; dropping");
                    CommandAction::Ignore
                }
            },
            other => {
                warn!(topic, command = other, "unrecognized command name");
                CommandAction::Ignore
            }
        }
    }

    fn set_price_action(&self, payload: &[u8]) -> CommandAction {
        let Some(meter_mac_id) = self.meter_mac() else {
            warn!("set_current_price before the meter is known; dropping");
            return CommandAction::Ignore;
        };
        let Ok(cents) = std::str::from_utf8(payload) else {
            warn!("set_current_price payload is not UTF-8; dropping");
            return CommandAction::Ignore;
        };
        match format_price(cents) {
            Some((price, trailing_digits)) => CommandAction::Device(
                DeviceCommand::SetCurrentPrice {
                    meter_mac_id,
                    price,
                    trailing_digits,
                },
            ),
            None => {
                warn!(payload = cents, "set_current_price payload is not a price; dropping");
                CommandAction::Ignore
            }
        }
    }

    /// Classify and act on one inbound message.
    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        match self.action(topic, payload) {
            CommandAction::Device(command) => {
                // Policy for a command while the device is offline: fail
                // now and say so, do not queue a stale write.
                if !self.serial_state.borrow().is_connected() {
                    warn!(
                        command = command.name(),
                        "serial link is down; command dropped"
                    );
                    return;
                }
                debug!(command = command.name(), "queueing device command");
                if self.serial_tx.send(command).await.is_err() {
                    warn!("serial command channel closed; command dropped");
                }
            }
            CommandAction::Reinitialize => {
                if self.reinit_tx.send(()).await.is_err() {
                    warn!("reinitialize channel closed");
                }
            }
            CommandAction::Ignore => {}
        }
    }
}
