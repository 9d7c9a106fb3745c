//! Typed events decoded from EMU-2 responses.
//!
//! Each variant carries only the fields present in the source frame;
//! optional fields the device omitted (or flagged with its `0xffffffff`
//! sentinel) are `None`, never defaulted to zero, so the bridge cannot
//! publish a false reading.

use serde::{Deserialize, Serialize};

/// Identity block reported by the EMU-2 unit itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmuDeviceInfo {
    /// MAC of the EMU-2 unit, e.g. `0xd8d5b900000113ae`.
    pub device_mac_id: String,
    /// MAC of the joined meter, learned from connection status frames.
    pub meter_mac_id: Option<String>,
    pub manufacturer: Option<String>,
    pub model_id: Option<String>,
    pub fw_version: Option<String>,
    pub hw_version: Option<String>,
}

/// One decoded EMU-2 response.
///
/// Energy values are already scaled by the multiplier/divisor pair the
/// device reports alongside them; timestamps are raw device seconds and
/// are corrected against the device clock downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Current demand seen by the meter, in kW.
    InstantaneousDemand {
        demand_kw: f64,
        timestamp: Option<i64>,
    },

    /// Cumulative meter registers, in kWh.
    CurrentSummationDelivered {
        delivered_kwh: f64,
        received_kwh: f64,
        timestamp: Option<i64>,
    },

    /// Usage accrued in the open billing period, with its start instant.
    CurrentPeriodUsage {
        usage_kwh: f64,
        start_date: Option<i64>,
    },

    /// Usage of the most recently closed billing period.
    LastPeriodUsage {
        usage_kwh: f64,
        start_date: Option<i64>,
        end_date: Option<i64>,
    },

    /// Tariff currently programmed into the device. `price_cents` is
    /// cents per kWh; `None` when the device reports no price set.
    PriceCluster {
        price_cents: Option<f64>,
        tier: u32,
        timestamp: Option<i64>,
    },

    /// Radio link between the EMU-2 and the meter.
    ConnectionStatus {
        meter_mac_id: Option<String>,
        status: String,
        /// Signal strength in percent (device reports 0x00..=0x64).
        link_strength: u8,
    },

    /// Device clock sample, used to derive the clock offset.
    TimeCluster { utc_time: i64, local_time: i64 },

    /// Identity of the EMU-2 unit.
    DeviceInfo(EmuDeviceInfo),
}

impl DeviceEvent {
    /// Whether this connection status means the meter link is up.
    pub fn meter_connected(status: &str) -> bool {
        status == "Connected"
    }

    /// Snake-case entity name used as the MQTT topic leaf, mirroring the
    /// device's own response tag.
    pub fn entity(&self) -> &'static str {
        match self {
            DeviceEvent::InstantaneousDemand { .. } => "instantaneous_demand",
            DeviceEvent::CurrentSummationDelivered { .. } => "current_summation_delivered",
            DeviceEvent::CurrentPeriodUsage { .. } => "current_period_usage",
            DeviceEvent::LastPeriodUsage { .. } => "last_period_usage",
            DeviceEvent::PriceCluster { .. } => "price_cluster",
            DeviceEvent::ConnectionStatus { .. } => "connection_status",
            DeviceEvent::TimeCluster { .. } => "time_cluster",
            DeviceEvent::DeviceInfo(_) => "device_info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_names_match_response_tags() {
        let event = DeviceEvent::InstantaneousDemand {
            demand_kw: 1.197,
            timestamp: None,
        };
        assert_eq!(event.entity(), "instantaneous_demand");

        let event = DeviceEvent::ConnectionStatus {
            meter_mac_id: None,
            status: "Connected".to_string(),
            link_strength: 100,
        };
        assert_eq!(event.entity(), "connection_status");
    }

    #[test]
    fn meter_connected_only_on_exact_status() {
        assert!(DeviceEvent::meter_connected("Connected"));
        assert!(!DeviceEvent::meter_connected("Rejoining"));
        assert!(!DeviceEvent::meter_connected(""));
    }
}
