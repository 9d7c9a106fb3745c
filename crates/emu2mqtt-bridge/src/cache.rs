//! Last-known state and the idempotence boundary.
//!
//! `StateCache::update` is the only place device events become MQTT
//! publications. It remembers the significant value last published per
//! entity and returns only the deltas, so a device repeating an unchanged
//! reading (which it does constantly) produces no broker traffic. It also
//! owns the device identity, the current price/period facts, and the
//! device-clock offset used to turn the EMU-2's drifting timestamps into
//! something Home Assistant can display.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use emu2mqtt_core::{DeviceEvent, EmuDeviceInfo};
use serde_json::json;
use tracing::{debug, info};

use crate::discovery::discovery_configs;

/// Device id used in topics until the EMU-2 has reported its MAC.
pub const FALLBACK_DEVICE_ID: &str = "emu2";

/// Period starts are floored to this many seconds so second-level clock
/// drift between polls does not flap the Home Assistant state.
const PERIOD_START_GRANULARITY: i64 = 300;

/// One MQTT message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Publication {
    pub fn new(topic: String, payload: serde_json::Value, retain: bool) -> Self {
        Self {
            topic,
            payload: payload.to_string(),
            retain,
        }
    }
}

/// Bridge-instance-scoped cache of last-known device facts.
pub struct StateCache {
    prefix: String,
    /// Local timezone offset in seconds, fixed at startup (`TZ`).
    tz_offset_secs: i64,
    info: Option<EmuDeviceInfo>,
    /// Seconds to add to a device timestamp to get unix time. Derived
    /// from the most recent TimeCluster sample.
    time_offset: Option<i64>,
    last_price_cents: Option<f64>,
    period_start: Option<i64>,
    /// entity -> significant value last published.
    last_values: HashMap<&'static str, String>,
    discovery: Vec<Publication>,
}

impl StateCache {
    pub fn new(prefix: impl Into<String>, tz_offset_secs: i64) -> Self {
        Self {
            prefix: prefix.into(),
            tz_offset_secs,
            info: None,
            time_offset: None,
            last_price_cents: None,
            period_start: None,
            last_values: HashMap::new(),
            discovery: Vec::new(),
        }
    }

    /// Device id for topics: the reported MAC once known.
    pub fn device_id(&self) -> &str {
        self.info
            .as_ref()
            .map(|i| i.device_mac_id.as_str())
            .unwrap_or(FALLBACK_DEVICE_ID)
    }

    pub fn info(&self) -> Option<&EmuDeviceInfo> {
        self.info.as_ref()
    }

    pub fn last_price_cents(&self) -> Option<f64> {
        self.last_price_cents
    }

    pub fn period_start(&self) -> Option<i64> {
        self.period_start
    }

    /// Retained discovery configs for the current device identity, empty
    /// until device info has been seen. The MQTT link replays these on
    /// every reconnect.
    pub fn discovery(&self) -> &[Publication] {
        &self.discovery
    }

    fn topic(&self, entity: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.device_id(), entity)
    }

    /// Unix time for a raw device timestamp, once the clock offset is
    /// known. Unknown stays unknown; never a fabricated zero.
    fn corrected(&self, raw: Option<i64>) -> Option<i64> {
        match (raw, self.time_offset) {
            (Some(ts), Some(offset)) => Some(ts + offset),
            _ => None,
        }
    }

    fn corrected_period_start(&self, raw: Option<i64>) -> Option<i64> {
        self.corrected(raw)
            .map(|ts| ts - ts.rem_euclid(PERIOD_START_GRANULARITY))
    }

    /// Emit a publication unless the entity's significant value is
    /// unchanged since the last one.
    fn changed(
        &mut self,
        entity: &'static str,
        key: String,
        payload: serde_json::Value,
        retain: bool,
        out: &mut Vec<Publication>,
    ) {
        if self.last_values.get(entity) == Some(&key) {
            debug!(entity, "suppressing unchanged reading");
            return;
        }
        self.last_values.insert(entity, key);
        out.push(Publication::new(self.topic(entity), payload, retain));
    }

    /// Apply one device event; returns the publications it warrants.
    pub fn update(&mut self, event: &DeviceEvent, now_unix: i64) -> Vec<Publication> {
        let mut out = Vec::new();
        let entity = event.entity();
        match event {
            DeviceEvent::InstantaneousDemand {
                demand_kw,
                timestamp,
            } => {
                let payload = json!({
                    "demand": demand_kw,
                    "timestamp": self.corrected(*timestamp),
                });
                self.changed(
                    entity,
                    format!("{demand_kw}"),
                    payload,
                    false,
                    &mut out,
                );
            }
            DeviceEvent::CurrentSummationDelivered {
                delivered_kwh,
                received_kwh,
                timestamp,
            } => {
                let payload = json!({
                    "summation_delivered": delivered_kwh,
                    "summation_received": received_kwh,
                    "timestamp": self.corrected(*timestamp),
                });
                self.changed(
                    entity,
                    format!("{delivered_kwh}|{received_kwh}"),
                    payload,
                    false,
                    &mut out,
                );
            }
            DeviceEvent::CurrentPeriodUsage {
                usage_kwh,
                start_date,
            } => {
                let start = self.corrected_period_start(*start_date);
                self.period_start = start;
                let payload = json!({
                    "current_usage": usage_kwh,
                    "start_date": start,
                });
                self.changed(
                    entity,
                    format!("{usage_kwh}|{start:?}"),
                    payload,
                    false,
                    &mut out,
                );
            }
            DeviceEvent::LastPeriodUsage {
                usage_kwh,
                start_date,
                end_date,
            } => {
                let payload = json!({
                    "last_usage": usage_kwh,
                    "start_date": self.corrected(*start_date),
                    "end_date": self.corrected(*end_date),
                });
                self.changed(
                    entity,
                    format!("{usage_kwh}"),
                    payload,
                    false,
                    &mut out,
                );
            }
            DeviceEvent::PriceCluster {
                price_cents,
                tier,
                timestamp,
            } => {
                self.last_price_cents = *price_cents;
                let payload = json!({
                    "price": price_cents,
                    "tier": tier,
                    "timestamp": self.corrected(*timestamp),
                });
                self.changed(
                    entity,
                    format!("{price_cents:?}|{tier}"),
                    payload,
                    false,
                    &mut out,
                );
            }
            DeviceEvent::ConnectionStatus {
                meter_mac_id,
                status,
                link_strength,
            } => {
                // Adopt the meter MAC only from an established link; a
                // rejoining device can report a stale one.
                if DeviceEvent::meter_connected(status) {
                    if let (Some(info), Some(mac)) = (self.info.as_mut(), meter_mac_id) {
                        info.meter_mac_id = Some(mac.clone());
                    }
                }
                let payload = json!({
                    "status": status,
                    "link_strength": link_strength,
                });
                // Retained so HA sees last-known meter availability after
                // its own restarts.
                self.changed(
                    entity,
                    format!("{status}|{link_strength}"),
                    payload,
                    true,
                    &mut out,
                );
            }
            DeviceEvent::TimeCluster {
                utc_time,
                local_time,
            } => {
                self.time_offset = Some(now_unix - local_time + self.tz_offset_secs);
                let payload = json!({
                    "utctime": utc_time,
                    "local_time": local_time,
                });
                self.changed(
                    entity,
                    format!("{utc_time}|{local_time}"),
                    payload,
                    false,
                    &mut out,
                );
            }
            DeviceEvent::DeviceInfo(info) => {
                let key = format!(
                    "{}|{:?}|{:?}",
                    info.device_mac_id, info.model_id, info.fw_version
                );
                if self.last_values.get(entity) == Some(&key) {
                    return out;
                }
                // Keep a meter MAC learned earlier from connection status.
                let meter_mac_id = info.meter_mac_id.clone().or_else(|| {
                    self.info.as_ref().and_then(|i| i.meter_mac_id.clone())
                });
                let cached = EmuDeviceInfo {
                    meter_mac_id,
                    ..info.clone()
                };
                // Anything published before the MAC was known went out
                // under the placeholder id; those topics are gone, so the
                // suppression state must not carry over to the real ones.
                if self.device_id() != cached.device_mac_id {
                    self.last_values.clear();
                }
                self.info = Some(cached.clone());
                self.last_values.insert(entity, key);

                let payload =
                    serde_json::to_value(&cached).unwrap_or_else(|_| json!({}));
                out.push(Publication::new(self.topic(entity), payload, false));

                self.discovery =
                    discovery_configs(&self.prefix, &cached);
                info!(
                    device = %cached.device_mac_id,
                    entities = self.discovery.len(),
                    "announcing Home Assistant discovery"
                );
                out.extend(self.discovery.iter().cloned());
            }
        }
        out
    }

    /// Bridge availability (serial link up/down), retained.
    pub fn bridge_status(&mut self, connected: bool, now_unix: i64) -> Vec<Publication> {
        let mut out = Vec::new();
        let datetime = DateTime::<Utc>::from_timestamp(now_unix, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let payload = json!({
            "connected": connected,
            "datetime": datetime,
        });
        self.changed("status", format!("{connected}"), payload, true, &mut out);
        out
    }
}
