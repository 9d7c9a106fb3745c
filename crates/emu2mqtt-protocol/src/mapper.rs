//! Mapping of raw frames to typed device events.
//!
//! Dispatch is on the frame's root tag. Unknown tags and frames missing a
//! required field are single-event errors; the caller logs them and moves
//! on to the next frame.
//!
//! Numeric fields follow the device's own encoding rules: integers are
//! hex (`0x…`) or plain decimal, and energy values are scaled integers
//! accompanied by a multiplier/divisor pair plus the number of decimal
//! digits to keep. `0xffffffff` is the device's "no value" sentinel.

use emu2mqtt_core::{DeviceEvent, EmuDeviceInfo, MapResult, MappingError};
use roxmltree::Document;

use crate::frame::RawFrame;

/// Raw sentinel the device uses for unset 32-bit values.
const UNSET_U32: u64 = 0xffff_ffff;

/// Decode one frame into a device event.
pub fn map_frame(frame: &RawFrame) -> MapResult<DeviceEvent> {
    let text = frame
        .as_str()
        .ok_or_else(|| MappingError::Xml("frame is not valid UTF-8".to_string()))?;
    let doc = Document::parse(text).map_err(|e| MappingError::Xml(e.to_string()))?;
    let root = doc.root_element();

    match root.tag_name().name() {
        "InstantaneousDemand" => {
            let fields = Fields::new("InstantaneousDemand", &root);
            Ok(DeviceEvent::InstantaneousDemand {
                demand_kw: fields.scaled("Demand")?,
                timestamp: fields.opt_int("TimeStamp")?,
            })
        }
        "CurrentSummationDelivered" => {
            let fields = Fields::new("CurrentSummationDelivered", &root);
            Ok(DeviceEvent::CurrentSummationDelivered {
                delivered_kwh: fields.scaled("SummationDelivered")?,
                received_kwh: fields.scaled("SummationReceived")?,
                timestamp: fields.opt_int("TimeStamp")?,
            })
        }
        "CurrentPeriodUsage" => {
            let fields = Fields::new("CurrentPeriodUsage", &root);
            Ok(DeviceEvent::CurrentPeriodUsage {
                usage_kwh: fields.scaled("CurrentUsage")?,
                start_date: fields.opt_int("StartDate")?,
            })
        }
        "LastPeriodUsage" => {
            let fields = Fields::new("LastPeriodUsage", &root);
            Ok(DeviceEvent::LastPeriodUsage {
                usage_kwh: fields.scaled("LastUsage")?,
                start_date: fields.opt_int("StartDate")?,
                end_date: fields.opt_int("EndDate")?,
            })
        }
        "PriceCluster" => {
            let fields = Fields::new("PriceCluster", &root);
            let raw_price = fields.int("Price")?;
            let trailing_digits = fields.int("TrailingDigits")?;
            let price_cents = if raw_price == UNSET_U32 {
                None
            } else {
                // Trailing digits give the decimal position in dollars;
                // shifting by two yields cents per kWh.
                Some(raw_price as f64 / 10f64.powi(trailing_digits as i32 - 2))
            };
            Ok(DeviceEvent::PriceCluster {
                price_cents,
                tier: fields.int("Tier")? as u32,
                timestamp: fields.opt_int("TimeStamp")?,
            })
        }
        "ConnectionStatus" => {
            let fields = Fields::new("ConnectionStatus", &root);
            Ok(DeviceEvent::ConnectionStatus {
                meter_mac_id: fields.opt_text("MeterMacId"),
                status: fields.text("Status")?,
                link_strength: fields.int("LinkStrength")?.min(u8::MAX as u64) as u8,
            })
        }
        "TimeCluster" => {
            let fields = Fields::new("TimeCluster", &root);
            Ok(DeviceEvent::TimeCluster {
                utc_time: fields.int("UTCTime")? as i64,
                local_time: fields.int("LocalTime")? as i64,
            })
        }
        "DeviceInfo" => {
            let fields = Fields::new("DeviceInfo", &root);
            Ok(DeviceEvent::DeviceInfo(EmuDeviceInfo {
                device_mac_id: fields.text("DeviceMacId")?,
                meter_mac_id: fields.opt_text("MeterMacId"),
                manufacturer: fields.opt_text("Manufacturer"),
                model_id: fields.opt_text("ModelId"),
                fw_version: fields.opt_text("FWVersion"),
                hw_version: fields.opt_text("HWVersion"),
            }))
        }
        other => Err(MappingError::Unrecognized(other.to_string())),
    }
}

/// Field access over one response element, carrying the tag name for
/// error context.
struct Fields<'a, 'input> {
    tag: &'static str,
    root: &'a roxmltree::Node<'a, 'input>,
}

impl<'a, 'input> Fields<'a, 'input> {
    fn new(tag: &'static str, root: &'a roxmltree::Node<'a, 'input>) -> Self {
        Self { tag, root }
    }

    fn opt_text(&self, field: &'static str) -> Option<String> {
        self.root
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == field)
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn text(&self, field: &'static str) -> MapResult<String> {
        self.opt_text(field).ok_or(MappingError::MissingField {
            tag: self.tag,
            field,
        })
    }

    fn int(&self, field: &'static str) -> MapResult<u64> {
        let raw = self.text(field)?;
        parse_int(&raw).ok_or_else(|| MappingError::InvalidValue {
            tag: self.tag,
            field,
            value: raw,
        })
    }

    fn opt_int(&self, field: &'static str) -> MapResult<Option<i64>> {
        let Some(raw) = self.opt_text(field) else {
            return Ok(None);
        };
        let value = parse_int(&raw).ok_or_else(|| MappingError::InvalidValue {
            tag: self.tag,
            field,
            value: raw,
        })?;
        if value == UNSET_U32 {
            return Ok(None);
        }
        Ok(Some(value as i64))
    }

    /// A scaled energy value: raw integer adjusted by the frame's
    /// multiplier/divisor pair, rounded to `DigitsRight` decimals. A zero
    /// divisor yields zero, matching the device's own tooling.
    fn scaled(&self, field: &'static str) -> MapResult<f64> {
        let value = self.int(field)?;
        let multiplier = self.int("Multiplier")?;
        let divisor = self.int("Divisor")?;
        let digits_right = self.int("DigitsRight")?;
        if divisor == 0 {
            return Ok(0.0);
        }
        let scaled = (value as f64) * (multiplier as f64) / (divisor as f64);
        let precision = 10f64.powi(digits_right.min(12) as i32);
        Ok((scaled * precision).round() / precision)
    }
}

/// Parse `0x…` hex or plain decimal.
fn parse_int(raw: &str) -> Option<u64> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}
