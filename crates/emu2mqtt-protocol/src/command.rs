//! Device-bound write commands.
//!
//! The EMU-2 accepts a small XML command vocabulary on its serial write
//! path: `<Command><Name>…</Name>…</Command>`. Meter-scoped commands carry
//! the meter MAC the device reported; refreshable reads pass `Refresh=Y`
//! so the device asks the meter instead of answering from cache.

/// One command in the device's write vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    GetDeviceInfo,
    GetTime,
    Restart,
    GetConnectionStatus {
        meter_mac_id: String,
    },
    GetCurrentSummationDelivered {
        meter_mac_id: String,
    },
    GetCurrentPrice {
        meter_mac_id: String,
    },
    GetCurrentPeriodUsage {
        meter_mac_id: String,
    },
    GetLastPeriodUsage {
        meter_mac_id: String,
    },
    CloseCurrentPeriod {
        meter_mac_id: String,
    },
    SetCurrentPrice {
        meter_mac_id: String,
        /// Hex-encoded price mantissa, e.g. `0x13B`.
        price: String,
        /// Hex-encoded decimal position, e.g. `0x3`.
        trailing_digits: String,
    },
    /// Pre-formed XML passed through untouched (the raw command topic).
    Raw(String),
}

impl DeviceCommand {
    /// Command name as the device spells it.
    pub fn name(&self) -> &str {
        match self {
            DeviceCommand::GetDeviceInfo => "get_device_info",
            DeviceCommand::GetTime => "get_time",
            DeviceCommand::Restart => "restart",
            DeviceCommand::GetConnectionStatus { .. } => "get_connection_status",
            DeviceCommand::GetCurrentSummationDelivered { .. } => {
                "get_current_summation_delivered"
            }
            DeviceCommand::GetCurrentPrice { .. } => "get_current_price",
            DeviceCommand::GetCurrentPeriodUsage { .. } => "get_current_period_usage",
            DeviceCommand::GetLastPeriodUsage { .. } => "get_last_period_usage",
            DeviceCommand::CloseCurrentPeriod { .. } => "close_current_period",
            DeviceCommand::SetCurrentPrice { .. } => "set_current_price",
            DeviceCommand::Raw(_) => "raw",
        }
    }

    /// Render the XML the device expects on its write path.
    pub fn to_xml(&self) -> String {
        let mut params: Vec<(&str, &str)> = Vec::new();
        match self {
            DeviceCommand::GetDeviceInfo
            | DeviceCommand::GetTime
            | DeviceCommand::Restart => {}
            DeviceCommand::GetConnectionStatus { meter_mac_id }
            | DeviceCommand::GetCurrentSummationDelivered { meter_mac_id } => {
                params.push(("MeterMacId", meter_mac_id));
                params.push(("Refresh", "Y"));
            }
            DeviceCommand::GetCurrentPrice { meter_mac_id }
            | DeviceCommand::GetCurrentPeriodUsage { meter_mac_id }
            | DeviceCommand::GetLastPeriodUsage { meter_mac_id }
            | DeviceCommand::CloseCurrentPeriod { meter_mac_id } => {
                params.push(("MeterMacId", meter_mac_id));
            }
            DeviceCommand::SetCurrentPrice {
                meter_mac_id,
                price,
                trailing_digits,
            } => {
                params.push(("MeterMacId", meter_mac_id));
                params.push(("Price", price));
                params.push(("TrailingDigits", trailing_digits));
            }
            DeviceCommand::Raw(xml) => return xml.clone(),
        }

        let mut xml = String::from("<Command>");
        xml.push_str("<Name>");
        xml.push_str(self.name());
        xml.push_str("</Name>");
        for (key, value) in params {
            xml.push('<');
            xml.push_str(key);
            xml.push('>');
            xml.push_str(value);
            xml.push_str("</");
            xml.push_str(key);
            xml.push('>');
        }
        xml.push_str("</Command>");
        xml
    }
}

/// Encode a cents-per-kWh amount (as the user typed it) into the
/// price/trailing-digits pair the device stores: the price is the decimal
/// mantissa of the dollar amount and the trailing digits its decimal
/// position. `None` for anything that is not a plain decimal number.
///
/// `"1.1"` → `("0xB", "0x3")`, `"31.50"` → `("0x13B", "0x3")`,
/// `"111.111"` → `("0x1B207", "0x5")`.
pub fn format_price(cents: &str) -> Option<(String, String)> {
    let cents = cents.trim();
    let (int_part, frac_part) = match cents.split_once('.') {
        Some((i, f)) => (i, f),
        None => (cents, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    // Dollar amount = cents / 100, so the decimal position is the cents
    // fraction length plus two.
    let mut mantissa: u64 = format!("{int_part}{frac_part}").parse().ok()?;
    let mut digits: u32 = frac_part.len() as u32 + 2;

    if mantissa == 0 {
        return Some(("0x0".to_string(), "0x0".to_string()));
    }
    while mantissa % 10 == 0 && digits > 0 {
        mantissa /= 10;
        digits -= 1;
    }
    Some((format!("0x{mantissa:X}"), format!("0x{digits:X}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_encoding_matches_device_format() {
        assert_eq!(
            format_price("1.1"),
            Some(("0xB".to_string(), "0x3".to_string()))
        );
        assert_eq!(
            format_price("31.50"),
            Some(("0x13B".to_string(), "0x3".to_string()))
        );
        assert_eq!(
            format_price("111.111"),
            Some(("0x1B207".to_string(), "0x5".to_string()))
        );
    }

    #[test]
    fn whole_cents_normalize_trailing_zeros() {
        // 10 cents is 0.1 dollars: mantissa 1, one trailing digit.
        assert_eq!(
            format_price("10"),
            Some(("0x1".to_string(), "0x1".to_string()))
        );
        assert_eq!(
            format_price("5"),
            Some(("0x5".to_string(), "0x2".to_string()))
        );
    }

    #[test]
    fn zero_and_garbage_prices() {
        assert_eq!(
            format_price("0.0"),
            Some(("0x0".to_string(), "0x0".to_string()))
        );
        assert_eq!(format_price("free"), None);
        assert_eq!(format_price("1.2.3"), None);
        assert_eq!(format_price(""), None);
        assert_eq!(format_price("-3"), None);
    }

    #[test]
    fn bare_commands_have_no_params() {
        assert_eq!(
            DeviceCommand::Restart.to_xml(),
            "<Command><Name>restart</Name></Command>"
        );
        assert_eq!(
            DeviceCommand::GetDeviceInfo.to_xml(),
            "<Command><Name>get_device_info</Name></Command>"
        );
    }

    #[test]
    fn refreshable_reads_carry_meter_mac_and_refresh() {
        let xml = DeviceCommand::GetConnectionStatus {
            meter_mac_id: "0x00078100007a175d".to_string(),
        }
        .to_xml();
        assert_eq!(
            xml,
            "<Command><Name>get_connection_status</Name>\
             <MeterMacId>0x00078100007a175d</MeterMacId>\
             <Refresh>Y</Refresh></Command>"
        );
    }

    #[test]
    fn set_price_serializes_encoded_pair() {
        let (price, digits) = format_price("31.50").unwrap();
        let xml = DeviceCommand::SetCurrentPrice {
            meter_mac_id: "0x00078100007a175d".to_string(),
            price,
            trailing_digits: digits,
        }
        .to_xml();
        assert!(xml.contains("<Name>set_current_price</Name>"));
        assert!(xml.contains("<Price>0x13B</Price>"));
        assert!(xml.contains("<TrailingDigits>0x3</TrailingDigits>"));
    }

    #[test]
    fn raw_passthrough_is_untouched() {
        let raw = DeviceCommand::Raw("<Command><Name>factory_reset</Name></Command>".to_string());
        assert_eq!(raw.to_xml(), "<Command><Name>factory_reset</Name></Command>");
    }
}
