// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

use crate::bus::BusManager;
use crate::sensor::{MuxRoute, SensorDriver};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod as7341;
pub mod as7343;
pub mod sht40;

/// The concrete driver families the loop can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    As7341,
    As7343,
    Sht40,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::As7341 => "AS7341",
            DriverKind::As7343 => "AS7343",
            DriverKind::Sht40 => "SHT40",
        };
        f.write_str(name)
    }
}

/// One read's worth of values, keyed by channel or quantity name.
///
/// A failed read is either an empty map or a map carrying [`ERROR_KEY`];
/// the bus loop treats both as a dirty sensor.
pub type Readings = BTreeMap<String, f64>;

/// Marker key a driver puts into its reading map when a read failed but
/// sentinel values are still reported (SHT40 CRC mismatches).
pub const ERROR_KEY: &str = "ERROR";

/// Value reported for quantities invalidated by an integrity failure.
pub const SENTINEL: f64 = -9999.0;

/// Immutable per-sensor snapshot published after each successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    pub sensor_id: String,
    pub connected: bool,
    pub updated_ms: u64,
    pub error_message: Option<String>,
    pub data: SensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorData {
    /// Spectral channel label → sample count.
    Color(BTreeMap<String, u16>),
    /// Temperature in degrees Celsius, relative humidity in percent.
    Climate { temperature_c: f64, humidity_rh: f64 },
    /// Channel switch summary: mask and discovered devices.
    Mux { summary: String },
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Snapshot-map key: `bus-path:channel:address`, with `*` standing in for
/// "directly on the main bus".
pub fn sensor_id(path: &str, channel: Option<u8>, address: u8) -> String {
    match channel {
        Some(channel) => format!("{}:{}:{:#04x}", path, channel, address),
        None => format!("{}:*:{:#04x}", path, address),
    }
}

/// Parse a snapshot-map key back into its (path, channel, address)
/// parts.  Returns `None` for strings not produced by [`sensor_id`].
pub fn parse_sensor_id(id: &str) -> Option<(String, Option<u8>, u8)> {
    let (rest, address_part) = id.rsplit_once(':')?;
    let (path, channel_part) = rest.rsplit_once(':')?;
    let address = u8::from_str_radix(address_part.strip_prefix("0x")?, 16).ok()?;
    let channel = match channel_part {
        "*" => None,
        s => Some(s.parse().ok()?),
    };
    Some((path.to_string(), channel, address))
}

/// Driver factory table, keyed by address.
pub fn driver_kind_for_address(address: u8) -> Option<DriverKind> {
    match address {
        0x39 => Some(DriverKind::As7343),
        0x44 => Some(DriverKind::Sht40),
        0x49 => Some(DriverKind::As7341),
        _ => None,
    }
}

/// Instantiate a driver of `kind` for a device at `address`, optionally
/// routed through a multiplexer channel.
pub fn build_driver(
    kind: DriverKind,
    manager: Arc<BusManager>,
    path: &str,
    address: u8,
    route: Option<MuxRoute>,
) -> Box<dyn SensorDriver> {
    match kind {
        DriverKind::As7341 => Box::new(as7341::As7341::new(manager, path, address, route)),
        DriverKind::As7343 => Box::new(as7343::As7343::new(manager, path, address, route)),
        DriverKind::Sht40 => Box::new(sht40::Sht40::new(manager, path, address, route)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_id_formats() {
        assert_eq!(sensor_id("/dev/i2c-0", None, 0x44), "/dev/i2c-0:*:0x44");
        assert_eq!(sensor_id("/dev/i2c-0", Some(2), 0x39), "/dev/i2c-0:2:0x39");
    }

    #[test]
    fn sensor_id_parses_back() {
        assert_eq!(
            parse_sensor_id("/dev/i2c-0:*:0x44"),
            Some(("/dev/i2c-0".to_string(), None, 0x44))
        );
        assert_eq!(
            parse_sensor_id("/dev/i2c-1:2:0x39"),
            Some(("/dev/i2c-1".to_string(), Some(2), 0x39))
        );
        assert_eq!(parse_sensor_id("nonsense"), None);
        assert_eq!(parse_sensor_id("/dev/i2c-0:*:44"), None);
    }

    #[test]
    fn factory_table() {
        assert_eq!(driver_kind_for_address(0x39), Some(DriverKind::As7343));
        assert_eq!(driver_kind_for_address(0x44), Some(DriverKind::Sht40));
        assert_eq!(driver_kind_for_address(0x49), Some(DriverKind::As7341));
        assert_eq!(driver_kind_for_address(0x70), None);
    }
}
