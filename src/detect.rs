// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! Bus scanning.
//!
//! Probes the 7-bit address space for devices that ACK, attaches a device
//! type tag for the addresses this crate knows, and renders the familiar
//! 16-column table the i2cdetect utility prints.

use crate::bus::{BusManager, BusShared};
use crate::error::{Error, Result};
use crate::transport::{ADDRESS_MAX, ADDRESS_MIN};
use log::debug;
use std::time::Instant;

/// Range of addresses the TCA9548 family responds on.
pub const MUX_ADDRESS_MIN: u8 = 0x70;
pub const MUX_ADDRESS_MAX: u8 = 0x77;

/// How to walk the address space.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub start_address: u8,
    pub end_address: u8,
    pub skip_addresses: Vec<u8>,
    /// Adapter transaction timeout applied per probe.
    pub timeout_ms: u64,
    /// Report devices in the multiplexer address range too.  Off by
    /// default so channel scans do not re-discover the switch itself.
    pub include_multiplexer: bool,
}

impl Default for ScanConfig {
    fn default() -> ScanConfig {
        ScanConfig {
            start_address: ADDRESS_MIN,
            end_address: ADDRESS_MAX,
            skip_addresses: Vec::new(),
            timeout_ms: 100,
            include_multiplexer: false,
        }
    }
}

impl ScanConfig {
    fn validate(&self) -> Result<()> {
        if self.start_address < ADDRESS_MIN
            || self.end_address > ADDRESS_MAX
            || self.start_address > self.end_address
        {
            return Err(Error::Argument(format!(
                "scan window [{:#04x}, {:#04x}] outside [{:#04x}, {:#04x}]",
                self.start_address, self.end_address, ADDRESS_MIN, ADDRESS_MAX
            )));
        }
        Ok(())
    }
}

/// Device types recognized by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    As7341,
    As7343,
    Sht40,
    Tca9548,
    Bmp280,
}

/// A device seen on a bus.  `channel` is `None` for the main bus and the
/// switch channel index for devices sitting behind a multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: u8,
    pub channel: Option<u8>,
    pub device_type: Option<DeviceType>,
}

/// The static address → type table.  0x76/0x77 double as BMP280 addresses;
/// behind a switch channel nothing mux-like can answer, so the tag flips.
pub fn device_type_for(address: u8, on_channel: bool) -> Option<DeviceType> {
    match address {
        0x39 => Some(DeviceType::As7343),
        0x44 => Some(DeviceType::Sht40),
        0x49 => Some(DeviceType::As7341),
        0x76 | 0x77 if on_channel => Some(DeviceType::Bmp280),
        MUX_ADDRESS_MIN..=MUX_ADDRESS_MAX => Some(DeviceType::Tca9548),
        _ => None,
    }
}

/// Probe the bus for devices per `config`.  Channel is left `None`; the
/// multiplexer driver re-tags results from channel scans.
pub fn scan_on(bus: &BusShared, config: &ScanConfig) -> Result<Vec<DeviceInfo>> {
    config.validate()?;
    let mut txn = bus.txn();
    if let Err(e) = txn.set_timeout_ms(config.timeout_ms) {
        debug!("{}: probe timeout not applied: {}", bus.path(), e);
    }

    let mut devices = Vec::new();
    for address in config.start_address..=config.end_address {
        if config.skip_addresses.contains(&address) {
            continue;
        }
        if !config.include_multiplexer
            && (MUX_ADDRESS_MIN..=MUX_ADDRESS_MAX).contains(&address)
        {
            continue;
        }
        if txn.probe(address) {
            devices.push(DeviceInfo {
                address,
                channel: None,
                device_type: device_type_for(address, false),
            });
        }
    }
    debug!("{}: scan found {} device(s)", bus.path(), devices.len());
    Ok(devices)
}

/// Render the i2cdetect-style table: 8 rows of 16 columns, `--` for
/// absent, two-digit hex for present, blank outside the scanned window.
pub fn render_table(present: &[u8], config: &ScanConfig) -> String {
    let mut out = String::from("     0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f\n");
    for row in 0..8u8 {
        out.push_str(&format!("{:02x}:", row * 16));
        for col in 0..16u8 {
            let address = row * 16 + col;
            if address < config.start_address || address > config.end_address {
                out.push_str("   ");
            } else if present.contains(&address) {
                out.push_str(&format!(" {:02x}", address));
            } else {
                out.push_str(" --");
            }
        }
        out.push('\n');
    }
    out
}

/// Result of a one-shot bus survey.
#[derive(Debug, Clone)]
pub struct DetectResult {
    pub devices: Vec<DeviceInfo>,
    pub addresses: Vec<u8>,
    pub table: String,
    pub duration_ms: u64,
}

/// One-call bus survey, the library's equivalent of running i2cdetect.
pub struct I2CDetect;

impl I2CDetect {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn perform(bus_path: &str) -> Result<DetectResult> {
        Self::perform_with(&BusManager::global(), bus_path)
    }

    pub fn perform_with(manager: &BusManager, bus_path: &str) -> Result<DetectResult> {
        let started = Instant::now();
        let config = ScanConfig {
            include_multiplexer: true,
            ..ScanConfig::default()
        };
        let bus = manager.open_path(bus_path)?;
        let scanned = scan_on(&bus, &config);
        manager.release_path(bus_path);
        let devices = scanned?;

        let addresses: Vec<u8> = devices.iter().map(|d| d.address).collect();
        let table = render_table(&addresses, &config);
        Ok(DetectResult {
            devices,
            addresses,
            table,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use std::sync::Arc;

    #[test]
    fn type_table() {
        assert_eq!(device_type_for(0x39, false), Some(DeviceType::As7343));
        assert_eq!(device_type_for(0x44, false), Some(DeviceType::Sht40));
        assert_eq!(device_type_for(0x49, false), Some(DeviceType::As7341));
        assert_eq!(device_type_for(0x70, false), Some(DeviceType::Tca9548));
        assert_eq!(device_type_for(0x77, false), Some(DeviceType::Tca9548));
        assert_eq!(device_type_for(0x77, true), Some(DeviceType::Bmp280));
        assert_eq!(device_type_for(0x23, false), None);
    }

    #[test]
    fn table_rendering() {
        let config = ScanConfig::default();
        let table = render_table(&[0x44, 0x70], &config);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 9);
        assert_eq!(
            lines[0],
            "     0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f"
        );
        // 0x00..0x07 are outside the window and stay blank.
        let expected_row0 = format!("00:{}{}", "   ".repeat(8), " --".repeat(8));
        assert_eq!(lines[1], expected_row0);
        assert!(lines[5].starts_with("40: -- -- -- -- 44"));
        assert!(lines[8].starts_with("70: 70 -- -- -- -- -- -- --"));
    }

    #[test]
    fn perform_reports_devices_and_window() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus("/dev/i2c-9");
        mock.add_sht40("/dev/i2c-9", 0x44, 0x8000, 0x8000);
        mock.add_mux("/dev/i2c-9", 0x70);
        let manager = crate::bus::BusManager::with_transport(mock);

        let result = I2CDetect::perform_with(&manager, "/dev/i2c-9").unwrap();
        assert_eq!(result.addresses, vec![0x44, 0x70]);
        assert_eq!(
            result.devices[0].device_type,
            Some(DeviceType::Sht40)
        );
        assert!(result.table.contains(" 44"));
        // Scan references must not leak a handle.
        assert!(manager.current_handle("/dev/i2c-9").is_none());
    }

    #[test]
    fn scan_window_validation() {
        let config = ScanConfig {
            start_address: 0x50,
            end_address: 0x20,
            ..ScanConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
