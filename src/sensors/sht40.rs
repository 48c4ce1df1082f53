// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! Sensirion SHT40 temperature/humidity sensor.
//!
//! The part has no register model; every operation is a raw command byte
//! followed, for measurements, by a fixed wait and a six-byte result:
//! `[t_hi, t_lo, t_crc, h_hi, h_lo, h_crc]`.  The sensor requires a STOP
//! between the command and the read, which is why the driver issues a
//! plain write then a plain read rather than a combined transfer.

use crate::bus::BusManager;
use crate::error::{Error, Result};
use crate::sensor::{MuxRoute, SensorDriver, SensorLink};
use crate::sensors::{now_ms, DriverKind, Readings, SensorData, SensorState, ERROR_KEY, SENTINEL};
use byteorder::{BigEndian, ByteOrder};
use log::warn;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const SHT40_I2C_ADDR: u8 = 0x44;

const CMD_SOFT_RESET: u8 = 0x94;
const CMD_MEASURE_HIGH_PRECISION: u8 = 0xFD;

const RESET_SETTLE: Duration = Duration::from_millis(100);
/// Datasheet worst case is 8.2 ms for a high-precision measurement.
const MEASUREMENT_WAIT: Duration = Duration::from_millis(15);
const MIN_READ_INTERVAL: Duration = Duration::from_secs(10);

/// CRC-8 as specified by Sensirion: polynomial 0x31, init 0xFF, MSB
/// first, no reflection, no final XOR.
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Validate one `[hi, lo, crc]` sub-block and return the raw word.
fn checked_word(block: &[u8]) -> Result<u16> {
    let computed = crc8(&block[..2]);
    if computed != block[2] {
        return Err(Error::CrcMismatch {
            computed,
            received: block[2],
        });
    }
    Ok(BigEndian::read_u16(&block[..2]))
}

fn scale_temperature(raw: u16) -> f64 {
    -45.0 + 175.0 * f64::from(raw) / 65535.0
}

fn scale_humidity(raw: u16) -> f64 {
    -6.0 + 125.0 * f64::from(raw) / 65535.0
}

struct LastReading {
    temperature_c: f64,
    humidity_rh: f64,
    updated_ms: u64,
}

pub struct Sht40 {
    link: SensorLink,
    last: Option<LastReading>,
    last_error: Option<String>,
}

impl Sht40 {
    pub fn new(
        manager: Arc<BusManager>,
        path: &str,
        address: u8,
        route: Option<MuxRoute>,
    ) -> Sht40 {
        Sht40 {
            link: SensorLink::new(manager, path, address, route),
            last: None,
            last_error: None,
        }
    }

    fn read_once(&mut self) -> Result<(f64, f64)> {
        self.link.transaction(|t| {
            t.raw_write_byte(CMD_MEASURE_HIGH_PRECISION)?;
            thread::sleep(MEASUREMENT_WAIT);
            let mut buf = [0u8; 6];
            let n = t.raw_read(&mut buf)?;
            if n < buf.len() {
                return Err(Error::Timeout("sht40 measurement"));
            }
            let raw_t = checked_word(&buf[0..3])?;
            let raw_h = checked_word(&buf[3..6])?;
            Ok((scale_temperature(raw_t), scale_humidity(raw_h)))
        })
    }
}

impl SensorDriver for Sht40 {
    fn link(&self) -> &SensorLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut SensorLink {
        &mut self.link
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Sht40
    }

    fn initialize(&mut self) -> Result<()> {
        self.link.transaction(|t| t.raw_write_byte(CMD_SOFT_RESET))?;
        thread::sleep(RESET_SETTLE);
        Ok(())
    }

    fn read_data(&mut self) -> Readings {
        let mut readings = Readings::new();
        match self.read_once() {
            Ok((temperature_c, humidity_rh)) => {
                self.last = Some(LastReading {
                    temperature_c,
                    humidity_rh,
                    updated_ms: now_ms(),
                });
                self.last_error = None;
                readings.insert("temperature".to_string(), temperature_c);
                readings.insert("humidity".to_string(), humidity_rh);
            }
            Err(e) => {
                warn!("{}: read failed: {}", self.link.sensor_id(), e);
                self.last_error = Some(e.to_string());
                // A failed integrity check invalidates both quantities.
                readings.insert("temperature".to_string(), SENTINEL);
                readings.insert("humidity".to_string(), SENTINEL);
                readings.insert(ERROR_KEY.to_string(), 1.0);
            }
        }
        readings
    }

    fn sensor_state(&self) -> SensorState {
        let (temperature_c, humidity_rh, updated_ms) = match &self.last {
            Some(last) => (last.temperature_c, last.humidity_rh, last.updated_ms),
            None => (SENTINEL, SENTINEL, 0),
        };
        SensorState {
            sensor_id: self.link.sensor_id(),
            connected: self.link.is_connected(),
            updated_ms,
            error_message: self.last_error.clone(),
            data: SensorData::Climate {
                temperature_c,
                humidity_rh,
            },
        }
    }

    fn min_read_interval(&self) -> Option<Duration> {
        Some(MIN_READ_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    const PATH: &str = "/dev/i2c-9";

    macro_rules! assert_almost_eq {
        ($left:expr, $right:expr) => {{
            match (&($left), &($right)) {
                (left_val, right_val) => {
                    if (*left_val - *right_val).abs() > 0.01 {
                        panic!("assertion failed: ({:?} != {:?})", *left_val, *right_val);
                    }
                }
            }
        }};
    }

    fn make_sensor(mock: &Arc<MockTransport>) -> Sht40 {
        let manager = Arc::new(BusManager::with_transport(mock.clone()));
        Sht40::new(manager, PATH, SHT40_I2C_ADDR, None)
    }

    #[test]
    fn crc8_matches_sensirion_reference() {
        // Worked example from the SHT4x datasheet.
        assert_eq!(crc8(&[0xbe, 0xef]), 0x92);
        assert_eq!(crc8(&[0x80, 0x00]), crc8(&[0x80, 0x00]));
    }

    #[test]
    fn crc_detects_single_bit_flips() {
        let good = crc8(&[0x66, 0x4b]);
        for bit in 0..16 {
            let mut bytes = [0x66u8, 0x4b];
            bytes[bit / 8] ^= 1 << (bit % 8);
            assert_ne!(crc8(&bytes), good, "flip of bit {} went undetected", bit);
        }
    }

    #[test]
    fn midscale_reading() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, SHT40_I2C_ADDR, 32768, 32768);
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        let readings = sensor.read_data();
        assert_almost_eq!(readings["temperature"], 42.5);
        assert_almost_eq!(readings["humidity"], 56.5);
        assert!(!readings.contains_key(ERROR_KEY));

        match sensor.sensor_state().data {
            SensorData::Climate {
                temperature_c,
                humidity_rh,
            } => {
                assert_almost_eq!(temperature_c, 42.5);
                assert_almost_eq!(humidity_rh, 56.5);
            }
            other => panic!("unexpected state payload: {:?}", other),
        }
    }

    #[test]
    fn corrupt_crc_yields_sentinels() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, SHT40_I2C_ADDR, 1000, 2000);
        mock.set_sht40_corrupt(PATH, SHT40_I2C_ADDR, true);
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        let readings = sensor.read_data();
        assert_eq!(readings["temperature"], SENTINEL);
        assert_eq!(readings["humidity"], SENTINEL);
        assert!(readings.contains_key(ERROR_KEY));
        assert!(sensor.sensor_state().error_message.is_some());
    }

    #[test]
    fn duplicate_address_claim_is_rejected() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, SHT40_I2C_ADDR, 32768, 32768);
        let manager = Arc::new(BusManager::with_transport(mock));

        let mut first = Sht40::new(manager.clone(), PATH, SHT40_I2C_ADDR, None);
        let mut second = Sht40::new(manager.clone(), PATH, SHT40_I2C_ADDR, None);
        assert!(first.connect());
        assert!(!second.connect());
        assert!(manager.is_address_in_use(PATH, SHT40_I2C_ADDR));
        first.disconnect();
        assert!(!manager.is_address_in_use(PATH, SHT40_I2C_ADDR));
    }

    #[test]
    fn forced_close_demotes_readiness() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_sht40(PATH, SHT40_I2C_ADDR, 32768, 32768);
        let manager = Arc::new(BusManager::with_transport(mock));
        let mut sensor = Sht40::new(manager.clone(), PATH, SHT40_I2C_ADDR, None);
        assert!(sensor.connect());
        assert!(sensor.is_ready());

        manager.force_close(PATH);
        assert!(!sensor.is_ready());
        // Reconnect succeeds on a fresh handle.
        assert!(sensor.connect());
    }
}
