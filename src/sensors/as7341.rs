// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! ams AS7341 11-channel spectral sensor.
//!
//! The part exposes six ADCs behind an analog photodiode multiplexer
//! (SMUX), so a full spectral sample takes two measurement phases: the
//! first routes F1..F4 plus Clear and NIR, the second F5..F8.  Each phase
//! loads a 20-byte routing configuration into SMUX RAM, pulses the load
//! bit until it self-clears, runs a measurement, and reads six
//! little-endian sample words.  The register file is bank-switched via
//! CFG0; everything this driver touches lives in bank 0 and the driver
//! always leaves bank 0 selected.

use crate::bus::BusManager;
use crate::error::{Error, Result};
use crate::sensor::{
    retry_backoff, DeviceTxn, MuxRoute, SensorDriver, SensorLink, MAX_READ_ATTEMPTS,
};
use crate::sensors::{now_ms, DriverKind, Readings, SensorData, SensorState};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REG_SMUX_BASE: u8 = 0x00; // 20 bytes of SMUX RAM at 0x00..0x13
const REG_ENABLE: u8 = 0x80;
const REG_ATIME: u8 = 0x81;
const REG_ID: u8 = 0x92;
const REG_DATA_BASE: u8 = 0x95; // DATA0_L
const REG_STATUS2: u8 = 0xa3;
const REG_CFG0: u8 = 0xa9;
const REG_CFG1: u8 = 0xaa;
const REG_CFG6: u8 = 0xaf;
const REG_ASTEP_L: u8 = 0xca;
const REG_CONTROL: u8 = 0xef;

const ENABLE_PON_BIT: u8 = 0;
const ENABLE_SP_EN_BIT: u8 = 1;
const ENABLE_SMUXEN_BIT: u8 = 4;
const STATUS2_AVALID_BIT: u8 = 6;
const CFG0_BANK_BIT: u8 = 4;
const CONTROL_SW_RESET_BIT: u8 = 3;

/// CFG6 command: copy SMUX RAM into the multiplexer.
const SMUX_CMD_WRITE_RAM: u8 = 0x10;

/// Photodiode routing for phase 1: F1..F4 + Clear + NIR.
const SMUX_PHASE1: [u8; 20] = [
    0x30, 0x01, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x50, 0x00, 0x00, 0x00, 0x20, 0x04, 0x00,
    0x30, 0x01, 0x50, 0x00, 0x06,
];

/// Photodiode routing for phase 2: F5..F8 (+ Clear + NIR again, which
/// the driver discards).
const SMUX_PHASE2: [u8; 20] = [
    0x00, 0x00, 0x00, 0x40, 0x02, 0x00, 0x10, 0x03, 0x50, 0x10, 0x03, 0x00, 0x00, 0x00, 0x24,
    0x00, 0x00, 0x50, 0x00, 0x06,
];

const PHASE1_LABELS: [&str; 6] = ["F1", "F2", "F3", "F4", "Clear", "NIR"];
const PHASE2_LABELS: [&str; 4] = ["F5", "F6", "F7", "F8"];

const GAIN_MAX: u8 = 12;
const DEFAULT_GAIN: u8 = 10;
const DEFAULT_ATIME: u8 = 0;
const DEFAULT_ASTEP: u16 = 65534;
const ASTEP_MAX: u16 = 65534;

const SMUX_LOAD_TIMEOUT: Duration = Duration::from_millis(100);
const SMUX_LOAD_POLL: Duration = Duration::from_millis(5);
const DATA_READY_TIMEOUT: Duration = Duration::from_secs(2);
const DATA_READY_POLL: Duration = Duration::from_millis(10);

const POWER_OFF_SETTLE: Duration = Duration::from_millis(5);
// Datasheet asks for 200 us after PON.
const POWER_ON_SETTLE: Duration = Duration::from_millis(1);
const SW_RESET_SETTLE: Duration = Duration::from_millis(5);
const RECOVERY_POWER_OFF: Duration = Duration::from_millis(10);
const RECOVERY_POWER_ON: Duration = Duration::from_millis(5);

const MIN_READ_INTERVAL: Duration = Duration::from_secs(2);

/// Select a register bank, reading CFG0 before writing.  `None` in the
/// cache forces the read-modify-write; a software or power reset must
/// clear the cache.
fn set_bank_in(t: &mut DeviceTxn<'_>, current: &mut Option<u8>, bank: u8) -> Result<()> {
    if *current == Some(bank) {
        return Ok(());
    }
    t.enable_bit(REG_CFG0, CFG0_BANK_BIT, bank == 1)?;
    *current = Some(bank);
    Ok(())
}

fn write_integration_time_in(t: &mut DeviceTxn<'_>, atime: u8, astep: u16) -> Result<()> {
    t.write_reg(REG_ATIME, atime)?;
    t.write_word_regs(REG_ASTEP_L, astep)
}

/// Poll STATUS2 until AVALID asserts.  Returns false exactly when the
/// bit stays clear for the whole budget.
fn wait_for_data_ready(t: &mut DeviceTxn<'_>, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = t.read_reg(REG_STATUS2)?;
        if status & (1 << STATUS2_AVALID_BIT) != 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(DATA_READY_POLL);
    }
}

fn wait_smux_load(t: &mut DeviceTxn<'_>) -> Result<()> {
    let deadline = Instant::now() + SMUX_LOAD_TIMEOUT;
    loop {
        let enable = t.read_reg(REG_ENABLE)?;
        if enable & (1 << ENABLE_SMUXEN_BIT) == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("SMUX load"));
        }
        thread::sleep(SMUX_LOAD_POLL);
    }
}

/// Read the six sample words of the current phase.  Falls back to
/// byte-paired reads when the adapter returns a short block.
fn read_phase_samples(t: &mut DeviceTxn<'_>, sensor_id: &str) -> Result<[u16; 6]> {
    let mut buf = [0u8; 12];
    let n = t.read_block(REG_DATA_BASE, &mut buf)?;
    if n < buf.len() {
        warn!(
            "{}: block read returned {} of {} bytes, using byte reads",
            sensor_id,
            n,
            buf.len()
        );
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = t.read_reg(REG_DATA_BASE + i as u8)?;
        }
    }
    let mut samples = [0u16; 6];
    for (i, sample) in samples.iter_mut().enumerate() {
        *sample = LittleEndian::read_u16(&buf[i * 2..i * 2 + 2]);
    }
    Ok(samples)
}

/// One SMUX phase: load the routing, measure, read, stop measuring.
fn read_phase(t: &mut DeviceTxn<'_>, smux: &[u8; 20], sensor_id: &str) -> Result<[u16; 6]> {
    for (i, &byte) in smux.iter().enumerate() {
        t.write_reg(REG_SMUX_BASE + i as u8, byte)?;
    }
    t.write_reg(REG_CFG6, SMUX_CMD_WRITE_RAM)?;
    t.enable_bit(REG_ENABLE, ENABLE_SMUXEN_BIT, true)?;
    wait_smux_load(t)?;

    t.enable_bit(REG_ENABLE, ENABLE_SP_EN_BIT, true)?;
    let ready = wait_for_data_ready(t, DATA_READY_TIMEOUT)?;
    if !ready {
        let _ = t.enable_bit(REG_ENABLE, ENABLE_SP_EN_BIT, false);
        return Err(Error::Timeout("AVALID"));
    }
    let samples = read_phase_samples(t, sensor_id)?;
    t.enable_bit(REG_ENABLE, ENABLE_SP_EN_BIT, false)?;
    Ok(samples)
}

pub struct As7341 {
    link: SensorLink,
    current_bank: Option<u8>,
    atime: u8,
    astep: u16,
    gain: u8,
    last: Option<(BTreeMap<String, u16>, u64)>,
    last_error: Option<String>,
}

impl As7341 {
    pub fn new(
        manager: Arc<BusManager>,
        path: &str,
        address: u8,
        route: Option<MuxRoute>,
    ) -> As7341 {
        As7341 {
            link: SensorLink::new(manager, path, address, route),
            current_bank: None,
            atime: DEFAULT_ATIME,
            astep: DEFAULT_ASTEP,
            gain: DEFAULT_GAIN,
            last: None,
            last_error: None,
        }
    }

    /// Total integration time in microseconds for the current settings.
    pub fn integration_time_us(&self) -> f64 {
        (f64::from(self.atime) + 1.0) * (f64::from(self.astep) + 1.0) * 2.78
    }

    /// Configure ATIME/ASTEP.  Rejecting both-zero keeps the device from
    /// producing an all-zero integration window.
    pub fn set_integration_time(&mut self, atime: u8, astep: u16) -> Result<()> {
        validate_integration_time(atime, astep)?;
        self.link
            .transaction(|t| write_integration_time_in(t, atime, astep))?;
        self.atime = atime;
        self.astep = astep;
        Ok(())
    }

    /// Read ATIME/ASTEP back from the device.
    pub fn integration_time(&mut self) -> Result<(u8, u16)> {
        self.link.transaction(|t| {
            let atime = t.read_reg(REG_ATIME)?;
            let lo = t.read_reg(REG_ASTEP_L)?;
            let hi = t.read_reg(REG_ASTEP_L + 1)?;
            Ok((atime, u16::from(lo) | (u16::from(hi) << 8)))
        })
    }

    /// Set the 5-bit again field, clamped to the part's range.
    pub fn set_gain(&mut self, gain: u8) -> Result<()> {
        let gain = gain.min(GAIN_MAX);
        self.link
            .transaction(|t| t.set_register_bits(REG_CFG1, 0, 5, gain))?;
        self.gain = gain;
        Ok(())
    }

    pub fn gain(&mut self) -> Result<u8> {
        self.link.transaction(|t| Ok(t.read_reg(REG_CFG1)? & 0x1f))
    }

    fn initialize_device(&mut self) -> Result<()> {
        let Self {
            link,
            current_bank,
            atime,
            astep,
            gain,
            ..
        } = self;
        link.transaction(|t| {
            set_bank_in(t, current_bank, 0)?;
            t.enable_bit(REG_ENABLE, ENABLE_PON_BIT, false)?;
            thread::sleep(POWER_OFF_SETTLE);
            t.enable_bit(REG_ENABLE, ENABLE_PON_BIT, true)?;
            thread::sleep(POWER_ON_SETTLE);
            // A successful ID read is the liveness criterion; the value
            // differs between silicon revisions and is not checked.
            t.read_reg(REG_ID)?;
            write_integration_time_in(t, *atime, *astep)?;
            t.set_register_bits(REG_CFG1, 0, 5, *gain)?;
            t.read_reg(REG_ID).map(drop)
        })
    }

    fn read_spectral(&mut self) -> Result<BTreeMap<String, u16>> {
        let sensor_id = self.link.sensor_id();
        let Self {
            link, current_bank, ..
        } = self;
        link.transaction(|t| {
            set_bank_in(t, current_bank, 0)?;
            let mut out = BTreeMap::new();
            let phase1 = read_phase(t, &SMUX_PHASE1, &sensor_id)?;
            for (label, value) in PHASE1_LABELS.iter().zip(phase1) {
                out.insert(label.to_string(), value);
            }
            let phase2 = read_phase(t, &SMUX_PHASE2, &sensor_id)?;
            // Clear and NIR repeat in phase 2; zip with four labels
            // drops them.
            for (label, value) in PHASE2_LABELS.iter().zip(phase2) {
                out.insert(label.to_string(), value);
            }
            Ok(out)
        })
    }

    fn read_with_retry(&mut self) -> Result<BTreeMap<String, u16>> {
        let mut last_err = None;
        for attempt in 1..=MAX_READ_ATTEMPTS {
            match self.read_spectral() {
                Ok(samples) => return Ok(samples),
                Err(e) => {
                    if e.is_transport() && !self.link.in_recovery() {
                        warn!(
                            "{}: transport failure on attempt {}: {}",
                            self.link.sensor_id(),
                            attempt,
                            e
                        );
                        if let Err(re) = self.recover() {
                            warn!("{}: recovery failed: {}", self.link.sensor_id(), re);
                        }
                    } else {
                        warn!(
                            "{}: read attempt {} failed: {}",
                            self.link.sensor_id(),
                            attempt,
                            e
                        );
                    }
                    last_err = Some(e);
                }
            }
            if attempt < MAX_READ_ATTEMPTS {
                thread::sleep(retry_backoff(attempt));
            }
        }
        Err(last_err.unwrap_or(Error::Timeout("spectral read")))
    }

    /// Progressive recovery: software reset, then power cycle.  Each rung
    /// ends with an ID-register liveness probe and, on success, a full
    /// re-initialization.  The recovery flag suppresses reentry from the
    /// reads the rungs themselves perform.
    fn recover(&mut self) -> Result<()> {
        self.link.set_recovering(true);
        let result = self.recovery_ladder();
        self.link.set_recovering(false);
        result
    }

    fn recovery_ladder(&mut self) -> Result<()> {
        match self.rung_soft_reset() {
            Ok(()) => {
                debug!("{}: recovered via software reset", self.link.sensor_id());
                return Ok(());
            }
            Err(e) => debug!("{}: software reset rung failed: {}", self.link.sensor_id(), e),
        }
        self.rung_power_cycle()?;
        debug!("{}: recovered via power cycle", self.link.sensor_id());
        Ok(())
    }

    fn rung_soft_reset(&mut self) -> Result<()> {
        self.current_bank = None;
        self.link.transaction(|t| {
            // Direct write: the reset bit self-clears within 5 ms and the
            // register may not be readable while the part is wedged.
            t.write_reg(REG_CONTROL, 1 << CONTROL_SW_RESET_BIT)?;
            thread::sleep(SW_RESET_SETTLE);
            t.read_reg(REG_ID).map(drop)
        })?;
        self.initialize_device()
    }

    fn rung_power_cycle(&mut self) -> Result<()> {
        self.current_bank = None;
        self.link.transaction(|t| {
            t.write_reg(REG_ENABLE, 0x00)?;
            thread::sleep(RECOVERY_POWER_OFF);
            t.write_reg(REG_ENABLE, 1 << ENABLE_PON_BIT)?;
            thread::sleep(RECOVERY_POWER_ON);
            t.read_reg(REG_ID).map(drop)
        })?;
        self.initialize_device()
    }
}

fn validate_integration_time(atime: u8, astep: u16) -> Result<()> {
    if atime == 0 && astep == 0 {
        return Err(Error::Argument(
            "ATIME and ASTEP must not both be zero".to_string(),
        ));
    }
    if astep > ASTEP_MAX {
        return Err(Error::Argument(format!(
            "ASTEP {} exceeds maximum {}",
            astep, ASTEP_MAX
        )));
    }
    Ok(())
}

impl SensorDriver for As7341 {
    fn link(&self) -> &SensorLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut SensorLink {
        &mut self.link
    }

    fn kind(&self) -> DriverKind {
        DriverKind::As7341
    }

    fn initialize(&mut self) -> Result<()> {
        self.initialize_device()
    }

    fn power_down(&mut self) -> Result<()> {
        self.link.enable_bit(REG_ENABLE, ENABLE_SP_EN_BIT, false)?;
        self.link.enable_bit(REG_ENABLE, ENABLE_PON_BIT, false)
    }

    fn read_data(&mut self) -> Readings {
        let mut readings = Readings::new();
        match self.read_with_retry() {
            Ok(samples) => {
                for (label, value) in &samples {
                    readings.insert(label.clone(), f64::from(*value));
                }
                self.last = Some((samples, now_ms()));
                self.last_error = None;
            }
            Err(e) => {
                error!("{}: spectral read failed: {}", self.link.sensor_id(), e);
                self.last_error = Some(e.to_string());
            }
        }
        readings
    }

    fn sensor_state(&self) -> SensorState {
        let (channels, updated_ms) = match &self.last {
            Some((samples, updated_ms)) => (samples.clone(), *updated_ms),
            None => (BTreeMap::new(), 0),
        };
        SensorState {
            sensor_id: self.link.sensor_id(),
            connected: self.link.is_connected(),
            updated_ms,
            error_message: self.last_error.clone(),
            data: SensorData::Color(channels),
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
    use crate::sensors::ERROR_KEY;

    const PATH: &str = "/dev/i2c-9";
    const ADDR: u8 = 0x39;

    fn make_sensor(mock: &Arc<MockTransport>) -> As7341 {
        let manager = Arc::new(BusManager::with_transport(mock.clone()));
        As7341::new(manager, PATH, ADDR, None)
    }

    fn scenario_mock() -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_as7341(PATH, ADDR);
        mock.set_as7341_phases(
            PATH,
            ADDR,
            [0x0100, 0x0302, 0x0504, 0x0706, 0x0908, 0x0b0a],
            [0x1110, 0x1312, 0x1514, 0x1716, 0x1918, 0x1b1a],
        );
        mock
    }

    #[test]
    fn two_phase_read_maps_channels() {
        let mock = scenario_mock();
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        let readings = sensor.read_data();
        assert_eq!(readings.len(), 10);
        assert_eq!(readings["F1"], f64::from(0x0100u16));
        assert_eq!(readings["F2"], f64::from(0x0302u16));
        assert_eq!(readings["F3"], f64::from(0x0504u16));
        assert_eq!(readings["F4"], f64::from(0x0706u16));
        assert_eq!(readings["Clear"], f64::from(0x0908u16));
        assert_eq!(readings["NIR"], f64::from(0x0b0au16));
        assert_eq!(readings["F5"], f64::from(0x1110u16));
        assert_eq!(readings["F6"], f64::from(0x1312u16));
        assert_eq!(readings["F7"], f64::from(0x1514u16));
        assert_eq!(readings["F8"], f64::from(0x1716u16));
        // The repeated Clear/NIR from phase 2 are discarded.
        assert!(!readings.contains_key("Clear2"));
        assert!(!readings.contains_key(ERROR_KEY));
    }

    #[test]
    fn short_block_reads_fall_back_to_byte_reads() {
        let mock = scenario_mock();
        mock.set_as7341_block_shortfall(PATH, ADDR, 7);
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        let readings = sensor.read_data();
        assert_eq!(readings["F1"], f64::from(0x0100u16));
        assert_eq!(readings["F8"], f64::from(0x1716u16));
    }

    #[test]
    fn integration_time_round_trips() {
        let mock = scenario_mock();
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        sensor.set_integration_time(5, 1234).unwrap();
        assert_eq!(sensor.integration_time().unwrap(), (5, 1234));
        sensor.set_integration_time(0, 65534).unwrap();
        assert_eq!(sensor.integration_time().unwrap(), (0, 65534));
    }

    #[test]
    fn zero_integration_window_is_rejected() {
        let mock = scenario_mock();
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());
        assert!(matches!(
            sensor.set_integration_time(0, 0),
            Err(Error::Argument(_))
        ));
        // The previous configuration stays in effect.
        assert_eq!(sensor.integration_time().unwrap(), (0, 65534));
    }

    #[test]
    fn gain_is_clamped_to_device_range() {
        let mock = scenario_mock();
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        sensor.set_gain(20).unwrap();
        assert_eq!(sensor.gain().unwrap(), GAIN_MAX);
        sensor.set_gain(3).unwrap();
        assert_eq!(sensor.gain().unwrap(), 3);
    }

    #[test]
    fn data_ready_wait_reports_timeout_without_retry() {
        let mock = scenario_mock();
        mock.set_avalid_stuck(PATH, ADDR, true);
        let mut sensor = make_sensor(&mock);
        assert!(sensor.connect());

        let ready = sensor
            .link
            .transaction(|t| {
                t.enable_bit(REG_ENABLE, ENABLE_SP_EN_BIT, true)?;
                wait_for_data_ready(t, Duration::from_millis(50))
            })
            .unwrap();
        assert!(!ready);
    }
}
