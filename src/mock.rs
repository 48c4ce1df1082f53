// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory bus simulator.
//!
//! A [`MockTransport`] stands in for the kernel interface in tests: it
//! models the multiplexer's mask byte, the AS7341/AS7343 register files
//! (SMUX load self-clear, AVALID, data registers), and the SHT40
//! command/response protocol with real CRCs.  Devices placed behind a
//! multiplexer channel only answer while that channel's mask bit is set,
//! and every operation is appended to a log the tests can inspect for
//! ordering and idempotence.

use crate::error::{Error, Result};
use crate::transport::{Handle, Transport};
use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard};

fn eio(op: &'static str) -> Error {
    Error::transport(op, io::Error::from_raw_os_error(libc::EIO))
}

fn enxio(op: &'static str) -> Error {
    Error::transport(op, io::Error::from_raw_os_error(libc::ENXIO))
}

/// One logged transport operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockOp {
    pub handle: Handle,
    /// The sub-device selected when the operation ran (or being selected,
    /// for `Switch`/`Probe`).
    pub address: u8,
    pub kind: OpKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Open,
    Close,
    Switch,
    SetTimeout { ms: u64 },
    WriteByte { reg: u8, value: u8 },
    WriteWord { reg: u8, value: u16 },
    ReadWord { reg: u8 },
    ReadBlock { reg: u8, len: usize },
    RawWrite { value: u8 },
    RawRead { len: usize },
    Probe { found: bool },
}

impl MockOp {
    pub fn is_switch(&self) -> bool {
        matches!(self.kind, OpKind::Switch)
    }

    /// True for a byte write of `value` into `reg`.
    pub fn is_reg_write(&self, reg: u8, value: u8) -> bool {
        self.kind == OpKind::WriteByte { reg, value }
    }
}

// ---------------------------------------------------------------------
// Device models
// ---------------------------------------------------------------------

/// Sensirion CRC-8 (poly 0x31, init 0xFF), computed independently of the
/// driver so the tests compare two implementations.
fn sim_crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

#[derive(Default)]
struct MuxSim {
    mask: u8,
}

struct Sht40Sim {
    raw_t: u16,
    raw_h: u16,
    corrupt: bool,
    last_cmd: Option<u8>,
}

/// The AS7341 two-phase SMUX routing vectors; a data read serves the
/// dataset matching the configuration last loaded into SMUX RAM.
const SIM_SMUX_F1_F4: [u8; 20] = [
    0x30, 0x01, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x50, 0x00, 0x00, 0x00, 0x20, 0x04, 0x00,
    0x30, 0x01, 0x50, 0x00, 0x06,
];

struct As7341Sim {
    regs: HashMap<u8, u8>,
    smux_ram: [u8; 20],
    phase1: [u16; 6],
    phase2: [u16; 6],
    avalid_stuck: bool,
    block_shortfall: Option<usize>,
    fail_armed: bool,
    failing: bool,
    was_powered_off: bool,
    measuring: bool,
}

struct As7343Sim {
    regs: HashMap<u8, u8>,
    data: [u16; 18],
    sai_active: bool,
    avalid_stuck: bool,
    fail_armed: bool,
    failing: bool,
    was_powered_off: bool,
    measuring: bool,
}

enum SimDevice {
    Mux(MuxSim),
    Sht40(Sht40Sim),
    As7341(As7341Sim),
    As7343(As7343Sim),
}

impl SimDevice {
    fn write_reg(&mut self, reg: u8, value: u8) -> Result<()> {
        match self {
            SimDevice::Mux(_) | SimDevice::Sht40(_) => Err(eio("write-byte")),
            SimDevice::As7341(d) => {
                match reg {
                    0x00..=0x13 => d.smux_ram[reg as usize] = value,
                    0x80 => {
                        let pon = value & 0x01 != 0;
                        if !pon {
                            d.was_powered_off = true;
                            d.measuring = false;
                        } else if d.was_powered_off {
                            d.was_powered_off = false;
                            d.failing = false;
                            d.fail_armed = false;
                        }
                        d.measuring = pon && value & 0x02 != 0;
                        // SMUXEN self-clears once the RAM content is latched
                        d.regs.insert(reg, value & !0x10);
                    }
                    0xef => {
                        if value & 0x08 != 0 {
                            d.regs.clear();
                            d.measuring = false;
                        } else {
                            d.regs.insert(reg, value);
                        }
                    }
                    _ => {
                        d.regs.insert(reg, value);
                    }
                }
                Ok(())
            }
            SimDevice::As7343(d) => {
                match reg {
                    0x80 => {
                        let pon = value & 0x01 != 0;
                        if !pon {
                            d.was_powered_off = true;
                            d.measuring = false;
                        } else if d.was_powered_off {
                            d.was_powered_off = false;
                            d.failing = false;
                            d.fail_armed = false;
                        }
                        d.measuring = pon && value & 0x02 != 0;
                        d.regs.insert(reg, value & !0x10);
                    }
                    0xfa => {
                        if value & 0x01 != 0 {
                            d.sai_active = false;
                        }
                        if value & 0x10 != 0 {
                            d.regs.clear();
                            d.measuring = false;
                        } else {
                            d.regs.insert(reg, value);
                        }
                    }
                    _ => {
                        d.regs.insert(reg, value);
                    }
                }
                Ok(())
            }
        }
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8> {
        match self {
            SimDevice::Mux(_) | SimDevice::Sht40(_) => Err(eio("read-word")),
            SimDevice::As7341(d) => {
                if d.failing {
                    return Err(eio("read-word"));
                }
                let value = match reg {
                    0x92 => 0x24,
                    0xa3 => {
                        if d.measuring && !d.avalid_stuck {
                            0x40
                        } else {
                            0x00
                        }
                    }
                    0x95..=0xa0 => {
                        let data = d.current_dataset();
                        let offset = (reg - 0x95) as usize;
                        let sample = data[offset / 2];
                        if offset % 2 == 0 {
                            (sample & 0xff) as u8
                        } else {
                            (sample >> 8) as u8
                        }
                    }
                    _ => d.regs.get(&reg).copied().unwrap_or(0),
                };
                Ok(value)
            }
            SimDevice::As7343(d) => {
                if d.failing {
                    return Err(eio("read-word"));
                }
                let value = match reg {
                    0x5a => 0x81,
                    0x90 => {
                        if d.measuring && !d.avalid_stuck {
                            0x40
                        } else {
                            0x00
                        }
                    }
                    0x94 => 0x00,
                    0xbc => {
                        if d.sai_active {
                            0x40
                        } else {
                            0x00
                        }
                    }
                    0x95..=0xba => {
                        let offset = (reg - 0x95) as usize;
                        let sample = d.data[offset / 2];
                        if offset % 2 == 0 {
                            (sample & 0xff) as u8
                        } else {
                            (sample >> 8) as u8
                        }
                    }
                    _ => d.regs.get(&reg).copied().unwrap_or(0),
                };
                Ok(value)
            }
        }
    }

    fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<usize> {
        match self {
            SimDevice::Mux(_) | SimDevice::Sht40(_) => Err(eio("read-block")),
            SimDevice::As7341(d) => {
                if d.fail_armed {
                    d.fail_armed = false;
                    d.failing = true;
                    return Err(eio("read-block"));
                }
                if d.failing {
                    return Err(eio("read-block"));
                }
                if reg != 0x95 {
                    return Err(eio("read-block"));
                }
                let data = d.current_dataset();
                let mut bytes = [0u8; 12];
                for (i, sample) in data.iter().enumerate() {
                    bytes[i * 2] = (sample & 0xff) as u8;
                    bytes[i * 2 + 1] = (sample >> 8) as u8;
                }
                let mut n = buf.len().min(12);
                if let Some(short) = d.block_shortfall {
                    n = n.min(short);
                }
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            SimDevice::As7343(d) => {
                if d.fail_armed {
                    d.fail_armed = false;
                    d.failing = true;
                    return Err(eio("read-block"));
                }
                if d.failing {
                    return Err(eio("read-block"));
                }
                if !(0x95..=0xba).contains(&reg) {
                    return Err(eio("read-block"));
                }
                let mut bytes = [0u8; 36];
                for (i, sample) in d.data.iter().enumerate() {
                    bytes[i * 2] = (sample & 0xff) as u8;
                    bytes[i * 2 + 1] = (sample >> 8) as u8;
                }
                let offset = (reg - 0x95) as usize;
                let n = buf.len().min(36 - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                Ok(n)
            }
        }
    }

    fn raw_write(&mut self, value: u8) -> Result<()> {
        match self {
            SimDevice::Mux(d) => {
                d.mask = value;
                Ok(())
            }
            SimDevice::Sht40(d) => {
                d.last_cmd = Some(value);
                Ok(())
            }
            _ => Err(eio("raw-write")),
        }
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            SimDevice::Mux(d) => {
                if buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = d.mask;
                Ok(1)
            }
            SimDevice::Sht40(d) => {
                if d.last_cmd != Some(0xfd) {
                    return Err(eio("raw-read"));
                }
                let t = d.raw_t.to_be_bytes();
                let h = d.raw_h.to_be_bytes();
                let mut frame = [
                    t[0],
                    t[1],
                    sim_crc8(&t),
                    h[0],
                    h[1],
                    sim_crc8(&h),
                ];
                if d.corrupt {
                    frame[2] ^= 0x01;
                }
                let n = buf.len().min(6);
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            _ => Err(eio("raw-read")),
        }
    }
}

impl As7341Sim {
    fn current_dataset(&self) -> [u16; 6] {
        if self.smux_ram == SIM_SMUX_F1_F4 {
            self.phase1
        } else {
            self.phase2
        }
    }
}

// ---------------------------------------------------------------------
// The bus fabric
// ---------------------------------------------------------------------

struct Slot {
    address: u8,
    /// `Some((mux_address, channel))` for devices behind a switch.
    route: Option<(u8, u8)>,
    device: SimDevice,
}

#[derive(Default)]
struct SimBus {
    slots: Vec<Slot>,
}

impl SimBus {
    /// Find the device answering at `address` given the current gate
    /// state of every switch on the bus.
    fn resolve(&mut self, address: u8) -> Option<&mut SimDevice> {
        let mut masks: HashMap<u8, u8> = HashMap::new();
        for slot in &self.slots {
            if slot.route.is_none() {
                if let SimDevice::Mux(m) = &slot.device {
                    masks.insert(slot.address, m.mask);
                }
            }
        }
        let index = self.slots.iter().position(|slot| {
            if slot.address != address {
                return false;
            }
            match slot.route {
                None => true,
                Some((mux, channel)) => masks
                    .get(&mux)
                    .map(|mask| mask & (1 << channel) != 0)
                    .unwrap_or(false),
            }
        })?;
        Some(&mut self.slots[index].device)
    }

    fn slot_by_address(&mut self, address: u8) -> Option<&mut SimDevice> {
        self.slots
            .iter_mut()
            .find(|slot| slot.address == address)
            .map(|slot| &mut slot.device)
    }
}

struct OpenHandle {
    path: String,
    selected: u8,
}

struct Sim {
    next_handle: Handle,
    buses: HashMap<String, SimBus>,
    handles: HashMap<Handle, OpenHandle>,
    ops: Vec<MockOp>,
}

/// The simulator; drop-in [`Transport`] for tests.
pub struct MockTransport {
    state: Mutex<Sim>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport {
            state: Mutex::new(Sim {
                next_handle: 100,
                buses: HashMap::new(),
                handles: HashMap::new(),
                ops: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sim> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_bus(&self, path: &str) {
        self.lock().buses.entry(path.to_string()).or_default();
    }

    fn add_device(&self, path: &str, address: u8, route: Option<(u8, u8)>, device: SimDevice) {
        self.lock()
            .buses
            .entry(path.to_string())
            .or_default()
            .slots
            .push(Slot {
                address,
                route,
                device,
            });
    }

    pub fn add_mux(&self, path: &str, address: u8) {
        self.add_device(path, address, None, SimDevice::Mux(MuxSim::default()));
    }

    pub fn add_sht40(&self, path: &str, address: u8, raw_t: u16, raw_h: u16) {
        self.add_device(
            path,
            address,
            None,
            SimDevice::Sht40(Sht40Sim {
                raw_t,
                raw_h,
                corrupt: false,
                last_cmd: None,
            }),
        );
    }

    fn blank_as7341() -> As7341Sim {
        As7341Sim {
            regs: HashMap::new(),
            smux_ram: [0; 20],
            phase1: [0; 6],
            phase2: [0; 6],
            avalid_stuck: false,
            block_shortfall: None,
            fail_armed: false,
            failing: false,
            was_powered_off: false,
            measuring: false,
        }
    }

    fn blank_as7343() -> As7343Sim {
        As7343Sim {
            regs: HashMap::new(),
            data: [0; 18],
            sai_active: false,
            avalid_stuck: false,
            fail_armed: false,
            failing: false,
            was_powered_off: false,
            measuring: false,
        }
    }

    pub fn add_as7341(&self, path: &str, address: u8) {
        self.add_device(path, address, None, SimDevice::As7341(Self::blank_as7341()));
    }

    pub fn add_as7341_behind(&self, path: &str, mux_address: u8, channel: u8, address: u8) {
        self.add_device(
            path,
            address,
            Some((mux_address, channel)),
            SimDevice::As7341(Self::blank_as7341()),
        );
    }

    pub fn add_as7343(&self, path: &str, address: u8) {
        self.add_device(path, address, None, SimDevice::As7343(Self::blank_as7343()));
    }

    pub fn add_as7343_behind(&self, path: &str, mux_address: u8, channel: u8, address: u8) {
        self.add_device(
            path,
            address,
            Some((mux_address, channel)),
            SimDevice::As7343(Self::blank_as7343()),
        );
    }

    fn with_device(&self, path: &str, address: u8, f: impl FnOnce(&mut SimDevice)) {
        let mut sim = self.lock();
        if let Some(bus) = sim.buses.get_mut(path) {
            if let Some(device) = bus.slot_by_address(address) {
                f(device);
            }
        }
    }

    pub fn set_sht40_corrupt(&self, path: &str, address: u8, on: bool) {
        self.with_device(path, address, |d| {
            if let SimDevice::Sht40(d) = d {
                d.corrupt = on;
            }
        });
    }

    pub fn set_as7341_phases(&self, path: &str, address: u8, phase1: [u16; 6], phase2: [u16; 6]) {
        self.with_device(path, address, |d| {
            if let SimDevice::As7341(d) = d {
                d.phase1 = phase1;
                d.phase2 = phase2;
            }
        });
    }

    pub fn set_as7341_block_shortfall(&self, path: &str, address: u8, shortfall: usize) {
        self.with_device(path, address, |d| {
            if let SimDevice::As7341(d) = d {
                d.block_shortfall = Some(shortfall);
            }
        });
    }

    pub fn set_as7343_data(&self, path: &str, address: u8, data: [u16; 18]) {
        self.with_device(path, address, |d| {
            if let SimDevice::As7343(d) = d {
                d.data = data;
            }
        });
    }

    pub fn set_as7343_sai_active(&self, path: &str, address: u8, on: bool) {
        self.with_device(path, address, |d| {
            if let SimDevice::As7343(d) = d {
                d.sai_active = on;
            }
        });
    }

    /// Make AVALID never assert on a spectral device.
    pub fn set_avalid_stuck(&self, path: &str, address: u8, on: bool) {
        self.with_device(path, address, |d| match d {
            SimDevice::As7341(d) => d.avalid_stuck = on,
            SimDevice::As7343(d) => d.avalid_stuck = on,
            _ => {}
        });
    }

    /// Arm a spectral device so its next block read fails with EIO and
    /// every read after that keeps failing until the device is power
    /// cycled (ENABLE written 0 then 1).
    pub fn arm_block_read_failure(&self, path: &str, address: u8) {
        self.with_device(path, address, |d| match d {
            SimDevice::As7341(d) => d.fail_armed = true,
            SimDevice::As7343(d) => d.fail_armed = true,
            _ => {}
        });
    }

    /// Raw register content of a spectral device, for test introspection.
    pub fn spectral_reg(&self, path: &str, address: u8, reg: u8) -> Option<u8> {
        let mut sim = self.lock();
        let bus = sim.buses.get_mut(path)?;
        let device = bus.slot_by_address(address)?;
        match device {
            SimDevice::As7341(d) => d.regs.get(&reg).copied(),
            SimDevice::As7343(d) => d.regs.get(&reg).copied(),
            _ => None,
        }
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    fn log(&mut self, handle: Handle, address: u8, kind: OpKind) {
        self.ops.push(MockOp {
            handle,
            address,
            kind,
        });
    }

    fn selected(&self, handle: Handle) -> Result<(String, u8)> {
        let open = self.handles.get(&handle).ok_or(Error::BusClosed)?;
        Ok((open.path.clone(), open.selected))
    }

    fn device_at(&mut self, path: &str, address: u8) -> Result<&mut SimDevice> {
        self.buses
            .get_mut(path)
            .ok_or(Error::BusClosed)?
            .resolve(address)
            .ok_or_else(|| enxio("select"))
    }
}

impl Transport for MockTransport {
    fn open(&self, path: &str, address: u8) -> Result<Handle> {
        let mut sim = self.lock();
        if !sim.buses.contains_key(path) {
            return Err(Error::transport(
                "open",
                io::Error::from_raw_os_error(libc::ENOENT),
            ));
        }
        let handle = sim.next_handle;
        sim.next_handle += 1;
        sim.handles.insert(
            handle,
            OpenHandle {
                path: path.to_string(),
                selected: address,
            },
        );
        sim.log(handle, address, OpKind::Open);
        Ok(handle)
    }

    fn close(&self, handle: Handle) {
        let mut sim = self.lock();
        if let Some(open) = sim.handles.remove(&handle) {
            let selected = open.selected;
            sim.log(handle, selected, OpKind::Close);
        }
    }

    fn switch_address(&self, handle: Handle, address: u8) -> Result<()> {
        let mut sim = self.lock();
        sim.handles
            .get_mut(&handle)
            .ok_or(Error::BusClosed)?
            .selected = address;
        sim.log(handle, address, OpKind::Switch);
        Ok(())
    }

    fn set_timeout_ms(&self, handle: Handle, timeout_ms: u64) -> Result<()> {
        let mut sim = self.lock();
        sim.selected(handle)?;
        sim.log(handle, 0, OpKind::SetTimeout { ms: timeout_ms });
        Ok(())
    }

    fn smbus_write_byte(&self, handle: Handle, register: u8, value: u8) -> Result<()> {
        let mut sim = self.lock();
        let (path, address) = sim.selected(handle)?;
        sim.log(
            handle,
            address,
            OpKind::WriteByte {
                reg: register,
                value,
            },
        );
        sim.device_at(&path, address)?.write_reg(register, value)
    }

    fn smbus_write_word(&self, handle: Handle, register: u8, value: u16) -> Result<()> {
        let mut sim = self.lock();
        let (path, address) = sim.selected(handle)?;
        sim.log(
            handle,
            address,
            OpKind::WriteWord {
                reg: register,
                value,
            },
        );
        let device = sim.device_at(&path, address)?;
        device.write_reg(register, (value & 0xff) as u8)?;
        device.write_reg(register + 1, (value >> 8) as u8)
    }

    fn smbus_read_word(&self, handle: Handle, register: u8) -> Result<u16> {
        let mut sim = self.lock();
        let (path, address) = sim.selected(handle)?;
        sim.log(handle, address, OpKind::ReadWord { reg: register });
        let device = sim.device_at(&path, address)?;
        let lo = device.read_reg(register)?;
        let hi = device.read_reg(register.wrapping_add(1)).unwrap_or(0);
        Ok(u16::from(lo) | (u16::from(hi) << 8))
    }

    fn smbus_read_block(&self, handle: Handle, register: u8, buf: &mut [u8]) -> Result<usize> {
        let mut sim = self.lock();
        let (path, address) = sim.selected(handle)?;
        sim.log(
            handle,
            address,
            OpKind::ReadBlock {
                reg: register,
                len: buf.len(),
            },
        );
        sim.device_at(&path, address)?.read_block(register, buf)
    }

    fn raw_write_byte(&self, handle: Handle, value: u8) -> Result<()> {
        let mut sim = self.lock();
        let (path, address) = sim.selected(handle)?;
        sim.log(handle, address, OpKind::RawWrite { value });
        sim.device_at(&path, address)?.raw_write(value)
    }

    fn raw_read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let mut sim = self.lock();
        let (path, address) = sim.selected(handle)?;
        sim.log(handle, address, OpKind::RawRead { len: buf.len() });
        sim.device_at(&path, address)?.raw_read(buf)
    }

    fn probe(&self, handle: Handle, address: u8) -> bool {
        let mut sim = self.lock();
        let Ok((path, _)) = sim.selected(handle) else {
            return false;
        };
        if let Some(open) = sim.handles.get_mut(&handle) {
            open.selected = address;
        }
        let found = sim
            .buses
            .get_mut(&path)
            .and_then(|bus| bus.resolve(address))
            .is_some();
        sim.log(handle, address, OpKind::Probe { found });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn channel_gating_hides_devices() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus("/dev/i2c-9");
        mock.add_mux("/dev/i2c-9", 0x70);
        mock.add_as7343_behind("/dev/i2c-9", 0x70, 2, 0x39);

        let handle = mock.open("/dev/i2c-9", 0x08).unwrap();
        assert!(!mock.probe(handle, 0x39));

        // Gate channel 2 through and the device answers.
        mock.switch_address(handle, 0x70).unwrap();
        mock.raw_write_byte(handle, 0b0000_0100).unwrap();
        assert!(mock.probe(handle, 0x39));

        // Gate a different channel and it disappears again.
        mock.switch_address(handle, 0x70).unwrap();
        mock.raw_write_byte(handle, 0b0000_0010).unwrap();
        assert!(!mock.probe(handle, 0x39));
    }

    #[test]
    fn sht40_frame_has_valid_crcs() {
        let mock = MockTransport::new();
        mock.add_bus("/dev/i2c-9");
        mock.add_sht40("/dev/i2c-9", 0x44, 0x6688, 0x9b00);
        let handle = mock.open("/dev/i2c-9", 0x44).unwrap();

        mock.raw_write_byte(handle, 0xfd).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(mock.raw_read(handle, &mut buf).unwrap(), 6);
        assert_eq!(sim_crc8(&buf[0..2]), buf[2]);
        assert_eq!(sim_crc8(&buf[3..5]), buf[5]);
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 0x6688);
        assert_eq!(u16::from_be_bytes([buf[3], buf[4]]), 0x9b00);
    }
}
