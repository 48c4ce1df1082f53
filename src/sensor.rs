// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! Sensor plumbing shared by every driver.
//!
//! A driver owns a [`SensorLink`] holding its bus claim and, when it sits
//! behind a channel switch, a route through it.  The [`SensorDriver`]
//! trait supplies the connect/disconnect/liveness lifecycle; drivers fill
//! in the device-specific protocol.
//!
//! All register helpers run inside a [`DeviceTxn`], which holds the bus
//! handle's lock and re-asserts the multiplexer channel and the
//! kernel-side sub-device selection lazily.  Multi-step protocols call
//! [`SensorLink::transaction`] once and keep the guard for the whole
//! sequence; the one-shot helpers open and close a transaction per call.

use crate::bus::{BusManager, BusShared, BusTxn};
use crate::error::{Error, Result};
use crate::mux::Mux;
use crate::sensors::{sensor_id, DriverKind, Readings, SensorState};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// How a multiplexed sensor reaches the bus: through `mux`, on `channel`.
#[derive(Clone)]
pub struct MuxRoute {
    pub mux: Arc<Mux>,
    pub channel: u8,
}

/// Attempts per read before a driver gives up.
pub(crate) const MAX_READ_ATTEMPTS: u32 = 3;

/// Exponential backoff between read attempts: 50, 100, 200 ms, capped.
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    let ms = 50u64.saturating_mul(1 << (attempt.saturating_sub(1).min(4)));
    Duration::from_millis(ms.min(500))
}

/// Connection state every sensor driver carries.
pub struct SensorLink {
    manager: Arc<BusManager>,
    path: String,
    address: u8,
    route: Option<MuxRoute>,
    bus: Option<Arc<BusShared>>,
    initialized: bool,
    recovering: bool,
}

impl SensorLink {
    pub fn new(
        manager: Arc<BusManager>,
        path: &str,
        address: u8,
        route: Option<MuxRoute>,
    ) -> SensorLink {
        SensorLink {
            manager,
            path: path.to_string(),
            address,
            route,
            bus: None,
            initialized: false,
            recovering: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn route(&self) -> Option<&MuxRoute> {
        self.route.as_ref()
    }

    pub fn manager(&self) -> &Arc<BusManager> {
        &self.manager
    }

    pub fn sensor_id(&self) -> String {
        sensor_id(&self.path, self.route.as_ref().map(|r| r.channel), self.address)
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some() && self.initialized
    }

    /// Guard against reentrant recovery: a recovery routine performing
    /// I/O must not trigger another recovery pass.
    pub fn in_recovery(&self) -> bool {
        self.recovering
    }

    pub(crate) fn set_recovering(&mut self, on: bool) {
        self.recovering = on;
    }

    pub(crate) fn bus(&self) -> Option<&Arc<BusShared>> {
        self.bus.as_ref()
    }

    pub(crate) fn attach_bus(&mut self, bus: Arc<BusShared>) {
        self.bus = Some(bus);
    }

    pub(crate) fn mark_initialized(&mut self, on: bool) {
        self.initialized = on;
    }

    pub(crate) fn initialized(&self) -> bool {
        self.initialized
    }

    /// Release the bus claim.  If the registry no longer owns the handle
    /// we hold (forced close), there is nothing to give back.
    pub(crate) fn detach(&mut self) {
        self.initialized = false;
        if let Some(bus) = self.bus.take() {
            if self.manager.current_handle(&self.path) == Some(bus.handle()) {
                self.manager.close_bus(&self.path, self.address);
            }
        }
    }

    /// Forget a handle that was closed underneath us.
    pub(crate) fn drop_stale_bus(&mut self) {
        self.bus = None;
        self.initialized = false;
    }

    /// Acquire the bus lock once, route the multiplexer channel and the
    /// sub-device selection to this sensor, and run `op` under the lock.
    pub fn transaction<R>(
        &mut self,
        op: impl FnOnce(&mut DeviceTxn<'_>) -> Result<R>,
    ) -> Result<R> {
        let bus = self.bus.as_ref().ok_or(Error::BusClosed)?.clone();
        if let Some(route) = &self.route {
            if !route.mux.is_ready() {
                return Err(Error::BusClosed);
            }
        }
        let mut txn = bus.txn();
        if let Some(route) = &self.route {
            route.mux.ensure_channel_in(&mut txn, route.channel)?;
        }
        txn.select(self.address)?;
        let mut dev = DeviceTxn {
            txn,
            address: self.address,
        };
        op(&mut dev)
    }

    pub fn read_reg(&mut self, register: u8) -> Result<u8> {
        self.transaction(|t| t.read_reg(register))
    }

    pub fn write_reg(&mut self, register: u8, value: u8) -> Result<()> {
        self.transaction(|t| t.write_reg(register, value))
    }

    pub fn enable_bit(&mut self, register: u8, bit: u8, on: bool) -> Result<()> {
        self.transaction(|t| t.enable_bit(register, bit, on))
    }

    pub fn set_register_bits(&mut self, register: u8, shift: u8, width: u8, value: u8) -> Result<()> {
        self.transaction(|t| t.set_register_bits(register, shift, width, value))
    }

    pub fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<usize> {
        self.transaction(|t| t.read_block(register, buf))
    }
}

/// An open, locked transaction addressed at one sensor.
///
/// Every helper re-asserts the sub-device selection lazily, so mixing in
/// traffic for another address (a mask write by the routing layer) within
/// the same lock scope stays consistent.
pub struct DeviceTxn<'a> {
    txn: BusTxn<'a>,
    address: u8,
}

impl DeviceTxn<'_> {
    pub fn read_reg(&mut self, register: u8) -> Result<u8> {
        self.txn.read_byte_reg(self.address, register)
    }

    pub fn write_reg(&mut self, register: u8, value: u8) -> Result<()> {
        self.txn.write_byte_reg(self.address, register, value)
    }

    /// Write a 16-bit value LSB-first into `register` and `register + 1`.
    pub fn write_word_regs(&mut self, register: u8, value: u16) -> Result<()> {
        self.write_reg(register, (value & 0xff) as u8)?;
        self.write_reg(register + 1, (value >> 8) as u8)
    }

    /// Read-modify-write of a single bit; the write is skipped when the
    /// bit already has the requested value.
    pub fn enable_bit(&mut self, register: u8, bit: u8, on: bool) -> Result<()> {
        let current = self.read_reg(register)?;
        let desired = if on {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        if desired != current {
            self.write_reg(register, desired)?;
        }
        Ok(())
    }

    /// Masked read-modify-write of a `width`-bit field at `shift`.
    pub fn set_register_bits(&mut self, register: u8, shift: u8, width: u8, value: u8) -> Result<()> {
        if width == 0 || shift + width > 8 {
            return Err(Error::Argument(format!(
                "bit field {}+{} does not fit a byte register",
                shift, width
            )));
        }
        let mask = (((1u16 << width) - 1) as u8) << shift;
        let current = self.read_reg(register)?;
        let desired = (current & !mask) | ((value << shift) & mask);
        if desired != current {
            self.write_reg(register, desired)?;
        }
        Ok(())
    }

    pub fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<usize> {
        self.txn.read_block(self.address, register, buf)
    }

    pub fn raw_write_byte(&mut self, value: u8) -> Result<()> {
        self.txn.raw_write_byte(self.address, value)
    }

    pub fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.txn.raw_read(self.address, buf)
    }
}

/// A concrete sensor driver.
///
/// Drivers implement the device protocol (`initialize`, `read_data`,
/// `sensor_state`, optionally `power_down` and `recover`); the provided
/// methods supply the shared lifecycle.
pub trait SensorDriver: Send {
    fn link(&self) -> &SensorLink;
    fn link_mut(&mut self) -> &mut SensorLink;
    fn kind(&self) -> DriverKind;

    /// Device-specific bring-up, run with the bus claim already held.
    fn initialize(&mut self) -> Result<()>;

    /// Best-effort power down before releasing the bus.
    fn power_down(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce one reading.  Failures are reported in-band: an empty map
    /// or one carrying [`crate::sensors::ERROR_KEY`].
    fn read_data(&mut self) -> Readings;

    /// The latest immutable snapshot for this sensor.
    fn sensor_state(&self) -> SensorState;

    /// Sensors that must not be read more often than this.
    fn min_read_interval(&self) -> Option<Duration> {
        None
    }

    /// Open the bus (and the multiplexer, when routed through one),
    /// then initialize the device.  Returns false on any failure, with
    /// the claim released.
    fn connect(&mut self) -> bool {
        if self.is_ready() {
            return true;
        }

        if let Some(route) = self.link().route() {
            let mux = route.mux.clone();
            if !mux.is_ready() {
                if let Err(e) = mux.connect() {
                    warn!("{}: multiplexer connect failed: {}", self.link().sensor_id(), e);
                    return false;
                }
            }
        }

        if self.link().bus().is_none() {
            let link = self.link();
            let (manager, path, address) = (link.manager().clone(), link.path().to_string(), link.address());
            if manager.is_address_in_use(&path, address) {
                warn!(
                    "{}: address {:#04x} already claimed on {}",
                    self.link().sensor_id(),
                    address,
                    path
                );
                return false;
            }
            match manager.open_bus(&path, address) {
                Ok(bus) => self.link_mut().attach_bus(bus),
                Err(e) => {
                    warn!("{}: bus open failed: {}", self.link().sensor_id(), e);
                    return false;
                }
            }
        }

        match self.initialize() {
            Ok(()) => {
                self.link_mut().mark_initialized(true);
                info!("{}: {} ready", self.link().sensor_id(), self.kind());
                true
            }
            Err(e) => {
                warn!("{}: initialize failed: {}", self.link().sensor_id(), e);
                self.link_mut().detach();
                false
            }
        }
    }

    /// Power the device down if the driver supports it and release the
    /// bus claim.
    fn disconnect(&mut self) {
        if self.link().bus().is_some() {
            if let Err(e) = self.power_down() {
                debug!("{}: power-down on disconnect: {}", self.link().sensor_id(), e);
            }
        }
        self.link_mut().detach();
    }

    /// Liveness check.  A sensor is ready only while its handle is still
    /// the registry's handle for the path and its multiplexer (if any) is
    /// ready itself.
    fn is_ready(&mut self) -> bool {
        if self.link().bus().is_none() || !self.link().initialized() {
            return false;
        }
        let live = {
            let link = self.link();
            let handle = link.bus().map(|b| b.handle());
            link.manager().current_handle(link.path()) == handle
        };
        if !live {
            debug!("{}: bus handle changed, dropping claim", self.link().sensor_id());
            self.link_mut().drop_stale_bus();
            return false;
        }
        if let Some(route) = self.link().route() {
            if !route.mux.is_ready() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_half_second() {
        assert_eq!(retry_backoff(1), Duration::from_millis(50));
        assert_eq!(retry_backoff(2), Duration::from_millis(100));
        assert_eq!(retry_backoff(3), Duration::from_millis(200));
        assert_eq!(retry_backoff(4), Duration::from_millis(400));
        assert_eq!(retry_backoff(5), Duration::from_millis(500));
        assert_eq!(retry_backoff(9), Duration::from_millis(500));
    }
}
