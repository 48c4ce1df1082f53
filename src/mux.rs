// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! TCA9548-family analog channel switch.
//!
//! This part has no register model: a single byte write sets the channel
//! mask and a single byte read returns it.  Bit i gates channel i through
//! to the shared downstream bus.  The driver caches the mask so repeated
//! selections of the current channel cost no bus traffic, and offers
//! scoped operations that restore the mask on every exit path.

use crate::bus::{BusManager, BusShared, BusTxn};
use crate::detect::{self, DeviceInfo, ScanConfig, MUX_ADDRESS_MAX, MUX_ADDRESS_MIN};
use crate::error::{Error, Result};
use crate::sensors::now_ms;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

/// Devices found behind each switch channel.
#[derive(Debug, Clone)]
pub struct ChannelDeviceMap {
    pub address: u8,
    pub channels: BTreeMap<u8, Vec<DeviceInfo>>,
    pub scanned_ms: u64,
}

impl ChannelDeviceMap {
    pub fn device_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}

/// Union of a main-bus scan and a full channel sweep.
#[derive(Debug, Clone)]
pub struct ComprehensiveScan {
    pub direct: Vec<DeviceInfo>,
    pub channels: ChannelDeviceMap,
}

/// Driver for one channel switch.  Shared by every sensor routed through
/// it; the bus loop holds the owning handle and the switch must outlive
/// its dependents.
pub struct Mux {
    manager: Arc<BusManager>,
    path: String,
    address: u8,
    max_channels: u8,
    conn: Mutex<Option<Arc<BusShared>>>,
    // Leaf lock: never held while acquiring the bus transaction.
    mask: Mutex<Option<u8>>,
}

impl Mux {
    /// An 8-channel switch (TCA9548).
    pub fn new(manager: Arc<BusManager>, path: &str, address: u8) -> Result<Arc<Mux>> {
        Self::with_max_channels(manager, path, address, 8)
    }

    /// Narrower parts of the same family (TCA9543 with 2 channels,
    /// TCA9546 with 4).
    pub fn with_max_channels(
        manager: Arc<BusManager>,
        path: &str,
        address: u8,
        max_channels: u8,
    ) -> Result<Arc<Mux>> {
        if !(MUX_ADDRESS_MIN..=MUX_ADDRESS_MAX).contains(&address) {
            return Err(Error::Argument(format!(
                "multiplexer address {:#04x} outside [{:#04x}, {:#04x}]",
                address, MUX_ADDRESS_MIN, MUX_ADDRESS_MAX
            )));
        }
        if !matches!(max_channels, 2 | 4 | 8) {
            return Err(Error::Argument(format!(
                "unsupported channel count {}",
                max_channels
            )));
        }
        Ok(Arc::new(Mux {
            manager,
            path: path.to_string(),
            address,
            max_channels,
            conn: Mutex::new(None),
            mask: Mutex::new(None),
        }))
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn max_channels(&self) -> u8 {
        self.max_channels
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        if channel >= self.max_channels {
            return Err(Error::Argument(format!(
                "channel {} outside [0, {})",
                channel, self.max_channels
            )));
        }
        Ok(())
    }

    fn set_cached(&self, mask: Option<u8>) {
        *self.mask.lock().unwrap_or_else(|p| p.into_inner()) = mask;
    }

    /// The mask as last written or read, without touching the bus.
    pub fn cached_mask(&self) -> Option<u8> {
        *self.mask.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bus(&self) -> Result<Arc<BusShared>> {
        self.conn
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(Error::BusClosed)
    }

    /// Open the bus and put the switch into a known state: all channels
    /// off, cache primed from readback.
    pub fn connect(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let bus = self.manager.open_bus(&self.path, self.address)?;
        let initialized = (|| {
            let mut txn = bus.txn();
            txn.raw_write_byte(self.address, 0x00)?;
            let mut buf = [0u8; 1];
            let n = txn.raw_read(self.address, &mut buf)?;
            if n != 1 {
                return Err(Error::transport(
                    "mux-readback",
                    io::ErrorKind::UnexpectedEof.into(),
                ));
            }
            Ok(buf[0])
        })();
        match initialized {
            Ok(mask) => {
                debug!("{}: mux {:#04x} ready, mask {:#010b}", self.path, self.address, mask);
                *self.conn.lock().unwrap_or_else(|p| p.into_inner()) = Some(bus);
                self.set_cached(Some(mask));
                Ok(())
            }
            Err(e) => {
                self.manager.close_bus(&self.path, self.address);
                Err(e)
            }
        }
    }

    /// Liveness check: a handle swapped underneath us (forced close and
    /// reopen) demotes the switch to not-ready.
    pub fn is_ready(&self) -> bool {
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        match conn.as_ref() {
            Some(bus) if self.manager.current_handle(&self.path) == Some(bus.handle()) => true,
            Some(_) => {
                *conn = None;
                drop(conn);
                self.set_cached(None);
                false
            }
            None => false,
        }
    }

    /// Turn every channel off and release the bus claim.
    pub fn disconnect(&self) {
        if self.is_ready() {
            if let Err(e) = self.disable_all() {
                warn!("{}: mux {:#04x} disable-all on disconnect: {}", self.path, self.address, e);
            }
            self.manager.close_bus(&self.path, self.address);
        }
        *self.conn.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.set_cached(None);
    }

    /// Read the mask from the part and refresh the cache.
    pub fn read_mask(&self) -> Result<u8> {
        let bus = self.bus()?;
        let mut txn = bus.txn();
        self.read_mask_in(&mut txn)
    }

    pub(crate) fn read_mask_in(&self, txn: &mut BusTxn<'_>) -> Result<u8> {
        let mut buf = [0u8; 1];
        let n = txn.raw_read(self.address, &mut buf)?;
        if n != 1 {
            return Err(Error::transport(
                "mux-readback",
                io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        self.set_cached(Some(buf[0]));
        Ok(buf[0])
    }

    /// Write the mask, skipping the bus when the cache already matches.
    pub fn set_mask(&self, mask: u8) -> Result<()> {
        let bus = self.bus()?;
        let mut txn = bus.txn();
        self.set_mask_in(&mut txn, mask)
    }

    pub(crate) fn set_mask_in(&self, txn: &mut BusTxn<'_>, mask: u8) -> Result<()> {
        if self.cached_mask() == Some(mask) {
            return Ok(());
        }
        txn.raw_write_byte(self.address, mask)?;
        self.set_cached(Some(mask));
        Ok(())
    }

    fn current_mask_in(&self, txn: &mut BusTxn<'_>) -> Result<u8> {
        match self.cached_mask() {
            Some(mask) => Ok(mask),
            None => self.read_mask_in(txn),
        }
    }

    /// Gate `channel` through exclusively if its bit is not already set.
    /// Runs inside an open transaction so sensors can switch lanes
    /// mid-protocol.
    pub(crate) fn ensure_channel_in(&self, txn: &mut BusTxn<'_>, channel: u8) -> Result<()> {
        self.check_channel(channel)?;
        let mask = self.current_mask_in(txn)?;
        if mask & (1 << channel) != 0 {
            return Ok(());
        }
        self.set_mask_in(txn, 1 << channel)
    }

    pub fn enable_channel(&self, channel: u8) -> Result<()> {
        self.check_channel(channel)?;
        let bus = self.bus()?;
        let mut txn = bus.txn();
        let mask = self.current_mask_in(&mut txn)?;
        self.set_mask_in(&mut txn, mask | (1 << channel))
    }

    pub fn disable_channel(&self, channel: u8) -> Result<()> {
        self.check_channel(channel)?;
        let bus = self.bus()?;
        let mut txn = bus.txn();
        let mask = self.current_mask_in(&mut txn)?;
        self.set_mask_in(&mut txn, mask & !(1 << channel))
    }

    /// Make `channel` the only gated channel.
    pub fn select_channel(&self, channel: u8) -> Result<()> {
        self.check_channel(channel)?;
        self.set_mask(1 << channel)
    }

    pub fn enable_all(&self) -> Result<()> {
        self.set_mask(((1u16 << self.max_channels) - 1) as u8)
    }

    pub fn disable_all(&self) -> Result<()> {
        self.set_mask(0)
    }

    /// Run `op` with `channel` selected exclusively, restoring the
    /// previous mask on every exit path, including when `op` fails.
    pub fn scoped_on_channel<R>(
        &self,
        channel: u8,
        op: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        self.check_channel(channel)?;
        self.scoped_with_mask(1 << channel, op)
    }

    /// Like [`Mux::scoped_on_channel`] but with an arbitrary channel set.
    pub fn scoped_with_channels<R>(
        &self,
        channels: &[u8],
        op: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let mut mask = 0u8;
        for &channel in channels {
            self.check_channel(channel)?;
            mask |= 1 << channel;
        }
        self.scoped_with_mask(mask, op)
    }

    fn scoped_with_mask<R>(&self, mask: u8, op: impl FnOnce() -> Result<R>) -> Result<R> {
        let saved = {
            let bus = self.bus()?;
            let mut txn = bus.txn();
            let saved = self.current_mask_in(&mut txn)?;
            self.set_mask_in(&mut txn, mask)?;
            saved
        };
        let result = op();
        let restored = self.set_mask(saved);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    /// Scan one channel for devices.  Results are re-tagged with the
    /// channel index; the switch's own address is filtered out.
    pub fn scan_channel(&self, channel: u8, config: &ScanConfig) -> Result<Vec<DeviceInfo>> {
        self.check_channel(channel)?;
        let found = self.scoped_on_channel(channel, || {
            let bus = self.bus()?;
            detect::scan_on(&bus, config)
        })?;
        Ok(found
            .into_iter()
            .filter(|d| d.address != self.address)
            .map(|d| DeviceInfo {
                address: d.address,
                channel: Some(channel),
                device_type: detect::device_type_for(d.address, true),
            })
            .collect())
    }

    /// Sweep every channel.  Individual channel failures are logged and
    /// skipped; the mask in effect before the sweep is preserved.
    pub fn scan_all_channels(&self, config: &ScanConfig) -> Result<ChannelDeviceMap> {
        let mut channels = BTreeMap::new();
        for channel in 0..self.max_channels {
            match self.scan_channel(channel, config) {
                Ok(devices) => {
                    channels.insert(channel, devices);
                }
                Err(e) => {
                    warn!(
                        "{}: mux {:#04x} channel {} scan failed: {}",
                        self.path, self.address, channel, e
                    );
                }
            }
        }
        Ok(ChannelDeviceMap {
            address: self.address,
            channels,
            scanned_ms: now_ms(),
        })
    }

    /// Scan the main bus with all channels off, so only devices in front
    /// of the switch answer.
    pub fn scan_direct_bus(&self, config: &ScanConfig) -> Result<Vec<DeviceInfo>> {
        self.scoped_with_mask(0, || {
            let bus = self.bus()?;
            detect::scan_on(&bus, config)
        })
    }

    /// Union of the direct bus and every channel.
    pub fn scan_comprehensive(&self, config: &ScanConfig) -> Result<ComprehensiveScan> {
        let direct = self.scan_direct_bus(config)?;
        let channels = self.scan_all_channels(config)?;
        Ok(ComprehensiveScan { direct, channels })
    }

    /// Channels on which a device at `address` answers.
    pub fn find_device(&self, address: u8) -> Result<Vec<u8>> {
        let map = self.scan_all_channels(&ScanConfig::default())?;
        Ok(map
            .channels
            .iter()
            .filter(|(_, devices)| devices.iter().any(|d| d.address == address))
            .map(|(&channel, _)| channel)
            .collect())
    }

    pub fn is_device_on_channel(&self, address: u8, channel: u8) -> Result<bool> {
        let devices = self.scan_channel(channel, &ScanConfig::default())?;
        Ok(devices.iter().any(|d| d.address == address))
    }

    /// One-line description for the state snapshot.
    pub fn describe(&self) -> String {
        match self.cached_mask() {
            Some(mask) => format!(
                "mask {:#010b}, {} channels",
                mask, self.max_channels
            ),
            None => format!("not connected, {} channels", self.max_channels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, OpKind};

    const PATH: &str = "/dev/i2c-9";

    fn setup() -> (Arc<MockTransport>, Arc<BusManager>, Arc<Mux>) {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_mux(PATH, 0x70);
        let manager = Arc::new(BusManager::with_transport(mock.clone()));
        let mux = Mux::new(manager.clone(), PATH, 0x70).unwrap();
        mux.connect().unwrap();
        (mock, manager, mux)
    }

    fn mux_writes(mock: &MockTransport) -> Vec<u8> {
        mock.ops()
            .iter()
            .filter(|op| op.address == 0x70)
            .filter_map(|op| match op.kind {
                OpKind::RawWrite { value } => Some(value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn mask_write_is_idempotent() {
        let (mock, _manager, mux) = setup();
        mock.clear_ops();

        mux.set_mask(0b0000_0101).unwrap();
        assert_eq!(mux.read_mask().unwrap(), 0b0000_0101);
        mux.set_mask(0b0000_0101).unwrap();

        // The second identical set_mask must not reach the wire.
        assert_eq!(mux_writes(&mock), vec![0b0000_0101]);
    }

    #[test]
    fn scoped_restores_mask_on_failure() {
        let (mock, _manager, mux) = setup();
        mux.set_mask(0b0000_0001).unwrap();
        mock.clear_ops();

        let result: Result<()> =
            mux.scoped_on_channel(2, || Err(Error::Timeout("inner op")));
        assert!(result.is_err());
        assert_eq!(mux.cached_mask(), Some(0b0000_0001));
        // select then restore
        assert_eq!(mux_writes(&mock), vec![0b0000_0100, 0b0000_0001]);
    }

    #[test]
    fn scan_of_empty_channel_is_empty_and_preserves_mask() {
        let (_mock, _manager, mux) = setup();
        mux.set_mask(0b0000_0010).unwrap();

        let devices = mux.scan_channel(3, &ScanConfig::default()).unwrap();
        assert!(devices.is_empty());
        assert_eq!(mux.cached_mask(), Some(0b0000_0010));
    }

    #[test]
    fn scan_finds_device_behind_channel() {
        let (_mock, manager, _unused) = {
            let mock = Arc::new(MockTransport::new());
            mock.add_bus(PATH);
            mock.add_mux(PATH, 0x70);
            mock.add_as7343_behind(PATH, 0x70, 2, 0x39);
            let manager = Arc::new(BusManager::with_transport(mock.clone()));
            (mock, manager, ())
        };
        let mux = Mux::new(manager, PATH, 0x70).unwrap();
        mux.connect().unwrap();

        let map = mux.scan_all_channels(&ScanConfig::default()).unwrap();
        assert_eq!(map.device_count(), 1);
        let on_two = &map.channels[&2];
        assert_eq!(on_two.len(), 1);
        assert_eq!(on_two[0].address, 0x39);
        assert_eq!(on_two[0].channel, Some(2));
        assert!(mux.find_device(0x39).unwrap() == vec![2]);
        assert!(mux.is_device_on_channel(0x39, 2).unwrap());
        assert!(!mux.is_device_on_channel(0x39, 1).unwrap());
    }

    #[test]
    fn channel_bounds_are_enforced() {
        let (_mock, manager, mux) = setup();
        assert!(matches!(mux.select_channel(8), Err(Error::Argument(_))));

        let narrow = Mux::with_max_channels(manager, PATH, 0x71, 4).unwrap();
        assert!(matches!(narrow.select_channel(5), Err(Error::Argument(_))));
    }

    #[test]
    fn operations_require_connection() {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus(PATH);
        mock.add_mux(PATH, 0x70);
        let manager = Arc::new(BusManager::with_transport(mock));
        let mux = Mux::new(manager, PATH, 0x70).unwrap();
        assert!(matches!(mux.set_mask(1), Err(Error::BusClosed)));
    }
}
