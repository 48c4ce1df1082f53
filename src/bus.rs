// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! Process-wide bus registry.
//!
//! Exactly one file handle exists per bus path at any time, shared by every
//! driver on that bus and reference-counted by the [`BusManager`].  The
//! per-handle mutex guards the one piece of state the kernel keeps for us,
//! the currently selected sub-device, so holding a [`BusTxn`] is the only
//! way to put traffic on the wire.

use crate::error::{Error, Result};
use crate::transport::{check_address, Handle, Transport};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// The kernel-side sub-device selection as last written through this
/// handle.  `None` when unknown (fresh handle, or after a poisoned lock).
#[derive(Debug, Default)]
struct Cursor {
    current: Option<u8>,
}

/// One open bus device node, shared by all drivers on that path.
pub struct BusShared {
    path: String,
    handle: Handle,
    transport: Arc<dyn Transport>,
    cursor: Mutex<Cursor>,
}

impl BusShared {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Acquire the per-handle lock and begin a transaction.  Every I2C
    /// operation on this bus goes through the returned guard; multi-step
    /// protocols hold it for the whole sequence.
    pub fn txn(&self) -> BusTxn<'_> {
        let cursor = self.cursor.lock().unwrap_or_else(|p| {
            // A panic mid-I/O leaves the kernel selection unknown.
            let mut guard = p.into_inner();
            guard.current = None;
            guard
        });
        BusTxn { bus: self, cursor }
    }
}

/// An exclusive transaction on one bus handle.
///
/// All register helpers lazily re-assert the kernel-side sub-device
/// selection, so interleaving operations for different addresses (a
/// multiplexer mask write followed by sensor registers) stays consistent
/// within one transaction.
pub struct BusTxn<'a> {
    bus: &'a BusShared,
    cursor: MutexGuard<'a, Cursor>,
}

impl BusTxn<'_> {
    pub fn handle(&self) -> Handle {
        self.bus.handle
    }

    /// Point the handle at `address`, skipping the ioctl when the kernel
    /// is already there.
    pub fn select(&mut self, address: u8) -> Result<()> {
        check_address(address)?;
        if self.cursor.current != Some(address) {
            self.bus
                .transport
                .switch_address(self.bus.handle, address)?;
            self.cursor.current = Some(address);
        }
        Ok(())
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) -> Result<()> {
        self.bus.transport.set_timeout_ms(self.bus.handle, timeout_ms)
    }

    pub fn write_byte_reg(&mut self, address: u8, register: u8, value: u8) -> Result<()> {
        self.select(address)?;
        self.bus
            .transport
            .smbus_write_byte(self.bus.handle, register, value)
    }

    /// Byte-wise read: the SMBus word transfer carries the register of
    /// interest in its low byte.
    pub fn read_byte_reg(&mut self, address: u8, register: u8) -> Result<u8> {
        self.select(address)?;
        let word = self.bus.transport.smbus_read_word(self.bus.handle, register)?;
        Ok((word & 0xff) as u8)
    }

    pub fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<usize> {
        self.select(address)?;
        self.bus
            .transport
            .smbus_read_block(self.bus.handle, register, buf)
    }

    pub fn raw_write_byte(&mut self, address: u8, value: u8) -> Result<()> {
        self.select(address)?;
        self.bus.transport.raw_write_byte(self.bus.handle, value)
    }

    pub fn raw_read(&mut self, address: u8, buf: &mut [u8]) -> Result<usize> {
        self.select(address)?;
        self.bus.transport.raw_read(self.bus.handle, buf)
    }

    /// Probe for a device.  The transport leaves `address` selected
    /// whether or not anything answered.
    pub fn probe(&mut self, address: u8) -> bool {
        let present = self.bus.transport.probe(self.bus.handle, address);
        self.cursor.current = Some(address);
        present
    }
}

struct BusEntry {
    bus: Arc<BusShared>,
    refs: usize,
    active: HashSet<u8>,
}

/// Process-wide registry of open bus handles.
///
/// Thread-safe; one internal mutex serializes registry operations while
/// the per-handle locks remain distinct.  Use [`BusManager::global`] in
/// production and [`BusManager::with_transport`] to run against the mock.
pub struct BusManager {
    transport: Arc<dyn Transport>,
    registry: Mutex<HashMap<String, BusEntry>>,
}

impl BusManager {
    pub fn with_transport(transport: Arc<dyn Transport>) -> BusManager {
        BusManager {
            transport,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// The singleton backed by the kernel transport.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn global() -> Arc<BusManager> {
        use std::sync::OnceLock;
        static GLOBAL: OnceLock<Arc<BusManager>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Arc::new(BusManager::with_transport(Arc::new(
                    crate::transport::LinuxTransport::new(),
                )))
            })
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BusEntry>> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open `path` on behalf of a driver claiming `address`.
    ///
    /// The first open on a path creates the handle; later opens share it.
    /// A second claim of the same address on one path is a duplicate-driver
    /// bug and is rejected.
    pub fn open_bus(&self, path: &str, address: u8) -> Result<Arc<BusShared>> {
        check_address(address)?;
        let mut registry = self.lock();
        if let Some(entry) = registry.get_mut(path) {
            if entry.active.contains(&address) {
                return Err(Error::AddressInUse {
                    path: path.to_string(),
                    address,
                });
            }
            entry.refs += 1;
            entry.active.insert(address);
            return Ok(entry.bus.clone());
        }

        let bus = self.open_entry(path, address)?;
        let mut active = HashSet::new();
        active.insert(address);
        registry.insert(
            path.to_string(),
            BusEntry {
                bus: bus.clone(),
                refs: 1,
                active,
            },
        );
        Ok(bus)
    }

    /// Take a reference on `path` without claiming an address (bus scans).
    pub fn open_path(&self, path: &str) -> Result<Arc<BusShared>> {
        let mut registry = self.lock();
        if let Some(entry) = registry.get_mut(path) {
            entry.refs += 1;
            return Ok(entry.bus.clone());
        }
        let bus = self.open_entry(path, crate::transport::ADDRESS_MIN)?;
        registry.insert(
            path.to_string(),
            BusEntry {
                bus: bus.clone(),
                refs: 1,
                active: HashSet::new(),
            },
        );
        Ok(bus)
    }

    fn open_entry(&self, path: &str, initial: u8) -> Result<Arc<BusShared>> {
        let handle = self.transport.open(path, initial)?;
        info!("{}: bus opened (handle {})", path, handle);
        Ok(Arc::new(BusShared {
            path: path.to_string(),
            handle,
            transport: self.transport.clone(),
            cursor: Mutex::new(Cursor {
                current: Some(initial),
            }),
        }))
    }

    /// Release the claim `address` holds on `path`.  The last reference
    /// closes the handle and forgets the selection tag.
    pub fn close_bus(&self, path: &str, address: u8) {
        let mut registry = self.lock();
        let Some(entry) = registry.get_mut(path) else {
            return;
        };
        if !entry.active.remove(&address) {
            warn!("{}: released address {:#04x} that was not active", path, address);
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            let handle = entry.bus.handle;
            registry.remove(path);
            self.transport.close(handle);
            info!("{}: bus closed (handle {})", path, handle);
        }
    }

    /// Drop a scan reference taken with [`BusManager::open_path`].
    pub fn release_path(&self, path: &str) {
        let mut registry = self.lock();
        let Some(entry) = registry.get_mut(path) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let handle = entry.bus.handle;
            registry.remove(path);
            self.transport.close(handle);
            info!("{}: bus closed (handle {})", path, handle);
        }
    }

    pub fn is_address_in_use(&self, path: &str, address: u8) -> bool {
        self.lock()
            .get(path)
            .map(|e| e.active.contains(&address))
            .unwrap_or(false)
    }

    /// The handle currently registered for `path`, if any.  Drivers use
    /// this as a liveness check: a mismatch with the handle they hold
    /// means the bus was closed and reopened underneath them.
    pub fn current_handle(&self, path: &str) -> Option<Handle> {
        self.lock().get(path).map(|e| e.bus.handle)
    }

    /// Tear the path down regardless of outstanding references (loop
    /// shutdown).  Holders of the old `BusShared` will fail their next
    /// liveness check.
    pub fn force_close(&self, path: &str) {
        let mut registry = self.lock();
        if let Some(entry) = registry.remove(path) {
            debug!(
                "{}: force-closing handle {} with {} refs outstanding",
                path, entry.bus.handle, entry.refs
            );
            self.transport.close(entry.bus.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn manager() -> (Arc<MockTransport>, BusManager) {
        let mock = Arc::new(MockTransport::new());
        mock.add_bus("/dev/i2c-9");
        mock.add_sht40("/dev/i2c-9", 0x44, 0x8000, 0x8000);
        let manager = BusManager::with_transport(mock.clone());
        (mock, manager)
    }

    #[test]
    fn open_close_refcount() {
        let (_, manager) = manager();
        let a = manager.open_bus("/dev/i2c-9", 0x44).unwrap();
        let b = manager.open_bus("/dev/i2c-9", 0x45).unwrap();
        assert_eq!(a.handle(), b.handle());
        assert!(manager.is_address_in_use("/dev/i2c-9", 0x44));

        manager.close_bus("/dev/i2c-9", 0x44);
        assert!(manager.current_handle("/dev/i2c-9").is_some());
        manager.close_bus("/dev/i2c-9", 0x45);
        assert!(manager.current_handle("/dev/i2c-9").is_none());
    }

    #[test]
    fn duplicate_address_rejected() {
        let (_, manager) = manager();
        let _a = manager.open_bus("/dev/i2c-9", 0x44).unwrap();
        match manager.open_bus("/dev/i2c-9", 0x44) {
            Err(Error::AddressInUse { address: 0x44, .. }) => {}
            other => panic!("expected AddressInUse, got {:?}", other.map(|_| ())),
        }
        // The failed claim must not disturb the active set.
        assert!(manager.is_address_in_use("/dev/i2c-9", 0x44));
    }

    #[test]
    fn reopen_gets_fresh_handle() {
        let (_, manager) = manager();
        let first = manager.open_bus("/dev/i2c-9", 0x44).unwrap().handle();
        manager.close_bus("/dev/i2c-9", 0x44);
        let second = manager.open_bus("/dev/i2c-9", 0x44).unwrap().handle();
        assert_ne!(first, second);
    }

    #[test]
    fn lazy_address_switching() {
        let (mock, manager) = manager();
        let bus = manager.open_bus("/dev/i2c-9", 0x44).unwrap();
        mock.clear_ops();

        let mut txn = bus.txn();
        txn.select(0x44).unwrap();
        txn.select(0x44).unwrap();
        txn.select(0x45).unwrap();
        drop(txn);

        let switches = mock
            .ops()
            .iter()
            .filter(|op| op.is_switch())
            .count();
        // Opened at 0x44, so only the move to 0x45 reaches the kernel.
        assert_eq!(switches, 1);
    }

    #[test]
    fn force_close_invalidates_liveness() {
        let (_, manager) = manager();
        let bus = manager.open_bus("/dev/i2c-9", 0x44).unwrap();
        assert_eq!(manager.current_handle("/dev/i2c-9"), Some(bus.handle()));
        manager.force_close("/dev/i2c-9");
        assert_eq!(manager.current_handle("/dev/i2c-9"), None);
    }
}
