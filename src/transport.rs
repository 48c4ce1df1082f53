// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! Thin wrapper over the kernel I2C file interface.
//!
//! All operations are synchronous and carry no state beyond the handle;
//! serialization and sub-device bookkeeping live in [`crate::bus`].  The
//! trait exists so the test harness can substitute the in-memory simulator
//! from [`crate::mock`] for the kernel.

use crate::error::{Error, Result};

/// Handle to an open bus device node.  On Linux this is the raw file
/// descriptor; the mock hands out a monotonic counter.
pub type Handle = i32;

/// Lowest and highest assignable 7-bit device addresses.
pub const ADDRESS_MIN: u8 = 0x08;
pub const ADDRESS_MAX: u8 = 0x77;

pub(crate) fn check_address(address: u8) -> Result<()> {
    if !(ADDRESS_MIN..=ADDRESS_MAX).contains(&address) {
        return Err(Error::Argument(format!(
            "address {:#04x} outside the 7-bit device range [{:#04x}, {:#04x}]",
            address, ADDRESS_MIN, ADDRESS_MAX
        )));
    }
    Ok(())
}

/// Interface to one or more I2C bus device nodes.
///
/// Reads and writes apply to the sub-device most recently selected with
/// [`Transport::switch_address`] (or the address the handle was opened
/// with).  Callers are expected to serialize access per handle; the
/// transport itself performs no locking.
pub trait Transport: Send + Sync {
    /// Open the bus node read/write and assert the initial sub-device
    /// address.
    fn open(&self, path: &str, address: u8) -> Result<Handle>;

    fn close(&self, handle: Handle);

    /// Change the kernel-side selected sub-device.
    fn switch_address(&self, handle: Handle, address: u8) -> Result<()>;

    /// Set the adapter transaction timeout for subsequent operations.
    fn set_timeout_ms(&self, handle: Handle, timeout_ms: u64) -> Result<()>;

    fn smbus_write_byte(&self, handle: Handle, register: u8, value: u8) -> Result<()>;

    fn smbus_write_word(&self, handle: Handle, register: u8, value: u16) -> Result<()>;

    /// Read a 16-bit value; for byte-wise reads the low byte is the value
    /// of `register` and the high byte is whatever follows it.
    fn smbus_read_word(&self, handle: Handle, register: u8) -> Result<u16>;

    /// Read up to 32 bytes starting at `register`; returns the byte count
    /// the adapter actually transferred, which may be short.
    fn smbus_read_block(&self, handle: Handle, register: u8, buf: &mut [u8]) -> Result<usize>;

    /// Write one byte to the selected sub-device with no register prefix
    /// (multiplexer mask writes, SHT40 commands).
    fn raw_write_byte(&self, handle: Handle, value: u8) -> Result<()>;

    /// Read `buf.len()` bytes from the selected sub-device with no
    /// register prefix (SHT40 result fetch, multiplexer mask readback).
    fn raw_read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize>;

    /// Minimal transaction sufficient to elicit an ACK from a device at
    /// `address`.  Leaves `address` selected on the handle.
    fn probe(&self, handle: Handle, address: u8) -> bool;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::linux::LinuxTransport;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use super::*;
    use crate::ffi;
    use log::{debug, warn};
    use std::collections::HashMap;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read};
    use std::os::unix::prelude::*;
    use std::sync::Mutex;

    fn nix_to_io(e: nix::Error) -> io::Error {
        io::Error::from_raw_os_error(e as i32)
    }

    /// Production transport over /dev/i2c-N.
    ///
    /// Keeps the `File` for every open handle so register-less reads can
    /// go through plain read(2) while everything else uses the SMBus
    /// ioctl on the fd.
    pub struct LinuxTransport {
        files: Mutex<HashMap<Handle, File>>,
    }

    impl LinuxTransport {
        pub fn new() -> LinuxTransport {
            LinuxTransport {
                files: Mutex::new(HashMap::new()),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Handle, File>> {
            self.files.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

    impl Default for LinuxTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for LinuxTransport {
        fn open(&self, path: &str, address: u8) -> Result<Handle> {
            check_address(address)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| Error::transport("open", e))?;
            let fd = file.as_raw_fd();
            ffi::i2c_set_slave_address(fd, u16::from(address))
                .map_err(|e| Error::transport("set-slave-address", nix_to_io(e)))?;

            match ffi::i2c_get_functionality(fd) {
                Ok(funcs) => {
                    if !funcs.contains(
                        ffi::I2CFunctions::I2C_FUNC_SMBUS_WORD_DATA
                            | ffi::I2CFunctions::I2C_FUNC_SMBUS_READ_I2C_BLOCK,
                    ) {
                        warn!(
                            "{}: adapter lacks SMBus word/block transfers ({:?})",
                            path, funcs
                        );
                    }
                }
                Err(e) => warn!("{}: I2C_FUNCS query failed: {}", path, e),
            }

            debug!("{}: opened fd {} at {:#04x}", path, fd, address);
            self.lock().insert(fd, file);
            Ok(fd)
        }

        fn close(&self, handle: Handle) {
            if self.lock().remove(&handle).is_some() {
                debug!("closed fd {}", handle);
            }
        }

        fn switch_address(&self, handle: Handle, address: u8) -> Result<()> {
            check_address(address)?;
            ffi::i2c_set_slave_address(handle, u16::from(address))
                .map_err(|e| Error::transport("set-slave-address", nix_to_io(e)))
        }

        fn set_timeout_ms(&self, handle: Handle, timeout_ms: u64) -> Result<()> {
            ffi::i2c_set_timeout(handle, timeout_ms)
                .map_err(|e| Error::transport("set-timeout", nix_to_io(e)))
        }

        fn smbus_write_byte(&self, handle: Handle, register: u8, value: u8) -> Result<()> {
            ffi::i2c_smbus_write_byte_data(handle, register, value)
                .map_err(|e| Error::transport("write-byte", nix_to_io(e)))
        }

        fn smbus_write_word(&self, handle: Handle, register: u8, value: u16) -> Result<()> {
            ffi::i2c_smbus_write_word_data(handle, register, value)
                .map_err(|e| Error::transport("write-word", nix_to_io(e)))
        }

        fn smbus_read_word(&self, handle: Handle, register: u8) -> Result<u16> {
            ffi::i2c_smbus_read_word_data(handle, register)
                .map_err(|e| Error::transport("read-word", nix_to_io(e)))
        }

        fn smbus_read_block(&self, handle: Handle, register: u8, buf: &mut [u8]) -> Result<usize> {
            ffi::i2c_smbus_read_i2c_block_data(handle, register, buf)
                .map_err(|e| Error::transport("read-block", nix_to_io(e)))
        }

        fn raw_write_byte(&self, handle: Handle, value: u8) -> Result<()> {
            ffi::i2c_smbus_write_byte(handle, value)
                .map_err(|e| Error::transport("raw-write", nix_to_io(e)))
        }

        fn raw_read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
            let mut files = self.lock();
            let file = files.get_mut(&handle).ok_or(Error::BusClosed)?;
            file.read(buf).map_err(|e| Error::transport("raw-read", e))
        }

        fn probe(&self, handle: Handle, address: u8) -> bool {
            if ffi::i2c_set_slave_address(handle, u16::from(address)).is_err() {
                return false;
            }
            // Same etiquette as the i2cdetect utility: receive-byte in the
            // ranges where a quick-write can corrupt an EEPROM or confuse
            // an SCCB device, quick-write everywhere else.
            if matches!(address, 0x30..=0x37 | 0x50..=0x5f) {
                ffi::i2c_smbus_read_byte(handle).is_ok()
            } else {
                ffi::i2c_smbus_write_quick(handle).is_ok()
            }
        }
    }
}
