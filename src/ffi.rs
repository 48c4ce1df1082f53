// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

#![allow(non_camel_case_types)]

use byteorder::{ByteOrder, NativeEndian};
use nix::{ioctl_read_bad, ioctl_write_int_bad, ioctl_write_ptr_bad};
use std::mem;
use std::os::unix::prelude::*;
use std::ptr;

pub type I2CError = nix::Error;

bitflags::bitflags! {
    /// Adapter functionality bits reported by the I2C_FUNCS ioctl.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct I2CFunctions: u32 {
        const I2C_FUNC_I2C = 0x0000_0001;
        const I2C_FUNC_10BIT_ADDR = 0x0000_0002;
        const I2C_FUNC_PROTOCOL_MANGLING = 0x0000_0004; /* I2C_M_IGNORE_NAK etc. */
        const I2C_FUNC_SMBUS_PEC = 0x0000_0008;
        const I2C_FUNC_SMBUS_QUICK = 0x0001_0000;
        const I2C_FUNC_SMBUS_READ_BYTE = 0x0002_0000;
        const I2C_FUNC_SMBUS_WRITE_BYTE = 0x0004_0000;
        const I2C_FUNC_SMBUS_READ_BYTE_DATA = 0x0008_0000;
        const I2C_FUNC_SMBUS_WRITE_BYTE_DATA = 0x0010_0000;
        const I2C_FUNC_SMBUS_READ_WORD_DATA = 0x0020_0000;
        const I2C_FUNC_SMBUS_WRITE_WORD_DATA = 0x0040_0000;
        const I2C_FUNC_SMBUS_READ_I2C_BLOCK = 0x0400_0000; /* I2C-like block xfer  */
        const I2C_FUNC_SMBUS_WRITE_I2C_BLOCK = 0x0800_0000; /* w/ 1-byte reg. addr. */

        const I2C_FUNC_SMBUS_BYTE = Self::I2C_FUNC_SMBUS_READ_BYTE.bits()
            | Self::I2C_FUNC_SMBUS_WRITE_BYTE.bits();
        const I2C_FUNC_SMBUS_BYTE_DATA = Self::I2C_FUNC_SMBUS_READ_BYTE_DATA.bits()
            | Self::I2C_FUNC_SMBUS_WRITE_BYTE_DATA.bits();
        const I2C_FUNC_SMBUS_WORD_DATA = Self::I2C_FUNC_SMBUS_READ_WORD_DATA.bits()
            | Self::I2C_FUNC_SMBUS_WRITE_WORD_DATA.bits();
        const I2C_FUNC_SMBUS_I2C_BLOCK = Self::I2C_FUNC_SMBUS_READ_I2C_BLOCK.bits()
            | Self::I2C_FUNC_SMBUS_WRITE_I2C_BLOCK.bits();
    }
}

/// As specified in SMBus standard
pub const I2C_SMBUS_BLOCK_MAX: usize = 32;

// union i2c_smbus_data {
//     __u8 byte;
//     __u16 word;
//     __u8 block[I2C_SMBUS_BLOCK_MAX + 2]; /* block[0] is used for length */
//                            /* and one more for user-space compatibility */
// };
#[repr(C)]
struct i2c_smbus_data {
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

impl i2c_smbus_data {
    fn empty() -> i2c_smbus_data {
        unsafe { mem::zeroed() }
    }
}

#[repr(u8)]
enum I2CSMBusReadWrite {
    I2C_SMBUS_READ = 1,
    I2C_SMBUS_WRITE = 0,
}

#[repr(u32)]
enum I2CSMBusSize {
    I2C_SMBUS_QUICK = 0,
    I2C_SMBUS_BYTE = 1,
    I2C_SMBUS_BYTE_DATA = 2,
    I2C_SMBUS_WORD_DATA = 3,
    I2C_SMBUS_I2C_BLOCK_DATA = 8,
}

// from include/uapi/linux/i2c-dev.h
const I2C_TIMEOUT: u16 = 0x0702;
const I2C_SLAVE: u16 = 0x0703;
const I2C_FUNCS: u16 = 0x0705;
const I2C_SMBUS: u16 = 0x0720;

/// This is the structure as used in the I2C_SMBUS ioctl call
#[repr(C)]
pub struct i2c_smbus_ioctl_data {
    // __u8 read_write;
    read_write: u8,
    // __u8 command;
    command: u8,
    // __u32 size;
    size: u32,
    // union i2c_smbus_data __user *data;
    data: *mut i2c_smbus_data,
}

mod ioctl {
    pub use super::i2c_smbus_ioctl_data;
    use super::*;

    ioctl_write_int_bad!(set_i2c_slave_address, I2C_SLAVE);
    ioctl_write_int_bad!(set_i2c_timeout, I2C_TIMEOUT);
    ioctl_read_bad!(i2c_get_funcs, I2C_FUNCS, libc::c_ulong);
    ioctl_write_ptr_bad!(i2c_smbus, I2C_SMBUS, i2c_smbus_ioctl_data);
}

pub fn i2c_set_slave_address(fd: RawFd, slave_address: u16) -> Result<(), I2CError> {
    unsafe {
        ioctl::set_i2c_slave_address(fd, i32::from(slave_address))?;
    }
    Ok(())
}

/// Set the adapter transaction timeout.  The kernel takes units of 10 ms.
pub fn i2c_set_timeout(fd: RawFd, timeout_ms: u64) -> Result<(), I2CError> {
    let units = (timeout_ms / 10).max(1) as i32;
    unsafe {
        ioctl::set_i2c_timeout(fd, units)?;
    }
    Ok(())
}

pub fn i2c_get_functionality(fd: RawFd) -> Result<I2CFunctions, I2CError> {
    let mut funcs: libc::c_ulong = 0;
    unsafe {
        ioctl::i2c_get_funcs(fd, &mut funcs)?;
    }
    Ok(I2CFunctions::from_bits_truncate(funcs as u32))
}

unsafe fn i2c_smbus_access(
    fd: RawFd,
    read_write: I2CSMBusReadWrite,
    command: u8, // can be address or something else
    size: I2CSMBusSize,
    data: *mut i2c_smbus_data,
) -> Result<(), I2CError> {
    let args = i2c_smbus_ioctl_data {
        read_write: read_write as u8,
        command,
        size: size as u32,
        data,
    };

    // remove type information
    ioctl::i2c_smbus(fd, &args).map(drop)
}

/// A quick-write probe: addresses the device and sends a single Wr bit.
#[inline]
pub fn i2c_smbus_write_quick(fd: RawFd) -> Result<(), I2CError> {
    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_WRITE,
            0,
            I2CSMBusSize::I2C_SMBUS_QUICK,
            ptr::null_mut(),
        )
    }
}

/// Receive one byte from the currently addressed device, no register.
#[inline]
pub fn i2c_smbus_read_byte(fd: RawFd) -> Result<u8, I2CError> {
    let mut data = i2c_smbus_data::empty();
    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_READ,
            0,
            I2CSMBusSize::I2C_SMBUS_BYTE,
            &mut data,
        )?
    }
    Ok(data.block[0])
}

/// Send one byte to the currently addressed device, no register prefix.
#[inline]
pub fn i2c_smbus_write_byte(fd: RawFd, value: u8) -> Result<(), I2CError> {
    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_WRITE,
            value,
            I2CSMBusSize::I2C_SMBUS_BYTE,
            ptr::null_mut(),
        )
    }
}

#[inline]
pub fn i2c_smbus_write_byte_data(fd: RawFd, register: u8, value: u8) -> Result<(), I2CError> {
    let mut data = i2c_smbus_data::empty();
    data.block[0] = value;
    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_WRITE,
            register,
            I2CSMBusSize::I2C_SMBUS_BYTE_DATA,
            &mut data,
        )
    }
}

#[inline]
pub fn i2c_smbus_read_word_data(fd: RawFd, register: u8) -> Result<u16, I2CError> {
    let mut data = i2c_smbus_data::empty();
    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_READ,
            register,
            I2CSMBusSize::I2C_SMBUS_WORD_DATA,
            &mut data,
        )?;
    };

    Ok(NativeEndian::read_u16(&data.block[..2]))
}

#[inline]
pub fn i2c_smbus_write_word_data(fd: RawFd, register: u8, value: u16) -> Result<(), I2CError> {
    let mut data = i2c_smbus_data::empty();
    NativeEndian::write_u16(&mut data.block[..2], value);

    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_WRITE,
            register,
            I2CSMBusSize::I2C_SMBUS_WORD_DATA,
            &mut data,
        )
    }
}

/// Read up to 32 bytes starting at `register` via
/// i2c_smbus_read_i2c_block_data.  Returns the count the adapter reports.
pub fn i2c_smbus_read_i2c_block_data(
    fd: RawFd,
    register: u8,
    buf: &mut [u8],
) -> Result<usize, I2CError> {
    let len = buf.len().min(I2C_SMBUS_BLOCK_MAX);
    let mut data = i2c_smbus_data::empty();
    data.block[0] = len as u8;
    unsafe {
        i2c_smbus_access(
            fd,
            I2CSMBusReadWrite::I2C_SMBUS_READ,
            register,
            I2CSMBusSize::I2C_SMBUS_I2C_BLOCK_DATA,
            &mut data,
        )?;
    }

    // block[0] holds the count actually transferred; the payload follows
    let count = (data.block[0] as usize).min(len);
    buf[..count].copy_from_slice(&data.block[1..count + 1]);
    Ok(count)
}
