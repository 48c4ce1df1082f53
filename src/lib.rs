// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! # i2chub
//!
//! The `i2chub` crate coordinates concurrent access to I2C sensor buses
//! under Linux.  It wraps the kernel i2c-dev interface
//! (https://www.kernel.org/doc/Documentation/i2c/dev-interface) with a
//! process-wide bus registry, drives an optional 8-channel analog switch
//! that re-maps sensors onto the shared 7-bit address space, and runs a
//! low-priority polling loop per bus that discovers, initializes, reads,
//! and recovers the sensors it finds.
//!
//! The latest reading of every sensor is published into a snapshot map
//! keyed by `bus-path:channel:address`; consumers take point-in-time
//! copies through [`busloop::BusLoop::get_all_sensor_state`].
//!
//! Supported devices: the AS7341 and AS7343 spectral sensors, the SHT40
//! temperature/humidity sensor, and TCA9548-family channel switches.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod ffi;

pub mod bus;
pub mod busloop;
pub mod detect;
pub mod error;
pub mod mock;
pub mod mux;
pub mod sensor;
pub mod sensors;
pub mod transport;

pub use crate::bus::BusManager;
pub use crate::busloop::{BusLoop, LoopConfig};
pub use crate::detect::{DetectResult, I2CDetect, ScanConfig};
pub use crate::error::{Error, Result};
pub use crate::sensors::{DriverKind, SensorData, SensorState};
