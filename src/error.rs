// Copyright 2024, the i2chub developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

use std::io;

/// Error that occurred while performing an I2C operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel interface returned an error (EIO, ENXIO, EREMOTEIO, ...).
    ///
    /// This is the only kind that triggers sensor-level recovery; protocol
    /// timeouts and integrity failures are handled without touching the
    /// device state machine.
    #[error("i2c transport failure during {op}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A device did not reach the expected state within its time budget
    /// (AVALID, SMUX load, SHT40 measurement).
    #[error("protocol timeout waiting for {0}")]
    Timeout(&'static str),

    /// An SHT40 data word failed its CRC-8 check.
    #[error("crc mismatch: computed {computed:#04x}, received {received:#04x}")]
    CrcMismatch { computed: u8, received: u8 },

    /// The file handle for this bus was closed or replaced by another
    /// component between operations.
    #[error("bus handle is closed")]
    BusClosed,

    /// Illegal channel number, address out of range, ATIME and ASTEP both
    /// zero, and similar caller mistakes.  Never retried.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// `open_bus` was asked to claim an address that another driver on the
    /// same bus already holds.  Never retried.
    #[error("address {address:#04x} already in use on {path}")]
    AddressInUse { path: String, address: u8 },
}

/// Result of an I2C operation.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn transport(op: &'static str, source: io::Error) -> Error {
        Error::Transport { op, source }
    }

    /// True for failures of the wire itself, as opposed to protocol-level
    /// conditions.  The spectral drivers consult this to decide whether a
    /// failed read should enter the recovery ladder.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::BusClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let e = Error::transport("read", io::Error::from_raw_os_error(libc::EIO));
        assert!(e.is_transport());
        assert!(Error::BusClosed.is_transport());
        assert!(!Error::Timeout("AVALID").is_transport());
        assert!(!Error::Argument("channel 9".into()).is_transport());
        assert!(!Error::CrcMismatch { computed: 0, received: 1 }.is_transport());
    }
}
