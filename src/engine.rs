//! The handshakes that open and close every AS511 operation.
//!
//! ```text
//! open:   PG STX          AG DLE ACK
//!         PG cmd          AG STX
//!         PG DLE ACK      AG status [STX if status == CR] DLE ETX
//!         PG DLE ACK
//!
//! close:  AG STX          PG DLE ACK
//!         AG rc ...       PG DLE ACK
//! ```
//!
//! Whatever an operation exchanges in between is its own business.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::frame::{ACK, CR, DC1, DC2, DC4, DLE, ETX, STX};
use crate::link::Link;
use crate::transport::Transport;
use crate::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// How the controller closed an operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseStatus {
    /// `DLE ETX`: done, nothing to report.
    Ok,
    /// `DC1`
    Dc1,
    /// `DC2`
    Dc2,
    /// `DC4`: the target block is not present.
    Dc4,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Immediate status meaning the controller refused the command.
pub const STATUS_REFUSED: u8 = CR;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl<T: Transport> Link<T> {
    /// Run the opening handshake for `command` and return the controller's
    /// immediate status byte. `0` means go ahead and [`STATUS_REFUSED`]
    /// means the controller will not do it in its current state. Other
    /// values are command-specific.
    pub fn begin_operation(&mut self, command: u8) -> Result<u8> {
        if self.verbosity().shows_protocol() {
            debug!("begin command {:02X}", command);
        }
        self.write_byte(STX)?;
        self.expect_pair(DLE, ACK)?;
        self.write_data_byte(command)?;
        self.expect(STX)?;
        self.ack()?;
        let status = self.read_any()?;
        if status == STATUS_REFUSED {
            self.expect(STX)?;
        }
        self.expect_pair(DLE, ETX)?;
        self.ack()?;
        if status != 0 && self.verbosity().shows_protocol() {
            debug!("command {:02X} status {:02X}", command, status);
        }
        Ok(status)
    }

    /// Run the closing handshake.
    pub fn end_operation(&mut self) -> Result<CloseStatus> {
        self.expect(STX)?;
        self.ack()?;
        let rc = self.read_any()?;
        let status = match rc {
            DLE => {
                let ch = self.read_any()?;
                if ch == ETX {
                    self.ack()?;
                    return Ok(CloseStatus::Ok);
                }
                // DLE followed by data: the controller still finishes with
                // DLE and one more byte.
                CloseStatus::Ok
            }
            DC1 => CloseStatus::Dc1,
            DC2 => CloseStatus::Dc2,
            DC4 => CloseStatus::Dc4,
            other => {
                if self.verbosity().shows_protocol() {
                    warn!("unexpected close status {:02X} from controller", other);
                }
                return Err(Error::UnexpectedByte {
                    expected: None,
                    got: other,
                });
            }
        };
        self.expect(DLE)?;
        self.read_any()?;
        self.ack()?;
        if self.verbosity().shows_protocol() {
            debug!("close status {:?}", status);
        }
        Ok(status)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
