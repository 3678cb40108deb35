//! Byte-level primitives shared by every AS511 operation.
//!
//! A `Link` owns the transport, the per-byte timeout and the receive
//! scratch area. Every primitive returns `Err` as soon as anything goes
//! wrong, so an operation built from them stops at the first failure.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::io;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{SessionConfig, Verbosity};
use crate::frame::{DataEncoder, PayloadDecoder, ACK, DLE, EOT, ETX, STX};
use crate::transport::Transport;
use crate::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The protocol's view of the channel.
pub struct Link<T: Transport> {
    transport: T,
    timeout: Duration,
    verbosity: Verbosity,
    decoder: PayloadDecoder,
}

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl<T: Transport> Link<T> {
    pub fn new(transport: T, config: &SessionConfig) -> Link<T> {
        Link {
            transport,
            timeout: config.timeout(),
            verbosity: config.verbosity,
            decoder: PayloadDecoder::new(config.scratch_size),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    /// Give back the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Read one byte, whatever it is.
    pub fn read_any(&mut self) -> Result<u8> {
        match self.transport.read_byte(self.timeout) {
            Ok(ch) => {
                if self.verbosity.shows_wire() {
                    trace!("\tAG -> PG {:02X}", ch);
                }
                Ok(ch)
            }
            Err(e) => Err(self.read_error(e)),
        }
    }

    /// Read one byte and fail unless it is `expected`.
    pub fn expect(&mut self, expected: u8) -> Result<u8> {
        let ch = self.read_any()?;
        if ch != expected {
            if self.verbosity.shows_protocol() {
                warn!("read {:02X} instead of {:02X}", ch, expected);
            }
            return Err(Error::UnexpectedByte {
                expected: Some(expected),
                got: ch,
            });
        }
        Ok(ch)
    }

    /// Read the two bytes of a control pair, e.g. `DLE ACK`.
    pub fn expect_pair(&mut self, first: u8, second: u8) -> Result<()> {
        self.expect(first)?;
        self.expect(second)?;
        Ok(())
    }

    /// Write one byte exactly as given.
    pub fn write_byte(&mut self, ch: u8) -> Result<()> {
        match self.transport.write_byte(ch, self.timeout) {
            Ok(()) => {
                if self.verbosity.shows_wire() {
                    trace!("PG -> AG {:02X}", ch);
                }
                Ok(())
            }
            Err(e) => Err(self.write_error(e)),
        }
    }

    /// Write a control pair, e.g. `DLE ACK`.
    pub fn write_pair(&mut self, first: u8, second: u8) -> Result<()> {
        self.write_byte(first)?;
        self.write_byte(second)
    }

    /// Write a payload byte. DLE goes out twice.
    pub fn write_data_byte(&mut self, ch: u8) -> Result<()> {
        self.write_data(&[ch])
    }

    /// Write payload bytes, doubling every DLE.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        for ch in DataEncoder::body(data) {
            self.write_byte(ch)?;
        }
        Ok(())
    }

    /// Read a payload up to its DLE ETX terminator and copy it out of the
    /// scratch area.
    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        self.decoder.reset();
        loop {
            let ch = self.read_any()?;
            if let Some(payload) = self.decoder.receive(ch)? {
                return Ok(payload.to_vec());
            }
        }
    }

    /// Acknowledge a controller frame with `DLE ACK`.
    pub fn ack(&mut self) -> Result<()> {
        self.write_pair(DLE, ACK)
    }

    /// Tell the controller the request is complete: `DLE EOT`, answered by
    /// `DLE ACK`.
    pub fn request_end(&mut self) -> Result<()> {
        self.write_pair(DLE, EOT)?;
        self.expect_pair(DLE, ACK)
    }

    /// Accept a data frame from the controller: `STX`, acknowledged, then the
    /// payload, acknowledged again.
    pub fn receive_payload(&mut self) -> Result<Vec<u8>> {
        self.expect(STX)?;
        self.ack()?;
        let payload = self.read_payload()?;
        self.ack()?;
        Ok(payload)
    }

    /// Accept a frame whose body is fixed: `STX`, acknowledged, the given
    /// bytes, `DLE ETX`, acknowledged.
    pub fn receive_fixed(&mut self, body: &[u8]) -> Result<()> {
        self.expect(STX)?;
        self.ack()?;
        for &ch in body {
            self.expect(ch)?;
        }
        self.expect_pair(DLE, ETX)?;
        self.ack()
    }

    /// Send one of the unframed online requests (`0x80` start, `0x81` stop)
    /// used by the live status and output functions.
    pub fn online_request(&mut self, code: u8) -> Result<()> {
        self.write_byte(STX)?;
        self.expect_pair(DLE, ACK)?;
        self.write_byte(code)?;
        self.write_pair(DLE, ETX)?;
        self.expect_pair(DLE, ACK)
    }

    /// Same as [`Link::online_request`], but the code goes out as payload.
    pub fn online_data_request(&mut self, code: u8) -> Result<()> {
        self.write_byte(STX)?;
        self.expect_pair(DLE, ACK)?;
        self.write_data_byte(code)?;
        self.write_pair(DLE, ETX)?;
        self.expect_pair(DLE, ACK)
    }

    // ************************************************************************
    // Private
    // ************************************************************************

    fn read_error(&self, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                if self.verbosity.shows_protocol() {
                    warn!("controller timeout after {:?} waiting to read", self.timeout);
                }
                Error::Timeout
            }
            _ => {
                error!("read failed: {}", e);
                Error::Io(e)
            }
        }
    }

    fn write_error(&self, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                if self.verbosity.shows_protocol() {
                    warn!("controller timeout after {:?} waiting to write", self.timeout);
                }
                Error::Timeout
            }
            _ => {
                error!("write failed: {}", e);
                Error::Io(e)
            }
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
