//! The byte channel underneath an AS511 session.
//!
//! The protocol engine only ever moves one byte at a time, each bounded by
//! the session timeout. Anything that can do that can carry a session: the
//! serial port on a real programming cable, or an in-memory script in tests.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::io;
use std::time::Duration;

#[cfg(feature = "serial")]
use std::io::{Read, Write};

#[cfg(feature = "serial")]
use crate::config::SessionConfig;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// A duplex byte channel to a controller.
pub trait Transport {
    /// Wait up to `timeout` for one byte from the controller.
    ///
    /// # Errors
    ///
    /// An error of kind [`io::ErrorKind::TimedOut`] (or `WouldBlock`) means
    /// nothing arrived in time. Any other error is a channel failure.
    fn read_byte(&mut self, timeout: Duration) -> io::Result<u8>;

    /// Wait up to `timeout` for the channel to accept `byte`.
    fn write_byte(&mut self, byte: u8, timeout: Duration) -> io::Result<()>;
}

/// A [`Transport`] over a local serial port, configured for AS511: 9600 baud,
/// 8 data bits, even parity, 2 stop bits, no flow control.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    timeout: Duration,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// The only line speed the programming port supports.
pub const AS511_BAUD_RATE: u32 = 9600;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

#[cfg(feature = "serial")]
impl SerialTransport {
    /// Open and configure the serial port named in `config`.
    pub fn open(config: &SessionConfig) -> io::Result<SerialTransport> {
        if config.baud_rate != AS511_BAUD_RATE {
            warn!(
                "{}: opening at {} baud, the programming port expects {}",
                config.port, config.baud_rate, AS511_BAUD_RATE
            );
        }
        let timeout = config.timeout();
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::Two)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(io::Error::from)?;
        if config.verbosity.shows_system() {
            info!("{}: opened at {} baud, 8E2", config.port, config.baud_rate);
        }
        Ok(SerialTransport { port, timeout })
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout).map_err(io::Error::from)?;
            self.timeout = timeout;
        }
        Ok(())
    }
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn read_byte(&mut self, timeout: Duration) -> io::Result<u8> {
        self.set_timeout(timeout)?;
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, byte: u8, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout)?;
        self.port.write_all(&[byte])?;
        self.port.flush()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_byte(&mut self, timeout: Duration) -> io::Result<u8> {
        (**self).read_byte(timeout)
    }

    fn write_byte(&mut self, byte: u8, timeout: Duration) -> io::Result<()> {
        (**self).write_byte(byte, timeout)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
