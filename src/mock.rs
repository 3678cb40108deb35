//! In-memory transports and controller scripts for tests.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::Duration;

use crate::frame::{encode_payload, ACK, CR, DLE, ETX, STX};
use crate::transport::Transport;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Plays back the controller's side of a conversation and records what the
/// host sent. Running out of script looks like a silent controller.
pub struct MockTransport {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

/// Never answers. Each read sleeps for the full timeout first, like a real
/// port with nothing attached.
pub struct SilentTransport;

/// Builds the bytes a controller sends, one handshake at a time.
#[derive(Default)]
pub struct Script(Vec<u8>);

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl MockTransport {
    pub fn new(rx: &[u8]) -> MockTransport {
        MockTransport {
            rx: rx.iter().cloned().collect(),
            tx: Vec::new(),
        }
    }

    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    pub fn unread(&self) -> usize {
        self.rx.len()
    }
}

impl Transport for MockTransport {
    fn read_byte(&mut self, _timeout: Duration) -> io::Result<u8> {
        self.rx
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "script exhausted"))
    }

    fn write_byte(&mut self, byte: u8, _timeout: Duration) -> io::Result<()> {
        self.tx.push(byte);
        Ok(())
    }
}

impl Transport for SilentTransport {
    fn read_byte(&mut self, timeout: Duration) -> io::Result<u8> {
        thread::sleep(timeout);
        Err(io::Error::new(io::ErrorKind::TimedOut, "no answer"))
    }

    fn write_byte(&mut self, _byte: u8, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

impl Script {
    pub fn new() -> Script {
        Script::default()
    }

    /// Controller side of the opening handshake.
    pub fn open(mut self, status: u8) -> Script {
        self.0.extend_from_slice(&[DLE, ACK, STX, status]);
        if status == CR {
            self.0.push(STX);
        }
        self.0.extend_from_slice(&[DLE, ETX]);
        self
    }

    /// `DLE ACK`, as sent after the host's `DLE EOT` or `DLE ETX`.
    pub fn accept(mut self) -> Script {
        self.0.extend_from_slice(&[DLE, ACK]);
        self
    }

    /// A data frame: `STX`, escaped payload, `DLE ETX`.
    pub fn payload(mut self, data: &[u8]) -> Script {
        self.0.push(STX);
        self.0.extend(encode_payload(data));
        self
    }

    /// Closing handshake reporting success.
    pub fn close_ok(mut self) -> Script {
        self.0.extend_from_slice(&[STX, DLE, ETX]);
        self
    }

    /// Closing handshake reporting a soft status such as DC4.
    pub fn close_soft(mut self, code: u8) -> Script {
        self.0.extend_from_slice(&[STX, code, DLE, ETX]);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Script {
        self.0.extend_from_slice(bytes);
        self
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport::new(&self.0)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
