//! Byte framing for the AS511 link.
//!
//! Payload bytes go over the wire unchanged, except for DLE (0x10) which is
//! sent twice so the peer can tell it apart from the DLE that starts a
//! control pair. A variable-length payload ends with an unescaped DLE ETX.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use crate::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The `DataEncoder` takes payload bytes and gives you wire bytes.
///
/// Every DLE in the payload comes out twice. Encoders made with
/// [`DataEncoder::new`] finish with the DLE ETX terminator; those made with
/// [`DataEncoder::body`] stop after the last data byte.
pub struct DataEncoder<'a> {
    data: &'a [u8],
    count: usize,
    sent_escape: bool,
    terminate: bool,
}

/// The `PayloadDecoder` takes wire bytes and gives you the payload.
///
/// Feed it one byte at a time with `receive`. It returns `Ok(Some(..))` once
/// the DLE ETX terminator arrives. The decoder holds at most `capacity`
/// payload bytes.
pub struct PayloadDecoder {
    state: DecoderState,
    buffer: Vec<u8>,
    capacity: usize,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

pub const NUL: u8 = 0x00;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const HT: u8 = 0x09;
pub const CR: u8 = 0x0D;
pub const DLE: u8 = 0x10;
pub const DC1: u8 = 0x11;
pub const DC2: u8 = 0x12;
pub const DC4: u8 = 0x14;
pub const FS: u8 = 0x1C;

/// The largest single response a controller sends fits in this many bytes.
pub const MIN_SCRATCH_SIZE: usize = 65536;

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

enum DecoderState {
    Loading,
    Escape,
}

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl<'a> DataEncoder<'a> {
    /// Create an encoder which ends with DLE ETX.
    pub fn new(data: &'a [u8]) -> DataEncoder<'a> {
        DataEncoder {
            data,
            count: 0,
            sent_escape: false,
            terminate: true,
        }
    }

    /// Create an encoder for bytes that sit in the middle of a frame, with
    /// no terminator.
    pub fn body(data: &'a [u8]) -> DataEncoder<'a> {
        DataEncoder {
            terminate: false,
            ..DataEncoder::new(data)
        }
    }

    fn send_byte(&mut self, byte: u8) -> (usize, Option<u8>) {
        if byte == DLE {
            if self.sent_escape {
                self.sent_escape = false;
                (1, Some(DLE))
            } else {
                self.sent_escape = true;
                (0, Some(DLE))
            }
        } else {
            self.sent_escape = false;
            (1, Some(byte))
        }
    }
}

impl<'a> Iterator for DataEncoder<'a> {
    type Item = u8;

    /// Supply the next encoded byte. Once all the bytes have been emitted,
    /// it returns `None` forevermore.
    fn next(&mut self) -> Option<u8> {
        let len = self.data.len();
        let (inc, result) = match self.count {
            x if x < len => self.send_byte(self.data[x]),
            x if self.terminate && x == len => (1, Some(DLE)),
            x if self.terminate && x == len + 1 => (1, Some(ETX)),
            _ => (0, None),
        };
        self.count += inc;
        result
    }
}

impl PayloadDecoder {
    /// Create a new `PayloadDecoder` which holds up to `capacity` bytes.
    pub fn new(capacity: usize) -> PayloadDecoder {
        PayloadDecoder {
            state: DecoderState::Loading,
            buffer: Vec::new(),
            capacity,
        }
    }

    /// Drop any partial payload and forget a pending escape.
    pub fn reset(&mut self) {
        self.state = DecoderState::Loading;
        self.buffer.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Process one incoming byte.
    ///
    /// Returns `Ok(None)` while the payload is still arriving and
    /// `Ok(Some(payload))` when DLE ETX has been seen. Overrunning the
    /// capacity is an error.
    pub fn receive(&mut self, ch: u8) -> Result<Option<&[u8]>> {
        match self.state {
            DecoderState::Loading => {
                if ch == DLE {
                    self.state = DecoderState::Escape;
                } else {
                    self.load_char(ch)?;
                }
                Ok(None)
            }
            DecoderState::Escape => {
                self.state = DecoderState::Loading;
                if ch == ETX {
                    Ok(Some(&self.buffer))
                } else {
                    // DLE DLE is a literal DLE; DLE followed by anything else
                    // keeps that byte.
                    self.load_char(ch)?;
                    Ok(None)
                }
            }
        }
    }

    fn load_char(&mut self, ch: u8) -> Result<()> {
        if self.buffer.len() >= self.capacity {
            return Err(Error::decode(format!(
                "payload exceeds {} byte scratch area",
                self.capacity
            )));
        }
        self.buffer.push(ch);
        Ok(())
    }
}

/// Escape `data` and append the DLE ETX terminator.
pub fn encode_payload(data: &[u8]) -> Vec<u8> {
    DataEncoder::new(data).collect()
}

/// Undo `encode_payload`. Bytes after the terminator are ignored.
pub fn decode_payload(wire: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = PayloadDecoder::new(wire.len());
    for &ch in wire {
        if let Some(payload) = decoder.receive(ch)? {
            return Ok(payload.to_vec());
        }
    }
    Err(Error::decode("payload not terminated by DLE ETX"))
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
