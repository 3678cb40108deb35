//! Decoders for the records an S5 controller sends back.
//!
//! Every reply starts with one or more bytes that carry no information for
//! the caller (a leading NUL for most reads, a five byte echo for memory
//! reads). The `decode` functions here take the whole reply, drop those
//! bytes, and convert every multi-byte field from big-endian. Nothing here
//! keeps a reference into the reply.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::fmt;
use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};

use crate::identify::NAME_OFFSET;
use crate::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The kinds of program and data block a controller stores.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum BlockType {
    /// Data block
    Db,
    /// Sequence block
    Sb,
    /// Program block
    Pb,
    /// Extended function block
    Fx,
    /// Function block
    Fb,
    /// Extended data block
    Dx,
    /// Organisation block
    Ob,
}

/// The ten byte header in front of every block.
///
/// ```text
/// +0  0x70 0x70        sync
/// +2  vvtttttt         t = type code, v = validity
/// +3  number
/// +4  programmer id    0x80
/// +5  library number   3 bytes
/// +8  length           words, header included, big-endian
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct BlockHeader {
    pub sync: [u8; 2],
    pub type_byte: u8,
    pub number: u8,
    pub pg_id: u8,
    pub library: [u8; 3],
    pub length_words: u16,
}

/// A block: header plus body. The body length always agrees with the
/// header's word count.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Block {
    header: BlockHeader,
    body: Vec<u8>,
}

/// Where things live in a controller's memory, and what the controller is.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct SystemParameters {
    /// Input signal formers
    pub esf_address: u16,
    /// Output signal formers
    pub asf_address: u16,
    /// Process image of the inputs
    pub pae_address: u16,
    /// Process image of the outputs
    pub paa_address: u16,
    pub flag_address: u16,
    pub timer_address: u16,
    pub counter_address: u16,
    pub system_data: u16,
    pub status_id: u8,
    pub sw_version: u8,
    pub end_ram: u16,
    pub system_prog_ram: u16,
    pub db_table_len: u16,
    pub sb_table_len: u16,
    pub pb_table_len: u16,
    pub fb_table_len: u16,
    pub ob_table_len: u16,
    pub fx_table_len: u16,
    pub dx_table_len: u16,
    pub db0_table_len: u16,
    pub slot_id: u8,
    pub cpu_id2: u8,
    pub block_header_len: u16,
    pub cpu_id: u8,
    pub reserved: u8,
    pub reserved_words: [u16; 3],
}

/// Where a block sits in controller RAM, and its header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ModuleInfo {
    pub ram_address: u16,
    pub header: BlockHeader,
}

/// Bounds of the user program memory.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RamInfo {
    pub start_ram: u16,
    pub begin_free_ram: u16,
    pub end_ram: u16,
}

/// Bytes read from controller memory.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemorySnapshot {
    pub address: u32,
    pub data: Vec<u8>,
}

/// One entry of the block call stack.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CallFrame {
    pub block_number: u16,
    pub return_address: u16,
}

/// The block call stack, innermost call last.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CallStack {
    pub frames: Vec<CallFrame>,
}

/// The interrupt stack, as raw bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct InterruptStack {
    pub data: Vec<u8>,
}

/// Start addresses of every block of one type, indexed by block number.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AddressTable {
    pub block_type: BlockType,
    pub addresses: Vec<u16>,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

pub const HEADER_SIZE: usize = 10;

/// The value of both sync bytes in a block header.
pub const BLOCK_SYNC: u8 = 0x70;

/// Programmer id written into headers built on the host.
pub const PG_ID: u8 = 0x80;

/// Flag added to a block type code for the TB variants.
pub const TB_FLAG: u8 = 0x20;

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const REPLY_SKIP: usize = 1;
const SYSPAR_MIN_LEN: usize = 44;
const SYSPAR_LEN: usize = 50;
const MODULE_INFO_LEN: usize = 2 + HEADER_SIZE;
const RAM_INFO_LEN: usize = 4;
const CALL_FRAME_LEN: usize = 4;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl BlockType {
    /// The code used on the wire and in headers.
    pub fn code(self) -> u8 {
        match self {
            BlockType::Db => 0x01,
            BlockType::Sb => 0x02,
            BlockType::Pb => 0x04,
            BlockType::Fx => 0x05,
            BlockType::Fb => 0x08,
            BlockType::Dx => 0x0C,
            BlockType::Ob => 0x10,
        }
    }

    /// Look up a type code. The TB flag is ignored.
    pub fn from_code(code: u8) -> Option<BlockType> {
        match code & !TB_FLAG {
            0x01 => Some(BlockType::Db),
            0x02 => Some(BlockType::Sb),
            0x04 => Some(BlockType::Pb),
            0x05 => Some(BlockType::Fx),
            0x08 => Some(BlockType::Fb),
            0x0C => Some(BlockType::Dx),
            0x10 => Some(BlockType::Ob),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BlockType::Db => "DB",
            BlockType::Sb => "SB",
            BlockType::Pb => "PB",
            BlockType::Fx => "FX",
            BlockType::Fb => "FB",
            BlockType::Dx => "DX",
            BlockType::Ob => "OB",
        }
    }
}

impl TryFrom<u8> for BlockType {
    type Error = Error;

    fn try_from(code: u8) -> Result<BlockType> {
        BlockType::from_code(code)
            .ok_or_else(|| Error::bad_parameter(format!("unknown block type {:#04X}", code)))
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl BlockHeader {
    /// A fresh header for a block built on the host.
    pub fn new(block_type: BlockType, number: u8, length_words: u16) -> BlockHeader {
        BlockHeader {
            sync: [BLOCK_SYNC, BLOCK_SYNC],
            type_byte: block_type.code(),
            number,
            pg_id: PG_ID,
            library: [0; 3],
            length_words,
        }
    }

    /// Parse the first ten bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<BlockHeader> {
        if data.len() < HEADER_SIZE {
            return Err(Error::decode(format!(
                "block header needs {} bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        Ok(BlockHeader {
            sync: [data[0], data[1]],
            type_byte: data[2],
            number: data[3],
            pg_id: data[4],
            library: [data[5], data[6], data[7]],
            length_words: BigEndian::read_u16(&data[8..10]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.sync);
        out[2] = self.type_byte;
        out[3] = self.number;
        out[4] = self.pg_id;
        out[5..8].copy_from_slice(&self.library);
        BigEndian::write_u16(&mut out[8..10], self.length_words);
        out
    }

    /// Low six bits of the type byte.
    pub fn type_code(&self) -> u8 {
        self.type_byte & 0x3F
    }

    /// High two bits of the type byte.
    pub fn validity(&self) -> u8 {
        self.type_byte >> 6
    }

    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_code(self.type_code())
    }

    pub fn is_tb(&self) -> bool {
        self.type_code() & TB_FLAG != 0
    }

    pub fn has_sync(&self) -> bool {
        self.sync == [BLOCK_SYNC, BLOCK_SYNC]
    }

    /// Total block size in bytes, header included.
    pub fn total_len(&self) -> usize {
        usize::from(self.length_words) * 2
    }

    /// Body size in bytes. A word count smaller than the header is an error.
    pub fn body_len(&self) -> Result<usize> {
        self.total_len().checked_sub(HEADER_SIZE).ok_or_else(|| {
            Error::decode(format!(
                "block length of {} words is shorter than its header",
                self.length_words
            ))
        })
    }
}

impl Block {
    /// Build a block from its code. `body` must hold whole words.
    pub fn new(block_type: BlockType, number: u8, body: Vec<u8>) -> Result<Block> {
        if body.len() % 2 != 0 {
            return Err(Error::bad_parameter("block body must be a whole number of words"));
        }
        let words = (body.len() + HEADER_SIZE) / 2;
        let length_words = u16::try_from(words)
            .map_err(|_| Error::bad_parameter("block body too large"))?;
        Ok(Block {
            header: BlockHeader::new(block_type, number, length_words),
            body,
        })
    }

    /// Decode a read-block reply. A reply with nothing after the leading
    /// byte means the block does not exist.
    pub fn decode(reply: &[u8]) -> Result<Block> {
        if reply.len() <= REPLY_SKIP {
            return Err(Error::ModuleAbsent);
        }
        let (block, _) = Block::parse_prefix(&reply[REPLY_SKIP..])?;
        Ok(block)
    }

    /// Parse a block image (header followed by body), as produced by
    /// [`Block::to_image`]. Trailing bytes are an error.
    pub fn from_image(image: &[u8]) -> Result<Block> {
        let (block, used) = Block::parse_prefix(image)?;
        if used != image.len() {
            return Err(Error::decode(format!(
                "block image has {} bytes after the block",
                image.len() - used
            )));
        }
        Ok(block)
    }

    /// Read a block image from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Block> {
        let mut image = Vec::new();
        reader.read_to_end(&mut image)?;
        Block::from_image(&image)
    }

    /// Header then body, ready to save or to send.
    pub fn to_image(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(HEADER_SIZE + self.body.len());
        image.extend_from_slice(&self.header.encode());
        image.extend_from_slice(&self.body);
        image
    }

    /// Write the block image with a single write call. A short write is
    /// reported rather than retried.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let image = self.to_image();
        let written = writer.write(&image)?;
        if written != image.len() {
            return Err(Error::PartialWrite {
                expected: image.len(),
                written,
            });
        }
        Ok(written)
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn block_type(&self) -> Option<BlockType> {
        self.header.block_type()
    }

    pub fn number(&self) -> u8 {
        self.header.number
    }

    fn parse_prefix(data: &[u8]) -> Result<(Block, usize)> {
        let header = BlockHeader::parse(data)?;
        if !header.has_sync() {
            return Err(Error::decode(format!(
                "block starts {:02X} {:02X} instead of the sync bytes",
                header.sync[0], header.sync[1]
            )));
        }
        let body_len = header.body_len()?;
        let end = HEADER_SIZE + body_len;
        if data.len() < end {
            return Err(Error::decode(format!(
                "block declares {} body bytes, only {} received",
                body_len,
                data.len() - HEADER_SIZE
            )));
        }
        let block = Block {
            header,
            body: data[HEADER_SIZE..end].to_vec(),
        };
        Ok((block, end))
    }
}

impl SystemParameters {
    /// Decode a read-system-parameters reply.
    pub fn decode(reply: &[u8]) -> Result<SystemParameters> {
        let record = reply.get(REPLY_SKIP..).unwrap_or(&[]);
        SystemParameters::parse(record)
    }

    /// Parse the record itself, in wire order.
    pub fn parse(record: &[u8]) -> Result<SystemParameters> {
        if record.len() < SYSPAR_MIN_LEN {
            return Err(Error::decode(format!(
                "system parameters need {} bytes, got {}",
                SYSPAR_MIN_LEN,
                record.len()
            )));
        }
        let word = |offset: usize| BigEndian::read_u16(&record[offset..offset + 2]);
        let tail = |offset: usize| {
            if record.len() >= offset + 2 {
                BigEndian::read_u16(&record[offset..offset + 2])
            } else {
                0
            }
        };
        Ok(SystemParameters {
            esf_address: word(0),
            asf_address: word(2),
            pae_address: word(4),
            paa_address: word(6),
            flag_address: word(8),
            timer_address: word(10),
            counter_address: word(12),
            system_data: word(14),
            status_id: record[16],
            sw_version: record[17],
            end_ram: word(18),
            system_prog_ram: word(20),
            db_table_len: word(22),
            sb_table_len: word(24),
            pb_table_len: word(26),
            fb_table_len: word(28),
            ob_table_len: word(30),
            fx_table_len: word(32),
            dx_table_len: word(34),
            db0_table_len: word(36),
            slot_id: record[38],
            cpu_id2: record[39],
            block_header_len: word(40),
            cpu_id: record[42],
            reserved: record[43],
            reserved_words: [tail(44), tail(46), tail(48)],
        })
    }

    /// The record in wire order.
    pub fn encode(&self) -> [u8; SYSPAR_LEN] {
        let mut out = [0u8; SYSPAR_LEN];
        BigEndian::write_u16_into(
            &[
                self.esf_address,
                self.asf_address,
                self.pae_address,
                self.paa_address,
                self.flag_address,
                self.timer_address,
                self.counter_address,
                self.system_data,
            ],
            &mut out[0..16],
        );
        out[16] = self.status_id;
        out[17] = self.sw_version;
        BigEndian::write_u16_into(
            &[
                self.end_ram,
                self.system_prog_ram,
                self.db_table_len,
                self.sb_table_len,
                self.pb_table_len,
                self.fb_table_len,
                self.ob_table_len,
                self.fx_table_len,
                self.dx_table_len,
                self.db0_table_len,
            ],
            &mut out[18..38],
        );
        out[38] = self.slot_id;
        out[39] = self.cpu_id2;
        BigEndian::write_u16(&mut out[40..42], self.block_header_len);
        out[42] = self.cpu_id;
        out[43] = self.reserved;
        BigEndian::write_u16_into(&self.reserved_words, &mut out[44..50]);
        out
    }

    /// Length in bytes of the address table for `block_type`.
    pub fn address_table_len(&self, block_type: BlockType) -> u16 {
        match block_type {
            BlockType::Db => self.db_table_len,
            BlockType::Sb => self.sb_table_len,
            BlockType::Pb => self.pb_table_len,
            BlockType::Fb => self.fb_table_len,
            BlockType::Ob => self.ob_table_len,
            BlockType::Fx => self.fx_table_len,
            BlockType::Dx => self.dx_table_len,
        }
    }

    /// Where the controller keeps its identification string.
    pub fn name_address(&self) -> u16 {
        self.system_data.wrapping_add(NAME_OFFSET)
    }
}

impl ModuleInfo {
    pub fn decode(reply: &[u8]) -> Result<ModuleInfo> {
        if reply.len() <= REPLY_SKIP {
            return Err(Error::ModuleAbsent);
        }
        let record = &reply[REPLY_SKIP..];
        if record.len() < MODULE_INFO_LEN {
            return Err(Error::decode(format!(
                "module info needs {} bytes, got {}",
                MODULE_INFO_LEN,
                record.len()
            )));
        }
        Ok(ModuleInfo {
            ram_address: BigEndian::read_u16(&record[0..2]),
            header: BlockHeader::parse(&record[2..])?,
        })
    }
}

impl RamInfo {
    /// Decode a RAM info reply. The controller does not send the end of
    /// RAM; it comes from the system parameters.
    pub fn decode(reply: &[u8], end_ram: u16) -> Result<RamInfo> {
        let record = reply.get(REPLY_SKIP..).unwrap_or(&[]);
        if record.len() < RAM_INFO_LEN {
            return Err(Error::decode(format!(
                "RAM info needs {} bytes, got {}",
                RAM_INFO_LEN,
                record.len()
            )));
        }
        Ok(RamInfo {
            start_ram: BigEndian::read_u16(&record[0..2]),
            begin_free_ram: BigEndian::read_u16(&record[2..4]),
            end_ram,
        })
    }

    /// Bytes still free for new blocks.
    pub fn free_bytes(&self) -> u32 {
        u32::from(self.end_ram.saturating_sub(self.begin_free_ram)) * 2
    }
}

impl MemorySnapshot {
    /// Decode a memory read reply which starts with `skip` echo bytes and
    /// should carry `len` bytes of data.
    pub fn decode(reply: &[u8], skip: usize, address: u32, len: usize) -> Result<MemorySnapshot> {
        let data = reply.get(skip..).unwrap_or(&[]);
        if data.len() < len {
            return Err(Error::decode(format!(
                "memory read of {} bytes returned {}",
                len,
                data.len()
            )));
        }
        Ok(MemorySnapshot {
            address,
            data: data[..len].to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Big-endian word at byte offset `offset`.
    pub fn word(&self, offset: usize) -> Option<u16> {
        self.data
            .get(offset..offset + 2)
            .map(BigEndian::read_u16)
    }
}

impl CallStack {
    pub fn decode(reply: &[u8]) -> Result<CallStack> {
        let record = reply.get(REPLY_SKIP..).unwrap_or(&[]);
        if record.is_empty() {
            return Err(Error::StackUnavailable);
        }
        if record.len() % CALL_FRAME_LEN != 0 {
            return Err(Error::decode(format!(
                "call stack of {} bytes is not a whole number of frames",
                record.len()
            )));
        }
        let frames = record
            .chunks(CALL_FRAME_LEN)
            .map(|c| CallFrame {
                block_number: BigEndian::read_u16(&c[0..2]),
                return_address: BigEndian::read_u16(&c[2..4]),
            })
            .collect();
        Ok(CallStack { frames })
    }
}

impl InterruptStack {
    pub fn decode(reply: &[u8]) -> Result<InterruptStack> {
        let record = reply.get(REPLY_SKIP..).unwrap_or(&[]);
        if record.is_empty() {
            return Err(Error::StackUnavailable);
        }
        Ok(InterruptStack {
            data: record.to_vec(),
        })
    }

    /// One status bit; `byte` counts from 1 as in the controller manuals.
    pub fn status_bit(&self, byte: usize, bit: u8) -> Option<bool> {
        if byte == 0 || bit > 7 {
            return None;
        }
        self.data.get(byte - 1).map(|b| b & (1 << bit) != 0)
    }
}

impl AddressTable {
    /// Decode an address list reply. `len` is the table length in bytes
    /// from the system parameters.
    pub fn decode(reply: &[u8], block_type: BlockType, len: usize) -> Result<AddressTable> {
        let record = reply.get(REPLY_SKIP..).unwrap_or(&[]);
        if record.len() < len {
            return Err(Error::decode(format!(
                "{} address table needs {} bytes, got {}",
                block_type,
                len,
                record.len()
            )));
        }
        let addresses = record[..len - len % 2]
            .chunks(2)
            .map(BigEndian::read_u16)
            .collect();
        Ok(AddressTable {
            block_type,
            addresses,
        })
    }

    /// Start address of block `number`, if it exists.
    pub fn address(&self, number: u8) -> Option<u16> {
        match self.addresses.get(usize::from(number)) {
            Some(&0) | None => None,
            Some(&a) => Some(a),
        }
    }

    /// Every block that exists, with its address.
    pub fn present(&self) -> impl Iterator<Item = (usize, u16)> + '_ {
        self.addresses
            .iter()
            .enumerate()
            .filter(|(_, &a)| a != 0)
            .map(|(n, &a)| (n, a))
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
