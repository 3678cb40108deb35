//! Batched queries for live status, single stepping and output control.
//!
//! An `OperationList` holds items of exactly one [`ListKind`]. The order of
//! the items is the order the controller answers in, so for the status and
//! step functions it must match the order the operators appear in the
//! program. Readings come back as one packed payload which is split across
//! the items in list order.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder};

use crate::identify::LoadWidth;
use crate::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// What a list is for. A session holds at most one list at a time.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ListKind {
    StatusVariable,
    StatusModule,
    StepModule,
    ControlOutput,
}

/// Memory area sampled by a status variable query.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VarSource {
    /// Process input image, `EB`
    ProcessInput,
    /// Process output image, `AB`
    ProcessOutput,
    /// Flag byte, `MB`
    Flag,
    /// Counter, `Z`
    Counter,
    /// Timer or data word, `T` / `DW`
    Timer,
}

/// One status variable query.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct VarQuery {
    pub source: VarSource,
    pub address: u16,
}

/// The operand class of a program statement watched by the status and step
/// functions.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OperatorKind {
    ProcessInput,
    ProcessOutput,
    Flag,
    Counter,
    Data,
    /// Statement without an operand
    NoParameter,
    /// Load or transfer with 16 bit accumulators
    Load,
    /// Load or transfer with 32 bit accumulators
    LoadWide,
}

/// One statement to watch.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Operator {
    pub kind: OperatorKind,
    pub address: u16,
}

/// One output byte to force.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Output {
    /// Output byte number, e.g. 64 for `AB 64`
    pub address: u8,
    pub value: u8,
}

/// A list item's request. The variant decides which list it may join.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Query {
    Variable(VarQuery),
    Module(Operator),
    Step(Operator),
    Output(Output),
}

/// A status variable sample.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VarReading {
    /// Inputs, outputs and flags
    Byte { status: [u8; 3], value: u8 },
    /// Timers, counters and data words
    Word { status: [u8; 4], value: u16 },
}

/// What the controller reports for one statement.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct OperatorReading {
    /// Address of the statement in controller memory
    pub ag_addr: u16,
    /// Result of logic operation after the statement
    pub rlo: u8,
    pub value: OperatorValue,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OperatorValue {
    Byte(u8),
    Word { status: u8, value: u16 },
    Accumulators { status: u8, akku1: u16, akku2: u16 },
    WideAccumulators { status: u8, akku1: u32, akku2: u32 },
}

/// A decoded sample for one item.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reading {
    Variable(VarReading),
    Operator(OperatorReading),
}

/// A timer cell.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimerWord(pub u16);

/// A counter cell.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CounterWord(pub u16);

/// Stable handle to a list item.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ItemId(u64);

/// A query, its latest reading and a caller's note (usually the statement
/// mnemonic) for display.
#[derive(Debug, Clone)]
pub struct Item {
    id: ItemId,
    query: Query,
    reading: Option<Reading>,
    note: String,
}

/// An ordered list of queries of one kind.
#[derive(Debug)]
pub struct OperationList {
    kind: ListKind,
    items: VecDeque<Item>,
    next_id: u64,
}

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl VarSource {
    pub fn code(self) -> u8 {
        match self {
            VarSource::ProcessInput => 0x30,
            VarSource::ProcessOutput => 0x31,
            VarSource::Flag => 0x32,
            VarSource::Counter => 0x33,
            VarSource::Timer => 0x34,
        }
    }

    pub fn record_len(self) -> usize {
        match self {
            VarSource::ProcessInput | VarSource::ProcessOutput | VarSource::Flag => 4,
            VarSource::Counter | VarSource::Timer => 6,
        }
    }
}

impl OperatorKind {
    /// The full type code. Only the low byte goes on the wire.
    pub fn code(self) -> u16 {
        match self {
            OperatorKind::ProcessInput => 0x0030,
            OperatorKind::ProcessOutput => 0x0031,
            OperatorKind::Flag => 0x0032,
            OperatorKind::Counter => 0x0033,
            OperatorKind::Data => 0x0034,
            OperatorKind::NoParameter => 0x0035,
            OperatorKind::Load => 0x0036,
            OperatorKind::LoadWide => 0x0136,
        }
    }

    pub fn wire_code(self) -> u8 {
        (self.code() & 0xFF) as u8
    }

    /// The load statement kind for a controller with the given
    /// accumulator width.
    pub fn load(width: LoadWidth) -> OperatorKind {
        match width {
            LoadWidth::Narrow => OperatorKind::Load,
            LoadWidth::Wide => OperatorKind::LoadWide,
        }
    }

    /// Whether the request carries the operand address.
    pub fn sends_address(self) -> bool {
        !matches!(
            self,
            OperatorKind::NoParameter | OperatorKind::Load | OperatorKind::LoadWide
        )
    }

    pub fn record_len(self) -> usize {
        match self {
            OperatorKind::ProcessInput
            | OperatorKind::ProcessOutput
            | OperatorKind::Flag
            | OperatorKind::NoParameter => 4,
            OperatorKind::Counter | OperatorKind::Data => 6,
            OperatorKind::Load => 8,
            OperatorKind::LoadWide => 12,
        }
    }
}

impl Operator {
    pub fn new(kind: OperatorKind, address: u16) -> Operator {
        Operator { kind, address }
    }
}

impl Query {
    /// The list kind this query belongs to.
    pub fn kind(&self) -> ListKind {
        match self {
            Query::Variable(_) => ListKind::StatusVariable,
            Query::Module(_) => ListKind::StatusModule,
            Query::Step(_) => ListKind::StepModule,
            Query::Output(_) => ListKind::ControlOutput,
        }
    }

    /// Bytes of reply this query contributes. Output queries get no reply.
    pub fn record_len(&self) -> usize {
        match self {
            Query::Variable(v) => v.source.record_len(),
            Query::Module(op) | Query::Step(op) => op.kind.record_len(),
            Query::Output(_) => 0,
        }
    }

    /// The operator, for module and step queries.
    pub fn operator(&self) -> Option<&Operator> {
        match self {
            Query::Module(op) | Query::Step(op) => Some(op),
            _ => None,
        }
    }

    /// Decode this query's share of a reply. `record` must be exactly
    /// `record_len()` bytes.
    fn decode(&self, record: &[u8]) -> Result<Reading> {
        match self {
            Query::Variable(v) => Ok(Reading::Variable(VarReading::parse(v.source, record))),
            Query::Module(op) | Query::Step(op) => {
                Ok(Reading::Operator(OperatorReading::parse(op.kind, record)))
            }
            Query::Output(_) => Err(Error::bad_parameter("output queries have no reading")),
        }
    }
}

impl VarReading {
    fn parse(source: VarSource, record: &[u8]) -> VarReading {
        match source.record_len() {
            4 => VarReading::Byte {
                status: [record[0], record[1], record[2]],
                value: record[3],
            },
            _ => VarReading::Word {
                status: [record[0], record[1], record[2], record[3]],
                value: BigEndian::read_u16(&record[4..6]),
            },
        }
    }

    pub fn byte(&self) -> Option<u8> {
        match *self {
            VarReading::Byte { value, .. } => Some(value),
            VarReading::Word { .. } => None,
        }
    }

    pub fn word(&self) -> Option<u16> {
        match *self {
            VarReading::Word { value, .. } => Some(value),
            VarReading::Byte { .. } => None,
        }
    }

    pub fn timer(&self) -> Option<TimerWord> {
        self.word().map(TimerWord)
    }

    pub fn counter(&self) -> Option<CounterWord> {
        self.word().map(CounterWord)
    }
}

impl OperatorReading {
    fn parse(kind: OperatorKind, record: &[u8]) -> OperatorReading {
        let ag_addr = BigEndian::read_u16(&record[0..2]);
        let rlo = record[2];
        let value = match kind.record_len() {
            4 => OperatorValue::Byte(record[3]),
            6 => OperatorValue::Word {
                status: record[3],
                value: BigEndian::read_u16(&record[4..6]),
            },
            8 => OperatorValue::Accumulators {
                status: record[3],
                akku1: BigEndian::read_u16(&record[4..6]),
                akku2: BigEndian::read_u16(&record[6..8]),
            },
            _ => OperatorValue::WideAccumulators {
                status: record[3],
                akku1: wide_accumulator(&record[4..8]),
                akku2: wide_accumulator(&record[8..12]),
            },
        };
        OperatorReading {
            ag_addr,
            rlo,
            value,
        }
    }
}

impl TimerWord {
    pub fn value(self) -> u16 {
        self.0 & 0x03FF
    }

    /// 0 = 10 ms, 1 = 100 ms, 2 = 1 s, 3 = 10 s
    pub fn base(self) -> u8 {
        ((self.0 >> 12) & 0x03) as u8
    }

    /// Remaining time in milliseconds.
    pub fn millis(self) -> u32 {
        let unit = match self.base() {
            0 => 10,
            1 => 100,
            2 => 1000,
            _ => 10_000,
        };
        u32::from(self.value()) * unit
    }

    pub fn enabled(self) -> bool {
        self.0 & (1 << 10) != 0
    }

    pub fn running(self) -> bool {
        self.0 & (1 << 15) != 0
    }
}

impl CounterWord {
    pub fn value(self) -> u16 {
        self.0 & 0x03FF
    }

    pub fn enabled(self) -> bool {
        self.0 & (1 << 10) != 0
    }

    pub fn set(self) -> bool {
        self.0 & (1 << 11) != 0
    }

    pub fn counting_down(self) -> bool {
        self.0 & (1 << 12) != 0
    }

    pub fn counting_up(self) -> bool {
        self.0 & (1 << 13) != 0
    }

    /// Count is above zero.
    pub fn running(self) -> bool {
        self.0 & (1 << 15) != 0
    }
}

impl Item {
    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The latest reading, if the item has been sampled.
    pub fn reading(&self) -> Option<&Reading> {
        self.reading.as_ref()
    }

    pub fn note(&self) -> &str {
        &self.note
    }
}

impl OperationList {
    pub fn new(kind: ListKind) -> OperationList {
        OperationList {
            kind,
            items: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a query. A query of another kind is refused and the list is
    /// left as it was.
    pub fn push(&mut self, query: Query, note: impl Into<String>) -> Result<ItemId> {
        if query.kind() != self.kind {
            return Err(Error::WrongListKind {
                list: self.kind,
                offered: query.kind(),
            });
        }
        let id = ItemId(self.next_id);
        self.next_id += 1;
        self.items.push_back(Item {
            id,
            query,
            reading: None,
            note: note.into(),
        });
        Ok(id)
    }

    /// Take an item out, wherever it is.
    pub fn remove(&mut self, id: ItemId) -> Result<Item> {
        let index = self.position(id).ok_or(Error::UnknownItem)?;
        self.items.remove(index).ok_or(Error::UnknownItem)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn first(&self) -> Option<&Item> {
        self.items.front()
    }

    pub fn last(&self) -> Option<&Item> {
        self.items.back()
    }

    /// The item after `id`, in list order.
    pub fn next_after(&self, id: ItemId) -> Option<&Item> {
        self.position(id).and_then(|i| self.items.get(i + 1))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.items.iter().map(|item| &item.query)
    }

    /// Reply bytes the whole list expects.
    pub fn total_record_len(&self) -> usize {
        self.items.iter().map(|item| item.query.record_len()).sum()
    }

    /// Split a packed reply across the items in order. The reply must be
    /// exactly as long as the items require; otherwise nothing is updated.
    pub fn decode_readings(&mut self, payload: &[u8]) -> Result<()> {
        if self.kind == ListKind::ControlOutput {
            return Err(Error::bad_parameter("output lists have no readings"));
        }
        let expected = self.total_record_len();
        if payload.len() != expected {
            return Err(Error::decode(format!(
                "{:?} list expects {} bytes of readings, got {}",
                self.kind,
                expected,
                payload.len()
            )));
        }
        let mut readings = Vec::with_capacity(self.items.len());
        let mut offset = 0;
        for item in self.items.iter() {
            let len = item.query.record_len();
            readings.push(item.query.decode(&payload[offset..offset + len])?);
            offset += len;
        }
        for (item, reading) in self.items.iter_mut().zip(readings) {
            item.reading = Some(reading);
        }
        Ok(())
    }

    /// Decode one item's record starting at `skip` in a single step reply.
    /// The reply must end with the record.
    pub fn decode_one(&mut self, id: ItemId, payload: &[u8], skip: usize) -> Result<&Reading> {
        let index = self.position(id).ok_or(Error::UnknownItem)?;
        let item = &mut self.items[index];
        let expected = skip + item.query.record_len();
        if payload.len() != expected {
            return Err(Error::decode(format!(
                "step reply should be {} bytes, got {}",
                expected,
                payload.len()
            )));
        }
        let reading = item.query.decode(&payload[skip..])?;
        Ok(item.reading.insert(reading))
    }

    fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

/// A 32 bit accumulator as the controller lays it out: low word first, each
/// word big-endian.
fn wide_accumulator(data: &[u8]) -> u32 {
    let low = u32::from(BigEndian::read_u16(&data[0..2]));
    let high = u32::from(BigEndian::read_u16(&data[2..4]));
    (high << 16) | low
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
