//! Implements the AS511 protocol.
//!
//! Siemens S5 programmable controllers expose a serial programming port
//! which speaks AS511. A programming device uses it to read and write
//! program blocks, peek and poke controller memory, change the run mode
//! and watch operands while the program runs. This crate implements the
//! host side of that protocol so you can talk to an S5 from Rust.
//!
//! Open a [`Session`] over a serial port (or anything else implementing
//! [`Transport`]) and call one operation at a time:
//!
//! ```no_run
//! # fn main() -> as511_proto::Result<()> {
//! let config = as511_proto::SessionConfig::load("as511.toml")?;
//! let mut session = as511_proto::Session::open(&config)?;
//! let params = session.read_system_parameters()?;
//! println!("system data at {:04X}", params.system_data);
//! # Ok(())
//! # }
//! ```

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::io;

use thiserror::Error;

pub mod config;
pub mod engine;
pub mod frame;
pub mod identify;
pub mod link;
pub mod oplist;
pub mod records;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::{SessionConfig, Verbosity};
pub use engine::CloseStatus;
pub use identify::{ControllerIdentity, Cpu, Family, LoadWidth};
pub use oplist::{ItemId, ListKind, OperationList, Query, Reading};
pub use records::{
    AddressTable, Block, BlockHeader, BlockType, CallFrame, CallStack, InterruptStack,
    MemorySnapshot, ModuleInfo, RamInfo, SystemParameters,
};
pub use session::{RunMode, Session};
pub use transport::Transport;

#[cfg(feature = "serial")]
pub use transport::SerialTransport;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Everything that can go wrong while talking to a controller.
#[derive(Debug, Error)]
pub enum Error {
    /// The controller did not answer within the session timeout.
    #[error("controller did not respond in time")]
    Timeout,

    /// A handshake byte did not match what the protocol requires.
    #[error("unexpected byte {got:#04X} from controller (expected {expected:02X?})")]
    UnexpectedByte { expected: Option<u8>, got: u8 },

    /// The controller refused the request, usually because it is in RUN.
    #[error("controller refused the request in its current run state")]
    ControllerBusy,

    /// The requested block or target does not exist on the controller.
    #[error("block not present on controller")]
    ModuleAbsent,

    /// The call or interrupt stack is empty or cannot be read right now.
    #[error("stack not available")]
    StackUnavailable,

    /// The caller supplied an argument the protocol cannot carry.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Fewer bytes were written than were supposed to be.
    #[error("partial write: expected {expected} bytes, wrote {written}")]
    PartialWrite { expected: usize, written: usize },

    /// A record's declared size does not fit the bytes received.
    #[error("decode error: {0}")]
    Decode(String),

    /// The channel itself failed. Close the session after this one.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// An item of one list kind was offered to a list of another kind.
    #[error("item of kind {offered:?} does not belong in a {list:?} list")]
    WrongListKind { list: ListKind, offered: ListKind },

    /// A list is already open on this session.
    #[error("a {0:?} list is already open")]
    ListOpen(ListKind),

    /// No list of the required kind is open.
    #[error("no {0:?} list is open")]
    NoList(ListKind),

    /// The operation needs at least one list item.
    #[error("operation list is empty")]
    EmptyList,

    /// The item handle does not belong to the open list.
    #[error("no such list item")]
    UnknownItem,
}

/// The class of an [`Error`], as recorded by a session after a failed
/// operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    Timeout,
    UnexpectedByte,
    ControllerBusy,
    ModuleAbsent,
    StackUnavailable,
    BadParameter,
    PartialWrite,
    DecodeError,
    Io,
}

pub type Result<T> = std::result::Result<T, Error>;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl Error {
    /// Which class of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout => ErrorKind::Timeout,
            Error::UnexpectedByte { .. } => ErrorKind::UnexpectedByte,
            Error::ControllerBusy => ErrorKind::ControllerBusy,
            Error::ModuleAbsent => ErrorKind::ModuleAbsent,
            Error::StackUnavailable => ErrorKind::StackUnavailable,
            Error::PartialWrite { .. } => ErrorKind::PartialWrite,
            Error::Decode(_) => ErrorKind::DecodeError,
            Error::Io(_) => ErrorKind::Io,
            Error::BadParameter(_)
            | Error::Config(_)
            | Error::WrongListKind { .. }
            | Error::ListOpen(_)
            | Error::NoList(_)
            | Error::EmptyList
            | Error::UnknownItem => ErrorKind::BadParameter,
        }
    }

    /// True when the channel is in an unknown state and the session should
    /// be closed rather than reused.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Io
    }

    pub(crate) fn bad_parameter(msg: impl Into<String>) -> Error {
        Error::BadParameter(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Error {
        Error::Decode(msg.into())
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
