//! Every operation a programming device performs on an S5 controller.
//!
//! A `Session` runs one operation at a time. Each public method is a single
//! recovery point: the first failing primitive ends the whole operation,
//! the session records the error kind in [`Session::last_error`] and no
//! partial result is returned. Nothing is retried.
//!
//! The live status, single step and output control functions work on the
//! session's [`OperationList`]. Create one with [`Session::create_list`],
//! fill it, then use the matching start/run/stop calls.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{SessionConfig, Verbosity};
use crate::engine::{CloseStatus, STATUS_REFUSED};
use crate::frame::{ACK, DC2, DLE, EOT, ETX, FS, HT, NUL, STX};
use crate::identify::{self, ControllerIdentity, NAME_LEN};
use crate::link::Link;
use crate::oplist::{
    Item, ItemId, ListKind, Operator, OperationList, Output, Query, Reading, VarQuery, VarSource,
};
use crate::records::{
    AddressTable, Block, BlockType, CallStack, InterruptStack, MemorySnapshot, ModuleInfo,
    RamInfo, SystemParameters,
};
use crate::transport::Transport;
use crate::{Error, ErrorKind, Result};

#[cfg(feature = "serial")]
use crate::transport::SerialTransport;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// An open link to one controller.
pub struct Session<T: Transport> {
    link: Link<T>,
    last_error: Option<ErrorKind>,
    list: Option<OperationList>,
}

/// Targets of [`Session::change_run_mode`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RunMode {
    Stop,
    /// Cold restart (Neustart)
    Restart,
    /// Warm restart (Wiederanlauf)
    Reboot,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Largest transfer of the 16 bit memory commands.
pub const MAX_MEMORY_TRANSFER: usize = 512;

/// Largest transfer of the 32 bit memory commands.
pub const MAX_MEMORY_TRANSFER32: usize = 1024;

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const CMD_WRITE_MEMORY: u8 = 0x03;
const CMD_READ_MEMORY: u8 = 0x04;
const CMD_READ_BLOCK: u8 = 0x06;
const CMD_COMPRESS_RAM: u8 = 0x07;
const CMD_WRITE_BLOCK: u8 = 0x08;
const CMD_DELETE_BLOCK: u8 = 0x09;
const CMD_STEP_START: u8 = 0x0E;
const CMD_STEP_CONTINUE: u8 = 0x10;
const CMD_DELETE_ALL: u8 = 0x11;
const CMD_OUTPUT_RUN: u8 = 0x13;
const CMD_STATUS_VARIABLE: u8 = 0x14;
const CMD_STATUS_MODULE: u8 = 0x15;
const CMD_STEP_INIT: u8 = 0x16;
const CMD_OUTPUT_INIT: u8 = 0x17;
const CMD_READ_SYSTEM_PARAMETERS: u8 = 0x18;
const CMD_READ_RAM_INFO: u8 = 0x19;
const CMD_READ_MODULE_INFO: u8 = 0x1A;
const CMD_READ_ADDRESS_TABLE: u8 = 0x1B;
const CMD_READ_CALL_STACK: u8 = 0x1C;
const CMD_READ_INTERRUPT_STACK: u8 = 0x1D;
const CMD_RUN_MODE: u8 = 0x1E;

const ONLINE_START: u8 = 0x80;
const ONLINE_STOP: u8 = 0x81;

/// Marks each item in a status or step request.
const ITEM_MARKER: u8 = 0x10;

/// Fixed lead-in of the status variable request.
const STATUS_VARIABLE_PREAMBLE: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x10, 0x3F];

/// Run state byte of a status reply while the program runs.
const RUN_STATE_RUNNING: u8 = 0xFF;

const MEMORY_SKIP: usize = 5;
const MEMORY32_SKIP: usize = 9;
const STEP_START_SKIP: usize = 3;
const STEP_CONTINUE_SKIP: usize = 1;

/// System data offset of the stop control bytes.
const SD_CONTROL_OFFSET: u16 = 12;
const SD_CONTROL_LEN: usize = 8;
/// Byte 0: request stop
const SD_STOP_REQUEST: u8 = 0x80;
/// Byte 1: interrupt enable for OB2/OB13
const SD_INTERRUPT_ENABLE: u8 = 0x04;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl RunMode {
    pub fn code(self) -> u8 {
        match self {
            RunMode::Stop => 0x00,
            RunMode::Restart => 0x01,
            RunMode::Reboot => 0x02,
        }
    }
}

#[cfg(feature = "serial")]
impl Session<SerialTransport> {
    /// Open the serial port named in `config` and start a session on it.
    pub fn open(config: &SessionConfig) -> Result<Session<SerialTransport>> {
        config.validate()?;
        let transport = SerialTransport::open(config)?;
        Session::new(transport, config)
    }
}

impl<T: Transport> Session<T> {
    /// Start a session over an already open transport.
    pub fn new(transport: T, config: &SessionConfig) -> Result<Session<T>> {
        config.validate()?;
        Ok(Session {
            link: Link::new(transport, config),
            last_error: None,
            list: None,
        })
    }

    /// End the session. Any open list is dropped and the transport is
    /// handed back.
    pub fn close(self) -> T {
        if self.link.verbosity().shows_system() {
            info!("closing session");
        }
        self.link.into_inner()
    }

    /// The kind of error the last operation failed with, or `None` if it
    /// succeeded.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn timeout(&self) -> Duration {
        self.link.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.link.set_timeout(timeout);
    }

    pub fn verbosity(&self) -> Verbosity {
        self.link.verbosity()
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.link.set_verbosity(verbosity);
    }

    // ************************************************************************
    // Controller information
    // ************************************************************************

    pub fn read_system_parameters(&mut self) -> Result<SystemParameters> {
        self.guarded("read system parameters", read_system_parameters)
    }

    /// Start of user RAM and of free RAM. The end of RAM comes from the
    /// system parameters, which are read first.
    pub fn read_ram_info(&mut self) -> Result<RamInfo> {
        self.guarded("read RAM info", |link| {
            let params = read_system_parameters(link)?;
            simple_request(link, CMD_READ_RAM_INFO, &[])?;
            let reply = link.receive_payload()?;
            link.end_operation()?;
            RamInfo::decode(&reply, params.end_ram)
        })
    }

    /// The identification string in the system data area.
    pub fn read_controller_name(&mut self) -> Result<String> {
        self.guarded("read controller name", |link| {
            let params = read_system_parameters(link)?;
            let name = read_memory(link, params.name_address(), NAME_LEN)?;
            Ok(name_to_string(&name.data))
        })
    }

    /// Work out the family and CPU. `None` means the controller is not one
    /// this crate knows.
    pub fn identify_controller(&mut self) -> Result<Option<ControllerIdentity>> {
        self.guarded("identify controller", |link| {
            let params = read_system_parameters(link)?;
            let identity = identify_with(link, &params)?;
            if link.verbosity().shows_protocol() {
                debug!("controller identity {:?}", identity);
            }
            Ok(identity)
        })
    }

    // ************************************************************************
    // Blocks
    // ************************************************************************

    /// Upload a block. A block the controller does not have is
    /// [`Error::ModuleAbsent`].
    pub fn read_block(&mut self, block_type: BlockType, number: u8) -> Result<Block> {
        self.guarded("read block", |link| {
            simple_request(link, CMD_READ_BLOCK, &[block_type.code(), number])?;
            let reply = link.receive_payload()?;
            if link.end_operation()? == CloseStatus::Dc4 {
                return Err(Error::ModuleAbsent);
            }
            Block::decode(&reply)
        })
    }

    /// Where a block sits in controller RAM, and its header.
    pub fn read_module_info(&mut self, block_type: BlockType, number: u8) -> Result<ModuleInfo> {
        self.guarded("read module info", |link| {
            simple_request(link, CMD_READ_MODULE_INFO, &[block_type.code(), number])?;
            let reply = link.receive_payload()?;
            if link.end_operation()? == CloseStatus::Dc4 {
                return Err(Error::ModuleAbsent);
            }
            ModuleInfo::decode(&reply)
        })
    }

    /// Download a block, replacing any block of the same type and number.
    pub fn write_block(&mut self, block: &Block) -> Result<()> {
        self.guarded("write block", |link| {
            let header = block.header();
            let length = header.length_words.to_be_bytes();
            link.begin_operation(CMD_WRITE_BLOCK)?;
            link.write_data(&[header.type_code(), header.number, length[0], length[1]])?;
            link.write_pair(DLE, ETX)?;
            link.expect_pair(DLE, ACK)?;
            link.receive_fixed(&[HT])?;
            link.write_byte(STX)?;
            link.expect_pair(DLE, ACK)?;
            link.write_byte(NUL)?;
            link.write_data(&block.to_image())?;
            link.write_pair(DLE, EOT)?;
            link.expect_pair(DLE, ACK)?;
            link.end_operation()?;
            Ok(())
        })
    }

    pub fn delete_block(&mut self, block_type: BlockType, number: u8) -> Result<()> {
        self.guarded("delete block", |link| {
            simple_request(link, CMD_DELETE_BLOCK, &[block_type.code(), number])?;
            if link.end_operation()? == CloseStatus::Dc4 {
                // The controller follows up with a second close.
                link.end_operation()?;
                return Err(Error::ModuleAbsent);
            }
            Ok(())
        })
    }

    /// Delete every block (overall reset). Only in STOP.
    pub fn delete_all_blocks(&mut self) -> Result<()> {
        self.guarded("delete all blocks", |link| {
            let status = simple_request(link, CMD_DELETE_ALL, &[])?;
            link.end_operation()?;
            if status == STATUS_REFUSED {
                return Err(Error::ControllerBusy);
            }
            Ok(())
        })
    }

    /// Close the gaps left by deleted blocks.
    pub fn compress_ram(&mut self) -> Result<()> {
        self.guarded("compress RAM", |link| {
            simple_request(link, CMD_COMPRESS_RAM, &[])?;
            link.end_operation()?;
            Ok(())
        })
    }

    /// Start addresses of every block of one type.
    pub fn read_address_table(&mut self, block_type: BlockType) -> Result<AddressTable> {
        self.guarded("read address table", |link| {
            let params = read_system_parameters(link)?;
            let len = usize::from(params.address_table_len(block_type));
            if len == 0 {
                // The controller has no blocks of this type at all.
                return Ok(AddressTable {
                    block_type,
                    addresses: Vec::new(),
                });
            }
            simple_request(link, CMD_READ_ADDRESS_TABLE, &[block_type.code()])?;
            let reply = link.receive_payload()?;
            link.end_operation()?;
            AddressTable::decode(&reply, block_type, len)
        })
    }

    // ************************************************************************
    // Memory
    // ************************************************************************

    /// Read up to 512 bytes of controller memory.
    pub fn read_memory(&mut self, address: u16, len: usize) -> Result<MemorySnapshot> {
        self.guarded("read memory", |link| read_memory(link, address, len))
    }

    /// Write up to 512 bytes of controller memory.
    pub fn write_memory(&mut self, address: u16, data: &[u8]) -> Result<()> {
        self.guarded("write memory", |link| write_memory(link, address, data))
    }

    /// Read up to 1024 bytes from a controller with 32 bit addresses.
    pub fn read_memory32(&mut self, address: u32, len: usize) -> Result<MemorySnapshot> {
        self.guarded("read memory", |link| {
            let last = check_range(
                u64::from(address),
                len,
                MAX_MEMORY_TRANSFER32,
                u64::from(u32::MAX),
            )?;
            let mut request = address.to_be_bytes().to_vec();
            request.extend_from_slice(&(last as u32).to_be_bytes());
            simple_request(link, CMD_READ_MEMORY, &request)?;
            let reply = link.receive_payload()?;
            link.end_operation()?;
            MemorySnapshot::decode(&reply, MEMORY32_SKIP, address, len)
        })
    }

    /// Write up to 1024 bytes to a controller with 32 bit addresses.
    pub fn write_memory32(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.guarded("write memory", |link| {
            check_range(
                u64::from(address),
                data.len(),
                MAX_MEMORY_TRANSFER32,
                u64::from(u32::MAX),
            )?;
            link.begin_operation(CMD_WRITE_MEMORY)?;
            link.write_data(&address.to_be_bytes())?;
            link.write_data(data)?;
            link.request_end()?;
            link.end_operation()?;
            Ok(())
        })
    }

    // ************************************************************************
    // Stacks
    // ************************************************************************

    /// The block call stack. Only in STOP; an empty stack is
    /// [`Error::StackUnavailable`].
    pub fn read_call_stack(&mut self) -> Result<CallStack> {
        self.guarded("read call stack", |link| {
            let reply = read_stack(link, CMD_READ_CALL_STACK)?;
            CallStack::decode(&reply)
        })
    }

    /// The interrupt stack. Only in STOP.
    pub fn read_interrupt_stack(&mut self) -> Result<InterruptStack> {
        self.guarded("read interrupt stack", |link| {
            let reply = read_stack(link, CMD_READ_INTERRUPT_STACK)?;
            InterruptStack::decode(&reply)
        })
    }

    // ************************************************************************
    // Run mode
    // ************************************************************************

    /// Switch the controller between STOP and RUN. Restart and reboot return
    /// the controller's acknowledgement code.
    pub fn change_run_mode(&mut self, mode: RunMode) -> Result<Option<u8>> {
        self.guarded("change run mode", |link| change_run_mode(link, mode))
    }

    /// Stop a controller that lacks the run mode command, by setting the
    /// stop request in its system data.
    pub fn stop_via_system_data(&mut self) -> Result<()> {
        self.guarded("stop via system data", stop_via_system_data)
    }

    /// Stop the controller the way its family supports.
    pub fn stop_controller(&mut self) -> Result<()> {
        self.guarded("stop controller", |link| {
            let params = read_system_parameters(link)?;
            let identity = identify_with(link, &params)?
                .ok_or_else(|| Error::bad_parameter("unknown controller"))?;
            if identity.family.has_run_mode_command() {
                change_run_mode(link, RunMode::Stop)?;
                Ok(())
            } else {
                stop_via_system_data(link)
            }
        })
    }

    /// Restart the controller. Only the families with the run mode command
    /// can be restarted from the programming port.
    pub fn restart_controller(&mut self) -> Result<Option<u8>> {
        self.guarded("restart controller", |link| {
            let params = read_system_parameters(link)?;
            match identify_with(link, &params)? {
                Some(id) if id.family.has_run_mode_command() => {
                    change_run_mode(link, RunMode::Restart)
                }
                Some(id) => Err(Error::bad_parameter(format!(
                    "{} cannot be restarted remotely",
                    id.family.name()
                ))),
                None => Err(Error::bad_parameter("unknown controller")),
            }
        })
    }

    // ************************************************************************
    // Operation list
    // ************************************************************************

    /// Open a new list. Only one list may be open at a time.
    pub fn create_list(&mut self, kind: ListKind) -> Result<()> {
        if let Some(list) = &self.list {
            return Err(Error::ListOpen(list.kind()));
        }
        self.list = Some(OperationList::new(kind));
        Ok(())
    }

    /// Close the open list and hand it back.
    pub fn destroy_list(&mut self) -> Option<OperationList> {
        self.list.take()
    }

    pub fn list(&self) -> Option<&OperationList> {
        self.list.as_ref()
    }

    pub fn add_status_variable(
        &mut self,
        source: VarSource,
        address: u16,
        note: impl Into<String>,
    ) -> Result<ItemId> {
        self.push(Query::Variable(VarQuery { source, address }), note)
    }

    /// Add a statement to a status module list, in program order.
    pub fn add_status_operator(&mut self, op: Operator, note: impl Into<String>) -> Result<ItemId> {
        self.push(Query::Module(op), note)
    }

    /// Add a statement to a step list, in program order.
    pub fn add_step_operator(&mut self, op: Operator, note: impl Into<String>) -> Result<ItemId> {
        self.push(Query::Step(op), note)
    }

    /// Add an output byte to force.
    pub fn add_output(&mut self, address: u8, value: u8, note: impl Into<String>) -> Result<ItemId> {
        self.push(Query::Output(Output { address, value }), note)
    }

    pub fn remove_item(&mut self, id: ItemId) -> Result<Item> {
        match self.list.as_mut() {
            Some(list) => list.remove(id),
            None => Err(Error::UnknownItem),
        }
    }

    // ************************************************************************
    // Status variable
    // ************************************************************************

    /// Register the list's variables with the controller.
    pub fn status_variable_start(&mut self) -> Result<()> {
        self.guarded_list(ListKind::StatusVariable, "status variable start", |link, list| {
            if list.is_empty() {
                return Err(Error::EmptyList);
            }
            link.begin_operation(CMD_STATUS_VARIABLE)?;
            link.write_data(&STATUS_VARIABLE_PREAMBLE)?;
            for query in list.queries() {
                if let Query::Variable(v) = query {
                    let address = v.address.to_be_bytes();
                    for &b in &[ITEM_MARKER, v.source.code(), address[0], address[1]] {
                        link.write_byte(b)?;
                    }
                }
            }
            link.request_end()?;
            link.receive_fixed(&[ITEM_MARKER, ITEM_MARKER])
        })
    }

    /// Sample every variable once. Returns whether the controller is in RUN.
    pub fn status_variable_run(&mut self) -> Result<bool> {
        self.guarded_list(ListKind::StatusVariable, "status variable run", sample)
    }

    pub fn status_variable_stop(&mut self) -> Result<()> {
        self.guarded("status variable stop", online_stop)
    }

    // ************************************************************************
    // Status module
    // ************************************************************************

    /// Register the list's statements for the block, starting at the word
    /// `offset` into its code.
    pub fn status_module_start(
        &mut self,
        block_type: BlockType,
        number: u8,
        offset: u16,
    ) -> Result<()> {
        self.guarded_list(ListKind::StatusModule, "status module start", |link, list| {
            if list.is_empty() {
                return Err(Error::EmptyList);
            }
            link.begin_operation(CMD_STATUS_MODULE)?;
            link.write_data(&block_request(block_type, number, offset))?;
            for query in list.queries() {
                if let Some(op) = query.operator() {
                    write_operator(link, op)?;
                }
            }
            link.request_end()?;
            link.expect(STX)?;
            link.ack()?;
            if link.read_any()? == ITEM_MARKER {
                link.expect(ITEM_MARKER)?;
            }
            link.expect_pair(DLE, ETX)?;
            link.ack()
        })
    }

    /// Sample every statement once. Returns whether the controller is in
    /// RUN.
    pub fn status_module_run(&mut self) -> Result<bool> {
        self.guarded_list(ListKind::StatusModule, "status module run", sample)
    }

    /// Sample repeatedly until `on_sample` returns `false` or the
    /// controller leaves RUN. Returns `true` if the caller ended the loop.
    /// Call [`Session::status_module_stop`] afterwards.
    pub fn watch_status_module<F>(&mut self, mut on_sample: F) -> Result<bool>
    where
        F: FnMut(&OperationList) -> bool,
    {
        loop {
            let running = self.status_module_run()?;
            if !running {
                return Ok(false);
            }
            if let Some(list) = &self.list {
                if !on_sample(list) {
                    return Ok(true);
                }
            }
        }
    }

    pub fn status_module_stop(&mut self) -> Result<()> {
        self.guarded("status module stop", online_stop)
    }

    // ************************************************************************
    // Single step
    // ************************************************************************

    /// Arm single stepping.
    pub fn step_init(&mut self) -> Result<()> {
        self.guarded("step init", |link| {
            simple_request(link, CMD_STEP_INIT, &[])?;
            link.end_operation()?;
            Ok(())
        })
    }

    /// Execute from the word `offset` in the block up to the list's first
    /// statement and return what it did.
    pub fn step_start(
        &mut self,
        block_type: BlockType,
        number: u8,
        offset: u16,
    ) -> Result<(ItemId, Reading)> {
        self.guarded_list(ListKind::StepModule, "step start", |link, list| {
            let (id, op) = match list.first() {
                Some(item) => (item.id(), step_operator(item)?),
                None => return Err(Error::EmptyList),
            };
            link.begin_operation(CMD_STEP_START)?;
            link.write_data(&block_request(block_type, number, offset))?;
            write_operator(link, &op)?;
            link.request_end()?;
            let reply = link.receive_payload()?;
            link.end_operation()?;
            let reading = *list.decode_one(id, &reply, STEP_START_SKIP)?;
            Ok((id, reading))
        })
    }

    /// Execute one more step, up to the statement `id`.
    pub fn step_continue(&mut self, id: ItemId) -> Result<Reading> {
        self.guarded_list(ListKind::StepModule, "step continue", |link, list| {
            let op = match list.get(id) {
                Some(item) => step_operator(item)?,
                None => return Err(Error::UnknownItem),
            };
            link.begin_operation(CMD_STEP_CONTINUE)?;
            write_operator(link, &op)?;
            link.request_end()?;
            let reply = link.receive_payload()?;
            link.end_operation()?;
            Ok(*list.decode_one(id, &reply, STEP_CONTINUE_SKIP)?)
        })
    }

    /// Disarm single stepping.
    pub fn step_stop(&mut self) -> Result<()> {
        self.guarded("step stop", |link| {
            link.online_data_request(ONLINE_STOP)?;
            link.end_operation()?;
            Ok(())
        })
    }

    // ************************************************************************
    // Output control
    // ************************************************************************

    /// Enter output control. Refused with [`Error::ControllerBusy`] while the
    /// controller runs.
    pub fn output_init(&mut self) -> Result<()> {
        self.guarded("output init", |link| {
            simple_request(link, CMD_OUTPUT_INIT, &[])?;
            link.expect(STX)?;
            link.ack()?;
            // Finish the frame before reporting a refusal.
            let verdict = match link.read_any()? {
                ITEM_MARKER => {
                    link.expect(ITEM_MARKER)?;
                    Ok(())
                }
                DC2 => Err(Error::ControllerBusy),
                other => Err(Error::UnexpectedByte {
                    expected: Some(ITEM_MARKER),
                    got: other,
                }),
            };
            link.expect_pair(DLE, ETX)?;
            link.ack()?;
            verdict
        })
    }

    /// Drive every output in the list. Returns the output addresses the
    /// controller could not drive, which is empty on full success.
    pub fn output_run(&mut self) -> Result<Vec<u8>> {
        self.guarded_list(ListKind::ControlOutput, "output run", |link, list| {
            if list.is_empty() {
                return Err(Error::EmptyList);
            }
            link.begin_operation(CMD_OUTPUT_RUN)?;
            for query in list.queries() {
                if let Query::Output(out) = query {
                    link.write_data(&[out.address, out.value])?;
                }
            }
            link.request_end()?;
            link.expect(STX)?;
            link.ack()?;
            let mut rejected = Vec::new();
            if link.read_any()? == FS {
                rejected = link.read_payload()?;
                link.ack()?;
                link.expect(STX)?;
                link.ack()?;
                link.expect(DC2)?;
            }
            link.expect_pair(DLE, ETX)?;
            link.ack()?;
            if !rejected.is_empty() && link.verbosity().shows_protocol() {
                warn!("controller rejected outputs {:02X?}", rejected);
            }
            Ok(rejected)
        })
    }

    /// Leave output control.
    pub fn output_stop(&mut self) -> Result<()> {
        self.guarded("output stop", online_stop)
    }

    // ************************************************************************
    // Private
    // ************************************************************************

    /// Run one operation as a unit and record how it ended.
    fn guarded<R, F>(&mut self, name: &str, op: F) -> Result<R>
    where
        F: FnOnce(&mut Link<T>) -> Result<R>,
    {
        let result = op(&mut self.link);
        self.record(name, &result);
        result
    }

    /// As `guarded`, for operations on the open list of `kind`.
    fn guarded_list<R, F>(&mut self, kind: ListKind, name: &str, op: F) -> Result<R>
    where
        F: FnOnce(&mut Link<T>, &mut OperationList) -> Result<R>,
    {
        let result = match self.list.as_mut() {
            Some(list) if list.kind() == kind => op(&mut self.link, list),
            _ => Err(Error::NoList(kind)),
        };
        self.record(name, &result);
        result
    }

    fn record<R>(&mut self, name: &str, result: &Result<R>) {
        match result {
            Ok(_) => self.last_error = None,
            Err(e) => {
                self.last_error = Some(e.kind());
                if self.link.verbosity().shows_protocol() {
                    debug!("{} failed: {}", name, e);
                }
            }
        }
    }

    fn push(&mut self, query: Query, note: impl Into<String>) -> Result<ItemId> {
        match self.list.as_mut() {
            Some(list) => list.push(query, note),
            None => Err(Error::NoList(query.kind())),
        }
    }
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

/// Open `command`, send `request` as payload and end the request. Returns
/// the opening status.
fn simple_request<T: Transport>(link: &mut Link<T>, command: u8, request: &[u8]) -> Result<u8> {
    let status = link.begin_operation(command)?;
    link.write_data(request)?;
    link.request_end()?;
    Ok(status)
}

fn read_system_parameters<T: Transport>(link: &mut Link<T>) -> Result<SystemParameters> {
    simple_request(link, CMD_READ_SYSTEM_PARAMETERS, &[])?;
    let reply = link.receive_payload()?;
    link.end_operation()?;
    SystemParameters::decode(&reply)
}

/// Check a transfer of `len` bytes at `address` and return the last
/// address it touches.
fn check_range(address: u64, len: usize, max_len: usize, max_address: u64) -> Result<u64> {
    if len == 0 || len > max_len {
        return Err(Error::bad_parameter(format!(
            "memory transfers carry 1 to {} bytes, not {}",
            max_len, len
        )));
    }
    let last = address + len as u64 - 1;
    if last > max_address {
        return Err(Error::bad_parameter(format!(
            "{} bytes at {:#X} run past the end of the address space",
            len, address
        )));
    }
    Ok(last)
}

fn read_memory<T: Transport>(link: &mut Link<T>, address: u16, len: usize) -> Result<MemorySnapshot> {
    let last = check_range(u64::from(address), len, MAX_MEMORY_TRANSFER, u64::from(u16::MAX))?;
    let mut request = address.to_be_bytes().to_vec();
    request.extend_from_slice(&(last as u16).to_be_bytes());
    simple_request(link, CMD_READ_MEMORY, &request)?;
    let reply = link.receive_payload()?;
    link.end_operation()?;
    MemorySnapshot::decode(&reply, MEMORY_SKIP, u32::from(address), len)
}

fn write_memory<T: Transport>(link: &mut Link<T>, address: u16, data: &[u8]) -> Result<()> {
    check_range(u64::from(address), data.len(), MAX_MEMORY_TRANSFER, u64::from(u16::MAX))?;
    link.begin_operation(CMD_WRITE_MEMORY)?;
    link.write_data(&address.to_be_bytes())?;
    link.write_data(data)?;
    link.request_end()?;
    link.end_operation()?;
    Ok(())
}

/// Both stack reads. A refusal still runs the closing handshake.
fn read_stack<T: Transport>(link: &mut Link<T>, command: u8) -> Result<Vec<u8>> {
    let status = simple_request(link, command, &[])?;
    if status == STATUS_REFUSED {
        link.end_operation()?;
        return Err(Error::ControllerBusy);
    }
    let reply = link.receive_payload()?;
    link.end_operation()?;
    Ok(reply)
}

fn change_run_mode<T: Transport>(link: &mut Link<T>, mode: RunMode) -> Result<Option<u8>> {
    link.begin_operation(CMD_RUN_MODE)?;
    link.write_byte(mode.code())?;
    link.request_end()?;
    let ack = match mode {
        RunMode::Stop => None,
        RunMode::Restart | RunMode::Reboot => {
            link.expect(STX)?;
            link.ack()?;
            let rc = link.read_any()?;
            link.expect_pair(DLE, ETX)?;
            link.ack()?;
            Some(rc)
        }
    };
    link.end_operation()?;
    if link.verbosity().shows_protocol() {
        debug!("run mode {:?} acknowledged with {:02X?}", mode, ack);
    }
    Ok(ack)
}

fn stop_via_system_data<T: Transport>(link: &mut Link<T>) -> Result<()> {
    let params = read_system_parameters(link)?;
    let address = params.system_data.wrapping_add(SD_CONTROL_OFFSET);
    let control = read_memory(link, address, SD_CONTROL_LEN)?;
    let update = [
        control.data[0] | SD_STOP_REQUEST,
        control.data[1] | SD_INTERRUPT_ENABLE,
    ];
    write_memory(link, address, &update)
}

fn identify_with<T: Transport>(
    link: &mut Link<T>,
    params: &SystemParameters,
) -> Result<Option<ControllerIdentity>> {
    if identify::needs_name(params) {
        let name = read_memory(link, params.name_address(), NAME_LEN)?;
        Ok(identify::identify(params, Some(&name.data)))
    } else {
        Ok(identify::identify(params, None))
    }
}

/// Block selection shared by the status module and step start requests.
fn block_request(block_type: BlockType, number: u8, offset: u16) -> [u8; 6] {
    let offset = offset.to_be_bytes();
    [offset[0], offset[1], 0x01, 0x00, block_type.code(), number]
}

fn write_operator<T: Transport>(link: &mut Link<T>, op: &Operator) -> Result<()> {
    link.write_byte(ITEM_MARKER)?;
    link.write_byte(op.kind.wire_code())?;
    if op.kind.sends_address() {
        link.write_data(&op.address.to_be_bytes())?;
    }
    Ok(())
}

fn step_operator(item: &Item) -> Result<Operator> {
    item.query().operator().cloned().ok_or(Error::UnknownItem)
}

/// One status sample: the run state, then the packed readings.
fn sample<T: Transport>(link: &mut Link<T>, list: &mut OperationList) -> Result<bool> {
    link.online_request(ONLINE_START)?;
    link.expect(STX)?;
    link.ack()?;
    link.expect(0x00)?;
    let run_state = link.read_any()?;
    link.expect(0x00)?;
    let reply = link.read_payload()?;
    link.ack()?;
    list.decode_readings(&reply)?;
    Ok(run_state == RUN_STATE_RUNNING)
}

fn online_stop<T: Transport>(link: &mut Link<T>) -> Result<()> {
    link.online_request(ONLINE_STOP)?;
    link.end_operation()?;
    Ok(())
}

/// The name area as text, without padding.
fn name_to_string(data: &[u8]) -> String {
    let text: Vec<u8> = data.iter().cloned().take_while(|&b| b != 0).collect();
    String::from_utf8_lossy(&text).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_payload, CR, DC4};
    use crate::identify::{Cpu, Family};
    use crate::mock::{MockTransport, Script, SilentTransport};
    use crate::oplist::{OperatorKind, OperatorReading, OperatorValue};
    use std::time::Instant;

    fn session(script: &Script) -> Session<MockTransport> {
        let _ = env_logger::builder().is_test(true).try_init();
        Session::new(script.transport(), &SessionConfig::default()).unwrap()
    }

    fn syspar_reply(cpu_id: u8, cpu_id2: u8) -> Vec<u8> {
        let params = SystemParameters {
            system_data: 0xEA00,
            end_ram: 0xE000,
            db_table_len: 6,
            cpu_id,
            cpu_id2,
            ..Default::default()
        };
        let mut reply = vec![0x00];
        reply.extend(params.encode());
        reply
    }

    fn syspar_exchange(script: Script, cpu_id: u8, cpu_id2: u8) -> Script {
        script
            .open(0x00)
            .accept()
            .payload(&syspar_reply(cpu_id, cpu_id2))
            .close_ok()
    }

    /// Host side of a request answered with one data frame.
    fn host_read(command: u8, request: &[u8]) -> Vec<u8> {
        let mut sent = vec![STX, command, DLE, ACK, DLE, ACK];
        sent.extend_from_slice(request);
        sent.extend_from_slice(&[DLE, EOT, DLE, ACK, DLE, ACK, DLE, ACK, DLE, ACK]);
        sent
    }

    /// Host side of a request with no data frame in the answer.
    fn host_simple(command: u8, request: &[u8]) -> Vec<u8> {
        let mut sent = vec![STX, command, DLE, ACK, DLE, ACK];
        sent.extend_from_slice(request);
        sent.extend_from_slice(&[DLE, EOT, DLE, ACK, DLE, ACK]);
        sent
    }

    const HOST_ONLINE_STOP: [u8; 6] = [STX, 0x81, DLE, ETX, DLE, ACK];
    const HOST_SAMPLE: [u8; 8] = [STX, 0x80, DLE, ETX, DLE, ACK, DLE, ACK];

    fn sample_reply(script: Script, run_state: u8, readings: &[u8]) -> Script {
        script
            .accept()
            .accept()
            .raw(&[STX, 0x00, run_state, 0x00])
            .raw(&encode_payload(readings))
    }

    #[test]
    fn check_read_system_parameters() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7);
        let mut s = session(&script);
        let p = s.read_system_parameters().unwrap();
        assert_eq!(p.system_data, 0xEA00);
        assert_eq!(p.cpu_id2, 0xB7);
        assert_eq!(s.last_error(), None);
        let t = s.close();
        assert_eq!(t.unread(), 0);
        assert_eq!(&t.sent()[..8], &[STX, 0x18, DLE, ACK, DLE, ACK, DLE, EOT]);
    }

    #[test]
    fn check_timeout_bound() {
        let config = SessionConfig {
            timeout_ms: 50,
            ..SessionConfig::default()
        };
        let mut s = Session::new(SilentTransport, &config).unwrap();
        let started = Instant::now();
        match s.read_system_parameters() {
            Err(Error::Timeout) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(s.last_error(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn check_empty_call_stack() {
        let script = Script::new().open(0x00).accept().payload(&[0x00]).close_ok();
        let mut s = session(&script);
        match s.read_call_stack() {
            Err(Error::StackUnavailable) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(s.last_error(), Some(ErrorKind::StackUnavailable));
        assert_eq!(s.close().unread(), 0);
    }

    #[test]
    fn check_call_stack_refused_in_run() {
        let script = Script::new().open(CR).accept().close_ok();
        let mut s = session(&script);
        match s.read_call_stack() {
            Err(Error::ControllerBusy) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        let t = s.close();
        assert_eq!(t.unread(), 0);
        // No frame is accepted between the request and the close.
        assert_eq!(
            t.sent(),
            &[STX, 0x1C, DLE, ACK, DLE, ACK, DLE, EOT, DLE, ACK, DLE, ACK]
        );
    }

    #[test]
    fn check_call_stack_frames() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .payload(&[0x00, 0x00, 0x02, 0x00, 0x2A])
            .close_ok();
        let mut s = session(&script);
        let stack = s.read_call_stack().unwrap();
        assert_eq!(stack.frames.len(), 1);
        assert_eq!(stack.frames[0].block_number, 2);
        assert_eq!(stack.frames[0].return_address, 0x2A);
    }

    #[test]
    fn check_delete_all_refused() {
        let script = Script::new().open(CR).accept().close_ok();
        let mut s = session(&script);
        match s.delete_all_blocks() {
            Err(Error::ControllerBusy) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(s.last_error(), Some(ErrorKind::ControllerBusy));
    }

    #[test]
    fn check_last_error_clears() {
        let script = Script::new()
            .raw(&[DLE, EOT])
            .open(0x00)
            .accept()
            .close_ok();
        let mut s = session(&script);
        assert!(s.compress_ram().is_err());
        assert_eq!(s.last_error(), Some(ErrorKind::UnexpectedByte));
        s.compress_ram().unwrap();
        assert_eq!(s.last_error(), None);
    }

    #[test]
    fn check_empty_address_table() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7);
        let mut s = session(&script);
        let table = s.read_address_table(BlockType::Pb).unwrap();
        assert_eq!(table.block_type, BlockType::Pb);
        assert!(table.addresses.is_empty());
        let t = s.close();
        assert_eq!(t.unread(), 0);
        // Only the system parameter exchange went out.
        assert_eq!(t.sent()[1], 0x18);
        assert!(!t.sent().contains(&0x1B));
    }

    #[test]
    fn check_read_block() {
        let reply = [
            0x00, 0x70, 0x70, 0x01, 0x02, 0x80, 0x00, 0x00, 0x00, 0x00, 0x06, 0x10, 0x00,
        ];
        let script = Script::new().open(0x00).accept().payload(&reply).close_ok();
        let mut s = session(&script);
        let block = s.read_block(BlockType::Db, 2).unwrap();
        assert_eq!(block.number(), 2);
        assert_eq!(block.body(), &[0x10, 0x00]);
        let t = s.close();
        assert_eq!(&t.sent()[6..8], &[0x01, 0x02]);
        assert_eq!(t.unread(), 0);
    }

    #[test]
    fn check_read_block_absent() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .payload(&[0x00])
            .close_soft(DC4);
        let mut s = session(&script);
        match s.read_block(BlockType::Pb, 9) {
            Err(Error::ModuleAbsent) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(s.close().unread(), 0);
    }

    #[test]
    fn check_delete_block_absent() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .close_soft(DC4)
            .close_ok();
        let mut s = session(&script);
        match s.delete_block(BlockType::Fb, 3) {
            Err(Error::ModuleAbsent) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(s.last_error(), Some(ErrorKind::ModuleAbsent));
        assert_eq!(s.close().unread(), 0);
    }

    #[test]
    fn check_write_block() {
        let block = Block::new(BlockType::Db, 2, vec![0x10, 0x00]).unwrap();
        let script = Script::new()
            .open(0x00)
            .accept()
            .raw(&[STX, HT, DLE, ETX])
            .accept()
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.write_block(&block).unwrap();
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let expected: &[u8] = &[
            STX, 0x08, DLE, ACK, DLE, ACK, // open
            0x01, 0x02, 0x00, 0x06, DLE, ETX, // announce
            DLE, ACK, DLE, ACK, // HT frame
            STX, NUL, // data frame
            0x70, 0x70, 0x01, 0x02, 0x80, 0x00, 0x00, 0x00, 0x00, 0x06, 0x10, 0x10, 0x00,
            DLE, EOT, // done
            DLE, ACK, DLE, ACK, // close
        ];
        assert_eq!(t.sent(), expected);
    }

    #[test]
    fn check_memory_limits() {
        let script = Script::new();
        let mut s = session(&script);
        for len in [0usize, MAX_MEMORY_TRANSFER + 1].iter() {
            match s.read_memory(0x0000, *len) {
                Err(Error::BadParameter(_)) => {}
                e => panic!("Did not expect: {:?}", e),
            }
        }
        assert!(s.read_memory(0xFFFF, 2).is_err());
        assert!(s.write_memory32(0, &[0u8; MAX_MEMORY_TRANSFER32 + 1]).is_err());
        assert_eq!(s.last_error(), Some(ErrorKind::BadParameter));
        assert!(s.close().sent().is_empty());
    }

    #[test]
    fn check_read_memory() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .payload(&[0x00, 0xEA, 0x00, 0xEA, 0x01, 0xAB, 0xCD])
            .close_ok();
        let mut s = session(&script);
        let m = s.read_memory(0xEA00, 2).unwrap();
        assert_eq!(m.data, vec![0xAB, 0xCD]);
        assert_eq!(m.address, 0xEA00);
        assert_eq!(&s.close().sent()[6..10], &[0xEA, 0x00, 0xEA, 0x01]);
    }

    #[test]
    fn check_read_memory32_request() {
        let mut reply = vec![0u8; 9];
        reply.extend_from_slice(&[1, 2, 3, 4]);
        let script = Script::new().open(0x00).accept().payload(&reply).close_ok();
        let mut s = session(&script);
        let m = s.read_memory32(0x0001_0000, 4).unwrap();
        assert_eq!(m.data, vec![1, 2, 3, 4]);
        assert_eq!(
            &s.close().sent()[6..14],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x03]
        );
    }

    #[test]
    fn check_stop_via_system_data() {
        let mut control = vec![0u8; 5];
        control.extend_from_slice(&[0x01, 0x02, 0, 0, 0, 0, 0, 0]);
        let script = syspar_exchange(Script::new(), 0x00, 0x01)
            .open(0x00)
            .accept()
            .payload(&control)
            .close_ok()
            .open(0x00)
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.stop_via_system_data().unwrap();
        let t = s.close();
        assert_eq!(t.unread(), 0);
        assert!(t.sent().ends_with(&[
            STX, 0x03, DLE, ACK, DLE, ACK, 0xEA, 0x0C, 0x81, 0x06, DLE, EOT, DLE, ACK, DLE, ACK
        ]));
    }

    #[test]
    fn check_identify_large_family() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7);
        let mut s = session(&script);
        let id = s.identify_controller().unwrap().unwrap();
        assert_eq!(id.family, Family::Ag135U);
        assert_eq!(id.cpu, Cpu::Cpu928B);
        assert_eq!(s.close().unread(), 0);
    }

    #[test]
    fn check_identify_small_family_reads_name() {
        let mut name = vec![0u8; 5];
        name.extend_from_slice(b"CPU 103     ");
        let script = syspar_exchange(Script::new(), 0x00, 0x01)
            .open(0x00)
            .accept()
            .payload(&name)
            .close_ok();
        let mut s = session(&script);
        let id = s.identify_controller().unwrap().unwrap();
        assert_eq!(id.cpu, Cpu::Cpu103);
        let t = s.close();
        // The name lives at system data + 80.
        assert!(t.sent().windows(4).any(|w| w == [0xEA, 0x50, 0xEA, 0x5B]));
    }

    #[test]
    fn check_restart_needs_run_mode_command() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7)
            .open(0x00)
            .accept()
            .raw(&[STX, 0x25, DLE, ETX])
            .close_ok();
        let mut s = session(&script);
        assert_eq!(s.restart_controller().unwrap(), Some(0x25));
        assert_eq!(s.close().unread(), 0);
    }

    #[test]
    fn check_change_run_mode_stop() {
        let script = Script::new().open(0x00).accept().close_ok();
        let mut s = session(&script);
        assert_eq!(s.change_run_mode(RunMode::Stop).unwrap(), None);
        let t = s.close();
        assert_eq!(&t.sent()[6..9], &[0x00, DLE, EOT]);
    }

    #[test]
    fn check_list_kinds_on_session() {
        let mut s = session(&Script::new());
        match s.add_output(0, 0, "AB 0") {
            Err(Error::NoList(ListKind::ControlOutput)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        s.create_list(ListKind::StatusVariable).unwrap();
        match s.create_list(ListKind::StatusModule) {
            Err(Error::ListOpen(ListKind::StatusVariable)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        match s.add_status_operator(Operator::new(OperatorKind::Flag, 0), "U M 0.0") {
            Err(Error::WrongListKind { .. }) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        match s.status_module_run() {
            Err(Error::NoList(ListKind::StatusModule)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(s.destroy_list().unwrap().kind(), ListKind::StatusVariable);
        s.create_list(ListKind::StatusModule).unwrap();
        assert!(s.close().sent().is_empty());
    }

    #[test]
    fn check_status_module_load_and_flag() {
        let readings = [
            0xC1, 0x02, 0x01, 0x00, 0x12, 0x34, 0x00, 0x07, // L MW 20
            0xC1, 0x04, 0x00, 0x02, // U M 20.1
        ];
        let script = Script::new()
            .open(0x00)
            .accept()
            .raw(&[STX, 0x10, 0x10, DLE, ETX])
            .accept()
            .accept()
            .raw(&[STX, 0x00, 0xFF, 0x00])
            .raw(&encode_payload(&readings));
        let mut s = session(&script);
        s.create_list(ListKind::StatusModule).unwrap();
        let load = s
            .add_status_operator(Operator::new(OperatorKind::Load, 0), "L MW 20")
            .unwrap();
        let flag = s
            .add_status_operator(Operator::new(OperatorKind::Flag, 0x0014), "U M 20.1")
            .unwrap();
        s.status_module_start(BlockType::Pb, 1, 0).unwrap();
        assert!(s.status_module_run().unwrap());

        let list = s.list().unwrap();
        match list.get(load).unwrap().reading() {
            Some(Reading::Operator(OperatorReading {
                value: OperatorValue::Accumulators { akku1: 0x1234, .. },
                ..
            })) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        match list.get(flag).unwrap().reading() {
            Some(Reading::Operator(OperatorReading {
                ag_addr: 0xC104,
                value: OperatorValue::Byte(0x02),
                ..
            })) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let start: &[u8] = &[
            STX, 0x15, DLE, ACK, DLE, ACK, // open
            0x00, 0x00, 0x01, 0x00, 0x04, 0x01, // PB 1 from word 0
            0x10, 0x36, // load, no address
            0x10, 0x32, 0x00, 0x14, // flag byte 20
            DLE, EOT,
        ];
        assert_eq!(&t.sent()[..start.len()], start);
    }

    #[test]
    fn check_status_module_short_reply() {
        let script = Script::new()
            .accept()
            .accept()
            .raw(&[STX, 0x00, 0xFF, 0x00])
            .raw(&encode_payload(&[0u8; 11]));
        let mut s = session(&script);
        s.create_list(ListKind::StatusModule).unwrap();
        s.add_status_operator(Operator::new(OperatorKind::Load, 0), "")
            .unwrap();
        s.add_status_operator(Operator::new(OperatorKind::Flag, 0), "")
            .unwrap();
        match s.status_module_run() {
            Err(Error::Decode(_)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(s.last_error(), Some(ErrorKind::DecodeError));
    }

    #[test]
    fn check_status_variable_session() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .raw(&[STX, 0x10, 0x10, DLE, ETX])
            .accept()
            .accept()
            .raw(&[STX, 0x00, 0x00, 0x00])
            .raw(&encode_payload(&[0x00, 0x00, 0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A]))
            .accept()
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.create_list(ListKind::StatusVariable).unwrap();
        let mb = s.add_status_variable(VarSource::Flag, 7, "MB 7").unwrap();
        let z = s.add_status_variable(VarSource::Counter, 1, "Z 1").unwrap();
        s.status_variable_start().unwrap();
        // Controller in STOP: the run state byte is zero.
        assert!(!s.status_variable_run().unwrap());
        s.status_variable_stop().unwrap();

        let list = s.list().unwrap();
        match list.get(mb).unwrap().reading() {
            Some(Reading::Variable(v)) => assert_eq!(v.byte(), Some(0x5A)),
            e => panic!("Did not expect: {:?}", e),
        }
        match list.get(z).unwrap().reading() {
            Some(Reading::Variable(v)) => assert_eq!(v.counter().unwrap().value(), 42),
            e => panic!("Did not expect: {:?}", e),
        }
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let start: &[u8] = &[
            STX, 0x14, DLE, ACK, DLE, ACK, // open
            0x00, 0x00, 0x00, 0x00, 0x10, 0x10, 0x3F, // preamble
            0x10, 0x32, 0x00, 0x07, // MB 7
            0x10, 0x33, 0x00, 0x01, // Z 1
            DLE, EOT,
        ];
        assert_eq!(&t.sent()[..start.len()], start);
    }

    #[test]
    fn check_step_start_and_continue() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .payload(&[0xAA, 0xBB, 0xCC, 0xC0, 0x20, 0x01, 0x01])
            .close_ok()
            .open(0x00)
            .accept()
            .payload(&[0xAA, 0xC0, 0x22, 0x00, 0x00])
            .close_ok();
        let mut s = session(&script);
        s.create_list(ListKind::StepModule).unwrap();
        let first = s
            .add_step_operator(Operator::new(OperatorKind::Flag, 0x0014), "U M 20.0")
            .unwrap();
        let second = s
            .add_step_operator(Operator::new(OperatorKind::NoParameter, 0), "BE")
            .unwrap();
        let (id, reading) = s.step_start(BlockType::Ob, 1, 0).unwrap();
        assert_eq!(id, first);
        assert_eq!(
            reading,
            Reading::Operator(OperatorReading {
                ag_addr: 0xC020,
                rlo: 1,
                value: OperatorValue::Byte(0x01),
            })
        );
        let next = s.list().unwrap().next_after(first).unwrap().id();
        assert_eq!(next, second);
        match s.step_continue(next).unwrap() {
            Reading::Operator(r) => assert_eq!(r.ag_addr, 0xC022),
            e => panic!("Did not expect: {:?}", e),
        }
        let t = s.close();
        assert_eq!(t.unread(), 0);
        // Step continue is command 0x10, so it goes out doubled.
        let cont: &[u8] = &[STX, 0x10, 0x10, DLE, ACK, DLE, ACK, 0x10, 0x35, DLE, EOT];
        assert!(t.sent().windows(cont.len()).any(|w| w == cont));
    }

    #[test]
    fn check_output_run_rejects() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .raw(&[STX, FS, 0x41, DLE, ETX, STX, DC2, DLE, ETX]);
        let mut s = session(&script);
        s.create_list(ListKind::ControlOutput).unwrap();
        s.add_output(64, 0xFF, "AB 64").unwrap();
        s.add_output(65, 0x01, "AB 65").unwrap();
        assert_eq!(s.output_run().unwrap(), vec![0x41]);
        let t = s.close();
        assert_eq!(t.unread(), 0);
        assert_eq!(&t.sent()[6..12], &[0x40, 0xFF, 0x41, 0x01, DLE, EOT]);
    }

    #[test]
    fn check_output_init_in_run() {
        let script = Script::new().open(0x00).accept().raw(&[STX, DC2, DLE, ETX]);
        let mut s = session(&script);
        match s.output_init() {
            Err(Error::ControllerBusy) => {}
            e => panic!("Did not expect: {:?}", e),
        }
        let t = s.close();
        // The frame is finished before the refusal is reported.
        assert_eq!(t.unread(), 0);
        assert!(t.sent().ends_with(&[DLE, ACK, DLE, ACK]));
    }

    #[test]
    fn check_output_init_and_stop() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .raw(&[STX, 0x10, 0x10, DLE, ETX])
            .accept()
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.output_init().unwrap();
        s.output_stop().unwrap();
        assert_eq!(s.last_error(), None);
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = vec![STX, 0x17, DLE, ACK, DLE, ACK, DLE, EOT, DLE, ACK, DLE, ACK];
        expected.extend_from_slice(&HOST_ONLINE_STOP);
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_step_init_and_stop() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .close_ok()
            .accept()
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.step_init().unwrap();
        s.step_stop().unwrap();
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = host_simple(0x16, &[]);
        expected.extend_from_slice(&HOST_ONLINE_STOP);
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_watch_status_module_until_told() {
        let script = sample_reply(Script::new(), 0xFF, &[0xC1, 0x04, 0x00, 0x01]);
        let script = sample_reply(script, 0xFF, &[0xC1, 0x04, 0x00, 0x02])
            .accept()
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.create_list(ListKind::StatusModule).unwrap();
        s.add_status_operator(Operator::new(OperatorKind::Flag, 0x0014), "U M 20.1")
            .unwrap();
        let mut seen = Vec::new();
        let stopped = s
            .watch_status_module(|list| {
                match list.first().and_then(|item| item.reading()) {
                    Some(Reading::Operator(r)) => seen.push(r.value),
                    e => panic!("Did not expect: {:?}", e),
                }
                seen.len() < 2
            })
            .unwrap();
        assert!(stopped);
        assert_eq!(seen, vec![OperatorValue::Byte(0x01), OperatorValue::Byte(0x02)]);
        s.status_module_stop().unwrap();
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = HOST_SAMPLE.to_vec();
        expected.extend_from_slice(&HOST_SAMPLE);
        expected.extend_from_slice(&HOST_ONLINE_STOP);
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_watch_status_module_leaves_run() {
        let script = sample_reply(Script::new(), 0xFF, &[0xC1, 0x04, 0x00, 0x01]);
        let script = sample_reply(script, 0x00, &[0xC1, 0x04, 0x00, 0x02]);
        let mut s = session(&script);
        s.create_list(ListKind::StatusModule).unwrap();
        let flag = s
            .add_status_operator(Operator::new(OperatorKind::Flag, 0x0014), "U M 20.1")
            .unwrap();
        let mut calls = 0;
        let stopped = s
            .watch_status_module(|_| {
                calls += 1;
                true
            })
            .unwrap();
        assert!(!stopped);
        assert_eq!(calls, 1);
        // The last sample is still decoded.
        match s.list().unwrap().get(flag).unwrap().reading() {
            Some(Reading::Operator(r)) => assert_eq!(r.value, OperatorValue::Byte(0x02)),
            e => panic!("Did not expect: {:?}", e),
        }
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = HOST_SAMPLE.to_vec();
        expected.extend_from_slice(&HOST_SAMPLE);
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_read_interrupt_stack() {
        let script = Script::new()
            .open(0x00)
            .accept()
            .payload(&[0x00, 0x81, 0x04, 0x00])
            .close_ok();
        let mut s = session(&script);
        let stack = s.read_interrupt_stack().unwrap();
        assert_eq!(stack.data, vec![0x81, 0x04, 0x00]);
        assert_eq!(stack.status_bit(1, 7), Some(true));
        assert_eq!(stack.status_bit(2, 2), Some(true));
        assert_eq!(stack.status_bit(3, 0), Some(false));
        let t = s.close();
        assert_eq!(t.unread(), 0);
        assert_eq!(t.sent(), &host_read(0x1D, &[])[..]);
    }

    #[test]
    fn check_read_ram_info() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7)
            .open(0x00)
            .accept()
            .payload(&[0x00, 0xC0, 0x00, 0xD0, 0x00])
            .close_ok();
        let mut s = session(&script);
        let ram = s.read_ram_info().unwrap();
        assert_eq!(ram.start_ram, 0xC000);
        assert_eq!(ram.begin_free_ram, 0xD000);
        // The end comes from the system parameters.
        assert_eq!(ram.end_ram, 0xE000);
        assert_eq!(ram.free_bytes(), 0x2000);
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = host_read(0x18, &[]);
        expected.extend(host_read(0x19, &[]));
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_read_module_info() {
        let reply = [
            0x00, 0xC0, 0x12, 0x70, 0x70, 0x08, 0x03, 0x80, 0x00, 0x00, 0x00, 0x00, 0x20,
        ];
        let script = Script::new().open(0x00).accept().payload(&reply).close_ok();
        let mut s = session(&script);
        let info = s.read_module_info(BlockType::Fb, 3).unwrap();
        assert_eq!(info.ram_address, 0xC012);
        assert_eq!(info.header.block_type(), Some(BlockType::Fb));
        assert_eq!(info.header.number, 3);
        assert_eq!(info.header.length_words, 0x20);
        let t = s.close();
        assert_eq!(t.unread(), 0);
        assert_eq!(t.sent(), &host_read(0x1A, &[0x08, 0x03])[..]);
    }

    #[test]
    fn check_read_controller_name() {
        let mut name = vec![0u8; 5];
        name.extend_from_slice(b"CPU 928B\0\0\0\0");
        let script = syspar_exchange(Script::new(), 0x02, 0xB7)
            .open(0x00)
            .accept()
            .payload(&name)
            .close_ok();
        let mut s = session(&script);
        assert_eq!(s.read_controller_name().unwrap(), "CPU 928B");
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = host_read(0x18, &[]);
        expected.extend(host_read(0x04, &[0xEA, 0x50, 0xEA, 0x5B]));
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_read_address_table() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7)
            .open(0x00)
            .accept()
            .payload(&[0x00, 0x00, 0x00, 0xC1, 0x20, 0xC2, 0x40])
            .close_ok();
        let mut s = session(&script);
        let table = s.read_address_table(BlockType::Db).unwrap();
        assert_eq!(table.addresses, vec![0x0000, 0xC120, 0xC240]);
        assert_eq!(table.address(0), None);
        assert_eq!(table.address(1), Some(0xC120));
        assert_eq!(table.present().count(), 2);
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = host_read(0x18, &[]);
        expected.extend(host_read(0x1B, &[0x01]));
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_stop_controller_with_run_mode_command() {
        let script = syspar_exchange(Script::new(), 0x02, 0xB7)
            .open(0x00)
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.stop_controller().unwrap();
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = host_read(0x18, &[]);
        expected.extend(host_simple(0x1E, &[0x00]));
        assert_eq!(t.sent(), &expected[..]);
    }

    #[test]
    fn check_stop_controller_via_system_data() {
        let mut name = vec![0u8; 5];
        name.extend_from_slice(b"CPU 102     ");
        let mut control = vec![0u8; 5];
        control.extend_from_slice(&[0x01, 0x02, 0, 0, 0, 0, 0, 0]);
        let script = syspar_exchange(Script::new(), 0x00, 0x01)
            .open(0x00)
            .accept()
            .payload(&name)
            .close_ok();
        let script = syspar_exchange(script, 0x00, 0x01)
            .open(0x00)
            .accept()
            .payload(&control)
            .close_ok()
            .open(0x00)
            .accept()
            .close_ok();
        let mut s = session(&script);
        s.stop_controller().unwrap();
        let t = s.close();
        assert_eq!(t.unread(), 0);
        let mut expected = host_read(0x18, &[]);
        expected.extend(host_read(0x04, &[0xEA, 0x50, 0xEA, 0x5B]));
        expected.extend(host_read(0x18, &[]));
        expected.extend(host_read(0x04, &[0xEA, 0x0C, 0xEA, 0x13]));
        expected.extend(host_simple(0x03, &[0xEA, 0x0C, 0x81, 0x06]));
        assert_eq!(t.sent(), &expected[..]);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
