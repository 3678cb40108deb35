//! Work out which S5 controller is on the other end of the link.
//!
//! The system parameters carry two identification bytes. The low two bits
//! of `cpu_id` split the range in two:
//!
//! * `0`: the smaller controllers (AG 100U, AG 115U). `cpu_id2 & 0x0F` names
//!   the family and the CPU comes from the name string the controller keeps
//!   at `system_data + 80`.
//! * `2`: the larger controllers. `cpu_id2 & 0x0F` names the family
//!   (7 = AG 135U, 8 = AG 155U) and `cpu_id2 & 0xF0` the CPU.
//!
//! Anything else is unknown. Nothing here guesses.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::records::SystemParameters;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Family {
    Ag100U,
    Ag115U,
    Ag135U,
    Ag155U,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Cpu {
    Cpu100,
    Cpu102,
    Cpu103,
    Cpu941,
    Cpu942,
    Cpu943,
    Cpu944,
    Cpu945,
    Cpu921,
    Cpu922,
    Cpu928,
    Cpu928B,
    Cpu948,
    Cpu948R,
}

/// Accumulator width, which decides the load and transfer record layout in
/// status and step replies.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LoadWidth {
    /// 16 bit accumulators
    Narrow,
    /// 32 bit accumulators
    Wide,
}

/// A recognised controller.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ControllerIdentity {
    pub family: Family,
    pub cpu: Cpu,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Where the name string lives, relative to the system data area.
pub const NAME_OFFSET: u16 = 80;

/// Bytes read from the name area.
pub const NAME_LEN: usize = 12;

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

/// Significant characters of the name string.
const NAME_MATCH_LEN: usize = 7;

const AG100U_CPUS: [Cpu; 3] = [Cpu::Cpu100, Cpu::Cpu102, Cpu::Cpu103];

const AG115U_CPUS: [Cpu; 5] = [
    Cpu::Cpu941,
    Cpu::Cpu942,
    Cpu::Cpu943,
    Cpu::Cpu944,
    Cpu::Cpu945,
];

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl Family {
    pub fn code(self) -> u16 {
        match self {
            Family::Ag100U => 0x0003,
            Family::Ag115U => 0x0006,
            Family::Ag135U => 0x0008,
            Family::Ag155U => 0x000B,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Ag100U => "AG 100U",
            Family::Ag115U => "AG 115U",
            Family::Ag135U => "AG 135U",
            Family::Ag155U => "AG 155U",
        }
    }

    /// Whether the controller implements the run mode command. The others
    /// are stopped through their system data and cannot be restarted from
    /// the programming port.
    pub fn has_run_mode_command(self) -> bool {
        matches!(self, Family::Ag135U | Family::Ag155U)
    }
}

impl Cpu {
    pub fn code(self) -> u16 {
        match self {
            Cpu::Cpu100 => 0x0021,
            Cpu::Cpu102 => 0x0023,
            Cpu::Cpu103 => 0x0024,
            Cpu::Cpu941 => 0x0041,
            Cpu::Cpu942 => 0x0042,
            Cpu::Cpu943 => 0x0043,
            Cpu::Cpu944 => 0x0044,
            Cpu::Cpu945 => 0x0045,
            Cpu::Cpu921 => 0x0051,
            Cpu::Cpu922 => 0x0052,
            Cpu::Cpu928 => 0x0061,
            Cpu::Cpu928B => 0x0062,
            Cpu::Cpu948 => 0x0071,
            Cpu::Cpu948R => 0x0072,
        }
    }

    /// The name as the controller reports it.
    pub fn name(self) -> &'static str {
        match self {
            Cpu::Cpu100 => "CPU 100",
            Cpu::Cpu102 => "CPU 102",
            Cpu::Cpu103 => "CPU 103",
            Cpu::Cpu941 => "CPU 941",
            Cpu::Cpu942 => "CPU 942",
            Cpu::Cpu943 => "CPU 943",
            Cpu::Cpu944 => "CPU 944",
            Cpu::Cpu945 => "CPU 945",
            Cpu::Cpu921 => "CPU 921",
            Cpu::Cpu922 => "CPU 922",
            Cpu::Cpu928 => "CPU 928",
            Cpu::Cpu928B => "CPU 928B",
            Cpu::Cpu948 => "CPU 948",
            Cpu::Cpu948R => "CPU 948R",
        }
    }
}

impl ControllerIdentity {
    pub fn load_width(&self) -> LoadWidth {
        match self.cpu {
            Cpu::Cpu928 | Cpu::Cpu928B | Cpu::Cpu948 | Cpu::Cpu948R => LoadWidth::Wide,
            _ => LoadWidth::Narrow,
        }
    }

    /// Whether memory beyond 64 KiB is reached with the 32 bit memory
    /// commands.
    pub fn wide_addresses(&self) -> bool {
        self.family == Family::Ag155U
    }
}

/// Whether identification needs the name string from controller RAM.
pub fn needs_name(params: &SystemParameters) -> bool {
    params.cpu_id & 0x03 == 0x00
}

/// Identify the controller. `name` is the content of the name area, and is
/// only consulted for the controllers that need it (see [`needs_name`]).
pub fn identify(params: &SystemParameters, name: Option<&[u8]>) -> Option<ControllerIdentity> {
    let family_nibble = params.cpu_id2 & 0x0F;
    let model_nibble = params.cpu_id2 & 0xF0;
    match params.cpu_id & 0x03 {
        0x00 => {
            let (family, table): (Family, &[Cpu]) = match family_nibble {
                0x01 => (Family::Ag100U, &AG100U_CPUS),
                0x04 => (Family::Ag115U, &AG115U_CPUS),
                _ => return None,
            };
            let cpu = lookup_name(table, name?)?;
            Some(ControllerIdentity { family, cpu })
        }
        0x02 => {
            let (family, cpu) = match (family_nibble, model_nibble) {
                (0x07, 0xB0) => (Family::Ag135U, Cpu::Cpu928B),
                (0x07, 0x10) => (Family::Ag135U, Cpu::Cpu922),
                (0x08, 0x30) => (Family::Ag155U, Cpu::Cpu948R),
                (0x08, 0x20) => (Family::Ag155U, Cpu::Cpu948),
                _ => return None,
            };
            Some(ControllerIdentity { family, cpu })
        }
        _ => None,
    }
}

/// The accumulator width to decode with. An unknown controller is decoded
/// as narrow, and that is logged.
pub fn load_width_or_fallback(identity: Option<&ControllerIdentity>) -> LoadWidth {
    match identity {
        Some(id) => id.load_width(),
        None => {
            warn!("unknown controller, assuming 16 bit accumulators");
            LoadWidth::Narrow
        }
    }
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

/// Prefix match of the reported name against a family's table. When more
/// than one entry matches, the last wins.
fn lookup_name(table: &[Cpu], name: &[u8]) -> Option<Cpu> {
    let significant: Vec<u8> = name
        .iter()
        .take(NAME_MATCH_LEN)
        .take_while(|&&b| b != 0)
        .cloned()
        .collect();
    if significant.is_empty() {
        return None;
    }
    table
        .iter()
        .rev()
        .find(|cpu| cpu.name().as_bytes().starts_with(&significant))
        .cloned()
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
