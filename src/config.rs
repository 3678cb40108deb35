//! Session configuration.
//!
//! A session is described by a small TOML document:
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! timeout_ms = 1000
//! verbosity = "protocol"
//! ```
//!
//! Every field is optional and falls back to the defaults below.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::MIN_SCRATCH_SIZE;
use crate::transport::AS511_BAUD_RATE;
use crate::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// How a session is opened and how much it logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device, e.g. `/dev/ttyS0` or `COM1`.
    pub port: String,
    pub baud_rate: u32,
    /// How long to wait for each byte, in milliseconds.
    pub timeout_ms: u64,
    /// Upper bound on a single response, in bytes.
    pub scratch_size: usize,
    pub verbosity: Verbosity,
}

/// How much protocol detail a session writes to the log.
///
/// Each level includes the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Channel setup and teardown.
    System,
    /// One line per operation, plus handshake anomalies.
    Protocol,
    /// Every byte in both directions.
    Wire,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            port: default_port(),
            baud_rate: AS511_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            scratch_size: MIN_SCRATCH_SIZE,
            verbosity: Verbosity::Quiet,
        }
    }
}

impl SessionConfig {
    /// A default configuration for the given serial device.
    pub fn for_port(port: impl Into<String>) -> SessionConfig {
        SessionConfig {
            port: port.into(),
            ..SessionConfig::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<SessionConfig> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<SessionConfig> {
        let content = fs::read_to_string(path)?;
        SessionConfig::from_toml_str(&content)
    }

    /// Check the values a session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::bad_parameter("timeout_ms must be greater than zero"));
        }
        if self.scratch_size < MIN_SCRATCH_SIZE {
            return Err(Error::bad_parameter(format!(
                "scratch_size must be at least {} bytes",
                MIN_SCRATCH_SIZE
            )));
        }
        if self.port.is_empty() {
            return Err(Error::bad_parameter("port must not be empty"));
        }
        Ok(())
    }

    /// The per-byte timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Verbosity {
    pub fn shows_system(self) -> bool {
        self >= Verbosity::System
    }

    pub fn shows_protocol(self) -> bool {
        self >= Verbosity::Protocol
    }

    pub fn shows_wire(self) -> bool {
        self >= Verbosity::Wire
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Quiet
    }
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

#[cfg(windows)]
fn default_port() -> String {
    "COM1".to_string()
}

#[cfg(not(windows))]
fn default_port() -> String {
    "/dev/ttyS0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.baud_rate, 9600);
        assert_eq!(c.timeout(), Duration::from_millis(1000));
        assert_eq!(c.scratch_size, 65536);
        assert_eq!(c.verbosity, Verbosity::Quiet);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn check_partial_toml() {
        let c = SessionConfig::from_toml_str(
            r#"
            port = "/dev/ttyUSB0"
            timeout_ms = 250
            verbosity = "wire"
            "#,
        )
        .unwrap();
        assert_eq!(c.port, "/dev/ttyUSB0");
        assert_eq!(c.timeout_ms, 250);
        assert_eq!(c.baud_rate, 9600);
        assert!(c.verbosity.shows_wire());
        assert!(c.verbosity.shows_protocol());
    }

    #[test]
    fn check_rejects_zero_timeout() {
        match SessionConfig::from_toml_str("timeout_ms = 0") {
            Err(Error::BadParameter(_)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
    }

    #[test]
    fn check_rejects_small_scratch() {
        match SessionConfig::from_toml_str("scratch_size = 1024") {
            Err(Error::BadParameter(_)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
    }

    #[test]
    fn check_syntax_error() {
        match SessionConfig::from_toml_str("port = ") {
            Err(Error::Config(_)) => {}
            e => panic!("Did not expect: {:?}", e),
        }
    }

    #[test]
    fn check_verbosity_order() {
        assert!(!Verbosity::Quiet.shows_system());
        assert!(Verbosity::System.shows_system());
        assert!(!Verbosity::System.shows_protocol());
        assert!(!Verbosity::Protocol.shows_wire());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
