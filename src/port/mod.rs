//! Serial port ownership for the two sensor roles.
//!
//! The registry keeps one configured endpoint per [`SensorRole`] and the
//! currently open handle, if any. Opening goes through the [`PortOpener`]
//! seam so the acquisition loop can be exercised without hardware.

pub mod config;
pub mod serial;

use crate::reading::SensorRole;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Parity setting of a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Link parameters of one sensor port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    pub role: SensorRole,
    /// OS device identifier, e.g. `/dev/ttyUSB0` or `COM3`
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    /// Upper bound for a single read call
    pub read_timeout: Duration,
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.data_bits {
            DataBits::Five => '5',
            DataBits::Six => '6',
            DataBits::Seven => '7',
            DataBits::Eight => '8',
        };
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop = match self.stop_bits {
            StopBits::One => '1',
            StopBits::Two => '2',
        };
        write!(
            f,
            "{} @ {} {bits}{parity}{stop}",
            self.device, self.baud_rate
        )
    }
}

/// One line of bytes as read from a port, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine(pub Vec<u8>);

impl RawLine {
    /// Decode as ASCII. Non-ASCII bytes are dropped, control bytes become
    /// spaces, and surrounding whitespace is trimmed.
    pub fn text(&self) -> String {
        let text: String = self
            .0
            .iter()
            .filter(|b| b.is_ascii())
            .map(|&b| if b.is_ascii_control() { ' ' } else { char::from(b) })
            .collect();
        text.trim().to_string()
    }
}

impl From<&str> for RawLine {
    fn from(s: &str) -> Self {
        RawLine(s.as_bytes().to_vec())
    }
}

/// A port could not be opened.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpenError {
    #[error("Cannot open {device} for {role}: {reason}")]
    Unavailable {
        role: SensorRole,
        device: String,
        reason: String,
    },
    #[error("No port configured for {0}")]
    NotConfigured(SensorRole),
}

/// I/O failure on an open port. The handle must not be used again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("I/O error on {role}: {reason}")]
    Io { role: SensorRole, reason: String },
    #[error("{0} port is not open")]
    NotOpen(SensorRole),
}

/// An open serial handle.
pub trait SerialLink: Send {
    /// Read one complete line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when no complete line arrived in time.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<RawLine>, TransportError>;

    /// Write a command to the instrument.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Opens serial handles from their configuration.
pub trait PortOpener: Send {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialLink>, OpenError>;
}

/// Owns the configured endpoints and their open handles.
pub struct PortRegistry {
    opener: Box<dyn PortOpener>,
    configs: BTreeMap<SensorRole, PortConfig>,
    handles: BTreeMap<SensorRole, Box<dyn SerialLink>>,
}

impl PortRegistry {
    pub fn new(opener: Box<dyn PortOpener>) -> Self {
        Self {
            opener,
            configs: BTreeMap::new(),
            handles: BTreeMap::new(),
        }
    }

    /// Store `configs` and open every port.
    ///
    /// A role that fails to open is logged and stays closed; the others are
    /// still opened. The first failure is returned for reporting.
    pub fn open(&mut self, configs: BTreeMap<SensorRole, PortConfig>) -> Result<(), OpenError> {
        self.close_all();
        self.configs = configs;

        let mut first_error = None;
        for role in self.roles() {
            if let Err(e) = self.reopen(role) {
                error!(%role, error = %e, "failed to open port");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Open the port of `role` again using its original configuration.
    pub fn reopen(&mut self, role: SensorRole) -> Result<(), OpenError> {
        let config = self
            .configs
            .get(&role)
            .ok_or(OpenError::NotConfigured(role))?;
        self.handles.remove(&role);
        let link = self.opener.open(config)?;
        info!(%role, port = %config, "port opened");
        self.handles.insert(role, link);
        Ok(())
    }

    /// Close the port of `role`. Closing a closed port is a no-op.
    pub fn close(&mut self, role: SensorRole) {
        if self.handles.remove(&role).is_some() {
            info!(%role, "port closed");
        }
    }

    pub fn close_all(&mut self) {
        for role in SensorRole::ALL {
            self.close(role);
        }
    }

    /// Configured roles, in role order.
    pub fn roles(&self) -> Vec<SensorRole> {
        self.configs.keys().copied().collect()
    }

    pub fn config(&self, role: SensorRole) -> Option<&PortConfig> {
        self.configs.get(&role)
    }

    pub fn is_open(&self, role: SensorRole) -> bool {
        self.handles.contains_key(&role)
    }

    /// Read one line from `role`.
    ///
    /// A transport error drops the handle before it is returned, so the port
    /// reads as closed until it is reopened.
    pub fn read_line(
        &mut self,
        role: SensorRole,
        timeout: Duration,
    ) -> Result<Option<RawLine>, TransportError> {
        let link = self
            .handles
            .get_mut(&role)
            .ok_or(TransportError::NotOpen(role))?;
        let result = link.read_line(timeout);
        if result.is_err() {
            self.handles.remove(&role);
            debug!(%role, "dropped failed port handle");
        }
        result
    }

    /// Write a command to `role`. Failures drop the handle like read errors.
    pub fn write(&mut self, role: SensorRole, bytes: &[u8]) -> Result<(), TransportError> {
        let link = self
            .handles
            .get_mut(&role)
            .ok_or(TransportError::NotOpen(role))?;
        let result = link.write_all(bytes);
        if result.is_err() {
            self.handles.remove(&role);
        }
        result
    }
}

impl Drop for PortRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
