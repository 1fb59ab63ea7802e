//! `serialport`-backed implementation of the port seam.
//!
//! Reads return whatever bytes arrive within the timeout; a [`LineBuffer`]
//! assembles them into lines across calls, so a slow instrument never holds
//! a read open longer than one timeout.

use super::{
    DataBits, OpenError, Parity, PortConfig, PortOpener, RawLine, SerialLink, StopBits,
    TransportError,
};
use crate::reading::SensorRole;
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::warn;

/// Longest line kept while waiting for a terminator.
pub const MAX_LINE_LENGTH: usize = 1024;

const READ_CHUNK_SIZE: usize = 256;

impl From<Parity> for serialport::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Opens real serial devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialLink>, OpenError> {
        let port = serialport::new(&config.device, config.baud_rate)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(serialport::FlowControl::None)
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| OpenError::Unavailable {
                role: config.role,
                device: config.device.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SerialPortLink {
            role: config.role,
            port,
            timeout: config.read_timeout,
            buffer: LineBuffer::default(),
        }))
    }
}

/// An open serial device with its pending partial line.
pub struct SerialPortLink {
    role: SensorRole,
    port: Box<dyn SerialPort>,
    timeout: Duration,
    buffer: LineBuffer,
}

impl SerialPortLink {
    fn io_error(&self, error: impl std::fmt::Display) -> TransportError {
        TransportError::Io {
            role: self.role,
            reason: error.to_string(),
        }
    }
}

impl SerialLink for SerialPortLink {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<RawLine>, TransportError> {
        if let Some(line) = self.buffer.next_line() {
            return Ok(Some(line));
        }

        if timeout != self.timeout {
            self.port.set_timeout(timeout).map_err(|e| self.io_error(e))?;
            self.timeout = timeout;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        match self.port.read(&mut chunk) {
            Ok(n) => {
                self.buffer.extend(&chunk[..n]);
                Ok(self.buffer.next_line())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port
            .write_all(bytes)
            .and_then(|()| self.port.flush())
            .map_err(|e| self.io_error(e))
    }
}

/// Splits a byte stream into lines terminated by `\n`, `\r` or `\r\n`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the next complete, non-empty line.
    ///
    /// When more than [`MAX_LINE_LENGTH`] bytes pile up without a terminator
    /// they are discarded as noise.
    pub fn next_line(&mut self) -> Option<RawLine> {
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n' || b == b'\r') {
            let line: Vec<u8> = self.pending.drain(..=end).take(end).collect();
            if !line.is_empty() {
                return Some(RawLine(line));
            }
        }

        if self.pending.len() > MAX_LINE_LENGTH {
            warn!(
                bytes = self.pending.len(),
                "discarding unterminated serial input"
            );
            self.pending.clear();
        }
        None
    }
}

/// A serial device present on the system.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailablePort {
    pub name: String,
    pub description: String,
}

/// Enumerate the serial devices of the system.
pub fn available_ports() -> io::Result<Vec<AvailablePort>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(info) => format!(
                    "USB {:04x}:{:04x} {}",
                    info.vid,
                    info.pid,
                    info.product.unwrap_or_default()
                )
                .trim_end()
                .to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::Unknown => String::new(),
            };
            AvailablePort {
                name: p.port_name,
                description,
            }
        })
        .collect())
}
