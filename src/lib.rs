//! `qnh-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal
//! handling and process exit codes. The pipeline lives in [`crate::app`],
//! where it can be driven deterministically with injected serial ports.

pub mod acquisition;
pub mod app;
pub mod output;
pub mod port;
pub mod protocol;
pub mod reading;
pub mod reducer;
pub mod storage;
pub mod throttle;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use acquisition::{AcquisitionLoop, AcquisitionSettings, ConnectionState, Publisher};
pub use output::OutputFormatter;
pub use output::influxdb::InfluxDbFormatter;
pub use port::{OpenError, PortConfig, PortRegistry, TransportError};
pub use protocol::ParseError;
pub use reading::{ConnectionChange, DerivedMeasurement, Event, Sample, SensorReading, SensorRole};
pub use reducer::{DomainError, Geometry, PressureUnit, Reduction, reduce};
pub use storage::{RotatingStore, StorageError};
pub use throttle::{Throttle, parse_duration};
