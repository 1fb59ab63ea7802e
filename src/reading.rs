//! Sensor readings and the items carried by the output channel.

use crate::acquisition::ConnectionState;
use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;

/// The two fixed sensor roles of the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorRole {
    Barometer,
    Hygrometer,
}

impl SensorRole {
    pub const ALL: [SensorRole; 2] = [SensorRole::Barometer, SensorRole::Hygrometer];

    pub fn label(self) -> &'static str {
        match self {
            SensorRole::Barometer => "barometer",
            SensorRole::Hygrometer => "hygrometer",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            SensorRole::Barometer => 0,
            SensorRole::Hygrometer => 1,
        }
    }
}

impl fmt::Display for SensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SensorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "barometer" | "baro" | "pressure" => Ok(SensorRole::Barometer),
            "hygrometer" | "hygro" | "humidity" => Ok(SensorRole::Hygrometer),
            _ => Err(format!("unknown sensor role: {s}")),
        }
    }
}

/// Measured values extracted from one line of sensor output.
///
/// Units:
/// - Pressure in hectopascals
/// - Temperature in Celsius
/// - Relative humidity in percent (0-100)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Barometer { pressure: f64, temperature: f64 },
    Hygrometer { humidity: f64, temperature: f64 },
}

impl Sample {
    pub fn role(&self) -> SensorRole {
        match self {
            Sample::Barometer { .. } => SensorRole::Barometer,
            Sample::Hygrometer { .. } => SensorRole::Hygrometer,
        }
    }

    pub fn temperature(&self) -> f64 {
        match *self {
            Sample::Barometer { temperature, .. } | Sample::Hygrometer { temperature, .. } => {
                temperature
            }
        }
    }
}

/// A successfully parsed sample, stamped when it was parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub timestamp: DateTime<Local>,
    pub sample: Sample,
}

impl SensorReading {
    pub fn role(&self) -> SensorRole {
        self.sample.role()
    }
}

/// The fused record built from the latest barometer and hygrometer readings.
///
/// Pressures (`pressure`, `qnh`, `qfe`, `qff`) are in hectopascals; the
/// reduced values are rounded to two decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMeasurement {
    pub timestamp: DateTime<Local>,
    pub pressure: f64,
    pub temperature_barometer: f64,
    pub temperature_humidity: f64,
    pub humidity: f64,
    /// Temperature fed into the reduction. Not part of the CSV log, so
    /// measurements loaded back from storage carry `None`.
    pub temperature_used: Option<f64>,
    pub qnh: f64,
    pub qfe: f64,
    pub qff: f64,
}

/// A connection state transition of one port.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionChange {
    pub timestamp: DateTime<Local>,
    pub role: SensorRole,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Everything the acquisition loop publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Raw(SensorReading),
    Derived(DerivedMeasurement),
    Connection(ConnectionChange),
}

impl Event {
    /// Source label of the event: the role name, or `derived`.
    pub fn source(&self) -> &'static str {
        match self {
            Event::Raw(reading) => reading.role().label(),
            Event::Derived(_) => DERIVED_SOURCE,
            Event::Connection(change) => change.role.label(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        match self {
            Event::Raw(reading) => reading.timestamp,
            Event::Derived(measurement) => measurement.timestamp,
            Event::Connection(change) => change.timestamp,
        }
    }
}

/// Source label used for fused records, both on the channel and in the CSV log.
pub const DERIVED_SOURCE: &str = "derived";
