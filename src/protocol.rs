//! Line protocols of the two sensors.
//!
//! The barometer streams `"<pressure> <temperature>"` lines. The hygrometer
//! emits free text that contains `RH=<humidity>` and `T=<temperature>`
//! markers, sometimes framed by STX/ETX control bytes.

use crate::reading::{Sample, SensorRole};
use std::ops::RangeInclusive;
use thiserror::Error;

/// Pressures outside this band are treated as line noise.
pub const PRESSURE_SANITY_RANGE: RangeInclusive<f64> = 800.0..=1100.0;

const HUMIDITY_MARKER: &str = "RH=";
const TEMPERATURE_MARKER: &str = "T=";

/// Error types for parsing sensor lines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Empty line")]
    Empty,
    #[error("Expected {expected} tokens, got {got}")]
    TooFewTokens { expected: usize, got: usize },
    #[error("Invalid {field} value: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("Missing {0} marker")]
    MissingMarker(&'static str),
    #[error("Pressure {0} hPa outside sanity range")]
    PressureOutOfRange(f64),
}

/// Parser signature shared by both roles.
pub type LineParser = fn(&str) -> Result<Sample, ParseError>;

impl SensorRole {
    pub fn parser(self) -> LineParser {
        match self {
            SensorRole::Barometer => parse_barometer,
            SensorRole::Hygrometer => parse_hygrometer,
        }
    }
}

/// Parse one line of text produced by the sensor in `role`.
pub fn parse(role: SensorRole, line: &str) -> Result<Sample, ParseError> {
    (role.parser())(line)
}

/// Parse a barometer line: pressure then temperature, whitespace separated.
pub fn parse_barometer(line: &str) -> Result<Sample, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Err(ParseError::Empty),
        [pressure, temperature, ..] => {
            let pressure = parse_number("pressure", pressure)?;
            if !PRESSURE_SANITY_RANGE.contains(&pressure) {
                return Err(ParseError::PressureOutOfRange(pressure));
            }
            let temperature = parse_number("temperature", temperature)?;
            Ok(Sample::Barometer {
                pressure,
                temperature,
            })
        }
        short => Err(ParseError::TooFewTokens {
            expected: 2,
            got: short.len(),
        }),
    }
}

/// Parse a hygrometer line such as `RH= 38.7 %RH T= 27.1 'C`.
pub fn parse_hygrometer(line: &str) -> Result<Sample, ParseError> {
    let cleaned: String = line.chars().filter(|c| !c.is_control()).collect();
    if cleaned.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let humidity = marker_value(&cleaned, HUMIDITY_MARKER, "humidity")?;
    let temperature = marker_value(&cleaned, TEMPERATURE_MARKER, "temperature")?;

    Ok(Sample::Hygrometer {
        humidity,
        temperature,
    })
}

fn marker_value(text: &str, marker: &'static str, field: &'static str) -> Result<f64, ParseError> {
    let start = text
        .find(marker)
        .ok_or(ParseError::MissingMarker(marker))?
        + marker.len();
    let rest = text[start..].trim_start();
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
        .map_or(rest.len(), |(i, _)| i);
    parse_number(field, &rest[..end])
}

fn parse_number(field: &'static str, token: &str) -> Result<f64, ParseError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber {
            field,
            value: token.to_string(),
        })
}
