//! Reduction of station pressure to QFE, QNH and QFF.

use std::fmt;
use thiserror::Error;

/// Conversion factor from hectopascals to inches of mercury.
pub const HPA_TO_INHG: f64 = 0.029529983071445;

/// Reference pressure of the standard atmosphere at mean sea level, in hPa.
const STANDARD_PRESSURE: f64 = 1013.2315;

/// Station geometry, both heights in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Geometry {
    /// Height of the sensor above the station reference point.
    pub sensor_height: f64,
    /// Height of the station reference point above mean sea level.
    pub ref_height: f64,
}

/// Reduced pressures in hPa, rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reduction {
    pub qfe: f64,
    pub qnh: f64,
    pub qff: f64,
}

/// The reduction formulas are undefined for the given inputs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Non-finite input: pressure={pressure}, temperature={temperature}")]
    NonFinite { pressure: f64, temperature: f64 },
    #[error("Pressure must be positive, got {0} hPa")]
    NonPositivePressure(f64),
    #[error("Non-positive {term} denominator ({value})")]
    Denominator { term: &'static str, value: f64 },
}

/// Compute QFE, QNH and QFF from station pressure (hPa) and temperature (°C).
pub fn reduce(pressure: f64, temperature: f64, geometry: &Geometry) -> Result<Reduction, DomainError> {
    let Geometry {
        sensor_height,
        ref_height,
    } = *geometry;

    if ![pressure, temperature, sensor_height, ref_height]
        .iter()
        .all(|v| v.is_finite())
    {
        return Err(DomainError::NonFinite {
            pressure,
            temperature,
        });
    }
    if pressure <= 0.0 {
        return Err(DomainError::NonPositivePressure(pressure));
    }

    let qfe = pressure * (sensor_height / scale_height("QFE", sensor_height, temperature)?).exp();

    let d = 0.19025 * (qfe / STANDARD_PRESSURE).ln();
    let qnh_denominator = positive("QNH", 288.2 + 0.00325 * ref_height)?;
    let qnh = qfe * ((0.03416 * ref_height * (1.0 - d)) / qnh_denominator).exp();

    let qff = qfe * (ref_height / scale_height("QFF", ref_height, temperature)?).exp();

    Ok(Reduction {
        qfe: round2(qfe),
        qnh: round2(qnh),
        qff: round2(qff),
    })
}

fn scale_height(term: &'static str, height: f64, temperature: f64) -> Result<f64, DomainError> {
    positive(term, 7996.0 + 0.0086 * height + 29.33 * temperature)
}

fn positive(term: &'static str, value: f64) -> Result<f64, DomainError> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(DomainError::Denominator { term, value })
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Display unit for reduced pressures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PressureUnit {
    /// Hectopascals
    #[default]
    Hpa,
    /// Inches of mercury
    Inhg,
    /// Millibars (numerically identical to hPa)
    Mb,
}

impl PressureUnit {
    /// Convert a pressure given in hPa into this unit.
    pub fn convert(self, hpa: f64) -> f64 {
        match self {
            PressureUnit::Hpa | PressureUnit::Mb => hpa,
            PressureUnit::Inhg => hpa * HPA_TO_INHG,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            PressureUnit::Hpa => "hPa",
            PressureUnit::Inhg => "inHg",
            PressureUnit::Mb => "mb",
        }
    }
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}
