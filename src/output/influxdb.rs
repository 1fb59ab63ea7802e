//! InfluxDB line protocol output formatter.

use crate::output::OutputFormatter;
use crate::reading::{ConnectionChange, Event, Sample, SensorReading};
use crate::reducer::PressureUnit;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<DateTime<Local>>,
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", key, value)?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", key, value)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Out-of-range instants are written without a timestamp; the server
    // stamps them on arrival.
    if let Some(nanos) = data_point.timestamp.and_then(|t| t.timestamp_nanos_opt()) {
        write!(fmt, " {}", nanos)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.measurement)?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// InfluxDB line protocol formatter.
///
/// Every event is tagged with its source (`barometer`, `hygrometer` or
/// `derived`). Derived measurements also carry a `unit` tag naming the unit
/// of their reduced pressures; station pressure stays in hPa.
pub struct InfluxDbFormatter {
    /// The measurement name in InfluxDB
    measurement_name: String,
    unit: PressureUnit,
}

impl InfluxDbFormatter {
    pub fn new(measurement_name: String, unit: PressureUnit) -> Self {
        Self {
            measurement_name,
            unit,
        }
    }

    fn tag_set(&self, event: &Event) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("sensor".to_string(), event.source().to_string());
        if let Event::Derived(_) = event {
            tags.insert("unit".to_string(), self.unit.symbol().to_string());
        }
        tags
    }

    fn field_set(&self, event: &Event) -> BTreeMap<String, FieldValue> {
        let mut fields = BTreeMap::new();

        macro_rules! add {
            ($name:literal, $val:expr) => {
                fields.insert($name.into(), FieldValue::Float($val));
            };
        }

        match event {
            Event::Raw(SensorReading { sample, .. }) => match *sample {
                Sample::Barometer {
                    pressure,
                    temperature,
                } => {
                    add!("pressure", pressure);
                    add!("temperature", temperature);
                }
                Sample::Hygrometer {
                    humidity,
                    temperature,
                } => {
                    add!("humidity", humidity);
                    add!("temperature", temperature);
                }
            },
            Event::Derived(m) => {
                add!("pressure", m.pressure);
                add!("temperature_barometer", m.temperature_barometer);
                add!("temperature_humidity", m.temperature_humidity);
                add!("humidity", m.humidity);
                if let Some(t) = m.temperature_used {
                    add!("temperature_used", t);
                }
                add!("qnh", self.unit.convert(m.qnh));
                add!("qfe", self.unit.convert(m.qfe));
                add!("qff", self.unit.convert(m.qff));
            }
            Event::Connection(ConnectionChange { from, to, .. }) => {
                fields.insert("state".into(), FieldValue::String(to.to_string()));
                fields.insert("previous".into(), FieldValue::String(from.to_string()));
            }
        }

        fields
    }

    fn to_data_point(&self, event: &Event) -> DataPoint {
        DataPoint {
            measurement: self.measurement_name.clone(),
            tag_set: self.tag_set(event),
            field_set: self.field_set(event),
            timestamp: Some(event.timestamp()),
        }
    }
}

impl OutputFormatter for InfluxDbFormatter {
    fn format(&self, event: &Event) -> String {
        format!("{}", self.to_data_point(event))
    }
}
