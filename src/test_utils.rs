use crate::port::{
    DataBits, OpenError, Parity, PortConfig, PortOpener, RawLine, SerialLink, StopBits,
    TransportError,
};
use crate::reading::{DerivedMeasurement, SensorRole};
use chrono::{DateTime, Local, TimeZone};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted answer of a fake link to `read_line`.
#[derive(Debug, Clone)]
pub enum ReadStep {
    Line(&'static str),
    Silence,
    Fail,
}

#[derive(Debug, Default)]
struct WireState {
    reads: VecDeque<ReadStep>,
    writes: Vec<Vec<u8>>,
    opens: usize,
    refused_opens: usize,
    refused_writes: usize,
}

/// Shared state behind every link opened for one role.
///
/// Reads outlive individual links, so a script keeps playing across
/// reconnects. An exhausted script reads as silence.
#[derive(Debug, Clone, Default)]
pub struct FakeWire {
    state: Arc<Mutex<WireState>>,
}

impl FakeWire {
    pub fn script(&self, steps: impl IntoIterator<Item = ReadStep>) -> &Self {
        self.state.lock().unwrap().reads.extend(steps);
        self
    }

    /// Make the next `count` open attempts fail.
    pub fn refuse_opens(&self, count: usize) -> &Self {
        self.state.lock().unwrap().refused_opens = count;
        self
    }

    /// Make the next `count` writes fail with a transport error.
    pub fn refuse_writes(&self, count: usize) -> &Self {
        self.state.lock().unwrap().refused_writes = count;
        self
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }
}

struct FakeLink {
    role: SensorRole,
    wire: FakeWire,
}

impl SerialLink for FakeLink {
    fn read_line(&mut self, _timeout: Duration) -> Result<Option<RawLine>, TransportError> {
        let step = self.wire.state.lock().unwrap().reads.pop_front();
        match step {
            Some(ReadStep::Line(line)) => Ok(Some(RawLine::from(line))),
            Some(ReadStep::Silence) | None => Ok(None),
            Some(ReadStep::Fail) => Err(TransportError::Io {
                role: self.role,
                reason: "device unplugged".to_string(),
            }),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.wire.state.lock().unwrap();
        if state.refused_writes > 0 {
            state.refused_writes -= 1;
            return Err(TransportError::Io {
                role: self.role,
                reason: "write failed".to_string(),
            });
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }
}

/// A [`PortOpener`] whose links are driven by per-role [`FakeWire`]s.
#[derive(Debug, Clone, Default)]
pub struct FakeOpener {
    wires: Arc<Mutex<BTreeMap<SensorRole, FakeWire>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wire(&self, role: SensorRole) -> FakeWire {
        self.wires
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .clone()
    }
}

impl PortOpener for FakeOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialLink>, OpenError> {
        let wire = self.wire(config.role);
        {
            let mut state = wire.state.lock().unwrap();
            if state.refused_opens > 0 {
                state.refused_opens -= 1;
                return Err(OpenError::Unavailable {
                    role: config.role,
                    device: config.device.clone(),
                    reason: "no such device".to_string(),
                });
            }
            state.opens += 1;
        }
        Ok(Box::new(FakeLink {
            role: config.role,
            wire,
        }))
    }
}

/// A 9600 8N1 configuration on a fake device named after the role.
pub fn port_config(role: SensorRole) -> PortConfig {
    PortConfig {
        role,
        device: format!("/dev/fake-{role}"),
        baud_rate: 9600,
        parity: Parity::None,
        data_bits: DataBits::Eight,
        stop_bits: StopBits::One,
        read_timeout: Duration::from_millis(10),
    }
}

/// Local wall-clock time at whole seconds.
pub fn local_time(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(year, month, day, hour, min, sec)
        .earliest()
        .unwrap()
}

/// A fused measurement with plausible values.
pub fn derived_measurement(timestamp: DateTime<Local>) -> DerivedMeasurement {
    DerivedMeasurement {
        timestamp,
        pressure: 1005.87,
        temperature_barometer: 26.75,
        temperature_humidity: 27.1,
        humidity: 38.7,
        temperature_used: Some(27.1),
        qnh: 1011.93,
        qfe: 1006.05,
        qff: 1011.58,
    }
}
