//! Acquisition loop: polling, liveness, reconnection and fusion.
//!
//! One [`AcquisitionLoop`] runs on a dedicated thread. Each tick it reads
//! the ports that are up, schedules reopen attempts for the ports that are
//! down, and fuses the latest barometer and hygrometer readings into a
//! [`DerivedMeasurement`]. Everything it learns leaves through the
//! [`Publisher`]; no other component touches the loop's state.
//!
//! Per-port states:
//!
//! ```text
//!  Connected  --silence > liveness-->  Stale
//!  Stale      --line read---------->  Connected
//!  Connected/Stale --transport error-> Disconnected --> Reconnecting
//!  Reconnecting --reopen ok--> Connected   (barometer gets the resync command)
//!  Reconnecting --reopen failed--> Reconnecting (retry after backoff)
//! ```

use crate::port::{PortConfig, PortRegistry, RawLine};
use crate::protocol;
use crate::reading::{
    ConnectionChange, DerivedMeasurement, Event, Sample, SensorReading, SensorRole,
};
use crate::reducer::{self, Geometry};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Command that tells the barometer to resume streaming after a reopen.
pub const BAROMETER_RESYNC_COMMAND: &[u8] = b"R\r\n";

/// Upper bound of lines taken from one port in a single tick.
const MAX_LINES_PER_TICK: usize = 16;

/// Connection state of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open and delivering lines.
    Connected,
    /// Open, but silent for longer than the liveness timeout.
    Stale,
    /// A transport error closed the port.
    Disconnected,
    /// Waiting for or attempting a reopen.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Stale => "stale",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        })
    }
}

/// Which temperature feeds the pressure reduction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TemperatureSource {
    #[default]
    Hygrometer,
    Barometer,
    /// A fixed value in °C
    Fixed(f64),
}

/// Parse `hygrometer`, `barometer`, or a temperature in °C.
pub fn parse_temperature_source(src: &str) -> Result<TemperatureSource, String> {
    match src.trim().to_lowercase().as_str() {
        "hygrometer" | "humidity" => Ok(TemperatureSource::Hygrometer),
        "barometer" | "pressure" => Ok(TemperatureSource::Barometer),
        other => other
            .trim_end_matches('c')
            .trim_end_matches('°')
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite())
            .map(TemperatureSource::Fixed)
            .ok_or_else(|| {
                format!("invalid temperature source: {src} (expected hygrometer, barometer or °C)")
            }),
    }
}

/// Timing and calculation parameters of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub poll_interval: Duration,
    pub liveness_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub geometry: Geometry,
    pub temperature_source: TemperatureSource,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(2),
            geometry: Geometry::default(),
            temperature_source: TemperatureSource::default(),
        }
    }
}

/// Fans every published event out to all subscribers.
///
/// Each subscriber owns an unbounded queue, so publishing never blocks the
/// loop. Subscribers whose receiver is gone are dropped on the next publish.
#[derive(Debug, Default)]
pub struct Publisher {
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

impl Publisher {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Everything the loop needs from the outside, created at pipeline start.
pub struct AcquisitionContext {
    pub registry: PortRegistry,
    pub settings: AcquisitionSettings,
    pub publisher: Publisher,
}

#[derive(Debug, Clone, Copy)]
struct PortMonitor {
    state: ConnectionState,
    last_read: Instant,
    retry_at: Instant,
}

/// The polling, reconnection and fusion state machine.
pub struct AcquisitionLoop {
    ctx: AcquisitionContext,
    monitors: BTreeMap<SensorRole, PortMonitor>,
    latest: [Option<SensorReading>; 2],
    /// A reading arrived since the last fusion.
    fresh: bool,
}

impl AcquisitionLoop {
    /// Open the configured ports and prepare the per-port state.
    ///
    /// Ports that fail to open start out `Disconnected` and are retried on
    /// the first tick.
    pub fn start(mut ctx: AcquisitionContext, configs: BTreeMap<SensorRole, PortConfig>) -> Self {
        if let Err(e) = ctx.registry.open(configs) {
            warn!(error = %e, "starting with a port closed");
        }

        let now = Instant::now();
        let monitors = ctx
            .registry
            .roles()
            .into_iter()
            .map(|role| {
                let state = if ctx.registry.is_open(role) {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
                (
                    role,
                    PortMonitor {
                        state,
                        last_read: now,
                        retry_at: now,
                    },
                )
            })
            .collect();

        Self {
            ctx,
            monitors,
            latest: [None, None],
            fresh: false,
        }
    }

    pub fn state(&self, role: SensorRole) -> Option<ConnectionState> {
        self.monitors.get(&role).map(|m| m.state)
    }

    pub fn latest(&self, role: SensorRole) -> Option<&SensorReading> {
        self.latest[role.index()].as_ref()
    }

    /// Run ticks at the poll cadence until `stop` is raised, then close the
    /// ports. Dropping the loop closes the output channel.
    pub fn run(mut self, stop: &AtomicBool) {
        info!(
            roles = ?self.ctx.registry.roles(),
            interval = ?self.ctx.settings.poll_interval,
            "acquisition started"
        );
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick();
            if let Some(rest) = self.ctx.settings.poll_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        self.ctx.registry.close_all();
        info!("acquisition stopped");
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now(), Local::now());
    }

    /// One poll-all-ports-then-fuse cycle at the given instants.
    pub fn tick_at(&mut self, now: Instant, wall: DateTime<Local>) {
        for role in SensorRole::ALL {
            match self.state(role) {
                Some(ConnectionState::Connected | ConnectionState::Stale) => {
                    self.poll(role, now, wall)
                }
                Some(ConnectionState::Disconnected | ConnectionState::Reconnecting) => {
                    self.reconnect(role, now, wall)
                }
                None => {}
            }
        }
        self.fuse(wall);
    }

    fn poll(&mut self, role: SensorRole, now: Instant, wall: DateTime<Local>) {
        let timeout = self
            .ctx
            .registry
            .config(role)
            .map_or(Duration::ZERO, |c| c.read_timeout);

        for _ in 0..MAX_LINES_PER_TICK {
            match self.ctx.registry.read_line(role, timeout) {
                Ok(Some(line)) => self.accept(role, &line, now, wall),
                Ok(None) => break,
                Err(e) => {
                    error!(%role, error = %e, "transport error");
                    self.transition(role, ConnectionState::Disconnected, wall);
                    self.reconnect(role, now, wall);
                    return;
                }
            }
        }

        if let Some(monitor) = self.monitors.get(&role)
            && monitor.state == ConnectionState::Connected
            && now.saturating_duration_since(monitor.last_read) > self.ctx.settings.liveness_timeout
        {
            self.transition(role, ConnectionState::Stale, wall);
        }
    }

    fn accept(&mut self, role: SensorRole, line: &RawLine, now: Instant, wall: DateTime<Local>) {
        let text = line.text();
        if text.is_empty() {
            return;
        }
        match protocol::parse(role, &text) {
            Ok(sample) => {
                debug!(%role, ?sample, "parsed");
                let reading = SensorReading {
                    timestamp: wall,
                    sample,
                };
                self.latest[role.index()] = Some(reading.clone());
                self.fresh = true;
                self.ctx.publisher.publish(Event::Raw(reading));

                if let Some(monitor) = self.monitors.get_mut(&role) {
                    monitor.last_read = now;
                }
                if self.state(role) == Some(ConnectionState::Stale) {
                    self.transition(role, ConnectionState::Connected, wall);
                }
            }
            Err(e) => {
                warn!(%role, error = %e, "discarding unparsable line");
                debug!(%role, line = %text, "unparsable line");
            }
        }
    }

    fn reconnect(&mut self, role: SensorRole, now: Instant, wall: DateTime<Local>) {
        if self.state(role) == Some(ConnectionState::Disconnected) {
            self.transition(role, ConnectionState::Reconnecting, wall);
            self.schedule_retry(role, now);
        }
        let Some(monitor) = self.monitors.get(&role) else {
            return;
        };
        if now < monitor.retry_at {
            return;
        }

        let backoff = self.ctx.settings.reconnect_backoff;
        if let Err(e) = self.ctx.registry.reopen(role) {
            warn!(%role, error = %e, retry_in = ?backoff, "reopen failed");
            self.schedule_retry(role, now + backoff);
            return;
        }

        if let Some(monitor) = self.monitors.get_mut(&role) {
            monitor.last_read = now;
        }
        self.transition(role, ConnectionState::Connected, wall);

        if role == SensorRole::Barometer {
            match self.ctx.registry.write(role, BAROMETER_RESYNC_COMMAND) {
                Ok(()) => info!(%role, "resync command sent"),
                Err(e) => {
                    error!(%role, error = %e, "resync command failed");
                    self.transition(role, ConnectionState::Disconnected, wall);
                    self.transition(role, ConnectionState::Reconnecting, wall);
                    self.schedule_retry(role, now + backoff);
                }
            }
        }
    }

    fn schedule_retry(&mut self, role: SensorRole, at: Instant) {
        if let Some(monitor) = self.monitors.get_mut(&role) {
            monitor.retry_at = at;
        }
    }

    fn transition(&mut self, role: SensorRole, to: ConnectionState, wall: DateTime<Local>) {
        let Some(monitor) = self.monitors.get_mut(&role) else {
            return;
        };
        let from = monitor.state;
        if from == to {
            return;
        }
        monitor.state = to;
        info!(%role, %from, %to, "connection state changed");
        self.ctx.publisher.publish(Event::Connection(ConnectionChange {
            timestamp: wall,
            role,
            from,
            to,
        }));
    }

    /// Join the latest reading of each role; last value wins.
    fn fuse(&mut self, wall: DateTime<Local>) {
        if !self.fresh {
            return;
        }
        let (Some(baro), Some(hygro)) = (
            self.latest(SensorRole::Barometer).map(|r| r.sample),
            self.latest(SensorRole::Hygrometer).map(|r| r.sample),
        ) else {
            return;
        };
        let (
            Sample::Barometer { pressure, .. },
            Sample::Hygrometer { humidity, .. },
        ) = (baro, hygro)
        else {
            return;
        };
        self.fresh = false;

        let temperature_barometer = baro.temperature();
        let temperature_humidity = hygro.temperature();
        let temperature = match self.ctx.settings.temperature_source {
            TemperatureSource::Hygrometer => temperature_humidity,
            TemperatureSource::Barometer => temperature_barometer,
            TemperatureSource::Fixed(t) => t,
        };

        match reducer::reduce(pressure, temperature, &self.ctx.settings.geometry) {
            Ok(reduction) => {
                let measurement = DerivedMeasurement {
                    timestamp: wall,
                    pressure,
                    temperature_barometer,
                    temperature_humidity,
                    humidity,
                    temperature_used: Some(temperature),
                    qnh: reduction.qnh,
                    qfe: reduction.qfe,
                    qff: reduction.qff,
                };
                debug!(?measurement, "fused");
                self.ctx.publisher.publish(Event::Derived(measurement));
            }
            Err(e) => warn!(error = %e, "skipping derived measurement"),
        }
    }
}
