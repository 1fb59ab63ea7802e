//! Core application runner for `qnh-logger`.
//!
//! This module is decoupled from CLI parsing, signal handling and process
//! exit codes so the whole pipeline can be driven with scripted ports.

use crate::acquisition::{
    AcquisitionContext, AcquisitionLoop, AcquisitionSettings, Publisher, TemperatureSource,
    parse_temperature_source,
};
use crate::output::OutputFormatter;
use crate::output::influxdb::InfluxDbFormatter;
use crate::port::config::{DEFAULT_READ_TIMEOUT, parse_port_arg};
use crate::port::{PortConfig, PortOpener, PortRegistry};
use crate::reading::{Event, SensorRole};
use crate::reducer::{Geometry, PressureUnit};
use crate::storage::{self, RotatingStore};
use crate::throttle::{Throttle, parse_duration};
use clap::Parser;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Log barometer and hygrometer readings, reduce them to QNH, QFE and QFF,
/// and keep a daily CSV history.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Serial port of a sensor, repeatable.
    /// Format: --port barometer=/dev/ttyUSB0[,9600[,8N1]]
    #[arg(
        long = "port",
        value_parser = parse_port_arg,
        value_name = "ROLE=DEVICE[,BAUD[,FRAMING]]",
        required_unless_present = "list_ports"
    )]
    pub ports: Vec<PortConfig>,

    /// Upper bound for a single serial read
    #[arg(long, value_parser = parse_duration, default_value = "50ms")]
    pub read_timeout: Duration,

    /// Interval between polls of the ports
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    pub poll_interval: Duration,

    /// Silence after which an open port is reported stale
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub liveness_timeout: Duration,

    /// Delay between reopen attempts of a lost port
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub reconnect_backoff: Duration,

    /// Height of the sensor above the station reference point, in metres
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub sensor_height: f64,

    /// Height of the station reference point above mean sea level, in metres
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub ref_height: f64,

    /// Temperature used for the reduction: hygrometer, barometer, or a fixed
    /// value in °C
    #[arg(
        long,
        value_parser = parse_temperature_source,
        default_value = "hygrometer",
        allow_negative_numbers = true
    )]
    pub temperature_source: TemperatureSource,

    /// Unit of QNH, QFE and QFF in the live output
    #[arg(long, default_value_t, value_enum)]
    pub unit: PressureUnit,

    /// Directory of the daily CSV files
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// The name of the measurement in InfluxDB line protocol.
    #[arg(long, default_value = "barometry")]
    pub influxdb_measurement: String,

    /// Throttle live output per sensor to at most one line per interval.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, value_parser = parse_duration)]
    pub throttle: Option<Duration>,

    /// Print only derived measurements to stdout
    #[arg(long)]
    pub derived_only: bool,

    /// List the serial ports of the system and exit
    #[arg(long)]
    pub list_ports: bool,

    /// Verbose output, log every reading and unparsable line
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    fn port_configs(&self) -> Result<BTreeMap<SensorRole, PortConfig>, RunError> {
        if self.ports.is_empty() {
            return Err(RunError::NoPorts);
        }
        let mut configs = BTreeMap::new();
        for port in &self.ports {
            let config = PortConfig {
                read_timeout: self.read_timeout,
                ..port.clone()
            };
            if configs.insert(config.role, config).is_some() {
                return Err(RunError::DuplicatePort(port.role));
            }
        }
        Ok(configs)
    }

    fn settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            poll_interval: self.poll_interval,
            liveness_timeout: self.liveness_timeout,
            reconnect_backoff: self.reconnect_backoff,
            geometry: Geometry {
                sensor_height: self.sensor_height,
                ref_height: self.ref_height,
            },
            temperature_source: self.temperature_source,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            poll_interval: AcquisitionSettings::default().poll_interval,
            liveness_timeout: AcquisitionSettings::default().liveness_timeout,
            reconnect_backoff: AcquisitionSettings::default().reconnect_backoff,
            sensor_height: 0.0,
            ref_height: 0.0,
            temperature_source: TemperatureSource::default(),
            unit: PressureUnit::default(),
            data_dir: PathBuf::from("data"),
            influxdb_measurement: "barometry".to_string(),
            throttle: None,
            derived_only: false,
            list_ports: false,
            verbose: false,
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("No sensor port configured")]
    NoPorts,
    #[error("More than one port configured for {0}")]
    DuplicatePort(SensorRole),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Live output stage: filtering, throttling and formatting.
struct LiveFeed {
    formatter: InfluxDbFormatter,
    throttle: Option<Throttle>,
    derived_only: bool,
}

impl LiveFeed {
    fn write(&mut self, event: &Event, out: &mut dyn Write) -> io::Result<()> {
        if self.derived_only && !matches!(event, Event::Derived(_)) {
            return Ok(());
        }
        let should_emit = self
            .throttle
            .as_mut()
            .is_none_or(|t: &mut Throttle| t.should_emit(event));
        if should_emit {
            writeln!(out, "{}", self.formatter.format(event))?;
            out.flush()?;
        }
        Ok(())
    }
}

/// Feed events to `out` until the channel closes.
///
/// A failed write ends the live feed only: the receiver is closed so the
/// publisher prunes it, and the pipeline keeps running until `shutdown`.
/// The write error is returned once the channel is done.
async fn pump(
    events: &mut mpsc::UnboundedReceiver<Event>,
    feed: &mut LiveFeed,
    shutdown: impl Future<Output = ()>,
    stop: &AtomicBool,
    out: &mut dyn Write,
) -> io::Result<()> {
    tokio::pin!(shutdown);
    let mut stopping = false;
    let mut failure = None;
    loop {
        tokio::select! {
            event = events.recv(), if failure.is_none() => match event {
                Some(event) => {
                    if let Err(e) = feed.write(&event, out) {
                        error!(error = %e, "live output failed, storage continues");
                        events.close();
                        failure = Some(e);
                    }
                }
                None => break,
            },
            () = &mut shutdown, if !stopping => {
                info!("shutting down");
                stop.store(true, Ordering::Relaxed);
                stopping = true;
            }
            else => break,
        }
    }
    failure.map_or(Ok(()), Err)
}

/// Run the pipeline until `shutdown` completes, writing the live feed to `out`.
///
/// The acquisition loop and the storage writer each run on a blocking
/// thread. After shutdown the loop finishes its tick and closes the ports;
/// both consumers then drain what was already published. A broken live
/// output is reported only after storage has drained.
pub async fn run_with_io(
    options: Options,
    opener: Box<dyn PortOpener>,
    shutdown: impl Future<Output = ()>,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    let configs = options.port_configs()?;
    let settings = options.settings();
    info!(
        ports = configs.len(),
        temperature = ?settings.temperature_source,
        sensor_height = settings.geometry.sensor_height,
        ref_height = settings.geometry.ref_height,
        data_dir = %options.data_dir.display(),
        "starting"
    );

    let mut publisher = Publisher::default();
    let stored = publisher.subscribe();
    let mut live = publisher.subscribe();

    let ctx = AcquisitionContext {
        registry: PortRegistry::new(opener),
        settings,
        publisher,
    };
    let stop = Arc::new(AtomicBool::new(false));
    let acquisition = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || AcquisitionLoop::start(ctx, configs).run(&stop))
    };
    let writer = storage::spawn_writer(RotatingStore::new(&options.data_dir), stored);

    let mut feed = LiveFeed {
        formatter: InfluxDbFormatter::new(options.influxdb_measurement, options.unit),
        throttle: options.throttle.map(Throttle::new),
        derived_only: options.derived_only,
    };
    let result = pump(&mut live, &mut feed, shutdown, &stop, out).await;
    stop.store(true, Ordering::Relaxed);
    drop(live);

    acquisition.await?;
    let rows = writer.await?;
    info!(rows, "stopped");

    result.map_err(RunError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeOpener, ReadStep};

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("qnh-logger").chain(args.iter().copied())).unwrap()
    }

    fn scripted_opener() -> FakeOpener {
        let opener = FakeOpener::new();
        opener
            .wire(SensorRole::Barometer)
            .script([ReadStep::Line("1005.87 26.75")]);
        opener
            .wire(SensorRole::Hygrometer)
            .script([ReadStep::Line("RH= 38.7 %RH T= 27.1 'C")]);
        opener
    }

    fn test_options(dir: &std::path::Path) -> Options {
        parse(&[
            "--port",
            "barometer=/dev/fake-barometer",
            "--port",
            "hygrometer=/dev/fake-hygrometer",
            "--poll-interval",
            "10ms",
            "--read-timeout",
            "1ms",
            "--data-dir",
            dir.to_str().unwrap(),
        ])
    }

    async fn shutdown_after(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn options_parse() {
        let options = parse(&[
            "--port",
            "baro=/dev/ttyUSB0,19200,7E1",
            "--port",
            "hygrometer=COM3",
            "--ref-height",
            "-5",
            "--temperature-source",
            "-2.5",
            "--unit",
            "inhg",
            "--poll-interval",
            "0.25",
        ]);
        assert_eq!(options.ports.len(), 2);
        assert_eq!(options.ports[0].baud_rate, 19200);
        assert_eq!(options.ref_height, -5.0);
        assert_eq!(options.temperature_source, TemperatureSource::Fixed(-2.5));
        assert_eq!(options.unit, PressureUnit::Inhg);
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert_eq!(options.data_dir, PathBuf::from("data"));
        assert_eq!(options.reconnect_backoff, Duration::from_secs(2));
    }

    #[test]
    fn options_require_port_unless_listing() {
        assert!(Options::try_parse_from(["qnh-logger"]).is_err());
        assert!(Options::try_parse_from(["qnh-logger", "--list-ports"]).is_ok());
        assert!(Options::try_parse_from(["qnh-logger", "--port", "wind=/dev/ttyS0"]).is_err());
    }

    #[test]
    fn port_configs_apply_read_timeout() {
        let options = parse(&["--port", "baro=COM1", "--read-timeout", "20ms"]);
        let configs = options.port_configs().unwrap();
        assert_eq!(
            configs[&SensorRole::Barometer].read_timeout,
            Duration::from_millis(20)
        );
    }

    #[tokio::test]
    async fn run_rejects_missing_and_duplicate_ports() {
        let mut out = Vec::<u8>::new();
        let result = run_with_io(
            Options::default(),
            Box::new(FakeOpener::new()),
            shutdown_after(0),
            &mut out,
        )
        .await;
        assert!(matches!(result, Err(RunError::NoPorts)));

        let options = parse(&["--port", "baro=COM1", "--port", "barometer=COM2"]);
        let result =
            run_with_io(options, Box::new(FakeOpener::new()), shutdown_after(0), &mut out).await;
        assert!(matches!(
            result,
            Err(RunError::DuplicatePort(SensorRole::Barometer))
        ));
    }

    #[tokio::test]
    async fn run_writes_feed_and_stores_derived() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());

        let mut out = Vec::<u8>::new();
        run_with_io(
            options,
            Box::new(scripted_opener()),
            shutdown_after(200),
            &mut out,
        )
        .await
        .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("barometry,sensor=barometer pressure=1005.87,temperature=26.75 "));
        assert!(out.contains("barometry,sensor=hygrometer humidity=38.7,temperature=27.1 "));
        assert!(out.contains("barometry,sensor=derived,unit=hPa "));
        assert!(out.ends_with('\n'));

        let stored = RotatingStore::new(dir.path()).load(None, None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pressure, 1005.87);
        assert_eq!(stored[0].humidity, 38.7);
    }

    #[tokio::test]
    async fn run_derived_only_filters_feed() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = test_options(dir.path());
        options.derived_only = true;

        let mut out = Vec::<u8>::new();
        run_with_io(
            options,
            Box::new(scripted_opener()),
            shutdown_after(200),
            &mut out,
        )
        .await
        .unwrap();

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("barometry,sensor=derived,"));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_keeps_storing_when_live_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FakeOpener::new();
        // One fresh pair per tick, for 10 ticks.
        opener.wire(SensorRole::Barometer).script(
            (0..10).flat_map(|_| [ReadStep::Line("1005.87 26.75"), ReadStep::Silence]),
        );
        opener.wire(SensorRole::Hygrometer).script(
            (0..10).flat_map(|_| [ReadStep::Line("RH= 38.7 %RH T= 27.1 'C"), ReadStep::Silence]),
        );

        let started = std::time::Instant::now();
        let result = run_with_io(
            test_options(dir.path()),
            Box::new(opener),
            shutdown_after(300),
            &mut BrokenPipe,
        )
        .await;

        assert!(matches!(result, Err(RunError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(started.elapsed() >= Duration::from_millis(300));
        let stored = RotatingStore::new(dir.path()).load(None, None).unwrap();
        assert_eq!(stored.len(), 10);
    }

    #[tokio::test]
    async fn run_survives_unavailable_port() {
        let dir = tempfile::tempdir().unwrap();
        let opener = scripted_opener();
        opener.wire(SensorRole::Hygrometer).refuse_opens(usize::MAX);

        let mut out = Vec::<u8>::new();
        run_with_io(
            test_options(dir.path()),
            Box::new(opener),
            shutdown_after(100),
            &mut out,
        )
        .await
        .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("sensor=barometer pressure=1005.87"));
        assert!(out.contains("state=\"reconnecting\""));
        assert!(!out.contains("sensor=derived"));
        assert!(RotatingStore::new(dir.path()).load(None, None).unwrap().is_empty());
    }
}
