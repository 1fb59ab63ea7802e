//! Rate limiting of the live output feed.
//!
//! Each event source (`barometer`, `hygrometer`, `derived`) is throttled
//! independently. Connection changes always pass.

use crate::reading::Event;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Allows at most one event per source and `interval`.
///
/// The first event of a source is always allowed.
#[derive(Debug)]
pub struct Throttle {
    /// Minimum time between events of one source
    interval: Duration,
    /// Last emitted event time per source
    last_seen: HashMap<&'static str, Instant>,
}

impl Throttle {
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use qnh_logger::throttle::Throttle;
    ///
    /// let throttle = Throttle::new(Duration::from_secs(3));
    /// ```
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_seen: HashMap::new(),
        }
    }

    pub fn should_emit(&mut self, event: &Event) -> bool {
        self.should_emit_at(event, Instant::now())
    }

    /// Decide for `event` as if it arrived at `now`.
    ///
    /// Blocked events do not reset the timer of their source.
    pub fn should_emit_at(&mut self, event: &Event, now: Instant) -> bool {
        if let Event::Connection(_) = event {
            return true;
        }
        let source = event.source();
        match self.last_seen.get(source) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            _ => {
                self.last_seen.insert(source, now);
                true
            }
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the suffixes `ms`, `s`, `m` and `h`; without a suffix the value
/// is taken as seconds. Fractional values such as `0.5s` are accepted.
///
/// # Examples
/// ```
/// use qnh_logger::throttle::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("0.1").unwrap(), Duration::from_millis(100));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit, scale) = if let Some(num) = src.strip_suffix("ms") {
        (num, "milliseconds", 0.001)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, "hours", 3600.0)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, "minutes", 60.0)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, "seconds", 1.0)
    } else {
        (src, "duration", 1.0)
    };

    let value: f64 = num
        .trim()
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| format!("invalid {}: {}", unit, num.trim()))?;

    // Round to whole microseconds so decimal inputs map to exact durations.
    let micros = (value * scale * 1e6).round();
    if micros > u64::MAX as f64 {
        return Err(format!("duration too long: {src}"));
    }
    Ok(Duration::from_micros(micros as u64))
}
