//! Live output formatters for published events.
//!
//! The acquisition loop publishes raw readings, derived measurements and
//! connection changes; a formatter turns each of them into one output line.

pub mod influxdb;

use crate::reading::Event;

/// Formats events into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format one event, without a trailing newline.
    fn format(&self, event: &Event) -> String;
}
