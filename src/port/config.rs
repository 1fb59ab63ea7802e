//! Parsing of `--port` arguments into [`PortConfig`] values.

use super::{DataBits, Parity, PortConfig, StopBits};
use crate::reading::SensorRole;
use std::time::Duration;

/// Baud rate used when the argument does not name one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Read timeout applied to ports parsed from the command line.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Parse a port argument in the format `ROLE=DEVICE[,BAUD[,FRAMING]]`.
///
/// `FRAMING` is the usual serial shorthand of data bits, parity letter and
/// stop bits, such as `8N1` or `7E2`. Missing parts default to 9600 baud 8N1.
///
/// # Example
/// ```
/// use qnh_logger::port::config::parse_port_arg;
/// use qnh_logger::SensorRole;
///
/// let config = parse_port_arg("barometer=/dev/ttyUSB0,19200").unwrap();
/// assert_eq!(config.role, SensorRole::Barometer);
/// assert_eq!(config.device, "/dev/ttyUSB0");
/// assert_eq!(config.baud_rate, 19200);
/// ```
pub fn parse_port_arg(src: &str) -> Result<PortConfig, String> {
    let (role, link) = src
        .split_once('=')
        .ok_or_else(|| "invalid port: expected format ROLE=DEVICE[,BAUD[,FRAMING]]".to_string())?;
    let role: SensorRole = role.parse()?;

    let mut parts = link.split(',').map(str::trim);
    let device = parts
        .next()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| format!("missing device for {role}"))?;

    let baud_rate = match parts.next() {
        Some(baud) => baud
            .parse::<u32>()
            .ok()
            .filter(|&b| b > 0)
            .ok_or_else(|| format!("invalid baud rate: {baud}"))?,
        None => DEFAULT_BAUD_RATE,
    };

    let (data_bits, parity, stop_bits) = match parts.next() {
        Some(framing) => parse_framing(framing)?,
        None => (DataBits::Eight, Parity::None, StopBits::One),
    };

    if let Some(extra) = parts.next() {
        return Err(format!("unexpected port parameter: {extra}"));
    }

    Ok(PortConfig {
        role,
        device: device.to_string(),
        baud_rate,
        parity,
        data_bits,
        stop_bits,
        read_timeout: DEFAULT_READ_TIMEOUT,
    })
}

/// Parse a framing shorthand such as `8N1`.
pub fn parse_framing(src: &str) -> Result<(DataBits, Parity, StopBits), String> {
    let invalid = || format!("invalid framing: {src} (expected e.g. 8N1)");
    let mut chars = src.trim().chars();
    let (Some(bits), Some(parity), Some(stop), None) =
        (chars.next(), chars.next(), chars.next(), chars.next())
    else {
        return Err(invalid());
    };

    let data_bits = match bits {
        '5' => DataBits::Five,
        '6' => DataBits::Six,
        '7' => DataBits::Seven,
        '8' => DataBits::Eight,
        _ => return Err(invalid()),
    };
    let parity = match parity.to_ascii_uppercase() {
        'N' => Parity::None,
        'E' => Parity::Even,
        'O' => Parity::Odd,
        _ => return Err(invalid()),
    };
    let stop_bits = match stop {
        '1' => StopBits::One,
        '2' => StopBits::Two,
        _ => return Err(invalid()),
    };
    Ok((data_bits, parity, stop_bits))
}
