//! RAWv1 (version 3) payload format.
//!
//! 14 bytes: version, humidity (half-percent byte), temperature
//! (sign bit + 7-bit integer + centi-degree byte), pressure, 3-axis
//! acceleration and battery voltage, all multi-byte fields big-endian.

use super::{DecodeError, ensure_version_and_length, read_acceleration, read_u16, round2};
use crate::measurement::Measurement;

pub const VERSION: u8 = 3;
pub const PAYLOAD_LENGTH: usize = 14;

// Sentinel raw values marking "sensor not ready".
const TEMPERATURE_LIMIT_INTEGER: u8 = 127;
const TEMPERATURE_LIMIT_FRACTION: u8 = 99;

pub fn decode(data: &[u8], validate: bool) -> Result<Option<Measurement>, DecodeError> {
    ensure_version_and_length(data, VERSION, PAYLOAD_LENGTH)?;

    let humidity_raw = data[1];
    let pressure_raw = read_u16(data, 4);
    let battery_raw = read_u16(data, 12);

    if validate {
        let temperature_at_limit = (data[2] & 0x7F) == TEMPERATURE_LIMIT_INTEGER
            && data[3] == TEMPERATURE_LIMIT_FRACTION;
        if temperature_at_limit
            || humidity_raw == 0
            || humidity_raw == u8::MAX
            || pressure_raw == 0
            || pressure_raw == u16::MAX
            || battery_raw == 0
            || battery_raw == u16::MAX
        {
            return Ok(None);
        }
    }

    Ok(Some(Measurement {
        temperature: temperature(data[2], data[3]),
        humidity: f64::from(humidity_raw) * 0.5,
        pressure: (f64::from(pressure_raw) + 50000.0) / 100.0,
        battery_voltage: Some(battery_raw),
        acceleration: Some(read_acceleration(data, 6)),
        ..Default::default()
    }))
}

/// Sign-magnitude temperature: high bit is the sign, low 7 bits the whole
/// degrees, the second byte hundredths of a degree.
fn temperature(integer: u8, fraction: u8) -> f64 {
    let magnitude = round2(f64::from(integer & 0x7F) + f64::from(fraction) / 100.0);
    if integer >> 7 == 1 { -magnitude } else { magnitude }
}
