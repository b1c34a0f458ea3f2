//! RAWv2 (version 5) payload format.
//!
//! 24 bytes: all multi-byte fields two's-complement big-endian.
//! Temperature in 0.005 degree steps, humidity in 0.0025 percent steps,
//! battery voltage and TX power packed into a shared 16-bit field, then
//! movement counter, sequence number and the tag's own MAC tail.

use super::{DecodeError, ensure_version_and_length, read_acceleration, read_i16, read_u16};
use crate::measurement::Measurement;

pub const VERSION: u8 = 5;
pub const PAYLOAD_LENGTH: usize = 24;

// Sentinel values marking "sensor not ready".
const TEMPERATURE_LIMIT_RAW: i16 = 32767;
const HUMIDITY_LIMIT_RAW: u16 = 65534;
const PRESSURE_LIMIT_RAW: u16 = 65534;
const BATTERY_VOLTAGE_MIN: u16 = 1600;
const BATTERY_VOLTAGE_MAX: u16 = 3646;
const TX_POWER_MIN: i8 = -40;
const TX_POWER_MAX: i8 = 20;

pub fn decode(data: &[u8], validate: bool) -> Result<Option<Measurement>, DecodeError> {
    ensure_version_and_length(data, VERSION, PAYLOAD_LENGTH)?;

    let temperature_raw = read_i16(data, 1);
    let humidity_raw = read_u16(data, 3);
    let pressure_raw = read_u16(data, 5);
    let battery_voltage = battery_voltage(data);
    let tx_power = (i16::from(data[14] & 0b11111) * 2 - 40) as i8;

    if validate
        && (temperature_raw == TEMPERATURE_LIMIT_RAW
            || temperature_raw == -TEMPERATURE_LIMIT_RAW
            || humidity_raw == 0
            || humidity_raw == HUMIDITY_LIMIT_RAW
            || pressure_raw == 0
            || pressure_raw == PRESSURE_LIMIT_RAW
            || battery_voltage == BATTERY_VOLTAGE_MIN
            || battery_voltage == BATTERY_VOLTAGE_MAX
            || tx_power == TX_POWER_MIN
            || tx_power == TX_POWER_MAX)
    {
        return Ok(None);
    }

    Ok(Some(Measurement {
        temperature: f64::from(temperature_raw) * 0.005,
        humidity: f64::from(humidity_raw) * 0.0025,
        pressure: (f64::from(pressure_raw) + 50000.0) / 100.0,
        acceleration: Some(read_acceleration(data, 7)),
        battery_voltage: Some(battery_voltage),
        tx_power: Some(tx_power),
        movement_counter: Some(u32::from(data[15])),
        sequence_number: Some(u32::from(read_u16(data, 16))),
        ..Default::default()
    }))
}

/// Battery voltage occupies the top 11 bits of the field at offset 13,
/// offset by 1600 mV.
fn battery_voltage(data: &[u8]) -> u16 {
    (read_u16(data, 13) >> 5) + 1600
}
