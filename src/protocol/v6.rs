//! Air-quality (version 6) payload format.
//!
//! 20 bytes: temperature/humidity/pressure as in RAWv2, then PM2.5, CO2,
//! 9-bit VOC and NOx indexes (8-bit MSB bytes plus one low bit each in the
//! shared flags byte), a logarithmic luminosity code and an 8-bit sequence
//! number.

use super::{DecodeError, ensure_version_and_length, read_i16, read_u16, round2};
use crate::measurement::{AirQuality, Measurement};

pub const VERSION: u8 = 6;
pub const PAYLOAD_LENGTH: usize = 20;

// Sentinel values marking "sensor not ready".
const TEMPERATURE_LIMIT_RAW: i16 = 32767;
const HUMIDITY_LIMIT_RAW: u16 = 40000;
const PRESSURE_LIMIT_RAW: u16 = 65535;
const PM25_LIMIT_RAW: u16 = 10000;
const CO2_LIMIT: u16 = 40000;
const VOC_LIMIT: u16 = 500;
const NOX_LIMIT: u16 = 500;

/// Luminosity encoding constant: `ln(65536) / 254`.
const LUMINOSITY_DELTA: f64 = 16.0 * std::f64::consts::LN_2 / 254.0;

pub fn decode(data: &[u8], validate: bool) -> Result<Option<Measurement>, DecodeError> {
    ensure_version_and_length(data, VERSION, PAYLOAD_LENGTH)?;

    let temperature_raw = read_i16(data, 1);
    let humidity_raw = read_u16(data, 3);
    let pressure_raw = read_u16(data, 5);
    let pm2_5_raw = read_u16(data, 7);
    let co2 = read_u16(data, 9);

    // VOC and NOx are 9-bit values split across bytes: the flags byte
    // carries the low bit of each.
    let flags = data[16];
    let voc = u16::from(data[11]) << 1 | u16::from((flags >> 6) & 1);
    let nox = u16::from(data[12]) << 1 | u16::from((flags >> 7) & 1);

    if validate {
        // All bits set across the measurement fields means the sensors are
        // entirely unavailable (e.g. right after boot).
        let all_unavailable = read_u16(data, 1) == 0x8000
            && humidity_raw == 0xFFFF
            && pressure_raw == 0xFFFF
            && pm2_5_raw == 0xFFFF
            && co2 == 0xFFFF
            && data[11] == 0xFF
            && data[12] == 0xFF;
        if all_unavailable {
            return Ok(None);
        }

        if temperature_raw == TEMPERATURE_LIMIT_RAW
            || temperature_raw == -TEMPERATURE_LIMIT_RAW
            || humidity_raw == 0
            || humidity_raw == HUMIDITY_LIMIT_RAW
            || pressure_raw == PRESSURE_LIMIT_RAW
        {
            return Ok(None);
        }
    }

    Ok(Some(Measurement {
        temperature: f64::from(temperature_raw) * 0.005,
        humidity: f64::from(humidity_raw) * 0.0025,
        pressure: (f64::from(pressure_raw) + 50000.0) / 100.0,
        sequence_number: Some(u32::from(data[15])),
        air_quality: air_quality(pm2_5_raw, co2, voc, nox),
        luminosity: luminosity(data[13]),
        ..Default::default()
    }))
}

/// A sub-field at its maximum means that probe is absent; the reading as a
/// whole stays valid. If every sub-field is absent the block is omitted.
fn air_quality(pm2_5_raw: u16, co2: u16, voc: u16, nox: u16) -> Option<AirQuality> {
    if pm2_5_raw == PM25_LIMIT_RAW && co2 == CO2_LIMIT && voc == VOC_LIMIT && nox == NOX_LIMIT {
        return None;
    }

    Some(AirQuality {
        pm2_5: (pm2_5_raw != PM25_LIMIT_RAW).then(|| f64::from(pm2_5_raw) * 0.1),
        co2: (co2 != CO2_LIMIT).then_some(co2),
        voc_index: (voc != VOC_LIMIT).then_some(voc),
        nox_index: (nox != NOX_LIMIT).then_some(nox),
    })
}

/// Inverse of `code = round(ln(value + 1) / DELTA)`: code 0 means no
/// reading, 254 saturation, 255 is reserved.
fn luminosity(code: u8) -> Option<f64> {
    match code {
        0 | 255 => None,
        254 => Some(65535.0),
        code => Some(round2((f64::from(code) * LUMINOSITY_DELTA).exp() - 1.0)),
    }
}
