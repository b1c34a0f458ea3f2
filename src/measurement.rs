//! Canonical decoded measurement record.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A 3-axis acceleration reading in g (standard gravity).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Air-quality block reported by newer tags.
///
/// Every sub-field is independently optional: a tag without a PM2.5 probe
/// still reports CO2, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AirQuality {
    /// Particulate matter (PM2.5) concentration in ug/m3
    pub pm2_5: Option<f64>,
    /// Carbon dioxide concentration in ppm
    pub co2: Option<u16>,
    /// Volatile organic compound index
    pub voc_index: Option<u16>,
    /// Nitrogen oxides index
    pub nox_index: Option<u16>,
}

/// A decoded measurement from a RuuviTag sensor.
///
/// Produced by the protocol decoder with `timestamp` and `rssi` left at
/// their defaults; the device worker stamps the receipt time and fills in
/// the signal strength. Values are in the units the tags report:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
/// - Pressure in hectopascals
/// - Battery voltage in millivolts
/// - TX power in dBm
/// - Acceleration in g (standard gravity)
/// - Luminosity in lux
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Timestamp when the measurement was received
    pub timestamp: SystemTime,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Relative humidity in percent (0-100)
    pub humidity: f64,
    /// Atmospheric pressure in hectopascals
    pub pressure: f64,
    /// Battery voltage in millivolts
    pub battery_voltage: Option<u16>,
    /// Acceleration vector in g
    pub acceleration: Option<Acceleration>,
    /// Received signal strength in dBm, filled in by the worker
    pub rssi: Option<i16>,
    /// TX power in dBm
    pub tx_power: Option<i8>,
    /// Movement counter
    pub movement_counter: Option<u32>,
    /// Measurement sequence number (8- or 16-bit depending on the format)
    pub sequence_number: Option<u32>,
    /// Air-quality block
    pub air_quality: Option<AirQuality>,
    /// Ambient luminosity in lux
    pub luminosity: Option<f64>,
}

impl Default for Measurement {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::UNIX_EPOCH,
            temperature: 0.0,
            humidity: 0.0,
            pressure: 0.0,
            battery_voltage: None,
            acceleration: None,
            rssi: None,
            tx_power: None,
            movement_counter: None,
            sequence_number: None,
            air_quality: None,
            luminosity: None,
        }
    }
}
