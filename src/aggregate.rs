//! Time-bucketed averaging of measurements.
//!
//! Pure logic, no I/O: the device worker owns a [`BucketState`] and feeds
//! every accepted measurement through [`add_to_bucket`]. Buckets are
//! half-open intervals `[start, start + size)` aligned to multiples of the
//! bucket size since the Unix epoch. A measurement past the current bucket
//! closes it (producing the bucket average) and opens the next bucket at the
//! new measurement's aligned start time -- a gap in the data does not replay
//! empty buckets.

use crate::measurement::{Acceleration, AirQuality, Measurement};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use thiserror::Error;

const HOUR_SECS: u64 = 3600;

/// The open bucket of a single device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Aligned start time of the open bucket. Only ever advances.
    pub start: Option<SystemTime>,
    /// Measurements accumulated in the open bucket, in arrival order.
    pub records: Vec<Measurement>,
}

/// Result of feeding one measurement into a bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// The measurement predates the open bucket (clock skew or transport
    /// reordering) and was discarded.
    Stale,
    /// The measurement was added to the open bucket.
    Accumulated,
    /// The open bucket expired: its average is returned and a new bucket
    /// was opened with the measurement.
    Closed(Measurement),
}

/// Rejected bucket sizes: anything that does not tile the hour.
#[derive(Error, Debug, PartialEq)]
#[error("bucket size of {0} seconds must evenly divide one hour or be a whole multiple of it")]
pub struct BucketSizeError(pub u64);

/// A bucket size is accepted when whole buckets tile the clock: sizes under
/// an hour must divide it evenly, larger sizes must be whole multiples of it.
pub fn validate_bucket_size(size: Duration) -> Result<(), BucketSizeError> {
    let secs = size.as_secs();
    let tiles = secs > 0
        && size.subsec_nanos() == 0
        && if secs < HOUR_SECS {
            HOUR_SECS % secs == 0
        } else {
            secs % HOUR_SECS == 0
        };

    if tiles {
        Ok(())
    } else {
        Err(BucketSizeError(secs))
    }
}

/// Start of the bucket containing `timestamp`:
/// `floor(unix_seconds / size) * size`.
pub fn aligned_bucket_start(timestamp: SystemTime, size: Duration) -> SystemTime {
    let unix_secs = timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let size_secs = size.as_secs().max(1);
    SystemTime::UNIX_EPOCH + Duration::from_secs(unix_secs / size_secs * size_secs)
}

/// Feed one measurement into the open bucket.
pub fn add_to_bucket(
    state: &mut BucketState,
    size: Duration,
    measurement: Measurement,
) -> AddOutcome {
    let aligned = aligned_bucket_start(measurement.timestamp, size);

    let Some(start) = state.start else {
        state.start = Some(aligned);
        state.records.push(measurement);
        return AddOutcome::Accumulated;
    };

    if measurement.timestamp < start {
        return AddOutcome::Stale;
    }

    if aligned == start {
        state.records.push(measurement);
        return AddOutcome::Accumulated;
    }

    let average = average_measurements(&state.records, start);
    state.start = Some(aligned);
    state.records.clear();
    state.records.push(measurement);

    match average {
        Some(average) => AddOutcome::Closed(average),
        None => AddOutcome::Accumulated,
    }
}

/// Average a bucket's records into a single measurement stamped `timestamp`.
///
/// Humidity, temperature, pressure and signal strength take the arithmetic
/// mean. Battery voltage and the movement/sequence counters take the last
/// record's value: averaging an instantaneous voltage or a monotonic counter
/// is not meaningful. Acceleration and the air-quality sub-fields are each
/// averaged independently across the records that carry them.
pub fn average_measurements(records: &[Measurement], timestamp: SystemTime) -> Option<Measurement> {
    let last = records.last()?;

    let acceleration = match (
        mean_present(records, |m| m.acceleration.map(|a| a.x)),
        mean_present(records, |m| m.acceleration.map(|a| a.y)),
        mean_present(records, |m| m.acceleration.map(|a| a.z)),
    ) {
        (Some(x), Some(y), Some(z)) => Some(Acceleration { x, y, z }),
        _ => None,
    };

    let air_quality = records.iter().any(|m| m.air_quality.is_some()).then(|| {
        AirQuality {
            pm2_5: mean_present(records, |m| m.air_quality.and_then(|aq| aq.pm2_5)),
            co2: mean_present(records, |m| m.air_quality.and_then(|aq| aq.co2).map(f64::from))
                .map(|v| v.round() as u16),
            voc_index: mean_present(records, |m| {
                m.air_quality.and_then(|aq| aq.voc_index).map(f64::from)
            })
            .map(|v| v.round() as u16),
            nox_index: mean_present(records, |m| {
                m.air_quality.and_then(|aq| aq.nox_index).map(f64::from)
            })
            .map(|v| v.round() as u16),
        }
    });

    Some(Measurement {
        timestamp,
        temperature: mean(records, |m| m.temperature),
        humidity: mean(records, |m| m.humidity),
        pressure: mean(records, |m| m.pressure),
        battery_voltage: last.battery_voltage,
        acceleration,
        rssi: mean_present(records, |m| m.rssi.map(f64::from)).map(|v| v.round() as i16),
        tx_power: last.tx_power,
        movement_counter: last.movement_counter,
        sequence_number: last.sequence_number,
        air_quality,
        luminosity: mean_present(records, |m| m.luminosity),
    })
}

fn mean(records: &[Measurement], field: impl Fn(&Measurement) -> f64) -> f64 {
    records.iter().map(field).sum::<f64>() / records.len() as f64
}

/// Mean over the records where the field is present; `None` if it never is.
fn mean_present(
    records: &[Measurement],
    field: impl Fn(&Measurement) -> Option<f64>,
) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in records.iter().filter_map(field) {
        sum += value;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}
