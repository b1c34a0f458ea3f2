//! InfluxDB line protocol sink.
//!
//! Writes one line per measurement to an injected writer (stdout in the
//! binary, so the process can be wrapped by Telegraf `execd` or similar).
//! The actual time-series database client stays outside this crate.

use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use crate::sink::{MeasurementSink, SinkError};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
enum FieldValue {
    Float(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
struct DataPoint {
    measurement: String,
    tag_set: BTreeMap<String, String>,
    field_set: BTreeMap<String, FieldValue>,
    timestamp: SystemTime,
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.measurement)?;
        for (key, value) in self.tag_set.iter() {
            write!(fmt, ",{}={}", key, value)?;
        }
        write!(fmt, " ")?;
        let mut first = true;
        for (key, value) in self.field_set.iter() {
            if first {
                first = false;
            } else {
                write!(fmt, ",")?;
            }
            write!(fmt, "{}={}", key, value)?;
        }
        let nanos = self
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        write!(fmt, " {}", nanos)
    }
}

/// Line-protocol formatting sink.
///
/// The measurement name is configurable; tags carry the MAC address and the
/// device display name when one is attached to the push.
pub struct InfluxDbSink<W: Write + Send> {
    measurement_name: String,
    out: Mutex<W>,
}

impl InfluxDbSink<std::io::Stdout> {
    pub fn stdout(measurement_name: String) -> Self {
        Self::new(measurement_name, std::io::stdout())
    }
}

impl<W: Write + Send> InfluxDbSink<W> {
    pub fn new(measurement_name: String, out: W) -> Self {
        Self {
            measurement_name,
            out: Mutex::new(out),
        }
    }

    fn data_point(
        &self,
        device: MacAddress,
        display_name: Option<&str>,
        measurement: &Measurement,
    ) -> DataPoint {
        let mut tag_set = BTreeMap::new();
        tag_set.insert("mac".to_string(), device.to_string());
        if let Some(name) = display_name {
            tag_set.insert("name".to_string(), name.replace(' ', "\\ "));
        }

        let mut field_set = BTreeMap::new();
        let mut field = |key: &str, value: Option<f64>| {
            if let Some(value) = value {
                field_set.insert(key.to_string(), FieldValue::Float(value));
            }
        };

        field("temperature", Some(measurement.temperature));
        field("humidity", Some(measurement.humidity));
        field("pressure", Some(measurement.pressure));
        field("battery_voltage", measurement.battery_voltage.map(f64::from));
        field("rssi", measurement.rssi.map(f64::from));
        field("tx_power", measurement.tx_power.map(f64::from));
        field(
            "movement_counter",
            measurement.movement_counter.map(f64::from),
        );
        field(
            "measurement_sequence_number",
            measurement.sequence_number.map(f64::from),
        );
        if let Some(acceleration) = measurement.acceleration {
            field("acceleration_x", Some(acceleration.x));
            field("acceleration_y", Some(acceleration.y));
            field("acceleration_z", Some(acceleration.z));
        }
        if let Some(air_quality) = measurement.air_quality {
            field("pm2_5", air_quality.pm2_5);
            field("co2", air_quality.co2.map(f64::from));
            field("voc_index", air_quality.voc_index.map(f64::from));
            field("nox_index", air_quality.nox_index.map(f64::from));
        }
        field("luminosity", measurement.luminosity);

        DataPoint {
            measurement: self.measurement_name.clone(),
            tag_set,
            field_set,
            timestamp: measurement.timestamp,
        }
    }
}

impl<W: Write + Send> MeasurementSink for InfluxDbSink<W> {
    fn name(&self) -> &str {
        "influxdb"
    }

    fn write_measurements<'a>(
        &'a self,
        device: MacAddress,
        display_name: Option<&'a str>,
        measurement: &'a Measurement,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        let line = self.data_point(device, display_name, measurement).to_string();
        let result = {
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            writeln!(out, "{line}").and_then(|_| out.flush())
        };
        Box::pin(async move { result.map_err(SinkError::from) })
    }
}
