//! Downstream sinks for decoded measurements.
//!
//! A sink receives one measurement (raw or bucket average) per push,
//! together with the originating device address and an optional display
//! name. Several named sinks can be configured; a device may restrict
//! itself to a subset by name. A push is attempted against every selected
//! sink even after the first failure, but overall success requires all of
//! them to succeed.

pub mod influxdb;

use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use log::warn;
use std::future::Future;
use std::io;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by a sink push.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// A named destination for measurements.
pub trait MeasurementSink: Send + Sync {
    /// Stable name the per-device sink selection refers to.
    fn name(&self) -> &str;

    fn write_measurements<'a>(
        &'a self,
        device: MacAddress,
        display_name: Option<&'a str>,
        measurement: &'a Measurement,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// The ordered set of configured sinks.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn MeasurementSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Box<dyn MeasurementSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Push one measurement to every selected sink.
    ///
    /// `selection` names the sinks the device is configured for; an empty
    /// selection means all of them. Every selected sink is attempted, and
    /// `true` is returned only when all of them accepted the measurement.
    pub async fn push_all(
        &self,
        selection: &[String],
        device: MacAddress,
        display_name: Option<&str>,
        measurement: &Measurement,
    ) -> bool {
        let mut all_ok = true;

        for sink in self.sinks.iter().filter(|sink| {
            selection.is_empty() || selection.iter().any(|name| name == sink.name())
        }) {
            if let Err(e) = sink
                .write_measurements(device, display_name, measurement)
                .await
            {
                warn!("{device}: sink {} rejected measurements: {e}", sink.name());
                all_ok = false;
            }
        }

        all_ok
    }
}
