//! Per-device decode-and-forward worker.
//!
//! Exactly one worker exists per live device address. The worker decodes
//! incoming advertisement payloads, applies the device's retained options,
//! and either averages measurements into time buckets or passes them
//! through raw at a throttled cadence. All entry points run under the
//! per-worker lock held by the discovery registry, so the state transitions
//! here are single-threaded.

use crate::aggregate::{self, AddOutcome};
use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use crate::protocol;
use crate::sink::SinkSet;
use crate::store::{CachedAverage, DeviceRecord, DeviceStore, StoreError, Versioned};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Options applied to a device seen for the first time.
#[derive(Debug, Clone)]
pub struct DeviceDefaults {
    pub data_saving_interval: u32,
    pub calculate_averages: bool,
    pub store_acceleration: bool,
    pub store_name: bool,
    pub discard_extreme_values: bool,
    pub bucket_size: Duration,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            data_saving_interval: 0,
            calculate_averages: false,
            store_acceleration: true,
            store_name: true,
            discard_extreme_values: false,
            bucket_size: Duration::from_secs(3600),
        }
    }
}

/// Errors surfaced by the worker to its caller.
///
/// Decode failures are not among them: a bad packet is logged and dropped
/// while the worker stays alive. What must surface is a persistence
/// conflict, since it means someone else mutated this device's state.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DeviceWorker {
    address: MacAddress,
    record: Versioned<DeviceRecord>,
    last_push: Option<SystemTime>,
    last_rssi: Option<i16>,
    store: Arc<dyn DeviceStore>,
    sinks: Arc<SinkSet>,
}

impl DeviceWorker {
    /// Load (or initialize) the device's durable record and build a worker.
    ///
    /// A record at version 0 has never been stored: CLI defaults and the
    /// alias-provided name are applied and written back once.
    pub async fn create(
        address: MacAddress,
        store: Arc<dyn DeviceStore>,
        sinks: Arc<SinkSet>,
        defaults: &DeviceDefaults,
        name: Option<String>,
    ) -> Result<Self, WorkerError> {
        let mut record = store.load(address).await?;
        if record.version == 0 {
            record.value.name = name;
            record.value.data_saving_interval = defaults.data_saving_interval;
            record.value.calculate_averages = defaults.calculate_averages;
            record.value.store_acceleration = defaults.store_acceleration;
            record.value.store_name = defaults.store_name;
            record.value.discard_extreme_values = defaults.discard_extreme_values;
            record.value.bucket_size = defaults.bucket_size;
            record.version = store.save(address, &record).await?;
        }

        Ok(Self {
            address,
            record,
            last_push: None,
            last_rssi: None,
            store,
            sinks,
        })
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.record.value.name.as_deref()
    }

    /// Name used in log lines: the display name when one is set.
    fn identity(&self) -> String {
        self.record
            .value
            .name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }

    fn display_name(&self) -> Option<&str> {
        if self.record.value.store_name {
            self.record.value.name.as_deref()
        } else {
            None
        }
    }

    /// Record the device's signal strength as reported by the bus.
    ///
    /// Used as a fallback when an advertisement arrives without a fresh
    /// RSSI reading.
    pub fn handle_rssi(&mut self, rssi: i16) {
        self.last_rssi = Some(rssi);
    }

    /// Decode one advertisement payload and feed it through the pipeline.
    pub async fn handle_advertisement(
        &mut self,
        timestamp: SystemTime,
        rssi: Option<i16>,
        data: &[u8],
    ) -> Result<(), WorkerError> {
        let mut measurement =
            match protocol::decode(data, self.record.value.discard_extreme_values) {
                Ok(Some(measurement)) => measurement,
                Ok(None) => {
                    debug!("{}: discarding packet data with invalid values", self.identity());
                    return Ok(());
                }
                Err(e) => {
                    error!("{}: failed to parse measurements: {e}", self.identity());
                    return Ok(());
                }
            };

        measurement.timestamp = timestamp;
        measurement.rssi = rssi.or(self.last_rssi);
        if let Some(rssi) = rssi {
            self.last_rssi = Some(rssi);
        }

        // The tag always reports acceleration, drop it when not retained
        if !self.record.value.store_acceleration {
            measurement.acceleration = None;
        }

        if self.record.value.calculate_averages {
            self.bucket_measurement(measurement).await
        } else {
            self.passthrough_measurement(measurement).await
        }
    }

    /// Averaging path: accumulate into the open bucket; a closed bucket
    /// lands in the backlog and triggers a delivery attempt of everything
    /// still queued.
    async fn bucket_measurement(&mut self, measurement: Measurement) -> Result<(), WorkerError> {
        let size = self.record.value.bucket_size;
        match aggregate::add_to_bucket(&mut self.record.value.bucket, size, measurement) {
            AddOutcome::Stale => {
                debug!("{}: discarding stale measurement", self.identity());
                Ok(())
            }
            AddOutcome::Accumulated => Ok(()),
            AddOutcome::Closed(average) => {
                self.record.value.backlog.push(CachedAverage::new(average));
                self.flush_backlog().await;
                self.persist().await
            }
        }
    }

    /// Deliver unsent backlog entries, oldest first.
    ///
    /// Delivery stops at the first failure so that an older bucket never
    /// arrives after a newer one; whatever remains is retried when the next
    /// bucket closes.
    async fn flush_backlog(&mut self) {
        let sinks = Arc::clone(&self.sinks);
        let selection = self.record.value.sinks.clone();
        let identity = self.identity();
        let display_name = self.display_name().map(str::to_owned);

        for entry in &mut self.record.value.backlog {
            if sinks
                .push_all(
                    &selection,
                    self.address,
                    display_name.as_deref(),
                    &entry.measurement,
                )
                .await
            {
                debug!("{identity}: measurements sent successfully");
                entry.sent = true;
            } else {
                warn!("{identity}: there was a problem sending the measurements");
                break;
            }
        }

        self.record.value.backlog.retain(|entry| !entry.sent);
    }

    /// Raw passthrough path: push once enough time has elapsed since the
    /// last successful push, measured against the device-reported
    /// timestamps. A failed push does not advance the cadence, so the next
    /// eligible packet retries.
    async fn passthrough_measurement(
        &mut self,
        measurement: Measurement,
    ) -> Result<(), WorkerError> {
        let interval = Duration::from_secs(u64::from(self.record.value.data_saving_interval));
        let due = match self.last_push {
            None => true,
            Some(last) => measurement
                .timestamp
                .duration_since(last)
                .map(|elapsed| elapsed >= interval)
                .unwrap_or(false),
        };
        if !due {
            return Ok(());
        }

        let pushed = self
            .sinks
            .push_all(
                &self.record.value.sinks,
                self.address,
                self.display_name(),
                &measurement,
            )
            .await;
        if pushed {
            debug!("{}: measurements sent successfully", self.identity());
            self.last_push = Some(measurement.timestamp);
        } else {
            warn!(
                "{}: there was a problem sending the measurements",
                self.identity()
            );
        }

        Ok(())
    }

    async fn persist(&mut self) -> Result<(), WorkerError> {
        self.record.version = self.store.save(self.address, &self.record).await?;
        Ok(())
    }
}
