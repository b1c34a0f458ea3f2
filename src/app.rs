//! Core application wiring for `ruuvitag-ingest`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit
//! codes: the binary (`src/main.rs`) parses [`Options`] and supplies the
//! shutdown future, everything else happens here.

use crate::aggregate::BucketSizeError;
use crate::alias::Alias;
#[cfg(feature = "bluer")]
use crate::alias::to_map;
use crate::bus::BusError;
#[cfg(feature = "bluer")]
use crate::bus::bluer::BluerBus;
#[cfg(feature = "bluer")]
use crate::discovery::DiscoveryManager;
#[cfg(feature = "bluer")]
use crate::sink::SinkSet;
#[cfg(feature = "bluer")]
use crate::sink::influxdb::InfluxDbSink;
#[cfg(feature = "bluer")]
use crate::store::JsonFileStore;
use crate::worker::DeviceDefaults;
use clap::Parser;
#[cfg(feature = "bluer")]
use log::error;
#[cfg(feature = "bluer")]
use std::future::Future;
use std::io;
use std::path::PathBuf;
#[cfg(feature = "bluer")]
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the ingestion pipeline.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth adapter to listen on (e.g. hci0); the default adapter if
    /// not given.
    #[arg(long)]
    pub adapter: Option<String>,

    /// Specify human-readable alias for RuuviTag id.
    /// Format: --alias DE:AD:BE:EF:00:00=Sauna
    #[arg(long = "alias", value_parser = crate::alias::parse_alias, value_name = "ALIAS")]
    pub aliases: Vec<Alias>,

    /// The name of the measurement in InfluxDB line protocol.
    #[arg(long, default_value = "ruuvi_measurement")]
    pub influxdb_measurement: String,

    /// Average measurements into time buckets instead of pushing raw
    /// packets.
    #[arg(long)]
    pub average: bool,

    /// Averaging bucket size. Must evenly divide one hour, or be a whole
    /// multiple of it. Accepts duration with suffix: 5m, 1h.
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub bucket_size: Duration,

    /// Minimum time between raw pushes per tag.
    /// Accepts duration with suffix: 3s, 1m, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "0s", value_parser = parse_duration)]
    pub saving_interval: Duration,

    /// Do not retain acceleration readings.
    #[arg(long)]
    pub no_acceleration: bool,

    /// Do not attach device display names to sink pushes.
    #[arg(long)]
    pub no_names: bool,

    /// Discard packets whose fields sit at their sentinel min/max values.
    #[arg(long)]
    pub discard_extremes: bool,

    /// Directory holding the per-device state documents.
    #[arg(long, default_value = "device-state")]
    pub state_dir: PathBuf,

    /// Verbose output, log skipped devices and dropped packets
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Options applied to devices seen for the first time.
    pub fn device_defaults(&self) -> DeviceDefaults {
        DeviceDefaults {
            data_saving_interval: self.saving_interval.as_secs() as u32,
            calculate_averages: self.average,
            store_acceleration: !self.no_acceleration,
            store_name: !self.no_names,
            discard_extreme_values: self.discard_extremes,
            bucket_size: self.bucket_size,
        }
    }
}

/// Errors returned by the run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    BucketSize(#[from] BucketSizeError),
}

/// Run the ingestion pipeline until `shutdown` resolves.
///
/// Invalid configuration is fatal. A bus connection failure at startup is
/// not: ingestion is disabled with an error logged, and the process stays
/// up until shutdown so it keeps serving whatever else is attached to it.
#[cfg(feature = "bluer")]
pub async fn run(options: Options, shutdown: impl Future<Output = ()>) -> Result<(), RunError> {
    crate::aggregate::validate_bucket_size(options.bucket_size)?;

    let store = Arc::new(JsonFileStore::new(&options.state_dir)?);
    let mut sinks = SinkSet::new();
    sinks.register(Box::new(InfluxDbSink::stdout(
        options.influxdb_measurement.clone(),
    )));

    tokio::pin!(shutdown);

    let bus = match BluerBus::connect(options.adapter.as_deref()).await {
        Ok(bus) => bus,
        Err(e) => {
            error!("bus error: {e}");
            error!("not listening for bluetooth events");
            shutdown.await;
            return Ok(());
        }
    };

    let manager = DiscoveryManager::new(
        bus,
        store,
        Arc::new(sinks),
        options.device_defaults(),
        to_map(&options.aliases),
    );

    tokio::select! {
        result = manager.run() => {
            if let Err(e) = result {
                error!("bus error: {e}");
                error!("not listening for bluetooth events");
                (&mut shutdown).await;
            }
        }
        _ = &mut shutdown => {}
    }

    manager.shutdown().await;
    Ok(())
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use ruuvitag_ingest::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    if let Some(num) = src.strip_suffix("ms") {
        let millis: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid milliseconds: {}", num))?;
        return Ok(Duration::from_millis(millis));
    }

    if let Some(num) = src.strip_suffix('h') {
        let hours: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid hours: {}", num))?;
        return Ok(Duration::from_secs(hours * 3600));
    }

    if let Some(num) = src.strip_suffix('m') {
        let minutes: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid minutes: {}", num))?;
        return Ok(Duration::from_secs(minutes * 60));
    }

    if let Some(num) = src.strip_suffix('s') {
        let secs: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid seconds: {}", num))?;
        return Ok(Duration::from_secs(secs));
    }

    // No suffix, treat as seconds
    let secs: u64 = src
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    Ok(Duration::from_secs(secs))
}
