//! `ruuvitag-ingest` library.
//!
//! Ingests RuuviTag BLE advertisements and forwards decoded measurements to
//! downstream sinks at a controlled cadence. The pipeline has four parts:
//! the [`protocol`] decoders turn raw manufacturer data into canonical
//! [`Measurement`]s, a per-device [`worker`](crate::worker) applies the
//! device's retained options and either averages into time
//! [buckets](crate::aggregate) or passes packets through raw, and the
//! [`discovery`](crate::discovery) manager maps bus devices to workers and
//! retires the ones that go quiet.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process
//! exit codes. The core logic is decoupled from the real Bluetooth bus
//! behind the [`bus`] traits so it can be tested deterministically.

pub mod aggregate;
pub mod alias;
pub mod app;
pub mod bus;
pub mod discovery;
pub mod mac_address;
pub mod measurement;
pub mod protocol;
pub mod sink;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at the crate root
pub use aggregate::{AddOutcome, BucketState};
pub use alias::{Alias, AliasMap, parse_alias, to_map};
pub use discovery::DiscoveryManager;
pub use mac_address::MacAddress;
pub use measurement::{Acceleration, AirQuality, Measurement};
pub use protocol::{DecodeError, decode};
pub use sink::{MeasurementSink, SinkSet};
pub use store::{DeviceRecord, DeviceStore, JsonFileStore};
pub use worker::{DeviceDefaults, DeviceWorker};
