//! Capability interface over the Bluetooth object bus.
//!
//! The discovery manager only ever needs a handful of operations from the
//! bus: enumerate known devices, watch for new ones, start/stop discovery,
//! and read a device's address, manufacturer data and signal strength.
//! These traits expose exactly that surface so the pipeline can be driven
//! by a fake bus in tests; the real BlueZ implementation lives in
//! [`bluer`](self::bluer).

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bluetooth company identifier of Ruuvi Innovations Ltd.
///
/// Only manufacturer data stored under this key is ever decoded; a device
/// that does not carry the key is not a recognized sensor and gets no
/// worker.
pub const SENSOR_MANUFACTURER_KEY: u16 = 0x0499;

/// Manufacturer-specific data as exposed on the bus: company ID to raw
/// payload bytes.
pub type ManufacturerData = HashMap<u16, Vec<u8>>;

/// Property-change events delivered for a single device.
#[derive(Debug, Clone)]
pub enum DeviceSignal {
    ManufacturerData(ManufacturerData),
    Rssi(i16),
}

/// Error type for bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// The property is not populated on the bus yet. Routine right after
    /// discovery (RSSI) or for devices that never expose it; callers
    /// degrade to "unknown" or skip silently.
    #[error("property not present on the bus")]
    PropertyMissing,
    /// Any other transport failure.
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// One discovered device on the bus.
pub trait BusDevice: Send + Sync + 'static {
    fn address(&self) -> MacAddress;

    fn manufacturer_data(
        &self,
    ) -> impl Future<Output = Result<Option<ManufacturerData>, BusError>> + Send;

    fn rssi(&self) -> impl Future<Output = Result<Option<i16>, BusError>> + Send;

    /// Subscribe to this device's property changes. The subscription lives
    /// until the receiver is dropped.
    fn watch_signals(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<DeviceSignal>, BusError>> + Send;
}

/// The adapter-level bus surface.
pub trait SensorBus: Send + Sync + 'static {
    type Device: BusDevice;

    /// Devices the bus already knows about, parented under the configured
    /// adapter.
    fn known_devices(&self) -> impl Future<Output = Result<Vec<Self::Device>, BusError>> + Send;

    /// Subscribe to newly appearing devices. Must be called before
    /// [`start_discovery`](Self::start_discovery).
    fn watch_added(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<Self::Device>, BusError>> + Send;

    fn start_discovery(&self) -> impl Future<Output = Result<(), BusError>> + Send;

    fn stop_discovery(&self) -> impl Future<Output = Result<(), BusError>> + Send;
}
