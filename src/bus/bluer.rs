//! BlueZ D-Bus implementation of the bus capability traits.
//!
//! Uses the `bluer` crate to talk to the BlueZ daemon; requires a running
//! `bluetoothd`. All BlueZ types stay inside this module.

use super::{BusDevice, BusError, DeviceSignal, ManufacturerData, SensorBus};
use crate::mac_address::MacAddress;
use bluer::{Adapter, AdapterEvent, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Channel buffer size for discovered devices and per-device signals.
const EVENT_CHANNEL_BUFFER_SIZE: usize = 64;

impl From<bluer::Error> for BusError {
    fn from(err: bluer::Error) -> Self {
        BusError::Bluetooth(err.to_string())
    }
}

/// A BlueZ session bound to one adapter.
pub struct BluerBus {
    // The session must outlive the adapter handle
    _session: Session,
    adapter: Adapter,
    added_tx: Mutex<Option<mpsc::Sender<BluerDevice>>>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluerBus {
    /// Connect to the system bus and power on the adapter, the default one
    /// unless a name (e.g. `hci0`) is given.
    pub async fn connect(adapter_name: Option<&str>) -> Result<Self, BusError> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;

        Ok(Self {
            _session: session,
            adapter,
            added_tx: Mutex::new(None),
            discovery_task: Mutex::new(None),
        })
    }
}

impl SensorBus for BluerBus {
    type Device = BluerDevice;

    async fn known_devices(&self) -> Result<Vec<BluerDevice>, BusError> {
        let mut devices = Vec::new();
        for address in self.adapter.device_addresses().await? {
            match self.adapter.device(address) {
                Ok(device) => devices.push(BluerDevice { device }),
                Err(e) => warn!("skipping known device {address}: {e}"),
            }
        }
        Ok(devices)
    }

    async fn watch_added(&self) -> Result<mpsc::Receiver<BluerDevice>, BusError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
        *self
            .added_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    async fn start_discovery(&self) -> Result<(), BusError> {
        let Some(tx) = self
            .added_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return Err(BusError::Bluetooth(
                "watch_added must be subscribed before starting discovery".to_string(),
            ));
        };

        let mut events = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    match adapter.device(address) {
                        Ok(device) => {
                            if tx.send(BluerDevice { device }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("ignoring added device {address}: {e}"),
                    }
                }
            }
        });
        *self
            .discovery_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), BusError> {
        if let Some(task) = self
            .discovery_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            // Dropping the discover_devices stream inside the task ends the
            // BlueZ discovery session
            task.abort();
        }
        Ok(())
    }
}

/// One BlueZ device object.
pub struct BluerDevice {
    device: bluer::Device,
}

impl BusDevice for BluerDevice {
    fn address(&self) -> MacAddress {
        self.device.address().into()
    }

    async fn manufacturer_data(&self) -> Result<Option<ManufacturerData>, BusError> {
        Ok(self.device.manufacturer_data().await?)
    }

    async fn rssi(&self) -> Result<Option<i16>, BusError> {
        Ok(self.device.rssi().await?)
    }

    async fn watch_signals(&self) -> Result<mpsc::Receiver<DeviceSignal>, BusError> {
        let mut events = self.device.events().await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

        tokio::spawn(async move {
            while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
                let signal = match property {
                    DeviceProperty::ManufacturerData(data) => DeviceSignal::ManufacturerData(data),
                    DeviceProperty::Rssi(rssi) => DeviceSignal::Rssi(rssi),
                    _ => continue,
                };
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}
