//! Device discovery and worker lifecycle.
//!
//! One long-lived manager watches the bus for appearing devices, keeps the
//! address-to-worker registry and retires workers that stop producing data.
//! Each worker's state transitions run under its own async lock; the
//! registry has an independent lock of its own, so one device's slow bus
//! call never blocks another device's pipeline.

use crate::alias::AliasMap;
use crate::bus::{
    BusDevice, BusError, DeviceSignal, SENSOR_MANUFACTURER_KEY, SensorBus,
};
use crate::mac_address::MacAddress;
use crate::sink::SinkSet;
use crate::store::DeviceStore;
use crate::worker::{DeviceDefaults, DeviceWorker};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

/// Discovery sightings a worker may go through without a payload before it
/// is considered dead and evicted.
pub const ALIVE_THRESHOLD: u32 = 60;

/// Registry entry for one live worker.
///
/// The liveness counter lives here rather than in the worker so a discovery
/// sighting never has to take the worker's lock.
struct WorkerHandle {
    worker: Arc<AsyncMutex<DeviceWorker>>,
    alive_counter: Arc<AtomicU32>,
    signal_task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Called once per discovery sighting. Returns false once the worker
    /// has gone too many sightings without a payload.
    fn note_sighting(&self) -> bool {
        self.alive_counter.fetch_add(1, Ordering::Relaxed) + 1 <= ALIVE_THRESHOLD
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.signal_task.abort();
    }
}

/// Shared state the per-device tasks hang off.
struct Pipeline {
    registry: Mutex<HashMap<MacAddress, WorkerHandle>>,
    store: Arc<dyn DeviceStore>,
    sinks: Arc<SinkSet>,
    defaults: DeviceDefaults,
    aliases: AliasMap,
}

impl Pipeline {
    /// Route a sighted device to its worker, creating or replacing the
    /// worker as needed.
    async fn register_device<D: BusDevice>(self: &Arc<Self>, device: D) {
        let address = device.address();

        let manufacturer_data = match device.manufacturer_data().await {
            Ok(Some(data)) => data,
            // Many nearby devices never expose manufacturer data; skipping
            // them silently is the normal case.
            Ok(None) | Err(BusError::PropertyMissing) => {
                debug!("skipping device {address} without manufacturer data");
                return;
            }
            Err(e) => {
                warn!("error getting manufacturer data for {address}: {e}, continuing");
                return;
            }
        };

        let Some(payload) = manufacturer_data.get(&SENSOR_MANUFACTURER_KEY) else {
            debug!("unsupported manufacturer, ignoring device {address}");
            return;
        };

        let existing = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .get(&address)
                .map(|handle| (Arc::clone(&handle.worker), handle.note_sighting()))
        };
        if let Some((worker, alive)) = existing {
            if alive {
                debug!("using existing worker for {address} to handle manufacturer data");
                deliver(&device, &worker, payload).await;
                return;
            }

            // Devices are re-found at a steady interval; a worker that has
            // not produced data for this many sightings is stale.
            info!("disposing old worker for {address}");
            self.registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&address);
        }

        let name = self.aliases.get(&address).cloned();
        let worker = match DeviceWorker::create(
            address,
            Arc::clone(&self.store),
            Arc::clone(&self.sinks),
            &self.defaults,
            name,
        )
        .await
        {
            Ok(worker) => worker,
            Err(e) => {
                error!("failed to load device state for {address}: {e}");
                return;
            }
        };
        match worker.name() {
            Some(name) => info!("listening to sensor {name} ({address})"),
            None => info!("new sensor {address} found"),
        }

        let worker = Arc::new(AsyncMutex::new(worker));
        let alive_counter = Arc::new(AtomicU32::new(0));

        // Subscribe before delivering the first payload so nothing emitted
        // in between is lost; the channel buffers until the loop task runs.
        let signals = match device.watch_signals().await {
            Ok(signals) => signals,
            Err(e) => {
                warn!("could not subscribe to device {address}: {e}");
                return;
            }
        };

        deliver(&device, &worker, payload).await;

        let signal_task = tokio::spawn(signal_loop(
            device,
            signals,
            Arc::clone(&worker),
            Arc::clone(&alive_counter),
        ));

        let handle = WorkerHandle {
            worker,
            alive_counter,
            signal_task,
        };
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, handle);
    }
}

/// Consume one device's property-change events until the subscription ends.
///
/// A payload arriving here is what proves the device alive. Errors are
/// logged and never terminate the subscription.
async fn signal_loop<D: BusDevice>(
    device: D,
    mut signals: mpsc::Receiver<DeviceSignal>,
    worker: Arc<AsyncMutex<DeviceWorker>>,
    alive_counter: Arc<AtomicU32>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            DeviceSignal::ManufacturerData(data) => {
                let Some(payload) = data.get(&SENSOR_MANUFACTURER_KEY) else {
                    continue;
                };
                alive_counter.store(0, Ordering::Relaxed);
                deliver(&device, &worker, payload).await;
            }
            DeviceSignal::Rssi(rssi) => {
                worker.lock().await.handle_rssi(rssi);
            }
        }
    }
}

async fn deliver<D: BusDevice>(
    device: &D,
    worker: &AsyncMutex<DeviceWorker>,
    payload: &[u8],
) {
    let rssi = lookup_rssi(device).await;
    if let Err(e) = worker
        .lock()
        .await
        .handle_advertisement(SystemTime::now(), rssi, payload)
        .await
    {
        error!("{}: failed to handle measurements: {e}", device.address());
    }
}

/// Best-effort signal strength: the property is commonly absent right
/// after discovery, which degrades to "unknown".
async fn lookup_rssi<D: BusDevice>(device: &D) -> Option<i16> {
    match device.rssi().await {
        Ok(rssi) => rssi,
        Err(BusError::PropertyMissing) => None,
        Err(e) => {
            debug!("RSSI unavailable for {}: {e}", device.address());
            None
        }
    }
}

/// The discovery manager: bootstraps from the bus's known devices, then
/// follows the added-device event stream.
pub struct DiscoveryManager<B: SensorBus> {
    bus: B,
    pipeline: Arc<Pipeline>,
}

impl<B: SensorBus> DiscoveryManager<B> {
    pub fn new(
        bus: B,
        store: Arc<dyn DeviceStore>,
        sinks: Arc<SinkSet>,
        defaults: DeviceDefaults,
        aliases: AliasMap,
    ) -> Self {
        Self {
            bus,
            pipeline: Arc::new(Pipeline {
                registry: Mutex::new(HashMap::new()),
                store,
                sinks,
                defaults,
                aliases,
            }),
        }
    }

    /// Addresses with a live worker, for introspection.
    pub fn registered_addresses(&self) -> Vec<MacAddress> {
        self.pipeline
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Run ingestion until the bus's added-device stream ends.
    ///
    /// Known devices are registered sequentially first (an enumeration
    /// failure is logged, not fatal); every device appearing afterwards is
    /// registered on its own task so a stuck bus call only blocks that one
    /// device.
    pub async fn run(&self) -> Result<(), BusError> {
        match self.bus.known_devices().await {
            Ok(devices) => {
                for device in devices {
                    self.pipeline.register_device(device).await;
                }
            }
            Err(e) => warn!("enumerating known devices failed: {e}"),
        }

        let mut added = self.bus.watch_added().await?;
        self.bus.start_discovery().await?;
        info!("listening for bluetooth advertisements");

        while let Some(device) = added.recv().await {
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move {
                pipeline.register_device(device).await;
            });
        }

        Ok(())
    }

    /// Stop discovery and dispose every worker and subscription.
    pub async fn shutdown(&self) {
        if let Err(e) = self.bus.stop_discovery().await {
            warn!("stopping discovery failed: {e}");
        }

        let workers: Vec<WorkerHandle> = {
            let mut registry = self
                .pipeline
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registry.drain().map(|(_, handle)| handle).collect()
        };
        // Dropping the handles aborts the per-device subscriptions
        drop(workers);
        info!("stopped listening for bluetooth advertisements");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ManufacturerData;
    use crate::sink::test_sink::{RecordingSink, SharedSink};
    use crate::store::DeviceRecord;
    use crate::test_utils::{MemoryStore, TEST_MAC};
    use std::time::Duration;

    const V5_DATA: [u8; 24] = [
        0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC, 0x36,
        0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
    ];

    struct FakeDeviceInner {
        address: MacAddress,
        manufacturer_data: Option<ManufacturerData>,
        manufacturer_data_error: Option<fn() -> BusError>,
        rssi: Option<i16>,
        signal_tx: Mutex<Option<mpsc::Sender<DeviceSignal>>>,
        subscriptions: AtomicU32,
    }

    #[derive(Clone)]
    struct FakeDevice(Arc<FakeDeviceInner>);

    impl FakeDevice {
        fn new(address: MacAddress, manufacturer_data: Option<ManufacturerData>) -> Self {
            Self(Arc::new(FakeDeviceInner {
                address,
                manufacturer_data,
                manufacturer_data_error: None,
                rssi: Some(-60),
                signal_tx: Mutex::new(None),
                subscriptions: AtomicU32::new(0),
            }))
        }

        fn sensor(address: MacAddress) -> Self {
            let mut data = ManufacturerData::new();
            data.insert(SENSOR_MANUFACTURER_KEY, V5_DATA.to_vec());
            Self::new(address, Some(data))
        }

        fn failing(address: MacAddress, error: fn() -> BusError) -> Self {
            Self(Arc::new(FakeDeviceInner {
                address,
                manufacturer_data: None,
                manufacturer_data_error: Some(error),
                rssi: Some(-60),
                signal_tx: Mutex::new(None),
                subscriptions: AtomicU32::new(0),
            }))
        }

        fn subscriptions(&self) -> u32 {
            self.0.subscriptions.load(Ordering::Relaxed)
        }

        async fn emit(&self, signal: DeviceSignal) {
            let tx = self.0.signal_tx.lock().unwrap().clone().unwrap();
            tx.send(signal).await.unwrap();
        }
    }

    impl BusDevice for FakeDevice {
        fn address(&self) -> MacAddress {
            self.0.address
        }

        async fn manufacturer_data(&self) -> Result<Option<ManufacturerData>, BusError> {
            if let Some(error) = self.0.manufacturer_data_error {
                return Err(error());
            }
            Ok(self.0.manufacturer_data.clone())
        }

        async fn rssi(&self) -> Result<Option<i16>, BusError> {
            Ok(self.0.rssi)
        }

        async fn watch_signals(&self) -> Result<mpsc::Receiver<DeviceSignal>, BusError> {
            self.0.subscriptions.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(16);
            *self.0.signal_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }
    }

    struct FakeBus {
        known: Mutex<Vec<FakeDevice>>,
        discovering: std::sync::atomic::AtomicBool,
    }

    impl FakeBus {
        fn new(known: Vec<FakeDevice>) -> Self {
            Self {
                known: Mutex::new(known),
                discovering: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl SensorBus for FakeBus {
        type Device = FakeDevice;

        async fn known_devices(&self) -> Result<Vec<FakeDevice>, BusError> {
            Ok(self.known.lock().unwrap().clone())
        }

        async fn watch_added(&self) -> Result<mpsc::Receiver<FakeDevice>, BusError> {
            // Empty and immediately closed: run() returns after bootstrap
            let (tx, rx) = mpsc::channel(1);
            drop(tx);
            Ok(rx)
        }

        async fn start_discovery(&self) -> Result<(), BusError> {
            self.discovering.store(true, Ordering::Relaxed);
            Ok(())
        }

        async fn stop_discovery(&self) -> Result<(), BusError> {
            self.discovering.store(false, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Fixture {
        sink: Arc<RecordingSink>,
        manager: DiscoveryManager<FakeBus>,
    }

    fn fixture(known: Vec<FakeDevice>) -> Fixture {
        let sink = Arc::new(RecordingSink::new("influxdb"));
        let mut sinks = SinkSet::new();
        sinks.register(Box::new(SharedSink(sink.clone())));
        let store = Arc::new(MemoryStore::default());
        let manager = DiscoveryManager::new(
            FakeBus::new(known),
            store,
            Arc::new(sinks),
            DeviceDefaults::default(),
            AliasMap::new(),
        );
        Fixture { sink, manager }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_bootstrap_registers_known_sensors() {
        let fixture = fixture(vec![FakeDevice::sensor(TEST_MAC)]);
        fixture.manager.run().await.unwrap();

        assert_eq!(fixture.manager.registered_addresses(), vec![TEST_MAC]);
        // The first payload went through the normal worker path
        assert_eq!(fixture.sink.push_count(), 1);
        assert_eq!(fixture.sink.pushes.lock().unwrap()[0].2.rssi, Some(-60));
    }

    #[tokio::test]
    async fn test_foreign_manufacturer_gets_no_worker() {
        let mut data = ManufacturerData::new();
        data.insert(0x004C, vec![0x02, 0x15]);
        let fixture = fixture(vec![FakeDevice::new(TEST_MAC, Some(data))]);
        fixture.manager.run().await.unwrap();

        assert!(fixture.manager.registered_addresses().is_empty());
        assert_eq!(fixture.sink.push_count(), 0);
    }

    #[tokio::test]
    async fn test_device_without_manufacturer_data_is_skipped() {
        let fixture = fixture(vec![FakeDevice::new(TEST_MAC, None)]);
        fixture.manager.run().await.unwrap();
        assert!(fixture.manager.registered_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_bus_error_skips_the_device_for_the_pass() {
        let fixture = fixture(vec![FakeDevice::failing(TEST_MAC, || {
            BusError::Bluetooth("le-connection-abort-by-local".to_string())
        })]);
        fixture.manager.run().await.unwrap();
        assert!(fixture.manager.registered_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_resighted_device_reuses_live_worker() {
        let device = FakeDevice::sensor(TEST_MAC);
        let fixture = fixture(vec![device.clone(), device.clone()]);
        fixture.manager.run().await.unwrap();

        assert_eq!(fixture.manager.registered_addresses(), vec![TEST_MAC]);
        // One subscription, two payload deliveries
        assert_eq!(device.subscriptions(), 1);
        assert_eq!(fixture.sink.push_count(), 2);
    }

    #[tokio::test]
    async fn test_subscription_payload_reaches_the_worker() {
        let device = FakeDevice::sensor(TEST_MAC);
        let fixture = fixture(vec![device.clone()]);
        fixture.manager.run().await.unwrap();
        assert_eq!(fixture.sink.push_count(), 1);

        let mut data = ManufacturerData::new();
        data.insert(SENSOR_MANUFACTURER_KEY, V5_DATA.to_vec());
        device.emit(DeviceSignal::ManufacturerData(data)).await;

        let sink = fixture.sink.clone();
        wait_for(move || sink.push_count() == 2).await;
    }

    #[tokio::test]
    async fn test_stale_worker_is_evicted_and_replaced() {
        let device = FakeDevice::sensor(TEST_MAC);
        let fixture = fixture(vec![device.clone()]);
        fixture.manager.run().await.unwrap();
        assert_eq!(device.subscriptions(), 1);

        // Re-sight the device until the liveness counter runs out. The
        // payloads delivered through the discovery path do not count as
        // proof of life; only the subscription does.
        for _ in 0..ALIVE_THRESHOLD {
            fixture
                .manager
                .pipeline
                .register_device(device.clone())
                .await;
        }
        assert_eq!(device.subscriptions(), 1);

        // The next sighting exceeds the threshold: the old worker is
        // dropped and a fresh one constructed for the same address
        fixture
            .manager
            .pipeline
            .register_device(device.clone())
            .await;
        assert_eq!(device.subscriptions(), 2);
        assert_eq!(fixture.manager.registered_addresses(), vec![TEST_MAC]);
    }

    #[tokio::test]
    async fn test_alias_names_a_new_device() {
        let mut aliases = AliasMap::new();
        aliases.insert(TEST_MAC, "Sauna".to_string());

        let sink = Arc::new(RecordingSink::new("influxdb"));
        let mut sinks = SinkSet::new();
        sinks.register(Box::new(SharedSink(sink.clone())));
        let store = Arc::new(MemoryStore::default());
        let manager = DiscoveryManager::new(
            FakeBus::new(vec![FakeDevice::sensor(TEST_MAC)]),
            store.clone(),
            Arc::new(sinks),
            DeviceDefaults::default(),
            aliases,
        );
        manager.run().await.unwrap();

        let record = store.load(TEST_MAC).await.unwrap();
        assert_eq!(record.value.name.as_deref(), Some("Sauna"));
    }

    #[tokio::test]
    async fn test_existing_record_options_are_kept() {
        let store = Arc::new(MemoryStore::default());
        let seeded = crate::store::Versioned {
            version: 0,
            value: DeviceRecord {
                name: Some("Porch".to_string()),
                data_saving_interval: 120,
                ..DeviceRecord::default()
            },
        };
        store.save(TEST_MAC, &seeded).await.unwrap();

        let sink = Arc::new(RecordingSink::new("influxdb"));
        let mut sinks = SinkSet::new();
        sinks.register(Box::new(SharedSink(sink.clone())));
        let manager = DiscoveryManager::new(
            FakeBus::new(vec![FakeDevice::sensor(TEST_MAC)]),
            store.clone(),
            Arc::new(sinks),
            DeviceDefaults::default(),
            AliasMap::new(),
        );
        manager.run().await.unwrap();

        let record = store.load(TEST_MAC).await.unwrap();
        assert_eq!(record.value.name.as_deref(), Some("Porch"));
        assert_eq!(record.value.data_saving_interval, 120);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_workers_and_discovery() {
        let device = FakeDevice::sensor(TEST_MAC);
        let fixture = fixture(vec![device.clone()]);
        fixture.manager.run().await.unwrap();
        assert!(fixture.manager.bus.discovering.load(Ordering::Relaxed));

        fixture.manager.shutdown().await;
        assert!(fixture.manager.registered_addresses().is_empty());
        assert!(!fixture.manager.bus.discovering.load(Ordering::Relaxed));
    }
}
