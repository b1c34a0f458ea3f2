//! Durable per-device state.
//!
//! Each device's options, open bucket and unsent backlog survive restarts.
//! Records are read and written whole, guarded by an optimistic version
//! check: a save fails with [`StoreError::Conflict`] when the stored version
//! no longer matches the one that was read, so concurrent mutation surfaces
//! instead of being silently overwritten. A device that has never been seen
//! loads as version 0 with default options.

use crate::aggregate::BucketState;
use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// A bucket average waiting to be delivered to the sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAverage {
    pub sent: bool,
    pub measurement: Measurement,
}

impl CachedAverage {
    pub fn new(measurement: Measurement) -> Self {
        Self {
            sent: false,
            measurement,
        }
    }
}

/// Durable fields of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    /// Human-readable display name
    pub name: Option<String>,
    /// Attach the display name to sink pushes
    pub store_name: bool,
    /// Minimum seconds between raw passthrough pushes
    pub data_saving_interval: u32,
    /// Average into time buckets instead of pushing raw measurements
    pub calculate_averages: bool,
    /// Retain acceleration readings
    pub store_acceleration: bool,
    /// Discard readings whose fields sit at their sentinel extremes
    pub discard_extreme_values: bool,
    /// Size of the averaging bucket
    pub bucket_size: Duration,
    /// The open bucket
    pub bucket: BucketState,
    /// Completed bucket averages not yet confirmed by every sink,
    /// oldest first
    pub backlog: Vec<CachedAverage>,
    /// Names of the sinks this device pushes to; empty means all
    /// configured sinks
    pub sinks: Vec<String>,
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self {
            name: None,
            store_name: false,
            data_saving_interval: 0,
            calculate_averages: false,
            store_acceleration: true,
            discard_extreme_values: false,
            bucket_size: Duration::from_secs(3600),
            bucket: BucketState::default(),
            backlog: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

/// A value paired with the storage version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Errors from the device store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error accessing device state: {0}")]
    Io(#[from] io::Error),
    #[error("malformed device state document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("version conflict writing state for {address}: read version {expected}, stored version {stored}")]
    Conflict {
        address: MacAddress,
        expected: u64,
        stored: u64,
    },
}

/// Load/save of per-device durable state, keyed by MAC address.
pub trait DeviceStore: Send + Sync {
    fn load(
        &self,
        address: MacAddress,
    ) -> Pin<Box<dyn Future<Output = Result<Versioned<DeviceRecord>, StoreError>> + Send + '_>>;

    /// Persist `record.value` and return the new version. Fails with
    /// [`StoreError::Conflict`] when the stored version differs from
    /// `record.version`.
    fn save<'a>(
        &'a self,
        address: MacAddress,
        record: &'a Versioned<DeviceRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + 'a>>;
}

/// One JSON document per device under a root directory.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, address: MacAddress) -> PathBuf {
        self.root.join(format!("{}.json", address.storage_key()))
    }

    fn load_sync(&self, address: MacAddress) -> Result<Versioned<DeviceRecord>, StoreError> {
        match fs::read(self.path(address)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Versioned {
                version: 0,
                value: DeviceRecord::default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn save_sync(
        &self,
        address: MacAddress,
        record: &Versioned<DeviceRecord>,
    ) -> Result<u64, StoreError> {
        let path = self.path(address);
        let stored = stored_version(&path)?;
        if stored != record.version {
            return Err(StoreError::Conflict {
                address,
                expected: record.version,
                stored,
            });
        }

        let next = Versioned {
            version: record.version + 1,
            value: &record.value,
        };
        fs::write(&path, serde_json::to_vec_pretty(&next)?)?;
        Ok(next.version)
    }
}

fn stored_version(path: &Path) -> Result<u64, StoreError> {
    #[derive(Deserialize)]
    struct VersionOnly {
        version: u64,
    }

    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice::<VersionOnly>(&bytes)?.version),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

impl DeviceStore for JsonFileStore {
    fn load(
        &self,
        address: MacAddress,
    ) -> Pin<Box<dyn Future<Output = Result<Versioned<DeviceRecord>, StoreError>> + Send + '_>>
    {
        let result = self.load_sync(address);
        Box::pin(async move { result })
    }

    fn save<'a>(
        &'a self,
        address: MacAddress,
        record: &'a Versioned<DeviceRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + 'a>> {
        let result = self.save_sync(address, record);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(label: &str) -> Self {
            static SEQ: AtomicU32 = AtomicU32::new(0);
            let dir = std::env::temp_dir().join(format!(
                "ruuvitag-ingest-{label}-{}-{}",
                std::process::id(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            TempDir(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn test_absent_record_loads_as_uninitialized() {
        let dir = TempDir::new("absent");
        let store = JsonFileStore::new(&dir.0).unwrap();

        let record = store.load(TEST_MAC).await.unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.value, DeviceRecord::default());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new("round-trip");
        let store = JsonFileStore::new(&dir.0).unwrap();

        let mut record = store.load(TEST_MAC).await.unwrap();
        record.value.name = Some("Sauna".to_string());
        record.value.calculate_averages = true;
        record.value.bucket_size = Duration::from_secs(300);

        let version = store.save(TEST_MAC, &record).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load(TEST_MAC).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value, record.value);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let dir = TempDir::new("conflict");
        let store = JsonFileStore::new(&dir.0).unwrap();

        let mut record = store.load(TEST_MAC).await.unwrap();
        record.value.name = Some("Sauna".to_string());
        record.version = store.save(TEST_MAC, &record).await.unwrap();

        // A second writer that read the old version must not clobber
        let stale = Versioned {
            version: 0,
            value: DeviceRecord::default(),
        };
        let err = store.save(TEST_MAC, &stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                stored: 1,
                ..
            }
        ));

        // The first writer's state is intact
        let loaded = store.load(TEST_MAC).await.unwrap();
        assert_eq!(loaded.value.name.as_deref(), Some("Sauna"));
    }

    #[tokio::test]
    async fn test_sequential_saves_bump_versions() {
        let dir = TempDir::new("versions");
        let store = JsonFileStore::new(&dir.0).unwrap();

        let mut record = store.load(TEST_MAC).await.unwrap();
        for expected in 1..=3 {
            record.version = store.save(TEST_MAC, &record).await.unwrap();
            assert_eq!(record.version, expected);
        }
    }

    #[tokio::test]
    async fn test_malformed_document_is_an_error() {
        let dir = TempDir::new("malformed");
        let store = JsonFileStore::new(&dir.0).unwrap();
        fs::write(store.path(TEST_MAC), b"not json").unwrap();

        assert!(matches!(
            store.load(TEST_MAC).await,
            Err(StoreError::Malformed(_))
        ));
    }
}
