use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use crate::store::{DeviceRecord, DeviceStore, StoreError, Versioned};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::SystemTime;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build a `Measurement` with all optional fields set to `None`.
///
/// Tests can override just the fields they care about.
pub fn base_measurement(timestamp: SystemTime) -> Measurement {
    Measurement {
        timestamp,
        ..Measurement::default()
    }
}

/// In-memory device store with the same optimistic versioning contract as
/// the file-backed one.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<MacAddress, Versioned<DeviceRecord>>>,
}

impl MemoryStore {
    /// Simulate a concurrent writer by bumping the stored version.
    pub fn bump_version(&self, address: MacAddress) {
        let mut records = self.records.lock().unwrap();
        records
            .entry(address)
            .or_insert_with(|| Versioned {
                version: 0,
                value: DeviceRecord::default(),
            })
            .version += 1;
    }
}

impl DeviceStore for MemoryStore {
    fn load(
        &self,
        address: MacAddress,
    ) -> Pin<Box<dyn Future<Output = Result<Versioned<DeviceRecord>, StoreError>> + Send + '_>>
    {
        let record = self
            .records
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| Versioned {
                version: 0,
                value: DeviceRecord::default(),
            });
        Box::pin(async move { Ok(record) })
    }

    fn save<'a>(
        &'a self,
        address: MacAddress,
        record: &'a Versioned<DeviceRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + 'a>> {
        let result = {
            let mut records = self.records.lock().unwrap();
            let stored = records.get(&address).map(|r| r.version).unwrap_or(0);
            if stored != record.version {
                Err(StoreError::Conflict {
                    address,
                    expected: record.version,
                    stored,
                })
            } else {
                let next = Versioned {
                    version: record.version + 1,
                    value: record.value.clone(),
                };
                records.insert(address, next.clone());
                Ok(next.version)
            }
        };
        Box::pin(async move { result })
    }
}
