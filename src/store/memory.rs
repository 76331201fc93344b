//! In-memory device store
//!
//! Mirrors the merge/append semantics of the production document store so
//! the runner and integration tests exercise the full pipeline without an
//! external backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    DeviceRecord, DeviceStatusUpdate, DeviceStore, EquipmentRecord, PendingCommandRecord,
    StoreError, TelemetryRecord,
};

#[derive(Debug, Default)]
struct MemoryStoreInner {
    devices: HashMap<String, DeviceRecord>,
    history: HashMap<String, Vec<TelemetryRecord>>,
    pending_commands: HashMap<String, Vec<PendingCommandRecord>>,
    equipment: HashMap<String, EquipmentRecord>,
}

/// Process-local [`DeviceStore`] implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStoreInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::write_failed("device store mutex poisoned"))
    }

    /// Snapshot of a device document
    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.devices.get(device_id).cloned())
    }

    /// Location history for a device, in append order
    pub fn location_history(&self, device_id: &str) -> Vec<TelemetryRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.history.get(device_id).cloned())
            .unwrap_or_default()
    }

    /// Pending commands recorded for a device, in record order
    pub fn pending_commands(&self, device_id: &str) -> Vec<PendingCommandRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.pending_commands.get(device_id).cloned())
            .unwrap_or_default()
    }

    /// Register an equipment record for `linked_equipment` reads
    pub fn insert_equipment(&self, record: EquipmentRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.equipment.insert(record.device_id.clone(), record);
        }
    }

    /// Number of device documents currently held
    pub fn device_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.devices.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device_status(
        &self,
        device_id: &str,
        update: DeviceStatusUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord::new(device_id))
            .merge(update);
        Ok(())
    }

    async fn append_location(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .history
            .entry(record.device_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn record_pending_command(
        &self,
        record: &PendingCommandRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .pending_commands
            .entry(record.device_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn linked_equipment(
        &self,
        device_id: &str,
    ) -> Result<Option<EquipmentRecord>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::read_failed("device store mutex poisoned"))?;
        Ok(inner.equipment.get(device_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandStatus, ConnectivityStatus, LockState, VehicleCommand};
    use chrono::Utc;
    use uuid::Uuid;

    fn fix(device_id: &str, latitude: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            latitude,
            longitude: -46.6333,
            timestamp: Utc::now(),
            speed: None,
            battery: None,
            signal: None,
            address: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_and_merges() {
        let store = MemoryStore::new();

        store
            .upsert_device_status(
                "truck-7",
                DeviceStatusUpdate {
                    connectivity: Some(ConnectivityStatus::Online),
                    battery: Some(90),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .upsert_device_status(
                "truck-7",
                DeviceStatusUpdate {
                    lock_state: Some(LockState::Locked),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let device = store.device("truck-7").unwrap();
        assert_eq!(device.connectivity, Some(ConnectivityStatus::Online));
        assert_eq!(device.battery, Some(90));
        assert_eq!(device.lock_state, Some(LockState::Locked));
        assert_eq!(store.device_count(), 1);
    }

    #[tokio::test]
    async fn test_history_appends_in_order() {
        let store = MemoryStore::new();

        store.append_location(&fix("truck-7", 1.0)).await.unwrap();
        store.append_location(&fix("truck-7", 2.0)).await.unwrap();
        store.append_location(&fix("van-2", 3.0)).await.unwrap();

        let history = store.location_history("truck-7");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].latitude, 1.0);
        assert_eq!(history[1].latitude, 2.0);
        assert_eq!(store.location_history("van-2").len(), 1);
    }

    #[tokio::test]
    async fn test_pending_commands_accumulate() {
        let store = MemoryStore::new();

        let record = PendingCommandRecord {
            device_id: "truck-7".to_string(),
            command_id: Uuid::new_v4(),
            command: VehicleCommand::Off,
            issued_at: Utc::now(),
            status: CommandStatus::Pending,
        };
        store.record_pending_command(&record).await.unwrap();
        store.record_pending_command(&record).await.unwrap();

        let pending = store.pending_commands("truck-7");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].command, VehicleCommand::Off);
    }

    #[tokio::test]
    async fn test_linked_equipment_read() {
        let store = MemoryStore::new();
        assert_eq!(store.linked_equipment("truck-7").await.unwrap(), None);

        store.insert_equipment(EquipmentRecord {
            device_id: "truck-7".to_string(),
            label: "Delivery truck 7".to_string(),
            linked: true,
        });

        let equipment = store.linked_equipment("truck-7").await.unwrap().unwrap();
        assert_eq!(equipment.label, "Delivery truck 7");
        assert!(equipment.linked);
    }
}
