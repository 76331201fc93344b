//! Mock implementations for testing
//!
//! Provides a recording [`CommandChannel`] double and a recording
//! [`DeviceStore`] double so command and telemetry flows can run without
//! external dependencies.

use crate::store::{
    DeviceStatusUpdate, DeviceStore, EquipmentRecord, PendingCommandRecord, StoreError,
    TelemetryRecord,
};
use crate::transport::mqtt::MqttError;
use crate::transport::{CommandChannel, PublishOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// A publish observed by the mock channel: topic, payload, retain flag
pub type PublishedMessage = (String, Vec<u8>, bool);

/// Mock broker channel for testing
///
/// Publishes while "connected" land in `published`; publishes while
/// "disconnected" land in `queued`, mirroring the real channel's
/// queue-on-disconnect behaviour.
#[derive(Debug, Default)]
pub struct MockChannel {
    pub connected: AtomicBool,
    pub fail_publishes: AtomicBool,
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub queued: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl MockChannel {
    /// Connected channel that accepts every publish
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Channel that reports the session as down
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Connected channel whose publishes all fail
    pub fn with_publish_failure() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail_publishes: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn get_queued(&self) -> Vec<PublishedMessage> {
        self.queued.lock().await.clone()
    }

    /// Publishes observed on a specific topic
    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _, _)| t == topic)
            .cloned()
            .collect()
    }

    /// Poll until at least `count` publishes were observed
    pub async fn wait_for_publishes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.published.lock().await.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
        self.queued.lock().await.clear();
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    type Error = MqttError;

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<PublishOutcome, Self::Error> {
        if !self.is_connected() {
            let mut queued = self.queued.lock().await;
            queued.push((topic.to_string(), payload, retain));
            return Ok(PublishOutcome::Queued);
        }

        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("mock publish failure".into()));
        }

        let mut published = self.published.lock().await;
        published.push((topic.to_string(), payload, retain));
        Ok(PublishOutcome::Sent)
    }

    async fn publish_direct(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: crate::transport::mqtt::ConnectionState::Disconnected,
            });
        }

        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("mock publish failure".into()));
        }

        let mut published = self.published.lock().await;
        published.push((topic.to_string(), payload, retain));
        Ok(())
    }
}

/// Recording device store for testing
///
/// Records every call in order and can be switched into a failing mode
/// to exercise retry paths.
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub fail_writes: AtomicBool,
    pub device_updates: Arc<Mutex<Vec<(String, DeviceStatusUpdate)>>>,
    pub locations: Arc<Mutex<Vec<TelemetryRecord>>>,
    pub pending_commands: Arc<Mutex<Vec<PendingCommandRecord>>>,
    pub equipment: Arc<Mutex<HashMap<String, EquipmentRecord>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn get_device_updates(&self) -> Vec<(String, DeviceStatusUpdate)> {
        self.device_updates.lock().await.clone()
    }

    pub async fn get_locations(&self) -> Vec<TelemetryRecord> {
        self.locations.lock().await.clone()
    }

    pub async fn get_pending_commands(&self) -> Vec<PendingCommandRecord> {
        self.pending_commands.lock().await.clone()
    }

    pub async fn insert_equipment(&self, record: EquipmentRecord) {
        let mut equipment = self.equipment.lock().await;
        equipment.insert(record.device_id.clone(), record);
    }

    pub async fn clear_history(&self) {
        self.device_updates.lock().await.clear();
        self.locations.lock().await.clear();
        self.pending_commands.lock().await.clear();
    }
}

#[async_trait]
impl DeviceStore for RecordingStore {
    async fn upsert_device_status(
        &self,
        device_id: &str,
        update: DeviceStatusUpdate,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write_failed("mock store failure"));
        }

        let mut updates = self.device_updates.lock().await;
        updates.push((device_id.to_string(), update));
        Ok(())
    }

    async fn append_location(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write_failed("mock store failure"));
        }

        let mut locations = self.locations.lock().await;
        locations.push(record.clone());
        Ok(())
    }

    async fn record_pending_command(
        &self,
        record: &PendingCommandRecord,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write_failed("mock store failure"));
        }

        let mut pending = self.pending_commands.lock().await;
        pending.push(record.clone());
        Ok(())
    }

    async fn linked_equipment(
        &self,
        device_id: &str,
    ) -> Result<Option<EquipmentRecord>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::read_failed("mock store failure"));
        }

        let equipment = self.equipment.lock().await;
        Ok(equipment.get(device_id).cloned())
    }
}
