//! External device store contract
//!
//! The tracker service persists telemetry and command state through an
//! opaque document interface. Real backends live outside this crate and
//! implement [`DeviceStore`]; [`memory::MemoryStore`] provides the same
//! merge/append semantics in process for the runner and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    CommandStatus, ConnectivityStatus, LocationReport, LockState, VehicleCommand,
};

pub mod memory;

pub use memory::MemoryStore;

/// Store errors surfaced to callers
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store write failed: {message}")]
    WriteFailed { message: String },

    #[error("Store read failed: {message}")]
    ReadFailed { message: String },
}

impl StoreError {
    pub fn write_failed<S: Into<String>>(message: S) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    pub fn read_failed<S: Into<String>>(message: S) -> Self {
        Self::ReadFailed {
            message: message.into(),
        }
    }
}

/// A parsed, timestamped GPS fix ready for persistence
///
/// Readings without a firmware timestamp are stamped with the parse time,
/// so every persisted record carries one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub speed: Option<f64>,
    pub battery: Option<u8>,
    pub signal: Option<i32>,
    pub address: Option<String>,
}

impl TelemetryRecord {
    /// Build a record from a wire report, stamping "now" when the
    /// firmware omitted the timestamp
    pub fn from_report<S: Into<String>>(device_id: S, report: LocationReport) -> Self {
        let timestamp = report
            .timestamp
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Self {
            device_id: device_id.into(),
            latitude: report.latitude,
            longitude: report.longitude,
            timestamp,
            speed: report.speed,
            battery: report.battery,
            signal: report.signal,
            address: report.address,
        }
    }
}

/// Partial update of a device document
///
/// `None` fields are left untouched by the merge, so callers only name
/// what they know.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeviceStatusUpdate {
    pub connectivity: Option<ConnectivityStatus>,
    pub last_seen: Option<DateTime<Utc>>,
    pub battery: Option<u8>,
    pub signal: Option<i32>,
    pub lock_state: Option<LockState>,
    pub last_location: Option<TelemetryRecord>,
    pub last_command_at: Option<DateTime<Utc>>,
}

/// The device document as persisted
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub connectivity: Option<ConnectivityStatus>,
    pub last_seen: Option<DateTime<Utc>>,
    pub battery: Option<u8>,
    pub signal: Option<i32>,
    pub lock_state: Option<LockState>,
    pub last_location: Option<TelemetryRecord>,
    pub last_command_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Merge an update into this record, leaving absent fields untouched
    pub fn merge(&mut self, update: DeviceStatusUpdate) {
        if let Some(connectivity) = update.connectivity {
            self.connectivity = Some(connectivity);
        }
        if let Some(last_seen) = update.last_seen {
            self.last_seen = Some(last_seen);
        }
        if let Some(battery) = update.battery {
            self.battery = Some(battery);
        }
        if let Some(signal) = update.signal {
            self.signal = Some(signal);
        }
        if let Some(lock_state) = update.lock_state {
            self.lock_state = Some(lock_state);
        }
        if let Some(last_location) = update.last_location {
            self.last_location = Some(last_location);
        }
        if let Some(last_command_at) = update.last_command_at {
            self.last_command_at = Some(last_command_at);
        }
    }
}

/// A command parked for an offline or unresponsive device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingCommandRecord {
    pub device_id: String,
    pub command_id: Uuid,
    pub command: VehicleCommand,
    pub issued_at: DateTime<Utc>,
    pub status: CommandStatus,
}

/// Equipment linked to a tracker unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquipmentRecord {
    pub device_id: String,
    pub label: String,
    pub linked: bool,
}

/// Document interface consumed by the tracker service
///
/// Semantics the service relies on:
/// - `upsert_device_status` merges, it never clears fields;
/// - `append_location` is append-only history, ordering per device follows
///   call order;
/// - `record_pending_command` keeps every parked command per device.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Merge a partial update into the device document
    async fn upsert_device_status(
        &self,
        device_id: &str,
        update: DeviceStatusUpdate,
    ) -> Result<(), StoreError>;

    /// Append a fix to the device's location history
    async fn append_location(&self, record: &TelemetryRecord) -> Result<(), StoreError>;

    /// Record a command parked for later execution
    async fn record_pending_command(&self, record: &PendingCommandRecord)
        -> Result<(), StoreError>;

    /// Read the equipment record linked to a device, if any
    async fn linked_equipment(&self, device_id: &str)
        -> Result<Option<EquipmentRecord>, StoreError>;
}
