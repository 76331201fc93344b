//! Wire message types for the tracker protocol
//!
//! This module defines the JSON payloads exchanged with tracker devices:
//! outbound commands, device acknowledgements, telemetry reports and the
//! retained application presence message.
//!
//! Device firmware is lenient about numeric types and frequently sends
//! numbers as strings, so telemetry deserialization coerces both forms.
//! Required fields that cannot be coerced fail the whole payload; optional
//! fields degrade to `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Vehicle command verbs understood by tracker firmware
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VehicleCommand {
    /// Enable the vehicle (unlock)
    On,
    /// Disable the vehicle (lock)
    Off,
}

impl VehicleCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleCommand::On => "ON",
            VehicleCommand::Off => "OFF",
        }
    }

    /// Lock state the vehicle reaches once this command executes
    pub fn confirmed_lock_state(&self) -> LockState {
        match self {
            VehicleCommand::On => LockState::Unlocked,
            VehicleCommand::Off => LockState::Locked,
        }
    }

    /// Lock state to show while this command is parked unconfirmed
    pub fn pending_lock_state(&self) -> LockState {
        match self {
            VehicleCommand::On => LockState::PendingUnlock,
            VehicleCommand::Off => LockState::PendingLock,
        }
    }
}

/// Command message published to `<namespace>/<deviceId>/command`
///
/// # Examples
/// ```
/// use tracklink::protocol::{CommandRequest, VehicleCommand};
///
/// let request = CommandRequest::new("truck-7", VehicleCommand::On);
/// assert_eq!(request.device_id, "truck-7");
/// assert!(request.timestamp > 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    /// Command verb
    pub command: VehicleCommand,
    /// UUID v4 correlation identifier echoed back by the device
    pub id: Uuid,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Target device
    pub device_id: String,
}

impl CommandRequest {
    pub fn new<S: Into<String>>(device_id: S, command: VehicleCommand) -> Self {
        Self {
            command,
            id: Uuid::new_v4(),
            timestamp: Utc::now().timestamp_millis(),
            device_id: device_id.into(),
        }
    }
}

/// Device acknowledgement published to `<namespace>/<deviceId>/response`
///
/// The `status` field is free-form on the wire; only `"executed"`
/// confirms the command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandAck {
    /// Correlation identifier from the original command
    pub command_id: Uuid,
    /// Execution status reported by the device
    pub status: String,
}

impl CommandAck {
    /// Whether this acknowledgement confirms execution
    pub fn is_executed(&self) -> bool {
        self.status == "executed"
    }
}

/// Lock state of a vehicle as known by the app
///
/// The pending variants are optimistic states shown while a command sits
/// unconfirmed on the retained pending topic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
    PendingLock,
    PendingUnlock,
}

impl LockState {
    /// Whether this state is awaiting device confirmation
    pub fn is_pending(&self) -> bool {
        matches!(self, LockState::PendingLock | LockState::PendingUnlock)
    }
}

/// Lifecycle of a dispatched command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Handed to the transport
    Sent,
    /// Waiting for the device acknowledgement
    AwaitingAck,
    /// Device reported the command as executed
    Confirmed,
    /// Confirmation window elapsed without an executed acknowledgement
    TimedOut,
    /// Parked on the retained pending topic for the device to pick up
    Pending,
}

/// GPS position report published to `<namespace>/<deviceId>/location`
///
/// Field names follow the firmware wire format, which predates this
/// service and uses Portuguese names for the optional readings.
///
/// # Examples
/// ```
/// use tracklink::protocol::LocationReport;
///
/// let report: LocationReport =
///     serde_json::from_str(r#"{"latitude": "-23.55", "longitude": -46.63}"#).unwrap();
/// assert!((report.latitude - -23.55).abs() < 1e-9);
/// assert!(report.speed.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationReport {
    #[serde(deserialize_with = "de_f64_coerced")]
    pub latitude: f64,
    #[serde(deserialize_with = "de_f64_coerced")]
    pub longitude: f64,
    /// Unix timestamp in milliseconds, when the firmware provides one
    #[serde(
        default,
        deserialize_with = "de_opt_i64_coerced",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    /// Speed in km/h
    #[serde(
        default,
        rename = "velocidade",
        deserialize_with = "de_opt_f64_coerced",
        skip_serializing_if = "Option::is_none"
    )]
    pub speed: Option<f64>,
    /// Battery percentage
    #[serde(
        default,
        rename = "bateria",
        deserialize_with = "de_opt_u8_coerced",
        skip_serializing_if = "Option::is_none"
    )]
    pub battery: Option<u8>,
    /// Signal strength in dBm
    #[serde(
        default,
        rename = "sinal",
        deserialize_with = "de_opt_i32_coerced",
        skip_serializing_if = "Option::is_none"
    )]
    pub signal: Option<i32>,
    /// Reverse-geocoded address, when the firmware provides one
    #[serde(
        default,
        rename = "endereco",
        skip_serializing_if = "Option::is_none"
    )]
    pub address: Option<String>,
}

/// Device connectivity levels reported on the status topic
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    #[default]
    Online,
    Offline,
    Error,
}

/// Connectivity report published to `<namespace>/<deviceId>/status`
///
/// A payload without a `status` field counts as online; the publish
/// itself proves the device is reachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    #[serde(default)]
    pub status: ConnectivityStatus,
    /// Battery percentage
    #[serde(
        default,
        rename = "bateria",
        deserialize_with = "de_opt_u8_coerced",
        skip_serializing_if = "Option::is_none"
    )]
    pub battery: Option<u8>,
    /// Signal strength in dBm
    #[serde(
        default,
        rename = "sinal",
        deserialize_with = "de_opt_i32_coerced",
        skip_serializing_if = "Option::is_none"
    )]
    pub signal: Option<i32>,
}

/// Application presence levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Application presence message (retained)
///
/// Published to `system/status` with the retain flag so devices learn
/// whether the app is reachable. The offline form doubles as the
/// broker's last-will payload.
///
/// # Examples
/// ```
/// use tracklink::protocol::{AppPresence, PresenceStatus};
///
/// let presence = AppPresence::online("tracker-app-17");
/// assert_eq!(presence.status, PresenceStatus::Online);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPresence {
    pub client_id: String,
    pub status: PresenceStatus,
    /// RFC 3339 format with Z suffix
    pub timestamp: DateTime<Utc>,
}

impl AppPresence {
    pub fn online<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            status: PresenceStatus::Online,
            timestamp: Utc::now(),
        }
    }

    pub fn offline<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            status: PresenceStatus::Offline,
            timestamp: Utc::now(),
        }
    }
}

// Numeric coercion helpers. Firmware sends numbers both bare and quoted.

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_f64_coerced<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    coerce_f64(&value)
        .ok_or_else(|| serde::de::Error::custom("expected a number or numeric string"))
}

fn de_opt_f64_coerced<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_f64))
}

fn de_opt_i64_coerced<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_i64))
}

fn de_opt_u8_coerced<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(coerce_i64)
        .and_then(|n| u8::try_from(n).ok()))
}

fn de_opt_i32_coerced<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(coerce_i64)
        .and_then(|n| i32::try_from(n).ok()))
}
