//! Tracklink - MQTT command and telemetry core for fleet device tracking
//!
//! An embeddable client core that keeps a single broker session alive for a
//! tracking application, with:
//! - Wire message types for commands, acknowledgements, fixes and presence
//! - MQTT transport with supervised reconnection and offline queueing
//! - Confirm-or-pending command dispatch with response correlation
//! - Telemetry batching with per-device coalescing
//! - A service facade wiring it all together behind a storage trait
//!
//! # Quick Start
//!
//! ```rust
//! use tracklink::protocol::{CommandRequest, LocationReport, VehicleCommand};
//!
//! // The payload published to devices/<deviceId>/command
//! let request = CommandRequest::new("tk-4821", VehicleCommand::On);
//! let wire = serde_json::to_string(&request).unwrap();
//! assert!(wire.contains("\"command\":\"ON\""));
//!
//! // A fix exactly as the legacy firmware reports it
//! let report: LocationReport = serde_json::from_str(
//!     r#"{"latitude": "-23.5505", "longitude": "-46.6333", "velocidade": 42, "bateria": "87"}"#,
//! )
//! .unwrap();
//! assert_eq!(report.battery, Some(87));
//! assert_eq!(report.speed, Some(42.0));
//! ```
//!
//! For a full session, build a [`TrackerService`] over a [`DeviceStore`]
//! implementation and call [`TrackerService::start`].

pub mod commands;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod transport;

// Re-export the embedding surface
pub use commands::{CommandDispatcher, CommandError, CommandOutcome};
pub use config::*;
pub use error::{ServiceError, ServiceResult};
pub use protocol::*;
pub use service::{ServiceStats, TrackerService};
pub use store::{
    DeviceRecord, DeviceStatusUpdate, DeviceStore, EquipmentRecord, MemoryStore,
    PendingCommandRecord, StoreError, TelemetryRecord,
};
pub use telemetry::TelemetryBatcher;
pub use transport::mqtt::{ConnectionState, MqttLink};
pub use transport::{CommandChannel, PublishOutcome};
