//! Telemetry ingestion and batched persistence
//!
//! Parses inbound location and status frames and writes them to the
//! device store, coalescing rapid location fixes per device.

pub mod batcher;

pub use batcher::TelemetryBatcher;
