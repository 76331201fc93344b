//! Observability system for the tracker service
//!
//! Structured logging and metrics collection for the MQTT link, command
//! dispatch and telemetry batching.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, mqtt_span, service_span, telemetry_span};
