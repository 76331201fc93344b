//! Resilient MQTT session for the tracking backend
//!
//! The module separates pure decision logic from I/O:
//!
//! - [`connection`] - Session states, reconnection policy, broker options
//! - [`outbound`] - FIFO queue for messages published while offline
//! - [`client`] - The session owner and its supervisor task
//!
//! # Usage
//!
//! ```rust,no_run
//! use tracklink::config::TrackerConfig;
//! use tracklink::transport::mqtt::MqttLink;
//!
//! # tokio_test::block_on(async {
//! let config = TrackerConfig::default();
//! let link = MqttLink::new(config.mqtt, &config.reconnect)?;
//! link.connect().await?;
//!
//! // Queued transparently whenever the session is down
//! link.publish("devices/tk-1/command", b"{}".to_vec(), false).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod outbound;

pub use client::MqttLink;
pub use connection::{
    ConnectionState, EventRoute, MqttError, ReconnectDecision, ReconnectPolicy, route_event,
};
pub use outbound::{OutboundMessage, OutboundQueue};
