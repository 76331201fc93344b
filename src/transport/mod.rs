//! Transport layer for broker communication
//!
//! Owns the MQTT session and exposes the narrow publishing seam the
//! command and telemetry paths depend on.

pub mod mqtt;

/// How a publish request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered to the live broker session
    Sent,
    /// Session down; parked on the outbound queue for replay
    Queued,
}

/// Raw frame received from the broker, before topic parsing
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Publishing seam for components that talk to the broker
///
/// Covers liveness checks and the two publish flavors, nothing else.
/// Session lifecycle stays on the concrete [`mqtt::MqttLink`]; tests
/// stand in a recording double.
#[async_trait::async_trait]
pub trait CommandChannel: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether the broker session is currently established
    fn is_connected(&self) -> bool;

    /// Publish with the queue fallback: never fails just because the
    /// session is down
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<PublishOutcome, Self::Error>;

    /// Publish to the live session only, erroring when it is down
    async fn publish_direct(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error>;
}
