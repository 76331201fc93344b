//! Pure session-state and policy logic for the MQTT link
//!
//! Everything here is testable without a broker: the session state
//! vocabulary, the exponential backoff policy, broker option
//! construction, and the classifier that turns raw transport events
//! into routing decisions.

use crate::config::{MqttSection, ReconnectSection};
use crate::protocol::{AppPresence, SYSTEM_STATUS_TOPIC};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{Event, MqttOptions, mqttbytes::QoS};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Session state for the broker link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No session exists and none is being attempted
    Disconnected,
    /// Session establishment in progress
    Connecting,
    /// Broker session live, publishes go straight to the transport
    Connected,
    /// Waiting out the backoff delay before the given attempt
    Reconnecting(u32),
    /// Attempt ceiling hit; only `force_reconnect()` leaves this state
    Failed(String),
}

impl ConnectionState {
    /// Whether publishes can go straight to the transport
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Short label used in logs and the metrics snapshot
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

/// Exponential backoff policy for session recovery
///
/// Pure: callers own the attempt counter, the policy only computes
/// delays and decides whether another attempt is allowed.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied to the exponential growth
    pub max_delay: Duration,
    /// Attempts before the session is declared failed
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectSection) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts,
        }
    }

    /// Backoff delay given how many attempts already failed:
    /// `min(base * 2^prior_failures, max)`, saturating far past the
    /// point where the cap takes over.
    pub fn delay_for(&self, prior_failures: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(prior_failures).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Decide whether to schedule another reconnection attempt
    pub fn evaluate(&self, prior_failures: u32, shutdown_requested: bool) -> ReconnectDecision {
        if shutdown_requested {
            return ReconnectDecision::AbortShutdownRequested;
        }

        if prior_failures >= self.max_attempts {
            return ReconnectDecision::AbortAttemptsExhausted;
        }

        ReconnectDecision::Proceed {
            attempt: prior_failures + 1,
            delay: self.delay_for(prior_failures),
        }
    }
}

/// Outcome of a reconnection policy check
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectDecision {
    /// Schedule attempt `attempt` after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Shutdown in progress, stop retrying
    AbortShutdownRequested,
    /// Attempt ceiling reached, the session is failed
    AbortAttemptsExhausted,
}

/// Errors surfaced by the MQTT transport layer
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Build broker options from config
///
/// Every call generates a fresh wire client id (`<prefix>-<unix ms>`) so
/// a reconnecting session never collides with its half-closed
/// predecessor on the broker. `identity` is the stable name carried in
/// the last-will presence payload.
pub fn configure_mqtt_options(
    identity: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let wire_client_id = format!(
        "{}-{}",
        config.client_id_prefix,
        chrono::Utc::now().timestamp_millis()
    );
    let mut mqtt_options = MqttOptions::new(wire_client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = config
        .resolve_credentials()
        .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?
    {
        mqtt_options.set_credentials(&username, &password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keepalive_secs));

    // Public-broker default is often 10KB; a queue replay after a long
    // outage can carry larger frames
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    // Broker publishes the offline presence if the session dies without
    // a clean disconnect
    let lwt_payload = serde_json::to_string(&AppPresence::offline(identity))
        .map_err(MqttError::Serialization)?;
    let lwt = LastWill::new(
        SYSTEM_STATUS_TOPIC,
        lwt_payload,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

/// Routing classification for raw broker events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker acknowledged the session
    ConnAck,
    /// Frame arrived on a subscribed topic
    Inbound {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker closed the session
    Closed,
    /// Subscription confirmed
    SubAck(u16),
    /// Keep-alive and other protocol chatter
    Infrastructure(String),
    /// Locally generated outgoing activity
    Outgoing,
}

/// Classify a raw event into a routing decision (pure function)
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => {
            use rumqttc::v5::mqttbytes::v5::Packet;
            match incoming {
                Packet::ConnAck(_) => EventRoute::ConnAck,
                Packet::Publish(publish) => EventRoute::Inbound {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Closed,
                Packet::SubAck(suback) => EventRoute::SubAck(suback.pkid),
                other => EventRoute::Infrastructure(format!("{other:?}")),
            }
        }
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}
