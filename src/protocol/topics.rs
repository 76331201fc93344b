//! Topic scheme and device ID validation for the tracker protocol
//!
//! All device traffic lives under `<namespace>/<deviceId>/<messageType>`.
//! This module builds outbound topics, expands subscription filters and
//! parses inbound topics back into device ID and message kind.

use thiserror::Error;

/// Retained application presence topic, outside the device namespace.
pub const SYSTEM_STATUS_TOPIC: &str = "system/status";

/// Message kinds carried in the last topic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// App to device command (`command`)
    Command,
    /// Device acknowledgement of a command (`response`)
    CommandResponse,
    /// Retained command parked for an offline device (`pending`)
    Pending,
    /// GPS position report (`location`)
    Location,
    /// Device connectivity report (`status`)
    Status,
}

impl MessageKind {
    /// Canonical topic segment for this kind
    pub fn segment(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::CommandResponse => "response",
            MessageKind::Pending => "pending",
            MessageKind::Location => "location",
            MessageKind::Status => "status",
        }
    }
}

/// Parse a topic segment into a message kind
///
/// Accepts the canonical segment names plus the legacy firmware names
/// still emitted by older tracker units.
pub fn parse_message_kind(segment: &str) -> Option<MessageKind> {
    match segment {
        "command" => Some(MessageKind::Command),
        "response" => Some(MessageKind::CommandResponse),
        "pending" => Some(MessageKind::Pending),
        "location" => Some(MessageKind::Location),
        "status" => Some(MessageKind::Status),
        // Legacy firmware segments
        "localizacao" => Some(MessageKind::Location),
        "comando" => Some(MessageKind::CommandResponse),
        _ => None,
    }
}

/// A successfully parsed inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic<'a> {
    /// Device-scoped message under the configured namespace
    Device {
        device_id: &'a str,
        kind: MessageKind,
    },
    /// Application presence on the shared system topic
    SystemStatus,
}

/// Build the topic for a device-scoped message
pub fn device_topic(namespace: &str, device_id: &str, kind: MessageKind) -> String {
    format!("{namespace}/{device_id}/{}", kind.segment())
}

/// Topic for publishing commands to a device
pub fn command_topic(namespace: &str, device_id: &str) -> String {
    device_topic(namespace, device_id, MessageKind::Command)
}

/// Retained topic holding the latest unconfirmed command for a device
pub fn pending_topic(namespace: &str, device_id: &str) -> String {
    device_topic(namespace, device_id, MessageKind::Pending)
}

/// Subscription filters covering all inbound traffic
///
/// Single-level wildcards over the device namespace plus the shared
/// presence topic. The legacy firmware segments get their own filters;
/// not-yet-reflashed trackers publish on those and never on the
/// canonical names.
pub fn subscription_filters(namespace: &str) -> [String; 6] {
    [
        format!("{namespace}/+/location"),
        format!("{namespace}/+/status"),
        format!("{namespace}/+/response"),
        format!("{namespace}/+/localizacao"),
        format!("{namespace}/+/comando"),
        SYSTEM_STATUS_TOPIC.to_string(),
    ]
}

/// Parse an inbound topic against the configured namespace
///
/// Returns `None` for topics outside the scheme so callers can drop
/// them without treating that as an error.
pub fn parse_topic<'a>(namespace: &str, topic: &'a str) -> Option<ParsedTopic<'a>> {
    if topic == SYSTEM_STATUS_TOPIC {
        return Some(ParsedTopic::SystemStatus);
    }

    let rest = topic.strip_prefix(namespace)?.strip_prefix('/')?;
    let (device_id, kind_segment) = rest.split_once('/')?;

    // Exactly three segments: namespace, device ID, message kind
    if kind_segment.contains('/') {
        return None;
    }

    if validate_device_id(device_id).is_err() {
        return None;
    }

    let kind = parse_message_kind(kind_segment)?;
    Some(ParsedTopic::Device { device_id, kind })
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for the topic scheme
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}
