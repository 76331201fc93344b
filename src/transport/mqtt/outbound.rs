//! Outbound queue for messages published while the session is down
//!
//! Messages are parked here in arrival order and replayed once the
//! broker confirms a new session. The queue is unbounded: nothing is
//! dropped while the session is Disconnected or Reconnecting.

use rumqttc::v5::mqttbytes::QoS;
use std::collections::VecDeque;

/// A message waiting for a live session
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    /// Build a message with the delivery settings every component uses
    pub fn new<S: Into<String>>(topic: S, payload: Vec<u8>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos: QoS::AtLeastOnce,
            retain,
        }
    }
}

/// FIFO queue of messages awaiting a live session
///
/// `enqueue` never rejects. The supervisor is the only consumer: it
/// pops one message at a time during the replay, so a failed publish
/// leaves the remainder intact for the next session.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a message at the tail
    pub fn enqueue(&mut self, message: OutboundMessage) {
        self.queue.push_back(message);
    }

    /// Take the oldest message
    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
