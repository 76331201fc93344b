//! Command dispatch with confirmation tracking
//!
//! Publishes lock/unlock commands to a device and waits a bounded window
//! for the firmware acknowledgement. Commands that cannot be confirmed
//! are never surfaced as failures: they degrade to a parked pending
//! command the device can pick up later.

use crate::config::CommandSection;
use crate::observability::metrics;
use crate::protocol::{
    self, CommandAck, CommandRequest, CommandStatus, ValidationError, VehicleCommand,
};
use crate::store::{DeviceStatusUpdate, DeviceStore, PendingCommandRecord};
use crate::transport::{CommandChannel, PublishOutcome};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a dispatched command resolved
///
/// Both variants are success from the caller's point of view; `Pending`
/// just carries a weaker guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Device acknowledged execution inside the confirmation window
    Confirmed {
        command_id: Uuid,
        latency: Duration,
    },
    /// Parked on the retained pending topic for the device to pick up
    Pending { command_id: Uuid },
}

impl CommandOutcome {
    pub fn command_id(&self) -> Uuid {
        match self {
            CommandOutcome::Confirmed { command_id, .. } => *command_id,
            CommandOutcome::Pending { command_id } => *command_id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, CommandOutcome::Confirmed { .. })
    }
}

/// Errors surfaced by command dispatch
///
/// Delivery problems never appear here; they fold into the pending
/// outcome. Only bad input and payload encoding make dispatch fail.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid device ID")]
    InvalidDeviceId(#[from] ValidationError),
    #[error("Command payload serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// One-shot resolution handles keyed by command id
type CorrelationTable = HashMap<Uuid, oneshot::Sender<CommandAck>>;

/// Dispatches vehicle commands and correlates device acknowledgements
///
/// Each in-flight command owns an entry in the correlation table, so
/// overlapping commands to the same device resolve independently.
pub struct CommandDispatcher<C, S> {
    channel: Arc<C>,
    store: Arc<S>,
    namespace: String,
    confirm_timeout: Duration,
    inflight: Mutex<CorrelationTable>,
}

impl<C, S> CommandDispatcher<C, S>
where
    C: CommandChannel,
    S: DeviceStore,
{
    pub fn new(channel: Arc<C>, store: Arc<S>, namespace: &str, config: &CommandSection) -> Self {
        Self {
            channel,
            store,
            namespace: namespace.to_string(),
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of commands currently awaiting an acknowledgement
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// Send a lock/unlock command to a device
    ///
    /// Resolves `Confirmed` when the device acknowledges execution inside
    /// the confirmation window. A down session, a failed publish or a
    /// silent device all resolve `Pending` instead: the command is
    /// recorded in the store, parked retained on the pending topic and
    /// applied optimistically to the local device document.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: VehicleCommand,
    ) -> Result<CommandOutcome, CommandError> {
        protocol::validate_device_id(device_id)?;

        let request = CommandRequest::new(device_id, command);
        let command_id = request.id;
        info!(
            %device_id,
            command = command.as_str(),
            %command_id,
            "dispatching command"
        );

        if !self.channel.is_connected() {
            debug!(%device_id, %command_id, "session down, parking command");
            return Ok(self.park_as_pending(&request).await);
        }

        // Register before publishing so an instant acknowledgement
        // cannot slip past the listener
        let ack_rx = self.register_listener(command_id).await;

        let payload = serde_json::to_vec(&request).map_err(CommandError::Serialization)?;
        let topic = protocol::command_topic(&self.namespace, device_id);

        if let Err(e) = self.channel.publish_direct(&topic, payload, false).await {
            warn!(%device_id, %command_id, "command publish failed, parking command: {e}");
            self.forget_listener(command_id).await;
            return Ok(self.park_as_pending(&request).await);
        }
        metrics().command_sent();

        let sent_at = Instant::now();
        match tokio::time::timeout(self.confirm_timeout, ack_rx).await {
            Ok(Ok(_ack)) => {
                let latency = sent_at.elapsed();
                self.apply_confirmed(&request).await;
                metrics().command_confirmed(latency);
                info!(
                    %device_id,
                    %command_id,
                    latency_ms = latency.as_millis() as u64,
                    "command confirmed"
                );
                Ok(CommandOutcome::Confirmed {
                    command_id,
                    latency,
                })
            }
            Ok(Err(_)) => {
                // Listener entry vanished without an acknowledgement;
                // treat it like a timeout
                debug!(%device_id, %command_id, "confirmation listener dropped");
                metrics().command_timed_out();
                Ok(self.park_as_pending(&request).await)
            }
            Err(_) => {
                metrics().command_timed_out();
                warn!(
                    %device_id,
                    %command_id,
                    timeout_ms = self.confirm_timeout.as_millis() as u64,
                    "no acknowledgement inside the confirmation window, parking command"
                );
                self.forget_listener(command_id).await;
                Ok(self.park_as_pending(&request).await)
            }
        }
    }

    /// Feed a frame from the device's response topic into the
    /// correlation table
    ///
    /// Only an acknowledgement with status `executed` resolves the
    /// waiting command; anything else leaves the confirmation window
    /// open. Acknowledgements without a registered listener are dropped.
    pub async fn handle_response(&self, device_id: &str, payload: &[u8]) {
        let ack: CommandAck = match serde_json::from_slice(payload) {
            Ok(ack) => ack,
            Err(e) => {
                metrics().device_message_dropped(device_id);
                warn!(%device_id, "unparseable command response dropped: {e}");
                return;
            }
        };

        if !ack.is_executed() {
            debug!(
                %device_id,
                command_id = %ack.command_id,
                status = %ack.status,
                "non-executed acknowledgement, confirmation window stays open"
            );
            return;
        }

        let sender = { self.inflight.lock().await.remove(&ack.command_id) };
        match sender {
            Some(sender) => {
                if sender.send(ack).is_err() {
                    debug!(%device_id, "confirmation listener already gone");
                }
            }
            None => {
                debug!(
                    %device_id,
                    command_id = %ack.command_id,
                    "late acknowledgement dropped, no listener registered"
                );
            }
        }
    }

    async fn register_listener(&self, command_id: Uuid) -> oneshot::Receiver<CommandAck> {
        let (tx, rx) = oneshot::channel();
        let mut inflight = self.inflight.lock().await;
        inflight.insert(command_id, tx);
        rx
    }

    async fn forget_listener(&self, command_id: Uuid) {
        let mut inflight = self.inflight.lock().await;
        inflight.remove(&command_id);
    }

    /// Confirmed execution: the vehicle now holds the commanded state
    async fn apply_confirmed(&self, request: &CommandRequest) {
        let update = DeviceStatusUpdate {
            lock_state: Some(request.command.confirmed_lock_state()),
            last_command_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .upsert_device_status(&request.device_id, update)
            .await
        {
            warn!(
                device_id = %request.device_id,
                "lock state update failed after confirmation: {e}"
            );
        }
    }

    /// Park an unconfirmed command: store record, retained publish on
    /// the pending topic, optimistic local state
    ///
    /// Each step is best-effort on its own so one failing leg never
    /// blocks the others.
    async fn park_as_pending(&self, request: &CommandRequest) -> CommandOutcome {
        let record = PendingCommandRecord {
            device_id: request.device_id.clone(),
            command_id: request.id,
            command: request.command,
            issued_at: DateTime::from_timestamp_millis(request.timestamp).unwrap_or_else(Utc::now),
            status: CommandStatus::Pending,
        };

        if let Err(e) = self.store.record_pending_command(&record).await {
            warn!(
                device_id = %request.device_id,
                command_id = %request.id,
                "pending command store write failed: {e}"
            );
        }

        // Retained with the command-topic payload shape so the device
        // can self-serve it on its next connection
        match serde_json::to_vec(request) {
            Ok(payload) => {
                let topic = protocol::pending_topic(&self.namespace, &request.device_id);
                match self.channel.publish(&topic, payload, true).await {
                    Ok(PublishOutcome::Sent) => {
                        debug!(device_id = %request.device_id, "pending command parked on retained topic");
                    }
                    Ok(PublishOutcome::Queued) => {
                        debug!(device_id = %request.device_id, "pending command queued for session replay");
                    }
                    Err(e) => {
                        warn!(device_id = %request.device_id, "pending command publish failed: {e}");
                    }
                }
            }
            Err(e) => {
                warn!(device_id = %request.device_id, "pending command payload serialization failed: {e}");
            }
        }

        // Optimistic: show the commanded state as pending so the app
        // reflects the intent immediately
        let update = DeviceStatusUpdate {
            lock_state: Some(request.command.pending_lock_state()),
            last_command_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .upsert_device_status(&request.device_id, update)
            .await
        {
            warn!(
                device_id = %request.device_id,
                "optimistic lock state update failed: {e}"
            );
        }

        metrics().command_marked_pending();
        CommandOutcome::Pending {
            command_id: request.id,
        }
    }
}
