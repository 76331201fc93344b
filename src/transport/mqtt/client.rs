//! Broker session ownership and I/O for the MQTT link
//!
//! The impure half of the transport: owns the rumqttc client, runs the
//! supervisor task that polls the event loop and recovers the session
//! with backoff, and offers the publish entry point every other
//! component goes through.

use super::connection::{
    ConnectionState, EventRoute, MqttError, ReconnectDecision, ReconnectPolicy,
    configure_mqtt_options, route_event,
};
use super::outbound::{OutboundMessage, OutboundQueue};
use crate::config::{MqttSection, ReconnectSection};
use crate::observability::metrics;
use crate::protocol::{self, AppPresence, SYSTEM_STATUS_TOPIC};
use crate::transport::{CommandChannel, InboundMessage, PublishOutcome};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{AsyncClient, EventLoop, mqttbytes::QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resilient owner of the single broker session
///
/// One instance per process. Components publish through it; while the
/// session is down their messages are parked on the outbound queue and
/// replayed in FIFO order once the broker confirms a new session.
pub struct MqttLink {
    client_id: String,
    namespace: String,
    config: MqttSection,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<Arc<Mutex<EventLoop>>>>,
    supervisor_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    force_tx: watch::Sender<u64>,
    outbound: Arc<Mutex<OutboundQueue>>,
    inbound_tx: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    reconnect_attempts: Arc<AtomicU32>,
}

impl MqttLink {
    pub fn new(config: MqttSection, reconnect: &ReconnectSection) -> Result<Self, MqttError> {
        let client_id = format!(
            "{}-{}",
            config.client_id_prefix,
            chrono::Utc::now().timestamp_millis()
        );
        let mqtt_options = configure_mqtt_options(&client_id, &config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (force_tx, _) = watch::channel(0u64);

        Ok(Self {
            namespace: config.namespace.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            policy: ReconnectPolicy::from_config(reconnect),
            client_id,
            config,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(Arc::new(Mutex::new(event_loop)))),
            supervisor_handle: std::sync::Mutex::new(None),
            state_tx,
            state_rx,
            shutdown_tx,
            force_tx,
            outbound: Arc::new(Mutex::new(OutboundQueue::new())),
            inbound_tx: Arc::new(Mutex::new(None)),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Stable identity carried in presence payloads
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current session state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Whether the broker session is currently established
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to session state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of messages parked on the outbound queue
    pub async fn queue_size(&self) -> usize {
        self.outbound.lock().await.len()
    }

    /// Reconnection attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Register the consumer for inbound frames
    pub async fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut guard = self.inbound_tx.lock().await;
        *guard = Some(sender);
    }

    /// Establish the broker session
    ///
    /// Spawns the supervisor task and suspends until the broker confirms
    /// the session or the connect timeout elapses. The supervisor keeps
    /// recovering the session in the background after this returns, so a
    /// timeout here does not stop the retry cycle.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| MqttError::ConnectionFailed("broker session already started".into()))?;

        let supervisor = Supervisor {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            policy: self.policy.clone(),
            filters: protocol::subscription_filters(&self.namespace),
            client: Arc::clone(&self.client),
            outbound: Arc::clone(&self.outbound),
            inbound_tx: Arc::clone(&self.inbound_tx),
            state_tx: self.state_tx.clone(),
            attempts: Arc::clone(&self.reconnect_attempts),
        };

        set_state(&self.state_tx, ConnectionState::Connecting);
        metrics().mqtt_connection_attempt();

        let shutdown_rx = self.shutdown_tx.subscribe();
        let force_rx = self.force_tx.subscribe();
        let state_rx = self.state_tx.subscribe();

        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx, force_rx));
        if let Ok(mut guard) = self.supervisor_handle.lock() {
            *guard = Some(handle);
        }

        match Self::wait_for_session(state_rx, self.connect_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                metrics().mqtt_connection_failed();
                Err(e)
            }
        }
    }

    /// Wait until the supervisor reports the session is up
    async fn wait_for_session(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed("state channel closed".into()));
                }
                match &*state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed(reason) => {
                        return Err(MqttError::ConnectionFailed(reason.clone().into()));
                    }
                    ConnectionState::Disconnected => {
                        return Err(MqttError::ConnectionFailed(
                            "session closed before it was established".into(),
                        ));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::ConnectionFailed(
                "no session confirmation before the connect timeout".into(),
            )),
        }
    }

    /// Publish entry point used by every other component
    ///
    /// A live session publishes straight to the transport. Otherwise the
    /// message is parked on the outbound queue and the call reports
    /// [`PublishOutcome::Queued`] instead of failing.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<PublishOutcome, MqttError> {
        if !self.is_connected() {
            let mut queue = self.outbound.lock().await;
            queue.enqueue(OutboundMessage::new(topic, payload, retain));
            metrics().mqtt_message_queued();
            debug!(target: "mqtt_link", %topic, queued = queue.len(), "session down, message queued");
            return Ok(PublishOutcome::Queued);
        }

        self.publish_direct(topic, payload, retain).await?;
        Ok(PublishOutcome::Sent)
    }

    /// Publish without the queue fallback
    ///
    /// Errors when the session is down or the transport rejects the
    /// frame. Callers that need delivery-or-fallback semantics branch on
    /// the error themselves.
    pub async fn publish_direct(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(MqttError::NotConnected { state });
        }

        let client = self.client.lock().await;
        match client
            .publish_with_properties(
                topic,
                QoS::AtLeastOnce,
                retain,
                payload,
                PublishProperties::default(),
            )
            .await
        {
            Ok(()) => {
                metrics().mqtt_message_published();
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)))
            }
        }
    }

    /// Publish the online presence on the broadcast topic (retained)
    pub async fn publish_presence_online(&self) -> Result<(), MqttError> {
        self.publish_presence(&AppPresence::online(self.client_id.as_str()))
            .await
    }

    async fn publish_presence_offline(&self) -> Result<(), MqttError> {
        self.publish_presence(&AppPresence::offline(self.client_id.as_str()))
            .await
    }

    async fn publish_presence(&self, presence: &AppPresence) -> Result<(), MqttError> {
        let payload = serde_json::to_vec(presence).map_err(MqttError::Serialization)?;
        self.publish_direct(SYSTEM_STATUS_TOPIC, payload, true).await
    }

    /// Reset retry state and rebuild the session unconditionally
    ///
    /// The only way out of the Failed state; also usable from a live
    /// session to cycle the connection.
    pub fn force_reconnect(&self) -> Result<(), MqttError> {
        let running = self
            .supervisor_handle
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        if !running {
            return Err(MqttError::ConnectionFailed(
                "broker session was never started".into(),
            ));
        }

        info!("force reconnect requested");
        metrics().force_reconnect_requested();
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.force_tx.send_modify(|n| *n = n.wrapping_add(1));
        Ok(())
    }

    /// Tear the session down
    ///
    /// Idempotent. Publishes the offline presence best-effort, stops the
    /// supervisor (cancelling any scheduled reconnect), and closes the
    /// transport.
    pub async fn disconnect(&self) {
        if self.is_connected() {
            if let Err(e) = self.publish_presence_offline().await {
                debug!("offline presence publish failed during disconnect: {e}");
            }
        }

        let _ = self.shutdown_tx.send(true);

        {
            let client = self.client.lock().await;
            if let Err(e) = client.disconnect().await {
                debug!("broker disconnect request failed: {e}");
            }
        }

        set_state(&self.state_tx, ConnectionState::Disconnected);
        metrics().mqtt_connection_lost();

        let handle = self
            .supervisor_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("broker supervisor stopped cleanly"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("broker supervisor ended with error: {e}");
                }
                Err(_) => {
                    warn!("broker supervisor did not stop in time, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        info!("broker session closed");
    }
}

#[async_trait]
impl CommandChannel for MqttLink {
    type Error = MqttError;

    fn is_connected(&self) -> bool {
        MqttLink::is_connected(self)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<PublishOutcome, Self::Error> {
        MqttLink::publish(self, topic, payload, retain).await
    }

    async fn publish_direct(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttLink::publish_direct(self, topic, payload, retain).await
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        // Graceful teardown happens in disconnect(); this only makes
        // sure the background task stops
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut guard) = self.supervisor_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Publish a state transition to observers and the metrics gauge
fn set_state(state_tx: &watch::Sender<ConnectionState>, state: ConnectionState) {
    metrics().set_session_state(state.label());
    debug!(target: "mqtt_link", state = state.label(), "session state changed");
    let _ = state_tx.send(state);
}

/// Everything the supervisor task needs, bundled so the handlers stay
/// free of argument sprawl
struct Supervisor {
    client_id: String,
    config: MqttSection,
    policy: ReconnectPolicy,
    filters: [String; 6],
    client: Arc<Mutex<AsyncClient>>,
    outbound: Arc<Mutex<OutboundQueue>>,
    inbound_tx: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
}

/// What the supervisor loop does after handling an event
enum LoopControl {
    /// Keep polling
    Continue,
    /// Session failed; wait for force_reconnect or shutdown
    Park,
    /// Stop the task
    Stop,
}

/// Outcome of an interruptible backoff sleep
enum SleepOutcome {
    Completed,
    ShutdownRequested,
    ForceReconnect,
}

impl Supervisor {
    async fn run(
        self,
        event_loop: Arc<Mutex<EventLoop>>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut force_rx: watch::Receiver<u64>,
    ) {
        info!(client_id = %self.client_id, "broker supervisor started");
        let mut current_event_loop = event_loop;
        let mut parked = false;

        loop {
            if parked {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = force_rx.changed() => {
                        info!("force reconnect from failed state");
                        self.restart_session(&mut current_event_loop).await;
                        parked = false;
                    }
                }
                continue;
            }

            tokio::select! {
                // Shutdown outranks everything else
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown signal received, stopping broker supervisor");
                        break;
                    }
                }

                _ = force_rx.changed() => {
                    info!("force reconnect requested, rebuilding broker session");
                    self.restart_session(&mut current_event_loop).await;
                }

                event_result = async {
                    let mut event_loop_guard = current_event_loop.lock().await;
                    event_loop_guard.poll().await
                } => {
                    let control = match event_result {
                        Ok(event) => {
                            self.handle_route(
                                route_event(&event),
                                shutdown_rx.clone(),
                                force_rx.clone(),
                                &mut current_event_loop,
                            )
                            .await
                        }
                        Err(e) => {
                            self.handle_poll_error(
                                e,
                                shutdown_rx.clone(),
                                force_rx.clone(),
                                &mut current_event_loop,
                            )
                            .await
                        }
                    };
                    match control {
                        LoopControl::Continue => {}
                        LoopControl::Park => parked = true,
                        LoopControl::Stop => break,
                    }
                }
            }
        }
        info!(client_id = %self.client_id, "broker supervisor stopped");
    }

    async fn handle_route(
        &self,
        route: EventRoute,
        shutdown_rx: watch::Receiver<bool>,
        force_rx: watch::Receiver<u64>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> LoopControl {
        match route {
            EventRoute::ConnAck => {
                self.on_session_established().await;
                LoopControl::Continue
            }
            EventRoute::Inbound {
                topic,
                payload,
                retain,
            } => {
                self.forward_inbound(topic, payload, retain).await;
                LoopControl::Continue
            }
            EventRoute::Closed => {
                warn!("broker closed the session");
                metrics().mqtt_connection_lost();
                self.schedule_reconnect(shutdown_rx, force_rx, current_event_loop)
                    .await
            }
            EventRoute::SubAck(pkid) => {
                debug!(target: "mqtt_link", pkid, "subscription confirmed");
                LoopControl::Continue
            }
            EventRoute::Infrastructure(event) => {
                debug!(target: "mqtt_link", %event, "broker event");
                LoopControl::Continue
            }
            EventRoute::Outgoing => LoopControl::Continue,
        }
    }

    async fn handle_poll_error(
        &self,
        error: rumqttc::v5::ConnectionError,
        shutdown_rx: watch::Receiver<bool>,
        force_rx: watch::Receiver<u64>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> LoopControl {
        error!("broker event loop error: {error}");
        metrics().mqtt_connection_lost();
        self.schedule_reconnect(shutdown_rx, force_rx, current_event_loop)
            .await
    }

    /// Connect side effects: reset the retry counter, re-issue the
    /// subscriptions, replay the outbound queue, announce presence
    async fn on_session_established(&self) {
        info!(client_id = %self.client_id, "broker session established");
        self.attempts.store(0, Ordering::Relaxed);
        metrics().mqtt_connection_established();
        set_state(&self.state_tx, ConnectionState::Connected);

        self.subscribe_all().await;
        self.flush_outbound().await;
        self.announce_presence().await;
    }

    /// Issue the wildcard subscriptions, logging per-filter failures
    async fn subscribe_all(&self) {
        let client = self.client.lock().await;
        for filter in &self.filters {
            if let Err(e) = client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                error!("failed to subscribe to {filter}: {e}");
            } else {
                debug!(target: "mqtt_link", %filter, "subscribed");
            }
        }
    }

    /// Replay queued messages in FIFO order
    ///
    /// A failed publish is dropped (fire-and-forget per item) and the
    /// rest of the queue is kept for the next session.
    async fn flush_outbound(&self) {
        let client = self.client.lock().await;
        let mut flushed = 0u64;
        loop {
            let message = { self.outbound.lock().await.pop() };
            let Some(message) = message else { break };

            match client
                .publish_with_properties(
                    message.topic.clone(),
                    message.qos,
                    message.retain,
                    message.payload,
                    PublishProperties::default(),
                )
                .await
            {
                Ok(()) => {
                    flushed += 1;
                    metrics().mqtt_message_published();
                }
                Err(e) => {
                    metrics().mqtt_publish_failed();
                    warn!(
                        topic = %message.topic,
                        "dropping message that failed to publish during replay: {e}"
                    );
                    break;
                }
            }
        }
        if flushed > 0 {
            metrics().mqtt_queue_flushed(flushed);
            info!(flushed, "outbound queue replayed");
        }
    }

    /// Retained presence so trackers and monitors see the app is up
    async fn announce_presence(&self) {
        let presence = AppPresence::online(self.client_id.as_str());
        let payload = match serde_json::to_vec(&presence) {
            Ok(payload) => payload,
            Err(e) => {
                error!("presence payload serialization failed: {e}");
                return;
            }
        };

        let client = self.client.lock().await;
        let props = PublishProperties {
            message_expiry_interval: Some(3600),
            ..Default::default()
        };
        if let Err(e) = client
            .publish_with_properties(SYSTEM_STATUS_TOPIC, QoS::AtLeastOnce, true, payload, props)
            .await
        {
            warn!("presence publish failed: {e}");
        }
    }

    /// Hand an inbound frame to the registered consumer
    async fn forward_inbound(&self, topic: String, payload: Vec<u8>, retain: bool) {
        metrics().mqtt_message_received();
        debug!(target: "mqtt_link", %topic, bytes = payload.len(), "inbound frame");

        let guard = self.inbound_tx.lock().await;
        match guard.as_ref() {
            Some(sender) => {
                let message = InboundMessage {
                    topic,
                    payload,
                    retain,
                };
                if sender.send(message).await.is_err() {
                    warn!("inbound consumer dropped, frame discarded");
                }
            }
            None => {
                debug!(target: "mqtt_link", "no inbound consumer registered, frame discarded");
            }
        }
    }

    /// Run the reconnect policy and, when allowed, back off and swap in
    /// a fresh connection
    async fn schedule_reconnect(
        &self,
        shutdown_rx: watch::Receiver<bool>,
        force_rx: watch::Receiver<u64>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> LoopControl {
        let prior_failures = self.attempts.load(Ordering::Relaxed);
        let shutdown_requested = *shutdown_rx.borrow();
        match self.policy.evaluate(prior_failures, shutdown_requested) {
            ReconnectDecision::Proceed { attempt, delay } => {
                self.attempts.store(attempt, Ordering::Relaxed);
                set_state(&self.state_tx, ConnectionState::Reconnecting(attempt));
                metrics().reconnect_cycle_started();
                info!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnection"
                );

                match backoff_sleep(shutdown_rx.clone(), force_rx, delay).await {
                    SleepOutcome::ShutdownRequested => return LoopControl::Stop,
                    SleepOutcome::ForceReconnect => {
                        info!("force reconnect cut the backoff short");
                        self.attempts.store(0, Ordering::Relaxed);
                    }
                    SleepOutcome::Completed => {}
                }

                if *shutdown_rx.borrow() {
                    info!("shutdown signal received, abandoning reconnection");
                    return LoopControl::Stop;
                }

                set_state(&self.state_tx, ConnectionState::Connecting);
                metrics().mqtt_connection_attempt();
                self.apply_new_connection(current_event_loop).await;
                LoopControl::Continue
            }
            ReconnectDecision::AbortShutdownRequested => {
                info!("shutdown signal received, stopping reconnection");
                LoopControl::Stop
            }
            ReconnectDecision::AbortAttemptsExhausted => {
                let reason = format!(
                    "gave up after {} reconnection attempts",
                    self.policy.max_attempts
                );
                error!("{reason}");
                set_state(&self.state_tx, ConnectionState::Failed(reason));
                LoopControl::Park
            }
        }
    }

    /// Reset retry state and swap in a fresh connection
    async fn restart_session(&self, current_event_loop: &mut Arc<Mutex<EventLoop>>) {
        self.attempts.store(0, Ordering::Relaxed);
        set_state(&self.state_tx, ConnectionState::Connecting);
        metrics().mqtt_connection_attempt();
        self.apply_new_connection(current_event_loop).await;
    }

    /// Swap in a fresh client and event loop
    async fn apply_new_connection(&self, current_event_loop: &mut Arc<Mutex<EventLoop>>) {
        match configure_mqtt_options(&self.client_id, &self.config) {
            Ok(options) => {
                let (new_client, new_event_loop) = AsyncClient::new(options, 10);
                *current_event_loop = Arc::new(Mutex::new(new_event_loop));
                let mut client_guard = self.client.lock().await;
                *client_guard = new_client;
                debug!(target: "mqtt_link", "fresh broker connection installed");
            }
            Err(e) => {
                // The next poll on the stale loop fails and lands back in
                // schedule_reconnect
                error!("failed to build a fresh broker connection: {e}");
            }
        }
    }
}

/// Backoff sleep that can be cut short by shutdown or force_reconnect
async fn backoff_sleep(
    mut shutdown_rx: watch::Receiver<bool>,
    mut force_rx: watch::Receiver<u64>,
    delay: Duration,
) -> SleepOutcome {
    tokio::select! {
        _ = shutdown_rx.changed() => {
            if *shutdown_rx.borrow() {
                SleepOutcome::ShutdownRequested
            } else {
                SleepOutcome::Completed
            }
        }
        _ = force_rx.changed() => SleepOutcome::ForceReconnect,
        _ = tokio::time::sleep(delay) => SleepOutcome::Completed,
    }
}
