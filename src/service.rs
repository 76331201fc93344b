//! Tracker service facade
//!
//! Wires the broker link, command dispatcher and telemetry batcher
//! together, runs the inbound router and exposes the embedding surface:
//! command dispatch, stats, state subscription and teardown.

use crate::commands::{CommandDispatcher, CommandError, CommandOutcome};
use crate::config::TrackerConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::observability::metrics;
use crate::observability::metrics::MetricsSnapshot;
use crate::protocol::{self, MessageKind, ParsedTopic, VehicleCommand};
use crate::store::{DeviceStore, EquipmentRecord};
use crate::telemetry::TelemetryBatcher;
use crate::transport::mqtt::{ConnectionState, MqttLink};
use crate::transport::{CommandChannel, InboundMessage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the inbound frame channel between the link and the router
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of the service, shaped for a UI status hook
#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub connected: bool,
    pub queue_size: usize,
    pub cache_size: usize,
    pub reconnect_attempts: u32,
    pub metrics: MetricsSnapshot,
}

/// The embedded tracking service
///
/// One instance per process, owning the single broker session. Embedders
/// construct it with their store implementation, call [`start`], and
/// keep it alive for the lifetime of the host process.
///
/// [`start`]: TrackerService::start
pub struct TrackerService<S>
where
    S: DeviceStore + 'static,
{
    config: TrackerConfig,
    link: Arc<MqttLink>,
    store: Arc<S>,
    dispatcher: Arc<CommandDispatcher<MqttLink, S>>,
    batcher: Arc<TelemetryBatcher<S>>,
    shutdown_tx: watch::Sender<bool>,
    router_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl<S> TrackerService<S>
where
    S: DeviceStore + 'static,
{
    pub fn new(config: TrackerConfig, store: Arc<S>) -> ServiceResult<Self> {
        let link = Arc::new(
            MqttLink::new(config.mqtt.clone(), &config.reconnect).map_err(ServiceError::transport)?,
        );
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&link),
            Arc::clone(&store),
            &config.mqtt.namespace,
            &config.commands,
        ));
        let batcher = Arc::new(TelemetryBatcher::new(
            Arc::clone(&store),
            &config.telemetry,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            link,
            store,
            dispatcher,
            batcher,
            shutdown_tx,
            router_handle: None,
            flush_handle: None,
            heartbeat_handle: None,
        })
    }

    /// Identity this instance announces on the presence topic
    pub fn client_id(&self) -> &str {
        self.link.client_id()
    }

    /// Start the background tasks and establish the broker session
    ///
    /// The router, flush timer and heartbeat come up before the session
    /// so frames delivered right after the broker confirms (retained
    /// messages in particular) already have a consumer. A broker that
    /// cannot be reached inside the connect timeout does not fail
    /// startup; the supervisor keeps recovering in the background.
    pub async fn start(&mut self) -> ServiceResult<()> {
        info!(client_id = %self.link.client_id(), "starting tracker service");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.link.set_inbound_sender(inbound_tx).await;

        self.router_handle = Some(tokio::spawn(run_router(
            self.config.mqtt.namespace.clone(),
            inbound_rx,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.batcher),
            self.shutdown_tx.subscribe(),
        )));
        self.flush_handle = Some(self.batcher.spawn_flush_timer(self.shutdown_tx.subscribe()));
        self.heartbeat_handle = Some(spawn_heartbeat(
            Arc::clone(&self.link),
            Arc::clone(&self.batcher),
            Duration::from_secs(self.config.service.heartbeat_interval_secs),
            self.shutdown_tx.subscribe(),
        ));

        match self.link.connect().await {
            Ok(()) => info!("broker session established"),
            Err(e) => {
                warn!("broker session not confirmed yet, recovery continues in background: {e}");
            }
        }

        Ok(())
    }

    /// Send a lock/unlock command to a device
    pub async fn send_command(
        &self,
        device_id: &str,
        command: VehicleCommand,
    ) -> Result<CommandOutcome, CommandError> {
        self.dispatcher.send_command(device_id, command).await
    }

    /// Equipment linked to a device, from the store
    pub async fn linked_equipment(
        &self,
        device_id: &str,
    ) -> ServiceResult<Option<EquipmentRecord>> {
        Ok(self.store.linked_equipment(device_id).await?)
    }

    /// Current session state
    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Subscribe to session state changes
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch_state()
    }

    /// Whether the broker session is currently established
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Reset retry state and rebuild the broker session
    pub fn force_reconnect(&self) -> ServiceResult<()> {
        self.link.force_reconnect().map_err(ServiceError::transport)
    }

    /// Snapshot of the service for a status display
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            connected: self.link.is_connected(),
            queue_size: self.link.queue_size().await,
            cache_size: self.batcher.cache_size().await,
            reconnect_attempts: self.link.reconnect_attempts(),
            metrics: metrics().get_metrics(),
        }
    }

    /// Stop the background tasks and close the broker session
    ///
    /// Signals the flush timer first so buffered telemetry drains while
    /// the store is still reachable, then tears the session down.
    pub async fn shutdown(&mut self) {
        info!("shutting down tracker service");

        let _ = self.shutdown_tx.send(true);

        for handle in [
            self.flush_handle.take(),
            self.heartbeat_handle.take(),
            self.router_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !e.is_cancelled() => {
                    error!("service task ended with error: {e}");
                }
                Err(_) => warn!("service task did not stop in time"),
                _ => {}
            }
        }

        self.link.disconnect().await;
        info!("tracker service stopped");
    }
}

/// Consume inbound frames and hand them to the right component
async fn run_router<C, S>(
    namespace: String,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    dispatcher: Arc<CommandDispatcher<C, S>>,
    batcher: Arc<TelemetryBatcher<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    C: CommandChannel + 'static,
    S: DeviceStore + 'static,
{
    info!("inbound router started");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            message = inbound_rx.recv() => {
                match message {
                    Some(message) => {
                        route_inbound(&namespace, message, &dispatcher, &batcher).await;
                    }
                    None => break,
                }
            }
        }
    }
    info!("inbound router stopped");
}

/// Dispatch one frame by its parsed topic
async fn route_inbound<C, S>(
    namespace: &str,
    message: InboundMessage,
    dispatcher: &CommandDispatcher<C, S>,
    batcher: &TelemetryBatcher<S>,
) where
    C: CommandChannel + 'static,
    S: DeviceStore + 'static,
{
    match protocol::parse_topic(namespace, &message.topic) {
        Some(ParsedTopic::Device { device_id, kind }) => match kind {
            MessageKind::Location => {
                batcher.ingest_location(device_id, &message.payload).await;
            }
            MessageKind::Status => {
                batcher.ingest_status(device_id, &message.payload).await;
            }
            MessageKind::CommandResponse => {
                if message.retain {
                    // A retained response predates this session and can
                    // only belong to an already-settled command
                    debug!(%device_id, "retained response replay ignored");
                    return;
                }
                dispatcher.handle_response(device_id, &message.payload).await;
            }
            MessageKind::Command | MessageKind::Pending => {
                // Our own outbound topics looped back by a bridge
                debug!(%device_id, topic = %message.topic, "outbound-topic echo dropped");
            }
        },
        Some(ParsedTopic::SystemStatus) => {
            debug!(
                bytes = message.payload.len(),
                "application presence broadcast"
            );
        }
        None => {
            warn!(topic = %message.topic, "message on unrecognized topic dropped");
        }
    }
}

/// Periodic liveness: log the stats line and refresh the retained
/// presence
fn spawn_heartbeat<S>(
    link: Arc<MqttLink>,
    batcher: Arc<TelemetryBatcher<S>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: DeviceStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // First tick completes immediately, skip it

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    metrics().mqtt_heartbeat();
                    let snapshot = metrics().get_metrics();
                    let connected = link.is_connected();
                    let state = link.state().label();
                    let queue_size = link.queue_size().await;
                    let cache_size = batcher.cache_size().await;
                    info!(
                        connected,
                        state,
                        queue_size,
                        cache_size,
                        reconnect_attempts = link.reconnect_attempts(),
                        messages_published = snapshot.mqtt.messages_published,
                        messages_received = snapshot.mqtt.messages_received,
                        commands_confirmed = snapshot.commands.commands_confirmed,
                        commands_pending = snapshot.commands.commands_marked_pending,
                        "service heartbeat"
                    );

                    if link.is_connected() {
                        if let Err(e) = link.publish_presence_online().await {
                            debug!("presence refresh failed: {e}");
                        }
                    }
                }
            }
        }
        debug!("heartbeat task stopped");
    })
}


#[cfg(test)]
mod router_tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::protocol::ConnectivityStatus;
    use crate::testing::{MockChannel, RecordingStore};
    use serde_json::json;

    struct Fixture {
        channel: Arc<MockChannel>,
        store: Arc<RecordingStore>,
        dispatcher: Arc<CommandDispatcher<MockChannel, RecordingStore>>,
        batcher: Arc<TelemetryBatcher<RecordingStore>>,
    }

    fn fixture() -> Fixture {
        let config = TrackerConfig::test_config();
        let channel = Arc::new(MockChannel::new());
        let store = Arc::new(RecordingStore::new());
        Fixture {
            dispatcher: Arc::new(CommandDispatcher::new(
                Arc::clone(&channel),
                Arc::clone(&store),
                "devices",
                &config.commands,
            )),
            batcher: Arc::new(TelemetryBatcher::new(
                Arc::clone(&store),
                &config.telemetry,
            )),
            channel,
            store,
        }
    }

    fn frame(topic: &str, payload: serde_json::Value, retain: bool) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_string().into_bytes(),
            retain,
        }
    }

    #[tokio::test]
    async fn test_location_frames_reach_the_batcher() {
        let f = fixture();
        route_inbound(
            "devices",
            frame(
                "devices/tk-1/location",
                json!({"latitude": -23.55, "longitude": -46.63}),
                false,
            ),
            &f.dispatcher,
            &f.batcher,
        )
        .await;

        assert_eq!(f.batcher.cache_size().await, 1);
    }

    #[tokio::test]
    async fn test_legacy_location_segment_is_accepted() {
        let f = fixture();
        route_inbound(
            "devices",
            frame(
                "devices/tk-1/localizacao",
                json!({"latitude": "-23.55", "longitude": "-46.63"}),
                false,
            ),
            &f.dispatcher,
            &f.batcher,
        )
        .await;

        assert_eq!(f.batcher.cache_size().await, 1);
    }

    #[tokio::test]
    async fn test_status_frames_reach_the_store() {
        let f = fixture();
        route_inbound(
            "devices",
            frame("devices/tk-1/status", json!({"status": "offline"}), false),
            &f.dispatcher,
            &f.batcher,
        )
        .await;

        let updates = f.store.get_device_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.connectivity, Some(ConnectivityStatus::Offline));
    }

    #[tokio::test]
    async fn test_retained_response_does_not_confirm() {
        let f = fixture();
        let dispatcher = Arc::clone(&f.dispatcher);
        let send = tokio::spawn(async move {
            dispatcher.send_command("tk-1", VehicleCommand::On).await
        });

        // Recover the command id from the published request
        assert!(f.channel.wait_for_publishes(1, Duration::from_secs(1)).await);
        let published = f.channel.get_published().await;
        let request: crate::protocol::CommandRequest =
            serde_json::from_slice(&published[0].1).unwrap();

        // A retained ack is a replay from a previous session and must
        // not close the confirmation window
        route_inbound(
            "devices",
            frame(
                "devices/tk-1/response",
                json!({"command_id": request.id, "status": "executed"}),
                true,
            ),
            &f.dispatcher,
            &f.batcher,
        )
        .await;

        let outcome = send.await.unwrap().unwrap();
        assert!(!outcome.is_confirmed());
    }

    #[tokio::test]
    async fn test_unrecognized_topics_are_dropped() {
        let f = fixture();
        for topic in [
            "devices/tk-1/firmware",
            "other/tk-1/location",
            "devices/tk-1",
            "devices/tk 1/location",
        ] {
            route_inbound(
                "devices",
                frame(topic, json!({"latitude": 1.0, "longitude": 2.0}), false),
                &f.dispatcher,
                &f.batcher,
            )
            .await;
        }

        assert_eq!(f.batcher.cache_size().await, 0);
        assert!(f.store.get_device_updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_system_broadcast_only_logs() {
        let f = fixture();
        route_inbound(
            "devices",
            frame(
                "system/status",
                json!({"client_id": "tracker-app-1", "status": "online"}),
                true,
            ),
            &f.dispatcher,
            &f.batcher,
        )
        .await;

        assert_eq!(f.batcher.cache_size().await, 0);
        assert!(f.store.get_device_updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_router_loop_consumes_until_shutdown() {
        let f = fixture();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = tokio::spawn(run_router(
            "devices".to_string(),
            inbound_rx,
            Arc::clone(&f.dispatcher),
            Arc::clone(&f.batcher),
            shutdown_rx,
        ));

        inbound_tx
            .send(frame(
                "devices/tk-1/location",
                json!({"latitude": -23.55, "longitude": -46.63}),
                false,
            ))
            .await
            .unwrap();
        inbound_tx
            .send(frame(
                "devices/tk-2/status",
                json!({"bateria": "77"}),
                false,
            ))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.store.get_device_updates().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("router never processed the frames");

        let _ = shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), router)
            .await
            .expect("router did not stop on shutdown")
            .unwrap();
    }
}
