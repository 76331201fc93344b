//! End-to-end command dispatch tests
//!
//! Covers the confirm-or-pending contract over the public API:
//! - Confirmed outcomes when the device acknowledges in time
//! - Pending fallback for silent devices, broken links and failed publishes
//! - Wire payload shapes on the command and pending topics
//! - Lock state bookkeeping in the store


use std::sync::Arc;
use std::time::{Duration, Instant};
use tracklink::commands::{CommandDispatcher, CommandError};
use tracklink::protocol::{
    command_topic, pending_topic, CommandAck, CommandRequest, CommandStatus, LockState,
    VehicleCommand,
};
use tracklink::testing::{MockChannel, RecordingStore};

fn create_dispatcher(
    channel: Arc<MockChannel>,
    store: Arc<RecordingStore>,
) -> CommandDispatcher<MockChannel, RecordingStore> {
    let config = test_helpers::test_config();
    CommandDispatcher::new(channel, store, "devices", &config.commands)
}

fn executed_ack(request: &CommandRequest) -> Vec<u8> {
    serde_json::to_vec(&CommandAck {
        command_id: request.id,
        status: "executed".to_string(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_command_confirmed_when_device_acks_in_time() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = Arc::new(create_dispatcher(Arc::clone(&channel), Arc::clone(&store)));

    let send = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send_command("tk-1", VehicleCommand::On).await })
    };

    assert!(channel.wait_for_publishes(1, Duration::from_secs(1)).await);
    let published = channel.published_on(&command_topic("devices", "tk-1")).await;
    assert_eq!(published.len(), 1);
    assert!(!published[0].2, "commands must not be retained");

    let request: CommandRequest = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(request.command, VehicleCommand::On);
    assert_eq!(request.device_id, "tk-1");

    dispatcher.handle_response("tk-1", &executed_ack(&request)).await;

    let outcome = send.await.unwrap().unwrap();
    assert!(outcome.is_confirmed());
    assert_eq!(outcome.command_id(), request.id);

    // Confirmation lands the definitive lock state in the store
    let updates = store.get_device_updates().await;
    let last = updates.last().expect("confirmation should upsert the device");
    assert_eq!(last.0, "tk-1");
    assert_eq!(last.1.lock_state, Some(LockState::Unlocked));
    assert!(last.1.last_command_at.is_some());

    // Nothing was parked
    assert!(store.get_pending_commands().await.is_empty());
}

#[tokio::test]
async fn test_silent_device_parks_command_as_pending() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = create_dispatcher(Arc::clone(&channel), Arc::clone(&store));

    let outcome = dispatcher
        .send_command("tk-2", VehicleCommand::Off)
        .await
        .unwrap();
    assert!(!outcome.is_confirmed());

    // Exactly one pending record, tied to the published command
    let pending = store.get_pending_commands().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].device_id, "tk-2");
    assert_eq!(pending[0].command, VehicleCommand::Off);
    assert_eq!(pending[0].command_id, outcome.command_id());
    assert_eq!(pending[0].status, CommandStatus::Pending);

    // The pending topic carries a retained copy in the command wire shape
    let parked = channel.published_on(&pending_topic("devices", "tk-2")).await;
    assert_eq!(parked.len(), 1);
    assert!(parked[0].2, "pending copy must be retained");
    let replay: CommandRequest = serde_json::from_slice(&parked[0].1).unwrap();
    assert_eq!(replay.id, outcome.command_id());
    assert_eq!(replay.command, VehicleCommand::Off);

    // Lock state reflects the optimistic pending transition
    let updates = store.get_device_updates().await;
    let last = updates.last().unwrap();
    assert_eq!(last.1.lock_state, Some(LockState::PendingLock));
}

#[tokio::test]
async fn test_disconnected_link_parks_without_waiting() {
    let channel = Arc::new(MockChannel::disconnected());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = create_dispatcher(Arc::clone(&channel), Arc::clone(&store));

    let started = Instant::now();
    let outcome = dispatcher
        .send_command("tk-3", VehicleCommand::On)
        .await
        .unwrap();

    assert!(!outcome.is_confirmed());
    assert!(
        started.elapsed() < Duration::from_millis(90),
        "offline dispatch must not wait out the confirmation window"
    );

    // The command itself never hit the command topic
    assert!(channel
        .published_on(&command_topic("devices", "tk-3"))
        .await
        .is_empty());
    assert_eq!(store.get_pending_commands().await.len(), 1);
}

#[tokio::test]
async fn test_failed_publish_parks_command() {
    let channel = Arc::new(MockChannel::with_publish_failure());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = create_dispatcher(Arc::clone(&channel), Arc::clone(&store));

    let outcome = dispatcher
        .send_command("tk-4", VehicleCommand::Off)
        .await
        .unwrap();

    assert!(!outcome.is_confirmed());
    assert_eq!(store.get_pending_commands().await.len(), 1);
}

#[tokio::test]
async fn test_invalid_device_id_is_rejected_up_front() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = create_dispatcher(Arc::clone(&channel), Arc::clone(&store));

    let result = dispatcher.send_command("tk/5", VehicleCommand::On).await;

    assert!(matches!(result, Err(CommandError::InvalidDeviceId(_))));
    assert!(channel.get_published().await.is_empty());
    assert!(store.get_pending_commands().await.is_empty());
}

#[tokio::test]
async fn test_non_executed_ack_still_ends_pending() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = Arc::new(create_dispatcher(Arc::clone(&channel), Arc::clone(&store)));

    let send = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send_command("tk-6", VehicleCommand::On).await })
    };

    assert!(channel.wait_for_publishes(1, Duration::from_secs(1)).await);
    let published = channel.published_on(&command_topic("devices", "tk-6")).await;
    let request: CommandRequest = serde_json::from_slice(&published[0].1).unwrap();

    // A rejection does not close the window, the command still parks
    let rejection = serde_json::to_vec(&CommandAck {
        command_id: request.id,
        status: "rejected".to_string(),
    })
    .unwrap();
    dispatcher.handle_response("tk-6", &rejection).await;

    let outcome = send.await.unwrap().unwrap();
    assert!(!outcome.is_confirmed());
    assert_eq!(store.get_pending_commands().await.len(), 1);
}

#[tokio::test]
async fn test_mismatched_ack_id_is_ignored() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = Arc::new(create_dispatcher(Arc::clone(&channel), Arc::clone(&store)));

    let send = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send_command("tk-7", VehicleCommand::On).await })
    };

    assert!(channel.wait_for_publishes(1, Duration::from_secs(1)).await);

    let unrelated = serde_json::to_vec(&CommandAck {
        command_id: uuid::Uuid::new_v4(),
        status: "executed".to_string(),
    })
    .unwrap();
    dispatcher.handle_response("tk-7", &unrelated).await;

    let outcome = send.await.unwrap().unwrap();
    assert!(!outcome.is_confirmed());
}

#[tokio::test]
async fn test_late_ack_does_not_confirm_parked_command() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = create_dispatcher(Arc::clone(&channel), Arc::clone(&store));

    let outcome = dispatcher
        .send_command("tk-8", VehicleCommand::Off)
        .await
        .unwrap();
    assert!(!outcome.is_confirmed());

    let published = channel.published_on(&command_topic("devices", "tk-8")).await;
    let request: CommandRequest = serde_json::from_slice(&published[0].1).unwrap();
    dispatcher.handle_response("tk-8", &executed_ack(&request)).await;

    // The parked state stands, the late ack changes nothing
    let updates = store.get_device_updates().await;
    let last = updates.last().unwrap();
    assert_eq!(last.1.lock_state, Some(LockState::PendingLock));
    assert_eq!(store.get_pending_commands().await.len(), 1);
}

#[tokio::test]
async fn test_offline_burst_parks_every_command() {
    let channel = Arc::new(MockChannel::disconnected());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = Arc::new(create_dispatcher(Arc::clone(&channel), Arc::clone(&store)));

    let sends = (0..5).map(|i| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .send_command(&format!("tk-{i}"), VehicleCommand::On)
                .await
        }
    });
    let outcomes = futures::future::join_all(sends).await;

    assert!(outcomes
        .iter()
        .all(|outcome| !outcome.as_ref().unwrap().is_confirmed()));
    assert_eq!(store.get_pending_commands().await.len(), 5);
}

#[tokio::test]
async fn test_concurrent_commands_resolve_independently() {
    let channel = Arc::new(MockChannel::new());
    let store = Arc::new(RecordingStore::new());
    let dispatcher = Arc::new(create_dispatcher(Arc::clone(&channel), Arc::clone(&store)));

    let send_a = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send_command("tk-a", VehicleCommand::On).await })
    };
    let send_b = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.send_command("tk-b", VehicleCommand::Off).await })
    };

    assert!(channel.wait_for_publishes(2, Duration::from_secs(1)).await);

    // Acknowledge only device a, device b stays silent
    let published_a = channel.published_on(&command_topic("devices", "tk-a")).await;
    let request_a: CommandRequest = serde_json::from_slice(&published_a[0].1).unwrap();
    dispatcher.handle_response("tk-a", &executed_ack(&request_a)).await;

    let outcome_a = send_a.await.unwrap().unwrap();
    let outcome_b = send_b.await.unwrap().unwrap();

    assert!(outcome_a.is_confirmed());
    assert!(!outcome_b.is_confirmed());

    let pending = store.get_pending_commands().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].device_id, "tk-b");
}
