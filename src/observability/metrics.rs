//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across command dispatch, the MQTT link and
//! telemetry batching.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Command dispatch metrics (atomic for high frequency)
    commands_sent: AtomicU64,
    commands_awaiting: AtomicU64,
    commands_confirmed: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_marked_pending: AtomicU64,
    max_awaiting_reached: AtomicU64,

    // MQTT metrics (atomic for high frequency)
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    messages_queued: AtomicU64,
    messages_flushed: AtomicU64,
    last_heartbeat: AtomicU64,
    connection_start_time: AtomicU64,

    // Telemetry batching metrics (atomic for high frequency)
    locations_batched: AtomicU64,
    locations_coalesced: AtomicU64,
    batches_flushed: AtomicU64,

    // Confirmation latencies (mutex protected for complex operations)
    confirm_times: Mutex<Vec<u64>>, // in milliseconds

    // Per-device statistics (mutex protected for complex data)
    device_stats: Mutex<HashMap<String, DeviceMessageStats>>,

    // Session metrics
    session_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    reconnects: AtomicU64,
    force_reconnects: AtomicU64,
}

impl MetricsCollector {
    /// Initialize command dispatch metrics (pure function)
    fn init_command_metrics() -> (
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
    ) {
        (
            AtomicU64::new(0), // commands_sent
            AtomicU64::new(0), // commands_awaiting
            AtomicU64::new(0), // commands_confirmed
            AtomicU64::new(0), // commands_timed_out
            AtomicU64::new(0), // commands_marked_pending
            AtomicU64::new(0), // max_awaiting_reached
        )
    }

    /// Initialize MQTT metrics (pure function)
    #[allow(clippy::type_complexity)]
    fn init_mqtt_metrics() -> (
        AtomicBool,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
        AtomicU64,
    ) {
        (
            AtomicBool::new(false), // mqtt_connected
            AtomicU64::new(0),      // connection_attempts
            AtomicU64::new(0),      // connections_established
            AtomicU64::new(0),      // connection_failures
            AtomicU64::new(0),      // messages_published
            AtomicU64::new(0),      // publish_failures
            AtomicU64::new(0),      // messages_received
            AtomicU64::new(0),      // messages_queued
            AtomicU64::new(0),      // messages_flushed
            AtomicU64::new(0),      // last_heartbeat
            AtomicU64::new(0),      // connection_start_time
        )
    }

    /// Initialize session metrics (pure function)
    fn init_session_metrics(
        now: u64,
    ) -> (Mutex<String>, AtomicU64, AtomicU64, AtomicU64, AtomicU64) {
        (
            Mutex::new("disconnected".to_string()), // session_state
            AtomicU64::new(now),                    // uptime_start
            AtomicU64::new(0),                      // state_transitions
            AtomicU64::new(0),                      // reconnects
            AtomicU64::new(0),                      // force_reconnects
        )
    }

    pub fn new() -> Self {
        let now = current_timestamp();

        let (
            commands_sent,
            commands_awaiting,
            commands_confirmed,
            commands_timed_out,
            commands_marked_pending,
            max_awaiting_reached,
        ) = Self::init_command_metrics();
        let (
            mqtt_connected,
            connection_attempts,
            connections_established,
            connection_failures,
            messages_published,
            publish_failures,
            messages_received,
            messages_queued,
            messages_flushed,
            last_heartbeat,
            connection_start_time,
        ) = Self::init_mqtt_metrics();
        let (session_state, uptime_start, state_transitions, reconnects, force_reconnects) =
            Self::init_session_metrics(now);

        Self {
            commands_sent,
            commands_awaiting,
            commands_confirmed,
            commands_timed_out,
            commands_marked_pending,
            max_awaiting_reached,
            mqtt_connected,
            connection_attempts,
            connections_established,
            connection_failures,
            messages_published,
            publish_failures,
            messages_received,
            messages_queued,
            messages_flushed,
            last_heartbeat,
            connection_start_time,
            locations_batched: AtomicU64::new(0),
            locations_coalesced: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            confirm_times: Mutex::new(Vec::new()),
            device_stats: Mutex::new(HashMap::new()),
            session_state,
            uptime_start,
            state_transitions,
            reconnects,
            force_reconnects,
        }
    }

    // Command dispatch metrics
    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        let old_count = self.commands_awaiting.fetch_add(1, Ordering::Relaxed);
        let new_count = old_count + 1;

        // Update max awaiting tracking
        let current_max = self.max_awaiting_reached.load(Ordering::Relaxed);
        if new_count > current_max {
            self.max_awaiting_reached.store(new_count, Ordering::Relaxed);
        }
    }

    pub fn command_confirmed(&self, duration: Duration) {
        self.commands_confirmed.fetch_add(1, Ordering::Relaxed);
        self.commands_awaiting.fetch_sub(1, Ordering::Relaxed);

        // Record confirmation latency
        self.record_confirm_time(duration);
    }

    pub fn command_timed_out(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
        self.commands_awaiting.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_marked_pending(&self) {
        self.commands_marked_pending.fetch_add(1, Ordering::Relaxed);
    }

    fn record_confirm_time(&self, duration: Duration) {
        if let Ok(mut times) = self.confirm_times.lock() {
            times.push(duration.as_millis() as u64);

            // Limit to last 1000 measurements to prevent unbounded growth
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_queue_flushed(&self, count: u64) {
        self.messages_flushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mqtt_heartbeat(&self) {
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Telemetry batching metrics
    pub fn location_batched(&self) {
        self.locations_batched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn location_coalesced(&self) {
        self.locations_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Create or retrieve device stats entry (pure function)
    fn get_or_create_device_stats<'a>(
        stats: &'a mut HashMap<String, DeviceMessageStats>,
        device_id: &str,
    ) -> &'a mut DeviceMessageStats {
        stats
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceMessageStats {
                device_id: device_id.to_string(),
                locations: 0,
                status_updates: 0,
                dropped: 0,
                last_seen: 0,
            })
    }

    // Per-device telemetry metrics
    pub fn device_location_received(&self, device_id: &str) {
        if let Ok(mut stats) = self.device_stats.lock() {
            let device = Self::get_or_create_device_stats(&mut stats, device_id);
            device.locations += 1;
            device.last_seen = current_timestamp();
        }
    }

    pub fn device_status_received(&self, device_id: &str) {
        if let Ok(mut stats) = self.device_stats.lock() {
            let device = Self::get_or_create_device_stats(&mut stats, device_id);
            device.status_updates += 1;
            device.last_seen = current_timestamp();
        }
    }

    pub fn device_message_dropped(&self, device_id: &str) {
        if let Ok(mut stats) = self.device_stats.lock() {
            let device = Self::get_or_create_device_stats(&mut stats, device_id);
            device.dropped += 1;
        }
    }

    // Session metrics
    pub fn set_session_state(&self, state: &str) {
        if let Ok(mut current_state) = self.session_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn reconnect_cycle_started(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn force_reconnect_requested(&self) {
        self.force_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset command counters (pure function)
    fn reset_command_metrics(&self) {
        self.commands_sent.store(0, Ordering::Relaxed);
        self.commands_awaiting.store(0, Ordering::Relaxed);
        self.commands_confirmed.store(0, Ordering::Relaxed);
        self.commands_timed_out.store(0, Ordering::Relaxed);
        self.commands_marked_pending.store(0, Ordering::Relaxed);
        self.max_awaiting_reached.store(0, Ordering::Relaxed);
    }

    /// Reset MQTT metrics (pure function)
    fn reset_mqtt_metrics(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connections_established.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.messages_published.store(0, Ordering::Relaxed);
        self.publish_failures.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.messages_queued.store(0, Ordering::Relaxed);
        self.messages_flushed.store(0, Ordering::Relaxed);
        self.last_heartbeat.store(0, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    /// Reset telemetry counters (pure function)
    fn reset_telemetry_metrics(&self) {
        self.locations_batched.store(0, Ordering::Relaxed);
        self.locations_coalesced.store(0, Ordering::Relaxed);
        self.batches_flushed.store(0, Ordering::Relaxed);
    }

    /// Reset session metrics (pure function)
    fn reset_session_metrics(&self) {
        let now = current_timestamp();
        self.state_transitions.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        self.force_reconnects.store(0, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
    }

    /// Reset mutex-protected collections (pure function)
    fn reset_collections(&self) {
        if let Ok(mut times) = self.confirm_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.device_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.session_state.lock() {
            *state = "disconnected".to_string();
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.reset_command_metrics();
        self.reset_mqtt_metrics();
        self.reset_telemetry_metrics();
        self.reset_session_metrics();
        self.reset_collections();
    }

    /// Calculate confirmation latency statistics (pure function)
    fn calculate_confirm_time_statistics(&self) -> (f64, f64, f64, f64) {
        if let Ok(times) = self.confirm_times.lock() {
            if times.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted_times = times.clone();
                sorted_times.sort_unstable();

                let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
                let p50 = percentile(&sorted_times, 50.0);
                let p95 = percentile(&sorted_times, 95.0);
                let p99 = percentile(&sorted_times, 99.0);

                (avg, p50, p95, p99)
            }
        } else {
            (0.0, 0.0, 0.0, 0.0)
        }
    }

    /// Build per-device statistics summary (pure function)
    fn build_device_statistics(&self) -> (HashMap<String, DeviceStatsSnapshot>, u64, u64, u64) {
        if let Ok(stats) = self.device_stats.lock() {
            let mut processed_stats = HashMap::new();
            let mut total_locations = 0u64;
            let mut total_status_updates = 0u64;
            let mut total_dropped = 0u64;

            for (device_id, stats) in stats.iter() {
                processed_stats.insert(device_id.clone(), Self::create_device_snapshot(stats));

                total_locations += stats.locations;
                total_status_updates += stats.status_updates;
                total_dropped += stats.dropped;
            }

            (
                processed_stats,
                total_locations,
                total_status_updates,
                total_dropped,
            )
        } else {
            (HashMap::new(), 0, 0, 0)
        }
    }

    /// Create device stats snapshot (pure function)
    fn create_device_snapshot(stats: &DeviceMessageStats) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            device_id: stats.device_id.clone(),
            locations: stats.locations,
            status_updates: stats.status_updates,
            dropped: stats.dropped,
            last_seen: stats.last_seen,
        }
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if self.mqtt_connected.load(Ordering::Relaxed) {
            let start_time = self.connection_start_time.load(Ordering::Relaxed);
            if start_time > 0 {
                now - start_time
            } else {
                0
            }
        } else {
            0
        }
    }

    /// Get current session state (pure function)
    fn get_current_session_state(&self) -> String {
        self.session_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Build complete metrics snapshot (pure function)
    fn build_metrics_snapshot(
        &self,
        confirm_stats: (f64, f64, f64, f64),
        device_stats: (HashMap<String, DeviceStatsSnapshot>, u64, u64, u64),
        connection_duration_seconds: u64,
        uptime_seconds: u64,
        current_state: String,
        timestamp: u64,
    ) -> MetricsSnapshot {
        let (avg_confirm_time_ms, p50, p95, p99) = confirm_stats;
        let (device_stats_map, total_locations, total_status_updates, total_dropped) = device_stats;

        MetricsSnapshot {
            commands: CommandMetrics {
                commands_sent: self.commands_sent.load(Ordering::Relaxed),
                commands_awaiting: self.commands_awaiting.load(Ordering::Relaxed),
                commands_confirmed: self.commands_confirmed.load(Ordering::Relaxed),
                commands_timed_out: self.commands_timed_out.load(Ordering::Relaxed),
                commands_marked_pending: self.commands_marked_pending.load(Ordering::Relaxed),
                avg_confirm_time_ms,
                confirm_time_p50_ms: p50,
                confirm_time_p95_ms: p95,
                confirm_time_p99_ms: p99,
                max_awaiting_reached: self.max_awaiting_reached.load(Ordering::Relaxed) as u32,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_queued: self.messages_queued.load(Ordering::Relaxed),
                messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            telemetry: TelemetryMetrics {
                device_stats: device_stats_map,
                total_locations,
                total_status_updates,
                total_dropped,
                locations_batched: self.locations_batched.load(Ordering::Relaxed),
                locations_coalesced: self.locations_coalesced.load(Ordering::Relaxed),
                batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            },
            session: SessionMetrics {
                current_state,
                uptime_seconds,
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                force_reconnects: self.force_reconnects.load(Ordering::Relaxed),
            },
            timestamp,
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        let confirm_stats = self.calculate_confirm_time_statistics();
        let device_stats = self.build_device_statistics();
        let connection_duration = self.calculate_connection_duration(now);
        let uptime_seconds = now - self.uptime_start.load(Ordering::Relaxed);
        let current_state = self.get_current_session_state();

        self.build_metrics_snapshot(
            confirm_stats,
            device_stats,
            connection_duration,
            uptime_seconds,
            current_state,
            now,
        )
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Internal per-device statistics
#[derive(Debug)]
struct DeviceMessageStats {
    device_id: String,
    locations: u64,
    status_updates: u64,
    dropped: u64,
    last_seen: u64,
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub commands: CommandMetrics,
    pub mqtt: MqttMetrics,
    pub telemetry: TelemetryMetrics,
    pub session: SessionMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct CommandMetrics {
    pub commands_sent: u64,
    pub commands_awaiting: u64,
    pub commands_confirmed: u64,
    pub commands_timed_out: u64,
    pub commands_marked_pending: u64,
    pub avg_confirm_time_ms: f64,
    pub confirm_time_p50_ms: f64,
    pub confirm_time_p95_ms: f64,
    pub confirm_time_p99_ms: f64,
    pub max_awaiting_reached: u32,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub messages_queued: u64,
    pub messages_flushed: u64,
    pub last_heartbeat: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct TelemetryMetrics {
    pub device_stats: HashMap<String, DeviceStatsSnapshot>,
    pub total_locations: u64,
    pub total_status_updates: u64,
    pub total_dropped: u64,
    pub locations_batched: u64,
    pub locations_coalesced: u64,
    pub batches_flushed: u64,
}

#[derive(Debug, Serialize)]
pub struct DeviceStatsSnapshot {
    pub device_id: String,
    pub locations: u64,
    pub status_updates: u64,
    pub dropped: u64,
    pub last_seen: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub reconnects: u64,
    pub force_reconnects: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
