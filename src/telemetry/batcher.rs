//! Batched persistence of device telemetry
//!
//! Inbound GPS fixes are coalesced per device in a write-behind cache
//! and flushed to the store either when the cache reaches the batch
//! size or when the periodic timer fires. Device liveness (online,
//! last seen, battery, signal) is forwarded to the store immediately,
//! independent of batching.

use crate::config::TelemetrySection;
use crate::observability::metrics;
use crate::protocol::{ConnectivityStatus, DeviceStatus, LocationReport};
use crate::store::{DeviceStatusUpdate, DeviceStore, TelemetryRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Write-behind cache for device telemetry
///
/// The cache is keyed by device, overwrite-on-insert: rapid fixes from
/// the same device between flushes collapse to the most recent one.
/// Intermediate readings are lost; history granularity is not
/// guaranteed.
pub struct TelemetryBatcher<S> {
    store: Arc<S>,
    batch_size: usize,
    flush_interval: Duration,
    cache: Mutex<HashMap<String, TelemetryRecord>>,
}

impl<S> TelemetryBatcher<S>
where
    S: DeviceStore + 'static,
{
    pub fn new(store: Arc<S>, config: &TelemetrySection) -> Self {
        Self {
            store,
            batch_size: config.batch_size,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of device entries waiting for the next flush
    pub async fn cache_size(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Ingest a frame from a device's location topic
    ///
    /// Unparseable payloads are dropped. A parsed fix updates the
    /// device's liveness immediately and replaces the device's cache
    /// entry; reaching the batch size flushes right away.
    pub async fn ingest_location(&self, device_id: &str, payload: &[u8]) {
        let report: LocationReport = match serde_json::from_slice(payload) {
            Ok(report) => report,
            Err(e) => {
                metrics().device_message_dropped(device_id);
                warn!(%device_id, "unparseable location report dropped: {e}");
                return;
            }
        };
        metrics().device_location_received(device_id);

        let record = TelemetryRecord::from_report(device_id, report);
        debug!(
            %device_id,
            latitude = record.latitude,
            longitude = record.longitude,
            "location report received"
        );

        self.touch_device(device_id, record.battery, record.signal)
            .await;

        let should_flush = {
            let mut cache = self.cache.lock().await;
            if cache.insert(device_id.to_string(), record).is_some() {
                metrics().location_coalesced();
            }
            metrics().location_batched();
            cache.len() >= self.batch_size
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Ingest a frame from a device's status topic
    ///
    /// Status frames bypass the cache entirely; they only refresh the
    /// device's liveness fields.
    pub async fn ingest_status(&self, device_id: &str, payload: &[u8]) {
        let status: DeviceStatus = match serde_json::from_slice(payload) {
            Ok(status) => status,
            Err(e) => {
                metrics().device_message_dropped(device_id);
                warn!(%device_id, "unparseable status report dropped: {e}");
                return;
            }
        };
        metrics().device_status_received(device_id);
        debug!(%device_id, status = ?status.status, "status report received");

        let update = DeviceStatusUpdate {
            connectivity: Some(status.status),
            last_seen: Some(Utc::now()),
            battery: status.battery,
            signal: status.signal,
            ..Default::default()
        };
        if let Err(e) = self.store.upsert_device_status(device_id, update).await {
            warn!(%device_id, "device status upsert failed: {e}");
        }
    }

    /// Drain the cache and persist every record
    ///
    /// Each record is written on its own (history append plus last-known
    /// -location merge); records whose write fails go back into the
    /// cache for the next cycle unless a fresher fix for the same device
    /// arrived in the meantime.
    pub async fn flush(&self) {
        let drained: Vec<TelemetryRecord> = {
            let mut cache = self.cache.lock().await;
            cache.drain().map(|(_, record)| record).collect()
        };
        if drained.is_empty() {
            return;
        }

        let total = drained.len();
        let mut failed = Vec::new();
        for record in drained {
            if let Err(e) = self.persist_record(&record).await {
                warn!(
                    device_id = %record.device_id,
                    "telemetry write failed, keeping record for the next cycle: {e}"
                );
                failed.push(record);
            }
        }

        let written = total - failed.len();
        if !failed.is_empty() {
            let mut cache = self.cache.lock().await;
            for record in failed {
                // A fix that arrived during the flush is fresher than
                // the failed one, keep it
                cache.entry(record.device_id.clone()).or_insert(record);
            }
        }

        metrics().batch_flushed();
        info!(written, total, "telemetry batch flushed");
    }

    /// Flush the cache on a fixed interval until shutdown
    pub fn spawn_flush_timer(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batcher.flush_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            // Final drain so buffered fixes survive teardown
                            batcher.flush().await;
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        batcher.flush().await;
                    }
                }
            }
            debug!("telemetry flush timer stopped");
        })
    }

    async fn persist_record(
        &self,
        record: &TelemetryRecord,
    ) -> Result<(), crate::store::StoreError> {
        self.store.append_location(record).await?;

        let update = DeviceStatusUpdate {
            last_location: Some(record.clone()),
            ..Default::default()
        };
        self.store
            .upsert_device_status(&record.device_id, update)
            .await
    }

    /// Liveness refresh issued for every inbound frame
    async fn touch_device(&self, device_id: &str, battery: Option<u8>, signal: Option<i32>) {
        let update = DeviceStatusUpdate {
            connectivity: Some(ConnectivityStatus::Online),
            last_seen: Some(Utc::now()),
            battery,
            signal,
            ..Default::default()
        };
        if let Err(e) = self.store.upsert_device_status(device_id, update).await {
            warn!(%device_id, "device liveness upsert failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::testing::RecordingStore;
    use serde_json::json;

    fn batcher(store: Arc<RecordingStore>) -> Arc<TelemetryBatcher<RecordingStore>> {
        // test batch size is 3, flush interval 1s
        let config = TrackerConfig::test_config();
        Arc::new(TelemetryBatcher::new(store, &config.telemetry))
    }

    fn fix(latitude: f64) -> Vec<u8> {
        json!({"latitude": latitude, "longitude": -46.6333, "bateria": 80})
            .to_string()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_location_is_cached_not_written() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", &fix(-23.55)).await;

        assert_eq!(batcher.cache_size().await, 1);
        assert!(store.get_locations().await.is_empty());

        // Liveness was forwarded immediately
        let updates = store.get_device_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "tk-1");
        assert_eq!(updates[0].1.connectivity, Some(ConnectivityStatus::Online));
        assert_eq!(updates[0].1.battery, Some(80));
    }

    #[tokio::test]
    async fn test_batch_size_triggers_immediate_flush() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", &fix(-23.55)).await;
        batcher.ingest_location("tk-2", &fix(-23.56)).await;
        assert!(store.get_locations().await.is_empty());

        batcher.ingest_location("tk-3", &fix(-23.57)).await;

        assert_eq!(batcher.cache_size().await, 0);
        assert_eq!(store.get_locations().await.len(), 3);
    }

    #[tokio::test]
    async fn test_same_device_fixes_coalesce() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", &fix(-23.55)).await;
        batcher.ingest_location("tk-1", &fix(-23.56)).await;
        batcher.ingest_location("tk-1", &fix(-23.57)).await;

        // Three fixes from one device occupy a single cache slot
        assert_eq!(batcher.cache_size().await, 1);

        batcher.flush().await;

        let locations = store.get_locations().await;
        assert_eq!(locations.len(), 1);
        assert!((locations[0].latitude - -23.57).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_flush_writes_history_and_last_location() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", &fix(-23.55)).await;
        store.clear_history().await;
        batcher.flush().await;

        assert_eq!(store.get_locations().await.len(), 1);
        let updates = store.get_device_updates().await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.last_location.is_some());
    }

    #[tokio::test]
    async fn test_flush_on_empty_cache_is_a_no_op() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.flush().await;
        assert!(store.get_locations().await.is_empty());
        assert!(store.get_device_updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_records_survive_for_next_cycle() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", &fix(-23.55)).await;
        store.set_fail_writes(true);
        batcher.flush().await;

        // Write failed, the record went back into the cache
        assert!(store.get_locations().await.is_empty());
        assert_eq!(batcher.cache_size().await, 1);

        store.set_fail_writes(false);
        batcher.flush().await;
        assert_eq!(store.get_locations().await.len(), 1);
        assert_eq!(batcher.cache_size().await, 0);
    }

    #[tokio::test]
    async fn test_reinserted_record_does_not_clobber_fresher_fix() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", &fix(-23.55)).await;
        store.set_fail_writes(true);
        batcher.flush().await;

        // A fresher fix lands while the failed record sits in the cache
        store.set_fail_writes(false);
        batcher.ingest_location("tk-1", &fix(-23.99)).await;
        assert_eq!(batcher.cache_size().await, 1);

        // Another failing flush must keep the fresher fix, not resurrect
        // the stale one
        store.set_fail_writes(true);
        batcher.flush().await;
        store.set_fail_writes(false);
        batcher.flush().await;

        let locations = store.get_locations().await;
        assert_eq!(locations.len(), 1);
        assert!((locations[0].latitude - -23.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_status_updates_bypass_the_cache() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        let payload = json!({"status": "offline", "sinal": -90}).to_string();
        batcher.ingest_status("tk-1", payload.as_bytes()).await;

        assert_eq!(batcher.cache_size().await, 0);
        let updates = store.get_device_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.connectivity, Some(ConnectivityStatus::Offline));
        assert_eq!(updates[0].1.signal, Some(-90));
    }

    #[tokio::test]
    async fn test_status_without_field_defaults_online() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_status("tk-1", b"{}").await;

        let updates = store.get_device_updates().await;
        assert_eq!(updates[0].1.connectivity, Some(ConnectivityStatus::Online));
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_dropped() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        batcher.ingest_location("tk-1", b"not json").await;
        batcher.ingest_location("tk-1", b"{\"latitude\": 1.0}").await;
        batcher.ingest_status("tk-1", b"[1, 2]").await;

        assert_eq!(batcher.cache_size().await, 0);
        assert!(store.get_device_updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_timer_drains_the_cache() {
        let store = Arc::new(RecordingStore::new());
        // 1s interval from the test config
        let batcher = batcher(Arc::clone(&store));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = batcher.spawn_flush_timer(shutdown_rx);

        batcher.ingest_location("tk-1", &fix(-23.55)).await;

        tokio::time::timeout(Duration::from_secs(3), async {
            while store.get_locations().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timer flush never happened");

        assert_eq!(batcher.cache_size().await, 0);

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), timer).await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_drain() {
        let store = Arc::new(RecordingStore::new());
        let batcher = batcher(Arc::clone(&store));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = batcher.spawn_flush_timer(shutdown_rx);

        batcher.ingest_location("tk-1", &fix(-23.55)).await;
        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), timer).await;

        assert_eq!(store.get_locations().await.len(), 1);
    }
}
