//! Integration tests for the candor ingestion pipeline
//!
//! These tests run the full enqueue/flush/maintenance flow over a real
//! SQLite file in a temp directory, with a scripted transport standing in
//! for the collector.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use async_trait::async_trait;
use candor_core::config::PipelineConfig;
use candor_core::consent::{AllowAll, StaticConsent};
use candor_core::db::EventStore;
use candor_core::pipeline::{
    BatchTransport, IngestClient, ScriptedTransport, TransportReply, Uploader,
};
use candor_core::types::{CaptureEvent, Modality, PrivacyScope, StoreOutcome};
use candor_core::{Error, Result};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn make_event(identity: &str, offset_secs: i64) -> CaptureEvent {
    CaptureEvent {
        identity: identity.to_string(),
        event_type: "key_burst".to_string(),
        occurred_at: t0() + Duration::seconds(offset_secs),
        payload: identity.as_bytes().to_vec(),
        source_tag: "keystroke".to_string(),
        privacy_scope: PrivacyScope::Shared,
        consent_version: 1,
    }
}

fn open_store(dir: &TempDir) -> Arc<EventStore> {
    let store = Arc::new(EventStore::open(&dir.path().join("queue.db")).unwrap());
    store.migrate().unwrap();
    store
}

fn build_client(
    store: Arc<EventStore>,
    transport: Arc<dyn BatchTransport>,
    config: PipelineConfig,
) -> Arc<IngestClient> {
    let uploader = Uploader::with_transport(transport, "device-1", 3);
    IngestClient::new(store, Some(uploader), Arc::new(AllowAll), config).unwrap()
}

/// Transport that records the idempotency keys of every batch it receives,
/// in order, and acknowledges everything with 200.
struct RecordingTransport {
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchTransport for RecordingTransport {
    async fn send(
        &self,
        request: &candor_core::pipeline::uploader::BatchRequest,
    ) -> Result<TransportReply> {
        let keys: Vec<String> = request
            .events
            .iter()
            .map(|e| e.idempotency_key.clone())
            .collect();
        self.batches.lock().unwrap().push(keys);
        Ok(TransportReply {
            status: 200,
            body: String::new(),
        })
    }
}

// ============================================
// Durability and Idempotency
// ============================================

#[tokio::test(start_paused = true)]
async fn test_events_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 100,
        ..Default::default()
    };

    // First process: enqueue without delivering
    {
        let store = open_store(&dir);
        let client = IngestClient::new(
            store,
            None,
            Arc::new(AllowAll),
            config.clone(),
        )
        .unwrap();
        for i in 0..5 {
            client
                .enqueue(make_event(&format!("evt-{}", i), i))
                .await
                .unwrap();
        }
        assert_eq!(client.pending_count(), 5);
    }

    // Second process: events are still there and get delivered
    let store = open_store(&dir);
    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let client = build_client(store, transport, config);
    assert_eq!(client.pending_count(), 5);

    assert!(client.flush().await.unwrap());
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.stats().total_uploaded, 5);
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_after_restart_is_deduped() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 100,
        ..Default::default()
    };

    {
        let store = open_store(&dir);
        let client =
            IngestClient::new(store, None, Arc::new(AllowAll), config.clone()).unwrap();
        client.enqueue(make_event("evt-1", 0)).await.unwrap();
    }

    // A crashed producer re-submits the same event on the next run
    let store = open_store(&dir);
    let client = IngestClient::new(store, None, Arc::new(AllowAll), config).unwrap();
    assert_eq!(
        client.enqueue(make_event("evt-1", 0)).await.unwrap(),
        StoreOutcome::DuplicateSkipped
    );
    assert_eq!(client.pending_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tombstone_dedups_after_delivery_and_restart() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 5,
        ..Default::default()
    };

    {
        let store = open_store(&dir);
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let client = build_client(store, transport, config.clone());
        client.enqueue(make_event("evt-1", 0)).await.unwrap();
        assert!(client.flush().await.unwrap());
        assert_eq!(client.pending_count(), 0);
    }

    // Delivered and gone from the queue, but the tombstone still rejects
    // a replay in a later process
    let store = open_store(&dir);
    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let client = build_client(store, transport, config);
    assert_eq!(
        client.enqueue(make_event("evt-1", 0)).await.unwrap(),
        StoreOutcome::DuplicateSkipped
    );
    assert_eq!(client.pending_count(), 0);
}

// ============================================
// Delivery Ordering and Batching
// ============================================

#[tokio::test(start_paused = true)]
async fn test_delivery_preserves_occurrence_order() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 4,
        ..Default::default()
    };
    let store = open_store(&dir);
    let transport = Arc::new(RecordingTransport::new());
    let client = build_client(store.clone(), transport.clone(), config);

    // Persist out of occurrence order, straight through the store so no
    // size-triggered flush interleaves with the setup
    let offsets = [7, 2, 9, 0, 5, 3, 8, 1, 6, 4];
    let mut expected: Vec<(i64, String)> = Vec::new();
    for (i, offset) in offsets.iter().enumerate() {
        let event = make_event(&format!("evt-{}", i), *offset);
        expected.push((*offset, event.idempotency_key()));
        store.store(&event, Utc::now()).unwrap();
    }
    expected.sort_by_key(|(offset, _)| *offset);
    let expected: Vec<String> = expected.into_iter().map(|(_, key)| key).collect();

    // First flush delivers full batches (4 + 4); the 2-event tail waits for
    // the next call
    client.flush().await.unwrap();
    client.flush().await.unwrap();

    let delivered: Vec<String> = transport.batches().into_iter().flatten().collect();
    assert_eq!(delivered, expected, "wire order must follow occurred_at");
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_within_call() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 5,
        ..Default::default()
    };
    let store = open_store(&dir);
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::reply(503),
        ScriptedTransport::reply(429),
        ScriptedTransport::reply(200),
    ]));
    let client = build_client(store, transport.clone(), config);

    client.enqueue(make_event("evt-1", 0)).await.unwrap();
    assert!(client.flush().await.unwrap());
    assert_eq!(transport.calls(), 3);
    assert_eq!(client.pending_count(), 0);
}

// ============================================
// Failure Handling and Backoff
// ============================================

#[tokio::test(start_paused = true)]
async fn test_failed_batch_backs_off_and_stays_queued() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 5,
        retry_base_secs: 60,
        retry_cap_secs: 3600,
        ..Default::default()
    };
    let store = open_store(&dir);
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::reply(400)]));
    let client = build_client(store, transport, config);

    client.enqueue(make_event("evt-1", 0)).await.unwrap();
    assert!(!client.flush().await.unwrap());
    assert_eq!(client.pending_count(), 1);

    // Still backing off: an immediate flush finds nothing due
    assert!(!client.flush().await.unwrap());
    assert_eq!(client.pending_count(), 1);

    // The event is still pending and becomes due once the window passes
    let due = client
        .queue()
        .get_pending_events(10, Utc::now() + Duration::hours(1))
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].retry_count, 1);
    assert!(due[0].last_error.as_deref().unwrap_or("").contains("400"));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_per_failure() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 5,
        retry_base_secs: 60,
        retry_cap_secs: 3600,
        ..Default::default()
    };
    let store = open_store(&dir);
    let client = build_client(
        store.clone(),
        Arc::new(ScriptedTransport::new(vec![])),
        config.clone(),
    );

    client.enqueue(make_event("evt-1", 0)).await.unwrap();
    let id = store.get_pending_events(1, Utc::now()).unwrap()[0].id;

    let mut windows = Vec::new();
    for _ in 0..4 {
        let before = Utc::now();
        client
            .queue()
            .record_batch_retry_failure(&[id], "HTTP 503", before)
            .unwrap();
        // Find how far out the event was pushed
        let row = store
            .get_pending_events(1, before + Duration::days(30))
            .unwrap();
        let next = row[0].next_retry_at.unwrap();
        windows.push((next - before).num_seconds());
    }

    // 60, 120, 240, 480: doubling per recorded failure
    assert!(
        windows.windows(2).all(|w| w[1] >= w[0] * 2),
        "backoff must grow: {:?}",
        windows
    );
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_drops_poison_events() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 5,
        max_retries: 3,
        ..Default::default()
    };
    let store = open_store(&dir);
    let client = build_client(
        store.clone(),
        Arc::new(ScriptedTransport::new(vec![])),
        config,
    );

    client.enqueue(make_event("poison", 0)).await.unwrap();
    let id = store.get_pending_events(1, Utc::now()).unwrap()[0].id;
    for _ in 0..3 {
        client
            .queue()
            .record_batch_retry_failure(&[id], "HTTP 500", Utc::now())
            .unwrap();
    }

    let report = client.queue().run_maintenance(Utc::now()).unwrap();
    assert_eq!(report.failed_dropped, 1);
    assert_eq!(client.queue().pending_count().unwrap(), 0);
}

// ============================================
// Capacity and Consent
// ============================================

#[tokio::test(start_paused = true)]
async fn test_queue_capacity_is_bounded() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        batch_size: 2,
        max_queue_size: 4,
        ..Default::default()
    };
    let store = open_store(&dir);
    // Uploads permanently fail, so the queue cannot drain
    let transport = Arc::new(ScriptedTransport::new(
        (0..20).map(|_| ScriptedTransport::reply(400)).collect(),
    ));
    let client = build_client(store, transport, config);

    for i in 0..4 {
        client
            .enqueue(make_event(&format!("evt-{}", i), i))
            .await
            .unwrap();
    }

    let err = client.enqueue(make_event("evt-over", 99)).await.unwrap_err();
    assert!(matches!(err, Error::QueueFull(_)));
    assert_eq!(client.pending_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_consent_gating_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let uploader = Uploader::with_transport(
        Arc::new(ScriptedTransport::new(vec![])),
        "device-1",
        3,
    );
    let consent = StaticConsent::new(vec![Modality::Keystroke]);
    let client = IngestClient::new(
        store.clone(),
        Some(uploader),
        Arc::new(consent),
        PipelineConfig::default(),
    )
    .unwrap();

    // Keystroke is permitted
    client.enqueue(make_event("evt-1", 0)).await.unwrap();

    // Audio is not; nothing reaches the store
    let mut denied = make_event("evt-2", 1);
    denied.source_tag = "audio.mic".to_string();
    let err = client.enqueue(denied).await.unwrap_err();
    assert!(matches!(err, Error::ConsentDenied(_)));

    assert_eq!(store.total_count().unwrap(), 1);
}
