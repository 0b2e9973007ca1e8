//! Ingestion client: the orchestrating component of the pipeline
//!
//! Accepts consent-checked events from producers, persists them through the
//! event store, and drives batched delivery. Every enqueue is durable before
//! the call returns; flushes are single-flight and never block producers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::PipelineConfig;
use crate::consent::ConsentProvider;
use crate::db::EventStore;
use crate::error::{Error, Result};
use crate::types::{CaptureEvent, ClientState, StoreOutcome, UploadStats};

use super::queue::QueueManager;
use super::uploader::Uploader;

/// Orchestrates enqueue, batching, and delivery
pub struct IngestClient {
    store: Arc<EventStore>,
    queue: QueueManager,
    uploader: Option<Uploader>,
    consent: Arc<dyn ConsentProvider>,
    config: PipelineConfig,
    /// Upload axis of the state machine (Idle/Uploading/Error)
    state: Mutex<ClientState>,
    /// Single-flight gate: a second flush while uploading is a no-op
    flush_gate: tokio::sync::Mutex<()>,
    /// In-memory mirror of the undelivered count
    pending_mirror: AtomicUsize,
    /// Paused axis, independent of the upload state
    paused: AtomicBool,
    /// In-memory view of the persisted delivery stats
    stats: Mutex<UploadStats>,
}

impl IngestClient {
    /// Build a client over an opened, migrated store.
    ///
    /// `uploader` may be None (uploads disabled): events still persist and
    /// flushes become no-ops.
    pub fn new(
        store: Arc<EventStore>,
        uploader: Option<Uploader>,
        consent: Arc<dyn ConsentProvider>,
        config: PipelineConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pending = store.pending_count()?;
        let stats = store.get_stats()?;
        let queue = QueueManager::new(store.clone(), config.clone());

        Ok(Arc::new(Self {
            store,
            queue,
            uploader,
            consent,
            config,
            state: Mutex::new(ClientState::Idle),
            flush_gate: tokio::sync::Mutex::new(()),
            pending_mirror: AtomicUsize::new(pending),
            paused: AtomicBool::new(false),
            stats: Mutex::new(stats),
        }))
    }

    /// Accept one event from a producer.
    ///
    /// Consent is checked before anything is persisted; denial means the
    /// event never existed as far as the pipeline is concerned. At capacity,
    /// one synchronous flush is attempted before giving up with QueueFull.
    pub async fn enqueue(self: &Arc<Self>, event: CaptureEvent) -> Result<StoreOutcome> {
        let modality = event.modality();
        if !self.consent.is_permitted(modality) {
            tracing::debug!(
                modality = modality.as_str(),
                source_tag = %event.source_tag,
                "Event rejected: consent not granted"
            );
            return Err(Error::ConsentDenied(modality.as_str().to_string()));
        }

        if self.pending_mirror.load(Ordering::SeqCst) >= self.config.max_queue_size {
            // Last resort before rejecting: try to make room now
            self.flush().await?;
            let pending = self.store.pending_count()?;
            self.pending_mirror.store(pending, Ordering::SeqCst);
            if pending >= self.config.max_queue_size {
                return Err(Error::QueueFull(pending));
            }
        }

        let outcome = self.store.store(&event, Utc::now())?;

        if outcome == StoreOutcome::Inserted {
            let pending = self.pending_mirror.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(
                source_tag = %event.source_tag,
                pending,
                "Event queued"
            );

            if pending >= self.config.batch_size {
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = client.flush().await {
                        tracing::warn!(error = %e, "Background flush failed");
                    }
                });
            }
        }

        Ok(outcome)
    }

    /// Upload pending events in batches until fewer than a full batch
    /// remains.
    ///
    /// Returns true if at least one batch was delivered. A flush already in
    /// flight makes this call a no-op returning false. Delivery failure
    /// records a retry against every event in the failed batch, moves the
    /// client to the Error state, and returns false; the events stay queued
    /// for the next scheduled attempt.
    pub async fn flush(self: &Arc<Self>) -> Result<bool> {
        let _gate = match self.flush_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Flush already in flight");
                return Ok(false);
            }
        };

        let uploader = match &self.uploader {
            Some(u) => u,
            None => {
                tracing::debug!("Uploader disabled; leaving events queued");
                return Ok(false);
            }
        };

        let mut uploaded_any = false;

        loop {
            let now = Utc::now();
            let batch = self.queue.get_pending_events(self.config.batch_size, now)?;
            if batch.is_empty() {
                self.set_state(ClientState::Idle);
                break;
            }

            self.set_state(ClientState::Uploading);
            let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();

            match uploader.upload_batch(&batch).await {
                Ok(()) => {
                    let now = Utc::now();
                    self.queue.mark_batch_processed(&ids, now)?;
                    let remaining = self.store.pending_count()?;
                    self.store.record_upload(ids.len(), remaining, now)?;
                    self.pending_mirror.store(remaining, Ordering::SeqCst);

                    {
                        let mut stats = self.stats.lock().unwrap();
                        stats.total_uploaded += ids.len() as i64;
                        stats.last_upload_at = Some(now);
                        stats.pending_after_last_flush = remaining as i64;
                    }

                    tracing::info!(
                        uploaded = ids.len(),
                        remaining,
                        "Batch delivered"
                    );
                    uploaded_any = true;

                    if remaining >= self.config.batch_size {
                        continue;
                    }
                    self.set_state(ClientState::Idle);
                    break;
                }
                Err(e) => {
                    // Events stay queued; back them off so the next timer
                    // tick does not hammer a failing endpoint
                    self.queue
                        .record_batch_retry_failure(&ids, &e.to_string(), Utc::now())?;
                    self.set_state(ClientState::Error);
                    tracing::warn!(
                        error = %e,
                        batch_size = ids.len(),
                        "Flush failed; events remain queued"
                    );
                    return Ok(false);
                }
            }
        }

        Ok(uploaded_any)
    }

    /// Stop the periodic flush timer. Persisted queue and in-flight state
    /// are unaffected.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Pipeline paused");
    }

    /// Restart the periodic flush timer
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("Pipeline resumed");
    }

    /// Whether the periodic timer is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Current upload state
    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// Delivery statistics (persisted across restarts)
    pub fn stats(&self) -> UploadStats {
        self.stats.lock().unwrap().clone()
    }

    /// In-memory view of the undelivered count
    pub fn pending_count(&self) -> usize {
        self.pending_mirror.load(Ordering::SeqCst)
    }

    /// Maintenance access for the scheduler
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{AllowAll, StaticConsent};
    use crate::pipeline::uploader::{ScriptedTransport, TransportReply};
    use crate::types::{Modality, PrivacyScope};
    use chrono::{DateTime, Duration, TimeZone};

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

    fn test_store() -> Arc<EventStore> {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        store
    }

    fn client_with_script(
        config: PipelineConfig,
        replies: Vec<crate::error::Result<TransportReply>>,
    ) -> (Arc<IngestClient>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let uploader = Uploader::with_transport(transport.clone(), "device-1", 3);
        let client = IngestClient::new(
            test_store(),
            Some(uploader),
            Arc::new(AllowAll),
            config,
        )
        .unwrap();
        (client, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_denied_never_persists() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let uploader = Uploader::with_transport(transport, "device-1", 3);
        let consent = StaticConsent::new(vec![Modality::Scroll]);
        let client = IngestClient::new(
            test_store(),
            Some(uploader),
            Arc::new(consent),
            PipelineConfig::default(),
        )
        .unwrap();

        let err = client.enqueue(make_event("evt-1", 0)).await.unwrap_err();
        assert!(matches!(err, Error::ConsentDenied(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_dedups() {
        let (client, _) = client_with_script(PipelineConfig::default(), vec![]);

        assert_eq!(
            client.enqueue(make_event("evt-1", 0)).await.unwrap(),
            StoreOutcome::Inserted
        );
        assert_eq!(
            client.enqueue(make_event("evt-1", 0)).await.unwrap(),
            StoreOutcome::DuplicateSkipped
        );
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drains_in_occurrence_order() {
        // Scenario: 10 events, batch_size 5 - two batches, queue empty after
        let config = PipelineConfig {
            batch_size: 5,
            ..Default::default()
        };
        let (client, transport) = client_with_script(config, vec![]);

        for i in 0..10 {
            client
                .enqueue(make_event(&format!("evt-{}", i), i))
                .await
                .unwrap();
        }

        let uploaded = client.flush().await.unwrap();
        assert!(uploaded);
        assert!(transport.calls() >= 2, "two batches expected");
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().total_uploaded, 10);
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_transient_failures_then_success() {
        // 503 twice then 200, within the uploader's 3 attempts
        let config = PipelineConfig {
            batch_size: 5,
            ..Default::default()
        };
        let (client, _) = client_with_script(
            config,
            vec![
                ScriptedTransport::reply(503),
                ScriptedTransport::reply(503),
                ScriptedTransport::reply(200),
            ],
        );

        client.enqueue(make_event("evt-1", 0)).await.unwrap();
        assert!(client.flush().await.unwrap());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().total_uploaded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_failure_leaves_events_and_backs_off() {
        let config = PipelineConfig {
            batch_size: 5,
            ..Default::default()
        };
        let (client, _) =
            client_with_script(config, vec![ScriptedTransport::reply(400)]);

        client.enqueue(make_event("evt-1", 0)).await.unwrap();
        assert!(!client.flush().await.unwrap());
        assert_eq!(client.state(), ClientState::Error);
        assert_eq!(client.pending_count(), 1);

        // The failed batch was backed off: not due right now
        let due = client.queue().get_pending_events(10, Utc::now()).unwrap();
        assert!(due.is_empty(), "failed events should be backing off");

        // Still pending, and due again once the backoff expires
        let due = client
            .queue()
            .get_pending_events(10, Utc::now() + Duration::days(1))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);
        assert!(due[0].last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_disabled_uploader_is_noop() {
        let client = IngestClient::new(
            test_store(),
            None,
            Arc::new(AllowAll),
            PipelineConfig::default(),
        )
        .unwrap();

        client.enqueue(make_event("evt-1", 0)).await.unwrap();
        assert!(!client.flush().await.unwrap());
        assert_eq!(client.pending_count(), 1, "events stay queued locally");
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects_after_failed_flush() {
        let config = PipelineConfig {
            batch_size: 2,
            max_queue_size: 3,
            ..Default::default()
        };
        // Every upload attempt fails permanently
        let (client, _) = client_with_script(
            config,
            vec![
                ScriptedTransport::reply(400),
                ScriptedTransport::reply(400),
                ScriptedTransport::reply(400),
                ScriptedTransport::reply(400),
            ],
        );

        for i in 0..3 {
            client
                .enqueue(make_event(&format!("evt-{}", i), i))
                .await
                .unwrap();
        }

        let err = client.enqueue(make_event("evt-9", 9)).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull(3)));
        assert_eq!(client.pending_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_axis() {
        let (client, _) = client_with_script(PipelineConfig::default(), vec![]);

        assert!(!client.is_paused());
        client.pause();
        assert!(client.is_paused());
        // Pausing does not touch the upload state or the queue
        assert_eq!(client.state(), ClientState::Idle);
        client.resume();
        assert!(!client.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_survive_restart() {
        let store = test_store();
        let config = PipelineConfig {
            batch_size: 5,
            ..Default::default()
        };

        {
            let transport = Arc::new(ScriptedTransport::new(vec![]));
            let uploader = Uploader::with_transport(transport, "device-1", 3);
            let client = IngestClient::new(
                store.clone(),
                Some(uploader),
                Arc::new(AllowAll),
                config.clone(),
            )
            .unwrap();

            client.enqueue(make_event("evt-1", 0)).await.unwrap();
            client.flush().await.unwrap();
            assert_eq!(client.stats().total_uploaded, 1);
        }

        // A fresh client over the same store sees the persisted stats
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let uploader = Uploader::with_transport(transport, "device-1", 3);
        let client =
            IngestClient::new(store, Some(uploader), Arc::new(AllowAll), config).unwrap();
        assert_eq!(client.stats().total_uploaded, 1);
    }
}
