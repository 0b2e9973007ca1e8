//! Batched delivery to the collector
//!
//! One batch, one POST. Transient failures (429, 5xx, transport errors) are
//! retried in-call with a linear backoff, bounded by `max_attempts`; any
//! other non-2xx is a permanent batch failure raised to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::UploaderConfig;
use crate::error::{Error, Result};
use crate::types::QueuedEvent;

/// Statuses worth another attempt
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Seconds multiplied by the attempt number between in-call retries
const RETRY_STEP_SECS: u64 = 2;

/// Check if a response status is a transient failure
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Wire envelope for one batch upload
#[derive(Debug, Serialize)]
pub struct BatchRequest {
    /// Unique batch ID
    pub batch_id: String,
    /// Stable device identifier
    pub device_id: String,
    /// When this batch was assembled
    pub created_at: DateTime<Utc>,
    /// Events in the batch
    pub events: Vec<WireEvent>,
}

/// One event on the wire
#[derive(Debug, Serialize)]
pub struct WireEvent {
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub source_tag: String,
    pub privacy_scope: String,
    pub consent_version: i64,
    pub idempotency_key: String,
    /// Opaque payload bytes, hex-encoded
    pub payload: String,
}

impl WireEvent {
    fn from_queued(event: &QueuedEvent) -> Self {
        WireEvent {
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            source_tag: event.source_tag.clone(),
            privacy_scope: event.privacy_scope.as_str().to_string(),
            consent_version: event.consent_version,
            idempotency_key: event.idempotency_key.clone(),
            payload: hex::encode(&event.payload),
        }
    }
}

/// What the transport saw from the server
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// HTTP status code
    pub status: u16,
    /// Response body (best-effort, for error messages)
    pub body: String,
}

/// Seam between the retry loop and the actual HTTP call.
///
/// Transport-level failures (connect, timeout) are returned as transient
/// upload errors; any received response becomes a [`TransportReply`].
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, request: &BatchRequest) -> Result<TransportReply>;
}

/// reqwest-backed transport posting to `{server_url}/ingest/batches`
pub struct HttpTransport {
    http_client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Build a transport from configuration.
    ///
    /// Returns an error if the configuration is invalid or missing required
    /// fields.
    pub fn new(config: &UploaderConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .server_url
            .clone()
            .ok_or_else(|| Error::Config("uploader.server_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        // Build default headers
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        if let Some(device_id) = &config.device_id {
            headers.insert(
                "X-Device-ID",
                HeaderValue::from_str(device_id)
                    .map_err(|e| Error::Config(format!("invalid device_id: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: format!("{}/ingest/batches", base_url),
        })
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn send(&self, request: &BatchRequest) -> Result<TransportReply> {
        // An unencodable batch is a bug, not a network condition; fail the
        // batch permanently instead of retrying it
        let body = serde_json::to_vec(request)
            .map_err(|e| Error::Serialization(format!("failed to encode batch: {}", e)))?;

        let response = self
            .http_client
            .post(&self.url)
            .body(body)
            .send()
            .await
            // Timeouts and connection failures are retryable
            .map_err(|e| Error::transient_upload(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(TransportReply { status, body })
    }
}

/// Performs one batched delivery call with bounded in-call retries
pub struct Uploader {
    transport: Arc<dyn BatchTransport>,
    device_id: String,
    max_attempts: u32,
}

impl Uploader {
    /// Create an uploader from configuration.
    ///
    /// Returns None if the uploader is not enabled or not fully configured;
    /// the pipeline then queues locally without delivering.
    pub fn new(config: &UploaderConfig) -> Result<Option<Self>> {
        if !config.is_ready() {
            return Ok(None);
        }

        let transport = Arc::new(HttpTransport::new(config)?);
        let device_id = config
            .device_id
            .clone()
            .ok_or_else(|| Error::Config("uploader.device_id is required".to_string()))?;

        Ok(Some(Self {
            transport,
            device_id,
            max_attempts: config.max_attempts,
        }))
    }

    /// Create an uploader over an explicit transport (tests, embedding)
    pub fn with_transport(
        transport: Arc<dyn BatchTransport>,
        device_id: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            device_id: device_id.into(),
            max_attempts,
        }
    }

    /// Deliver one batch.
    ///
    /// Ok means the collector acknowledged every event in the batch. Any
    /// error means the whole batch stays queued; the caller decides what to
    /// record against the events.
    pub async fn upload_batch(&self, events: &[QueuedEvent]) -> Result<()> {
        let request = BatchRequest {
            batch_id: uuid::Uuid::new_v4().to_string(),
            device_id: self.device_id.clone(),
            created_at: Utc::now(),
            events: events.iter().map(WireEvent::from_queued).collect(),
        };

        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = Duration::from_secs(u64::from(attempt - 1) * RETRY_STEP_SECS);
                tracing::debug!(
                    batch_id = %request.batch_id,
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_secs = delay.as_secs(),
                    "Retrying batch upload"
                );
                tokio::time::sleep(delay).await;
            }

            match self.transport.send(&request).await {
                Ok(reply) if (200..300).contains(&reply.status) => {
                    tracing::debug!(
                        batch_id = %request.batch_id,
                        events = events.len(),
                        "Batch delivered"
                    );
                    return Ok(());
                }
                Ok(reply) if is_retryable_status(reply.status) => {
                    tracing::warn!(
                        batch_id = %request.batch_id,
                        status = reply.status,
                        attempt,
                        "Transient server error"
                    );
                    last_error = Some(Error::transient_upload(format!(
                        "API error ({}): {}",
                        reply.status, reply.body
                    )));
                }
                Ok(reply) => {
                    // Non-retryable status: abandon the batch for this attempt
                    return Err(Error::permanent_upload(format!(
                        "API error ({}): {}",
                        reply.status, reply.body
                    )));
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        batch_id = %request.batch_id,
                        attempt,
                        error = %e,
                        "Transport error"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::permanent_upload(format!(
            "retries exhausted after {} attempts: {}",
            self.max_attempts, last
        )))
    }
}

/// Transport replaying a scripted sequence of replies.
///
/// Used by the test suites to exercise delivery paths without a server.
/// Once the script is exhausted, every further call succeeds with 200.
pub struct ScriptedTransport {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<TransportReply>>>,
    calls: std::sync::Mutex<usize>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<TransportReply>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            calls: std::sync::Mutex::new(0),
        }
    }

    /// Shorthand for a reply with the given status and empty body
    pub fn reply(status: u16) -> Result<TransportReply> {
        Ok(TransportReply {
            status,
            body: String::new(),
        })
    }

    /// Number of send calls observed so far
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl BatchTransport for ScriptedTransport {
    async fn send(&self, _request: &BatchRequest) -> Result<TransportReply> {
        *self.calls.lock().unwrap() += 1;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TransportReply {
                status: 200,
                body: String::new(),
            }))
    }
}
