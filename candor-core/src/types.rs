//! Core domain types for candor
//!
//! These types model the store-and-forward pipeline: a capture source hands
//! the pipeline a [`CaptureEvent`], which is persisted as a [`QueuedEvent`]
//! until a batch upload delivers it to the collector.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **CaptureEvent** | The immutable unit of data produced by a capture source |
//! | **QueuedEvent** | A capture event persisted in the local queue, with delivery state |
//! | **Modality** | A category of collection gated by user consent (keystrokes, audio, ...) |
//! | **Idempotency key** | Stable identifier making repeated delivery of the same logical event a no-op |
//! | **Batch** | Bounded set of events uploaded together in one network call |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================
// Privacy and consent
// ============================================

/// Privacy scope attached to an event at capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyScope {
    /// Never leaves the device without explicit per-event consent
    Private,
    /// Visible to the account owner's own devices/services
    Shared,
    /// Aggregable without restriction
    Public,
}

impl PrivacyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyScope::Private => "private",
            PrivacyScope::Shared => "shared",
            PrivacyScope::Public => "public",
        }
    }
}

impl std::str::FromStr for PrivacyScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(PrivacyScope::Private),
            "shared" => Ok(PrivacyScope::Shared),
            "public" => Ok(PrivacyScope::Public),
            _ => Err(format!("unknown privacy scope: {}", s)),
        }
    }
}

/// A category of data collection gated by user permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Keystroke,
    Clipboard,
    Scroll,
    Motion,
    Form,
    Audio,
    Video,
    Gaze,
    /// Source tag did not map to a known modality
    Unknown,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Keystroke => "keystroke",
            Modality::Clipboard => "clipboard",
            Modality::Scroll => "scroll",
            Modality::Motion => "motion",
            Modality::Form => "form",
            Modality::Audio => "audio",
            Modality::Video => "video",
            Modality::Gaze => "gaze",
            Modality::Unknown => "unknown",
        }
    }

    /// Map a capture source tag to its consent modality.
    ///
    /// Source tags are `<modality>` or `<modality>.<detail>` strings
    /// assigned by the capture components (e.g. `keystroke.ime`).
    pub fn from_source_tag(tag: &str) -> Self {
        let head = tag.split('.').next().unwrap_or(tag);
        match head {
            "keystroke" => Modality::Keystroke,
            "clipboard" => Modality::Clipboard,
            "scroll" => Modality::Scroll,
            "motion" => Modality::Motion,
            "form" => Modality::Form,
            "audio" => Modality::Audio,
            "video" => Modality::Video,
            "gaze" => Modality::Gaze,
            _ => Modality::Unknown,
        }
    }
}

// ============================================
// Events
// ============================================

/// An event as produced by a capture source.
///
/// The payload is opaque to the pipeline; it carries its own internal
/// schema-version field that this subsystem does not track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Producer-assigned stable identity for the logical event
    pub identity: String,
    /// Event type (e.g. "key_burst", "clip_copy")
    pub event_type: String,
    /// When the event occurred at the source
    pub occurred_at: DateTime<Utc>,
    /// Opaque, pre-serialized payload bytes
    pub payload: Vec<u8>,
    /// Which capture component produced this event
    pub source_tag: String,
    /// Privacy scope at capture time
    pub privacy_scope: PrivacyScope,
    /// Consent policy version in effect when the event was captured
    pub consent_version: i64,
}

impl CaptureEvent {
    /// Consent modality this event falls under
    pub fn modality(&self) -> Modality {
        Modality::from_source_tag(&self.source_tag)
    }

    /// Compute the idempotency key for this event.
    ///
    /// 32-char hex digest of SHA-256 over `identity:event_type:occurred_at`.
    /// The same logical event re-sent by a producer always collides; two
    /// independent events collide only if producers share an identity.
    pub fn idempotency_key(&self) -> String {
        let hash_input = format!(
            "{}:{}:{}",
            self.identity,
            self.event_type,
            self.occurred_at.to_rfc3339()
        );

        let mut hasher = Sha256::new();
        hasher.update(hash_input.as_bytes());
        let result = hasher.finalize();

        // First 16 bytes (32 hex chars)
        hex::encode(&result[..16])
    }
}

/// A persisted event awaiting (or after) delivery
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Row ID
    pub id: i64,
    /// Event type from the capture event
    pub event_type: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// When the event occurred at the source
    pub occurred_at: DateTime<Utc>,
    /// When the event was persisted locally
    pub created_at: DateTime<Utc>,
    /// True once the collector has acknowledged the event
    pub processed: bool,
    /// Which capture component produced this event
    pub source_tag: String,
    /// Privacy scope at capture time
    pub privacy_scope: PrivacyScope,
    /// Consent policy version at capture time
    pub consent_version: i64,
    /// Unique key for deduplication
    pub idempotency_key: String,
    /// Number of failed delivery attempts recorded against this event
    pub retry_count: i64,
    /// Most recent delivery error, if any
    pub last_error: Option<String>,
    /// Earliest time the event is due for another attempt
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Outcome of persisting a capture event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Event was inserted into the queue
    Inserted,
    /// Idempotency key already known (queued or tombstoned); call was a no-op
    DuplicateSkipped,
}

// ============================================
// Client state and stats
// ============================================

/// Upload axis of the ingestion client state machine.
///
/// `Paused` is tracked separately; pausing stops the periodic timer without
/// touching the upload state or persisted queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No flush in flight
    Idle,
    /// A flush is currently uploading
    Uploading,
    /// The last flush failed; events remain queued for the next attempt
    Error,
}

/// Delivery statistics, persisted across restarts
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    /// Total events acknowledged by the collector
    pub total_uploaded: i64,
    /// When the last successful upload completed
    pub last_upload_at: Option<DateTime<Utc>>,
    /// Events still pending locally after the last flush
    pub pending_after_last_flush: i64,
}
