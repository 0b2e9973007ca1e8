//! Consent gating for the ingestion pipeline
//!
//! The pipeline never decides consent itself; it asks an external
//! [`ConsentProvider`] whether a modality is currently permitted before any
//! event is persisted. Denial is final for that call: the event is not
//! queued "for later".

use crate::types::Modality;

/// Boolean permission query per data modality.
///
/// Implemented by the host application's policy engine. The query is
/// consulted synchronously on every enqueue, so implementations should be
/// cheap (a cached policy lookup, not a network call).
pub trait ConsentProvider: Send + Sync {
    /// Whether collection of the given modality is currently permitted
    fn is_permitted(&self, modality: Modality) -> bool;
}

/// Permits every modality. For tests and trusted embedding contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConsentProvider for AllowAll {
    fn is_permitted(&self, _modality: Modality) -> bool {
        true
    }
}

/// Fixed allow-list of modalities.
#[derive(Debug, Clone, Default)]
pub struct StaticConsent {
    permitted: Vec<Modality>,
}

impl StaticConsent {
    /// Build a provider permitting exactly the given modalities
    pub fn new(permitted: impl Into<Vec<Modality>>) -> Self {
        Self {
            permitted: permitted.into(),
        }
    }
}

impl ConsentProvider for StaticConsent {
    fn is_permitted(&self, modality: Modality) -> bool {
        self.permitted.contains(&modality)
    }
}
