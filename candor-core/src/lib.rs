//! # candor-core
//!
//! Core library for candor - a consent-gated capture event pipeline.
//!
//! This library provides:
//! - Domain types for capture events, modalities, and privacy scopes
//! - A durable SQLite-backed event queue with idempotent storage
//! - Batched delivery to a collector with retry and backoff
//! - Consent gating ahead of persistence
//! - Scheduling and host-lifecycle integration
//!
//! ## Architecture
//!
//! Events flow through three stages:
//! - **Capture:** Producers build [`CaptureEvent`]s and hand them to the
//!   [`IngestClient`]; consent is checked and the event is persisted before
//!   the call returns
//! - **Queue:** The [`EventStore`] holds events durably, deduplicated by
//!   idempotency key, until delivery is confirmed
//! - **Delivery:** The [`pipeline::Uploader`] ships batches to the
//!   collector; confirmed events are tombstoned, failures back off and
//!   retry
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use candor_core::{Config, EventStore, IngestClient};
//! use candor_core::consent::AllowAll;
//! use candor_core::pipeline::Uploader;
//!
//! # fn main() -> candor_core::Result<()> {
//! let config = Config::load().expect("failed to load config");
//!
//! let store = Arc::new(EventStore::open(&Config::database_path())?);
//! store.migrate()?;
//!
//! let uploader = Uploader::new(&config.uploader)?;
//! let client = IngestClient::new(store, uploader, Arc::new(AllowAll), config.pipeline)?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use consent::ConsentProvider;
pub use db::EventStore;
pub use error::{Error, Result};
pub use pipeline::{IngestClient, Scheduler};
pub use types::*;

// Public modules
pub mod config;
pub mod consent;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod types;
