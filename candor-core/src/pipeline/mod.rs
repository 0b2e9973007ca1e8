//! Store-and-forward delivery pipeline
//!
//! Producers hand events to the [`IngestClient`]; the [`QueueManager`]
//! keeps the persistent queue healthy; the [`Uploader`] speaks to the
//! collector; the [`Scheduler`] ties it all to timers and the host
//! application lifecycle.

pub mod client;
pub mod queue;
pub mod scheduler;
pub mod uploader;

pub use client::IngestClient;
pub use queue::{MaintenanceReport, QueueManager};
pub use scheduler::{Scheduler, WindowOutcome};
pub use uploader::{BatchTransport, HttpTransport, ScriptedTransport, TransportReply, Uploader};
