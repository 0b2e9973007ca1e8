//! Database layer for candor
//!
//! This module provides the durable queue using SQLite with:
//! - Schema migrations
//! - A single serialized writer over the queue and tombstone tables
//! - Range queries by timestamp for pending-event scans

pub mod schema;
pub mod store;

pub use store::{EventStore, RetryPolicy};
