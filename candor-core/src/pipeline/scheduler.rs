//! Periodic flushing and host-lifecycle integration
//!
//! The scheduler owns the flush timer and the maintenance cadence, and maps
//! host application lifecycle transitions (foreground, background,
//! terminate) onto pipeline operations. The host OS "deferred background
//! execution window" is abstracted as [`Scheduler::run_background_window`]:
//! the embedding app requests the window from its platform and calls this
//! inside it with the granted deadline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use super::client::IngestClient;
use crate::types::ClientState;

/// Outcome of a background execution window, reported to the host before
/// its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Flush ran to completion (possibly with nothing to do)
    Completed,
    /// Flush ran and failed; events remain queued
    Failed,
    /// The deadline arrived first; the pipeline paused cleanly
    Expired,
}

/// Drives periodic flushes and maintenance for an ingestion client
pub struct Scheduler {
    client: Arc<IngestClient>,
    flush_interval: Duration,
    maintenance_interval: Duration,
    shutdown: Arc<tokio::sync::Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        client: Arc<IngestClient>,
        flush_interval: Duration,
        maintenance_interval: Duration,
    ) -> Self {
        Self {
            client,
            flush_interval,
            maintenance_interval,
            shutdown: Arc::new(tokio::sync::Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic timer task. Idempotent: a second start while
    /// running is ignored.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        let client = Arc::clone(&self.client);
        let shutdown = Arc::clone(&self.shutdown);
        let flush_interval = self.flush_interval;
        let maintenance_interval = self.maintenance_interval;

        *handle = Some(tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(flush_interval);
            let mut maintenance_tick = tokio::time::interval(maintenance_interval);
            // The first tick of an interval fires immediately; skip it so
            // starting the scheduler does not trigger an instant flush
            flush_tick.tick().await;
            maintenance_tick.tick().await;

            loop {
                tokio::select! {
                    _ = flush_tick.tick() => {
                        if client.is_paused() {
                            continue;
                        }
                        if let Err(e) = client.flush().await {
                            tracing::warn!(error = %e, "Scheduled flush failed");
                        }
                    }
                    _ = maintenance_tick.tick() => {
                        if let Err(e) = client.queue().run_maintenance(Utc::now()) {
                            tracing::warn!(error = %e, "Maintenance sweep failed");
                        }
                    }
                    _ = shutdown.notified() => {
                        tracing::debug!("Scheduler stopping");
                        break;
                    }
                }
            }
        }));

        tracing::info!(
            flush_interval_secs = flush_interval.as_secs(),
            maintenance_interval_secs = maintenance_interval.as_secs(),
            "Scheduler started"
        );
    }

    /// Stop the timer task and wait for it to exit
    pub async fn stop(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            self.shutdown.notify_one();
            let _ = handle.await;
        }
    }

    /// Host hook: the app returned to the foreground
    pub fn on_foreground(&self) {
        self.client.resume();
    }

    /// Host hook: the app is entering the background.
    ///
    /// Attempts one flush now; the host should then request a deferred
    /// execution window and call [`Scheduler::run_background_window`]
    /// inside it.
    pub async fn on_background(&self) {
        if let Err(e) = self.client.flush().await {
            tracing::warn!(error = %e, "Background-entry flush failed");
        }
        tracing::info!("Entered background; host should schedule an execution window");
    }

    /// Host hook: the app is terminating.
    ///
    /// Every enqueued event is already durable (store() persists
    /// synchronously), so this only stops the timer.
    pub async fn on_terminate(&self) {
        self.stop().await;
        tracing::info!(
            pending = self.client.pending_count(),
            "Terminating; queued events are durable"
        );
    }

    /// Run a flush inside a host-granted execution window.
    ///
    /// Completes or pauses cleanly before `deadline` elapses. Persistence
    /// is atomic per operation, so expiry never leaves the store
    /// inconsistent; an interrupted upload is simply retried later.
    pub async fn run_background_window(&self, deadline: Duration) -> WindowOutcome {
        // Leave a little room to report back before the hard deadline
        let budget = deadline.saturating_sub(Duration::from_secs(1));

        let outcome = match tokio::time::timeout(budget, self.client.flush()).await {
            // flush() reports delivery failure through the Error state, not
            // through its Result
            Ok(Ok(false)) if self.client.state() == ClientState::Error => {
                WindowOutcome::Failed
            }
            Ok(Ok(_)) => WindowOutcome::Completed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Background window flush failed");
                WindowOutcome::Failed
            }
            Err(_) => {
                tracing::warn!(
                    deadline_secs = deadline.as_secs(),
                    "Background window expired before flush completed"
                );
                WindowOutcome::Expired
            }
        };

        tracing::info!(?outcome, "Background window finished");
        outcome
    }
}
