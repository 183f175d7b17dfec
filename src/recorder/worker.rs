use super::metrics::RecorderMetrics;
use crate::config::{RecordPolicy, RecorderConfig};
use crate::event::StateChangeEvent;
use crate::state::StateRecord;
use crate::store::{EventStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Queued event tagged with its submission sequence number
pub(super) struct Pending {
    pub sequence: u64,
    pub event: StateChangeEvent,
}

/// Single consumer of the recorder queue.
///
/// Events are appended strictly in sequence order, which preserves
/// per-entity ordering end to end.
pub(super) struct Worker {
    pub store: Arc<dyn EventStore>,
    pub config: RecorderConfig,
    pub persisted: Arc<watch::Sender<u64>>,
    pub degraded: Arc<AtomicBool>,
    pub metrics: RecorderMetrics,
    /// Last recorded state per entity; `None` means the store had no record
    pub last_states: HashMap<String, Option<String>>,
}

impl Worker {
    /// Drain the queue until every sender is dropped.
    ///
    /// A worker from a previous run is awaited first so records from
    /// before a restart land ahead of the new ones.
    pub async fn run(
        mut self,
        previous: Option<JoinHandle<()>>,
        mut queue: mpsc::UnboundedReceiver<Pending>,
    ) {
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous recorder worker ended abnormally");
            }
        }

        info!(policy = ?self.config.record_policy, "Recorder worker started");

        while let Some(pending) = queue.recv().await {
            self.process(pending.event).await;
            // Stored, skipped, dropped or lost: the barrier moves on either way
            self.persisted.send_replace(pending.sequence);
        }

        info!(
            persisted = *self.persisted.borrow(),
            "Recorder queue closed, worker exiting"
        );
    }

    async fn process(&mut self, event: StateChangeEvent) {
        let record = match event.into_record() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Dropping malformed state change event");
                self.metrics.record_dropped();
                return;
            }
        };

        if self.config.record_policy == RecordPolicy::StateChanges
            && self.last_recorded_state(&record.entity_id).await.as_deref() == Some(record.state.as_str())
        {
            debug!(
                entity_id = %record.entity_id,
                state = %record.state,
                "State unchanged, skipping record"
            );
            self.metrics.record_skipped();
            return;
        }

        match self.append_with_retry(&record).await {
            Ok(()) => {
                self.metrics.record_recorded();
                self.last_states
                    .insert(record.entity_id, Some(record.state));
            }
            Err(e) => {
                error!(
                    entity_id = %record.entity_id,
                    state = %record.state,
                    attempts = self.config.max_write_attempts,
                    error = %e,
                    "State record lost after exhausting write retries"
                );
                self.metrics.record_lost();
                self.degraded.store(true, Ordering::SeqCst);
                // Unknown whether anything landed; re-seed from the store next time
                self.last_states.remove(&record.entity_id);
            }
        }
    }

    /// Last recorded state for an entity, seeded from the store on first use.
    async fn last_recorded_state(&mut self, entity_id: &str) -> Option<String> {
        if let Some(state) = self.last_states.get(entity_id) {
            return state.clone();
        }

        let store = Arc::clone(&self.store);
        let id = entity_id.to_string();
        match tokio::task::spawn_blocking(move || store.last_n(&id, 1)).await {
            Ok(Ok(mut records)) => {
                let state = records.pop().map(|r| r.state);
                self.last_states.insert(entity_id.to_string(), state.clone());
                state
            }
            Ok(Err(e)) => {
                warn!(entity_id = %entity_id, error = %e, "Failed to read last state, recording anyway");
                None
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "Last state lookup task failed");
                None
            }
        }
    }

    /// Append on the blocking pool, retrying with exponential backoff.
    async fn append_with_retry(&self, record: &StateRecord) -> Result<(), StoreError> {
        let attempts = self.config.max_write_attempts.max(1);
        let mut attempt = 1;

        loop {
            let store = Arc::clone(&self.store);
            let owned = record.clone();
            let result = match tokio::task::spawn_blocking(move || store.append(&owned)).await {
                Ok(result) => result,
                Err(e) => Err(StoreError::Unavailable(format!("append task failed: {}", e))),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        entity_id = %record.entity_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
