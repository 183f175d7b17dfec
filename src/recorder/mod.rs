//! Asynchronous bridge from state-change events to the EventStore.
//!
//! # Lifecycle
//!
//! ```text
//! STOPPED ──start()──► RUNNING ──stop()──► STOPPED
//! ```
//!
//! While running, `submit` tags each event with the next sequence number
//! and queues it; a single worker appends queued events in order and
//! publishes the highest processed sequence number. `block_till_done`
//! snapshots the submitted count and waits for the worker to reach it, so
//! events arriving after the call never extend the wait.

use crate::config::RecorderConfig;
use crate::event::StateChangeEvent;
use crate::store::EventStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod metrics;
mod worker;

pub use metrics::{MetricsSnapshot, RecorderMetrics};
use worker::{Pending, Worker};


/// Recorder failures visible to callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("recorder is not running")]
    NotRunning,

    #[error("timed out after {timeout:?} waiting for sequence {target} (persisted {persisted})")]
    DrainTimeout {
        target: u64,
        persisted: u64,
        timeout: Duration,
    },

    #[error("recorder worker is gone")]
    WorkerGone,
}

/// Health report for operators
#[derive(Debug, Clone, Serialize)]
pub struct RecorderHealth {
    pub running: bool,
    /// Set once any record has been lost after exhausting retries
    pub degraded: bool,
    pub enqueued: u64,
    pub persisted: u64,
    pub metrics: MetricsSnapshot,
}

struct Ingress {
    queue: Option<mpsc::UnboundedSender<Pending>>,
    worker: Option<JoinHandle<()>>,
}

/// Records state-change events into an EventStore.
///
/// Construct one per store and hand the `Arc<Recorder>` to producers and
/// to anything that needs the drain barrier.
pub struct Recorder {
    store: Arc<dyn EventStore>,
    config: RecorderConfig,
    ingress: Mutex<Ingress>,

    /// Sequence number of the last submitted event
    enqueued: AtomicU64,

    /// Sequence number of the last event the worker finished with
    persisted: Arc<watch::Sender<u64>>,

    degraded: Arc<AtomicBool>,

    pub metrics: RecorderMetrics,
}

impl Recorder {
    /// Create a stopped recorder writing into `store`
    pub fn new(store: Arc<dyn EventStore>, config: RecorderConfig) -> Self {
        let (persisted, _) = watch::channel(0);

        Self {
            store,
            config,
            ingress: Mutex::new(Ingress {
                queue: None,
                worker: None,
            }),
            enqueued: AtomicU64::new(0),
            persisted: Arc::new(persisted),
            degraded: Arc::new(AtomicBool::new(false)),
            metrics: RecorderMetrics::new(),
        }
    }

    /// Store this recorder writes into
    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    fn ingress(&self) -> MutexGuard<'_, Ingress> {
        self.ingress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transition to RUNNING and spawn the worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), RecorderError> {
        let mut ingress = self.ingress();
        if ingress.queue.is_some() {
            return Err(RecorderError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            persisted: Arc::clone(&self.persisted),
            degraded: Arc::clone(&self.degraded),
            metrics: self.metrics.clone(),
            last_states: HashMap::new(),
        };
        let previous = ingress.worker.take();

        ingress.worker = Some(tokio::spawn(worker.run(previous, rx)));
        ingress.queue = Some(tx);

        info!(
            enqueued = self.enqueued.load(Ordering::SeqCst),
            "Recorder started"
        );
        Ok(())
    }

    /// Transition to STOPPED. New events are rejected; events already
    /// queued are still written by the worker.
    pub fn stop(&self) {
        if self.ingress().queue.take().is_some() {
            info!(
                enqueued = self.enqueued.load(Ordering::SeqCst),
                persisted = *self.persisted.borrow(),
                "Recorder stopped"
            );
        }
    }

    /// Stop and wait for the worker to finish the queued events.
    pub async fn shutdown(&self) {
        self.stop();
        let worker = self.ingress().worker.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Recorder worker ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.ingress().queue.is_some()
    }

    /// Queue one event for persistence; returns its sequence number.
    pub fn submit(&self, event: StateChangeEvent) -> Result<u64, RecorderError> {
        let ingress = self.ingress();
        let queue = ingress.queue.as_ref().ok_or(RecorderError::NotRunning)?;

        // Sequence assignment and send happen under the ingress lock, so
        // queue order and sequence order agree
        let sequence = self.enqueued.load(Ordering::SeqCst) + 1;
        queue
            .send(Pending { sequence, event })
            .map_err(|_| RecorderError::WorkerGone)?;
        self.enqueued.store(sequence, Ordering::SeqCst);
        self.metrics.record_received();

        Ok(sequence)
    }

    /// Forward every event from a broadcast source into `submit`.
    ///
    /// The task ends when the source closes or the recorder stops. Events
    /// still in the broadcast channel are not yet submitted, so the drain
    /// barrier does not cover them.
    pub fn listen(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<StateChangeEvent>,
    ) -> JoinHandle<()> {
        let recorder = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = recorder.submit(event) {
                            warn!(error = %e, "Recorder rejected event, detaching listener");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Recorder listener lagged, events missed");
                        recorder.metrics.record_missed(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event source closed, detaching recorder listener");
                        break;
                    }
                }
            }
        })
    }

    /// Wait until every event submitted before this call has been
    /// processed, bounded by the configured drain timeout.
    pub async fn block_till_done(&self) -> Result<(), RecorderError> {
        self.block_till_done_timeout(self.config.drain_timeout())
            .await
    }

    /// `block_till_done` with an explicit timeout; `None` waits forever.
    pub async fn block_till_done_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), RecorderError> {
        let target = self.enqueued.load(Ordering::SeqCst);
        if *self.persisted.borrow() >= target {
            return Ok(());
        }

        let mut progress = self.persisted.subscribe();
        let wait = async move {
            progress
                .wait_for(|persisted| *persisted >= target)
                .await
                .map(|_| ())
                .map_err(|_| RecorderError::WorkerGone)
        };

        match timeout {
            None => wait.await,
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    let persisted = *self.persisted.borrow();
                    warn!(
                        target = target,
                        persisted = persisted,
                        timeout_ms = limit.as_millis() as u64,
                        "Drain barrier timed out"
                    );
                    Err(RecorderError::DrainTimeout {
                        target,
                        persisted,
                        timeout: limit,
                    })
                }
            },
        }
    }

    /// Current health and counters
    pub fn health(&self) -> RecorderHealth {
        RecorderHealth {
            running: self.is_running(),
            degraded: self.degraded.load(Ordering::SeqCst),
            enqueued: self.enqueued.load(Ordering::SeqCst),
            persisted: *self.persisted.borrow(),
            metrics: self.metrics.get_snapshot(),
        }
    }
}
