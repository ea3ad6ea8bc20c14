//! Background batch flusher.
//!
//! One tokio task per service drains every pending queue on a fixed cadence,
//! or earlier when a producer crosses the size threshold, and bulk-inserts
//! each destination's batch with an unacknowledged write. Draining is not
//! transactional: a batch whose write fails is logged and dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::Destination;
use crate::registry::FilterRegistry;
use crate::store::{DocumentStore, WriteConcern};
use crate::types::LogRecord;

type Batch = (Destination, Vec<Arc<LogRecord>>);

/// Counters describing flusher activity since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushMetrics {
    /// Completed flush cycles.
    pub cycles: u64,
    /// Records handed to the store successfully.
    pub records_written: u64,
    /// Records drained but never written.
    pub records_dropped: u64,
    /// Bulk inserts that returned an error.
    pub failed_batches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CycleOutcome {
    written: usize,
    dropped: usize,
    failed: usize,
}

/// Periodic drain-and-write worker.
pub struct BatchFlusher {
    store: Arc<dyn DocumentStore>,
    registry: Arc<FilterRegistry>,
    primary: String,
    interval: Duration,
    stop: AtomicBool,
    counters: Counters,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BatchFlusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFlusher")
            .field("primary", &self.primary)
            .field("interval", &self.interval)
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BatchFlusher {
    /// Creates a flusher writing the primary queue to `primary` and filter
    /// queues to `<primary>_<id>`.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<FilterRegistry>,
        primary: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            primary: primary.into(),
            interval,
            stop: AtomicBool::new(false),
            counters: Counters::default(),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the background task. Calling this twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.is_stopped() {
            return;
        }
        info!(interval_ms = self.interval.as_millis() as u64, "starting batch flusher");
        *handle = Some(tokio::spawn(Arc::clone(self).run()));
    }

    async fn run(self: Arc<Self>) {
        let signal = Arc::clone(self.registry.signal());
        while !self.is_stopped() {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = signal.notified() => {}
            }
            self.flush_cycle().await;
        }
        debug!("batch flusher stopped");
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wakes the background task for an immediate cycle.
    pub fn wake(&self) {
        self.registry.signal().wake();
    }

    /// Drains every queue once and writes the batches, primary first.
    ///
    /// Returns the number of records written.
    pub async fn flush_cycle(&self) -> usize {
        let snapshot = self.registry.snapshot();
        let mut batches: Vec<Batch> = Vec::with_capacity(snapshot.len() + 1);

        let primary = self.registry.primary().drain();
        if !primary.is_empty() {
            batches.push((Destination::Primary, primary));
        }
        for route in snapshot.routes() {
            let drained = route.queue().drain();
            if !drained.is_empty() {
                batches.push((route.destination(), drained));
            }
        }
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        if batches.is_empty() {
            return 0;
        }

        let pending: usize = batches.iter().map(|(_, batch)| batch.len()).sum();
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let primary = self.primary.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            write_batches(store.as_ref(), &registry, &primary, batches)
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, count = pending, "flush task failed, dropping drained records");
            CycleOutcome {
                written: 0,
                dropped: pending,
                failed: 1,
            }
        });

        self.counters
            .written
            .fetch_add(outcome.written as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        outcome.written
    }

    /// Stops the background task and discards whatever is still buffered.
    ///
    /// A flusher waiting between cycles runs one final cycle before it
    /// exits; a cycle in progress is allowed to finish. Returns the number of
    /// records discarded.
    pub async fn shutdown(&self) -> usize {
        self.stop.store(true, Ordering::Release);
        self.wake();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "batch flusher task failed");
            }
        }
        let discarded = self.registry.discard_pending();
        if discarded > 0 {
            warn!(count = discarded, "discarding records buffered after final flush");
        }
        info!("batch flusher shut down");
        discarded
    }

    /// Returns a snapshot of the activity counters.
    #[must_use]
    pub fn metrics(&self) -> FlushMetrics {
        FlushMetrics {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            records_written: self.counters.written.load(Ordering::Relaxed),
            records_dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed_batches: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

fn write_batches(
    store: &dyn DocumentStore,
    registry: &FilterRegistry,
    primary: &str,
    batches: Vec<Batch>,
) -> CycleOutcome {
    let _streams = registry.streams_shared();
    let mut outcome = CycleOutcome::default();
    for (destination, batch) in batches {
        let count = batch.len();
        if let Destination::Filter(ref id) = destination {
            if !registry.contains(id) {
                debug!(filter_id = %id, count, "filter removed before flush, dropping batch");
                outcome.dropped += count;
                continue;
            }
        }
        let collection = destination.stream_name(primary);
        let docs = batch.iter().map(|r| r.to_document()).collect();
        match store.insert_many(&collection, docs, WriteConcern::Unacknowledged) {
            Ok(()) => {
                debug!(%destination, count, "flushed batch");
                outcome.written += count;
            }
            Err(e) => {
                warn!(%destination, count, error = %e, "bulk insert failed, dropping batch");
                outcome.dropped += count;
                outcome.failed += 1;
            }
        }
    }
    outcome
}
