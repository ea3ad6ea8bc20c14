//! Pending-record buffers.
//!
//! This module provides:
//! - [`RecordQueue`]: An unbounded per-destination queue of pending records
//! - [`Destination`]: The primary stream or a filter stream
//! - [`FlushSignal`]: The early-wake signal producers raise at the size threshold
//!
//! Appends never block on I/O and never fail. The queue lock is only held for
//! a push or for swapping the whole vector out during a drain.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::LogRecord;

/// Where a drained batch is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// The stream that receives every record.
    Primary,
    /// The dedicated stream of a filter.
    Filter(String),
}

impl Destination {
    /// Returns the physical stream name for this destination.
    #[must_use]
    pub fn stream_name(&self, primary: &str) -> String {
        match self {
            Self::Primary => primary.to_string(),
            Self::Filter(id) => format!("{primary}_{id}"),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("<primary>"),
            Self::Filter(id) => f.write_str(id),
        }
    }
}

/// Unbounded queue of records waiting for the next flush cycle.
#[derive(Debug, Default)]
pub struct RecordQueue {
    pending: Mutex<Vec<Arc<LogRecord>>>,
}

impl RecordQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns the queue length after the append.
    pub fn push(&self, record: Arc<LogRecord>) -> usize {
        let mut pending = self.pending.lock();
        pending.push(record);
        pending.len()
    }

    /// Takes every pending record, leaving the queue empty.
    #[must_use]
    pub fn drain(&self) -> Vec<Arc<LogRecord>> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Discards every pending record and returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    /// Returns the number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Wakes the flusher early once a queue reaches the size threshold.
#[derive(Debug)]
pub struct FlushSignal {
    notify: Notify,
    threshold: usize,
}

impl FlushSignal {
    /// Creates a signal that fires when a queue holds `threshold` records.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            notify: Notify::new(),
            threshold: threshold.max(1),
        }
    }

    /// Appends to `queue`, waking the flusher if the threshold is reached.
    pub fn append(&self, queue: &RecordQueue, record: Arc<LogRecord>) {
        if queue.push(record) >= self.threshold {
            self.wake();
        }
    }

    /// Wakes the flusher. If it is not currently waiting, its next wait
    /// returns immediately.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Waits until [`FlushSignal::wake`] is called.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Returns the wake threshold.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }
}
