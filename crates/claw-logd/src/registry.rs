//! Filter registry and record routing.
//!
//! The registry pairs every active [`Filter`] with the [`RecordQueue`] that
//! buffers its stream, and publishes both as one immutable
//! [`RegistrySnapshot`]. Routing reads the current snapshot without taking a
//! lock; mutations build a new snapshot and swap it in, so readers see either
//! the old or the new filter set and never a filter without its queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::buffer::{Destination, FlushSignal, RecordQueue};
use crate::filter::Filter;
use crate::types::LogRecord;

/// An active filter and its pending-record queue.
#[derive(Debug, Clone)]
pub struct Route {
    filter: Arc<Filter>,
    queue: Arc<RecordQueue>,
}

impl Route {
    fn new(filter: Filter) -> Self {
        Self {
            filter: Arc::new(filter),
            queue: Arc::new(RecordQueue::new()),
        }
    }

    /// Returns the filter definition.
    #[must_use]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Returns the filter's queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<RecordQueue> {
        &self.queue
    }

    /// Returns the flush destination of this route.
    #[must_use]
    pub fn destination(&self) -> Destination {
        Destination::Filter(self.filter.id.clone())
    }
}

/// Immutable view of the active filters.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    routes: BTreeMap<String, Route>,
}

impl RegistrySnapshot {
    /// Iterates routes in identifier order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Returns the route for a filter identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Route> {
        self.routes.get(id)
    }

    /// Returns true if the filter is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }

    /// Returns the number of registered filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no filter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Returns cloned filter definitions in identifier order.
    #[must_use]
    pub fn filters(&self) -> Vec<Filter> {
        self.routes.values().map(|r| r.filter().clone()).collect()
    }
}

/// In-memory filter registry, buffer set and routing engine.
#[derive(Debug)]
pub struct FilterRegistry {
    primary: Arc<RecordQueue>,
    snapshot: ArcSwap<RegistrySnapshot>,
    signal: Arc<FlushSignal>,
    /// Serializes snapshot replacement.
    writer: Mutex<()>,
    /// Held shared while batches are written, exclusively while a filter
    /// stream is dropped.
    streams: RwLock<()>,
    accepted: AtomicU64,
    loaded: AtomicBool,
}

impl FilterRegistry {
    /// Creates an empty, not yet loaded registry.
    #[must_use]
    pub fn new(signal: Arc<FlushSignal>) -> Self {
        Self {
            primary: Arc::new(RecordQueue::new()),
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            signal,
            writer: Mutex::new(()),
            streams: RwLock::new(()),
            accepted: AtomicU64::new(0),
            loaded: AtomicBool::new(false),
        }
    }

    /// Routes a record to the primary queue and to every matching filter.
    ///
    /// Returns the number of filter queues that received the record.
    pub fn route(&self, record: LogRecord) -> usize {
        let record = Arc::new(record);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.signal.append(&self.primary, Arc::clone(&record));

        let snapshot = self.snapshot.load();
        let mut matched = 0;
        for route in snapshot.routes() {
            if route.filter.matches(&record) {
                self.signal.append(&route.queue, Arc::clone(&record));
                matched += 1;
            }
        }
        matched
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Returns the primary queue.
    #[must_use]
    pub const fn primary(&self) -> &Arc<RecordQueue> {
        &self.primary
    }

    /// Returns the flush signal shared with the flusher.
    #[must_use]
    pub const fn signal(&self) -> &Arc<FlushSignal> {
        &self.signal
    }

    /// Returns all filter definitions in identifier order.
    #[must_use]
    pub fn filters(&self) -> Vec<Filter> {
        self.snapshot.load().filters()
    }

    /// Returns a filter definition.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Filter> {
        self.snapshot.load().get(id).map(|r| r.filter().clone())
    }

    /// Returns true if the filter is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.snapshot.load().contains(id)
    }

    /// Returns the number of registered filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Returns true if no filter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Returns how many records have been accepted since creation.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Returns true once the registry has been loaded from the store.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Marks the registry as loaded.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Inserts or replaces a filter. A replaced filter keeps its queue and
    /// the records pending in it.
    pub fn upsert(&self, filter: Filter) {
        let _writer = self.writer.lock();
        let mut next = RegistrySnapshot::clone(&self.snapshot.load());
        let route = match next.routes.get(&filter.id) {
            Some(existing) => Route {
                filter: Arc::new(filter),
                queue: Arc::clone(&existing.queue),
            },
            None => Route::new(filter),
        };
        next.routes.insert(route.filter.id.clone(), route);
        self.snapshot.store(Arc::new(next));
    }

    /// Removes a filter and its queue. Records still pending for it are
    /// dropped once no flush cycle holds the queue anymore.
    pub fn remove(&self, id: &str) -> Option<Filter> {
        let _writer = self.writer.lock();
        let mut next = RegistrySnapshot::clone(&self.snapshot.load());
        let removed = next.routes.remove(id)?;
        self.snapshot.store(Arc::new(next));
        Some(Filter::clone(&removed.filter))
    }

    /// Replaces the whole filter set.
    ///
    /// Filters that survive keep their queues; queues of filters that are
    /// gone are discarded with whatever they still hold.
    pub fn replace_all(&self, filters: Vec<Filter>) {
        let _writer = self.writer.lock();
        let current = self.snapshot.load();
        let mut routes = BTreeMap::new();
        for filter in filters {
            let route = match current.routes.get(&filter.id) {
                Some(existing) => Route {
                    filter: Arc::new(filter),
                    queue: Arc::clone(&existing.queue),
                },
                None => Route::new(filter),
            };
            routes.insert(route.filter.id.clone(), route);
        }
        let dropped: usize = current
            .routes
            .iter()
            .filter(|(id, _)| !routes.contains_key(*id))
            .map(|(_, r)| r.queue.len())
            .sum();
        if dropped > 0 {
            debug!(dropped, "discarding records pending for removed filters");
        }
        self.snapshot.store(Arc::new(RegistrySnapshot { routes }));
        self.loaded.store(true, Ordering::Release);
    }

    /// Blocks stream drops while batches are being written.
    ///
    /// A writer holding this guard must re-check [`FilterRegistry::contains`]
    /// before writing a filter batch.
    pub fn streams_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.streams.read()
    }

    /// Waits for in-flight batch writes to finish. Any filter removed before
    /// this returns will not have its stream written to again.
    pub fn streams_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.streams.write()
    }

    /// Discards everything still buffered, returning how many records were
    /// dropped.
    pub fn discard_pending(&self) -> usize {
        let snapshot = self.snapshot.load();
        self.primary.clear() + snapshot.routes().map(|r| r.queue.clear()).sum::<usize>()
    }
}
