//! The log service context.
//!
//! [`LogService`] owns every component of one instance: the registry with its
//! queues, the batch flusher, the filter manager, the invalidation listener
//! and the query facade. It is created by [`LogService::start`] and torn down
//! by [`LogService::shutdown`]; nothing is process-global.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::FlushSignal;
use crate::config::LogServiceConfig;
use crate::error::{LogdError, Result};
use crate::filter::Filter;
use crate::flusher::{BatchFlusher, FlushMetrics};
use crate::invalidation::{InvalidationBus, spawn_listener};
use crate::lifecycle::FilterManager;
use crate::query::{FindRequest, QueryFacade};
use crate::registry::FilterRegistry;
use crate::store::DocumentStore;
use crate::types::{Document, LogRecord};

/// Runtime introspection of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Identity stamped on this instance's invalidations.
    pub instance_id: Uuid,
    /// Records accepted since start.
    pub recorded_new_logs: u64,
    /// Number of active filters.
    pub filters: usize,
    /// Whether the registry has been loaded from the store.
    pub filters_loaded: bool,
    /// Flusher activity.
    pub flush: FlushMetrics,
}

/// A running log service instance.
pub struct LogService {
    config: LogServiceConfig,
    instance_id: Uuid,
    registry: Arc<FilterRegistry>,
    flusher: Arc<BatchFlusher>,
    manager: Arc<FilterManager>,
    queries: QueryFacade,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    ingest_closed: AtomicBool,
}

impl fmt::Debug for LogService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogService")
            .field("instance_id", &self.instance_id)
            .field("primary", &self.config.primary_collection)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LogService {
    /// Provisions storage, loads the filter registry and starts the flusher
    /// and, when a bus is given, the invalidation listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be provisioned or read.
    pub async fn start(
        config: LogServiceConfig,
        store: Arc<dyn DocumentStore>,
        bus: Option<Arc<dyn InvalidationBus>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let instance_id = Uuid::new_v4();
        let signal = Arc::new(FlushSignal::new(config.flush_threshold));
        let registry = Arc::new(FilterRegistry::new(signal));
        let manager = Arc::new(FilterManager::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            bus.clone(),
            config.invalidation_channel.clone(),
            instance_id,
            config.primary_collection.clone(),
            config.filters_collection.clone(),
        ));

        // Subscribe first so changes made by others during bootstrap are
        // replayed once the listener runs.
        let subscription = bus
            .as_ref()
            .map(|b| b.subscribe(&config.invalidation_channel));
        manager
            .bootstrap(
                config.default_filter.clone(),
                &LogServiceConfig::primary_indexes(),
            )
            .await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let listener = subscription
            .map(|rx| spawn_listener(Arc::clone(&manager), rx, shutdown_tx.subscribe()));

        let flusher = Arc::new(BatchFlusher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.primary_collection.clone(),
            config.flush_interval(),
        ));
        flusher.start();

        let queries = QueryFacade::new(store, config.primary_collection.clone());
        info!(
            %instance_id,
            filters = registry.len(),
            broadcasting = listener.is_some(),
            "log service started"
        );
        Ok(Arc::new(Self {
            config,
            instance_id,
            registry,
            flusher,
            manager,
            queries,
            shutdown_tx,
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
            ingest_closed: AtomicBool::new(false),
        }))
    }

    /// Returns this instance's identity.
    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Returns the configuration the service was started with.
    #[must_use]
    pub const fn config(&self) -> &LogServiceConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogdError::ShuttingDown);
        }
        Ok(())
    }

    // Ingestion

    /// Accepts a record. Never blocks on storage and never fails. Records
    /// logged while shutdown is in progress still reach the final flush;
    /// records logged after it are dropped.
    pub fn log(&self, record: LogRecord) {
        if self.ingest_closed.load(Ordering::Acquire) {
            debug!("dropping record logged after shutdown");
            return;
        }
        self.registry.route(record);
    }

    /// Accepts a record given field by field.
    #[allow(clippy::too_many_arguments)]
    pub fn log_fields(
        &self,
        timestamp: i64,
        category: i32,
        origin: &str,
        tag: &str,
        app_id: &str,
        code_locator: &str,
        note: &str,
        body: Value,
    ) {
        self.log(
            LogRecord::builder()
                .timestamp(timestamp)
                .category(category)
                .origin(origin)
                .tag(tag)
                .app_id(app_id)
                .code_locator(code_locator)
                .note(note)
                .body(body)
                .build(),
        );
    }

    /// Accepts a record in its positional wire form. Malformed payloads are
    /// logged and dropped; returns false in that case.
    pub fn ingest(&self, data: &Value) -> bool {
        match LogRecord::from_wire(data) {
            Ok(record) => {
                self.log(record);
                true
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed log record");
                false
            }
        }
    }

    // Queries

    /// Deletes matching records from a stream.
    pub async fn clear(&self, filter_id: Option<&str>, query: Option<Document>) -> Result<u64> {
        self.queries.clear(filter_id, query).await
    }

    /// Counts matching records in a stream.
    pub async fn count(&self, filter_id: Option<&str>, query: Option<Document>) -> Result<u64> {
        self.queries.count(filter_id, query).await
    }

    /// Finds records in a stream, newest first unless a sort is given.
    pub async fn find(&self, request: FindRequest) -> Result<Vec<Document>> {
        self.queries.find(request).await
    }

    /// Finds records and decodes them.
    pub async fn find_records(&self, request: FindRequest) -> Result<Vec<LogRecord>> {
        self.queries.find_records(request).await
    }

    /// Runs an aggregation pipeline against a stream.
    pub async fn aggregate(
        &self,
        filter_id: Option<&str>,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>> {
        self.queries.aggregate(filter_id, pipeline).await
    }

    /// Runs a map-reduce job against a stream.
    pub async fn map_reduce(
        &self,
        filter_id: Option<&str>,
        map: &str,
        reduce: &str,
    ) -> Result<Vec<Document>> {
        self.queries.map_reduce(filter_id, map, reduce).await
    }

    // Filters

    /// Returns the active filters in identifier order.
    #[must_use]
    pub fn get_filters(&self) -> Vec<Filter> {
        self.manager.filters()
    }

    /// Registers a new filter.
    pub async fn add_filter(&self, filter: Filter) -> Result<()> {
        self.ensure_open()?;
        self.manager.create(filter).await
    }

    /// Replaces an existing filter and rebuilds its indexes.
    pub async fn set_filter(&self, filter: Filter) -> Result<()> {
        self.ensure_open()?;
        self.manager.update(filter).await
    }

    /// Removes a filter and drops its stream.
    pub async fn del_filter(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.manager.delete(id).await
    }

    /// Reloads the registry from the store.
    pub async fn reload_filters(&self) -> Result<usize> {
        self.ensure_open()?;
        self.manager.reload().await
    }

    // Lifecycle

    /// Returns runtime counters.
    #[must_use]
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            instance_id: self.instance_id,
            recorded_new_logs: self.registry.accepted(),
            filters: self.registry.len(),
            filters_loaded: self.registry.is_loaded(),
            flush: self.flusher.metrics(),
        }
    }

    /// Runs one flush cycle now, returning the number of records written.
    pub async fn flush(&self) -> usize {
        self.flusher.flush_cycle().await
    }

    /// Stops the listener and the flusher and discards whatever is still
    /// buffered. Filter mutations are rejected from the first call on;
    /// ingestion stays open until the final flush. Calling it again has no
    /// effect.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(instance_id = %self.instance_id, "log service shutting down");
        let _ = self.shutdown_tx.send(());
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "invalidation listener failed");
            }
        }
        let discarded = self.flusher.shutdown().await;
        self.ingest_closed.store(true, Ordering::Release);
        info!(discarded, "log service stopped");
    }
}
