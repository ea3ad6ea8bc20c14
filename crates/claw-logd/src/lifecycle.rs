//! Filter lifecycle management.
//!
//! [`FilterManager`] owns every mutation of the filter set: it persists
//! definitions, provisions and drops filter streams, builds indexes, updates
//! the local registry and broadcasts invalidation to the other instances.
//! Mutations are serialized per instance.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::Destination;
use crate::error::{LogdError, Result};
use crate::filter::{Filter, IndexSpec};
use crate::invalidation::{Invalidation, InvalidationBus};
use crate::registry::FilterRegistry;
use crate::store::{self, DocumentStore, FindOptions, ReadPreference};
use crate::types::Document;

fn id_query(id: &str) -> Document {
    let mut query = Document::new();
    query.insert("_id".to_string(), Value::from(id));
    query
}

/// Creates, updates, deletes and reloads filters.
pub struct FilterManager {
    store: Arc<dyn DocumentStore>,
    registry: Arc<FilterRegistry>,
    bus: Option<Arc<dyn InvalidationBus>>,
    channel: String,
    instance_id: Uuid,
    primary: String,
    definitions: String,
    mutations: Mutex<()>,
}

impl fmt::Debug for FilterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterManager")
            .field("instance_id", &self.instance_id)
            .field("channel", &self.channel)
            .field("primary", &self.primary)
            .field("definitions", &self.definitions)
            .field("broadcasting", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

impl FilterManager {
    /// Creates a manager. Without a bus, mutations are never broadcast.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<FilterRegistry>,
        bus: Option<Arc<dyn InvalidationBus>>,
        channel: impl Into<String>,
        instance_id: Uuid,
        primary: impl Into<String>,
        definitions: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            channel: channel.into(),
            instance_id,
            primary: primary.into(),
            definitions: definitions.into(),
            mutations: Mutex::new(()),
        }
    }

    /// Returns the identity stamped on published invalidations.
    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Returns the invalidation channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the registry this manager mutates.
    #[must_use]
    pub const fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    /// Returns the active filters in identifier order.
    #[must_use]
    pub fn filters(&self) -> Vec<Filter> {
        self.registry.filters()
    }

    fn stream(&self, id: &str) -> String {
        Destination::Filter(id.to_string()).stream_name(&self.primary)
    }

    /// Provisions storage on startup and loads the registry.
    ///
    /// A missing primary stream is created with `primary_indexes`. When the
    /// definitions collection does not exist yet, it is seeded with
    /// `default_filter` without broadcasting; otherwise the registry is
    /// loaded from it. Losing the seeding race to another instance falls
    /// back to a load.
    pub async fn bootstrap(
        &self,
        default_filter: Filter,
        primary_indexes: &[IndexSpec],
    ) -> Result<()> {
        let primary = self.primary.clone();
        let created =
            store::run_blocking(&self.store, move |s| store::ensure_collection(s, &primary)).await?;
        if created {
            info!(collection = %self.primary, "created primary stream");
            self.build_indexes(&self.primary, primary_indexes).await;
        }

        let definitions = self.definitions.clone();
        let seeded =
            store::run_blocking(&self.store, move |s| s.has_collection(&definitions)).await?;
        if seeded {
            let count = self.reload().await?;
            info!(filters = count, "loaded filter registry");
            return Ok(());
        }

        info!(filter_id = %default_filter.id, "provisioning default filter");
        match self.create_inner(default_filter, false).await {
            Ok(()) => {
                self.registry.mark_loaded();
                Ok(())
            }
            Err(LogdError::DuplicateFilter(id)) => {
                debug!(filter_id = %id, "default filter provisioned concurrently, reloading");
                self.reload().await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Registers a new filter and broadcasts the change.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidIdentifier`] or
    /// [`LogdError::DuplicateFilter`] without changing any state, or a
    /// backend error if the definition or stream could not be provisioned.
    pub async fn create(&self, filter: Filter) -> Result<()> {
        self.create_inner(filter, true).await
    }

    async fn create_inner(&self, filter: Filter, broadcast: bool) -> Result<()> {
        filter.validate()?;
        let _guard = self.mutations.lock().await;
        if self.registry.contains(&filter.id) {
            return Err(LogdError::DuplicateFilter(filter.id));
        }

        let doc = filter.to_document()?;
        let definitions = self.definitions.clone();
        let stream = self.stream(&filter.id);
        let id = filter.id.clone();
        store::run_blocking(&self.store, move |s| {
            if s.count(&definitions, &id_query(&id))? > 0 {
                return Err(LogdError::DuplicateFilter(id));
            }
            if let Err(e) = s.insert_one(&definitions, doc) {
                if s.count(&definitions, &id_query(&id))? > 0 {
                    return Err(LogdError::DuplicateFilter(id));
                }
                return Err(e);
            }
            if let Err(e) = store::ensure_collection(s, &stream) {
                if let Err(undo) = s.delete_one(&definitions, &id) {
                    warn!(filter_id = %id, error = %undo, "failed to remove orphaned definition");
                }
                return Err(e);
            }
            Ok(())
        })
        .await?;

        self.registry.upsert(filter.clone());
        info!(filter_id = %filter.id, "filter created");
        self.build_indexes(&self.stream(&filter.id), &filter.indexes).await;
        if broadcast {
            self.broadcast();
        }
        Ok(())
    }

    /// Replaces a filter definition, broadcasts the change and rebuilds
    /// every index of its stream.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::FilterNotFound`] if the filter is unknown locally
    /// or its definition is no longer persisted, or a backend error if the
    /// definition could not be written.
    pub async fn update(&self, filter: Filter) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if !self.registry.contains(&filter.id) {
            return Err(LogdError::FilterNotFound(filter.id));
        }

        let doc = filter.to_document()?;
        let definitions = self.definitions.clone();
        let id = filter.id.clone();
        let replaced =
            store::run_blocking(&self.store, move |s| s.replace_one(&definitions, &id, doc)).await?;
        if !replaced {
            // Deleted elsewhere; the store wins over the local registry.
            info!(filter_id = %filter.id, "filter definition gone from store, reloading");
            if let Err(e) = self.reload_locked().await {
                warn!(filter_id = %filter.id, error = %e, "reload after vanished definition failed");
            }
            return Err(LogdError::FilterNotFound(filter.id));
        }

        self.registry.upsert(filter.clone());
        info!(filter_id = %filter.id, "filter updated");
        self.broadcast();

        let stream = self.stream(&filter.id);
        let dropped = {
            let stream = stream.clone();
            store::run_blocking(&self.store, move |s| s.drop_indexes(&stream)).await
        };
        if let Err(e) = dropped {
            warn!(filter_id = %filter.id, error = %e, "failed to drop filter indexes");
        }
        self.build_indexes(&stream, &filter.indexes).await;
        Ok(())
    }

    /// Removes a filter, broadcasts the change and drops its stream with
    /// all its data.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::FilterNotFound`] if the filter is unknown, or a
    /// backend error if the definition could not be deleted. In that case
    /// the filter stays registered.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.mutations.lock().await;
        let Some(removed) = self.registry.remove(id) else {
            return Err(LogdError::FilterNotFound(id.to_string()));
        };

        let definitions = self.definitions.clone();
        let key = id.to_string();
        let deleted = store::run_blocking(&self.store, move |s| s.delete_one(&definitions, &key)).await;
        match deleted {
            Ok(true) => {}
            Ok(false) => debug!(filter_id = %id, "definition already absent from store"),
            Err(e) => {
                self.registry.upsert(removed);
                return Err(e);
            }
        }
        info!(filter_id = %id, "filter deleted");
        self.broadcast();

        let registry = Arc::clone(&self.registry);
        let stream = self.stream(id);
        let dropped = store::run_blocking(&self.store, move |s| {
            let _streams = registry.streams_exclusive();
            s.drop_collection(&stream)
        })
        .await;
        if let Err(e) = dropped {
            warn!(filter_id = %id, error = %e, "failed to drop filter stream");
        }
        Ok(())
    }

    /// Replaces the registry with the persisted definitions, read from the
    /// primary node. Returns the number of filters loaded.
    ///
    /// Records pending for filters that no longer exist are discarded.
    /// Definitions that fail to decode are logged and skipped.
    pub async fn reload(&self) -> Result<usize> {
        let _guard = self.mutations.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> Result<usize> {
        self.registry.signal().wake();

        let definitions = self.definitions.clone();
        let docs = store::run_blocking(&self.store, move |s| {
            s.find(&definitions, &FindOptions::all(), ReadPreference::Primary)
        })
        .await?;

        let mut filters = Vec::with_capacity(docs.len());
        for doc in &docs {
            match Filter::from_document(doc) {
                Ok(filter) => filters.push(filter),
                Err(e) => warn!(error = %e, "skipping malformed filter definition"),
            }
        }
        let count = filters.len();
        self.registry.replace_all(filters);
        debug!(filters = count, "filter registry replaced");
        Ok(count)
    }

    /// Builds indexes on `stream`, returning how many succeeded. Failures are
    /// logged and do not stop the remaining builds.
    async fn build_indexes(&self, stream: &str, indexes: &[IndexSpec]) -> usize {
        if indexes.is_empty() {
            return 0;
        }
        let target = stream.to_string();
        let specs = indexes.to_vec();
        let built = store::run_blocking(&self.store, move |s| {
            let mut built = 0;
            for spec in &specs {
                match s.create_index(&target, spec) {
                    Ok(name) => {
                        debug!(collection = %target, index = %name, "index built");
                        built += 1;
                    }
                    Err(e) => {
                        warn!(collection = %target, index = %spec.name(), error = %e, "index build failed");
                    }
                }
            }
            Ok(built)
        })
        .await;
        built.unwrap_or_else(|e| {
            warn!(collection = %stream, error = %e, "index build task failed");
            0
        })
    }

    /// Publishes an invalidation. Failures are logged; the local change
    /// stands.
    fn broadcast(&self) {
        let Some(ref bus) = self.bus else {
            return;
        };
        let published = Invalidation::new(self.instance_id)
            .encode()
            .and_then(|payload| bus.publish(&self.channel, &payload));
        if let Err(e) = published {
            warn!(channel = %self.channel, error = %e, "failed to broadcast filter invalidation");
        }
    }
}
