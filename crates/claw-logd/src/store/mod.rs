//! Document-store interface.
//!
//! The service persists records and filter definitions through the
//! [`DocumentStore`] trait. Queries, sort specs, projections and pipelines
//! are Mongo-style JSON documents passed through opaquely; the store decides
//! what it supports.
//!
//! [`MemoryStore`] is an in-process implementation used for tests and
//! embedding.

mod matcher;
mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LogdError, Result};
use crate::filter::IndexSpec;
use crate::types::Document;

/// Acknowledgement level requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    /// Wait for the store to confirm the write.
    #[default]
    Acknowledged,
    /// Fire and forget; only transport-level failures are reported.
    Unacknowledged,
}

/// Replica selection for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Read from the authoritative node.
    Primary,
    /// Read from whichever node is closest; may be stale.
    #[default]
    Nearest,
}

/// One key of a sort specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Sort in descending order.
    pub descending: bool,
}

impl SortKey {
    /// Ascending on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    /// Descending on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Parses the flat form `["field", 1 | -1, "field2", 1 | -1, ...]`.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidQuery`] if the list has odd length, a
    /// field is not a string, or a direction is not `1` or `-1`.
    pub fn parse_flat(items: &[Value]) -> Result<Vec<Self>> {
        if items.len() % 2 != 0 {
            return Err(LogdError::InvalidQuery(
                "sort must alternate field and direction".to_string(),
            ));
        }
        items
            .chunks(2)
            .map(|pair| {
                let field = pair[0].as_str().ok_or_else(|| {
                    LogdError::InvalidQuery(format!("sort field must be a string, got {}", pair[0]))
                })?;
                match pair[1].as_i64() {
                    Some(1) => Ok(Self::asc(field)),
                    Some(-1) => Ok(Self::desc(field)),
                    _ => Err(LogdError::InvalidQuery(format!(
                        "sort direction for {field} must be 1 or -1"
                    ))),
                }
            })
            .collect()
    }

    /// Parses a sort document such as `{"time": -1, "app": 1}`.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidQuery`] if a direction is not `1` or `-1`.
    pub fn parse_document(spec: &Document) -> Result<Vec<Self>> {
        spec.iter()
            .map(|(field, dir)| match dir.as_i64() {
                Some(1) => Ok(Self::asc(field.as_str())),
                Some(-1) => Ok(Self::desc(field.as_str())),
                _ => Err(LogdError::InvalidQuery(format!(
                    "sort direction for {field} must be 1 or -1"
                ))),
            })
            .collect()
    }
}

/// Parameters of a find operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Match condition; empty matches everything.
    pub query: Document,
    /// Sort keys, applied in order.
    pub sort: Vec<SortKey>,
    /// Number of matching documents to skip.
    pub skip: usize,
    /// Maximum number of documents to return, `0` for no limit.
    pub limit: usize,
    /// Inclusion or exclusion projection.
    pub projection: Option<Document>,
}

impl FindOptions {
    /// Matches every document in natural order.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Sets the match condition.
    #[must_use]
    pub fn with_query(mut self, query: Document) -> Self {
        self.query = query;
        self
    }

    /// Sets the sort keys.
    #[must_use]
    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    /// Sets skip and limit.
    #[must_use]
    pub const fn with_page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }

    /// Sets the projection.
    #[must_use]
    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// Trait for document-store backends.
///
/// Collections are created implicitly by inserts. Operations on a collection
/// that does not exist behave as on an empty one.
pub trait DocumentStore: Send + Sync {
    /// Lists collection names.
    fn collection_names(&self) -> Result<Vec<String>>;

    /// Returns true if the collection exists.
    fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.collection_names()?.iter().any(|n| n == name))
    }

    /// Creates an empty collection.
    ///
    /// # Errors
    ///
    /// Fails if the collection already exists.
    fn create_collection(&self, name: &str) -> Result<()>;

    /// Drops a collection with all its documents and indexes. Dropping a
    /// missing collection is not an error.
    fn drop_collection(&self, name: &str) -> Result<()>;

    /// Inserts one document. A missing `_id` is assigned by the store.
    ///
    /// # Errors
    ///
    /// Fails if a document with the same `_id` exists.
    fn insert_one(&self, collection: &str, doc: Document) -> Result<()>;

    /// Inserts a batch of documents.
    fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
        concern: WriteConcern,
    ) -> Result<()>;

    /// Replaces the document with the given `_id`. Returns false if no such
    /// document exists.
    fn replace_one(&self, collection: &str, id: &str, doc: Document) -> Result<bool>;

    /// Deletes the document with the given `_id`. Returns false if no such
    /// document exists.
    fn delete_one(&self, collection: &str, id: &str) -> Result<bool>;

    /// Deletes every document matching `query`, returning how many.
    fn delete_many(&self, collection: &str, query: &Document) -> Result<u64>;

    /// Counts documents matching `query`.
    fn count(&self, collection: &str, query: &Document) -> Result<u64>;

    /// Finds documents.
    fn find(
        &self,
        collection: &str,
        options: &FindOptions,
        read: ReadPreference,
    ) -> Result<Vec<Document>>;

    /// Runs an aggregation pipeline.
    fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>>;

    /// Runs a map-reduce job given JavaScript map and reduce functions.
    fn map_reduce(&self, collection: &str, map: &str, reduce: &str) -> Result<Vec<Document>>;

    /// Creates an index, returning its name.
    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String>;

    /// Drops every secondary index of a collection.
    fn drop_indexes(&self, collection: &str) -> Result<()>;

    /// Lists the secondary index names of a collection.
    fn index_names(&self, collection: &str) -> Result<Vec<String>>;
}

/// Runs a store operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &Arc<dyn DocumentStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn DocumentStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(LogdError::backend)?
}

/// Creates a collection unless it already exists. Losing a creation race to
/// another instance is not an error.
pub(crate) fn ensure_collection(store: &dyn DocumentStore, name: &str) -> Result<bool> {
    if store.has_collection(name)? {
        return Ok(false);
    }
    match store.create_collection(name) {
        Ok(()) => Ok(true),
        Err(_) if store.has_collection(name)? => Ok(false),
        Err(e) => Err(e),
    }
}
