//! Query facade over the primary and filter streams.
//!
//! Each call resolves the addressed stream (the primary when no filter id is
//! given) and hands the query to the store unchanged. Reads use the nearest
//! replica. A stream that does not exist reads as empty.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::Destination;
use crate::error::Result;
use crate::filter::validate_identifier;
use crate::store::{self, DocumentStore, FindOptions, ReadPreference, SortKey};
use crate::types::{Document, LogRecord, fields};

/// Parameters of a find call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindRequest {
    /// Filter stream to read, the primary when `None` or blank.
    pub filter_id: Option<String>,
    /// Match condition; `None` matches everything.
    pub query: Option<Document>,
    /// Sort keys; newest first by time when `None` or empty.
    pub sort: Option<Vec<SortKey>>,
    /// Matching records to skip.
    pub skip: usize,
    /// Maximum records to return, `0` for no limit.
    pub limit: usize,
    /// Projection applied to each record.
    pub fields: Option<Document>,
}

impl FindRequest {
    /// Reads the primary stream.
    #[must_use]
    pub fn primary() -> Self {
        Self::default()
    }

    /// Reads a filter stream.
    #[must_use]
    pub fn filter(id: impl Into<String>) -> Self {
        Self {
            filter_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Sets the match condition.
    #[must_use]
    pub fn with_query(mut self, query: Document) -> Self {
        self.query = Some(query);
        self
    }

    /// Sets the sort keys.
    #[must_use]
    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets the sort keys from the flat form `["field", 1 | -1, ...]`.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidQuery`](crate::LogdError::InvalidQuery)
    /// if the list is malformed.
    pub fn with_flat_sort(self, sort: &[serde_json::Value]) -> Result<Self> {
        Ok(self.with_sort(SortKey::parse_flat(sort)?))
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
    pub fn with_fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    fn into_options(self) -> FindOptions {
        let sort = match self.sort {
            Some(sort) if !sort.is_empty() => sort,
            _ => vec![SortKey::desc(fields::TIME)],
        };
        FindOptions {
            query: self.query.unwrap_or_default(),
            sort,
            skip: self.skip,
            limit: self.limit,
            projection: self.fields,
        }
    }
}

/// Thin pass-through from query calls to the store.
pub struct QueryFacade {
    store: Arc<dyn DocumentStore>,
    primary: String,
}

impl fmt::Debug for QueryFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFacade")
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

impl QueryFacade {
    /// Creates a facade over the streams rooted at `primary`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, primary: impl Into<String>) -> Self {
        Self {
            store,
            primary: primary.into(),
        }
    }

    /// Resolves the physical stream for a filter id.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidIdentifier`](crate::LogdError::InvalidIdentifier)
    /// if a non-blank id is not a valid filter identifier.
    pub fn stream(&self, filter_id: Option<&str>) -> Result<String> {
        let destination = match filter_id.map(str::trim) {
            None | Some("") => Destination::Primary,
            Some(id) => {
                validate_identifier(id)?;
                Destination::Filter(id.to_string())
            }
        };
        Ok(destination.stream_name(&self.primary))
    }

    /// Deletes matching records, returning how many were removed.
    pub async fn clear(&self, filter_id: Option<&str>, query: Option<Document>) -> Result<u64> {
        let stream = self.stream(filter_id)?;
        let query = query.unwrap_or_default();
        store::run_blocking(&self.store, move |s| s.delete_many(&stream, &query)).await
    }

    /// Counts matching records.
    pub async fn count(&self, filter_id: Option<&str>, query: Option<Document>) -> Result<u64> {
        let stream = self.stream(filter_id)?;
        let query = query.unwrap_or_default();
        store::run_blocking(&self.store, move |s| s.count(&stream, &query)).await
    }

    /// Finds records as raw documents.
    pub async fn find(&self, request: FindRequest) -> Result<Vec<Document>> {
        let stream = self.stream(request.filter_id.as_deref())?;
        let options = request.into_options();
        store::run_blocking(&self.store, move |s| {
            s.find(&stream, &options, ReadPreference::Nearest)
        })
        .await
    }

    /// Finds records and decodes them. Documents that are not complete log
    /// records, for example because of a projection, are skipped.
    pub async fn find_records(&self, request: FindRequest) -> Result<Vec<LogRecord>> {
        let docs = self.find(request).await?;
        Ok(docs
            .iter()
            .filter_map(|doc| LogRecord::from_document(doc).ok())
            .collect())
    }

    /// Runs an aggregation pipeline.
    pub async fn aggregate(
        &self,
        filter_id: Option<&str>,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>> {
        let stream = self.stream(filter_id)?;
        store::run_blocking(&self.store, move |s| s.aggregate(&stream, &pipeline)).await
    }

    /// Runs a map-reduce job.
    pub async fn map_reduce(
        &self,
        filter_id: Option<&str>,
        map: &str,
        reduce: &str,
    ) -> Result<Vec<Document>> {
        let stream = self.stream(filter_id)?;
        let (map, reduce) = (map.to_string(), reduce.to_string());
        store::run_blocking(&self.store, move |s| s.map_reduce(&stream, &map, &reduce)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogdError;
    use crate::store::{MemoryStore, WriteConcern};
    use serde_json::{Value, json};
    use test_case::test_case;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => Document::new(),
        }
    }

    fn facade() -> (Arc<MemoryStore>, QueryFacade) {
        let store = Arc::new(MemoryStore::new());
        let facade = QueryFacade::new(Arc::clone(&store) as Arc<dyn DocumentStore>, "logs");
        (store, facade)
    }

    fn seed(store: &MemoryStore, collection: &str, n: i64) {
        let docs = (0..n)
            .map(|t| {
                LogRecord::builder()
                    .timestamp(t)
                    .category((t % 3) as i32)
                    .app_id(if t % 2 == 0 { "web" } else { "api" })
                    .build()
                    .to_document()
            })
            .collect();
        let _ = store.insert_many(collection, docs, WriteConcern::Acknowledged);
    }

    #[test_case(None, "logs" ; "none is primary")]
    #[test_case(Some(""), "logs" ; "empty is primary")]
    #[test_case(Some("  "), "logs" ; "blank is primary")]
    #[test_case(Some("errors"), "logs_errors" ; "filter stream")]
    fn resolves_stream(filter_id: Option<&str>, expected: &str) {
        let (_, facade) = facade();
        assert_eq!(facade.stream(filter_id).ok().as_deref(), Some(expected));
    }

    #[test]
    fn rejects_invalid_filter_id() {
        let (_, facade) = facade();
        assert!(matches!(
            facade.stream(Some("a$b")),
            Err(LogdError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn find_defaults_to_newest_first() {
        let (store, facade) = facade();
        seed(&store, "logs", 5);

        let records = facade
            .find_records(FindRequest::primary().with_page(0, 3))
            .await
            .unwrap_or_default();
        let times: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn find_with_query_sort_and_fields() {
        let (store, facade) = facade();
        seed(&store, "logs_web", 6);

        let request = FindRequest::filter("web")
            .with_query(doc(json!({"app": "web"})))
            .with_sort(vec![SortKey::asc("time")])
            .with_fields(doc(json!({"time": 1, "_id": 0})));
        let found = facade.find(request).await.unwrap_or_default();
        assert_eq!(
            found,
            vec![doc(json!({"time": 0})), doc(json!({"time": 2})), doc(json!({"time": 4}))]
        );
    }

    #[tokio::test]
    async fn find_with_flat_sort() {
        let (store, facade) = facade();
        seed(&store, "logs", 6);

        let request = FindRequest::primary()
            .with_flat_sort(&[json!("type"), json!(1), json!("time"), json!(-1)]);
        assert!(request.is_ok());
        let records = match request {
            Ok(request) => facade.find_records(request).await.unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let times: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![3, 0, 4, 1, 5, 2]);

        let bad = FindRequest::primary().with_flat_sort(&[json!("type")]);
        assert!(matches!(bad, Err(LogdError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn count_and_clear() {
        let (store, facade) = facade();
        seed(&store, "logs", 6);

        assert_eq!(facade.count(None, None).await.ok(), Some(6));
        let errors = doc(json!({"type": 2}));
        assert_eq!(facade.count(None, Some(errors.clone())).await.ok(), Some(2));
        assert_eq!(facade.clear(None, Some(errors)).await.ok(), Some(2));
        assert_eq!(facade.count(None, None).await.ok(), Some(4));
        assert_eq!(facade.clear(Some(""), None).await.ok(), Some(4));
        assert_eq!(facade.count(None, None).await.ok(), Some(0));
    }

    #[tokio::test]
    async fn missing_stream_reads_empty() {
        let (_, facade) = facade();
        assert_eq!(facade.count(Some("gone"), None).await.ok(), Some(0));
        assert_eq!(
            facade.find(FindRequest::filter("gone")).await.ok(),
            Some(Vec::new())
        );
    }

    #[tokio::test]
    async fn aggregate_passes_pipeline_through() {
        let (store, facade) = facade();
        seed(&store, "logs", 4);

        let pipeline = vec![
            doc(json!({"$group": {"_id": "$app", "n": {"$sum": 1}}})),
            doc(json!({"$sort": {"_id": 1}})),
        ];
        let out = facade.aggregate(None, pipeline).await.unwrap_or_default();
        assert_eq!(
            out,
            vec![doc(json!({"_id": "api", "n": 2})), doc(json!({"_id": "web", "n": 2}))]
        );
    }

    #[tokio::test]
    async fn map_reduce_reports_backend_support() {
        let (_, facade) = facade();
        let result = facade.map_reduce(None, "function(){}", "function(){}").await;
        assert!(matches!(result, Err(LogdError::Unsupported(_))));
    }
}
