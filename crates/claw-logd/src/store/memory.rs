//! In-memory document store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::matcher;
use super::{DocumentStore, FindOptions, ReadPreference, WriteConcern};
use crate::error::{LogdError, Result};
use crate::filter::IndexSpec;
use crate::types::Document;

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    /// Index name -> key document.
    indexes: BTreeMap<String, Document>,
}

impl Collection {
    fn position(&self, id: &str) -> Option<usize> {
        self.docs
            .iter()
            .position(|d| d.get("_id").and_then(Value::as_str) == Some(id))
    }

    fn filtered(&self, query: &Document) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        for doc in &self.docs {
            if matcher::matches(doc, query)? {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }
}

/// Thread-safe in-memory [`DocumentStore`].
///
/// Write failures can be injected with [`MemoryStore::fail_writes`] to
/// exercise the service's error paths. `map_reduce` is not supported.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Collection>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent mutating operation fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns how many mutating operations have succeeded.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns a copy of every document in a collection, in insertion order.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    /// Returns the key document of a named index.
    #[must_use]
    pub fn index_keys(&self, collection: &str, name: &str) -> Option<Document> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.indexes.get(name).cloned())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LogdError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn with_id(mut doc: Document) -> Document {
        if !doc.contains_key("_id") {
            doc.insert("_id".to_string(), Value::from(Uuid::new_v4().simple().to_string()));
        }
        doc
    }
}

impl DocumentStore for MemoryStore {
    fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().keys().cloned().collect())
    }

    fn create_collection(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(LogdError::Backend(format!("collection already exists: {name}")));
        }
        collections.insert(name.to_string(), Collection::default());
        self.wrote();
        Ok(())
    }

    fn drop_collection(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        self.collections.write().remove(name);
        self.wrote();
        Ok(())
    }

    fn insert_one(&self, collection: &str, doc: Document) -> Result<()> {
        self.check_writable()?;
        let doc = Self::with_id(doc);
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        if let Some(id) = doc.get("_id").and_then(Value::as_str) {
            if coll.position(id).is_some() {
                return Err(LogdError::Backend(format!(
                    "duplicate key in {collection}: {id}"
                )));
            }
        }
        coll.docs.push(doc);
        self.wrote();
        Ok(())
    }

    fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
        _concern: WriteConcern,
    ) -> Result<()> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        coll.docs.extend(docs.into_iter().map(Self::with_id));
        self.wrote();
        Ok(())
    }

    fn replace_one(&self, collection: &str, id: &str, mut doc: Document) -> Result<bool> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(pos) = coll.position(id) else {
            return Ok(false);
        };
        doc.insert("_id".to_string(), Value::from(id));
        coll.docs[pos] = doc;
        self.wrote();
        Ok(true)
    }

    fn delete_one(&self, collection: &str, id: &str) -> Result<bool> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(pos) = coll.position(id) else {
            return Ok(false);
        };
        coll.docs.remove(pos);
        self.wrote();
        Ok(true)
    }

    fn delete_many(&self, collection: &str, query: &Document) -> Result<u64> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut kept = Vec::with_capacity(coll.docs.len());
        let mut removed = 0_u64;
        for doc in std::mem::take(&mut coll.docs) {
            if matcher::matches(&doc, query)? {
                removed += 1;
            } else {
                kept.push(doc);
            }
        }
        coll.docs = kept;
        self.wrote();
        Ok(removed)
    }

    fn count(&self, collection: &str, query: &Document) -> Result<u64> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(0);
        };
        let mut n = 0_u64;
        for doc in &coll.docs {
            if matcher::matches(doc, query)? {
                n += 1;
            }
        }
        Ok(n)
    }

    fn find(
        &self,
        collection: &str,
        options: &FindOptions,
        _read: ReadPreference,
    ) -> Result<Vec<Document>> {
        let mut docs = {
            let collections = self.collections.read();
            match collections.get(collection) {
                Some(coll) => coll.filtered(&options.query)?,
                None => return Ok(Vec::new()),
            }
        };
        matcher::sort(&mut docs, &options.sort);
        let page = docs.into_iter().skip(options.skip);
        let page: Vec<Document> = if options.limit == 0 {
            page.collect()
        } else {
            page.take(options.limit).collect()
        };
        match options.projection {
            Some(ref projection) => page
                .iter()
                .map(|d| matcher::project(d, projection))
                .collect(),
            None => Ok(page),
        }
    }

    fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>> {
        let docs = self.documents(collection);
        matcher::aggregate(docs, pipeline)
    }

    fn map_reduce(&self, _collection: &str, _map: &str, _reduce: &str) -> Result<Vec<Document>> {
        Err(LogdError::Unsupported("map_reduce"))
    }

    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String> {
        self.check_writable()?;
        if index.is_empty() {
            return Err(LogdError::InvalidQuery("index has no keys".to_string()));
        }
        let name = index.name();
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        match coll.indexes.get(&name) {
            Some(existing) if *existing != index.keys() => {
                return Err(LogdError::Backend(format!(
                    "index {name} already exists with different keys"
                )));
            }
            Some(_) => {}
            None => {
                coll.indexes.insert(name.clone(), index.keys());
            }
        }
        self.wrote();
        Ok(name)
    }

    fn drop_indexes(&self, collection: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(coll) = self.collections.write().get_mut(collection) {
            coll.indexes.clear();
        }
        self.wrote();
        Ok(())
    }

    fn index_names(&self, collection: &str) -> Result<Vec<String>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.indexes.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::IndexField;
    use crate::store::SortKey;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => Document::new(),
        }
    }

    #[test]
    fn insert_and_count() {
        let store = MemoryStore::new();
        let result = store.insert_many(
            "logs",
            vec![doc(json!({"type": 1})), doc(json!({"type": 2}))],
            WriteConcern::Unacknowledged,
        );
        assert!(result.is_ok());
        assert_eq!(store.count("logs", &Document::new()).ok(), Some(2));
        assert_eq!(store.count("logs", &doc(json!({"type": 2}))).ok(), Some(1));
        assert!(store.documents("logs").iter().all(|d| d.contains_key("_id")));
    }

    #[test]
    fn missing_collection_behaves_as_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.count("nope", &Document::new()).ok(), Some(0));
        assert_eq!(
            store.find("nope", &FindOptions::all(), ReadPreference::Primary).ok(),
            Some(Vec::new())
        );
        assert_eq!(store.delete_many("nope", &Document::new()).ok(), Some(0));
        assert_eq!(store.index_names("nope").ok(), Some(Vec::new()));
        assert!(store.drop_collection("nope").is_ok());
    }

    #[test]
    fn create_collection_twice_fails() {
        let store = MemoryStore::new();
        assert!(store.create_collection("logs").is_ok());
        assert!(store.create_collection("logs").is_err());
        assert_eq!(store.has_collection("logs").ok(), Some(true));
        assert_eq!(store.has_collection("other").ok(), Some(false));
    }

    #[test]
    fn insert_one_rejects_duplicate_id() {
        let store = MemoryStore::new();
        assert!(store.insert_one("filters", doc(json!({"_id": "a"}))).is_ok());
        assert!(store.insert_one("filters", doc(json!({"_id": "a"}))).is_err());
        assert_eq!(store.documents("filters").len(), 1);
    }

    #[test]
    fn replace_and_delete_by_id() {
        let store = MemoryStore::new();
        let _ = store.insert_one("filters", doc(json!({"_id": "a", "v": 1})));

        assert_eq!(store.replace_one("filters", "a", doc(json!({"v": 2}))).ok(), Some(true));
        assert_eq!(store.replace_one("filters", "b", doc(json!({"v": 2}))).ok(), Some(false));
        assert_eq!(store.documents("filters"), vec![doc(json!({"v": 2, "_id": "a"}))]);

        assert_eq!(store.delete_one("filters", "a").ok(), Some(true));
        assert_eq!(store.delete_one("filters", "a").ok(), Some(false));
    }

    #[test]
    fn find_sorts_pages_and_projects() {
        let store = MemoryStore::new();
        let docs = (0..5).map(|n| doc(json!({"time": n, "app": "web"}))).collect();
        let _ = store.insert_many("logs", docs, WriteConcern::Acknowledged);

        let opts = FindOptions::all()
            .with_sort(vec![SortKey::desc("time")])
            .with_page(1, 2)
            .with_projection(doc(json!({"time": 1, "_id": 0})));
        let found = store.find("logs", &opts, ReadPreference::Nearest);
        assert_eq!(
            found.ok(),
            Some(vec![doc(json!({"time": 3})), doc(json!({"time": 2}))])
        );
    }

    #[test]
    fn delete_many_by_query() {
        let store = MemoryStore::new();
        let docs = (0..6).map(|n| doc(json!({"n": n}))).collect();
        let _ = store.insert_many("logs", docs, WriteConcern::Acknowledged);
        assert_eq!(store.delete_many("logs", &doc(json!({"n": {"$lt": 4}}))).ok(), Some(4));
        assert_eq!(store.count("logs", &Document::new()).ok(), Some(2));
    }

    #[test]
    fn index_lifecycle() {
        let store = MemoryStore::new();
        let idx = IndexSpec::compound(vec![IndexField::asc("body.service"), IndexField::asc("body.entry")]);
        assert_eq!(
            store.create_index("logs_x", &idx).ok(),
            Some("body.service_1_body.entry_1".to_string())
        );
        assert!(store.create_index("logs_x", &idx).is_ok());
        assert_eq!(store.index_names("logs_x").map(|n| n.len()).ok(), Some(1));
        assert!(store.index_keys("logs_x", &idx.name()).is_some());

        assert!(store.drop_indexes("logs_x").is_ok());
        assert_eq!(store.index_names("logs_x").ok(), Some(Vec::new()));
        assert!(store.create_index("logs_x", &IndexSpec::compound(Vec::new())).is_err());
    }

    #[test]
    fn injected_failures_block_writes_only() {
        let store = MemoryStore::new();
        let _ = store.insert_many("logs", vec![doc(json!({"n": 1}))], WriteConcern::Acknowledged);
        let before = store.write_count();

        store.fail_writes(true);
        assert!(store
            .insert_many("logs", vec![doc(json!({"n": 2}))], WriteConcern::Unacknowledged)
            .is_err());
        assert!(store.create_collection("other").is_err());
        assert_eq!(store.count("logs", &Document::new()).ok(), Some(1));
        assert_eq!(store.write_count(), before);

        store.fail_writes(false);
        assert!(store.create_collection("other").is_ok());
    }

    #[test]
    fn map_reduce_is_unsupported() {
        let store = MemoryStore::new();
        let result = store.map_reduce("logs", "function(){}", "function(){}");
        assert!(matches!(result, Err(LogdError::Unsupported(_))));
    }
}
