//! Filter definitions.
//!
//! A [`Filter`] routes the subset of records it matches into a dedicated
//! stream and declares the indexes that stream carries. Restrictions are
//! AND-ed across fields and OR-ed within a field; a missing restriction
//! matches anything.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{LogdError, Result};
use crate::types::{Document, LogRecord, category, fields};

/// Filter identifiers may not start with this prefix.
pub const RESERVED_PREFIX: &str = "system";

/// Characters that collide with the store's namespacing rules.
pub const RESERVED_CHARS: [char; 3] = ['.', '$', '\0'];

/// Identifier of the filter provisioned on first boot.
pub const DEFAULT_FILTER_ID: &str = "access";

/// Application identifier used by the service container for access records.
pub const CONTAINER_APP_ID: &str = "claw.container";

/// Application identifier used by service clients for access records.
pub const CONSUMER_APP_ID: &str = "claw.consumer";

/// Kind of a single index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum IndexKind {
    /// Full-text index (`0` on the wire).
    Text,
    /// Ascending index (`1` on the wire).
    Ascending,
    /// Descending index (`-1` on the wire).
    Descending,
}

impl From<IndexKind> for i32 {
    fn from(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Text => 0,
            IndexKind::Ascending => 1,
            IndexKind::Descending => -1,
        }
    }
}

impl TryFrom<i32> for IndexKind {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Text),
            1 => Ok(Self::Ascending),
            -1 => Ok(Self::Descending),
            other => Err(format!("unknown index type {other}")),
        }
    }
}

impl IndexKind {
    /// Returns the value used for this kind in an index key document.
    #[must_use]
    pub fn key_value(self) -> Value {
        match self {
            Self::Text => Value::from("text"),
            Self::Ascending => Value::from(1),
            Self::Descending => Value::from(-1),
        }
    }

    const fn name_suffix(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Ascending => "1",
            Self::Descending => "-1",
        }
    }
}

/// One key of an index: a field path and its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexField {
    /// Dotted field path, e.g. `body.reqId`.
    pub key: String,
    /// Index kind.
    #[serde(rename = "type")]
    pub kind: IndexKind,
}

impl IndexField {
    /// Creates an index key.
    pub fn new(key: impl Into<String>, kind: IndexKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }

    /// Creates an ascending index key.
    pub fn asc(key: impl Into<String>) -> Self {
        Self::new(key, IndexKind::Ascending)
    }

    /// Creates a descending index key.
    pub fn desc(key: impl Into<String>) -> Self {
        Self::new(key, IndexKind::Descending)
    }

    /// Creates a full-text index key.
    pub fn text(key: impl Into<String>) -> Self {
        Self::new(key, IndexKind::Text)
    }
}

/// An index: an ordered list of keys, possibly compound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSpec(pub Vec<IndexField>);

impl IndexSpec {
    /// Creates a single-key index.
    #[must_use]
    pub fn single(field: IndexField) -> Self {
        Self(vec![field])
    }

    /// Creates a compound index.
    #[must_use]
    pub const fn compound(fields: Vec<IndexField>) -> Self {
        Self(fields)
    }

    /// Returns the conventional index name, e.g. `body.service_1_body.entry_1`.
    #[must_use]
    pub fn name(&self) -> String {
        self.0
            .iter()
            .map(|f| format!("{}_{}", f.key, f.kind.name_suffix()))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Returns the key document handed to the store.
    #[must_use]
    pub fn keys(&self) -> Document {
        self.0
            .iter()
            .map(|f| (f.key.clone(), f.kind.key_value()))
            .collect()
    }

    /// Returns true if the index has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A named routing predicate plus the index set of its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Unique identifier, also the suffix of the stream name.
    #[serde(rename = "_id")]
    pub id: String,
    /// Permitted categories, `None` for any.
    #[serde(rename = "type", default)]
    pub categories: Option<Vec<i32>>,
    /// Permitted tags, `None` for any.
    #[serde(rename = "tag", default)]
    pub tags: Option<Vec<String>>,
    /// Permitted application identifiers, `None` for any.
    #[serde(rename = "app", default)]
    pub apps: Option<Vec<String>>,
    /// Indexes built on the filter's stream.
    #[serde(rename = "index", default, deserialize_with = "null_as_empty")]
    pub indexes: Vec<IndexSpec>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<IndexSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<IndexSpec>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Filter {
    /// Creates an unrestricted filter with no indexes.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            categories: None,
            tags: None,
            apps: None,
            indexes: Vec::new(),
        }
    }

    /// Restricts the filter to the given categories.
    #[must_use]
    pub fn with_categories(mut self, categories: impl IntoIterator<Item = i32>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    /// Restricts the filter to the given tags.
    #[must_use]
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the filter to the given application identifiers.
    #[must_use]
    pub fn with_apps<S: Into<String>>(mut self, apps: impl IntoIterator<Item = S>) -> Self {
        self.apps = Some(apps.into_iter().map(Into::into).collect());
        self
    }

    /// Adds an index to the filter's stream.
    #[must_use]
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Returns the filter provisioned on first boot, which collects access
    /// records from the service container and its clients.
    #[must_use]
    pub fn default_access() -> Self {
        Self::new(DEFAULT_FILTER_ID)
            .with_categories([category::ACCESS])
            .with_apps([CONTAINER_APP_ID, CONSUMER_APP_ID])
            .with_index(IndexSpec::single(IndexField::asc(fields::TIME)))
            .with_index(IndexSpec::single(IndexField::asc(fields::APP)))
            .with_index(IndexSpec::single(IndexField::asc("body.reqId")))
            .with_index(IndexSpec::single(IndexField::asc("body.seqId")))
            .with_index(IndexSpec::compound(vec![
                IndexField::asc("body.service"),
                IndexField::asc("body.entry"),
            ]))
    }

    /// Returns true if every present restriction admits the record.
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(ref categories) = self.categories {
            if !categories.contains(&record.category) {
                return false;
            }
        }
        if let Some(ref tags) = self.tags {
            if !tags.iter().any(|t| *t == record.tag) {
                return false;
            }
        }
        if let Some(ref apps) = self.apps {
            if !apps.iter().any(|a| *a == record.app_id) {
                return false;
            }
        }
        true
    }

    /// Validates the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidIdentifier`] if the identifier is invalid.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.id)
    }

    /// Encodes the filter as a definitions-collection document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            other => Err(LogdError::InvalidRecord(format!(
                "filter encoded as non-object {other}"
            ))),
        }
    }

    /// Decodes a definitions-collection document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid filter.
    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc.clone()))?)
    }
}

/// Checks that a filter identifier is usable as a stream-name suffix.
///
/// # Errors
///
/// Returns [`LogdError::InvalidIdentifier`] if the identifier is blank,
/// contains a reserved character or starts with [`RESERVED_PREFIX`].
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.trim().is_empty()
        || id.contains(RESERVED_CHARS)
        || id.starts_with(RESERVED_PREFIX)
    {
        return Err(LogdError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    fn record(category: i32, tag: &str, app: &str) -> LogRecord {
        LogRecord::builder()
            .timestamp(1)
            .category(category)
            .tag(tag)
            .app_id(app)
            .build()
    }

    #[test_case("errors", true ; "plain")]
    #[test_case("svc-01_access", true ; "dash and underscore")]
    #[test_case("", false ; "empty")]
    #[test_case("   ", false ; "blank")]
    #[test_case("a.b", false ; "dot")]
    #[test_case("cost$", false ; "dollar")]
    #[test_case("nul\0", false ; "nul")]
    #[test_case("system", false ; "reserved prefix")]
    #[test_case("systemd", false ; "reserved prefix with suffix")]
    #[test_case("my_system", true ; "prefix only at start")]
    fn identifier_validation(id: &str, valid: bool) {
        let result = validate_identifier(id);
        assert_eq!(result.is_ok(), valid);
        if let Err(e) = result {
            assert!(e.is_validation());
        }
    }

    #[test]
    fn unrestricted_filter_matches_everything() {
        let filter = Filter::new("all");
        assert!(filter.matches(&record(0, "", "")));
        assert!(filter.matches(&record(9, "x", "y")));
    }

    #[test]
    fn category_restriction() {
        let filter = Filter::new("errors").with_categories([2]);
        assert!(filter.matches(&record(2, "t", "a")));
        assert!(!filter.matches(&record(1, "t", "a")));
    }

    #[test]
    fn restrictions_are_anded_across_fields() {
        let filter = Filter::new("billing-errors")
            .with_categories([category::ERROR, category::FATAL])
            .with_tags(["billing"])
            .with_apps(["invoice-api", "ledger"]);

        assert!(filter.matches(&record(category::ERROR, "billing", "ledger")));
        assert!(filter.matches(&record(category::FATAL, "billing", "invoice-api")));
        assert!(!filter.matches(&record(category::INFO, "billing", "ledger")));
        assert!(!filter.matches(&record(category::ERROR, "search", "ledger")));
        assert!(!filter.matches(&record(category::ERROR, "billing", "web")));
    }

    #[test]
    fn empty_restriction_matches_nothing() {
        let filter = Filter::new("none").with_tags(Vec::<String>::new());
        assert!(!filter.matches(&record(1, "", "")));
    }

    #[test]
    fn default_access_filter() {
        let filter = Filter::default_access();
        assert_eq!(filter.id, DEFAULT_FILTER_ID);
        assert!(filter.validate().is_ok());
        assert!(filter.matches(&record(category::ACCESS, "any", CONTAINER_APP_ID)));
        assert!(!filter.matches(&record(category::ACCESS, "any", "other")));
        assert_eq!(filter.indexes.len(), 5);
        assert_eq!(filter.indexes[4].name(), "body.service_1_body.entry_1");
    }

    #[test]
    fn index_names_and_keys() {
        let idx = IndexSpec::compound(vec![IndexField::text("tips"), IndexField::desc("time")]);
        assert_eq!(idx.name(), "tips_text_time_-1");
        let keys = idx.keys();
        assert_eq!(keys.get("tips"), Some(&json!("text")));
        assert_eq!(keys.get("time"), Some(&json!(-1)));
    }

    #[test]
    fn document_layout() {
        let filter = Filter::new("errors")
            .with_categories([2])
            .with_index(IndexSpec::single(IndexField::asc("time")));
        let doc = filter.to_document();
        assert!(doc.is_ok());
        if let Ok(doc) = doc {
            assert_eq!(doc.get("_id"), Some(&json!("errors")));
            assert_eq!(doc.get("type"), Some(&json!([2])));
            assert_eq!(doc.get("tag"), Some(&Value::Null));
            assert_eq!(doc.get("index"), Some(&json!([[{"key": "time", "type": 1}]])));
            let decoded = Filter::from_document(&doc);
            assert_eq!(decoded.ok(), Some(filter));
        }
    }

    #[test]
    fn decode_tolerates_missing_and_null_fields() {
        let doc = json!({"_id": "bare", "index": null});
        let filter: std::result::Result<Filter, _> = serde_json::from_value(doc);
        assert!(filter.is_ok());
        if let Ok(filter) = filter {
            assert_eq!(filter, Filter::new("bare"));
        }
    }

    #[test]
    fn decode_rejects_unknown_index_kind() {
        let doc = json!({"_id": "bad", "index": [[{"key": "time", "type": 2}]]});
        let filter: std::result::Result<Filter, _> = serde_json::from_value(doc);
        assert!(filter.is_err());
    }

    mod proptest_tests {
        use super::*;

        fn restriction<T: std::fmt::Debug + Clone + 'static>(
            values: impl Strategy<Value = T> + 'static,
        ) -> impl Strategy<Value = Option<Vec<T>>> {
            prop::option::of(prop::collection::vec(values, 0..4))
        }

        proptest! {
            #[test]
            fn matches_iff_every_present_restriction_contains_value(
                categories in restriction(0..4i32),
                tags in restriction(prop::sample::select(vec!["a", "b", "c"])),
                apps in restriction(prop::sample::select(vec!["x", "y"])),
                rec_category in 0..4i32,
                rec_tag in prop::sample::select(vec!["a", "b", "c"]),
                rec_app in prop::sample::select(vec!["x", "y"]),
            ) {
                let filter = Filter {
                    id: "p".to_string(),
                    categories: categories.clone(),
                    tags: tags.clone().map(|v| v.into_iter().map(String::from).collect()),
                    apps: apps.clone().map(|v| v.into_iter().map(String::from).collect()),
                    indexes: Vec::new(),
                };
                let rec = record(rec_category, rec_tag, rec_app);

                let expected = categories.is_none_or(|c| c.contains(&rec_category))
                    && tags.is_none_or(|t| t.contains(&rec_tag))
                    && apps.is_none_or(|a| a.contains(&rec_app));
                prop_assert_eq!(filter.matches(&rec), expected);
            }
        }
    }
}
