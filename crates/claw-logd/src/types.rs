//! Core record types.
//!
//! This module provides:
//! - [`LogRecord`]: An immutable structured log record
//! - [`LogRecordBuilder`]: Builder with sensible defaults
//! - [`Document`]: The JSON object shape persisted by the document store
//! - [`category`] and [`fields`]: Well-known categories and persisted field names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LogdError, Result};

/// A JSON object as stored in, and returned by, the document store.
pub type Document = serde_json::Map<String, Value>;

/// Well-known record categories.
pub mod category {
    /// Debugging output.
    pub const DEBUG: i32 = 0;
    /// General information.
    pub const INFO: i32 = 1;
    /// Warning conditions.
    pub const WARN: i32 = 2;
    /// Error conditions.
    pub const ERROR: i32 = 3;
    /// Unrecoverable failures.
    pub const FATAL: i32 = 4;
    /// Request access records emitted by the service container and clients.
    pub const ACCESS: i32 = 5;
}

/// Field names used for persisted log records.
pub mod fields {
    /// Epoch milliseconds.
    pub const TIME: &str = "time";
    /// Record category.
    pub const CATEGORY: &str = "type";
    /// Origin address of the producer.
    pub const ADDR: &str = "addr";
    /// Logical application group.
    pub const TAG: &str = "tag";
    /// Application identifier.
    pub const APP: &str = "app";
    /// Source-code locator (`class#method#line` or similar).
    pub const CODE: &str = "code";
    /// Free-text note.
    pub const TIPS: &str = "tips";
    /// Arbitrary structured payload.
    pub const BODY: &str = "body";
}

/// A structured log record.
///
/// Records are created at ingestion time and never mutated afterwards. The
/// body is passed through without any schema check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the record was produced, in epoch milliseconds.
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// Record category (see [`category`]).
    #[serde(rename = "type")]
    pub category: i32,
    /// Address of the producing process.
    #[serde(rename = "addr", default)]
    pub origin: String,
    /// Logical application group.
    #[serde(default)]
    pub tag: String,
    /// Application identifier.
    #[serde(rename = "app", default)]
    pub app_id: String,
    /// Source-code locator.
    #[serde(rename = "code", default)]
    pub code_locator: String,
    /// Free-text note.
    #[serde(rename = "tips", default)]
    pub note: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub body: Value,
}

impl LogRecord {
    /// Creates a new record builder.
    #[must_use]
    pub fn builder() -> LogRecordBuilder {
        LogRecordBuilder::default()
    }

    /// Decodes the positional wire form
    /// `[time, type, addr, tag, app, code, tips, body]`.
    ///
    /// String fields may be `null`, which decodes to an empty string. The
    /// body may be any JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::InvalidRecord`] if the payload is not an
    /// eight-element array or a field has the wrong type.
    pub fn from_wire(data: &Value) -> Result<Self> {
        let items = data
            .as_array()
            .ok_or_else(|| LogdError::InvalidRecord("expected an array".to_string()))?;
        if items.len() != 8 {
            return Err(LogdError::InvalidRecord(format!(
                "expected 8 fields, got {}",
                items.len()
            )));
        }

        let timestamp = items[0]
            .as_i64()
            .ok_or_else(|| LogdError::InvalidRecord("time must be an integer".to_string()))?;
        let category = items[1]
            .as_i64()
            .and_then(|c| i32::try_from(c).ok())
            .ok_or_else(|| LogdError::InvalidRecord("type must be a 32-bit integer".to_string()))?;

        Ok(Self {
            timestamp,
            category,
            origin: wire_string(&items[2], fields::ADDR)?,
            tag: wire_string(&items[3], fields::TAG)?,
            app_id: wire_string(&items[4], fields::APP)?,
            code_locator: wire_string(&items[5], fields::CODE)?,
            note: wire_string(&items[6], fields::TIPS)?,
            body: items[7].clone(),
        })
    }

    /// Converts the record into its persisted document form.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(fields::TIME.to_string(), Value::from(self.timestamp));
        doc.insert(fields::CATEGORY.to_string(), Value::from(self.category));
        doc.insert(fields::ADDR.to_string(), Value::from(self.origin.as_str()));
        doc.insert(fields::TAG.to_string(), Value::from(self.tag.as_str()));
        doc.insert(fields::APP.to_string(), Value::from(self.app_id.as_str()));
        doc.insert(fields::CODE.to_string(), Value::from(self.code_locator.as_str()));
        doc.insert(fields::TIPS.to_string(), Value::from(self.note.as_str()));
        doc.insert(fields::BODY.to_string(), self.body.clone());
        doc
    }

    /// Decodes a record previously written with [`LogRecord::to_document`].
    ///
    /// Unknown fields such as a store-assigned `_id` are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing or mistyped.
    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc.clone()))?)
    }

    /// Returns the record timestamp as a UTC datetime, if it is in range.
    #[must_use]
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

fn wire_string(value: &Value, field: &'static str) -> Result<String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        _ => Err(LogdError::InvalidRecord(format!("{field} must be a string"))),
    }
}

/// Builder for constructing log records.
///
/// Unset strings default to empty, an unset timestamp defaults to now and an
/// unset body defaults to `null`.
#[derive(Debug, Default)]
pub struct LogRecordBuilder {
    timestamp: Option<i64>,
    category: i32,
    origin: String,
    tag: String,
    app_id: String,
    code_locator: String,
    note: String,
    body: Value,
}

impl LogRecordBuilder {
    /// Sets the timestamp in epoch milliseconds.
    #[must_use]
    pub const fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Sets the category.
    #[must_use]
    pub const fn category(mut self, category: i32) -> Self {
        self.category = category;
        self
    }

    /// Sets the origin address.
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Sets the application identifier.
    #[must_use]
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Sets the source-code locator.
    #[must_use]
    pub fn code_locator(mut self, code: impl Into<String>) -> Self {
        self.code_locator = code.into();
        self
    }

    /// Sets the note.
    #[must_use]
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Builds the record.
    #[must_use]
    pub fn build(self) -> LogRecord {
        LogRecord {
            timestamp: self
                .timestamp
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            category: self.category,
            origin: self.origin,
            tag: self.tag,
            app_id: self.app_id,
            code_locator: self.code_locator,
            note: self.note,
            body: self.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> LogRecord {
        LogRecord::builder()
            .timestamp(1_700_000_000_000)
            .category(category::ERROR)
            .origin("10.0.0.7:7112")
            .tag("billing")
            .app_id("invoice-api")
            .code_locator("Invoice#post#88")
            .note("charge failed")
            .body(json!({"reqId": "r-1", "amount": 42}))
            .build()
    }

    #[test]
    fn builder_defaults() {
        let before = Utc::now().timestamp_millis();
        let record = LogRecord::builder().build();
        assert!(record.timestamp >= before);
        assert_eq!(record.category, 0);
        assert!(record.tag.is_empty());
        assert_eq!(record.body, Value::Null);
    }

    #[test]
    fn document_uses_persisted_field_names() {
        let doc = sample().to_document();
        assert_eq!(doc.get("time"), Some(&json!(1_700_000_000_000_i64)));
        assert_eq!(doc.get("type"), Some(&json!(3)));
        assert_eq!(doc.get("addr"), Some(&json!("10.0.0.7:7112")));
        assert_eq!(doc.get("app"), Some(&json!("invoice-api")));
        assert_eq!(doc.get("code"), Some(&json!("Invoice#post#88")));
        assert_eq!(doc.get("tips"), Some(&json!("charge failed")));
        assert_eq!(doc["body"]["amount"], json!(42));
        assert_eq!(doc.len(), 8);
    }

    #[test]
    fn from_document_ignores_store_id() {
        let mut doc = sample().to_document();
        doc.insert("_id".to_string(), json!("abc"));
        let decoded = LogRecord::from_document(&doc);
        assert!(decoded.is_ok());
        if let Ok(decoded) = decoded {
            assert_eq!(decoded, sample());
        }
    }

    #[test]
    fn from_wire_accepts_positional_array() {
        let wire = json!([
            1_700_000_000_000_i64,
            3,
            "10.0.0.7:7112",
            "billing",
            "invoice-api",
            "Invoice#post#88",
            "charge failed",
            {"reqId": "r-1", "amount": 42}
        ]);
        let record = LogRecord::from_wire(&wire);
        assert!(record.is_ok());
        if let Ok(record) = record {
            assert_eq!(record, sample());
        }
    }

    #[test]
    fn from_wire_null_strings_become_empty() {
        let wire = json!([1, 1, null, null, "app", null, null, null]);
        let record = LogRecord::from_wire(&wire);
        assert!(record.is_ok());
        if let Ok(record) = record {
            assert!(record.origin.is_empty());
            assert_eq!(record.app_id, "app");
            assert_eq!(record.body, Value::Null);
        }
    }

    #[test]
    fn from_wire_rejects_malformed_payloads() {
        let cases = [
            json!({"time": 1}),
            json!([1, 1, "a", "t", "app", "c"]),
            json!(["soon", 1, "a", "t", "app", "c", "n", null]),
            json!([1, 1_i64 << 40, "a", "t", "app", "c", "n", null]),
            json!([1, 1, 7, "t", "app", "c", "n", null]),
        ];
        for wire in cases {
            let result = LogRecord::from_wire(&wire);
            assert!(
                matches!(result, Err(LogdError::InvalidRecord(_))),
                "accepted {wire}"
            );
        }
    }

    #[test]
    fn datetime_conversion() {
        let record = sample();
        let dt = record.datetime();
        assert!(dt.is_some());
        assert_eq!(dt.map(|d| d.timestamp_millis()), Some(record.timestamp));
    }
}
