//! # claw-logd
//!
//! Multi-tenant log ingestion for Clawbernetes services.
//!
//! Records are accepted without blocking, buffered per destination and
//! bulk-written in the background. Every record lands in the primary stream
//! and in the stream of each filter it matches. Filter definitions live in
//! the document store and are kept in sync across instances by broadcast
//! invalidation.
//!
//! This crate provides:
//!
//! - [`LogService`]: One running service instance
//! - [`LogRecord`]: Structured log records and their wire form
//! - [`Filter`]: Routing predicates with per-stream index specs
//! - [`FilterRegistry`]: Atomically swapped filter snapshot and router
//! - [`BatchFlusher`]: Periodic, threshold-woken bulk writer
//! - [`FilterManager`]: Filter create/update/delete/reload
//! - [`InvalidationBus`]: Pub/sub transport, with [`LocalBus`] in process
//! - [`DocumentStore`]: Storage backend trait, with [`MemoryStore`]
//!
//! ## Example
//!
//! ```rust
//! use claw_logd::{Filter, LogRecord, category};
//!
//! let errors = Filter::new("errors").with_categories([category::ERROR]);
//!
//! let record = LogRecord::builder()
//!     .category(category::ERROR)
//!     .app_id("billing")
//!     .note("payment gateway timed out")
//!     .build();
//!
//! assert!(errors.matches(&record));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
pub mod flusher;
pub mod invalidation;
pub mod lifecycle;
pub mod query;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

// Re-export main types
pub use buffer::{Destination, FlushSignal, RecordQueue};
pub use config::LogServiceConfig;
pub use error::{LogdError, Result};
pub use filter::{Filter, IndexField, IndexKind, IndexSpec, validate_identifier};
pub use flusher::{BatchFlusher, FlushMetrics};
pub use invalidation::{BusMessage, Invalidation, InvalidationBus, LocalBus};
pub use lifecycle::FilterManager;
pub use query::{FindRequest, QueryFacade};
pub use registry::{FilterRegistry, RegistrySnapshot, Route};
pub use service::{LogService, ServiceInfo};
pub use store::{DocumentStore, FindOptions, MemoryStore, ReadPreference, SortKey, WriteConcern};
pub use types::{Document, LogRecord, LogRecordBuilder, category, fields};
