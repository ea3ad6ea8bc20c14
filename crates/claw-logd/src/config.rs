//! Service configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration:
//! - Flush cadence and early-wake threshold
//! - Primary and definitions collection names
//! - Invalidation channel name
//! - The filter provisioned on first boot

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::Destination;
use crate::error::{LogdError, Result};
use crate::filter::{Filter, IndexField, IndexSpec};
use crate::types::fields;

/// Default flush cadence in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Default queue length that wakes the flusher early.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// Default name of the stream receiving every record.
pub const DEFAULT_PRIMARY_COLLECTION: &str = "logs";

/// Default name of the filter definitions collection.
pub const DEFAULT_FILTERS_COLLECTION: &str = "filters";

/// Default invalidation channel.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "claw_logs_filters";

/// Configuration for a [`LogService`](crate::LogService).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogServiceConfig {
    /// Flush cadence in milliseconds.
    pub flush_interval_ms: u64,
    /// Queue length at which producers wake the flusher early.
    pub flush_threshold: usize,
    /// Stream receiving every record. Filter streams are named
    /// `<primary_collection>_<id>`.
    pub primary_collection: String,
    /// Collection holding one definition per filter.
    pub filters_collection: String,
    /// Pub/sub channel carrying invalidation messages.
    pub invalidation_channel: String,
    /// Filter created when the definitions collection does not exist yet.
    pub default_filter: Filter,
}

impl Default for LogServiceConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            primary_collection: DEFAULT_PRIMARY_COLLECTION.to_string(),
            filters_collection: DEFAULT_FILTERS_COLLECTION.to_string(),
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_string(),
            default_filter: Filter::default_access(),
        }
    }
}

impl LogServiceConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LogdError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| LogdError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LogdError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(LogdError::Config(
                "flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(LogdError::Config(
                "flush_threshold must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("primary_collection", &self.primary_collection),
            ("filters_collection", &self.filters_collection),
            ("invalidation_channel", &self.invalidation_channel),
        ] {
            if value.trim().is_empty() {
                return Err(LogdError::Config(format!("{name} cannot be empty")));
            }
        }
        if self.primary_collection == self.filters_collection {
            return Err(LogdError::Config(
                "primary_collection and filters_collection must differ".to_string(),
            ));
        }
        self.default_filter
            .validate()
            .map_err(|e| LogdError::Config(format!("default_filter: {e}")))
    }

    /// Sets the flush cadence.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the early-wake threshold.
    #[must_use]
    pub const fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Sets the primary stream name.
    #[must_use]
    pub fn with_primary_collection(mut self, name: impl Into<String>) -> Self {
        self.primary_collection = name.into();
        self
    }

    /// Sets the definitions collection name.
    #[must_use]
    pub fn with_filters_collection(mut self, name: impl Into<String>) -> Self {
        self.filters_collection = name.into();
        self
    }

    /// Sets the invalidation channel.
    #[must_use]
    pub fn with_invalidation_channel(mut self, channel: impl Into<String>) -> Self {
        self.invalidation_channel = channel.into();
        self
    }

    /// Sets the filter provisioned on first boot.
    #[must_use]
    pub fn with_default_filter(mut self, filter: Filter) -> Self {
        self.default_filter = filter;
        self
    }

    /// Returns the flush cadence.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the physical stream backing a destination.
    #[must_use]
    pub fn stream_name(&self, destination: &Destination) -> String {
        destination.stream_name(&self.primary_collection)
    }

    /// Indexes created on the primary stream when it is first provisioned.
    #[must_use]
    pub fn primary_indexes() -> Vec<IndexSpec> {
        [fields::TIME, fields::CATEGORY, fields::APP]
            .into_iter()
            .map(|key| IndexSpec::single(IndexField::asc(key)))
            .collect()
    }
}
