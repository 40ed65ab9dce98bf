use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Largest batch a single batch-get call accepts
pub const MAX_BATCH_GET: usize = 100;

/// Largest batch a single batch-write call accepts
pub const MAX_BATCH_WRITE: usize = 25;

/// Engine configuration for planning and execution behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Whether SELECT, COUNT, UPDATE and DELETE may fall back to a full scan
    /// when no index fits the predicate
    pub allow_scan: bool,

    /// Reject an ORDER BY on a non-key attribute combined with LIMIT instead
    /// of warning that the sorted prefix may be incomplete
    pub strict_ordering: bool,

    /// Per-page item limit sent to the store (None = store default)
    pub page_size: Option<usize>,

    /// Keys per batch-get call (1-100)
    pub batch_get_size: usize,

    /// Writes per batch-write call (1-25)
    pub batch_write_size: usize,

    /// Retry policy applied to every store call
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_scan: false,
            strict_ordering: false,
            page_size: None,
            batch_get_size: MAX_BATCH_GET,
            batch_write_size: MAX_BATCH_WRITE,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow plans to fall back to a full scan
    pub fn with_allow_scan(mut self, allow: bool) -> Self {
        self.allow_scan = allow;
        self
    }

    pub fn with_strict_ordering(mut self, strict: bool) -> Self {
        self.strict_ordering = strict;
        self
    }

    /// Set the per-page item limit
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_batch_get_size(mut self, size: usize) -> Self {
        self.batch_get_size = size;
        self
    }

    pub fn with_batch_write_size(mut self, size: usize) -> Self {
        self.batch_write_size = size;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_get_size == 0 || self.batch_get_size > MAX_BATCH_GET {
            return Err(format!("batch_get_size must be between 1 and {}", MAX_BATCH_GET));
        }

        if self.batch_write_size == 0 || self.batch_write_size > MAX_BATCH_WRITE {
            return Err(format!("batch_write_size must be between 1 and {}", MAX_BATCH_WRITE));
        }

        if let Some(size) = self.page_size {
            if size == 0 {
                return Err("page_size must be greater than 0 when set".to_string());
            }
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err("retry.backoff_multiplier must be at least 1.0".to_string());
        }

        Ok(())
    }
}
