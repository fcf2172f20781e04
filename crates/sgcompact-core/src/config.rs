use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dag::OrderStrategy;
use crate::error::CompactError;
use crate::interval::DEFAULT_PAGE_SIZE;
use crate::loader::{BatchLoader, RetryPolicy};

/// Largest accepted batch; keeps `IN (...)` lists under SQLite's variable cap.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Settings of one compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Room whose state groups are compacted.
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub order: OrderStrategy,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_true")]
    pub prune: bool,
    #[serde(default)]
    pub prefetch: bool,
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            scope: String::new(),
            batch_size: default_batch_size(),
            order: OrderStrategy::default(),
            page_size: default_page_size(),
            prune: default_true(),
            prefetch: false,
            max_batch_retries: default_max_batch_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl CompactionConfig {
    /// Defaults for `scope`.
    #[must_use]
    pub fn for_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CompactError::Config`] naming the first bad field.
    pub fn validate(&self) -> Result<(), CompactError> {
        if self.scope.trim().is_empty() {
            return Err(CompactError::Config("scope must not be empty".into()));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(CompactError::Config(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.page_size == 0 {
            return Err(CompactError::Config("page_size must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_batch_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    #[must_use]
    pub const fn loader(&self) -> BatchLoader {
        BatchLoader {
            batch_size: self.batch_size,
            retry: self.retry_policy(),
            prefetch: self.prefetch,
        }
    }
}

/// First existing config file: `explicit`, then `./sgcompact.toml`, then
/// `<config dir>/sgcompact/config.toml`.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = PathBuf::from("sgcompact.toml");
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("sgcompact/config.toml"))
        .filter(|path| path.exists())
}

/// Load a config file; a missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<CompactionConfig> {
    if !path.exists() {
        return Ok(CompactionConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<CompactionConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

const fn default_true() -> bool {
    true
}

const fn default_batch_size() -> usize {
    100
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

const fn default_max_batch_retries() -> u32 {
    3
}

const fn default_retry_base_delay_ms() -> u64 {
    50
}
