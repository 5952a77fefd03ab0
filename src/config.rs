//! Configuration for AtlasPage
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::btree::{MAX_INDEX_CAPACITY, MAX_LEAF_CAPACITY};

/// Pages a log file may grow to before the next checkpoint rotates it.
pub const MIN_LOGGER_PAGES: u32 = 1024;

/// Cache pages reserved per open table.
pub const MIN_CACHE_PAGES_PER_TABLE: usize = 16;

/// Main configuration for an AtlasPage database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Database directory
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── lock             (held while open)
    ///     ├── data/            (one page file per table)
    ///     ├── log/             (rotating checkpoint log files)
    ///     ├── .tables.add      (present only during a table add)
    ///     └── .tables.remove   (present only during a table removal)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Cache capacity in pages, shared by every table
    pub cache_pages: usize,

    // -------------------------------------------------------------------------
    // Checkpoint Configuration
    // -------------------------------------------------------------------------
    /// Pages a log file may hold before the next checkpoint rotates it
    pub logger_pages: u32,

    /// Background checkpoint period (milliseconds), 0 disables the timer
    pub checkpoint_period_ms: u64,

    /// Checkpoint when the cache cannot shed enough clean pages
    pub checkpoint_on_cache_full: bool,

    /// Abort the process when a checkpoint fails. When false the engine
    /// refuses further work with `AtlasError::Halted` instead.
    pub abort_on_checkpoint_failure: bool,

    /// Stop recovery replay at this commit timestamp (point-in-time restore)
    pub recover_until: u64,

    // -------------------------------------------------------------------------
    // Page Geometry
    // -------------------------------------------------------------------------
    /// Rows per leaf page, clamped to the on-disk maximum
    pub leaf_capacity: usize,

    /// Entries per index page, clamped to the on-disk maximum
    pub index_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlaspage_data"),
            cache_pages: 16 * 1024, // 128 MB of 8 KB pages
            logger_pages: MIN_LOGGER_PAGES,
            checkpoint_period_ms: 3000,
            checkpoint_on_cache_full: true,
            abort_on_checkpoint_failure: true,
            recover_until: u64::MAX,
            leaf_capacity: MAX_LEAF_CAPACITY,
            index_capacity: MAX_INDEX_CAPACITY,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Leaf capacity actually used (2..=340)
    pub(crate) fn effective_leaf_capacity(&self) -> usize {
        self.leaf_capacity.clamp(2, MAX_LEAF_CAPACITY)
    }

    /// Index capacity actually used (3..=255)
    pub(crate) fn effective_index_capacity(&self) -> usize {
        self.index_capacity.clamp(3, MAX_INDEX_CAPACITY)
    }

    pub(crate) fn effective_logger_pages(&self) -> u32 {
        self.logger_pages.max(MIN_LOGGER_PAGES)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the database directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the cache capacity (in pages)
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.config.cache_pages = pages;
        self
    }

    /// Set the log file size (in pages) that triggers rotation
    pub fn logger_pages(mut self, pages: u32) -> Self {
        self.config.logger_pages = pages;
        self
    }

    /// Set the background checkpoint period (0 disables it)
    pub fn checkpoint_period_ms(mut self, ms: u64) -> Self {
        self.config.checkpoint_period_ms = ms;
        self
    }

    /// Request a checkpoint whenever the cache is full of dirty pages
    pub fn checkpoint_on_cache_full(mut self, enabled: bool) -> Self {
        self.config.checkpoint_on_cache_full = enabled;
        self
    }

    /// Abort (true) or halt the engine (false) on checkpoint failure
    pub fn abort_on_checkpoint_failure(mut self, abort: bool) -> Self {
        self.config.abort_on_checkpoint_failure = abort;
        self
    }

    /// Replay logged generations only up to this timestamp on open
    pub fn recover_until(mut self, timestamp: u64) -> Self {
        self.config.recover_until = timestamp;
        self
    }

    /// Set the row capacity of leaf pages
    pub fn leaf_capacity(mut self, rows: usize) -> Self {
        self.config.leaf_capacity = rows;
        self
    }

    /// Set the entry capacity of index pages
    pub fn index_capacity(mut self, entries: usize) -> Self {
        self.config.index_capacity = entries;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
