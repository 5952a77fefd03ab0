//! Checkpoint Log Module
//!
//! Provides crash consistency for every table of a database through one
//! rotating sequence of log files.
//!
//! ## Responsibilities
//! - Append each checkpoint's page snapshots before they reach table files
//! - Commit a checkpoint across all tables with one double-buffered count
//! - Rotate, chain and retire log files
//! - Replay the log onto table files on open
//!
//! ## File Layout
//! ```text
//! log/
//! ├── 0000018f2a6b1c00      ─┐
//! │   ┌──────────────────┐   │ chain (final link)
//! │   │ file key page    │   │
//! │   │ table key pages  │   │
//! │   │ gen 0 pages ...  │   │
//! │   │ gen 1 pages ...  │   │
//! │   └──────────────────┘   │
//! └── 0000018f2a6b9e40      ◄┘
//! ```

mod key;
mod logger;
mod recovery;

pub use key::MAX_TABLE_NAME;
pub(crate) use logger::{apply, list_log_files, LogFile, Logger, Prepared, TableBatch};
pub(crate) use recovery::{recover, restore_points};
