//! # AtlasPage
//!
//! An embedded, page-based key-value storage engine with:
//! - A B-tree index over chained, sorted leaf pages per table
//! - A record allocator packing variable-length records into data pages
//! - One shared page cache with epoch-stamped eviction
//! - Checkpoints made crash-consistent by a rotating redo log
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Engine  (tables, scheduler)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ TableHandle: get / put / remove / walk
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        B-tree  (index pages → leaf page chain)              │
//! │        Records (data page segments, fragment lists)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ TableOp: page / alloc / free
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        Page cache  (directory, epoch stamps, barrier)       │
//! └──────────┬───────────────────────────────────┬──────────────┘
//!            │ load                              │ checkpoint snapshots
//!            ▼                                   ▼
//!   ┌─────────────────┐   apply        ┌──────────────────────┐
//!   │  data/<table>   │ ◄───────────── │   log/<%016x> files  │
//!   └─────────────────┘                └──────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod storage;
pub mod engine;
pub mod table;

mod btree;
mod cache;
mod page;
mod record;
mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, ConfigBuilder};
pub use engine::{CrashPoint, Engine};
pub use error::{AtlasError, Result};
pub use table::TableHandle;
pub use wal::MAX_TABLE_NAME;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasPage
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
