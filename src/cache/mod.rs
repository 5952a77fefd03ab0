//! Page Cache Module
//!
//! Everything between the B-tree code and the table files.
//!
//! ## Responsibilities
//! - Shared page directory with epoch-stamped, window-aware eviction
//! - Per-table state: file, magic page, index lock, writer lock
//! - Write barrier letting checkpoints capture a stable snapshot
//!
//! ## Lock Order
//! ```text
//! write barrier → table writer → leaf latches → index lock → page body
//!                                                     ↘ magic page
//! ```
//! The directory mutex is a leaf lock: nothing else is acquired under it.

mod barrier;
mod directory;
mod table;

pub(crate) use directory::Directory;
pub(crate) use table::{TableCache, TableOp};

#[cfg(test)]
pub(crate) use table::tests::{setup_temp_table, setup_temp_table_with};
