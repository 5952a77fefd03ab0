//! Log Recovery
//!
//! Brings every table file to one common checkpoint after a crash.
//!
//! ## Replay
//! ```text
//! start    newest log file whose id ≤ min(table watermarks)
//!   │
//!   ▼
//! for each generation (committed, then a prepared one left pending):
//!     ts > until            → stop
//!     table watermark < ts  → copy its pages home, watermark = ts
//!   │
//!   ▼
//! follow the final chain link to the next log file
//! ```
//! A generation whose timestamp reached the key page was fully logged, so a
//! pending one is rolled forward and committed in place.

use std::path::Path;

use crate::error::{AtlasError, Result};
use crate::page::MagicPage;
use crate::storage::PageFile;

use super::key::MAX_GENERATIONS;
use super::logger::{list_log_files, LogFile};

/// Summary of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RecoveryReport {
    /// Generations that touched at least one table
    pub generations: usize,
    /// Pages copied from the log into table files
    pub pages: usize,
    /// Pending generations committed during recovery
    pub rolled_forward: usize,
}

impl RecoveryReport {
    pub(crate) fn replayed(&self) -> bool {
        self.generations > 0
    }
}

struct Target<'a> {
    name: &'a str,
    file: &'a PageFile,
    watermark: Option<u64>,
}

fn load_targets<'a>(tables: &[(&'a str, &'a PageFile)]) -> Result<Vec<Target<'a>>> {
    tables
        .iter()
        .map(|&(name, file)| {
            let magic = MagicPage::load(file, 0)?;
            Ok(Target {
                name,
                file,
                watermark: magic.has_watermark().then_some(magic.logger_last_check),
            })
        })
        .collect()
}

/// Newest id in `ids` not after `bound`
fn file_at(ids: &[u64], bound: u64) -> Option<u64> {
    ids.iter().rev().copied().find(|&id| id <= bound)
}

/// Replay the log in `log_dir` onto `tables` up to timestamp `until`
pub(crate) fn recover(log_dir: &Path, tables: &[(&str, &PageFile)], until: u64) -> Result<RecoveryReport> {
    let mut targets = load_targets(tables)?;
    let ids = list_log_files(log_dir)?;
    let oldest_watermark = targets.iter().filter_map(|t| t.watermark).min();

    let start = match (ids.first(), oldest_watermark) {
        (None, None) => return Ok(RecoveryReport::default()),
        (None, Some(_)) => {
            return Err(AtlasError::Recovery(
                "tables carry checkpoint watermarks but the log directory is empty".into(),
            ))
        }
        (Some(&first), None) => first,
        (Some(_), Some(watermark)) => file_at(&ids, watermark).ok_or_else(|| {
            AtlasError::Recovery(format!(
                "watermark {} predates the oldest log file {:016x}",
                watermark, ids[0]
            ))
        })?,
    };

    let mut report = RecoveryReport::default();
    let mut next = Some(start);
    'files: while let Some(id) = next {
        let mut log = LogFile::load(log_dir, id)?;
        tracing::debug!(logger = %format!("{:016x}", id), committed = log.key.committed(), "scanning log file");

        let committed = log.key.committed();
        for generation in 0..=committed.min(MAX_GENERATIONS - 1) {
            let timestamp = log.key.stamps[generation];
            let pending = generation == committed;
            if pending && timestamp == 0 {
                break;
            }
            if timestamp > until {
                break 'files;
            }
            replay(&log, generation, timestamp, &mut targets, &mut report)?;
            if pending {
                log.commit()?;
                report.rolled_forward += 1;
                tracing::info!(logger = %format!("{:016x}", id), timestamp, "rolled prepared checkpoint forward");
            }
        }

        next = log
            .key
            .next()
            .filter(|&next| LogFile::path(log_dir, next).exists());
    }
    Ok(report)
}

fn replay(
    log: &LogFile,
    generation: usize,
    timestamp: u64,
    targets: &mut [Target<'_>],
    report: &mut RecoveryReport,
) -> Result<()> {
    let mut touched = false;
    for key in &log.tables {
        let Some(target) = targets.iter_mut().find(|t| t.name == key.name) else {
            continue;
        };
        let range = key.ranges[generation];
        if target.watermark.unwrap_or(0) >= timestamp || range.0 == range.1 {
            continue;
        }
        report.pages += log.copy_range(range, target.file)?;
        target.file.sync()?;
        target.watermark = Some(timestamp);
        touched = true;
    }
    if touched {
        report.generations += 1;
        tracing::info!(timestamp, generation, "replayed checkpoint generation");
    }
    Ok(())
}

/// Commit timestamps a backup in `log_dir` can be recovered to
pub(crate) fn restore_points(log_dir: &Path, tables: &[(&str, &PageFile)]) -> Result<Vec<u64>> {
    let targets = load_targets(tables)?;
    let mut newest = 0;
    for target in &targets {
        match target.watermark {
            Some(watermark) => newest = newest.max(watermark),
            None => {
                return Err(AtlasError::Recovery(format!(
                    "table {} has never been checkpointed",
                    target.name
                )))
            }
        }
    }

    let ids = list_log_files(log_dir)?;
    let mut points = Vec::new();
    let mut next = file_at(&ids, newest).or_else(|| ids.first().copied());
    while let Some(id) = next {
        let log = LogFile::load(log_dir, id)?;
        points.extend(
            log.key.stamps[..log.key.committed()]
                .iter()
                .copied()
                .filter(|&stamp| stamp >= newest),
        );
        next = log
            .key
            .next()
            .filter(|&next| LogFile::path(log_dir, next).exists());
    }
    Ok(points)
}
