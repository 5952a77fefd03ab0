//! Checkpoint Logger
//!
//! Owns the current log file and drives the log side of a checkpoint.
//!
//! ## Checkpoint Phases
//! ```text
//!  prepare        append every table's snapshot pages, sync,
//!                 write the generation's timestamp, sync
//!  apply          copy the pages home into each table file (one thread
//!                 per table), stamp the magic page watermark, sync
//!  commit         stage count+1 in the spare slot, sync, flip, sync
//!  cleanup        after a rotation: delete (or archive) older log files
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{AtlasError, Result};
use crate::page::TRAILER;
use crate::storage::{addr_index, get_u64, put_u64, PageBuffer, PageFile};

use super::key::{FileKey, TableKey, MAX_GENERATIONS};

/// Offsets of the watermark fields inside a magic page
const MAGIC_LOGGER_ID: usize = 24;
const MAGIC_LAST_CHECK: usize = 32;

/// One table's share of a checkpoint; the last page is its magic page
pub(crate) struct TableBatch {
    pub name: String,
    pub pages: Vec<PageBuffer>,
}

/// What `prepare` logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Prepared {
    pub logger_id: u64,
    pub timestamp: u64,
    pub generation: usize,
    pub rotated: bool,
}

/// An open log file with its decoded key pages
pub(crate) struct LogFile {
    pub id: u64,
    pub file: PageFile,
    pub key: FileKey,
    pub tables: Vec<TableKey>,
}

impl LogFile {
    pub(crate) fn path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{:016x}", id))
    }

    pub(crate) fn load(dir: &Path, id: u64) -> Result<Self> {
        let file = PageFile::open(&Self::path(dir, id))?;
        let key = FileKey::load(&file)?;
        let mut tables = Vec::with_capacity(key.heads as usize - 1);
        let mut buf = PageBuffer::recycled();
        for page in 1..key.heads as u64 {
            file.read_page(page, &mut buf)?;
            tables.push(TableKey::decode(&buf)?);
        }
        Ok(Self { id, file, key, tables })
    }

    pub(crate) fn table(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|table| table.name == name)
    }

    /// Copy the pages of `range` into `target` at the index named by each
    /// page's trailer
    pub(crate) fn copy_range(&self, (start, end): (u32, u32), target: &PageFile) -> Result<usize> {
        let mut buf = PageBuffer::recycled();
        for page in start..end {
            self.file.read_page(page as u64, &mut buf)?;
            target.write_page(addr_index(get_u64(&buf, TRAILER)), &buf)?;
        }
        Ok((end - start) as usize)
    }

    /// Make generation `committed()` part of the committed count
    pub(crate) fn commit(&mut self) -> Result<()> {
        self.key.stage_commit();
        self.key.save(&self.file)?;
        self.file.sync()?;
        self.key.flip();
        self.key.save(&self.file)?;
        self.file.sync()
    }
}

/// Ids of every log file in `dir`, oldest first
pub(crate) fn list_log_files(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() == 16 {
            if let Ok(id) = u64::from_str_radix(name, 16) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// The engine's log writer. Held under the checkpoint lock.
pub(crate) struct Logger {
    dir: PathBuf,
    max_pages: u32,
    current: Option<LogFile>,
    clock: u64,
    rotated: bool,
    archive: Option<PathBuf>,
}

impl Logger {
    /// Resume the newest log file in `dir`, if any
    pub(crate) fn open(dir: &Path, max_pages: u32) -> Result<Self> {
        let current = match list_log_files(dir)?.last() {
            Some(&id) => Some(LogFile::load(dir, id)?),
            None => None,
        };
        let clock = current
            .as_ref()
            .map(|log| log.key.stamps.iter().copied().max().unwrap_or(0).max(log.id))
            .unwrap_or(0);
        Ok(Self {
            dir: dir.to_path_buf(),
            max_pages,
            current,
            clock,
            rotated: false,
            archive: None,
        })
    }

    /// Id of the log file checkpoints currently append to
    pub(crate) fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|log| log.id)
    }

    /// Move superseded log files into `dir` instead of deleting them
    pub(crate) fn set_archive(&mut self, dir: Option<PathBuf>) {
        self.archive = dir;
    }

    /// Strictly increasing millisecond timestamp
    fn tick(&mut self) -> u64 {
        self.clock = now_ms().max(self.clock + 1);
        self.clock
    }

    fn must_rotate(&self, batches: &[TableBatch], force: bool) -> bool {
        let Some(log) = &self.current else { return true };
        force
            || log.key.page_header > self.max_pages
            || log.key.committed() >= MAX_GENERATIONS
            || batches.iter().any(|batch| log.table(&batch.name).is_none())
    }

    /// Start a new log file keyed for `batches` and link the old one to it
    fn rotate(&mut self, batches: &[TableBatch]) -> Result<()> {
        let id = self.tick();
        let file = PageFile::open(&LogFile::path(&self.dir, id))?;
        let key = FileKey::new(batches.len());
        let tables: Vec<TableKey> = batches.iter().map(|batch| TableKey::new(&batch.name)).collect();
        for (i, table) in tables.iter().enumerate() {
            file.write_page(1 + i as u64, &table.encode())?;
        }
        key.save(&file)?;
        file.sync()?;

        if let Some(mut previous) = self.current.take() {
            previous.key.set_chain(id, false);
            previous.key.save(&previous.file)?;
            previous.file.sync()?;
            previous.key.set_chain(id, true);
            previous.key.save(&previous.file)?;
            previous.file.sync()?;
        }
        tracing::info!(logger = %format!("{:016x}", id), tables = batches.len(), "log file rotated");
        self.current = Some(LogFile { id, file, key, tables });
        self.rotated = true;
        Ok(())
    }

    /// Append `batches` as the next generation and write its timestamp.
    ///
    /// Each batch's trailing magic page is stamped with the watermark the
    /// table will carry once the generation is applied.
    pub(crate) fn prepare(&mut self, batches: &mut [TableBatch], force_rotate: bool) -> Result<Prepared> {
        let rotated = self.must_rotate(batches, force_rotate);
        if rotated {
            self.rotate(batches)?;
        }
        let timestamp = self.tick();
        let log = self
            .current
            .as_mut()
            .ok_or_else(|| AtlasError::invariant("no log file after rotation"))?;
        let generation = log.key.committed();
        let mut page_header = log.key.page_header;

        for batch in batches.iter_mut() {
            let slot = log
                .table(&batch.name)
                .ok_or_else(|| AtlasError::invariant(format!("table {} missing from log file", batch.name)))?;
            if let Some(magic) = batch.pages.last_mut() {
                put_u64(magic, MAGIC_LOGGER_ID, log.id);
                put_u64(magic, MAGIC_LAST_CHECK, timestamp);
            }
            let start = page_header;
            for page in &batch.pages {
                log.file.write_page(page_header as u64, page)?;
                page_header += 1;
            }
            log.tables[slot].ranges[generation] = (start, page_header);
            log.file.write_page(1 + slot as u64, &log.tables[slot].encode())?;
        }
        log.key.page_header = page_header;
        log.key.save(&log.file)?;
        log.file.sync()?;

        log.key.stamps[generation] = timestamp;
        log.key.save(&log.file)?;
        log.file.sync()?;

        Ok(Prepared {
            logger_id: log.id,
            timestamp,
            generation,
            rotated,
        })
    }

    /// Flip the committed count over the prepared generation
    pub(crate) fn commit(&mut self) -> Result<()> {
        match self.current.as_mut() {
            Some(log) => log.commit(),
            None => Err(AtlasError::invariant("commit without a log file")),
        }
    }

    /// After a rotation, drop every log file but the current one
    pub(crate) fn cleanup(&mut self) -> Result<()> {
        if !self.rotated {
            return Ok(());
        }
        self.rotated = false;
        let current = self.current_id();
        for id in list_log_files(&self.dir)? {
            if Some(id) == current {
                continue;
            }
            let path = LogFile::path(&self.dir, id);
            let outcome = match &self.archive {
                Some(archive) => fs::rename(&path, LogFile::path(archive, id)),
                None => fs::remove_file(&path),
            };
            match outcome {
                Ok(()) => tracing::debug!(logger = %format!("{:016x}", id), archived = self.archive.is_some(), "log file retired"),
                Err(e) => tracing::warn!(logger = %format!("{:016x}", id), error = %e, "failed to retire log file"),
            }
        }
        Ok(())
    }
}

/// Copy every batch to its table file, one scoped thread per table, and
/// sync each file
pub(crate) fn apply(jobs: &[(&PageFile, &[PageBuffer])]) -> Result<()> {
    let results = crossbeam::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter()
            .map(|(file, pages)| {
                scope.spawn(move |_| -> Result<()> {
                    for page in pages.iter() {
                        file.write_page(addr_index(get_u64(page, TRAILER)), page)?;
                    }
                    file.sync()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(AtlasError::invariant("checkpoint apply thread panicked")))
            })
            .collect::<Vec<_>>()
    })
    .map_err(|_| AtlasError::invariant("checkpoint apply scope panicked"))?;
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{MagicPage, PageBody};
    use tempfile::TempDir;

    fn setup_temp_logger(max_pages: u32) -> (TempDir, Logger) {
        let temp = TempDir::new().unwrap();
        let logger = Logger::open(temp.path(), max_pages).unwrap();
        (temp, logger)
    }

    fn batch(name: &str, pages: &[u64]) -> TableBatch {
        let mut out: Vec<PageBuffer> = pages
            .iter()
            .map(|&index| PageBody::Free { next: index * 10 }.encode(index))
            .collect();
        out.push(MagicPage::new().encode());
        TableBatch {
            name: name.to_string(),
            pages: out,
        }
    }

    #[test]
    fn test_first_prepare_rotates_and_stamps_magic() {
        let (temp, mut logger) = setup_temp_logger(1024);
        let mut batches = vec![batch("a", &[1, 2]), batch("b", &[])];
        let prepared = logger.prepare(&mut batches, false).unwrap();
        assert!(prepared.rotated);
        assert_eq!(prepared.generation, 0);

        let magic = MagicPage::decode(batches[0].pages.last().unwrap());
        assert_eq!(magic.logger_id, prepared.logger_id);
        assert_eq!(magic.logger_last_check, prepared.timestamp);

        let log = LogFile::load(temp.path(), prepared.logger_id).unwrap();
        assert_eq!(log.key.heads, 3);
        assert_eq!(log.key.committed(), 0);
        assert_eq!(log.key.stamps[0], prepared.timestamp);
        assert_eq!(log.tables[0].ranges[0], (3, 6));
        assert_eq!(log.tables[1].ranges[0], (6, 7));
    }

    #[test]
    fn test_commit_and_second_generation_share_file() {
        let (temp, mut logger) = setup_temp_logger(1024);
        let first = logger.prepare(&mut vec![batch("a", &[1])], false).unwrap();
        logger.commit().unwrap();
        let second = logger.prepare(&mut vec![batch("a", &[2])], false).unwrap();
        logger.commit().unwrap();

        assert!(!second.rotated);
        assert_eq!(second.logger_id, first.logger_id);
        assert_eq!(second.generation, 1);
        assert!(second.timestamp > first.timestamp);
        let log = LogFile::load(temp.path(), first.logger_id).unwrap();
        assert_eq!(log.key.committed(), 2);
    }

    #[test]
    fn test_new_table_forces_rotation_and_cleanup() {
        let (temp, mut logger) = setup_temp_logger(1024);
        let first = logger.prepare(&mut vec![batch("a", &[1])], false).unwrap();
        logger.commit().unwrap();
        logger.cleanup().unwrap();

        let second = logger
            .prepare(&mut vec![batch("a", &[1]), batch("b", &[1])], false)
            .unwrap();
        assert!(second.rotated);
        assert_ne!(second.logger_id, first.logger_id);

        let old = LogFile::load(temp.path(), first.logger_id).unwrap();
        assert_eq!(old.key.next(), Some(second.logger_id));

        logger.commit().unwrap();
        logger.cleanup().unwrap();
        assert_eq!(list_log_files(temp.path()).unwrap(), vec![second.logger_id]);
    }

    #[test]
    fn test_apply_writes_pages_home() {
        let temp = TempDir::new().unwrap();
        let file = PageFile::open(&temp.path().join("t")).unwrap();
        let table = batch("t", &[3]);
        apply(&[(&file, &table.pages)]).unwrap();

        let mut buf = PageBuffer::recycled();
        file.read_page(3, &mut buf).unwrap();
        assert!(matches!(PageBody::decode(3, buf).unwrap(), PageBody::Free { next: 30 }));
        assert!(!MagicPage::load(&file, 0).unwrap().has_watermark());
    }
}
