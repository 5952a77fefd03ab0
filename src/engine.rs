//! Engine Module
//!
//! The database facade that coordinates tables, the shared page cache and
//! the checkpoint log.
//!
//! ## Responsibilities
//! - Own the database directory and its lock file
//! - Register tables and apply crash-safe schema changes
//! - Run recovery on open
//! - Schedule checkpoints (timer, cache pressure, on demand, on close)
//! - Backups and restore points
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/
//!   ├── lock             exclusive while open
//!   ├── data/<table>     one page file per table
//!   ├── log/<%016x>      checkpoint log files
//!   ├── .tables.add      present only while tables are being added
//!   └── .tables.remove   present only while tables are being removed
//! ```
//!
//! ## Checkpoint
//! ```text
//! freeze every table ─► capture dirty snapshots + magic pages ─► unfreeze
//!        │                       (eviction stays off from here ...)
//!        ▼
//! prepare (log) ─► apply (table files) ─► commit (flip) ─► cleanup
//!                                                  (... until here)
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cache::{Directory, TableCache};
use crate::config::{Config, MIN_CACHE_PAGES_PER_TABLE};
use crate::error::{AtlasError, Result};
use crate::page::MagicPage;
use crate::storage::{PageBuffer, PageFile};
use crate::table::{OpenTable, TableHandle};
use crate::wal::{self, Logger, TableBatch, MAX_TABLE_NAME};

/// Where a simulated crash interrupts a checkpoint
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Snapshots captured, nothing logged
    BeforePrepare,
    /// Generation logged with its timestamp, table files untouched
    AfterPrepare,
    /// Table files written, count not flipped
    AfterApply,
    /// Count flipped, old log files not cleaned up
    AfterFlip,
}

// =============================================================================
// Table name rules and schema markers
// =============================================================================

/// Lowercased `name` if it can name a table file
fn normalize_name(name: &str) -> Result<String> {
    let lower = name.to_ascii_lowercase();
    let valid = !lower.is_empty()
        && lower.len() <= MAX_TABLE_NAME
        && lower
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(lower)
    } else {
        Err(AtlasError::InvalidTableName(name.to_string()))
    }
}

/// Pending schema change, written before the change is applied
#[derive(Debug, Serialize, Deserialize)]
struct SchemaMarker {
    names: Vec<String>,
    complete: bool,
    crc: u32,
}

impl SchemaMarker {
    fn checksum(names: &[String]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize()
    }

    fn write(path: &Path, names: &[String]) -> Result<()> {
        let marker = SchemaMarker {
            names: names.to_vec(),
            complete: true,
            crc: Self::checksum(names),
        };
        let file = File::create(path)?;
        bincode::serialize_into(&file, &marker)?;
        file.sync_all()?;
        Ok(())
    }

    /// Names of an intact marker at `path`. A torn marker means the change
    /// never started and is dropped.
    fn read(path: &Path) -> Result<Option<Vec<String>>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        match bincode::deserialize::<SchemaMarker>(&bytes) {
            Ok(marker) if marker.complete && marker.crc == Self::checksum(&marker.names) => Ok(Some(marker.names)),
            _ => {
                tracing::warn!(path = %path.display(), "discarding torn schema marker");
                fs::remove_file(path)?;
                Ok(None)
            }
        }
    }
}

// =============================================================================
// Shared engine state
// =============================================================================

struct Shared {
    config: Config,
    data_dir: PathBuf,
    log_dir: PathBuf,
    directory: Arc<Directory>,
    tables: RwLock<BTreeMap<String, Arc<OpenTable>>>,
    /// Held for a whole checkpoint; serializes checkpoints and backups
    logger: Mutex<Logger>,
    /// Serializes table adds and removals
    schema: Mutex<()>,
    halted: Arc<AtomicBool>,
    next_id: AtomicU32,
}

impl Shared {
    fn check_running(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(AtlasError::Halted);
        }
        Ok(())
    }

    fn register(&self, name: String, file: PageFile) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cache = TableCache::new(
            id,
            name.clone(),
            file,
            Arc::clone(&self.directory),
            self.config.effective_leaf_capacity(),
            self.config.effective_index_capacity(),
        )?;
        let table = Arc::new(OpenTable::new(Arc::new(cache), Arc::clone(&self.halted)));
        let mut tables = self.tables.write();
        tables.insert(name, table);
        self.directory
            .set_capacity(self.config.cache_pages.max(MIN_CACHE_PAGES_PER_TABLE * tables.len()));
        Ok(())
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    fn checkpoint(&self, force_rotate: bool) -> Result<()> {
        self.run_checkpoint(force_rotate, None)
    }

    /// One checkpoint. `crash` stops it at the given point, as if the
    /// process died there.
    fn run_checkpoint(&self, force_rotate: bool, crash: Option<CrashPoint>) -> Result<()> {
        self.check_running()?;
        let mut logger = self.logger.lock();
        let tables: Vec<Arc<OpenTable>> = self.tables.read().values().cloned().collect();

        for table in &tables {
            table.cache().barrier().freeze();
        }
        let mut snapshots = self.directory.capture_snapshots();
        let dirty = snapshots.values().any(|pages| !pages.is_empty());
        let mut batches: Vec<(Arc<OpenTable>, TableBatch)> = Vec::new();
        // Once anything is dirty, every table logs its magic page and its
        // watermark moves with the generation, idle tables included.
        for table in tables.iter().filter(|_| dirty || force_rotate) {
            let cache = table.cache();
            let mut pages = snapshots.remove(&cache.id()).unwrap_or_default();
            pages.push(cache.magic().encode());
            let batch = TableBatch {
                name: cache.name().to_string(),
                pages,
            };
            batches.push((Arc::clone(table), batch));
        }
        for table in &tables {
            table.cache().barrier().unfreeze();
        }

        if batches.is_empty() {
            self.directory.permit_wash();
            return Ok(());
        }
        if crash == Some(CrashPoint::BeforePrepare) {
            return Ok(());
        }

        let logged: usize = batches.iter().map(|(_, batch)| batch.pages.len()).sum();
        tracing::debug!(tables = batches.len(), pages = logged, force_rotate, "checkpoint started");

        match self.log_and_apply(&mut logger, &mut batches, force_rotate, crash) {
            Ok(Some(prepared)) => {
                for (table, _) in &batches {
                    let mut magic = table.cache().magic();
                    magic.logger_id = prepared.logger_id;
                    magic.logger_last_check = prepared.timestamp;
                }
                if crash == Some(CrashPoint::AfterFlip) {
                    return Ok(());
                }
                if let Err(e) = logger.cleanup() {
                    tracing::warn!(error = %e, "log cleanup failed");
                }
                self.directory.permit_wash();
                tracing::info!(
                    logger = %format!("{:016x}", prepared.logger_id),
                    timestamp = prepared.timestamp,
                    generation = prepared.generation,
                    rotated = prepared.rotated,
                    pages = logged,
                    "checkpoint committed"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "checkpoint failed");
                if self.config.abort_on_checkpoint_failure {
                    std::process::abort();
                }
                self.halted.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Prepare, apply and commit one generation. `None` when a simulated
    /// crash cut it short.
    fn log_and_apply(
        &self,
        logger: &mut Logger,
        batches: &mut [(Arc<OpenTable>, TableBatch)],
        force_rotate: bool,
        crash: Option<CrashPoint>,
    ) -> Result<Option<wal::Prepared>> {
        let mut logged: Vec<TableBatch> = batches
            .iter_mut()
            .map(|(_, batch)| TableBatch {
                name: std::mem::take(&mut batch.name),
                pages: std::mem::take(&mut batch.pages),
            })
            .collect();
        let prepared = logger.prepare(&mut logged, force_rotate)?;
        if crash == Some(CrashPoint::AfterPrepare) {
            return Ok(None);
        }

        let jobs: Vec<(&PageFile, &[PageBuffer])> = batches
            .iter()
            .zip(&logged)
            .map(|((table, _), batch)| (table.cache().file(), batch.pages.as_slice()))
            .collect();
        wal::apply(&jobs)?;
        if crash == Some(CrashPoint::AfterApply) {
            return Ok(None);
        }

        logger.commit()?;
        Ok(Some(prepared))
    }
}

// =============================================================================
// Checkpoint scheduler
// =============================================================================

struct Scheduler {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    fn start(shared: Arc<Shared>, requests: Receiver<()>) -> Result<Self> {
        let (shutdown, stop) = channel::bounded::<()>(1);
        let period = shared.config.checkpoint_period_ms;
        let ticks = if period > 0 {
            channel::tick(Duration::from_millis(period))
        } else {
            channel::never()
        };
        let handle = thread::Builder::new()
            .name("atlaspage-checkpoint".into())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stop) -> _ => break,
                    recv(requests) -> request => {
                        if request.is_err() {
                            break;
                        }
                        if let Err(e) = shared.checkpoint(false) {
                            tracing::warn!(error = %e, "requested checkpoint failed");
                        }
                    }
                    recv(ticks) -> _ => {
                        if let Err(e) = shared.checkpoint(false) {
                            tracing::warn!(error = %e, "periodic checkpoint failed");
                        }
                    }
                }
            })?;
        Ok(Self { shutdown, handle })
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        if self.handle.join().is_err() {
            tracing::error!("checkpoint scheduler panicked");
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// An open database
pub struct Engine {
    shared: Arc<Shared>,
    scheduler: Option<Scheduler>,
    _lock: File,
    /// Skip the final checkpoint on drop
    closed: bool,
}

impl Engine {
    const DATA_DIR: &'static str = "data";
    const LOG_DIR: &'static str = "log";
    const LOCK_FILE: &'static str = "lock";
    const ADD_MARKER: &'static str = ".tables.add";
    const REMOVE_MARKER: &'static str = ".tables.remove";

    /// Open or create the database in `config.data_dir`
    ///
    /// On startup:
    /// 1. Lock the directory
    /// 2. Finish an interrupted table removal
    /// 3. Replay the log onto every table file
    /// 4. Reset tables of an interrupted add
    /// 5. Checkpoint if anything was replayed or reset
    /// 6. Start the checkpoint scheduler
    pub fn open(config: Config) -> Result<Self> {
        let root = config.data_dir.clone();
        let data_dir = root.join(Self::DATA_DIR);
        let log_dir = root.join(Self::LOG_DIR);
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&log_dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(root.join(Self::LOCK_FILE))?;
        match lock.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(AtlasError::DatabaseLocked(root.display().to_string()))
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let removing = SchemaMarker::read(&root.join(Self::REMOVE_MARKER))?;
        if let Some(names) = &removing {
            for name in names {
                let path = data_dir.join(name);
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
            tracing::info!(tables = ?names, "finished interrupted table removal");
        }
        let adding = SchemaMarker::read(&root.join(Self::ADD_MARKER))?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match normalize_name(&name) {
                Ok(normal) if normal == name => {
                    let file = PageFile::open(&entry.path())?;
                    if file.size()? == 0 {
                        MagicPage::new().save(&file, 0)?;
                        file.sync()?;
                    }
                    files.push((name, file));
                }
                _ => tracing::warn!(file = %name, "ignoring foreign file in data directory"),
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let report = {
            let targets: Vec<(&str, &PageFile)> = files.iter().map(|(name, file)| (name.as_str(), file)).collect();
            wal::recover(&log_dir, &targets, config.recover_until)?
        };
        if report.replayed() {
            tracing::info!(
                generations = report.generations,
                pages = report.pages,
                rolled_forward = report.rolled_forward,
                "recovery replayed checkpoints"
            );
        }

        if let Some(names) = &adding {
            for (name, file) in &files {
                if names.contains(name) {
                    // Drop whatever the interrupted add left behind.
                    fs::write(file.path(), b"")?;
                    MagicPage::new().save(file, 0)?;
                    file.sync()?;
                }
            }
            tracing::info!(tables = ?names, "reset tables of interrupted add");
        }

        let directory = Arc::new(Directory::new(config.cache_pages));
        let logger = Logger::open(&log_dir, config.effective_logger_pages())?;
        let force = report.replayed() || removing.is_some() || adding.is_some() || config.recover_until != u64::MAX;
        let shared = Arc::new(Shared {
            config,
            data_dir,
            log_dir,
            directory,
            tables: RwLock::new(BTreeMap::new()),
            logger: Mutex::new(logger),
            schema: Mutex::new(()),
            halted: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU32::new(1),
        });
        for (name, file) in files {
            shared.register(name, file)?;
        }

        if force {
            shared.checkpoint(true)?;
        }
        for marker in [Self::ADD_MARKER, Self::REMOVE_MARKER] {
            let path = root.join(marker);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }

        let (requests_tx, requests) = channel::bounded(1);
        if shared.config.checkpoint_on_cache_full {
            shared.directory.set_checkpoint_sender(Some(requests_tx));
        }
        let scheduler = Scheduler::start(Arc::clone(&shared), requests)?;

        tracing::info!(
            path = %root.display(),
            tables = shared.tables.read().len(),
            "database opened"
        );
        Ok(Self {
            shared,
            scheduler: Some(scheduler),
            _lock: lock,
            closed: false,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Handle to table `name`
    pub fn open_table(&self, name: &str) -> Result<TableHandle> {
        let name = normalize_name(name)?;
        match self.shared.tables.read().get(&name) {
            Some(table) => Ok(TableHandle::open(Arc::clone(table))),
            None => Err(AtlasError::TableNotFound(name)),
        }
    }

    /// Names of every table, in order
    pub fn table_names(&self) -> Vec<String> {
        self.shared.tables.read().keys().cloned().collect()
    }

    /// Create empty tables
    pub fn add_tables(&self, names: &[&str]) -> Result<()> {
        self.shared.check_running()?;
        let _schema = self.shared.schema.lock();
        let mut normal = Vec::with_capacity(names.len());
        {
            let tables = self.shared.tables.read();
            for name in names {
                let name = normalize_name(name)?;
                if tables.contains_key(&name) || normal.contains(&name) {
                    return Err(AtlasError::TableExists(name));
                }
                normal.push(name);
            }
        }
        if normal.is_empty() {
            return Ok(());
        }

        let marker = self.shared.config.data_dir.join(Self::ADD_MARKER);
        SchemaMarker::write(&marker, &normal)?;
        for name in &normal {
            let path = self.shared.table_path(name);
            fs::write(&path, b"")?;
            let file = PageFile::open(&path)?;
            MagicPage::new().save(&file, 0)?;
            file.sync()?;
            self.shared.register(name.clone(), file)?;
        }
        self.shared.checkpoint(true)?;
        fs::remove_file(&marker)?;
        tracing::info!(tables = ?normal, "tables added");
        Ok(())
    }

    /// Drop tables and their files, waiting for open handles to close
    pub fn remove_tables(&self, names: &[&str]) -> Result<()> {
        self.shared.check_running()?;
        let _schema = self.shared.schema.lock();
        let mut normal = Vec::with_capacity(names.len());
        {
            let tables = self.shared.tables.read();
            for name in names {
                let name = normalize_name(name)?;
                if !tables.contains_key(&name) {
                    return Err(AtlasError::TableNotFound(name));
                }
                if !normal.contains(&name) {
                    normal.push(name);
                }
            }
        }
        if normal.is_empty() {
            return Ok(());
        }

        let marker = self.shared.config.data_dir.join(Self::REMOVE_MARKER);
        SchemaMarker::write(&marker, &normal)?;
        let removed: Vec<Arc<OpenTable>> = {
            let mut tables = self.shared.tables.write();
            normal.iter().filter_map(|name| tables.remove(name)).collect()
        };
        for table in &removed {
            table.wait_closed();
            // A running checkpoint may still be logging this table.
            drop(self.shared.logger.lock());
            self.shared.directory.purge_table(table.cache().id());
            fs::remove_file(table.cache().file().path())?;
        }
        self.shared.checkpoint(true)?;
        fs::remove_file(&marker)?;
        tracing::info!(tables = ?normal, "tables removed");
        Ok(())
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Write every dirty page durably. `force_rotate` starts a new log file
    /// and logs every table, dirty or not.
    pub fn checkpoint(&self, force_rotate: bool) -> Result<()> {
        self.shared.checkpoint(force_rotate)
    }

    /// Run a checkpoint up to `point`, then drop the engine without any
    /// further writes, as a crash at that point would.
    #[doc(hidden)]
    pub fn crash_during_checkpoint(mut self, point: CrashPoint) -> Result<()> {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        self.closed = true;
        self.shared.run_checkpoint(false, Some(point))
    }

    // =========================================================================
    // Backup and restore
    // =========================================================================

    /// Copy the database into `path`, which can then be opened as a
    /// database of its own. With `incremental`, log files retired from now
    /// on are moved into the backup instead of being deleted.
    pub fn backup(&self, path: &Path, incremental: bool) -> Result<()> {
        let backup_data = path.join(Self::DATA_DIR);
        let backup_log = path.join(Self::LOG_DIR);
        fs::create_dir_all(&backup_data)?;
        fs::create_dir_all(&backup_log)?;

        let mut logger = self.shared.logger.lock();
        for name in self.table_names() {
            fs::copy(self.shared.table_path(&name), backup_data.join(&name))?;
        }

        let mut copied = Vec::new();
        loop {
            let fresh: Vec<u64> = wal::list_log_files(&self.shared.log_dir)?
                .into_iter()
                .filter(|id| !copied.contains(id))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for id in fresh {
                fs::copy(
                    wal::LogFile::path(&self.shared.log_dir, id),
                    wal::LogFile::path(&backup_log, id),
                )?;
                copied.push(id);
            }
        }

        for entry in fs::read_dir(&self.shared.config.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && entry.file_name() != Self::LOCK_FILE {
                fs::copy(entry.path(), path.join(entry.file_name()))?;
            }
        }

        if incremental {
            logger.set_archive(Some(backup_log));
        }
        tracing::info!(path = %path.display(), logs = copied.len(), incremental, "backup written");
        Ok(())
    }

    /// Commit timestamps the backup in `dir` can be restored to with
    /// `Config::recover_until`
    pub fn restore_points(dir: &Path) -> Result<Vec<u64>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir.join(Self::DATA_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push((entry.file_name().to_string_lossy().into_owned(), PageFile::open(&entry.path())?));
            }
        }
        let targets: Vec<(&str, &PageFile)> = files.iter().map(|(name, file)| (name.as_str(), file)).collect();
        wal::restore_points(&dir.join(Self::LOG_DIR), &targets)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Row count of each leaf page of `table`, in chain order
    pub fn leaf_chain(&self, table: &str) -> Result<Vec<usize>> {
        self.open_table(table)?.leaf_chain()
    }

    /// Number of pages in the shared cache
    pub fn cache_len(&self) -> usize {
        self.shared.directory.len()
    }

    /// Whether a failed checkpoint has stopped the engine
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the scheduler and write a final checkpoint
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        self.shared.directory.set_checkpoint_sender(None);
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.is_halted() {
            return Ok(());
        }
        self.shared.checkpoint(false)?;
        tracing::info!(path = %self.shared.config.data_dir.display(), "database closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "final checkpoint failed");
        }
    }
}
