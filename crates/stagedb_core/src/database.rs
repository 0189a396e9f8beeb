//! Database facade, commit and recovery.

use crate::config::{Config, MIN_NODE_ELEMENTS};
use crate::dir::{DatabaseDir, FileOpener, MemoryFiles};
use crate::error::{CoreError, CoreResult};
use crate::files::FileSet;
use crate::index::{lookup, IndexTree};
use crate::stats::{Counters, DatabaseStats};
use crate::store::{DeletionEntry, FreeList, ValueFiles};
use crate::transaction::{plan, CommitPlan, Overlay, Resolved, Tier};
use crate::types::{FileRef, IndexHandle, Locator, SENTINEL_DELETED};
use crate::value::{Base, ValueRef};
use crate::wal;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Durable state: open files plus the in-memory mirrors of their headers.
pub(crate) struct DiskState {
    pub(crate) files: FileSet,
    free_list: FreeList,
    values: ValueFiles,
    pub(crate) indexes: HashMap<u16, IndexTree>,
}

impl DiskState {
    /// Returns the live locator stored under `key`.
    fn locator(&self, index: u16, key: &[u8]) -> CoreResult<Option<Locator>> {
        let tree = self
            .indexes
            .get(&index)
            .ok_or(CoreError::UnknownIndex { index_id: index })?;
        Ok(lookup(&tree.view(&self.files), key)?.filter(|loc| !loc.is_deleted()))
    }

    fn install(&mut self, plan: CommitPlan) {
        self.free_list = plan.free_list;
        self.values = plan.values;
        for (id, update) in plan.updates {
            if let Some(tree) = self.indexes.get_mut(&id) {
                tree.install(update);
            }
        }
    }
}

/// Points at which tests can make a commit stop as if the process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashPoint {
    AfterLogging,
    /// Before the write with this position in the sorted batch.
    DuringApply(usize),
    BeforeFinalize,
}

enum Failure {
    Io(CoreError),
    #[cfg(test)]
    Crash,
}

impl From<CoreError> for Failure {
    fn from(err: CoreError) -> Self {
        Self::Io(err)
    }
}

/// The main database handle.
///
/// A database keeps three views of every index:
/// - **Current**: writes since the last `stage()`
/// - **Staged**: changes waiting for `commit()`
/// - **Disk**: the committed state
///
/// Reads see the newest of the three. Commits are atomic across all indexes
/// and survive a crash at any point: an interrupted commit is undone when
/// the database is next opened.
///
/// # Example
///
/// ```rust,ignore
/// use stagedb_core::Database;
/// use std::path::Path;
///
/// let db = Database::open(Path::new("data"), "ledger", 1 << 20)?;
/// let accounts = db.load_index(0, 8, 1 << 20)?;
///
/// db.write_value(accounts, &42u64.to_be_bytes(), b"balance=10")?;
/// db.stage()?;
/// db.commit()?;
///
/// assert_eq!(db.get(accounts, &42u64.to_be_bytes())?.as_deref(), Some(&b"balance=10"[..]));
/// db.close()?;
/// ```
pub struct Database {
    config: Config,
    overlay: RwLock<Overlay>,
    disk: RwLock<DiskState>,
    /// Serializes commits.
    commit_lock: Mutex<()>,
    last_commit: Mutex<Instant>,
    poisoned: AtomicBool,
    is_open: RwLock<bool>,
    counters: Counters,
    #[cfg(test)]
    crash: Mutex<Option<CrashPoint>>,
}

impl Database {
    /// Opens or creates the database `name` inside `path`.
    ///
    /// `cache_limit` is the staged size in bytes above which `stage()`
    /// commits on its own (0 disables it).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the database locked (`DatabaseLocked`)
    /// - An interrupted commit cannot be undone (`CorruptLog`)
    /// - I/O errors occur
    pub fn open(path: &Path, name: &str, cache_limit: usize) -> CoreResult<Self> {
        Self::open_with_config(path, name, Config::default().cache_limit(cache_limit))
    }

    /// Opens or creates the database `name` inside `path` with a custom
    /// configuration.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use stagedb_core::{Config, Database};
    /// use std::path::Path;
    ///
    /// let config = Config::default()
    ///     .extra_data_size(16)
    ///     .max_file_size(64 << 20);
    ///
    /// let db = Database::open_with_config(Path::new("data"), "ledger", config)?;
    /// ```
    pub fn open_with_config(path: &Path, name: &str, config: Config) -> CoreResult<Self> {
        let dir = DatabaseDir::open(&path.join(name), config.create_if_missing)?;
        Self::open_with_files(Arc::new(dir), config)
    }

    /// Opens a database held entirely in memory.
    pub fn open_in_memory(config: Config) -> CoreResult<Self> {
        Self::open_with_files(Arc::new(MemoryFiles::new()), config)
    }

    /// Opens a database over any set of files.
    ///
    /// Recovery runs first, so the files may be left over from a crash.
    pub fn open_with_files(opener: Arc<dyn FileOpener>, config: Config) -> CoreResult<Self> {
        let mut files = FileSet::new(opener);
        if wal::recover(&mut files)? {
            info!("undid an interrupted commit");
        }

        let fresh = !files.exists(FileRef::Value(0));
        if fresh || !files.exists(FileRef::Deletion) {
            if !config.create_if_missing {
                return Err(CoreError::invalid_argument(
                    "database files are missing and create_if_missing is off",
                ));
            }
            if !files.exists(FileRef::Deletion) {
                files
                    .opener()
                    .create_atomic(FileRef::Deletion, &FreeList::initial_file())?;
            }
            if fresh {
                let values = ValueFiles::new(config.extra_data_size, config.max_file_size);
                files
                    .opener()
                    .create_atomic(FileRef::Value(0), &values.encode_header())?;
            }
        }

        let free_list = FreeList::decode(&files.read_all(FileRef::Deletion)?)?;
        let values = load_value_header(&mut files, config.max_file_size)?;
        for file in 1..=values.last_file() {
            files.ensure_open(FileRef::Value(file))?;
        }
        debug!(
            deletion_entries = free_list.count(),
            value_files = u32::from(values.last_file()) + 1,
            fresh,
            "opened database"
        );

        Ok(Self {
            config,
            overlay: RwLock::new(Overlay::default()),
            disk: RwLock::new(DiskState {
                files,
                free_list,
                values,
                indexes: HashMap::new(),
            }),
            commit_lock: Mutex::new(()),
            last_commit: Mutex::new(Instant::now()),
            poisoned: AtomicBool::new(false),
            is_open: RwLock::new(true),
            counters: Counters::default(),
            #[cfg(test)]
            crash: Mutex::new(None),
        })
    }

    /// Loads index `id`, creating it with `key_size`-byte keys if it does
    /// not exist yet.
    ///
    /// `cache_limit` bounds the bytes of decoded nodes kept in memory.
    /// Loading an index twice returns the same handle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySize` if the index exists with another key size.
    pub fn load_index(&self, id: u16, key_size: usize, cache_limit: usize) -> CoreResult<IndexHandle> {
        self.ensure_usable()?;
        let width = u8::try_from(key_size)
            .ok()
            .filter(|&k| k > 0)
            .ok_or_else(|| {
                CoreError::invalid_argument(format!("key size {key_size} is outside 1..=255"))
            })?;

        {
            let mut disk = self.disk.write();
            if let Some(tree) = disk.indexes.get(&id) {
                if tree.key_size() != key_size {
                    return Err(CoreError::InvalidKeySize {
                        expected: tree.key_size(),
                        actual: key_size,
                    });
                }
                return Ok(IndexHandle::new(id, width));
            }

            let first = FileRef::Index { index: id, file: 0 };
            if !disk.files.exists(first) {
                let elements = self.config.index_node_elements;
                if elements < MIN_NODE_ELEMENTS {
                    return Err(CoreError::invalid_argument(format!(
                        "index nodes need at least {MIN_NODE_ELEMENTS} elements, config has {elements}"
                    )));
                }
                let contents = IndexTree::initial_file(width, elements);
                disk.files.opener().create_atomic(first, &contents)?;
            }
            let tree = IndexTree::open(
                id,
                &mut disk.files,
                width,
                cache_limit,
                self.config.max_file_size,
            )?;
            disk.indexes.insert(id, tree);
        }
        self.overlay.write().register_index(id, key_size);
        debug!(index = id, key_size, cache_limit, "loaded index");
        Ok(IndexHandle::new(id, width))
    }

    // ========================================================================
    // Writes (Current tier)
    // ========================================================================

    /// Sets the whole value of `key`.
    pub fn write_value(&self, index: IndexHandle, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.ensure_usable()?;
        check_value_len(value.len() as u64)?;
        let mut overlay = self.overlay.write();
        check_key(&overlay, index, key)?;
        overlay.current.write(index.id(), key, value.to_vec());
        self.counters.record_write();
        Ok(())
    }

    /// Writes `bytes` at `offset` inside the value of `key`.
    ///
    /// Writing past the end extends the value; any gap reads as zeros. A
    /// key with no value anywhere gets a new one.
    pub fn write_value_sub_section(
        &self,
        index: IndexHandle,
        key: &[u8],
        bytes: &[u8],
        offset: u32,
    ) -> CoreResult<()> {
        self.ensure_usable()?;
        check_value_len(u64::from(offset) + bytes.len() as u64)?;
        let mut overlay = self.overlay.write();
        check_key(&overlay, index, key)?;
        overlay
            .current
            .write_sub_section(index.id(), key, bytes, offset);
        self.counters.record_write();
        Ok(())
    }

    /// Sets the value of `key` to the concatenation of `parts`.
    pub fn write_concatenated_value(
        &self,
        index: IndexHandle,
        key: &[u8],
        parts: &[&[u8]],
    ) -> CoreResult<()> {
        self.write_value(index, key, &parts.concat())
    }

    /// Removes `key`. Removing a missing key is not an error.
    pub fn remove_value(&self, index: IndexHandle, key: &[u8]) -> CoreResult<()> {
        self.ensure_usable()?;
        let mut overlay = self.overlay.write();
        check_key(&overlay, index, key)?;
        overlay.current.remove(index.id(), key);
        self.counters.record_remove();
        Ok(())
    }

    /// Moves the value of `old` to `new`, replacing any value `new` had.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if `old` has no value in any tier.
    pub fn change_key(&self, index: IndexHandle, old: &[u8], new: &[u8]) -> CoreResult<()> {
        self.ensure_usable()?;
        let disk = self.disk.read();
        let mut overlay = self.overlay.write();
        check_key(&overlay, index, old)?;
        check_key(&overlay, index, new)?;

        let exists = match overlay.resolve(index.id(), old) {
            Resolved::Absent => false,
            Resolved::Memory { .. } => true,
            Resolved::Disk { key, patches } => {
                !patches.is_empty() || disk.locator(index.id(), key)?.is_some()
            }
        };
        if !exists {
            return Err(CoreError::KeyNotFound {
                index_id: index.id(),
            });
        }
        overlay.current.rename(index.id(), old, new);
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn with_value<T>(
        &self,
        index: IndexHandle,
        key: &[u8],
        f: impl FnOnce(&ValueRef<'_>) -> CoreResult<T>,
    ) -> CoreResult<Option<T>> {
        self.ensure_usable()?;
        let disk = self.disk.read();
        let overlay = self.overlay.read();
        check_key(&overlay, index, key)?;

        let value = match overlay.resolve(index.id(), key) {
            Resolved::Absent => return Ok(None),
            Resolved::Memory { bytes, patches } => ValueRef::new(Base::Memory(bytes), patches),
            Resolved::Disk { key, patches } => {
                let base = match disk.locator(index.id(), key)? {
                    Some(locator) => Base::Disk {
                        files: &disk.files,
                        locator,
                    },
                    None if patches.is_empty() => return Ok(None),
                    None => Base::Empty,
                };
                ValueRef::new(base, patches)
            }
        };
        f(&value).map(Some)
    }

    /// Reads `out.len()` bytes of the value of `key` starting at `offset`.
    ///
    /// Returns false if the key has no value.
    ///
    /// # Errors
    ///
    /// Returns `ReadOutOfBounds` if the range runs past the end of the value.
    pub fn read_value(
        &self,
        index: IndexHandle,
        key: &[u8],
        out: &mut [u8],
        offset: u32,
    ) -> CoreResult<bool> {
        self.counters.record_read();
        Ok(self
            .with_value(index, key, |value| value.read(offset, out))?
            .is_some())
    }

    /// Returns the whole value of `key`.
    pub fn get(&self, index: IndexHandle, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.counters.record_read();
        self.with_value(index, key, |value| value.to_vec())
    }

    /// Returns the length of the value of `key`.
    pub fn get_length(&self, index: IndexHandle, key: &[u8]) -> CoreResult<Option<u32>> {
        self.with_value(index, key, |value| value.len())
    }

    // ========================================================================
    // Extra data
    // ========================================================================

    /// Replaces the extra data blob. It is committed like any other change.
    ///
    /// Shorter input is zero-padded to the blob size.
    pub fn set_extra_data(&self, data: &[u8]) -> CoreResult<()> {
        self.ensure_usable()?;
        let size = self.disk.read().values.extra().len();
        let mut overlay = self.overlay.write();
        if data.len() > size {
            return Err(CoreError::invalid_argument(format!(
                "extra data of {} bytes exceeds the {size} byte blob",
                data.len()
            )));
        }
        let mut blob = data.to_vec();
        blob.resize(size, 0);
        overlay.current.set_extra(blob);
        Ok(())
    }

    /// Returns the newest extra data blob.
    pub fn extra_data(&self) -> CoreResult<Vec<u8>> {
        self.ensure_usable()?;
        let disk = self.disk.read();
        let overlay = self.overlay.read();
        Ok(overlay.extra().unwrap_or(disk.values.extra()).to_vec())
    }

    // ========================================================================
    // Tiers
    // ========================================================================

    /// Moves the current changes into the staged tier.
    ///
    /// Commits right away when the staged changes outgrow `cache_limit` or
    /// the last commit is older than `commit_gap`.
    pub fn stage(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        let staged_bytes = {
            let mut overlay = self.overlay.write();
            overlay.stage();
            overlay.staged_bytes()
        };

        let over_limit = self.config.cache_limit > 0 && staged_bytes > self.config.cache_limit;
        let overdue = self
            .config
            .commit_gap
            .is_some_and(|gap| self.last_commit.lock().elapsed() >= gap);
        if over_limit || overdue {
            debug!(staged_bytes, over_limit, overdue, "committing from stage");
            self.counters.record_auto_commit();
            self.commit()?;
        }
        Ok(())
    }

    /// Discards the current changes. Reads fall back to the staged tier.
    pub fn clear_current(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        self.overlay.write().clear_current();
        Ok(())
    }

    /// Discards the staged changes that are not already being committed.
    pub fn discard_staged(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        self.overlay.write().staged = Tier::default();
        Ok(())
    }

    /// Writes the staged changes to disk atomically.
    ///
    /// On failure nothing changed on disk and the staged changes are kept,
    /// so the commit can be retried. If the failed commit cannot be undone
    /// in-process the database is poisoned and must be reopened.
    pub fn commit(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        let _commit = self.commit_lock.lock();
        self.ensure_usable()?;

        let Some(tier) = self.overlay.write().begin_commit() else {
            return Ok(());
        };
        let result = self.commit_tier(&tier);
        if result.is_ok() {
            *self.last_commit.lock() = Instant::now();
            self.counters.record_commit();
        }
        result
    }

    /// Commits `tier` and hands the outcome to the overlay.
    ///
    /// The overlay is updated before the disk lock is released, so a reader
    /// never combines the old tiers with the new disk state.
    fn commit_tier(&self, tier: &Tier) -> CoreResult<()> {
        let disk = self.disk.upgradable_read();
        let plan = match plan(
            &disk.files,
            &disk.free_list,
            &disk.values,
            &disk.indexes,
            tier,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                self.overlay.write().end_commit(false);
                return Err(err);
            }
        };
        debug!(
            writes = plan.writes.len(),
            indexes = plan.updates.len(),
            "planned commit"
        );

        let mut disk = RwLockUpgradableReadGuard::upgrade(disk);
        let result = match self.write_plan(&mut disk.files, &plan) {
            Ok(()) => {
                disk.install(plan);
                debug!("commit finalized");
                Ok(())
            }
            Err(Failure::Io(err)) => {
                self.roll_back(&mut disk.files, &err);
                Err(err)
            }
            #[cfg(test)]
            Err(Failure::Crash) => {
                self.poisoned.store(true, Ordering::SeqCst);
                Err(CoreError::Io(std::io::Error::other("simulated crash")))
            }
        };
        self.overlay.write().end_commit(result.is_ok());
        result
    }

    fn write_plan(&self, files: &mut FileSet, plan: &CommitPlan) -> Result<(), Failure> {
        wal::write_undo_log(files, &plan.snapshot, &plan.writes)?;
        self.crash_point(CrashPoint::AfterLogging)?;

        for (i, write) in plan.writes.iter().enumerate() {
            self.crash_point(CrashPoint::DuringApply(i))?;
            files.write(write.target, write.offset, &write.data)?;
        }
        if self.config.sync_on_commit {
            let touched: BTreeSet<FileRef> = plan.writes.iter().map(|w| w.target).collect();
            for file in touched {
                files.sync(file)?;
            }
            files.opener().sync_dir()?;
        }

        self.crash_point(CrashPoint::BeforeFinalize)?;
        wal::finalize(files)?;
        Ok(())
    }

    fn roll_back(&self, files: &mut FileSet, cause: &CoreError) {
        warn!(error = %cause, "commit failed, rolling back");
        match wal::recover(files) {
            Ok(_) => self.counters.record_rollback(),
            Err(err) => {
                warn!(error = %err, "rollback failed, database poisoned");
                self.poisoned.store(true, Ordering::SeqCst);
            }
        }
    }

    #[cfg(test)]
    fn crash_point(&self, point: CrashPoint) -> Result<(), Failure> {
        if *self.crash.lock() == Some(point) {
            return Err(Failure::Crash);
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[inline]
    fn crash_point(&self, _point: CrashPoint) -> Result<(), Failure> {
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn crash_at(&self, point: CrashPoint) {
        *self.crash.lock() = Some(point);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Closes the database.
    ///
    /// Uncommitted current changes are dropped.
    ///
    /// # Errors
    ///
    /// Returns `PendingStaged` while staged changes wait for a commit.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        if self.overlay.read().has_staged() {
            return Err(CoreError::PendingStaged);
        }
        if !self.poisoned.load(Ordering::SeqCst) {
            self.disk.write().files.flush_all()?;
        }
        *is_open = false;
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_usable(&self) -> CoreResult<()> {
        if !*self.is_open.read() {
            return Err(CoreError::DatabaseClosed);
        }
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(CoreError::Poisoned);
        }
        Ok(())
    }

    /// Runs `f` against the durable state of `index`.
    pub(crate) fn with_disk<T>(
        &self,
        index: IndexHandle,
        f: impl FnOnce(&DiskState, &IndexTree) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.ensure_usable()?;
        let disk = self.disk.read();
        let tree = disk.indexes.get(&index.id()).ok_or(CoreError::UnknownIndex {
            index_id: index.id(),
        })?;
        f(&disk, tree)
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the deletion list as stored on disk.
    #[must_use]
    pub fn deletion_entries(&self) -> Vec<DeletionEntry> {
        self.disk.read().free_list.entries().to_vec()
    }

    /// Returns counters and sizes describing the database.
    #[must_use]
    pub fn stats(&self) -> DatabaseStats {
        let mut stats = DatabaseStats::default();
        self.counters.fill(&mut stats);
        {
            let overlay = self.overlay.read();
            stats.staged_bytes = overlay.staged_bytes();
            stats.loaded_indexes = overlay.index_count();
        }
        let disk = self.disk.read();
        stats.deletion_entries = disk.free_list.count();
        stats.active_deletion_entries = disk.free_list.active_count();
        stats.value_last_file = disk.values.last_file();
        stats.value_last_size = disk.values.last_size();
        for tree in disk.indexes.values() {
            let (hits, misses) = tree.cache_stats();
            stats.cached_nodes += tree.cached_nodes();
            stats.cache_hits += hits;
            stats.cache_misses += misses;
        }
        stats
    }
}

fn load_value_header(files: &mut FileSet, max_file_size: u32) -> CoreResult<ValueFiles> {
    let first = FileRef::Value(0);
    let fixed = ValueFiles::fixed_header_len();
    let size = files.size(first)?;
    if size < fixed as u64 {
        return Err(CoreError::corruption(format!(
            "{first} is {size} bytes, shorter than its header"
        )));
    }
    let header_len = ValueFiles::header_len_from(&files.read(first, 0, fixed)?)?;
    if size < header_len as u64 {
        return Err(CoreError::corruption(format!(
            "{first} is {size} bytes, header needs {header_len}"
        )));
    }
    ValueFiles::decode(&files.read(first, 0, header_len)?, max_file_size)
}

fn check_key(overlay: &Overlay, index: IndexHandle, key: &[u8]) -> CoreResult<()> {
    let expected = overlay
        .key_size(index.id())
        .ok_or(CoreError::UnknownIndex {
            index_id: index.id(),
        })?;
    if key.len() != expected {
        return Err(CoreError::InvalidKeySize {
            expected,
            actual: key.len(),
        });
    }
    Ok(())
}

fn check_value_len(len: u64) -> CoreResult<()> {
    if len >= u64::from(SENTINEL_DELETED) {
        return Err(CoreError::invalid_argument(format!(
            "value of {len} bytes is too long"
        )));
    }
    Ok(())
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Staged changes never committed are dropped with the handle.
        self.overlay.get_mut().staged = Tier::default();
        let _ = self.close();
    }
}
