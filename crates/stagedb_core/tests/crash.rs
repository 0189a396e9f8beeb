//! Commit failure and crash recovery through injected write errors.

use stagedb_core::{
    Config, CoreError, CoreResult, Database, FileOpener, FileRef, IndexHandle, MemoryFiles,
};
use stagedb_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared failure plan: the `fail_at`-th mutation fails, and with `sticky`
/// every later one fails too.
#[derive(Default)]
struct Faults {
    mutations: AtomicUsize,
    fail_at: AtomicUsize,
    armed: AtomicBool,
    sticky: AtomicBool,
    tripped: AtomicBool,
}

impl Faults {
    fn arm(&self, fail_at: usize, sticky: bool) {
        self.mutations.store(0, Ordering::SeqCst);
        self.fail_at.store(fail_at, Ordering::SeqCst);
        self.sticky.store(sticky, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.tripped.load(Ordering::SeqCst) && self.sticky.load(Ordering::SeqCst) {
            return Err(injected());
        }
        let n = self.mutations.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_at.load(Ordering::SeqCst) {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(injected());
        }
        Ok(())
    }

    fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

fn injected() -> StorageError {
    StorageError::Io(io::Error::other("injected write failure"))
}

struct FailingBackend {
    inner: Box<dyn StorageBackend>,
    faults: Arc<Faults>,
}

impl StorageBackend for FailingBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.faults.check()?;
        self.inner.write_at(offset, data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.faults.check()?;
        self.inner.truncate(new_size)
    }
}

struct FailingFiles {
    inner: MemoryFiles,
    faults: Arc<Faults>,
}

impl FileOpener for FailingFiles {
    fn open(&self, file: FileRef) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FailingBackend {
            inner: self.inner.open(file)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn exists(&self, file: FileRef) -> bool {
        self.inner.exists(file)
    }

    fn remove(&self, file: FileRef) -> CoreResult<()> {
        self.inner.remove(file)
    }

    fn create_atomic(&self, file: FileRef, contents: &[u8]) -> CoreResult<()> {
        self.inner.create_atomic(file, contents)
    }
}

fn config() -> Config {
    Config::default()
        .max_file_size(128)
        .index_node_elements(4)
}

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn files_without_log(memory: &MemoryFiles) -> Vec<(FileRef, Option<Vec<u8>>)> {
    memory
        .list()
        .into_iter()
        .filter(|f| *f != FileRef::Log)
        .map(|f| (f, memory.bytes(f)))
        .collect()
}

/// Opens a database with committed baseline data in two indexes.
fn baseline() -> (MemoryFiles, Arc<Faults>, Database, IndexHandle, IndexHandle) {
    let memory = MemoryFiles::new();
    let faults = Arc::new(Faults::default());
    let opener = FailingFiles {
        inner: memory.clone(),
        faults: Arc::clone(&faults),
    };
    let db = Database::open_with_files(Arc::new(opener), config()).unwrap();
    let a = db.load_index(0, 4, 1 << 16).unwrap();
    let b = db.load_index(1, 4, 1 << 16).unwrap();

    for n in 0..12 {
        db.write_value(a, &key(n), &[n as u8; 24]).unwrap();
    }
    db.write_value(b, &key(0), b"b-zero").unwrap();
    db.stage().unwrap();
    db.commit().unwrap();

    db.remove_value(a, &key(3)).unwrap();
    db.stage().unwrap();
    db.commit().unwrap();
    (memory, faults, db, a, b)
}

/// The change set every failure test tries to commit.
fn stage_changes(db: &Database, a: IndexHandle, b: IndexHandle) {
    db.remove_value(a, &key(5)).unwrap();
    db.write_value(a, &key(1), &[0xAA; 60]).unwrap();
    db.write_value_sub_section(a, &key(2), b"patched", 4).unwrap();
    db.change_key(a, &key(7), &key(70)).unwrap();
    for n in 20..30 {
        db.write_value(a, &key(n), &[n as u8; 30]).unwrap();
    }
    db.write_value(b, &key(0), b"b-zero, rewritten and longer").unwrap();
    db.stage().unwrap();
}

fn assert_baseline(db: &Database, a: IndexHandle, b: IndexHandle) {
    assert_eq!(db.get(a, &key(1)).unwrap().unwrap(), vec![1; 24]);
    assert_eq!(db.get(a, &key(3)).unwrap(), None);
    assert_eq!(db.get(a, &key(5)).unwrap().unwrap(), vec![5; 24]);
    assert_eq!(db.get(a, &key(7)).unwrap().unwrap(), vec![7; 24]);
    assert_eq!(db.get(a, &key(70)).unwrap(), None);
    assert_eq!(db.get(a, &key(25)).unwrap(), None);
    assert_eq!(db.get(b, &key(0)).unwrap().unwrap(), b"b-zero");
}

fn assert_changed(db: &Database, a: IndexHandle, b: IndexHandle) {
    assert_eq!(db.get(a, &key(1)).unwrap().unwrap(), vec![0xAA; 60]);
    assert_eq!(db.get(a, &key(5)).unwrap(), None);
    let mut two = vec![2; 24];
    two[4..11].copy_from_slice(b"patched");
    assert_eq!(db.get(a, &key(2)).unwrap().unwrap(), two);
    assert_eq!(db.get(a, &key(7)).unwrap(), None);
    assert_eq!(db.get(a, &key(70)).unwrap().unwrap(), vec![7; 24]);
    assert_eq!(db.get(a, &key(25)).unwrap().unwrap(), vec![25; 30]);
    assert_eq!(
        db.get(b, &key(0)).unwrap().unwrap(),
        b"b-zero, rewritten and longer"
    );
}

#[test]
fn failed_commit_rolls_back_and_can_be_retried() {
    let mut fail_at = 0;
    loop {
        let (memory, faults, db, a, b) = baseline();
        let before = files_without_log(&memory);
        stage_changes(&db, a, b);

        faults.arm(fail_at, false);
        let result = db.commit();
        if !faults.tripped() {
            result.unwrap();
            assert_changed(&db, a, b);
            break;
        }
        if result.is_ok() {
            // Only emptying the finished log failed.
            assert_changed(&db, a, b);
            fail_at += 1;
            continue;
        }

        // Nothing reached the files and the staged changes are still readable.
        assert_eq!(files_without_log(&memory), before, "mutation {fail_at}");
        assert_changed(&db, a, b);
        assert_eq!(db.stats().rollbacks, 1);

        db.commit().unwrap();
        assert_changed(&db, a, b);
        db.close().unwrap();
        drop(db);

        let db = Database::open_with_files(Arc::new(memory.clone()), config()).unwrap();
        let a = db.load_index(0, 4, 0).unwrap();
        let b = db.load_index(1, 4, 0).unwrap();
        assert_changed(&db, a, b);

        fail_at += 1;
        assert!(fail_at < 10_000, "commit never completed");
    }
}

#[test]
fn unrecoverable_failure_poisons_until_reopen() {
    let mut fail_at = 0;
    let mut poisoned_runs = 0;
    loop {
        let (memory, faults, db, a, b) = baseline();
        let before = files_without_log(&memory);
        stage_changes(&db, a, b);

        faults.arm(fail_at, true);
        let result = db.commit();
        if !faults.tripped() {
            result.unwrap();
            break;
        }
        if result.is_ok() {
            assert_changed(&db, a, b);
            fail_at += 1;
            continue;
        }
        // Failing before anything was logged leaves nothing to undo.
        if matches!(db.get(a, &key(1)), Err(CoreError::Poisoned)) {
            assert!(matches!(db.commit(), Err(CoreError::Poisoned)));
            poisoned_runs += 1;
        }
        drop(db);

        let db = Database::open_with_files(Arc::new(memory.clone()), config()).unwrap();
        assert_eq!(files_without_log(&memory), before, "mutation {fail_at}");
        let a = db.load_index(0, 4, 0).unwrap();
        let b = db.load_index(1, 4, 0).unwrap();
        assert_baseline(&db, a, b);

        // Recovery left nothing behind for a second open to undo.
        db.close().unwrap();
        drop(db);
        Database::open_with_files(Arc::new(memory.clone()), config()).unwrap();
        assert_eq!(files_without_log(&memory), before);

        fail_at += 1;
        assert!(fail_at < 10_000, "commit never completed");
    }
    assert!(poisoned_runs > 0);
}

#[test]
fn writes_continue_during_failed_commit_retry() {
    let (_memory, faults, db, a, b) = baseline();
    stage_changes(&db, a, b);
    faults.arm(5, false);
    assert!(db.commit().is_err());

    db.write_value(a, &key(1), b"newest").unwrap();
    db.stage().unwrap();
    db.commit().unwrap();
    assert_eq!(db.get(a, &key(1)).unwrap().unwrap(), b"newest");
    assert_eq!(db.get(a, &key(70)).unwrap().unwrap(), vec![7; 24]);
}
