//! Segment Store
//!
//! Owns the segment files in the buffer directory: creating, appending,
//! sealing, listing, reading and deleting them. Knows nothing about the
//! network or the remote object store.
//!
//! File operations go through the `SegmentFs` backend trait:
//!
//! - `LocalSegmentFs`: production (std::fs + fsync)
//! - `InMemorySegmentFs`: unit tests, crash simulation and fault injection
//!
//! ## Sealing
//!
//! ```text
//! seg-X.open ──fsync──► rename ──► seg-X.sealed ──fsync(dir)
//! ```
//!
//! The rename is the commit point. A crash before it leaves an `.open` file,
//! which `SegmentStore::open` seals on the next start.

use crate::spool::clock::Clock;
use crate::spool::config::FsyncPolicy;
use crate::spool::error::{Result, SpoolError};
use crate::spool::segment::{
    SealedSegment, SegmentFileKind, SegmentId, SegmentIdAllocator, SegmentState,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const EVERY_SECOND: Duration = Duration::from_secs(1);

/// A single writable segment file
pub trait SegmentFile: Send {
    /// Append all of `data` at the end of the file
    fn append(&mut self, data: &[u8]) -> std::io::Result<()>;
    /// Cut the file back to `len` bytes (undo of a failed append)
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
    /// Flush file contents to durable storage
    fn sync(&mut self) -> std::io::Result<()>;
}

/// Storage backend for segment files
pub trait SegmentFs: Send + Sync + 'static {
    type File: SegmentFile;

    /// Create a new, empty file. Fails if it already exists.
    fn create(&self, name: &str) -> std::io::Result<Self::File>;
    /// Atomically rename a file
    fn rename(&self, from: &str, to: &str) -> std::io::Result<()>;
    /// Make renames and deletions durable
    fn sync_dir(&self) -> std::io::Result<()>;
    /// Flush the contents of an existing file this process did not write
    fn sync_file(&self, name: &str) -> std::io::Result<()>;
    /// Read a whole file
    fn read(&self, name: &str) -> std::io::Result<Vec<u8>>;
    /// Delete a file. Deleting a missing file is not an error.
    fn delete(&self, name: &str) -> std::io::Result<()>;
    /// All file names with their sizes, sorted by name
    fn list(&self) -> std::io::Result<Vec<(String, u64)>>;
    fn exists(&self, name: &str) -> std::io::Result<bool>;
}

// ============================================================================
// SegmentHandle - the writable side of one segment
// ============================================================================

enum HandleState {
    Open,
    /// Closed to appends; the seal has not completed yet
    Sealing,
    Sealed(SealedSegment),
    Discarded,
}

impl HandleState {
    fn public(&self) -> SegmentState {
        match self {
            HandleState::Open => SegmentState::Open,
            HandleState::Sealing => SegmentState::Sealing,
            HandleState::Sealed(_) => SegmentState::Sealed,
            HandleState::Discarded => SegmentState::Deleted,
        }
    }
}

struct HandleInner<W> {
    file: Option<W>,
    size: u64,
    /// A failed append left bytes past `size` that could not be cut off
    torn: bool,
    state: HandleState,
    last_sync: Instant,
}

/// Handle to a segment created by this process
///
/// The inner mutex orders appends against sealing: an append either completes
/// before the seal starts or observes the segment as no longer open.
pub struct SegmentHandle<W> {
    id: SegmentId,
    inner: Mutex<HandleInner<W>>,
}

impl<W> SegmentHandle<W> {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Bytes appended so far
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn state(&self) -> SegmentState {
        self.inner.lock().state.public()
    }
}

impl<W> std::fmt::Debug for SegmentHandle<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// SegmentStore
// ============================================================================

/// What startup recovery found in the buffer directory
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Segments left open by the previous process, now sealed
    pub sealed_abandoned: Vec<SegmentId>,
    /// Abandoned open segments with no data, removed
    pub discarded_empty: Vec<SegmentId>,
    /// Everything waiting for upload after recovery, oldest first
    pub pending: Vec<SealedSegment>,
}

pub struct SegmentStore<F: SegmentFs> {
    fs: F,
    ids: SegmentIdAllocator,
    fsync_policy: FsyncPolicy,
    clock: Arc<dyn Clock>,
}

impl<F: SegmentFs> SegmentStore<F> {
    /// Open the store and recover whatever the previous process left behind.
    ///
    /// Any segment still marked open is assumed abandoned: it is sealed (or
    /// removed when empty) so it gets drained instead of being appended to by
    /// two process generations.
    pub fn open(
        fs: F,
        fsync_policy: FsyncPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport)> {
        let entries = fs
            .list()
            .map_err(|e| SpoolError::storage("listing buffer directory", e))?;

        let mut report = RecoveryReport::default();
        let mut max_id = None;

        for (name, size) in &entries {
            let kind = match SegmentFileKind::parse(name) {
                Some(kind) => kind,
                None => {
                    debug!(file = %name, "Ignoring foreign file in buffer directory");
                    continue;
                }
            };
            max_id = max_id.max(Some(kind.id()));

            if let SegmentFileKind::Open(id) = kind {
                if *size == 0 {
                    fs.delete(name)
                        .map_err(|e| SpoolError::storage(format!("removing empty segment {}", id), e))?;
                    report.discarded_empty.push(id);
                } else {
                    fs.sync_file(name)
                        .map_err(|e| SpoolError::storage(format!("syncing abandoned segment {}", id), e))?;
                    fs.rename(name, &id.sealed_file_name())
                        .map_err(|e| SpoolError::storage(format!("sealing abandoned segment {}", id), e))?;
                    report.sealed_abandoned.push(id);
                }
            }
        }

        if !report.sealed_abandoned.is_empty() || !report.discarded_empty.is_empty() {
            fs.sync_dir()
                .map_err(|e| SpoolError::storage("syncing buffer directory", e))?;
        }

        let store = SegmentStore {
            fs,
            ids: SegmentIdAllocator::new(max_id),
            fsync_policy,
            clock,
        };
        report.pending = store.list_sealed()?;

        info!(
            sealed_abandoned = report.sealed_abandoned.len(),
            discarded_empty = report.discarded_empty.len(),
            pending = report.pending.len(),
            "Segment store opened"
        );

        Ok((store, report))
    }

    /// Allocate a fresh identifier and create its (empty) open file
    pub fn create_segment(&self) -> Result<SegmentHandle<F::File>> {
        let id = self.ids.next(&*self.clock);
        let file = self
            .fs
            .create(&id.open_file_name())
            .map_err(|e| SpoolError::storage(format!("creating segment {}", id), e))?;

        debug!(segment = %id, "Created segment");

        Ok(SegmentHandle {
            id,
            inner: Mutex::new(HandleInner {
                file: Some(file),
                size: 0,
                torn: false,
                state: HandleState::Open,
                last_sync: Instant::now(),
            }),
        })
    }

    /// Append bytes to an open segment. Returns the segment size afterwards.
    ///
    /// A failed append is rolled back, so the file never keeps a partial write.
    /// If the rollback itself fails the segment is closed to appends and the
    /// leftover bytes are cut off when it is sealed.
    pub fn append(&self, handle: &SegmentHandle<F::File>, data: &[u8]) -> Result<u64> {
        let mut guard = handle.inner.lock();
        let inner = &mut *guard;

        let state = inner.state.public();
        let file = match (state, inner.file.as_mut()) {
            (SegmentState::Open, Some(file)) => file,
            _ => {
                return Err(SpoolError::InvalidState {
                    id: handle.id,
                    state,
                })
            }
        };

        if let Err(e) = file.append(data) {
            roll_back(handle.id, inner);
            return Err(SpoolError::storage(format!("appending to segment {}", handle.id), e));
        }

        let sync_now = match self.fsync_policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::EverySecond => inner.last_sync.elapsed() >= EVERY_SECOND,
            FsyncPolicy::No => false,
        };
        if sync_now {
            match file.sync() {
                Ok(()) => inner.last_sync = Instant::now(),
                Err(e) if self.fsync_policy == FsyncPolicy::Always => {
                    roll_back(handle.id, inner);
                    return Err(SpoolError::storage(format!("syncing segment {}", handle.id), e));
                }
                Err(e) => {
                    warn!(segment = %handle.id, error = %e, "Periodic segment fsync failed");
                }
            }
        }

        inner.size += data.len() as u64;
        Ok(inner.size)
    }

    /// Fsync an open segment. No-op once it is no longer open.
    pub fn sync(&self, handle: &SegmentHandle<F::File>) -> Result<()> {
        let mut guard = handle.inner.lock();
        let inner = &mut *guard;
        if let (HandleState::Open, Some(file)) = (&inner.state, inner.file.as_mut()) {
            file.sync()
                .map_err(|e| SpoolError::storage(format!("syncing segment {}", handle.id), e))?;
            inner.last_sync = Instant::now();
        }
        Ok(())
    }

    /// Make a segment immutable.
    ///
    /// Idempotent: sealing twice returns the same reference. A seal that failed
    /// part way can be retried; the segment stays closed to appends meanwhile.
    pub fn seal(&self, handle: &SegmentHandle<F::File>) -> Result<SealedSegment> {
        let mut inner = handle.inner.lock();
        self.seal_locked(handle.id, &mut inner)
    }

    /// Like `seal`, but an empty segment is deleted instead and `None` returned
    pub fn seal_or_discard(&self, handle: &SegmentHandle<F::File>) -> Result<Option<SealedSegment>> {
        let mut inner = handle.inner.lock();
        let unsealed = matches!(inner.state, HandleState::Open | HandleState::Sealing);
        if unsealed && inner.size == 0 {
            inner.state = HandleState::Sealing;
            inner.file = None;
            self.fs
                .delete(&handle.id.open_file_name())
                .map_err(|e| SpoolError::storage(format!("discarding empty segment {}", handle.id), e))?;
            inner.state = HandleState::Discarded;
            debug!(segment = %handle.id, "Discarded empty segment");
            return Ok(None);
        }
        self.seal_locked(handle.id, &mut inner).map(Some)
    }

    fn seal_locked(&self, id: SegmentId, inner: &mut HandleInner<F::File>) -> Result<SealedSegment> {
        match inner.state {
            HandleState::Sealed(sealed) => return Ok(sealed),
            HandleState::Discarded => {
                return Err(SpoolError::InvalidState {
                    id,
                    state: SegmentState::Deleted,
                })
            }
            HandleState::Open | HandleState::Sealing => {}
        }
        inner.state = HandleState::Sealing;

        if let Some(file) = inner.file.as_mut() {
            if inner.torn {
                file.truncate(inner.size).map_err(|e| {
                    SpoolError::storage(format!("cutting failed append from segment {}", id), e)
                })?;
                inner.torn = false;
            }
            file.sync()
                .map_err(|e| SpoolError::storage(format!("syncing segment {} before seal", id), e))?;
        }

        let open_name = id.open_file_name();
        let sealed_name = id.sealed_file_name();
        match self.fs.rename(&open_name, &sealed_name) {
            Ok(()) => {}
            // An earlier attempt got as far as the rename
            Err(e) if e.kind() == ErrorKind::NotFound && self.fs.exists(&sealed_name).unwrap_or(false) => {}
            Err(e) => return Err(SpoolError::storage(format!("sealing segment {}", id), e)),
        }
        if let Err(e) = self.fs.sync_dir() {
            warn!(segment = %id, error = %e, "Directory fsync after seal failed");
        }

        inner.file = None;
        let sealed = SealedSegment {
            id,
            size_bytes: inner.size,
        };
        inner.state = HandleState::Sealed(sealed);

        debug!(segment = %id, size_bytes = sealed.size_bytes, "Sealed segment");
        Ok(sealed)
    }

    /// All sealed, not yet deleted segments, oldest first
    pub fn list_sealed(&self) -> Result<Vec<SealedSegment>> {
        let entries = self
            .fs
            .list()
            .map_err(|e| SpoolError::storage("listing buffer directory", e))?;

        let mut sealed: Vec<SealedSegment> = entries
            .into_iter()
            .filter_map(|(name, size)| match SegmentFileKind::parse(&name)? {
                SegmentFileKind::Sealed(id) => Some(SealedSegment {
                    id,
                    size_bytes: size,
                }),
                SegmentFileKind::Open(_) => None,
            })
            .collect();
        sealed.sort_by_key(|s| s.id);
        Ok(sealed)
    }

    /// Full content of a sealed segment
    pub fn read(&self, segment: &SealedSegment) -> Result<Bytes> {
        self.fs
            .read(&segment.id.sealed_file_name())
            .map(Bytes::from)
            .map_err(|e| SpoolError::from_segment_io(segment.id, "reading", e))
    }

    /// Remove a sealed segment. Deleting one that is already gone succeeds.
    pub fn delete(&self, segment: &SealedSegment) -> Result<()> {
        self.fs
            .delete(&segment.id.sealed_file_name())
            .map_err(|e| SpoolError::from_segment_io(segment.id, "deleting", e))
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        self.fsync_policy
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }
}

/// Undo a failed append by cutting the file back to the acknowledged size
fn roll_back<W: SegmentFile>(id: SegmentId, inner: &mut HandleInner<W>) {
    let result = match inner.file.as_mut() {
        Some(file) => file.truncate(inner.size),
        None => return,
    };
    if let Err(e) = result {
        error!(
            segment = %id,
            size_bytes = inner.size,
            error = %e,
            "Could not roll back failed append, closing segment to appends"
        );
        inner.torn = true;
        inner.state = HandleState::Sealing;
    }
}

// ============================================================================
// LocalSegmentFs - For production
// ============================================================================

/// Buffer directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalSegmentFs {
    dir: PathBuf,
}

impl LocalSegmentFs {
    /// Use `dir` as the buffer directory, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(LocalSegmentFs { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

pub struct LocalSegmentFile {
    file: std::fs::File,
}

impl SegmentFile for LocalSegmentFile {
    fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

impl SegmentFs for LocalSegmentFs {
    type File = LocalSegmentFile;

    fn create(&self, name: &str) -> std::io::Result<Self::File> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(self.path(name))?;
        Ok(LocalSegmentFile { file })
    }

    fn rename(&self, from: &str, to: &str) -> std::io::Result<()> {
        std::fs::rename(self.path(from), self.path(to))
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> std::io::Result<()> {
        std::fs::File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn sync_file(&self, name: &str) -> std::io::Result<()> {
        std::fs::File::open(self.path(name))?.sync_data()
    }

    fn read(&self, name: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(name))
    }

    fn delete(&self, name: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> std::io::Result<Vec<(String, u64)>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // Deleted between readdir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !metadata.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push((name.to_string(), metadata.len()));
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> std::io::Result<bool> {
        Ok(self.path(name).exists())
    }
}

// ============================================================================
// InMemorySegmentFs - For unit tests
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Bytes that survive a simulated crash
    synced_len: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_appends: AtomicBool,
    fail_creates: AtomicBool,
    fail_renames: AtomicBool,
    fail_truncates: AtomicBool,
    fail_syncs: AtomicBool,
}

/// In-memory buffer directory with crash simulation and fault injection
#[derive(Debug, Clone, Default)]
pub struct InMemorySegmentFs {
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    faults: Arc<Faults>,
}

impl InMemorySegmentFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends write half their data and then fail
    pub fn set_fail_appends(&self, fail: bool) {
        self.faults.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.faults.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_renames(&self, fail: bool) {
        self.faults.fail_renames.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_truncates(&self, fail: bool) {
        self.faults.fail_truncates.store(fail, Ordering::SeqCst);
    }

    /// File fsyncs fail; directory fsyncs are unaffected
    pub fn set_fail_syncs(&self, fail: bool) {
        self.faults.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Drop everything that was never fsynced, as a power loss would
    pub fn simulate_crash(&self) {
        let mut files = self.files.lock();
        for file in files.values_mut() {
            file.data.truncate(file.synced_len);
        }
    }

    /// Place a file directly, as a previous process would have left it
    pub fn insert_file(&self, name: &str, data: &[u8]) {
        self.files.lock().insert(
            name.to_string(),
            InMemoryFile {
                data: data.to_vec(),
                synced_len: data.len(),
            },
        );
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }
}

pub struct InMemorySegmentFile {
    name: String,
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    faults: Arc<Faults>,
}

impl InMemorySegmentFile {
    fn with_file<T>(&self, f: impl FnOnce(&mut InMemoryFile) -> T) -> std::io::Result<T> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, self.name.clone()))?;
        Ok(f(file))
    }
}

impl SegmentFile for InMemorySegmentFile {
    fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        let fail = self.faults.fail_appends.load(Ordering::SeqCst);
        self.with_file(|file| {
            if fail {
                file.data.extend_from_slice(&data[..data.len() / 2]);
            } else {
                file.data.extend_from_slice(data);
            }
        })?;
        if fail {
            return Err(IoError::new(ErrorKind::Other, "injected append failure"));
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        if self.faults.fail_truncates.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected truncate failure"));
        }
        self.with_file(|file| {
            file.data.truncate(len as usize);
            file.synced_len = file.synced_len.min(file.data.len());
        })
    }

    fn sync(&mut self) -> std::io::Result<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected fsync failure"));
        }
        self.with_file(|file| file.synced_len = file.data.len())
    }
}

impl SegmentFs for InMemorySegmentFs {
    type File = InMemorySegmentFile;

    fn create(&self, name: &str) -> std::io::Result<Self::File> {
        if self.faults.fail_creates.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected create failure"));
        }
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return Err(IoError::new(ErrorKind::AlreadyExists, name.to_string()));
        }
        files.insert(name.to_string(), InMemoryFile::default());
        Ok(InMemorySegmentFile {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            faults: Arc::clone(&self.faults),
        })
    }

    fn rename(&self, from: &str, to: &str) -> std::io::Result<()> {
        if self.faults.fail_renames.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected rename failure"));
        }
        let mut files = self.files.lock();
        let file = files
            .remove(from)
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, from.to_string()))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn sync_file(&self, name: &str) -> std::io::Result<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected fsync failure"));
        }
        let mut files = self.files.lock();
        let file = files
            .get_mut(name)
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, name.to_string()))?;
        file.synced_len = file.data.len();
        Ok(())
    }

    fn read(&self, name: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .lock()
            .get(name)
            .map(|f| f.data.clone())
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, name.to_string()))
    }

    fn delete(&self, name: &str) -> std::io::Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list(&self) -> std::io::Result<Vec<(String, u64)>> {
        let files = self.files.lock();
        let mut names: Vec<(String, u64)> = files
            .iter()
            .map(|(name, f)| (name.clone(), f.data.len() as u64))
            .collect();
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> std::io::Result<bool> {
        Ok(self.files.lock().contains_key(name))
    }
}
