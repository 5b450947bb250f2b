//! Buffer
//!
//! Coordination layer over the segment store. Routes writes to the single open
//! segment, rotates it by size or age, and hands sealed segments to the
//! uploader through `drain`.
//!
//! ## Locking
//!
//! ```text
//! current:  RwLock<Option<Arc<SegmentHandle>>>   pointer only, never held across I/O
//! rotation: Mutex<()>                              one rotation at a time
//! handle:   Mutex<HandleInner> (per segment)       orders an append against its seal
//! ```
//!
//! A rotation creates the replacement, swaps the pointer, and only then seals
//! the old segment. A writer that picked up the old handle just before the swap
//! either finishes its append before the seal takes the handle lock, or sees
//! `InvalidState` and retries on the replacement. Every acknowledged write lands
//! in exactly one segment.
//!
//! All methods perform blocking file I/O; async callers go through
//! `spawn_blocking`.

use crate::spool::config::BufferConfig;
use crate::spool::error::{Result, SpoolError};
use crate::spool::segment::{SealedSegment, SegmentId, SegmentState};
use crate::spool::segment_store::{SegmentFs, SegmentHandle, SegmentStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Handle<F> = Arc<SegmentHandle<<F as SegmentFs>::File>>;

/// What to do with the open segment when it is retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retire {
    /// Threshold reached. Without a replacement the old segment stays open.
    Rotate,
    /// Drain requested. The old segment is sealed even without a replacement.
    Drain,
}

/// Point-in-time view of the buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub open_segment: Option<SegmentId>,
    pub open_segment_bytes: u64,
    pub sealed_segments: usize,
    pub sealed_bytes: u64,
    /// Age of the oldest sealed segment awaiting upload
    #[serde(serialize_with = "serialize_secs")]
    pub oldest_sealed_age: Option<Duration>,
    /// Segments closed to appends whose seal has not completed
    pub unsealed_segments: usize,
    /// The last attempt to open a new segment failed
    pub degraded: bool,
    pub closed: bool,
}

fn serialize_secs<S: serde::Serializer>(
    age: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match age {
        Some(age) => serializer.serialize_some(&age.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

pub struct Buffer<F: SegmentFs> {
    store: Arc<SegmentStore<F>>,
    config: BufferConfig,
    current: RwLock<Option<Handle<F>>>,
    rotation: Mutex<()>,
    /// Retired segments whose seal failed, retried by `drain`
    unsealed: Mutex<Vec<Handle<F>>>,
    degraded: AtomicBool,
    closed: AtomicBool,
}

impl<F: SegmentFs> Buffer<F> {
    /// Create the buffer and its first open segment
    pub fn open(store: Arc<SegmentStore<F>>, config: BufferConfig) -> Result<Self> {
        let first = store.create_segment()?;
        info!(
            segment = %first.id(),
            max_segment_bytes = config.max_segment_bytes,
            max_segment_age_ms = config.max_segment_age.as_millis() as u64,
            "Buffer opened"
        );
        Ok(Buffer {
            store,
            config,
            current: RwLock::new(Some(Arc::new(first))),
            rotation: Mutex::new(()),
            unsealed: Mutex::new(Vec::new()),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<SegmentStore<F>> {
        &self.store
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Durably append one payload to the open segment.
    ///
    /// Returns once the bytes are written (and fsynced, per policy). On error
    /// nothing was written. Empty payloads are accepted and ignored.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        loop {
            let handle = match self.current.read().clone() {
                Some(handle) => handle,
                None => {
                    self.ensure_current()?;
                    continue;
                }
            };

            match self.store.append(&handle, data) {
                Ok(size) => {
                    if self.should_rotate(&handle, size) {
                        if let Err(e) = self.retire(handle.id(), Retire::Rotate) {
                            // The append itself is durable; only the rotation failed
                            error!(
                                segment = %handle.id(),
                                error = %e,
                                "Could not open a new segment, continuing on the current one"
                            );
                        }
                    }
                    return Ok(());
                }
                // Sealed underneath us by a concurrent rotation, or closed by a
                // failed rollback and still current
                Err(SpoolError::InvalidState { .. }) => {
                    self.retire(handle.id(), Retire::Drain)?;
                    continue;
                }
                Err(e) => {
                    if handle.state() != SegmentState::Open {
                        self.retire(handle.id(), Retire::Drain)?;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Seal the open segment if it holds data and return every sealed segment,
    /// oldest first
    pub fn drain(&self) -> Result<Vec<SealedSegment>> {
        self.retry_unsealed();

        let current = self.current.read().clone();
        match current {
            Some(handle) if handle.size() > 0 || handle.state() != SegmentState::Open => {
                self.retire(handle.id(), Retire::Drain)?;
            }
            Some(_) => {}
            None if !self.is_closed() => {
                if let Err(e) = self.ensure_current() {
                    warn!(error = %e, "Buffer still has no open segment");
                }
            }
            None => {}
        }

        self.store.list_sealed()
    }

    /// Seal the open segment (discarding it if empty) and close the buffer.
    ///
    /// Later appends fail with `BufferClosed`. Used once ingress has stopped.
    pub fn force_flush(&self) -> Result<Option<SealedSegment>> {
        let _rotation = self.rotation.lock();
        self.closed.store(true, Ordering::SeqCst);
        let last = self.current.write().take();
        drop(_rotation);

        self.retry_unsealed();

        let sealed = match last {
            Some(handle) => match self.store.seal_or_discard(&handle) {
                Ok(sealed) => sealed,
                Err(e) => {
                    self.unsealed.lock().push(handle);
                    return Err(e);
                }
            },
            None => None,
        };

        info!(
            segment = ?sealed.map(|s| s.id),
            size_bytes = sealed.map(|s| s.size_bytes).unwrap_or(0),
            "Buffer closed"
        );
        Ok(sealed)
    }

    /// Fsync the open segment
    pub fn sync(&self) -> Result<()> {
        let current = self.current.read().clone();
        match current {
            Some(handle) => self.store.sync(&handle),
            None => Ok(()),
        }
    }

    /// Rotate the open segment if it holds data and has outlived
    /// `max_segment_age`. Returns true when it rotated.
    pub fn rotate_if_aged(&self) -> Result<bool> {
        let max_age = match self.config.age_rotation() {
            Some(age) => age,
            None => return Ok(false),
        };
        let current = self.current.read().clone();
        match current {
            Some(handle) if handle.size() > 0 && self.age_of(&handle) >= max_age => {
                self.retire(handle.id(), Retire::Rotate)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn stats(&self) -> Result<BufferStats> {
        let current = self.current.read().clone();
        let sealed = self.store.list_sealed()?;
        let clock = self.store.clock();

        Ok(BufferStats {
            open_segment: current.as_ref().map(|h| h.id()),
            open_segment_bytes: current.as_ref().map(|h| h.size()).unwrap_or(0),
            sealed_segments: sealed.len(),
            sealed_bytes: sealed.iter().map(|s| s.size_bytes).sum(),
            oldest_sealed_age: sealed.first().map(|s| s.age(clock)),
            unsealed_segments: self.unsealed.lock().len(),
            degraded: self.is_degraded(),
            closed: self.is_closed(),
        })
    }

    fn age_of(&self, handle: &SegmentHandle<F::File>) -> Duration {
        self.store
            .clock()
            .elapsed_since(handle.id().created_at_micros())
    }

    fn should_rotate(&self, handle: &SegmentHandle<F::File>, size: u64) -> bool {
        if size > self.config.max_segment_bytes {
            return true;
        }
        match self.config.age_rotation() {
            Some(max_age) => self.age_of(handle) >= max_age,
            None => false,
        }
    }

    /// Replace the open segment `expected` and seal it.
    ///
    /// No-op if another caller already replaced it.
    fn retire(&self, expected: SegmentId, mode: Retire) -> Result<()> {
        let _rotation = self.rotation.lock();

        let old = match self.current.read().clone() {
            Some(handle) if handle.id() == expected => handle,
            _ => return Ok(()),
        };

        let replacement = match self.store.create_segment() {
            Ok(handle) => {
                debug_assert!(handle.id() > old.id(), "segment ids must increase");
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!(segment = %handle.id(), "Segment creation recovered");
                }
                Some(Arc::new(handle))
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                if mode == Retire::Rotate {
                    return Err(e);
                }
                error!(error = %e, "Could not open a new segment, sealing the current one anyway");
                None
            }
        };

        *self.current.write() = replacement;
        drop(_rotation);

        self.seal_retired(old);
        Ok(())
    }

    fn seal_retired(&self, handle: Handle<F>) {
        match self.store.seal_or_discard(&handle) {
            Ok(Some(sealed)) => {
                debug!(segment = %sealed.id, size_bytes = sealed.size_bytes, "Rotated segment");
            }
            Ok(None) => {}
            Err(e) => {
                error!(
                    segment = %handle.id(),
                    error = %e,
                    "Seal failed, will retry on next drain"
                );
                self.unsealed.lock().push(handle);
            }
        }
    }

    fn retry_unsealed(&self) {
        let pending = std::mem::take(&mut *self.unsealed.lock());
        for handle in pending {
            self.seal_retired(handle);
        }
    }

    /// Install an open segment when there is none (after a failed creation)
    fn ensure_current(&self) -> Result<()> {
        let _rotation = self.rotation.lock();
        if self.current.read().is_some() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(SpoolError::BufferClosed);
        }

        let handle = match self.store.create_segment() {
            Ok(handle) => handle,
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(segment = %handle.id(), "Segment creation recovered");
        }
        *self.current.write() = Some(Arc::new(handle));
        Ok(())
    }
}

impl<F: SegmentFs> std::fmt::Debug for Buffer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("current", &self.current.read().as_ref().map(|h| h.id()))
            .field("degraded", &self.is_degraded())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::clock::ManualClock;
    use crate::spool::config::FsyncPolicy;
    use crate::spool::segment_store::InMemorySegmentFs;
    use bytes::Bytes;

    fn buffer_with(
        fs: &InMemorySegmentFs,
        clock: &ManualClock,
        max_segment_bytes: u64,
    ) -> Buffer<InMemorySegmentFs> {
        let (store, _) =
            SegmentStore::open(fs.clone(), FsyncPolicy::Always, Arc::new(clock.clone())).unwrap();
        let config = BufferConfig {
            max_segment_bytes,
            ..BufferConfig::test("unused")
        };
        Buffer::open(Arc::new(store), config).unwrap()
    }

    fn contents(buffer: &Buffer<InMemorySegmentFs>, sealed: &[SealedSegment]) -> Vec<Bytes> {
        sealed
            .iter()
            .map(|s| buffer.store().read(s).unwrap())
            .collect()
    }

    #[test]
    fn test_rotation_by_size() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 10);

        buffer.append(b"aaaaaa").unwrap();
        buffer.append(b"bbbbbb").unwrap(); // crosses 10 bytes, rotates
        buffer.append(b"ccc").unwrap();

        let sealed = buffer.drain().unwrap();
        assert_eq!(sealed.len(), 2);
        assert!(sealed[0].id < sealed[1].id);
        assert_eq!(
            contents(&buffer, &sealed),
            vec![Bytes::from_static(b"aaaaaabbbbbb"), Bytes::from_static(b"ccc")]
        );
    }

    #[test]
    fn test_rotation_only_past_threshold() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 10);

        buffer.append(b"12345").unwrap();
        buffer.append(b"67890").unwrap(); // exactly at the threshold
        let stats = buffer.stats().unwrap();
        assert_eq!(stats.sealed_segments, 0);
        assert_eq!(stats.open_segment_bytes, 10);

        buffer.append(b"!").unwrap();
        let stats = buffer.stats().unwrap();
        assert_eq!(stats.sealed_segments, 1);
        assert_eq!(stats.sealed_bytes, 11);
        assert_eq!(stats.open_segment_bytes, 0);
    }

    #[test]
    fn test_failed_rollback_moves_writers_to_fresh_segment() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        buffer.append(b"ok;").unwrap();
        let first = buffer.stats().unwrap().open_segment;

        fs.set_fail_appends(true);
        fs.set_fail_truncates(true);
        assert!(buffer.append(b"REJECTED").unwrap_err().is_storage());
        fs.set_fail_appends(false);

        // Replaced right away; its seal waits until the leftover bytes can go
        let stats = buffer.stats().unwrap();
        assert_ne!(stats.open_segment, first);
        assert_eq!(stats.unsealed_segments, 1);

        buffer.append(b"next;").unwrap();
        fs.set_fail_truncates(false);
        let sealed = buffer.drain().unwrap();
        assert_eq!(
            contents(&buffer, &sealed),
            vec![Bytes::from_static(b"ok;"), Bytes::from_static(b"next;")]
        );
        assert_eq!(buffer.stats().unwrap().unsealed_segments, 0);
    }

    #[test]
    fn test_empty_payload_is_noop() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 10);
        buffer.append(b"").unwrap();
        assert_eq!(buffer.stats().unwrap().open_segment_bytes, 0);
        assert!(buffer.drain().unwrap().is_empty());
    }

    #[test]
    fn test_drain_leaves_empty_open_segment_in_place() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        let before = buffer.stats().unwrap().open_segment;

        assert!(buffer.drain().unwrap().is_empty());
        assert_eq!(buffer.stats().unwrap().open_segment, before);
    }

    #[test]
    fn test_drain_replaces_open_segment() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        buffer.append(b"first").unwrap();
        let first = buffer.stats().unwrap().open_segment.unwrap();

        let sealed = buffer.drain().unwrap();
        assert_eq!(sealed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first]);

        buffer.append(b"second").unwrap();
        let stats = buffer.stats().unwrap();
        assert!(stats.open_segment.unwrap() > first);
        assert_eq!(stats.open_segment_bytes, 6);
    }

    #[test]
    fn test_force_flush_closes_buffer() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        buffer.append(b"last words").unwrap();

        let sealed = buffer.force_flush().unwrap().unwrap();
        assert_eq!(sealed.size_bytes, 10);
        assert!(matches!(buffer.append(b"late"), Err(SpoolError::BufferClosed)));

        let stats = buffer.stats().unwrap();
        assert!(stats.closed);
        assert_eq!(stats.open_segment, None);
        // Draining a closed buffer still lists what is pending
        assert_eq!(buffer.drain().unwrap(), vec![sealed]);
    }

    #[test]
    fn test_force_flush_discards_empty_segment() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        assert_eq!(buffer.force_flush().unwrap(), None);
        assert!(fs.file_names().is_empty());
    }

    #[test]
    fn test_rotation_create_failure_keeps_append_and_marks_degraded() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 4);
        let first = buffer.stats().unwrap().open_segment;

        fs.set_fail_creates(true);
        buffer.append(b"12345").unwrap();
        let stats = buffer.stats().unwrap();
        assert!(stats.degraded);
        assert_eq!(stats.open_segment, first);
        assert_eq!(stats.open_segment_bytes, 5);

        fs.set_fail_creates(false);
        buffer.append(b"6").unwrap();
        let stats = buffer.stats().unwrap();
        assert!(!stats.degraded);
        assert_eq!(stats.sealed_segments, 1);
        assert_ne!(stats.open_segment, first);
    }

    #[test]
    fn test_drain_without_replacement_still_seals() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        buffer.append(b"data").unwrap();

        fs.set_fail_creates(true);
        let sealed = buffer.drain().unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(buffer.stats().unwrap().open_segment, None);
        assert!(buffer.append(b"more").unwrap_err().is_storage());

        fs.set_fail_creates(false);
        buffer.append(b"more").unwrap();
        assert!(!buffer.is_degraded());
    }

    #[test]
    fn test_failed_seal_is_retried_by_next_drain() {
        let fs = InMemorySegmentFs::new();
        let buffer = buffer_with(&fs, &ManualClock::new(1), 1024);
        buffer.append(b"pending").unwrap();

        fs.set_fail_renames(true);
        assert!(buffer.drain().unwrap().is_empty());
        assert_eq!(buffer.stats().unwrap().unsealed_segments, 1);

        // Appends go to the replacement meanwhile
        buffer.append(b"new").unwrap();

        fs.set_fail_renames(false);
        let sealed = buffer.drain().unwrap();
        assert_eq!(
            contents(&buffer, &sealed),
            vec![Bytes::from_static(b"pending"), Bytes::from_static(b"new")]
        );
        assert_eq!(buffer.stats().unwrap().unsealed_segments, 0);
    }

    #[test]
    fn test_rotation_by_age() {
        let fs = InMemorySegmentFs::new();
        let clock = ManualClock::new(1_000_000);
        let (store, _) =
            SegmentStore::open(fs.clone(), FsyncPolicy::No, Arc::new(clock.clone())).unwrap();
        let config = BufferConfig {
            max_segment_bytes: 1 << 20,
            max_segment_age: Duration::from_secs(30),
            ..BufferConfig::test("unused")
        };
        let buffer = Buffer::open(Arc::new(store), config).unwrap();

        buffer.append(b"young").unwrap();
        assert!(!buffer.rotate_if_aged().unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(buffer.rotate_if_aged().unwrap());
        assert_eq!(buffer.stats().unwrap().sealed_segments, 1);

        // An aged but empty segment is left alone
        clock.advance(Duration::from_secs(31));
        assert!(!buffer.rotate_if_aged().unwrap());
    }

    #[test]
    fn test_concurrent_appends_and_drains_lose_nothing() {
        let fs = InMemorySegmentFs::new();
        let buffer = Arc::new(buffer_with(&fs, &ManualClock::new(1), 256));
        let writers = 4;
        let per_writer = 200;

        let mut threads = Vec::new();
        for w in 0..writers {
            let buffer = buffer.clone();
            threads.push(std::thread::spawn(move || {
                for n in 0..per_writer {
                    buffer.append(format!("{}:{};", w, n).as_bytes()).unwrap();
                }
            }));
        }
        let drainer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    buffer.drain().unwrap();
                    std::thread::yield_now();
                }
            })
        };
        for t in threads {
            t.join().unwrap();
        }
        drainer.join().unwrap();

        let sealed = buffer.drain().unwrap();
        let all: Vec<u8> = contents(&buffer, &sealed)
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect();
        let text = String::from_utf8(all).unwrap();
        let records: Vec<&str> = text.split(';').filter(|r| !r.is_empty()).collect();
        assert_eq!(records.len(), writers * per_writer);

        // Each writer's records appear exactly once and in order
        for w in 0..writers {
            let seen: Vec<usize> = records
                .iter()
                .filter_map(|r| r.split_once(':'))
                .filter(|(writer, _)| writer.parse::<usize>().unwrap() == w)
                .map(|(_, n)| n.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..per_writer).collect::<Vec<_>>());
        }
    }
}
