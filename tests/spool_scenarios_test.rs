//! End-to-end spool scenarios on a real buffer directory
//!
//! Each test wires `LocalSegmentFs` → `SegmentStore` → `Buffer` → `Uploader`
//! the way the server binary does and checks what ends up in the object store
//! and what is left on disk.

use bytes::Bytes;
use s3_spool::spool::{
    object_key, Buffer, BufferConfig, Compression, FsyncPolicy, InMemoryObjectStore,
    LocalFsObjectStore, LocalSegmentFs, ManualClock, SegmentStore, SpoolError, SystemClock,
    UploadOutcome, Uploader, UploaderConfig,
};
use std::path::Path;
use std::sync::Arc;

type LocalUploader<O> = Uploader<LocalSegmentFs, O>;

fn open_spool<O: s3_spool::spool::ObjectStore>(
    dir: &Path,
    max_segment_bytes: u64,
    objects: O,
) -> Arc<LocalUploader<O>> {
    let fs = LocalSegmentFs::new(dir).unwrap();
    let (store, _) = SegmentStore::open(fs, FsyncPolicy::Always, Arc::new(SystemClock)).unwrap();
    let config = BufferConfig {
        max_segment_bytes,
        ..BufferConfig::test(dir)
    };
    let buffer = Arc::new(Buffer::open(Arc::new(store), config).unwrap());
    Arc::new(Uploader::new(buffer, objects, UploaderConfig::test()))
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(suffix))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_three_payloads_two_segments() {
    let dir = tempfile::tempdir().unwrap();
    let objects = InMemoryObjectStore::new();
    let uploader = open_spool(dir.path(), 15, objects.clone());
    let buffer = uploader.buffer();

    buffer.append(b"payload-01").unwrap();
    buffer.append(b"payload-02").unwrap(); // 20 bytes, past 15, rotates
    buffer.append(b"payload-03").unwrap();
    assert_eq!(files_with_suffix(dir.path(), ".sealed").len(), 1);

    let report = uploader.run_once().await;
    assert_eq!(report.uploaded(), 2);
    assert!(report.is_clean());

    let keys: Vec<String> = report.segments.iter().map(|s| s.key.clone()).collect();
    assert_eq!(objects.put_log(), keys);
    assert_eq!(
        objects.get(&keys[0]).unwrap(),
        Bytes::from_static(b"payload-01payload-02")
    );
    assert_eq!(objects.get(&keys[1]).unwrap(), Bytes::from_static(b"payload-03"));

    // Both sealed files deleted, only the fresh empty open segment remains
    assert!(files_with_suffix(dir.path(), ".sealed").is_empty());
    assert_eq!(files_with_suffix(dir.path(), ".open").len(), 1);
}

#[tokio::test]
async fn test_failed_upload_kept_then_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let objects = InMemoryObjectStore::new();
    let uploader = open_spool(dir.path(), 1024, objects.clone());
    uploader.buffer().append(b"important").unwrap();

    objects.fail_all_puts();
    let report = uploader.run_once().await;
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.segments[0].outcome,
        UploadOutcome::Failed { .. }
    ));
    assert_eq!(files_with_suffix(dir.path(), ".sealed").len(), 1);

    objects.heal();
    let report = uploader.run_once().await;
    assert_eq!(report.uploaded(), 1);
    assert!(files_with_suffix(dir.path(), ".sealed").is_empty());

    // Retried upload landed on the key derived from the segment id
    let segment = report.segments[0].segment;
    let key = object_key("test", segment.id, Compression::None);
    assert_eq!(objects.get(&key).unwrap(), Bytes::from_static(b"important"));
    assert_eq!(objects.len(), 1);
}

#[tokio::test]
async fn test_shutdown_sequence_leaves_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let objects = InMemoryObjectStore::new();
    let uploader = open_spool(dir.path(), 1024, objects.clone());
    uploader.buffer().append(b"last request").unwrap();

    let sealed = uploader.buffer().force_flush().unwrap();
    assert!(sealed.is_some());
    assert!(matches!(
        uploader.buffer().append(b"too late"),
        Err(SpoolError::BufferClosed)
    ));

    let report = uploader.shutdown_flush().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.remaining, 0);
    assert!(!report.deadline_exceeded);
    assert_eq!(objects.len(), 1);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_crash_recovery_uploads_abandoned_segment() {
    let dir = tempfile::tempdir().unwrap();

    // First process: append, then die without sealing
    {
        let uploader = open_spool(dir.path(), 1024, InMemoryObjectStore::new());
        uploader.buffer().append(b"before the crash").unwrap();
    }
    assert_eq!(files_with_suffix(dir.path(), ".open").len(), 1);

    // Second process
    let fs = LocalSegmentFs::new(dir.path()).unwrap();
    let (store, recovery) =
        SegmentStore::open(fs, FsyncPolicy::Always, Arc::new(SystemClock)).unwrap();
    assert_eq!(recovery.sealed_abandoned.len(), 1);
    assert_eq!(recovery.pending.len(), 1);

    let objects = InMemoryObjectStore::new();
    let buffer = Arc::new(Buffer::open(Arc::new(store), BufferConfig::test(dir.path())).unwrap());
    assert!(buffer.stats().unwrap().open_segment.unwrap() > recovery.sealed_abandoned[0]);
    let uploader = Uploader::new(buffer, objects.clone(), UploaderConfig::test());

    let report = uploader.run_once().await;
    assert_eq!(report.uploaded(), 1);
    assert_eq!(report.segments[0].segment.id, recovery.sealed_abandoned[0]);
    assert_eq!(
        objects.get(&report.segments[0].key).unwrap(),
        Bytes::from_static(b"before the crash")
    );
}

#[tokio::test]
async fn test_empty_abandoned_segment_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    {
        let _uploader = open_spool(dir.path(), 1024, InMemoryObjectStore::new());
    }
    assert_eq!(files_with_suffix(dir.path(), ".open").len(), 1);

    let fs = LocalSegmentFs::new(dir.path()).unwrap();
    let (_, recovery) =
        SegmentStore::open(fs, FsyncPolicy::Always, Arc::new(ManualClock::new(0))).unwrap();
    assert_eq!(recovery.discarded_empty.len(), 1);
    assert!(recovery.pending.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_local_fs_object_store_end_to_end() {
    let buffer_dir = tempfile::tempdir().unwrap();
    let object_dir = tempfile::tempdir().unwrap();
    let uploader = open_spool(
        buffer_dir.path(),
        1024,
        LocalFsObjectStore::new(object_dir.path().to_path_buf()),
    );

    uploader.buffer().append(b"line one\n").unwrap();
    uploader.buffer().append(b"line two\n").unwrap();
    let report = uploader.run_once().await;
    assert_eq!(report.uploaded(), 1);

    let stored = std::fs::read(object_dir.path().join(&report.segments[0].key)).unwrap();
    assert_eq!(stored, b"line one\nline two\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_and_uploads_deliver_every_byte_once() {
    let dir = tempfile::tempdir().unwrap();
    let objects = InMemoryObjectStore::new();
    let uploader = open_spool(dir.path(), 512, objects.clone());
    let writers = 4usize;
    let per_writer = 300usize;

    let mut producers = Vec::new();
    for w in 0..writers {
        let buffer = uploader.buffer().clone();
        producers.push(tokio::task::spawn_blocking(move || {
            for n in 0..per_writer {
                buffer.append(format!("{}:{};", w, n).as_bytes()).unwrap();
            }
        }));
    }

    let drainer = {
        let uploader = uploader.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                uploader.run_once().await;
                tokio::task::yield_now().await;
            }
        })
    };

    for p in producers {
        p.await.unwrap();
    }
    drainer.await.unwrap();

    uploader.buffer().force_flush().unwrap();
    let report = uploader.shutdown_flush().await;
    assert_eq!(report.remaining, 0);

    // Every object was put exactly once
    let log = objects.put_log();
    let mut unique = log.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), log.len());

    // Keys sort in segment order; concatenation holds every record exactly once
    let all: Vec<u8> = objects
        .keys()
        .iter()
        .flat_map(|k| objects.get(k).unwrap().to_vec())
        .collect();
    let text = String::from_utf8(all).unwrap();
    let records: Vec<&str> = text.split(';').filter(|r| !r.is_empty()).collect();
    assert_eq!(records.len(), writers * per_writer);

    for w in 0..writers {
        let seen: Vec<usize> = records
            .iter()
            .filter_map(|r| r.split_once(':'))
            .filter(|(writer, _)| writer.parse::<usize>().unwrap() == w)
            .map(|(_, n)| n.parse().unwrap())
            .collect();
        assert_eq!(seen, (0..per_writer).collect::<Vec<_>>());
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
