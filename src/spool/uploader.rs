//! Uploader
//!
//! Turns sealed segments into objects. Each run drains the buffer, then for
//! every sealed segment, oldest first:
//!
//! ```text
//! read ──► (compress) ──► put (timeout, retry w/ backoff) ──► delete local file
//!                              │
//!                              └─ all attempts failed: keep file, retry next run
//! ```
//!
//! A segment is deleted only after its put succeeded. Keys are derived from the
//! segment id alone, so a retried or repeated upload overwrites the same object
//! instead of creating a second one.
//!
//! Runs are serialized: the periodic loop and the shutdown flush never work on
//! the same segment at the same time.

use crate::spool::buffer::Buffer;
use crate::spool::config::UploaderConfig;
use crate::spool::error::{Result, SpoolError};
use crate::spool::object_store::ObjectStore;
use crate::spool::segment::{Compression, SealedSegment, SegmentId};
use crate::spool::segment_store::SegmentFs;
use bytes::Bytes;
use rand::Rng;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Object key for a segment: `{prefix}/seg-{id:016x}.seg[.zst]`
pub fn object_key(prefix: &str, id: SegmentId, compression: Compression) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = format!("seg-{}.seg{}", id, compression.key_suffix());
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// What happened to one segment during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { attempts: u32 },
    /// Stored remotely, but the local file could not be removed. The next run
    /// uploads it again to the same key.
    UploadedNotDeleted { reason: String },
    Failed { reason: String, attempts: u32 },
    /// Empty segment, removed without an upload
    Discarded,
    /// Segment disappeared before it could be read
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUpload {
    pub segment: SealedSegment,
    pub key: String,
    pub outcome: UploadOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub segments: Vec<SegmentUpload>,
    /// Set when the buffer could not be drained at all
    pub drain_error: Option<String>,
    /// Age of the oldest segment still waiting after this run
    pub oldest_pending_age: Option<Duration>,
}

impl UploadReport {
    pub fn uploaded(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| {
                matches!(
                    s.outcome,
                    UploadOutcome::Uploaded { .. } | UploadOutcome::UploadedNotDeleted { .. }
                )
            })
            .count()
    }

    pub fn failed(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s.outcome, UploadOutcome::Failed { .. }))
            .count()
    }

    /// Nothing failed and nothing was left behind
    pub fn is_clean(&self) -> bool {
        self.drain_error.is_none()
            && self.segments.iter().all(|s| {
                !matches!(
                    s.outcome,
                    UploadOutcome::Failed { .. } | UploadOutcome::UploadedNotDeleted { .. }
                )
            })
    }
}

/// Result of the final flush at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub rounds: u32,
    pub uploaded: usize,
    /// Segments still on disk, picked up again on the next start
    pub remaining: usize,
    pub deadline_exceeded: bool,
}

pub struct Uploader<F: SegmentFs, O: ObjectStore> {
    buffer: Arc<Buffer<F>>,
    object_store: O,
    config: UploaderConfig,
    run_lock: tokio::sync::Mutex<()>,
}

impl<F: SegmentFs, O: ObjectStore> Uploader<F, O> {
    pub fn new(buffer: Arc<Buffer<F>>, object_store: O, config: UploaderConfig) -> Self {
        Uploader {
            buffer,
            object_store,
            config,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer<F>> {
        &self.buffer
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Drain the buffer and upload every sealed segment once.
    ///
    /// Never fails as a whole: per-segment outcomes are in the report, and a
    /// segment that fails does not stop the ones after it.
    pub async fn run_once(&self) -> UploadReport {
        let _run = self.run_lock.lock().await;
        let mut report = UploadReport::default();

        let buffer = self.buffer.clone();
        match blocking(move || buffer.drain()).await {
            Ok(segments) => {
                for segment in segments {
                    let upload = self.upload_segment(segment).await;
                    report.segments.push(upload);
                }
            }
            Err(e) => {
                error!(error = %e, "Could not drain buffer");
                report.drain_error = Some(e.to_string());
            }
        }

        report.oldest_pending_age = self.oldest_pending_age().await;
        if let Some(age) = report.oldest_pending_age {
            if age >= self.config.stuck_segment_age {
                warn!(
                    oldest_pending_secs = age.as_secs(),
                    threshold_secs = self.config.stuck_segment_age.as_secs(),
                    "Segments are waiting longer than expected for upload"
                );
            }
        }

        if report.segments.is_empty() {
            debug!("Upload run found nothing to do");
        } else {
            info!(
                segments = report.segments.len(),
                uploaded = report.uploaded(),
                failed = report.failed(),
                "Upload run finished"
            );
        }
        report
    }

    /// Run `run_once` every `interval` until `cancel` fires.
    ///
    /// The first run happens one interval after start. Cancelling abandons a
    /// run in progress: a segment whose put was cut short keeps its local file
    /// and goes to the same key on the next run.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs_f64(), "Uploader started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Upload run interrupted by shutdown");
                    break;
                }
                _ = self.run_once() => {}
            }
        }
        info!("Uploader stopped");
    }

    /// Final flush: keep running until a round is clean or the shutdown
    /// deadline passes. Whatever is left stays on disk for the next start.
    pub async fn shutdown_flush(&self) -> ShutdownReport {
        let deadline = Instant::now() + self.config.shutdown_deadline;
        let mut report = ShutdownReport::default();

        loop {
            report.rounds += 1;
            match tokio::time::timeout_at(deadline, self.run_once()).await {
                Ok(round) => {
                    report.uploaded += round.uploaded();
                    if round.is_clean() {
                        break;
                    }
                }
                Err(_) => {
                    report.deadline_exceeded = true;
                    break;
                }
            }

            let pause = self.backoff(report.rounds);
            if Instant::now() + pause >= deadline {
                report.deadline_exceeded = true;
                break;
            }
            tokio::time::sleep(pause).await;
        }

        let buffer = self.buffer.clone();
        report.remaining = match blocking(move || buffer.stats()).await {
            Ok(stats) => stats.sealed_segments + stats.unsealed_segments,
            Err(e) => {
                error!(error = %e, "Could not inspect buffer after final flush");
                0
            }
        };

        if report.remaining > 0 {
            error!(
                remaining = report.remaining,
                rounds = report.rounds,
                deadline_exceeded = report.deadline_exceeded,
                "Segments left undelivered at shutdown, they will be uploaded on next start"
            );
        } else {
            info!(
                rounds = report.rounds,
                uploaded = report.uploaded,
                "Final flush complete"
            );
        }
        report
    }

    async fn upload_segment(&self, segment: SealedSegment) -> SegmentUpload {
        let key = object_key(&self.config.key_prefix, segment.id, self.config.compression);
        let outcome = self.upload_to_key(segment, &key).await;
        SegmentUpload {
            segment,
            key,
            outcome,
        }
    }

    async fn upload_to_key(&self, segment: SealedSegment, key: &str) -> UploadOutcome {
        let store = self.buffer.store().clone();

        if segment.size_bytes == 0 {
            return match blocking(move || store.delete(&segment)).await {
                Ok(()) => UploadOutcome::Discarded,
                Err(e) => UploadOutcome::Failed {
                    reason: e.to_string(),
                    attempts: 0,
                },
            };
        }

        let compression = self.config.compression;
        let read_store = store.clone();
        let data = match blocking(move || {
            let raw = read_store.read(&segment)?;
            compression
                .encode(raw)
                .map_err(|e| SpoolError::storage(format!("compressing segment {}", segment.id), e))
        })
        .await
        {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                warn!(segment = %segment.id, "Segment vanished before upload");
                return UploadOutcome::Vanished;
            }
            Err(e) => {
                error!(segment = %segment.id, error = %e, "Could not read segment for upload");
                return UploadOutcome::Failed {
                    reason: e.to_string(),
                    attempts: 0,
                };
            }
        };

        let attempts = match self.put_with_retry(segment.id, key, data).await {
            Ok(attempts) => attempts,
            Err(e) => {
                error!(segment = %segment.id, key = %key, error = %e, "Segment upload failed after all retries");
                return UploadOutcome::Failed {
                    reason: e.to_string(),
                    attempts: self.config.max_attempts.max(1),
                };
            }
        };

        match blocking(move || store.delete(&segment)).await {
            Ok(()) => {
                debug!(segment = %segment.id, key = %key, attempts, "Segment uploaded");
                UploadOutcome::Uploaded { attempts }
            }
            Err(e) => {
                warn!(segment = %segment.id, key = %key, error = %e, "Uploaded segment could not be deleted");
                UploadOutcome::UploadedNotDeleted {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Put with a per-attempt timeout. Returns the number of attempts used.
    async fn put_with_retry(&self, id: SegmentId, key: &str, data: Bytes) -> Result<u32> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.backoff(attempt);
                warn!(
                    key = %key,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "Upload failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }

            let put = self.object_store.put(key, data.clone());
            match tokio::time::timeout(self.config.attempt_timeout, put).await {
                Ok(Ok(())) => return Ok(attempt + 1),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "put timed out after {}ms",
                        self.config.attempt_timeout.as_millis()
                    )
                }
            }
        }

        Err(SpoolError::Upload {
            id,
            key: key.to_string(),
            reason: last_error,
        })
    }

    /// `retry_backoff * 2^(attempt-1)` plus up to 50% jitter, capped
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(BACKOFF_MAX);
        let jitter_cap = (base.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
        (base + jitter).min(BACKOFF_MAX)
    }

    async fn oldest_pending_age(&self) -> Option<Duration> {
        let store = self.buffer.store().clone();
        match blocking(move || store.list_sealed()).await {
            Ok(sealed) => sealed.first().map(|s| s.age(self.buffer.store().clock())),
            Err(e) => {
                warn!(error = %e, "Could not list pending segments");
                None
            }
        }
    }
}

/// Run blocking segment I/O off the async worker threads
async fn blocking<T, Func>(f: Func) -> Result<T>
where
    T: Send + 'static,
    Func: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => Err(SpoolError::storage(
            "running blocking segment task",
            IoError::new(ErrorKind::Other, join.to_string()),
        )),
    }
}
