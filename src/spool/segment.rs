//! Segment Identity and Naming
//!
//! A segment is one append-only file in the buffer directory. Its lifecycle
//! state is encoded in the file name so it can be recovered from a directory
//! listing alone after a crash:
//!
//! ```text
//! seg-{id:016x}.open     accepting appends
//! seg-{id:016x}.sealed   immutable, waiting for upload
//! ```
//!
//! Identifiers are creation timestamps in microseconds, bumped to
//! `previous + 1` whenever the clock has not moved past the last one handed out.
//! Zero-padded hex keeps lexicographic order equal to numeric order.

use crate::spool::clock::Clock;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SEGMENT_PREFIX: &str = "seg-";
const OPEN_SUFFIX: &str = ".open";
const SEALED_SUFFIX: &str = ".sealed";

/// Unique, monotonically increasing segment identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creation time in microseconds since the Unix epoch
    pub fn created_at_micros(&self) -> u64 {
        self.0
    }

    pub fn open_file_name(&self) -> String {
        format!("{}{:016x}{}", SEGMENT_PREFIX, self.0, OPEN_SUFFIX)
    }

    pub fn sealed_file_name(&self) -> String {
        format!("{}{:016x}{}", SEGMENT_PREFIX, self.0, SEALED_SUFFIX)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lifecycle state of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    /// Closed to appends, seal not yet durable (a failed seal stays here)
    Sealing,
    Sealed,
    Deleted,
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentState::Open => write!(f, "open"),
            SegmentState::Sealing => write!(f, "sealing"),
            SegmentState::Sealed => write!(f, "sealed"),
            SegmentState::Deleted => write!(f, "deleted"),
        }
    }
}

/// What a file name in the buffer directory says about its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFileKind {
    Open(SegmentId),
    Sealed(SegmentId),
}

impl SegmentFileKind {
    /// Parse a buffer directory entry. Returns None for foreign files.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(SEGMENT_PREFIX)?;
        if let Some(hex) = rest.strip_suffix(OPEN_SUFFIX) {
            return parse_hex_id(hex).map(SegmentFileKind::Open);
        }
        if let Some(hex) = rest.strip_suffix(SEALED_SUFFIX) {
            return parse_hex_id(hex).map(SegmentFileKind::Sealed);
        }
        None
    }

    pub fn id(&self) -> SegmentId {
        match self {
            SegmentFileKind::Open(id) | SegmentFileKind::Sealed(id) => *id,
        }
    }
}

fn parse_hex_id(hex: &str) -> Option<SegmentId> {
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok().map(SegmentId)
}

/// Reference to a sealed segment, handed from the buffer to the uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SealedSegment {
    pub id: SegmentId,
    pub size_bytes: u64,
}

impl SealedSegment {
    pub fn age(&self, clock: &dyn Clock) -> Duration {
        clock.elapsed_since(self.id.created_at_micros())
    }
}

/// Hands out identifiers that are unique and strictly increasing
#[derive(Debug)]
pub struct SegmentIdAllocator {
    last: AtomicU64,
}

impl SegmentIdAllocator {
    /// Start after `last_used`, so ids never repeat across process restarts
    pub fn new(last_used: Option<SegmentId>) -> Self {
        SegmentIdAllocator {
            last: AtomicU64::new(last_used.map(|id| id.0).unwrap_or(0)),
        }
    }

    pub fn next(&self, clock: &dyn Clock) -> SegmentId {
        let now = clock.now_micros();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        SegmentId(now.max(previous.saturating_add(1)))
    }
}

/// Encoding applied to segment content at upload time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    /// Zstd compression (requires the `compression` feature)
    #[cfg(feature = "compression")]
    Zstd { level: i32 },
}

impl Compression {
    /// Suffix appended to the object key
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            #[cfg(feature = "compression")]
            Compression::Zstd { .. } => ".zst",
        }
    }

    pub fn encode(&self, data: Bytes) -> std::io::Result<Bytes> {
        match self {
            Compression::None => Ok(data),
            #[cfg(feature = "compression")]
            Compression::Zstd { level } => zstd::encode_all(&data[..], *level).map(Bytes::from),
        }
    }
}
