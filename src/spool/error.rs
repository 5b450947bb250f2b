//! Spool Error Types
//!
//! ## Error Categories
//!
//! - `Storage`: local disk I/O failed (create, append, sync, rename, read, delete)
//! - `InvalidState`: operation on a segment in the wrong lifecycle state
//! - `NotFound`: the segment no longer exists (usually benign)
//! - `Upload`: the object store rejected a put after all attempts
//! - `BufferClosed`: write attempted after the final flush closed the buffer
//!
//! Producers only ever see `Storage` and `BufferClosed`. Upload failures are
//! retried by the uploader and never escalated to the write path.

use crate::spool::segment::{SegmentId, SegmentState};
use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpoolError>;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("storage error while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: IoError,
    },

    #[error("segment {id} is {state}")]
    InvalidState { id: SegmentId, state: SegmentState },

    #[error("segment not found: {0}")]
    NotFound(SegmentId),

    #[error("upload of segment {id} to {key} failed: {reason}")]
    Upload {
        id: SegmentId,
        key: String,
        reason: String,
    },

    #[error("buffer is closed for writes")]
    BufferClosed,
}

impl SpoolError {
    /// Wrap an I/O error with what we were doing when it happened
    pub fn storage(context: impl Into<String>, source: IoError) -> Self {
        SpoolError::Storage {
            context: context.into(),
            source,
        }
    }

    /// Map an I/O error on an existing segment, keeping `NotFound` distinct
    pub(crate) fn from_segment_io(id: SegmentId, context: &str, source: IoError) -> Self {
        if source.kind() == ErrorKind::NotFound {
            SpoolError::NotFound(id)
        } else {
            SpoolError::storage(format!("{} segment {}", context, id), source)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SpoolError::NotFound(_))
    }

    /// True when the failure means local durability cannot be guaranteed
    pub fn is_storage(&self) -> bool {
        matches!(self, SpoolError::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_io_maps_to_not_found() {
        let err = SpoolError::from_segment_io(
            SegmentId(7),
            "reading",
            IoError::new(ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_io_maps_to_storage() {
        let err = SpoolError::from_segment_io(
            SegmentId(7),
            "reading",
            IoError::new(ErrorKind::PermissionDenied, "nope"),
        );
        assert!(err.is_storage());
        assert!(err.to_string().contains("reading segment 0000000000000007"));
    }
}
