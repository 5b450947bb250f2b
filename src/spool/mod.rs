//! Durable Write Spool
//!
//! Accepted writes are appended to segment files on local disk and uploaded to
//! an object store in batches, one object per segment.
//!
//! ## Architecture
//!
//! ```text
//! append → Buffer → SegmentStore (seg-X.open)
//!                        │ rotate (size / age / drain)
//!                        ▼
//!                   seg-X.sealed → Uploader → ObjectStore → delete seg-X.sealed
//! ```
//!
//! ## Key Features
//!
//! - **No silent loss**: a write is acknowledged only once it is on disk
//! - **Crash recovery**: segments left open by a dead process are sealed on start
//! - **Retry-safe keys**: one segment always maps to the same object key
//! - **Writers never wait on uploads**: rotation swaps a pointer, uploads run apart

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod object_store;
pub mod segment;
pub mod segment_store;
pub mod uploader;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use buffer::{Buffer, BufferStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    parse_duration, BufferConfig, ConfigError, FsyncPolicy, IngressConfig, LogFormat,
    ObjectStoreType, S3Config, SpoolConfig, UploaderConfig,
};
pub use error::{Result, SpoolError};
pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore};
pub use segment::{Compression, SealedSegment, SegmentId, SegmentState};
pub use segment_store::{
    InMemorySegmentFs, LocalSegmentFs, RecoveryReport, SegmentFile, SegmentFs, SegmentHandle,
    SegmentStore,
};
pub use uploader::{
    object_key, SegmentUpload, ShutdownReport, UploadOutcome, UploadReport, Uploader,
};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
