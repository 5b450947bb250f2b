pub mod ingress;
pub mod observability;
pub mod spool;

pub use ingress::router;
pub use spool::{Buffer, SegmentStore, SpoolConfig, SpoolError, Uploader};
