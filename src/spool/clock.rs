//! Clock Abstraction
//!
//! Segment identifiers and segment ages are derived from wall-clock time.
//! Routing every read of "now" through this trait lets tests drive rotation
//! by age and stuck-segment detection without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in microseconds since the Unix epoch
///
/// Implementations:
/// - `SystemClock`: real system time
/// - `ManualClock`: time only moves when a test moves it
pub trait Clock: Send + Sync + 'static {
    fn now_micros(&self) -> u64;

    /// Time elapsed since a microsecond timestamp (zero if it lies in the future)
    fn elapsed_since(&self, since_micros: u64) -> Duration {
        Duration::from_micros(self.now_micros().saturating_sub(since_micros))
    }
}

/// Production clock using real system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        ManualClock {
            time_us: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, micros: u64) {
        self.time_us.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.time_us.load(Ordering::SeqCst)
    }
}
