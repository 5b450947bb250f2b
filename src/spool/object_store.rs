//! Object Store Abstraction
//!
//! The uploader needs exactly one capability from remote storage: put an
//! object under a key, overwriting whatever is there. Retried puts of the same
//! segment always use the same key, so an overwrite is harmless.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests (with injected failures and latency)
//! - `LocalFsObjectStore`: For development and local testing
//! - `S3ObjectStore`: For production (feature-gated, see `s3_store`)

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        (**self).put(key, data)
    }
}

// ============================================================================
// InMemoryObjectStore - For tests
// ============================================================================

#[derive(Debug, Default)]
struct InMemoryState {
    objects: HashMap<String, Bytes>,
    /// Every successful put in order, including overwrites
    put_log: Vec<String>,
}

/// In-memory object store for unit tests
///
/// Clones share the same contents and fault settings.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<RwLock<InMemoryState>>,
    fail_next: Arc<AtomicUsize>,
    fail_keys: Arc<RwLock<Vec<String>>>,
    latency: Arc<RwLock<Option<Duration>>>,
}

impl InMemoryObjectStore {
    /// Create a new in-memory object store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` puts
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every put until further notice
    pub fn fail_all_puts(&self) {
        self.fail_next.store(usize::MAX, Ordering::SeqCst);
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.fail_keys.write().clear();
    }

    /// Fail every put to keys ending with `suffix`
    pub fn fail_key(&self, suffix: &str) {
        self.fail_keys.write().push(suffix.to_string());
    }

    /// Delay every put, for timeout tests
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.read().objects.get(key).cloned()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys in the order they were successfully put
    pub fn put_log(&self) -> Vec<String> {
        self.state.read().put_log.clone()
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    fn take_injected_failure(&self, key: &str) -> bool {
        if self.fail_keys.read().iter().any(|suffix| key.ends_with(suffix.as_str())) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let latency = *self.latency.read();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if self.take_injected_failure(key) {
                return Err(IoError::new(
                    ErrorKind::Other,
                    format!("injected put failure for {}", key),
                ));
            }
            let mut state = self.state.write();
            state.objects.insert(key.to_string(), data);
            state.put_log.push(key.to_string());
            Ok(())
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Local filesystem object store for development and testing
///
/// Keys map to paths under `base_path`; `/` in a key creates subdirectories.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    /// Create a new local filesystem object store
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore { base_path }
    }

    /// Get the full path for a key
    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    /// Get the base path (for testing)
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write then rename so readers never see a partial object
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &data).await?;
            tokio::fs::rename(&tmp, &path).await
        })
    }
}
