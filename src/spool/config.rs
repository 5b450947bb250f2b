//! Configuration for the Spool
//!
//! Every setting has a default; an optional TOML file (`SPOOL_CONFIG`) is
//! loaded first and `SPOOL_*` environment variables override it.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | SPOOL_CONFIG | - | TOML file loaded before env overrides |
//! | SPOOL_LISTEN | 0.0.0.0:8080 | Ingress listen address |
//! | SPOOL_BUFFER_DIR | - (required) | Buffer directory |
//! | SPOOL_STORE_TYPE | s3 | memory, localfs, or s3 |
//! | SPOOL_LOCAL_PATH | - | LocalFs object store root |
//! | SPOOL_S3_BUCKET | - | S3 bucket name |
//! | SPOOL_S3_KEY_PREFIX | "" | Object key prefix |
//! | SPOOL_S3_REGION / AWS_REGION | us-east-1 | S3 region |
//! | SPOOL_S3_ENDPOINT | - | S3-compatible endpoint (MinIO) |
//! | SPOOL_UPLOAD_INTERVAL | 1h | Upload period |
//! | SPOOL_MAX_SEGMENT_BYTES | 67108864 | Size rotation threshold |
//! | SPOOL_MAX_SEGMENT_AGE | 0 | Age rotation threshold (0 = off) |
//! | SPOOL_FSYNC | everysec | always, everysec, no |
//! | SPOOL_SHUTDOWN_DEADLINE | 5m | Final flush deadline |
//! | SPOOL_HTTP_SHUTDOWN_TIMEOUT | 1m | Ingress drain timeout |
//! | SPOOL_MAX_BODY_BYTES | 16777216 | Request body limit |
//! | SPOOL_NEWLINE_DELIMITED | false | Terminate bodies with `\n` |
//! | SPOOL_COMPRESSION | none | none or zstd |
//! | SPOOL_LOG_FORMAT | text | text or json |
//!
//! Durations use Go-style strings: `250ms`, `90s`, `1h30m`.

use crate::spool::segment::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_S3_REGION: &str = "us-east-1";
#[cfg(feature = "compression")]
const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid_value(name: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Fsync policy for segment appends
///
/// Mirrors Redis AOF `appendfsync`. Sealing always fsyncs regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FsyncPolicy {
    /// fsync before every append returns. No acknowledged write is lost.
    #[serde(rename = "always")]
    Always,
    /// fsync at most once per second. Up to one second of writes at risk.
    #[default]
    #[serde(rename = "everysec")]
    EverySecond,
    /// Leave flushing to the OS until the segment is sealed
    #[serde(rename = "no")]
    No,
}

impl FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySecond),
            "no" => Ok(FsyncPolicy::No),
            _ => Err("expected always, everysec or no".to_string()),
        }
    }
}

/// Type of object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreType {
    /// In-memory store (for tests and dry runs)
    Memory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible (requires the `s3` feature)
    #[default]
    S3,
}

impl FromStr for ObjectStoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(ObjectStoreType::Memory),
            "localfs" => Ok(ObjectStoreType::LocalFs),
            "s3" => Ok(ObjectStoreType::S3),
            _ => Err("expected memory, localfs or s3".to_string()),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err("expected text or json".to_string()),
        }
    }
}

fn parse_compression(s: &str) -> Result<Compression, String> {
    match s.to_lowercase().as_str() {
        "none" | "" => Ok(Compression::None),
        #[cfg(feature = "compression")]
        "zstd" => Ok(Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }),
        #[cfg(not(feature = "compression"))]
        "zstd" => Err("built without the compression feature".to_string()),
        _ => Err("expected none or zstd".to_string()),
    }
}

/// S3 configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            bucket: String::new(),
            region: DEFAULT_S3_REGION.to_string(),
            endpoint: None,
        }
    }
}

/// Buffer and segment store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Buffer directory on durable local storage
    pub dir: PathBuf,
    /// Seal the open segment once an append takes it past this size; the
    /// append that crosses it still lands in full (default: 64MB)
    pub max_segment_bytes: u64,
    /// Seal the open segment once it is this old; zero disables (default: off)
    #[serde(with = "duration_millis")]
    pub max_segment_age: Duration,
    /// When appends are fsynced
    pub fsync: FsyncPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            dir: PathBuf::new(),
            max_segment_bytes: 64 * 1024 * 1024, // 64MB
            max_segment_age: Duration::ZERO,
            fsync: FsyncPolicy::EverySecond,
        }
    }
}

impl BufferConfig {
    /// Configuration for tests (tiny segments, every append durable)
    pub fn test(dir: impl Into<PathBuf>) -> Self {
        BufferConfig {
            dir: dir.into(),
            max_segment_bytes: 64,
            max_segment_age: Duration::ZERO,
            fsync: FsyncPolicy::Always,
        }
    }

    pub fn age_rotation(&self) -> Option<Duration> {
        (!self.max_segment_age.is_zero()).then_some(self.max_segment_age)
    }
}

/// Uploader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Prefix for every object key
    pub key_prefix: String,
    /// Time between periodic runs (default: 1 hour)
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Timeout for a single put attempt (default: 5 minutes)
    #[serde(with = "duration_millis")]
    pub attempt_timeout: Duration,
    /// Put attempts per segment per run (default: 3)
    pub max_attempts: u32,
    /// Base delay between attempts, doubled each retry (default: 200ms)
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    /// Upper bound on the final flush at shutdown (default: 5 minutes)
    #[serde(with = "duration_millis")]
    pub shutdown_deadline: Duration,
    /// Warn when the oldest pending segment is older than this (default: 2 hours)
    #[serde(with = "duration_millis")]
    pub stuck_segment_age: Duration,
    /// Encoding of uploaded objects
    pub compression: Compression,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        UploaderConfig {
            key_prefix: String::new(),
            interval: Duration::from_secs(3600), // 1 hour
            attempt_timeout: Duration::from_secs(300),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            shutdown_deadline: Duration::from_secs(300),
            stuck_segment_age: Duration::from_secs(2 * 3600),
            compression: Compression::None,
        }
    }
}

impl UploaderConfig {
    /// Configuration for tests (fast retries, short deadlines)
    pub fn test() -> Self {
        UploaderConfig {
            key_prefix: "test".to_string(),
            interval: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(1),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            shutdown_deadline: Duration::from_millis(500),
            stuck_segment_age: Duration::from_secs(60),
            compression: Compression::None,
        }
    }
}

/// HTTP ingress settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub listen_addr: String,
    /// Largest accepted request body (default: 16MB)
    pub max_body_bytes: usize,
    /// Terminate each body with `\n` if it does not end with one
    pub newline_delimited: bool,
    /// How long in-flight requests get to finish at shutdown (default: 1 minute)
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_body_bytes: 16 * 1024 * 1024, // 16MB
            newline_delimited: false,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub buffer: BufferConfig,
    pub uploader: UploaderConfig,
    pub ingress: IngressConfig,
    /// Object store type
    pub store_type: ObjectStoreType,
    /// Local filesystem path (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    pub s3: S3Config,
    pub log_format: LogFormat,
}

impl SpoolConfig {
    /// Create config for testing (in-memory store)
    pub fn test(dir: impl Into<PathBuf>) -> Self {
        SpoolConfig {
            buffer: BufferConfig::test(dir),
            uploader: UploaderConfig::test(),
            ingress: IngressConfig::default(),
            store_type: ObjectStoreType::Memory,
            local_path: None,
            s3: S3Config::default(),
            log_format: LogFormat::Text,
        }
    }

    /// Load from `SPOOL_CONFIG` (if set) and the process environment, then validate
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SPOOL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => SpoolConfig::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from variables returned by `lookup`
    pub fn apply_env<L>(&mut self, lookup: L) -> Result<(), ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SPOOL_LISTEN") {
            self.ingress.listen_addr = v;
        }
        if let Some(v) = lookup("SPOOL_BUFFER_DIR") {
            self.buffer.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SPOOL_STORE_TYPE") {
            self.store_type = parse_var("SPOOL_STORE_TYPE", &v)?;
        }
        if let Some(v) = lookup("SPOOL_LOCAL_PATH") {
            self.local_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SPOOL_S3_BUCKET") {
            self.s3.bucket = v;
        }
        if let Some(v) = lookup("SPOOL_S3_KEY_PREFIX") {
            self.uploader.key_prefix = v;
        }
        if let Some(v) = lookup("SPOOL_S3_REGION").or_else(|| lookup("AWS_REGION")) {
            self.s3.region = v;
        }
        if let Some(v) = lookup("SPOOL_S3_ENDPOINT") {
            self.s3.endpoint = Some(v).filter(|e| !e.is_empty());
        }
        if let Some(v) = lookup("SPOOL_UPLOAD_INTERVAL") {
            self.uploader.interval = duration_var("SPOOL_UPLOAD_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("SPOOL_MAX_SEGMENT_BYTES") {
            self.buffer.max_segment_bytes = parse_var("SPOOL_MAX_SEGMENT_BYTES", &v)?;
        }
        if let Some(v) = lookup("SPOOL_MAX_SEGMENT_AGE") {
            self.buffer.max_segment_age = duration_var("SPOOL_MAX_SEGMENT_AGE", &v)?;
        }
        if let Some(v) = lookup("SPOOL_FSYNC") {
            self.buffer.fsync = parse_var("SPOOL_FSYNC", &v)?;
        }
        if let Some(v) = lookup("SPOOL_SHUTDOWN_DEADLINE") {
            self.uploader.shutdown_deadline = duration_var("SPOOL_SHUTDOWN_DEADLINE", &v)?;
        }
        if let Some(v) = lookup("SPOOL_HTTP_SHUTDOWN_TIMEOUT") {
            self.ingress.shutdown_timeout = duration_var("SPOOL_HTTP_SHUTDOWN_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SPOOL_MAX_BODY_BYTES") {
            self.ingress.max_body_bytes = parse_var("SPOOL_MAX_BODY_BYTES", &v)?;
        }
        if let Some(v) = lookup("SPOOL_NEWLINE_DELIMITED") {
            self.ingress.newline_delimited = parse_bool("SPOOL_NEWLINE_DELIMITED", &v)?;
        }
        if let Some(v) = lookup("SPOOL_COMPRESSION") {
            self.uploader.compression = parse_compression(&v)
                .map_err(|reason| ConfigError::invalid_value("SPOOL_COMPRESSION", &v, reason))?;
        }
        if let Some(v) = lookup("SPOOL_LOG_FORMAT") {
            self.log_format = parse_var("SPOOL_LOG_FORMAT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "buffer directory is required (SPOOL_BUFFER_DIR)".to_string(),
            ));
        }
        if self.buffer.max_segment_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_segment_bytes must be greater than zero".to_string(),
            ));
        }
        if self.uploader.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "upload interval must be greater than zero".to_string(),
            ));
        }
        if self.uploader.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ingress.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        match self.store_type {
            ObjectStoreType::S3 if self.s3.bucket.is_empty() => Err(ConfigError::Invalid(
                "S3 bucket is required for the s3 store (SPOOL_S3_BUCKET)".to_string(),
            )),
            ObjectStoreType::LocalFs if self.local_path.is_none() => Err(ConfigError::Invalid(
                "local_path is required for the localfs store (SPOOL_LOCAL_PATH)".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid_value(name, value, e.to_string()))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigError::invalid_value(name, value, "expected true or false")),
    }
}

fn duration_var(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|reason| ConfigError::invalid_value(name, value, reason))
}

/// Parse a Go-style duration such as `300ms`, `1.5h` or `2h45m`
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("expected a number at {:?}", rest));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("bad number {:?}", &rest[..number_len]))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err("missing unit".to_string()),
            other => return Err(format!("unknown unit {:?}", other)),
        };
        rest = &rest[unit_len..];
        total_nanos += number * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err("duration out of range".to_string());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
