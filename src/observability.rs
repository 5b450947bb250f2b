//! Logging setup
//!
//! `RUST_LOG` selects what is logged (default `info`); the format is human
//! readable text or one JSON object per line.

use crate::spool::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
