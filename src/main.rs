//! s3-spool server
//!
//! Accepts writes over HTTP, spools them to a local buffer directory and
//! uploads the buffered segments to an object store every upload interval and
//! once more at shutdown.
//!
//! Configuration comes from `SPOOL_*` environment variables and an optional
//! TOML file; see `s3_spool::spool::config` for the full table.
//!
//! ## Shutdown
//!
//! On SIGINT or SIGTERM: stop accepting requests (in-flight ones get
//! `SPOOL_HTTP_SHUTDOWN_TIMEOUT`), stop the periodic uploader, seal the open
//! segment and run a final upload bounded by `SPOOL_SHUTDOWN_DEADLINE`.
//! Anything not delivered stays in the buffer directory for the next start.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use s3_spool::observability::init_tracing;
use s3_spool::router;
use s3_spool::spool::{
    Buffer, FsyncPolicy, InMemoryObjectStore, LocalFsObjectStore, LocalSegmentFs, ObjectStore,
    ObjectStoreType, SegmentStore, SpoolConfig, SystemClock, Uploader,
};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = SpoolConfig::load()?;
    init_tracing(config.log_format)?;

    info!(
        buffer_dir = %config.buffer.dir.display(),
        store_type = ?config.store_type,
        listen = %config.ingress.listen_addr,
        upload_interval_secs = config.uploader.interval.as_secs_f64(),
        fsync = ?config.buffer.fsync,
        "Starting s3-spool"
    );

    let object_store = build_object_store(&config)?;

    let fs = LocalSegmentFs::new(&config.buffer.dir)?;
    let (store, recovery) = SegmentStore::open(fs, config.buffer.fsync, Arc::new(SystemClock))?;
    if !recovery.pending.is_empty() {
        info!(
            pending = recovery.pending.len(),
            sealed_abandoned = recovery.sealed_abandoned.len(),
            "Segments from a previous run are waiting for upload"
        );
    }

    let buffer = Arc::new(Buffer::open(Arc::new(store), config.buffer.clone())?);
    let uploader = Arc::new(Uploader::new(
        buffer.clone(),
        object_store,
        config.uploader.clone(),
    ));

    // Background tasks
    let background = CancellationToken::new();
    let upload_task = {
        let uploader = uploader.clone();
        let cancel = background.clone();
        tokio::spawn(async move { uploader.run_loop(cancel).await })
    };
    let maintenance_task = spawn_maintenance(buffer.clone(), config.buffer.fsync, background.clone());

    // Ingress
    let listener = TcpListener::bind(&config.ingress.listen_addr).await?;
    info!(addr = %config.ingress.listen_addr, "Ingress listening");

    let stop_ingress = CancellationToken::new();
    let mut server = {
        let stop = stop_ingress.clone();
        let app = router(buffer.clone(), &config.ingress);
        tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .into_future(),
        )
    };

    let server_finished = tokio::select! {
        signal = shutdown_signal() => {
            info!(signal, "Shutdown requested, stopping ingress");
            false
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("Ingress stopped on its own"),
                Ok(Err(e)) => error!(error = %e, "Ingress failed"),
                Err(e) => error!(error = %e, "Ingress task failed"),
            }
            true
        }
    };

    stop_ingress.cancel();
    if !server_finished
        && tokio::time::timeout(config.ingress.shutdown_timeout, &mut server)
            .await
            .is_err()
    {
        warn!(
            timeout_secs = config.ingress.shutdown_timeout.as_secs(),
            "In-flight requests did not finish in time"
        );
        server.abort();
    }

    background.cancel();
    stop_background("Uploader", upload_task).await;
    stop_background("Maintenance", maintenance_task).await;

    let flush_buffer = buffer.clone();
    match tokio::task::spawn_blocking(move || flush_buffer.force_flush()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "Could not seal the last segment, it will be recovered on next start"),
        Err(e) => error!(error = %e, "Final seal task failed"),
    }

    let report = uploader.shutdown_flush().await;
    info!(
        rounds = report.rounds,
        uploaded = report.uploaded,
        remaining = report.remaining,
        "Shutdown complete"
    );
    Ok(())
}

fn build_object_store(config: &SpoolConfig) -> Result<Arc<dyn ObjectStore>, BoxError> {
    match config.store_type {
        ObjectStoreType::Memory => {
            warn!("Using the in-memory object store, uploaded data is not kept");
            Ok(Arc::new(InMemoryObjectStore::new()))
        }
        ObjectStoreType::LocalFs => {
            let path = config
                .local_path
                .clone()
                .ok_or("local_path is required for the localfs store")?;
            info!(path = %path.display(), "Using local filesystem object store");
            Ok(Arc::new(LocalFsObjectStore::new(path)))
        }
        #[cfg(feature = "s3")]
        ObjectStoreType::S3 => {
            info!(
                bucket = %config.s3.bucket,
                region = %config.s3.region,
                endpoint = ?config.s3.endpoint,
                "Using S3 object store"
            );
            let store = s3_spool::spool::S3ObjectStore::new(&config.s3)?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        ObjectStoreType::S3 => Err("built without the s3 feature".into()),
    }
}

/// Once a second: fsync under the `everysec` policy and rotate by age
fn spawn_maintenance<F: s3_spool::spool::SegmentFs>(
    buffer: Arc<Buffer<F>>,
    fsync: FsyncPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let buffer = buffer.clone();
            let result = tokio::task::spawn_blocking(move || {
                if fsync == FsyncPolicy::EverySecond {
                    buffer.sync()?;
                }
                buffer.rotate_if_aged()
            })
            .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Buffer maintenance failed"),
                Err(e) => warn!(error = %e, "Buffer maintenance task failed"),
            }
        }
    })
}

/// Wait for a cancelled background task, aborting it if it does not stop
async fn stop_background(name: &'static str, mut task: JoinHandle<()>) {
    match tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task = name, error = %e, "Background task failed"),
        Err(_) => {
            warn!(
                task = name,
                timeout_secs = BACKGROUND_STOP_TIMEOUT.as_secs(),
                "Background task did not stop after cancel, aborting it"
            );
            task.abort();
        }
    }
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
