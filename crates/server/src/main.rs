use meshflow::api;
use meshflow::config::{self, LedgerKind};
use meshflow::convert::{ConverterOptions, GuardedConverter, HeightmapConverter};
use meshflow::db;
use meshflow::jobs::{
    ConversionPipeline, DynLedger, JobResolver, JobsRepo, MemoryLedger, MetricsRepo,
    StaleJobWatchdog, TaskScheduler,
};
use meshflow::storage::BlobStore;
use meshflow::telemetry;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RESUME_BATCH: i64 = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init_tracing();

    tracing::info!(
        bind = %cfg.bind_addr,
        ledger = ?cfg.ledger,
        storage = ?cfg.storage,
        conversion_timeout_ms = cfg.conversion_timeout.as_millis() as u64,
        max_concurrent_conversions = cfg.max_concurrent_conversions,
        stale_after_secs = cfg.stale_after.as_secs(),
        watchdog = cfg.watchdog_interval.is_some(),
        migrate_on_startup = cfg.migrate_on_startup,
        "meshflow starting"
    );

    // ---- Ledger ----
    let ledger: DynLedger = match cfg.ledger {
        LedgerKind::Postgres => {
            let url = cfg
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            Arc::new(JobsRepo::new(pool))
        }
        LedgerKind::Memory => {
            tracing::warn!("using the in-memory ledger; jobs are lost on restart");
            Arc::new(MemoryLedger::new())
        }
    };

    let blobs = BlobStore::open(&cfg.storage, &cfg.storage_dir).await?;
    if let Some(base) = blobs.local_base_path() {
        tracing::info!(dir = %base.display(), "blob store ready");
    }

    let converter = GuardedConverter::new(
        Arc::new(HeightmapConverter::new(cfg.grid_resolution)),
        ConverterOptions::new()
            .max_concurrency(cfg.max_concurrent_conversions)
            .timeout(cfg.conversion_timeout),
    );
    let scheduler = TaskScheduler::new();
    let pipeline =
        ConversionPipeline::new(ledger.clone(), blobs.clone(), converter, scheduler.clone());

    // jobs queued behind the converter when the last process stopped
    match pipeline.resume_pending(Duration::ZERO, RESUME_BATCH).await {
        Ok(n) if n > 0 => tracing::info!(resumed = n, "picked up pending jobs from a previous run"),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "could not list pending jobs"),
    }

    let shutdown = CancellationToken::new();

    // ---- Watchdog task ----
    let watchdog_handle = cfg.watchdog_interval.map(|interval| {
        let watchdog = StaleJobWatchdog::new(ledger.clone(), scheduler.clone(), cfg.stale_after)
            .with_resume(pipeline.clone());
        tokio::spawn(watchdog.run(interval, shutdown.clone()))
    });

    // ---- API ----
    let api_state = api::ApiState {
        pipeline: pipeline.clone(),
        resolver: JobResolver::new(ledger.clone(), blobs),
        metrics: MetricsRepo::new(ledger, cfg.stale_after),
        public_base_url: cfg.public_base_url.clone().into(),
    };
    let app = api::router(api_state, cfg.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "api listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal.cancel();
        })
        .await?;

    // ---- Drain ----
    shutdown.cancel();
    pipeline.converter().close();
    let in_flight = scheduler.in_flight_count();
    if !scheduler.drain(cfg.shutdown_drain).await {
        tracing::warn!(
            in_flight = scheduler.in_flight_count(),
            "drain timed out; unfinished jobs stay processing until the watchdog reaps them"
        );
    } else if in_flight > 0 {
        tracing::info!(in_flight, "in-flight conversions finished");
    }

    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }

    tracing::info!("meshflow stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
