use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use searchbridge::config::AppConfig;
use searchbridge::db::{MetadataDb, PostgresMetadataDb};
use searchbridge::jobs::{JobBroker, JobContext, RedisBroker, Worker, DEFAULT_QUEUE};
use searchbridge::scraper::{FirecrawlScraper, Scraper};
use searchbridge::server;
use searchbridge::services::ServicePool;
use searchbridge::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("SEARCHBRIDGE_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("searchbridge").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".searchbridge/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // Daily rotated file log beside stdout.
    let file_appender = tracing_appender::rolling::daily(&log_dir, "searchbridge.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL").map(|level| {
                tracing_subscriber::EnvFilter::new(format!("searchbridge={},tower_http=info", level))
            })
        })
        .unwrap_or_else(|_| "searchbridge=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before aborting.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "searchbridge::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        qdrant_collection = %config.qdrant_collection,
        vector_dim = config.vector_dim,
        enable_worker = config.enable_worker,
        bm25_index_path = %config.bm25_index_path,
        "searchbridge starting"
    );

    // Shared collaborators. The pool is the expensive part (tokenizer
    // load); everything else is connection setup.
    let services = ServicePool::global(&config).await?;

    let broker: Arc<dyn JobBroker> = Arc::new(RedisBroker::new(&config.redis_url, DEFAULT_QUEUE)?);
    let db = Arc::new(PostgresMetadataDb::connect(&config.database_url).await?);
    db.ensure_schema().await?;
    let db: Arc<dyn MetadataDb> = db;
    let scraper: Arc<dyn Scraper> = Arc::new(FirecrawlScraper::new(
        &config.firecrawl_url,
        config.firecrawl_api_key.clone(),
    ));

    if let Err(e) = services.vector.ensure_collection().await {
        // Search recovers via ensure-collection on first use; ingestion
        // will surface the error per document.
        warn!("could not provision vector collection at startup: {}", e);
    }

    // Worker shutdown is a watch channel: workers never install signal
    // handlers of their own.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_handle = if config.enable_worker {
        let ctx = JobContext {
            services: services.clone(),
            db: db.clone(),
            scraper: scraper.clone(),
            broker: broker.clone(),
        };
        let worker = Worker::new(broker.clone(), ctx, shutdown_rx);
        info!("in-process worker enabled");
        Some(tokio::spawn(worker.run()))
    } else {
        None
    };

    let state = AppState::new(config, services.clone(), broker, db, scraper);
    let app = server::create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("searchbridge listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the worker, then release shared resources.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        let _ = handle.await;
    }
    services.close();

    info!("searchbridge shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
