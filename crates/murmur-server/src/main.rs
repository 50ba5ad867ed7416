mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use murmur_api::AppStateInner;
use murmur_core::Pipeline;
use murmur_core::cache::{MemoryRoomCache, run_purge_loop};
use murmur_core::clock::SystemClock;
use murmur_core::provider::GeminiProvider;
use murmur_core::queue::job_queue;
use murmur_core::worker::{CompletionWorker, WorkerPool, recover_pending};
use murmur_db::Database;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "murmur=debug,murmur_core=debug,murmur_api=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    let clock = Arc::new(SystemClock);
    let cache = Arc::new(MemoryRoomCache::new(clock.clone()));
    let (queue, rx) = job_queue();

    let pipeline = Pipeline::new(db, clock, cache.clone(), queue.clone(), config.pipeline.clone());

    if config.gemini.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; every reply will be an assistant error");
    }
    let provider = Arc::new(GeminiProvider::new(config.gemini)?);

    // Pick up prompts left unanswered by the previous run before taking traffic
    let recovered = recover_pending(pipeline.store(), &queue).await?;
    if recovered > 0 {
        info!("Re-queued {} unanswered messages", recovered);
    }

    let worker = Arc::new(CompletionWorker::new(
        pipeline.store().clone(),
        provider,
        config.workers.retry,
    ));
    let pool = WorkerPool::spawn(worker, rx, config.workers.workers);

    tokio::spawn(run_purge_loop(cache, Duration::from_secs(60)));

    let state = Arc::new(AppStateInner {
        pipeline,
        jwt_secret: config.jwt_secret,
        billing_secret: config.billing_secret,
    });

    let app = murmur_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Murmur listening on {}", addr);
    info!(
        "Daily limit {} for basic, {} completion workers",
        config.pipeline.basic_daily_limit, config.workers.workers
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let abandoned = pool.shutdown().await;
    if abandoned > 0 {
        info!("{} queued replies will be recovered on next start", abandoned);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
