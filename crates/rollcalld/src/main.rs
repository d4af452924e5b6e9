use anyhow::{Context, Result};
use rollcall_core::{DescriptorExtractor, LinearMatcher, MatchPolicy, ScreenedExtractor};
use rollcall_store::{SqliteStore, Store, TaskJournal};
use rollcalld::{
    api, queue::spawn_sweeper, remote::RemoteExtractor, AppState, Config, ObserverRegistry,
    Recognizer, RetryPolicy, TaskQueue, WorkerPool,
};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        bind = %config.bind_addr,
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        workers = config.workers,
        extractor = %config.extractor_url,
        cors = ?config.cors_origins,
        "rollcalld starting"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let sqlite = SqliteStore::open(&config.db_path).await?;
    let store: Arc<dyn Store> = Arc::new(sqlite.clone());

    let policy = MatchPolicy::new(config.match_threshold)
        .context("match threshold must be a positive number")?;
    let registry = Arc::new(ObserverRegistry::new(config.observer_buffer));
    let runtime = Handle::current();

    let recognizer = Arc::new(Recognizer::new(
        Arc::clone(&store),
        Arc::new(LinearMatcher),
        policy,
        Arc::clone(&registry),
        runtime.clone(),
    ));

    let make_extractor = |_index: usize| {
        RemoteExtractor::new(&config.extractor_url, config.extractor_timeout, runtime.clone())
            .map(|remote| ScreenedExtractor::new(remote, config.dark_frame_pct))
    };

    let journal: Arc<dyn TaskJournal> = Arc::new(sqlite.clone());
    let (queue, jobs) = TaskQueue::new(journal);
    let pool = WorkerPool::spawn(
        config.workers,
        jobs,
        queue.table().clone(),
        recognizer,
        RetryPolicy {
            max_attempts: config.max_attempts,
            backoff: config.retry_backoff,
        },
        &make_extractor,
    )?;
    let enroller: Box<dyn DescriptorExtractor> = Box::new(make_extractor(config.workers)?);
    queue
        .resume()
        .await
        .context("replaying unsettled tasks")?;
    let sweeper = spawn_sweeper(queue.table().clone(), config.result_ttl);

    let state = AppState {
        queue: queue.clone(),
        store,
        registry: Arc::clone(&registry),
        enroller: Arc::new(Mutex::new(enroller)),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "rollcalld ready");

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, api::router(state, api::cors_layer(&config.cors_origins)))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            // Upgraded sockets are not tracked by the server; end them here.
            shutdown_registry.shutdown();
        })
        .await?;

    tracing::info!("rollcalld shutting down");
    queue.close();
    sweeper.abort();
    tokio::task::spawn_blocking(move || pool.join()).await?;
    registry.shutdown();
    sqlite.close().await?;

    Ok(())
}
