use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use debridfs::api::{ApiState, create_router};
use debridfs::cache::{CacheOptions, ChunkCache};
use debridfs::chunk::ChunkStore;
use debridfs::cli::{Cli, Commands};
use debridfs::config::load_config;
use debridfs::merged::MergedView;
use debridfs::namespace::VirtualNamespace;
use debridfs::persist::ContainerStore;
use debridfs::persist::watcher::spawn_descriptor_watcher;
use debridfs::provider::RemoteProvider;
use debridfs::provider::debrid::DebridClient;
use debridfs::reconcile::Reconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Start { config } => {
            let path = config.to_str().context("config path is not valid UTF-8")?;
            run(path).await
        }
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let cfg = Arc::new(load_config(config_path)?);
    let Some(token) = cfg.provider_api_token.clone() else {
        bail!("provider_api_token is not set in {config_path}");
    };
    tokio::fs::create_dir_all(&cfg.local_dir)
        .await
        .context("creating local overlay directory")?;

    let provider: Arc<dyn RemoteProvider> = Arc::new(DebridClient::new(
        &cfg.provider_api_base,
        token,
        Duration::from_secs(cfg.request_timeout_seconds),
    )?);

    let chunk_store = Arc::new(ChunkStore::new(&cfg.cache_dir));
    let report = chunk_store.scan().await?;
    info!(
        files = report.file_count,
        chunks = report.chunk_count,
        bytes = report.total_bytes,
        "chunk store scanned"
    );
    let cache = Arc::new(ChunkCache::new(
        chunk_store,
        provider.clone(),
        CacheOptions::from_config(&cfg),
    ));

    let store = Arc::new(ContainerStore::open(&cfg.data_dir).await?);
    store.load().await?;

    let namespace = Arc::new(VirtualNamespace::new());
    let reconciler = Reconciler::new(
        provider.clone(),
        store.clone(),
        namespace.clone(),
        cfg.clone(),
    );
    reconciler.seed_namespace();

    let view = Arc::new(MergedView::new(
        &cfg.local_dir,
        namespace.clone(),
        cache.clone(),
        reconciler.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut tasks = reconciler.spawn_loops(&cancel);
    tasks.push(spawn_descriptor_watcher(
        store.clone(),
        namespace,
        cancel.clone(),
    )?);

    let state = Arc::new(ApiState {
        provider,
        store,
        reconciler,
        cache,
        view,
        config: cfg.clone(),
    });
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down background loops");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
