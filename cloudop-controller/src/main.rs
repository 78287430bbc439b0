use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloudop_api::rest::{AppState, create_router};
use cloudop_api::{MemoryStore, ObjectStore, RedbStore};
use cloudop_controller::config::parse_concurrency;
use cloudop_controller::{
    BackoffArgs, Controller, ControllerConfig, ProviderArgs, Reconciler, Registry, Shutdown,
};

#[derive(Parser)]
#[command(name = "cloudop-controller")]
#[command(about = "cloudop controller - reconciles cloud resources against the object store")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, default_value = "[::]:8080")]
    listen: String,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "/var/lib/cloudop")]
    data_dir: PathBuf,

    /// Run in development mode (ephemeral in-memory store)
    #[arg(long)]
    dev: bool,

    /// Seconds between full re-lists of the store
    #[arg(long, default_value = "60")]
    resync: u64,

    /// Seconds before revisiting an object that is still converging
    #[arg(long, default_value = "10")]
    requeue: u64,

    /// Per-kind concurrency ceiling (format: KIND=N, can be repeated)
    #[arg(long = "max-concurrent", value_parser = parse_concurrency)]
    max_concurrent: Vec<(String, usize)>,

    #[command(flatten)]
    backoff: BackoffArgs,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cloudop_controller=info".parse()?)
                .add_directive("cloudop_api=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let store: Arc<dyn ObjectStore> = if args.dev {
        warn!("Development mode: objects are kept in memory only");
        Arc::new(MemoryStore::new())
    } else {
        tokio::fs::create_dir_all(&args.data_dir)
            .await
            .with_context(|| format!("creating {}", args.data_dir.display()))?;
        let path = args.data_dir.join("objects.redb");
        Arc::new(RedbStore::open(&path).with_context(|| format!("opening {}", path.display()))?)
    };

    let provider = args.provider.build()?;
    let config = ControllerConfig {
        resync_interval: Duration::from_secs(args.resync.max(1)),
        requeue_interval: Duration::from_secs(args.requeue.max(1)),
        error_backoff: args.backoff.policy()?,
        concurrency: args.max_concurrent.into_iter().collect(),
    };

    let registry = Arc::new(Registry::standard());
    let reconciler = Arc::new(Reconciler::new(store.clone(), registry, provider));
    let controller = Controller::new(reconciler, config);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("REST API listening on {}", args.listen);

    let (shutdown_tx, shutdown) = Shutdown::channel();
    let mut rest_shutdown = shutdown.clone();

    let router = create_router(Arc::new(AppState { store }));
    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { rest_shutdown.triggered().await })
            .await
    });
    let controller_handle = tokio::spawn(controller.run(shutdown));

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = controller_handle.await {
        warn!("Controller task ended abnormally: {}", e);
    }
    match rest_handle.await {
        Ok(Err(e)) => warn!("REST server error: {}", e),
        Err(e) => warn!("REST task ended abnormally: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
