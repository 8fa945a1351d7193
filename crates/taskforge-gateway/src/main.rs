use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use taskforge_chats::ChatStore;
use taskforge_core::{db, ForgeConfig};
use taskforge_events::EventBus;
use taskforge_secrets::{MasterCipher, SecretsVault};
use taskforge_tasks::TaskStore;
use taskforge_gateway::app;
use taskforge_worker::agent::CliAgentRunner;
use taskforge_worker::{Dispatcher, Worker};

/// Task execution service: HTTP facade plus embedded worker loop.
#[derive(Parser)]
#[command(name = "taskforge-gateway", version)]
struct Args {
    /// Path to a TOML config file (env vars still override).
    #[arg(long)]
    config: Option<String>,

    /// Run only the worker poll loop, without binding the HTTP socket.
    #[arg(long)]
    worker_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskforge=info,taskforge_gateway=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    // Missing required configuration (database, master key) is fatal and
    // exits non-zero before anything binds or polls.
    let config = ForgeConfig::load(args.config.as_deref())?;
    let db_path = config.database.sqlite_path().to_string();

    let cipher = MasterCipher::from_base64_key(&config.secrets.master_key)?;
    let tasks = Arc::new(TaskStore::new(db::open(&db_path)?)?);
    let chats = Arc::new(ChatStore::new(db::open(&db_path)?)?);
    let bus = Arc::new(EventBus::new(db::open(&db_path)?)?);
    let vault = Arc::new(SecretsVault::new(db::open(&db_path)?, cipher)?);
    // Identity and rate-limit tables are part of the shared schema even
    // though nothing routes to them here; platform scripts read them.
    taskforge_identities::db::init_db(&db::open(&db_path)?)?;
    info!(database = %db_path, "database initialized");

    let runner = Arc::new(CliAgentRunner::new(config.agent.command.clone()));
    let dispatcher = Dispatcher {
        vault,
        chats: chats.clone(),
        bus: bus.clone(),
        runner,
        model: config.agent.model.clone(),
        script_timeout: Duration::from_secs(config.worker.script_timeout_secs),
        database_url: config.database.url.clone(),
    };
    let worker = Worker::new(
        config.worker.worker_id.clone(),
        Duration::from_secs(config.worker.poll_interval_secs),
        config.worker.workspace.clone(),
        tasks.clone(),
        dispatcher,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx)?;

    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    if args.worker_only {
        worker_handle.await?;
        return Ok(());
    }

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState {
        config,
        tasks,
        chats,
        bus,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("taskforge gateway listening on {addr}");

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await?;

    // Let the in-flight task settle before exiting 0.
    worker_handle.await?;
    Ok(())
}

/// Translate SIGINT/SIGTERM into a shutdown broadcast.
fn spawn_signal_handler(tx: watch::Sender<bool>) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    Ok(())
}
