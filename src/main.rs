// src/main.rs

//! # Dropmirror Main Entry Point
//!
//! Loads configuration, initializes logging, and runs either the origin
//! (watcher, CRUD interface and replication server) or a peer (replication
//! client applying into a local directory).

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dropmirror::apply::ApplyEngine;
use dropmirror::bus::EventBus;
use dropmirror::client::ReplicationClient;
use dropmirror::config::AppConfig;
use dropmirror::http::{self, CrudState};
use dropmirror::producer::watch::{spawn_watcher, WatchOptions};
use dropmirror::producer::{CrudProducer, RecentMutations};
use dropmirror::server::{ReplicationServer, ServerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr) // Log to stderr
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting default tracing subscriber failed")?;

    tracing::info!("Dropmirror starting with configuration: {:?}", app_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = if app_config.peer {
        run_peer(app_config, shutdown_tx, shutdown_rx).await
    } else {
        if !app_config.root.is_dir() {
            tracing::error!(
                "ORIGIN MODE: Root directory does not exist: {}",
                app_config.root.display()
            );
            std::process::exit(1);
        }
        run_origin(app_config, shutdown_tx, shutdown_rx).await
    };

    if let Err(e) = &result {
        tracing::error!("Dropmirror exited with error: {:#}", e);
    } else {
        tracing::info!("Dropmirror shut down gracefully.");
    }
    result
}

/// Runs the watcher, the replication server and the CRUD interface until Ctrl-C.
async fn run_origin(
    app_config: Arc<AppConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let bus = EventBus::new(app_config.queue_capacity);
    let recent = RecentMutations::new(app_config.suppress_window);

    tracing::info!(
        "ORIGIN MODE: Replicating {}",
        app_config.root.display()
    );
    let watcher_handle = spawn_watcher(
        WatchOptions {
            root: app_config.root.clone(),
            debounce: app_config.debounce,
        },
        bus.clone(),
        recent.clone(),
    )?;

    let server = ReplicationServer::bind(
        &app_config.server_addr,
        bus.clone(),
        ServerOptions {
            write_timeout: app_config.write_timeout,
            heartbeat_interval: app_config.heartbeat_interval,
        },
    )
    .await?;

    let crud_state = CrudState::new(
        &app_config.root,
        CrudProducer::new(bus.clone(), recent.clone()),
    )?;

    let mut tasks = Vec::new();

    let server_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown_rx).await {
            tracing::error!("Replication server exited with error: {}", e);
        }
    }));

    let http_addr = app_config.http_addr.clone();
    let http_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = http::start_server(&http_addr, crud_state, http_shutdown_rx).await {
            tracing::error!("CRUD server exited with error: {}", e);
        }
    }));

    wait_for_ctrl_c().await;

    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to send shutdown signal");
    }
    bus.shutdown();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("A task panicked or exited with error: {}", e);
        }
    }
    let joined = tokio::task::spawn_blocking(move || watcher_handle.join()).await;
    if !matches!(joined, Ok(Ok(()))) {
        tracing::error!("Watcher thread did not exit cleanly");
    }
    Ok(())
}

/// Connects to the origin and applies its events until the stream ends or Ctrl-C.
async fn run_peer(
    app_config: Arc<AppConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    tokio::fs::create_dir_all(&app_config.root)
        .await
        .with_context(|| format!("Cannot create peer root {}", app_config.root.display()))?;
    let engine = ApplyEngine::new(&app_config.root)?;

    tracing::info!(
        "PEER MODE: Mirroring {} into {}",
        app_config.server_addr,
        engine.root().display()
    );
    let client =
        ReplicationClient::connect(&app_config.server_addr, engine, app_config.idle_timeout)
            .await?;

    let client_task = tokio::spawn(client.run(shutdown_rx));
    tokio::pin!(client_task);

    tokio::select! {
        joined = &mut client_task => {
            let stats = joined.context("Replication client task failed")??;
            tracing::info!("Replication client stopped: {:?}", stats);
            return Ok(());
        }
        _ = wait_for_ctrl_c() => {}
    }

    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to send shutdown signal");
    }
    let stats = client_task
        .await
        .context("Replication client task failed")??;
    tracing::info!("Replication client stopped: {:?}", stats);
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Ctrl-C received, initiating shutdown...");
        }
        Err(err) => {
            tracing::error!("Failed to listen for Ctrl-C signal: {}", err);
        }
    }
}
