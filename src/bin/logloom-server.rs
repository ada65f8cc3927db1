//! Process entry point: loads configuration, wires the shared state
//! together, starts the three background tasks and the HTTP server, and
//! shuts all of it down cleanly on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

use logloom::chunk_store::reader::Reader;
use logloom::chunk_store::retention::RetentionSweeper;
use logloom::chunk_store::writer::Writer;
use logloom::config::Config;
use logloom::http::{self, AppState};
use logloom::index::Index;
use logloom::ingest::Pipeline;
use logloom::metrics::RateCounter;
use logloom::tail::TailHub;

fn config_path_from_args() -> Option<PathBuf> {
    std::env::args().nth(1).map(PathBuf::from)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::load(config_path_from_args().as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = std::fs::create_dir_all(&config.storage_path) {
        error!("failed to create storage path {:?}: {}", config.storage_path, err);
        std::process::exit(1);
    }

    let index = Arc::new(Index::new());
    let loaded = index.rebuild_from_disk(std::path::Path::new(&config.storage_path));
    info!("rebuilt index from {} existing chunk(s)", loaded);

    let writer = Arc::new(Writer::new(&config.storage_path));
    let reader = Arc::new(Reader::new(&config.storage_path));
    let tail_hub = Arc::new(TailHub::new());

    let pipeline = Pipeline::new(config.clone(), Arc::clone(&writer), Arc::clone(&index), Arc::clone(&tail_hub));
    pipeline.start();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let sweeper = Arc::new(RetentionSweeper::new(
        &config.storage_path,
        config.retention_horizon(),
        Arc::clone(&index),
    ));
    let sweeper_task = tokio::spawn(
        Arc::clone(&sweeper).run(config.retention_sweep_interval(), shutdown_tx.subscribe()),
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        index,
        reader,
        writer,
        pipeline: Arc::clone(&pipeline),
        tail_hub,
        rate_counter: RateCounter::new(),
        started_at: Instant::now(),
    });

    let server_shutdown_rx = shutdown_tx.subscribe();
    let server_task = tokio::spawn(http::serve(state, server_shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(());
    pipeline.stop().await;

    if let Err(err) = sweeper_task.await {
        error!("retention sweeper task panicked: {}", err);
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("http server exited with error: {}", err),
        Err(err) => error!("http server task panicked: {}", err),
    }

    info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to install SIGTERM handler: {}", err);
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
