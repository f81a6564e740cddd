//! `serve` — assemble subsystems and run until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use modelgate_bench::HttpModel;
use modelgate_core::ControllerConfig;
use modelgate_monitor::{from_config, VersionMonitor};
use modelgate_rollout::Controller;
use modelgate_state::StateStore;

const EVENT_BUFFER: usize = 256;

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("modelgate.redb")
}

pub async fn run_serve(config: ControllerConfig) -> anyhow::Result<()> {
    info!(slots = config.slots.len(), "modelgate daemon starting");
    let section = &config.controller;

    std::fs::create_dir_all(&section.data_dir)
        .with_context(|| format!("creating {}", section.data_dir.display()))?;
    let path = db_path(&section.data_dir);
    let state = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");

    let source = from_config(&config.feed);
    info!(feed = ?config.feed, "version feed configured");

    // ── Controller ─────────────────────────────────────────────

    let mut builder = Controller::builder(state.clone(), Arc::clone(&source))
        .corpus_dir(section.corpus_dir.clone());
    for slot in &config.slots {
        let Some(endpoint) = &slot.model_endpoint else {
            bail!("slot {} has no model_endpoint to benchmark against", slot.slot_id);
        };
        let model = HttpModel::new(endpoint).with_timeout(slot.benchmark.timeout());
        builder = builder.slot(slot.clone(), Arc::new(model));
        info!(slot = %slot.slot_id, endpoint = %endpoint, "slot registered");
    }
    let controller = builder.build();
    controller.start().await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

    // ── Background loops ───────────────────────────────────────

    let monitor = VersionMonitor::new(state, source, controller.slot_ids()).with_events(events_tx);
    let poll_interval = section.poll_interval();
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move {
        monitor.run(poll_interval, monitor_shutdown).await;
    });

    let loop_controller = controller.clone();
    let tick_interval = section.tick_interval();
    // Queued and incomplete candidates are retried on the poll cadence.
    let retry_interval = section.poll_interval();
    let controller_shutdown = shutdown_rx.clone();
    let controller_handle = tokio::spawn(async move {
        loop_controller
            .run(events_rx, tick_interval, retry_interval, controller_shutdown)
            .await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = modelgate_api::build_router(controller.clone());
    let listener = tokio::net::TcpListener::bind(&section.listen)
        .await
        .with_context(|| format!("binding {}", section.listen))?;
    info!(addr = %section.listen, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = monitor_handle.await;
    let _ = controller_handle.await;
    for slot_id in controller.slot_ids() {
        controller.settle(&slot_id).await;
    }

    info!("modelgate daemon stopped");
    Ok(())
}
