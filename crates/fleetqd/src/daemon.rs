//! Daemon mode: open the store, reconcile, and run the scheduler loop.
//!
//! In this mode the process:
//! 1. Opens the redb state store under the data directory
//! 2. Rebuilds scheduler state, recomputing cluster counters
//! 3. Runs scheduling passes on every tick and on every trigger
//! 4. Logs scheduler events until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use fleetq_scheduler::{SchedulerConfig, SchedulerEvent};

pub async fn run(data_dir: PathBuf, config: SchedulerConfig) -> anyhow::Result<()> {
    info!("fleetq daemon starting");

    let scheduler = Arc::new(crate::open_scheduler(&data_dir, config)?);
    info!(
        tick_interval_secs = scheduler.config().tick_interval_secs,
        max_concurrent_per_cluster = scheduler.config().max_concurrent_per_cluster,
        preemption = scheduler.config().preemption_enabled,
        "scheduler initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let events = scheduler.subscribe();
    let events_handle = tokio::spawn(log_events(events, shutdown_rx.clone()));
    let scheduler_handle = scheduler.start(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = events_handle.await;

    info!("fleetq daemon stopped");
    Ok(())
}

/// Forward scheduler events to the log as JSON.
async fn log_events(
    mut events: broadcast::Receiver<SchedulerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "fleetqd::events", event = %json, "scheduler event"),
                    Err(e) => warn!(error = %e, "unserializable scheduler event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
