use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use complyd_core::{
    InMemoryStore, ScanReconciler, aggregate::JsonResultParser, config::ControllerConfig,
    events::InProcEventBus, runtime::ControllerRuntime,
};
use complyd_model::Event;

/// Runs the scan controller against a fresh in-memory store until `shutdown`
/// fires.
pub async fn run(config: ControllerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    run_with_store(Arc::new(InMemoryStore::default()), config, shutdown).await
}

pub async fn run_with_store(
    store: Arc<InMemoryStore>,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let events = Arc::new(InProcEventBus::new(config.events.channel_capacity));
    let event_log = tokio::spawn(log_events(events.subscribe(), shutdown.clone()));

    let namespace = config.namespace.clone();
    let workers = config.reconcile.workers;
    let reconciler = ScanReconciler::new(store, events, config);
    let runtime = ControllerRuntime::new(reconciler, Arc::new(JsonResultParser));
    runtime
        .start()
        .await
        .context("failed to start the scan controller")?;
    info!(target: "controller", %namespace, workers, "controller running");

    shutdown.cancelled().await;
    info!(target: "controller", "controller stopping");
    runtime.shutdown().await;
    if let Err(err) = event_log.await {
        warn!(target: "controller", error = %err, "event logger ended abnormally");
    }
    info!(target: "controller", "controller exited gracefully");
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<Event>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => info!(
                target: "controller::events",
                kind = ?event.event_type,
                reason = %event.reason,
                object = ?event.involved_object.as_ref().map(|obj| obj.name.as_str()),
                "{}",
                event.message
            ),
            Err(RecvError::Lagged(skipped)) => {
                debug!(target: "controller::events", skipped, "event log fell behind");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
