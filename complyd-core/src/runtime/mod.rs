//! In-process controller runtime.
//!
//! Store changes are mapped back to the scan that owns the changed object
//! and pushed onto a [`WorkQueue`]. A fixed pool of workers drains the queue
//! and calls the reconciler; requeue requests and error backoff go back onto
//! the queue with a delay.

mod executor;
mod queue;

pub use executor::AggregatorExecutor;
pub use queue::WorkQueue;

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use complyd_model::{LabelSelector, Object, ObjectKey, Scan, labels};

use crate::aggregate::ContentParser;
use crate::channel::TrustIssuer;
use crate::error::Result;
use crate::events::EventRecorder;
use crate::reconciler::ScanReconciler;
use crate::store::{ChangeFeed, ObjectStore, StoreChange};

/// Maps a store change to the scan it concerns, if any.
pub fn scan_key_for(change: &StoreChange) -> Option<ObjectKey> {
    if change.kind == Scan::KIND {
        return Some(change.key.clone());
    }
    if let Some(name) = change.labels.get(labels::SCAN_NAME) {
        return Some(ObjectKey::new(change.key.namespace.clone(), name.clone()));
    }
    change
        .owner
        .as_ref()
        .filter(|owner| owner.kind == Scan::KIND)
        .map(|owner| ObjectKey::new(change.key.namespace.clone(), owner.name.clone()))
}

pub struct ControllerRuntime<S, E, I, P> {
    reconciler: Arc<ScanReconciler<S, E, I>>,
    executor: AggregatorExecutor<S, P>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, E, I, P> fmt::Debug for ControllerRuntime<S, E, I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("ControllerRuntime")
            .field("store_type", &type_name::<S>())
            .field("parser_type", &type_name::<P>())
            .field("queued", &self.queue.len())
            .field("handle_count", &handle_count)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<S, E, I, P> ControllerRuntime<S, E, I, P>
where
    S: ObjectStore + ChangeFeed + 'static,
    E: EventRecorder + 'static,
    I: TrustIssuer + 'static,
    P: ContentParser + 'static,
{
    pub fn new(reconciler: ScanReconciler<S, E, I>, parser: Arc<P>) -> Self {
        let shutdown = CancellationToken::new();
        let executor = AggregatorExecutor::new(
            Arc::clone(reconciler.store()),
            parser,
            reconciler.config().retry,
        );
        Self {
            reconciler: Arc::new(reconciler),
            executor,
            queue: Arc::new(WorkQueue::new(shutdown.clone())),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribes to the change feed, enqueues every existing scan and spawns
    /// the workers.
    pub async fn start(&self) -> Result<()> {
        let changes = self.reconciler.store().subscribe_changes();
        let mut handles = self.handles.lock().await;
        handles.push(self.executor.spawn(self.shutdown.clone()));
        handles.push(self.spawn_change_router(changes));

        self.enqueue_all().await?;

        let workers = self.reconciler.config().reconcile.workers.max(1);
        for worker in 0..workers {
            handles.push(self.spawn_worker(worker));
        }
        tracing::info!(target: "scan::runtime", workers, "controller runtime started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(target: "scan::runtime", error = %err, "runtime task ended abnormally");
            }
        }
        tracing::info!(target: "scan::runtime", "controller runtime stopped");
    }

    async fn enqueue_all(&self) -> Result<()> {
        let scans: Vec<Scan> = self
            .reconciler
            .store()
            .list(None, &LabelSelector::new())
            .await?;
        for scan in scans {
            self.queue.add(scan.key());
        }
        Ok(())
    }

    fn spawn_change_router(
        &self,
        mut changes: tokio::sync::broadcast::Receiver<StoreChange>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(self.reconciler.store());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => {
                        if let Some(key) = scan_key_for(&change) {
                            queue.add(key);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "scan::runtime", skipped, "change feed lagged, resyncing scans");
                        match store.list::<Scan>(None, &LabelSelector::new()).await {
                            Ok(scans) => scans.into_iter().for_each(|scan| queue.add(scan.key())),
                            Err(err) => {
                                tracing::error!(target: "scan::runtime", error = %err, "resync failed");
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_worker(&self, worker: usize) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            while let Some(key) = queue.next().await {
                match reconciler.reconcile(&key).await {
                    Ok(action) => {
                        queue.forget(&key);
                        if let Some(delay) = action.requeue_after {
                            queue.add_after(key.clone(), delay);
                        }
                    }
                    Err(err) => {
                        let failures = queue.record_failure(&key);
                        let delay = reconciler.config().reconcile.error_backoff(failures);
                        tracing::warn!(
                            target: "scan::runtime",
                            worker,
                            scan = %key,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "reconcile failed, backing off"
                        );
                        queue.add_after(key.clone(), delay);
                    }
                }
                queue.done(&key);
            }
            tracing::debug!(target: "scan::runtime", worker, "worker stopped");
        })
    }
}
