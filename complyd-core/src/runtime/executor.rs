use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use complyd_model::{LabelSelector, Object, ObjectKey, Pod, PodPhase, Scan, labels};

use crate::aggregate::{Aggregator, ContentParser};
use crate::config::RetryConfig;
use crate::error::{CoreError, Result};
use crate::retry::retry_store;
use crate::store::{self, ChangeFeed, ChangeType, ObjectStore};

/// Runs aggregator workloads inside the controller process.
///
/// Pending aggregator pods are picked up from the change feed, executed once
/// and moved to `Succeeded` or `Failed`. The reconciler observes the phase
/// change like it would for any other workload.
pub struct AggregatorExecutor<S, P> {
    store: Arc<S>,
    parser: Arc<P>,
    retry: RetryConfig,
    in_flight: Arc<DashSet<ObjectKey>>,
}

impl<S, P> fmt::Debug for AggregatorExecutor<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorExecutor")
            .field("store", &type_name::<S>())
            .field("parser", &type_name::<P>())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl<S, P> Clone for AggregatorExecutor<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            parser: Arc::clone(&self.parser),
            retry: self.retry,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S, P> AggregatorExecutor<S, P>
where
    S: ObjectStore + ChangeFeed + 'static,
    P: ContentParser + 'static,
{
    pub fn new(store: Arc<S>, parser: Arc<P>, retry: RetryConfig) -> Self {
        Self {
            store,
            parser,
            retry,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Subscribes to pod changes and runs every pending aggregator it sees
    /// until `shutdown` fires. Runs still in flight are awaited before the
    /// returned task completes.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let executor = self.clone();
        let mut changes = self.store.subscribe_changes();
        tokio::spawn(async move {
            let mut runs = JoinSet::new();
            match executor.recover_interrupted().await {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::warn!(target: "scan::aggregate", recovered, "requeued interrupted aggregator runs");
                }
                Err(err) => {
                    tracing::error!(target: "scan::aggregate", error = %err, "cannot recover interrupted aggregator runs");
                }
            }
            executor.run_pending(&mut runs).await;
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };
                while runs.try_join_next().is_some() {}
                match change {
                    Ok(change)
                        if change.kind == Pod::KIND
                            && change.change != ChangeType::Deleted
                            && change.labels.get(labels::WORKLOAD).map(String::as_str)
                                == Some(labels::WORKLOAD_AGGREGATOR) =>
                    {
                        executor.dispatch(&mut runs, change.key);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "scan::aggregate", skipped, "aggregator feed lagged, rescanning pods");
                        executor.run_pending(&mut runs).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            if !runs.is_empty() {
                tracing::info!(target: "scan::aggregate", in_flight = runs.len(), "waiting for aggregator runs to finish");
            }
            while runs.join_next().await.is_some() {}
            tracing::debug!(target: "scan::aggregate", "aggregator executor stopped");
        })
    }

    async fn aggregator_pods(&self) -> Result<Vec<Pod>> {
        let selector =
            LabelSelector::new().with(labels::WORKLOAD, labels::WORKLOAD_AGGREGATOR);
        Ok(self.store.list::<Pod>(None, &selector).await?)
    }

    /// Moves aggregator pods left `Running` by an earlier process back to
    /// `Pending` so they run again. Processed artifacts are skipped on the
    /// second run. Returns how many pods were reset.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for pod in self.aggregator_pods().await? {
            if pod.status.phase != PodPhase::Running || self.in_flight.contains(&pod.key()) {
                continue;
            }
            tracing::warn!(target: "scan::aggregate", pod = %pod.key(), "aggregator run was interrupted, running it again");
            self.set_phase(pod, PodPhase::Pending, String::new()).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn run_pending(&self, runs: &mut JoinSet<()>) {
        match self.aggregator_pods().await {
            Ok(pods) => {
                for pod in pods {
                    if pod.status.phase == PodPhase::Pending {
                        self.dispatch(runs, pod.key());
                    }
                }
            }
            Err(err) => {
                tracing::error!(target: "scan::aggregate", error = %err, "cannot list aggregator pods");
            }
        }
    }

    fn dispatch(&self, runs: &mut JoinSet<()>, key: ObjectKey) {
        if !self.in_flight.insert(key.clone()) {
            return;
        }
        let executor = self.clone();
        runs.spawn(async move {
            if let Err(err) = executor.execute(&key).await {
                tracing::error!(target: "scan::aggregate", pod = %key, error = %err, "aggregator run failed");
            }
            executor.in_flight.remove(&key);
        });
    }

    /// Runs the aggregator described by the pod at `key` if it is still pending.
    pub async fn execute(&self, key: &ObjectKey) -> Result<()> {
        let store = self.store.as_ref();
        let Some(pod) = store::get_opt::<_, Pod>(store, key).await? else {
            return Ok(());
        };
        if pod.status.phase != PodPhase::Pending {
            return Ok(());
        }
        let pod = self.set_phase(pod, PodPhase::Running, String::new()).await?;

        let outcome = self.aggregate(&pod).await;
        let (phase, message) = match &outcome {
            Ok(()) => (PodPhase::Succeeded, String::new()),
            Err(err) => (PodPhase::Failed, err.to_string()),
        };
        self.set_phase(pod, phase, message).await?;
        outcome
    }

    async fn aggregate(&self, pod: &Pod) -> Result<()> {
        let scan_name = pod
            .metadata
            .labels
            .get(labels::SCAN_NAME)
            .ok_or_else(|| {
                CoreError::non_retriable(format!(
                    "aggregator pod {} is missing the {} label",
                    pod.key(),
                    labels::SCAN_NAME
                ))
            })?;
        let scan_key = ObjectKey::new(pod.metadata.namespace.clone(), scan_name.clone());
        let scan: Scan = self.store.get(&scan_key).await?;

        Aggregator::new(self.store.as_ref(), self.parser.as_ref(), &self.retry)
            .run(&scan)
            .await
            .map(|_| ())
    }

    async fn set_phase(&self, pod: Pod, phase: PodPhase, message: String) -> Result<Pod> {
        let store = self.store.as_ref();
        let key = pod.key();
        let updated = retry_store(&self.retry, || {
            let key = key.clone();
            let message = message.clone();
            async move {
                let mut latest: Pod = store.get(&key).await?;
                latest.status.phase = phase;
                latest.status.message = message;
                store.update_status(&latest).await
            }
        })
        .await?;
        Ok(updated)
    }
}
