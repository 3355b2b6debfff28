//! Scan-type specific behaviour.
//!
//! A scan is resolved once per reconcile into a [`ScanStrategy`] holding its
//! targets. Node scans fan out over matching nodes; platform scans have one
//! synthetic target. Both share the same capability set so the reconciler
//! never branches on the scan type itself.

use complyd_model::{
    ConfigMap, EventType, LabelSelector, ObjectKey, Scan, ScanResult, ScanType, labels,
};

use crate::artifact;
use crate::error::{CoreError, Result};
use crate::events::{self, EventRecorder};
use crate::naming;
use crate::store::{self, ObjectStore};
use crate::targets::{self, Target};
use crate::workload::WorkloadManager;

/// Borrowed collaborators a strategy works with.
#[derive(Debug)]
pub struct ScanContext<'a, S, E> {
    pub store: &'a S,
    pub events: &'a E,
    pub workloads: &'a WorkloadManager,
}

impl<S, E> Clone for ScanContext<'_, S, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, E> Copy for ScanContext<'_, S, E> {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Ready,
    /// No target matched; the scan is not applicable.
    NoTargets,
    /// Strict mode and a target cannot be scheduled. `message` is recorded
    /// in the scan's warnings so the event is only emitted once.
    Blocked { target: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    StillRunning,
    /// A target lost its workload; launching again recreates it.
    WorkloadMissing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorReadiness {
    /// Some artifact is not there yet.
    NotReady,
    Ready { warnings: String },
    /// A scanner failed in a way aggregation cannot recover from.
    Failed { warnings: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gathered {
    pub result: ScanResult,
    pub ready: bool,
    pub error: Option<String>,
}

impl Gathered {
    fn not_ready() -> Self {
        Self {
            result: ScanResult::NotAvailable,
            ready: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStrategy {
    scan_type: ScanType,
    targets: Vec<Target>,
}

impl ScanStrategy {
    pub async fn resolve<S: ObjectStore>(store: &S, scan: &Scan) -> Result<Self> {
        let scan_type = scan.spec.scan_type()?;
        let targets = targets::resolve_targets(store, scan, scan_type).await?;
        Ok(Self { scan_type, targets })
    }

    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub async fn validate<S, E>(&self, ctx: ScanContext<'_, S, E>, scan: &Scan) -> Result<Validation>
    where
        S: ObjectStore,
        E: EventRecorder,
    {
        if self.scan_type == ScanType::Platform {
            return Ok(Validation::Ready);
        }

        if self.targets.is_empty() {
            let warning = "No nodes matched the nodeSelector";
            tracing::info!(target: "scan::reconcile", scan = %scan.name(), "{warning}");
            ctx.events
                .record(events::event_for(
                    scan,
                    EventType::Warning,
                    events::REASON_NO_MATCHING_NODES,
                    warning,
                ))
                .await?;
            return Ok(Validation::NoTargets);
        }

        if scan.spec.strict_node_scan()
            && let Some(target) = self.targets.iter().find(|t| t.is_unschedulable())
        {
            let warning = format!(
                "Not continuing scan: Node is unschedulable: {}",
                target.name()
            );
            if scan.status.warnings != warning {
                tracing::info!(target: "scan::reconcile", scan = %scan.name(), node = %target.name(), "{warning}");
                ctx.events
                    .record(events::event_for(
                        scan,
                        EventType::Warning,
                        events::REASON_UNSCHEDULABLE_NODE,
                        warning.clone(),
                    ))
                    .await?;
            }
            return Ok(Validation::Blocked {
                target: target.name().to_string(),
                message: warning,
            });
        }

        Ok(Validation::Ready)
    }

    /// Creates one workload per target. Existing workloads are left alone.
    pub async fn create_workloads<S, E>(&self, ctx: ScanContext<'_, S, E>, scan: &Scan) -> Result<()>
    where
        S: ObjectStore,
        E: EventRecorder,
    {
        for target in &self.targets {
            let workload = ctx.workloads.scan_workload(scan, target);
            ctx.workloads.create(ctx.store, &workload).await?;
        }
        Ok(())
    }

    /// Checks every target's workload. Unschedulable workloads get a
    /// best-effort error artifact and count as finished.
    pub async fn handle_running<S, E>(&self, ctx: ScanContext<'_, S, E>, scan: &Scan) -> Result<RunningState>
    where
        S: ObjectStore,
        E: EventRecorder,
    {
        for target in &self.targets {
            match ctx.workloads.is_running(ctx.store, scan, target).await {
                Ok(None) => {
                    tracing::info!(
                        target: "scan::reconcile",
                        scan = %scan.name(),
                        target_name = %target.name(),
                        "a workload is missing, going back to launching"
                    );
                    return Ok(RunningState::WorkloadMissing);
                }
                Ok(Some(true)) => return Ok(RunningState::StillRunning),
                Ok(Some(false)) => {}
                Err(err @ CoreError::Unschedulable { .. }) => {
                    let name = naming::artifact_name(scan.name(), target.name());
                    let key = ObjectKey::new(scan.namespace(), name.clone());
                    if store::get_opt::<_, ConfigMap>(ctx.store, &key).await?.is_none() {
                        let cm = artifact::unschedulable_artifact(
                            scan,
                            name,
                            target.name(),
                            &err.to_string(),
                        )?;
                        store::create_if_absent(ctx.store, &cm).await?;
                        tracing::warn!(
                            target: "scan::reconcile",
                            scan = %scan.name(),
                            target_name = %target.name(),
                            error = %err,
                            "recorded unschedulable workload"
                        );
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(RunningState::Finished)
    }

    async fn artifact<S: ObjectStore>(store: &S, scan: &Scan, target: &Target) -> Result<Option<ConfigMap>> {
        let key = ObjectKey::new(
            scan.namespace(),
            naming::artifact_name(scan.name(), target.name()),
        );
        Ok(store::get_opt(store, &key).await?)
    }

    /// Decides whether the aggregator should run. Missing artifacts or read
    /// errors mean "not yet"; a hard scanner failure ends the scan.
    pub async fn should_launch_aggregator<S, E>(
        &self,
        ctx: ScanContext<'_, S, E>,
        scan: &Scan,
    ) -> AggregatorReadiness
    where
        S: ObjectStore,
        E: EventRecorder,
    {
        let mut warnings = String::new();
        for target in &self.targets {
            let cm = match Self::artifact(ctx.store, scan, target).await {
                Ok(Some(cm)) => cm,
                Ok(None) => return AggregatorReadiness::NotReady,
                Err(err) => {
                    tracing::debug!(target: "scan::reconcile", scan = %scan.name(), error = %err, "artifact lookup failed");
                    return AggregatorReadiness::NotReady;
                }
            };

            if let Some(warns) = cm.value(labels::KEY_WARNINGS) {
                warnings = warns.to_string();
            }

            if let Err(err) = artifact::check_unknown_error(&cm) {
                return AggregatorReadiness::Failed {
                    warnings,
                    message: err.to_string(),
                };
            }
        }
        AggregatorReadiness::Ready { warnings }
    }

    /// Folds the per-target results the aggregator recorded into one result.
    pub async fn gather_results<S, E>(&self, ctx: ScanContext<'_, S, E>, scan: &Scan) -> Result<Gathered>
    where
        S: ObjectStore,
        E: EventRecorder,
    {
        let strict = self.scan_type == ScanType::Platform || scan.spec.strict_node_scan();
        let mut ready = true;
        let mut non_compliant = false;
        let mut compliant = false;

        for target in &self.targets {
            let Some(cm) = Self::artifact(ctx.store, scan, target).await? else {
                tracing::info!(target: "scan::reconcile", scan = %scan.name(), target_name = %target.name(), "target has no result artifact yet");
                ready = false;
                continue;
            };
            if !artifact::result_ready(&cm) {
                tracing::info!(
                    target: "scan::reconcile",
                    scan = %scan.name(),
                    "scan results not ready, retrying"
                );
                ready = false;
                continue;
            }

            match artifact::recorded_result(&cm) {
                (ScanResult::Error, message) => {
                    if !strict && cm.value(labels::KEY_EXIT_CODE) == Some(labels::EXIT_UNSCHEDULABLE) {
                        let warning = format!(
                            "Skipping result for scan: Node is unschedulable: {}",
                            target.name()
                        );
                        tracing::info!(target: "scan::reconcile", scan = %scan.name(), "{warning}");
                        ctx.events
                            .record(events::event_for(
                                scan,
                                EventType::Warning,
                                events::REASON_UNSCHEDULABLE_NODE,
                                warning,
                            ))
                            .await?;
                        continue;
                    }
                    tracing::info!(
                        target: "scan::reconcile",
                        scan = %scan.name(),
                        target_name = %target.name(),
                        error = message.as_deref().unwrap_or_default(),
                        "target scan error"
                    );
                    return Ok(Gathered {
                        result: ScanResult::Error,
                        ready: true,
                        error: message,
                    });
                }
                (ScanResult::NonCompliant, _) => non_compliant = true,
                (ScanResult::Compliant, _) => compliant = true,
                _ => {}
            }
        }

        if !ready {
            return Ok(Gathered::not_ready());
        }

        let result = if non_compliant {
            ScanResult::NonCompliant
        } else if compliant {
            ScanResult::Compliant
        } else {
            ScanResult::NotApplicable
        };
        Ok(Gathered {
            result,
            ready,
            error: None,
        })
    }

    /// Removes the scan workloads of every target.
    pub async fn cleanup<S, E>(&self, ctx: ScanContext<'_, S, E>, scan: &Scan) -> Result<()>
    where
        S: ObjectStore,
        E: EventRecorder,
    {
        let deleted = ctx.workloads.delete_workloads(ctx.store, scan).await?;
        if deleted > 0 {
            tracing::info!(target: "scan::reconcile", scan = %scan.name(), deleted, "deleted scan workloads");
        }
        Ok(())
    }
}

/// Selector for every result artifact of `scan`.
pub fn artifact_selector(scan: &Scan) -> LabelSelector {
    LabelSelector::from(scan.selector_labels()).with(labels::RESULT_ARTIFACT, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyd_model::{Node, NodeSpec, ObjectMeta, Pod, PodPhase, ScanSpec};

    use crate::config::{ResultServerSettings, WorkloadImages};
    use crate::events::InProcEventBus;
    use crate::store::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        events: InProcEventBus,
        workloads: WorkloadManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryStore::default(),
                events: InProcEventBus::new(16),
                workloads: WorkloadManager::new(
                    WorkloadImages::default(),
                    ResultServerSettings::default(),
                ),
            }
        }

        fn ctx(&self) -> ScanContext<'_, InMemoryStore, InProcEventBus> {
            ScanContext {
                store: &self.store,
                events: &self.events,
                workloads: &self.workloads,
            }
        }

        async fn node(&self, name: &str, unschedulable: bool) {
            let mut metadata = ObjectMeta::named("", name);
            metadata
                .labels
                .insert(labels::NODE_OS_LABEL.into(), labels::NODE_OS_LINUX.into());
            self.store
                .create(&Node {
                    metadata,
                    spec: NodeSpec { unschedulable },
                })
                .await
                .expect("node");
        }

        async fn artifact(&self, scan: &Scan, target: &str, exit_code: &str, result: Option<ScanResult>) {
            let mut cm = artifact::build_artifact(
                scan,
                artifact::ArtifactSpec {
                    name: naming::artifact_name(scan.name(), target),
                    payload_key: labels::KEY_RESULTS,
                    source: target,
                    payload: b"{}",
                    compress: false,
                    exit_code,
                    warnings: "",
                },
            )
            .expect("artifact");
            if let Some(result) = result {
                cm.metadata
                    .annotations
                    .insert(labels::ARTIFACT_RESULT.into(), result.as_str().into());
            }
            self.store.create(&cm).await.expect("create artifact");
        }
    }

    fn node_scan(strict: bool) -> Scan {
        let spec = ScanSpec {
            strict_node_scan: Some(strict),
            ..ScanSpec::default()
        };
        Scan::new("ns", "workers", spec)
    }

    #[tokio::test]
    async fn zero_targets_is_not_applicable() {
        let fx = Fixture::new();
        let mut rx = fx.events.subscribe();
        let scan = node_scan(true);
        let strategy = ScanStrategy::resolve(&fx.store, &scan).await.expect("resolve");
        assert_eq!(
            strategy.validate(fx.ctx(), &scan).await.expect("validate"),
            Validation::NoTargets
        );
        let event = rx.recv().await.expect("event");
        assert_eq!(event.reason, events::REASON_NO_MATCHING_NODES);
    }

    #[tokio::test]
    async fn strict_mode_blocks_on_unschedulable_nodes() {
        let fx = Fixture::new();
        fx.node("a", false).await;
        fx.node("b", true).await;
        let strict = node_scan(true);
        let strategy = ScanStrategy::resolve(&fx.store, &strict).await.expect("resolve");
        let mut rx = fx.events.subscribe();
        let blocked = strategy.validate(fx.ctx(), &strict).await.expect("validate");
        let Validation::Blocked { target, message } = blocked else {
            panic!("expected a blocked scan, got {blocked:?}");
        };
        assert_eq!(target, "b");
        assert_eq!(message, "Not continuing scan: Node is unschedulable: b");
        assert_eq!(
            rx.recv().await.expect("event").reason,
            events::REASON_UNSCHEDULABLE_NODE
        );

        // Already reported in the scan's warnings: still blocked, no new event.
        let mut reported = strict.clone();
        reported.status.warnings = message;
        assert!(matches!(
            strategy.validate(fx.ctx(), &reported).await.expect("validate"),
            Validation::Blocked { .. }
        ));
        assert!(rx.try_recv().is_err());

        let lenient = node_scan(false);
        assert_eq!(
            strategy.validate(fx.ctx(), &lenient).await.expect("validate"),
            Validation::Ready
        );
    }

    #[tokio::test]
    async fn running_gate_waits_for_every_target() {
        let fx = Fixture::new();
        fx.node("a", false).await;
        fx.node("b", false).await;
        let scan = node_scan(true);
        let strategy = ScanStrategy::resolve(&fx.store, &scan).await.expect("resolve");

        assert_eq!(
            strategy.handle_running(fx.ctx(), &scan).await.expect("running"),
            RunningState::WorkloadMissing
        );

        strategy.create_workloads(fx.ctx(), &scan).await.expect("create");
        assert_eq!(
            strategy.handle_running(fx.ctx(), &scan).await.expect("running"),
            RunningState::StillRunning
        );

        for target in strategy.targets() {
            let key = ObjectKey::new("ns", naming::workload_name("workers", target.name()));
            let mut pod: Pod = fx.store.get(&key).await.expect("pod");
            pod.status.phase = PodPhase::Succeeded;
            fx.store.update_status(&pod).await.expect("status");
        }
        assert_eq!(
            strategy.handle_running(fx.ctx(), &scan).await.expect("running"),
            RunningState::Finished
        );
    }

    #[tokio::test]
    async fn aggregator_waits_for_artifacts_and_stops_on_hard_errors() {
        let fx = Fixture::new();
        fx.node("a", false).await;
        fx.node("b", false).await;
        let scan = node_scan(true);
        let strategy = ScanStrategy::resolve(&fx.store, &scan).await.expect("resolve");

        fx.artifact(&scan, "a", "0", None).await;
        assert_eq!(
            strategy.should_launch_aggregator(fx.ctx(), &scan).await,
            AggregatorReadiness::NotReady
        );

        fx.artifact(&scan, "b", "1", None).await;
        match strategy.should_launch_aggregator(fx.ctx(), &scan).await {
            AggregatorReadiness::Failed { message, .. } => {
                assert!(message.contains("missing 'error-msg' despite exitcode 1"));
            }
            other => panic!("unexpected readiness {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_compliance_dominates_and_unschedulable_is_skipped() {
        let fx = Fixture::new();
        fx.node("a", false).await;
        fx.node("b", false).await;
        fx.node("c", false).await;
        let scan = node_scan(false);
        let strategy = ScanStrategy::resolve(&fx.store, &scan).await.expect("resolve");

        fx.artifact(&scan, "a", "2", Some(ScanResult::NonCompliant)).await;
        fx.artifact(&scan, "b", "0", Some(ScanResult::Compliant)).await;
        fx.artifact(&scan, "c", labels::EXIT_UNSCHEDULABLE, Some(ScanResult::Error))
            .await;

        let gathered = strategy.gather_results(fx.ctx(), &scan).await.expect("gather");
        assert_eq!(gathered.result, ScanResult::NonCompliant);
        assert!(gathered.ready);

        let strict = node_scan(true);
        let gathered = strategy.gather_results(fx.ctx(), &strict).await.expect("gather");
        assert_eq!(gathered.result, ScanResult::Error);
    }
}
