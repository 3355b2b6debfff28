//! Phase state machine driving a scan from `PENDING` to `DONE`.
//!
//! Every call re-reads the scan and works on a copy. Nothing blocks: any
//! "not ready yet" condition returns a [`ReconcileAction`] asking to be
//! called again later. Status is only written when it actually changed, so
//! the change feed does not re-trigger reconciles for no-op passes.

use std::sync::Arc;
use std::time::Duration;

use complyd_model::{
    ComplianceCheck, ComplianceRemediation, ConfigMap, EventType, LabelSelector, Object,
    ObjectKey, Pod, Scan, ScanPhase, ScanResult, ScanType, labels,
};

use crate::channel::{RcgenIssuer, ResultChannel, TrustIssuer};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::events::{self, EventRecorder};
use crate::storage;
use crate::store::{self, ObjectStore};
use crate::strategy::{
    self, AggregatorReadiness, RunningState, ScanContext, ScanStrategy, Validation,
};
use crate::workload::{WorkloadManager, WorkloadState, workload_state};

/// What the runtime should do after a reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileAction {
    pub requeue_after: Option<Duration>,
}

impl ReconcileAction {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

pub struct ScanReconciler<S, E, I = RcgenIssuer> {
    store: Arc<S>,
    events: Arc<E>,
    workloads: WorkloadManager,
    channel: ResultChannel<I>,
    config: ControllerConfig,
}

impl<S, E, I> std::fmt::Debug for ScanReconciler<S, E, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanReconciler")
            .field("store", &std::any::type_name::<S>())
            .field("events", &std::any::type_name::<E>())
            .field("issuer", &std::any::type_name::<I>())
            .field("namespace", &self.config.namespace)
            .finish()
    }
}

impl<S, E> ScanReconciler<S, E, RcgenIssuer>
where
    S: ObjectStore,
    E: EventRecorder,
{
    pub fn new(store: Arc<S>, events: Arc<E>, config: ControllerConfig) -> Self {
        Self::with_issuer(store, events, RcgenIssuer, config)
    }
}

impl<S, E, I> ScanReconciler<S, E, I>
where
    S: ObjectStore,
    E: EventRecorder,
    I: TrustIssuer,
{
    pub fn with_issuer(store: Arc<S>, events: Arc<E>, issuer: I, config: ControllerConfig) -> Self {
        let workloads = WorkloadManager::new(config.images.clone(), config.result_server.clone());
        let channel = ResultChannel::new(issuer, config.result_server.clone(), &config.images);
        Self {
            store,
            events,
            workloads,
            channel,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn ctx(&self) -> ScanContext<'_, S, E> {
        ScanContext {
            store: self.store.as_ref(),
            events: self.events.as_ref(),
            workloads: &self.workloads,
        }
    }

    fn requeue(&self) -> ReconcileAction {
        ReconcileAction::requeue(self.config.reconcile.requeue_after())
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let Some(mut scan) = store::get_opt::<_, Scan>(self.store.as_ref(), key).await? else {
            tracing::debug!(target: "scan::reconcile", scan = %key, "scan is gone");
            return Ok(ReconcileAction::done());
        };

        if scan.metadata.is_being_deleted() {
            return self.delete_scan(scan).await;
        }

        if !scan.metadata.has_finalizer(labels::SCAN_FINALIZER) {
            scan.metadata.add_finalizer(labels::SCAN_FINALIZER);
            scan = self.store.update(&scan).await?;
        }

        let original = scan.clone();
        let mut copy = scan;

        if let Some(message) = Self::validate_spec(&copy) {
            if copy.status.phase != ScanPhase::Done || copy.status.result != ScanResult::Error {
                tracing::warn!(target: "scan::reconcile", scan = %key, error = %message, "invalid scan");
                copy.status.set_error(message);
                self.update_status_with_event(&original, &copy).await?;
            }
            return Ok(ReconcileAction::done());
        }

        tracing::debug!(target: "scan::reconcile", scan = %key, phase = ?copy.status.phase, "reconciling");
        match copy.status.phase {
            ScanPhase::Pending => self.phase_pending(&original, copy).await,
            ScanPhase::Launching => self.phase_launching(&original, copy).await,
            ScanPhase::Running => self.phase_running(&original, copy).await,
            ScanPhase::Aggregating => self.phase_aggregating(&original, copy).await,
            ScanPhase::Done => self.phase_done(&original, copy).await,
        }
    }

    fn validate_spec(scan: &Scan) -> Option<String> {
        if let Err(err) = scan.spec.scan_type() {
            return Some(err.to_string());
        }
        if let Err(err) = scan.spec.validate_storage_size() {
            return Some(err.to_string());
        }
        None
    }

    async fn update_status(&self, original: &Scan, scan: &Scan) -> Result<()> {
        if original.status != scan.status {
            self.store.update_status(scan).await?;
        }
        Ok(())
    }

    /// Writes status and, once the scan is done, announces its result.
    async fn update_status_with_event(&self, original: &Scan, scan: &Scan) -> Result<()> {
        self.update_status(original, scan).await?;
        if scan.status.phase == ScanPhase::Done {
            tracing::info!(
                target: "scan::reconcile",
                scan = %scan.name(),
                result = %scan.status.result,
                "scan finished"
            );
            for event in events::result_events(scan, scan.status.result) {
                self.events.record(event).await?;
            }
        }
        Ok(())
    }

    async fn phase_pending(&self, original: &Scan, mut scan: Scan) -> Result<ReconcileAction> {
        if scan.needs_rescan() {
            scan.metadata.annotations.remove(labels::RESCAN_ANNOTATION);
            self.store.update(&scan).await?;
            tracing::info!(target: "scan::reconcile", scan = %scan.name(), "cleared rescan request");
            return Ok(ReconcileAction::done());
        }

        scan.status.phase = ScanPhase::Launching;
        scan.status.result = ScanResult::NotAvailable;
        self.update_status(original, &scan).await?;
        Ok(ReconcileAction::done())
    }

    async fn phase_launching(&self, original: &Scan, mut scan: Scan) -> Result<ReconcileAction> {
        let strategy = ScanStrategy::resolve(self.store.as_ref(), &scan).await?;
        match strategy.validate(self.ctx(), &scan).await? {
            Validation::Ready => scan.status.warnings.clear(),
            Validation::NoTargets => {
                scan.status.result = ScanResult::NotApplicable;
                scan.status.phase = ScanPhase::Done;
                self.update_status_with_event(original, &scan).await?;
                return Ok(ReconcileAction::done());
            }
            Validation::Blocked { message, .. } => {
                scan.status.warnings = message;
                self.update_status(original, &scan).await?;
                return Ok(self.requeue());
            }
        }

        let store = self.store.as_ref();
        for cm in [
            self.workloads.script_config(&scan),
            self.workloads.env_config(&scan, ScanType::Node),
            self.workloads.env_config(&scan, ScanType::Platform),
        ] {
            store::create_if_absent(store, &cm).await?;
        }

        self.channel.ensure_root_ca(store, &scan).await?;
        self.channel.ensure_server_cert(store, &scan).await?;
        self.channel.ensure_client_cert(store, &scan).await?;

        match storage::ensure_claim(store, &scan, &self.config.storage).await {
            Ok(reference) => {
                if scan.status.results_storage.as_ref() != Some(&reference) {
                    scan.status.results_storage = Some(reference);
                    self.update_status(original, &scan).await?;
                    return Ok(ReconcileAction::done());
                }
            }
            Err(err) if !err.is_retriable() => {
                tracing::error!(target: "scan::reconcile", scan = %scan.name(), error = %err, "raw result storage rejected");
                self.events
                    .record(events::event_for(
                        &scan,
                        EventType::Warning,
                        events::REASON_STORAGE_REJECTED,
                        err.to_string(),
                    ))
                    .await?;
                scan.status.set_error(err.to_string());
                self.update_status_with_event(original, &scan).await?;
                return Ok(ReconcileAction::done());
            }
            Err(err) => return Err(err),
        }

        self.channel
            .ensure_endpoint(store, &scan, &self.config.storage)
            .await?;

        if let Err(err) = strategy.create_workloads(self.ctx(), &scan).await {
            if err.is_retriable() {
                return Err(err);
            }
            tracing::error!(target: "scan::reconcile", scan = %scan.name(), error = %err, "cannot launch scan workloads");
            scan.status.set_error(err.to_string());
            self.update_status_with_event(original, &scan).await?;
            return Ok(ReconcileAction::done());
        }

        scan.status.phase = ScanPhase::Running;
        self.update_status(original, &scan).await?;
        Ok(ReconcileAction::done())
    }

    async fn phase_running(&self, original: &Scan, mut scan: Scan) -> Result<ReconcileAction> {
        let strategy = ScanStrategy::resolve(self.store.as_ref(), &scan).await?;
        match strategy.handle_running(self.ctx(), &scan).await? {
            RunningState::StillRunning => Ok(self.requeue()),
            RunningState::WorkloadMissing => {
                scan.status.phase = ScanPhase::Launching;
                self.update_status(original, &scan).await?;
                Ok(ReconcileAction::done())
            }
            RunningState::Finished => {
                scan.status.phase = ScanPhase::Aggregating;
                self.update_status(original, &scan).await?;
                Ok(ReconcileAction::done())
            }
        }
    }

    async fn phase_aggregating(&self, original: &Scan, mut scan: Scan) -> Result<ReconcileAction> {
        let strategy = ScanStrategy::resolve(self.store.as_ref(), &scan).await?;
        match strategy.should_launch_aggregator(self.ctx(), &scan).await {
            AggregatorReadiness::NotReady => {
                tracing::info!(target: "scan::reconcile", scan = %scan.name(), "result artifact missing, requeuing");
                return Ok(self.requeue());
            }
            AggregatorReadiness::Failed { warnings, message } => {
                scan.status.warnings = warnings;
                scan.status.set_error(message);
                self.update_status_with_event(original, &scan).await?;
                return Ok(ReconcileAction::done());
            }
            AggregatorReadiness::Ready { warnings } => scan.status.warnings = warnings,
        }

        let aggregator = self.workloads.aggregator_workload(&scan);
        self.workloads.create(self.store.as_ref(), &aggregator).await?;

        let key = ObjectKey::new(scan.namespace(), aggregator.metadata.name.clone());
        let Some(pod) = store::get_opt::<_, Pod>(self.store.as_ref(), &key).await?
        else {
            return Ok(ReconcileAction::requeue(
                self.config.reconcile.requeue_not_found(),
            ));
        };
        if matches!(
            workload_state(&pod),
            WorkloadState::Running | WorkloadState::Unschedulable(_)
        ) {
            tracing::debug!(target: "scan::reconcile", scan = %scan.name(), "aggregator still running");
            return Ok(self.requeue());
        }

        let gathered = strategy.gather_results(self.ctx(), &scan).await?;
        if !gathered.ready {
            if workload_state(&pod) == WorkloadState::Failed {
                tracing::warn!(target: "scan::reconcile", scan = %scan.name(), "aggregator failed, restarting it");
                self.workloads.delete_aggregator(self.store.as_ref(), &scan).await?;
            }
            tracing::info!(target: "scan::reconcile", scan = %scan.name(), "results not gathered yet, requeuing");
            return Ok(self.requeue());
        }

        self.prune_stale_checks(&scan).await?;

        scan.status.result = gathered.result;
        if let Some(message) = gathered.error {
            scan.status.error_message = message;
        } else if self.has_inconsistent_checks(&scan).await? {
            scan.status.result = ScanResult::Inconsistent;
            scan.status.error_message = format!(
                "results were not consistent, search for compliancecheckresults labeled with {}",
                labels::CHECK_INCONSISTENT
            );
        }
        scan.status.phase = ScanPhase::Done;
        self.update_status_with_event(original, &scan).await?;
        Ok(ReconcileAction::done())
    }

    async fn has_inconsistent_checks(&self, scan: &Scan) -> Result<bool> {
        let selector = LabelSelector::from(scan.selector_labels())
            .with(labels::CHECK_INCONSISTENT, "")
            .with(labels::CHECK_SCAN_INDEX, scan.status.current_index.to_string());
        let checks: Vec<ComplianceCheck> = self
            .store
            .list(Some(scan.namespace()), &selector)
            .await?;
        Ok(!checks.is_empty())
    }

    /// Deletes checks an earlier run wrote that this run did not rewrite,
    /// together with the remediations they own.
    async fn prune_stale_checks(&self, scan: &Scan) -> Result<usize> {
        let store = self.store.as_ref();
        let owned = LabelSelector::from(scan.selector_labels());
        let current = scan.status.current_index.to_string();
        let checks: Vec<ComplianceCheck> = store.list(Some(scan.namespace()), &owned).await?;
        let stale: Vec<ComplianceCheck> = checks
            .into_iter()
            .filter(|check| check.metadata.labels.get(labels::CHECK_SCAN_INDEX) != Some(&current))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let remediations: Vec<ComplianceRemediation> =
            store.list(Some(scan.namespace()), &owned).await?;
        for check in &stale {
            for remediation in remediations.iter().filter(|r| {
                r.metadata
                    .controller_owner()
                    .is_some_and(|owner| {
                        owner.kind == ComplianceCheck::KIND && owner.name == check.metadata.name
                    })
            }) {
                store::delete_if_present::<_, ComplianceRemediation>(store, &remediation.key()).await?;
            }
            store::delete_if_present::<_, ComplianceCheck>(store, &check.key()).await?;
        }
        tracing::info!(target: "scan::reconcile", scan = %scan.name(), pruned = stale.len(), "removed checks from earlier runs");
        Ok(stale.len())
    }

    /// Tears down everything a finished scan no longer needs. Deletes are
    /// idempotent, missing objects are fine.
    async fn cleanup(&self, scan: &Scan) -> Result<()> {
        let store = self.store.as_ref();
        let strategy = ScanStrategy::resolve(store, scan).await?;
        strategy.cleanup(self.ctx(), scan).await?;
        self.channel.delete_endpoint(store, scan).await?;
        self.workloads.delete_aggregator(store, scan).await?;
        self.channel.delete_server_cert(store, scan).await?;
        self.channel.delete_client_cert(store, scan).await?;
        self.channel.delete_root_ca(store, scan).await?;
        self.workloads.delete_configs(store, scan).await?;
        Ok(())
    }

    async fn delete_artifacts(&self, scan: &Scan) -> Result<usize> {
        Ok(self
            .store
            .delete_all_of::<ConfigMap>(scan.namespace(), &strategy::artifact_selector(scan))
            .await?)
    }

    async fn phase_done(&self, original: &Scan, mut scan: Scan) -> Result<ReconcileAction> {
        let rescan = scan.needs_rescan();
        if scan.spec.debug && !rescan {
            self.channel.scale_to_zero(self.store.as_ref(), &scan).await?;
            return Ok(ReconcileAction::done());
        }

        self.cleanup(&scan).await?;

        if rescan {
            let deleted = self.delete_artifacts(&scan).await?;
            tracing::info!(target: "scan::reconcile", scan = %scan.name(), deleted, "resetting scan for rescan");
            scan.status.phase = ScanPhase::Pending;
            scan.status.result = ScanResult::NotAvailable;
            scan.status.error_message.clear();
            scan.status.warnings.clear();
            scan.status.advance_index();
            self.update_status(original, &scan).await?;
        }
        Ok(ReconcileAction::done())
    }

    async fn delete_scan(&self, scan: Scan) -> Result<ReconcileAction> {
        if !scan.metadata.has_finalizer(labels::SCAN_FINALIZER) {
            return Ok(ReconcileAction::done());
        }
        tracing::info!(target: "scan::reconcile", scan = %scan.name(), "the scan is being deleted");

        let mut doomed = scan.clone();
        doomed.metadata.annotations.remove(labels::RESCAN_ANNOTATION);
        doomed.spec.debug = false;

        self.cleanup(&doomed).await?;
        self.delete_artifacts(&doomed).await?;
        storage::delete_claim(self.store.as_ref(), &doomed).await?;

        let owned = LabelSelector::from(doomed.selector_labels());
        self.store
            .delete_all_of::<ComplianceRemediation>(doomed.namespace(), &owned)
            .await?;
        self.store
            .delete_all_of::<ComplianceCheck>(doomed.namespace(), &owned)
            .await?;

        let mut released = scan;
        released.metadata.remove_finalizer(labels::SCAN_FINALIZER);
        self.store.update(&released).await?;
        Ok(ReconcileAction::done())
    }
}
