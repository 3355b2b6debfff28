//! Idempotent writes of check results and remediations.
//!
//! Every write looks the object up first and turns into an update when it
//! exists, so re-running an interrupted aggregation converges on the same
//! objects instead of failing or duplicating them.

use complyd_model::{
    CheckStatus, ComplianceCheck, ComplianceRemediation, Labels, Object, RemediationState, Scan,
    labels,
};

use crate::aggregate::ResolvedItem;
use crate::config::RetryConfig;
use crate::error::Result;
use crate::retry::retry_store;
use crate::store::{self, ObjectStore, StoredObject};

/// Counts of what one materialization pass wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub checks: usize,
    pub remediations: usize,
    pub outdated: usize,
}

/// Creates `obj`, or replaces the stored object of the same key keeping its
/// identity. Conflicts and create races are retried.
pub async fn create_or_update<S, T>(store: &S, retry: &RetryConfig, obj: &T) -> Result<T>
where
    S: ObjectStore,
    T: StoredObject,
{
    let written = retry_store(retry, || async move {
        match store::get_opt::<_, T>(store, &obj.key()).await? {
            Some(existing) => {
                let mut next = obj.clone();
                let meta = next.meta_mut();
                meta.uid = existing.meta().uid.clone();
                meta.resource_version = existing.meta().resource_version;
                store.update(&next).await
            }
            None => store.create(obj).await,
        }
    })
    .await?;
    Ok(written)
}

pub struct Materializer<'a, S> {
    store: &'a S,
    retry: &'a RetryConfig,
    scan: &'a Scan,
}

impl<S> std::fmt::Debug for Materializer<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("store", &std::any::type_name::<S>())
            .field("scan", &self.scan.key())
            .finish()
    }
}

impl<'a, S: ObjectStore> Materializer<'a, S> {
    pub fn new(store: &'a S, retry: &'a RetryConfig, scan: &'a Scan) -> Self {
        Self { store, retry, scan }
    }

    /// Writes every resolved item. All checks and remediations are written
    /// before this returns, so callers can mark artifacts processed afterwards.
    pub async fn materialize(&self, items: &[ResolvedItem]) -> Result<MaterializeSummary> {
        let mut summary = MaterializeSummary::default();
        for item in items {
            let Some(check) = self.write_check(item).await? else {
                continue;
            };
            summary.checks += 1;

            if !check.status.carries_remediation() && !item.is_inconsistent() {
                continue;
            }
            for remediation in &item.result.remediations {
                match self.write_remediation(&check, remediation).await? {
                    RemediationWrite::Skipped => {}
                    RemediationWrite::Written => summary.remediations += 1,
                    RemediationWrite::Outdated => {
                        summary.remediations += 1;
                        summary.outdated += 1;
                    }
                }
            }
        }

        tracing::info!(
            target: "scan::aggregate",
            scan = %self.scan.key(),
            checks = summary.checks,
            remediations = summary.remediations,
            outdated = summary.outdated,
            "materialized scan results"
        );
        Ok(summary)
    }

    async fn write_check(&self, item: &ResolvedItem) -> Result<Option<ComplianceCheck>> {
        let Some(mut check) = item.result.check.clone() else {
            return Ok(None);
        };

        let mut check_labels = self.scan.selector_labels();
        check_labels.insert(labels::CHECK_STATUS.into(), check.status.to_string());
        check_labels.insert(labels::CHECK_SEVERITY.into(), check.severity.clone());
        check_labels.insert(
            labels::CHECK_SCAN_INDEX.into(),
            self.scan.status.current_index.to_string(),
        );
        check_labels.extend(item.labels.clone());

        let meta = &mut check.metadata;
        meta.labels = check_labels;
        meta.annotations = item.annotations.clone();
        meta.set_controller_owner(self.scan.as_owner());

        tracing::debug!(
            target: "scan::aggregate",
            check = %check.key(),
            status = %check.status,
            "writing check result"
        );
        create_or_update(self.store, self.retry, &check).await.map(Some)
    }

    async fn write_remediation(
        &self,
        check: &ComplianceCheck,
        parsed: &ComplianceRemediation,
    ) -> Result<RemediationWrite> {
        let mut remediation = parsed.clone();
        let existing =
            store::get_opt::<_, ComplianceRemediation>(self.store, &remediation.key()).await?;

        let mut state = RemediationState::Pending;
        let mut outcome = RemediationWrite::Written;
        let mut rem_labels: Labels = self.scan.selector_labels();

        match &existing {
            Some(stored)
                if matches!(
                    stored.status.application_state,
                    RemediationState::Applied | RemediationState::Outdated
                ) =>
            {
                if stored.spec.current == remediation.spec.current {
                    return Ok(RemediationWrite::Skipped);
                }
                remediation.spec.outdated = match stored.status.application_state {
                    RemediationState::Applied => Some(stored.spec.current.clone()),
                    _ => stored.spec.outdated.clone(),
                };
                rem_labels.insert(labels::REMEDIATION_OUTDATED.into(), String::new());
                state = RemediationState::Outdated;
                outcome = RemediationWrite::Outdated;
                tracing::info!(
                    target: "scan::aggregate",
                    remediation = %remediation.key(),
                    "remediation content changed after it was applied, marking outdated"
                );
            }
            Some(_) => {}
            None if check.status == CheckStatus::Pass => {
                return Ok(RemediationWrite::Skipped);
            }
            None => {}
        }

        if let Some(stored) = &existing {
            remediation.spec.apply = stored.spec.apply;
        }
        remediation.metadata.labels = rem_labels;
        remediation.metadata.set_controller_owner(check.as_owner());

        let written = create_or_update(self.store, self.retry, &remediation).await?;
        if existing.is_some() && written.status.application_state != state {
            let mut status_change = written.clone();
            status_change.status.application_state = state;
            retry_store(self.retry, || self.store.update_status(&status_change)).await?;
        }
        Ok(outcome)
    }
}

enum RemediationWrite {
    Skipped,
    Written,
    Outdated,
}
