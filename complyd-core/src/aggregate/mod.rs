//! Turns the per-target result artifacts of one scan into check results and
//! remediations.
//!
//! Order matters for crash safety: all checks and remediations are written
//! before any artifact is annotated as processed. A run interrupted half way
//! re-reads the same artifacts next time and the idempotent writes converge.

mod consistency;
mod parser;

pub use consistency::{ConsistencyResolver, ResolvedItem};
#[cfg(test)]
pub use parser::MockContentParser;
pub use parser::{ContentParser, JsonResultParser, ParseResult};

use std::any::type_name;
use std::fmt;

use complyd_model::{CheckStatus, ConfigMap, Object, Scan, ScanResult, labels};

use crate::artifact;
use crate::config::RetryConfig;
use crate::error::Result;
use crate::materialize::{MaterializeSummary, Materializer};
use crate::retry::retry_store;
use crate::store::ObjectStore;
use crate::strategy::artifact_selector;

const MSG_NO_RESULTS: &str =
    "The scan did not produce any results, maybe an OS/platform mismatch?";

/// What one aggregation run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationReport {
    /// Artifacts consumed in this run.
    pub processed: usize,
    /// Artifacts already marked processed by an earlier run.
    pub skipped: usize,
    pub inconsistent: usize,
    pub written: MaterializeSummary,
}

pub struct Aggregator<'a, S, P> {
    store: &'a S,
    parser: &'a P,
    retry: &'a RetryConfig,
}

impl<S, P> fmt::Debug for Aggregator<'_, S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("store", &type_name::<S>())
            .field("parser", &type_name::<P>())
            .field("retry", self.retry)
            .finish()
    }
}

impl<'a, S, P> Aggregator<'a, S, P>
where
    S: ObjectStore,
    P: ContentParser,
{
    pub fn new(store: &'a S, parser: &'a P, retry: &'a RetryConfig) -> Self {
        Self {
            store,
            parser,
            retry,
        }
    }

    pub async fn run(&self, scan: &Scan) -> Result<AggregationReport> {
        let mut artifacts: Vec<ConfigMap> = self
            .store
            .list(Some(scan.namespace()), &artifact_selector(scan))
            .await?;
        artifacts.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut report = AggregationReport::default();
        let mut resolver = ConsistencyResolver::new();
        let mut pending = Vec::with_capacity(artifacts.len());

        for mut cm in artifacts {
            if artifact::is_processed(&cm) {
                tracing::debug!(target: "scan::aggregate", artifact = %cm.key(), "already processed, skipping");
                report.skipped += 1;
                continue;
            }

            let results = self.parse_artifact(scan, &cm);
            annotate_result(&mut cm, results.as_deref().unwrap_or_default());
            if let Some(results) = results {
                resolver.add_results(artifact::source(&cm), results);
            }
            pending.push(cm);
        }

        let items = resolver.into_results();
        report.inconsistent = items.iter().filter(|item| item.is_inconsistent()).count();
        report.written = Materializer::new(self.store, self.retry, scan)
            .materialize(&items)
            .await?;

        for cm in pending {
            self.mark_processed(cm).await?;
            report.processed += 1;
        }

        tracing::info!(
            target: "scan::aggregate",
            scan = %scan.key(),
            processed = report.processed,
            skipped = report.skipped,
            inconsistent = report.inconsistent,
            "aggregation finished"
        );
        Ok(report)
    }

    /// `None` when the artifact has nothing usable. Such artifacts take no
    /// part in consistency resolution but are still annotated from their
    /// exit code.
    fn parse_artifact(&self, scan: &Scan, cm: &ConfigMap) -> Option<Vec<ParseResult>> {
        let payload = match artifact::decode_payload(cm) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::warn!(
                    target: "scan::aggregate",
                    artifact = %cm.key(),
                    "no results in configmap {}",
                    cm.metadata.name
                );
                return None;
            }
            Err(err) => {
                tracing::error!(target: "scan::aggregate", artifact = %cm.key(), error = %err, "cannot decode results");
                return None;
            }
        };

        match self.parser.parse(scan, &payload) {
            Ok(results) => Some(results),
            Err(err) => {
                tracing::error!(target: "scan::aggregate", artifact = %cm.key(), error = %err, "cannot parse results");
                None
            }
        }
    }

    async fn mark_processed(&self, mut cm: ConfigMap) -> Result<()> {
        cm.metadata
            .annotations
            .insert(labels::ARTIFACT_PROCESSED.into(), String::new());
        let store = self.store;
        retry_store(self.retry, || {
            let cm = cm.clone();
            async move {
                let key = cm.key();
                match store.update(&cm).await {
                    Err(err) if err.is_conflict() => {
                        let mut latest: ConfigMap = store.get(&key).await?;
                        latest.metadata.annotations.extend(cm.metadata.annotations.clone());
                        store.update(&latest).await
                    }
                    other => other,
                }
            }
        })
        .await?;
        Ok(())
    }
}

/// Records the per-artifact result. A compliant artifact without a single
/// passing check is reported as not applicable.
fn annotate_result(cm: &mut ConfigMap, results: &[ParseResult]) {
    let (mut result, mut message) = artifact::exit_code_result(cm);
    if result == ScanResult::Compliant
        && !results
            .iter()
            .any(|parsed| parsed.status() == Some(CheckStatus::Pass))
    {
        result = ScanResult::NotApplicable;
        message = MSG_NO_RESULTS.to_string();
    }

    let annotations = &mut cm.metadata.annotations;
    annotations.insert(labels::ARTIFACT_RESULT.into(), result.to_string());
    if message.is_empty() {
        annotations.remove(labels::ARTIFACT_ERROR);
    } else {
        annotations.insert(labels::ARTIFACT_ERROR.into(), message);
    }
}
