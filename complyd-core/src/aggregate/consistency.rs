//! Cross-target consistency of parsed results.
//!
//! The first batch of results is taken as the reference. Every later batch is
//! compared against it item by item: an id whose result differs, is missing,
//! or is new moves to the inconsistent set together with the sources that
//! reported each variant. Inconsistent groups are folded back into a single
//! result when the consistent set is drained.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use complyd_model::{CheckStatus, Labels, labels};

use super::parser::ParseResult;

/// Share of contributing sources that must agree for a status to count as
/// the most common one.
const COMMON_STATUS_RATIO: f64 = 0.6;

const MSG_DIFFERS: &str = "Check sources differ in more than status\n";
const MSG_DOUBLE_LISTED: &str = "Check found in both consistent and inconsistent lists";

/// A materializable result plus the metadata consistency resolution attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub result: ParseResult,
    pub annotations: Labels,
    pub labels: Labels,
}

impl ResolvedItem {
    pub fn is_inconsistent(&self) -> bool {
        self.labels.contains_key(labels::CHECK_INCONSISTENT)
    }
}

#[derive(Debug, Clone)]
struct Variant {
    result: ParseResult,
    sources: Vec<String>,
}

#[derive(Debug, Clone)]
struct Tracked {
    variant: Variant,
    seen: bool,
}

#[derive(Debug, Default)]
pub struct ConsistencyResolver {
    consistent: BTreeMap<String, Tracked>,
    inconsistent: BTreeMap<String, Vec<Variant>>,
}

impl ConsistencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one artifact's results. An empty `source` (platform results)
    /// is never compared against anything.
    pub fn add_results(&mut self, source: &str, results: Vec<ParseResult>) {
        if source.is_empty() || (self.consistent.is_empty() && self.inconsistent.is_empty()) {
            for result in results {
                self.consistent.insert(
                    result.id.clone(),
                    Tracked {
                        variant: Variant {
                            result,
                            sources: source_list(source),
                        },
                        seen: false,
                    },
                );
            }
            return;
        }

        for tracked in self.consistent.values_mut() {
            tracked.seen = false;
        }

        for result in results {
            let Some(tracked) = self.consistent.get_mut(&result.id) else {
                self.push_inconsistent(result, source_list(source));
                continue;
            };
            tracked.seen = true;

            if tracked.variant.result.same_as(&result) {
                tracked.variant.sources.push(source.to_string());
                continue;
            }

            if let Some(previous) = self.consistent.remove(&result.id) {
                self.push_variant(previous.variant);
            }
            self.push_inconsistent(result, source_list(source));
        }

        let unseen: Vec<String> = self
            .consistent
            .iter()
            .filter(|(_, tracked)| !tracked.seen)
            .map(|(id, _)| id.clone())
            .collect();
        for id in unseen {
            if let Some(previous) = self.consistent.remove(&id) {
                self.push_variant(previous.variant);
            }
        }
    }

    fn push_inconsistent(&mut self, result: ParseResult, sources: Vec<String>) {
        self.push_variant(Variant { result, sources });
    }

    fn push_variant(&mut self, variant: Variant) {
        self.inconsistent
            .entry(variant.result.id.clone())
            .or_default()
            .push(variant);
    }

    /// Drains the resolver into one item per check id, ordered by id.
    pub fn into_results(self) -> Vec<ResolvedItem> {
        let Self {
            consistent,
            inconsistent,
        } = self;

        let mut resolved: BTreeMap<String, ResolvedItem> = consistent
            .into_iter()
            .map(|(id, tracked)| {
                (
                    id,
                    ResolvedItem {
                        result: tracked.variant.result,
                        annotations: Labels::new(),
                        labels: Labels::new(),
                    },
                )
            })
            .collect();

        for (id, variants) in inconsistent {
            let Some(mut item) = reconcile_variants(variants) else {
                continue;
            };
            if resolved.contains_key(&id) {
                force_error(&mut item, MSG_DOUBLE_LISTED.to_string());
            }
            resolved.insert(id, item);
        }

        resolved.into_values().collect()
    }
}

fn source_list(source: &str) -> Vec<String> {
    if source.is_empty() {
        Vec::new()
    } else {
        vec![source.to_string()]
    }
}

fn force_error(item: &mut ResolvedItem, message: String) {
    if let Some(check) = item.result.check.as_mut() {
        check.status = CheckStatus::Error;
    }
    item.result.remediations.clear();
    item.annotations = Labels::from([(labels::CHECK_ERROR.to_string(), message)]);
}

fn reconcile_variants(variants: Vec<Variant>) -> Option<ResolvedItem> {
    let base = variants.first()?;
    let mut item = ResolvedItem {
        result: base.result.clone(),
        annotations: Labels::new(),
        labels: Labels::from([(labels::CHECK_INCONSISTENT.to_string(), String::new())]),
    };

    if let Some(diff) = describe_differences(&variants) {
        force_error(&mut item, format!("{MSG_DIFFERS}{diff}"));
        return Some(item);
    }

    let common = most_common_status(&variants);
    let mut deviating = Vec::new();
    let mut remediable = true;
    for variant in &variants {
        let Some(status) = variant.result.status() else {
            continue;
        };
        if !status.carries_remediation() {
            remediable = false;
        }
        if common == Some(status) {
            continue;
        }
        deviating.extend(
            variant
                .sources
                .iter()
                .map(|source| format!("{source}:{status}")),
        );
    }

    if !deviating.is_empty() {
        item.annotations
            .insert(labels::INCONSISTENT_SOURCE.into(), deviating.join(","));
    }
    if let Some(status) = common {
        item.annotations
            .insert(labels::MOST_COMMON_STATUS.into(), status.to_string());
    }
    if !remediable {
        item.result.remediations.clear();
    }

    let worst = variants
        .iter()
        .filter_map(|variant| variant.result.status())
        .max_by_key(|status| status.severity());
    if let (Some(check), Some(worst)) = (item.result.check.as_mut(), worst) {
        check.status = worst;
    }

    Some(item)
}

/// Describes how the variants differ beyond their status, if they do.
fn describe_differences(variants: &[Variant]) -> Option<String> {
    let (base, rest) = variants.split_first()?;
    let mut out = String::new();
    for other in rest {
        match (&base.result.check, &other.result.check) {
            (Some(a), Some(b)) => {
                if a.severity != b.severity {
                    let _ = writeln!(out, "severity: {:?} != {:?}", a.severity, b.severity);
                }
                if a.description != b.description {
                    let _ = writeln!(out, "description: {:?} != {:?}", a.description, b.description);
                }
            }
            (None, None) => {}
            _ => {
                let _ = writeln!(out, "check present in only some sources");
            }
        }
        if !base.result.same_remediations(&other.result) {
            let _ = writeln!(
                out,
                "remediations differ between [{}] and [{}]",
                base.sources.join(","),
                other.sources.join(",")
            );
        }
        if !out.is_empty() {
            return Some(out);
        }
    }
    None
}

/// Status reported by at least [`COMMON_STATUS_RATIO`] of all sources.
///
/// Equal counts go to the more severe status.
fn most_common_status(variants: &[Variant]) -> Option<CheckStatus> {
    let mut counts: BTreeMap<CheckStatus, usize> = BTreeMap::new();
    let mut total = 0usize;
    for variant in variants {
        let Some(status) = variant.result.status() else {
            continue;
        };
        let weight = variant.sources.len().max(1);
        *counts.entry(status).or_default() += weight;
        total += weight;
    }

    let (status, count) = counts
        .into_iter()
        .max_by_key(|(status, count)| (*count, status.severity()))?;
    let required = (total as f64 * COMMON_STATUS_RATIO).ceil() as usize;
    (count >= required).then_some(status)
}
