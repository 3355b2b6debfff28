//! Content parser port and the JSON result format understood by default.

use serde::Deserialize;

use complyd_model::{
    CheckStatus, ComplianceCheck, ComplianceRemediation, ObjectMeta, RemediationPayload,
    RemediationSpec, Scan,
};

use crate::error::{CoreError, Result};
use crate::naming;

/// One parsed rule evaluation with the remediations proposed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    pub id: String,
    pub check: Option<ComplianceCheck>,
    pub remediations: Vec<ComplianceRemediation>,
}

impl ParseResult {
    /// Same check and same remediation payloads, metadata aside.
    pub fn same_as(&self, other: &Self) -> bool {
        let checks_match = match (&self.check, &other.check) {
            (Some(a), Some(b)) => a.same_except_status(b) && a.status == b.status,
            (None, None) => true,
            _ => false,
        };
        checks_match && self.same_remediations(other)
    }

    pub fn same_remediations(&self, other: &Self) -> bool {
        self.remediations.len() == other.remediations.len()
            && self
                .remediations
                .iter()
                .zip(&other.remediations)
                .all(|(a, b)| a.spec.current == b.spec.current)
    }

    pub fn status(&self) -> Option<CheckStatus> {
        self.check.as_ref().map(|check| check.status)
    }
}

/// Turns a decoded artifact payload into check and remediation candidates.
#[cfg_attr(test, mockall::automock)]
pub trait ContentParser: Send + Sync {
    fn parse(&self, scan: &Scan, payload: &[u8]) -> Result<Vec<ParseResult>>;
}

#[derive(Debug, Deserialize)]
struct ResultDocument {
    #[serde(default)]
    checks: Vec<ResultEntry>,
}

#[derive(Debug, Deserialize)]
struct ResultEntry {
    id: String,
    status: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    remediations: Vec<RemediationPayload>,
}

/// Parser for the scanner's JSON result document:
///
/// ```json
/// {"checks": [{"id": "...", "status": "FAIL", "severity": "high",
///              "description": "...", "remediations": [{"kind": "...", "body": "..."}]}]}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResultParser;

impl ContentParser for JsonResultParser {
    fn parse(&self, scan: &Scan, payload: &[u8]) -> Result<Vec<ParseResult>> {
        let doc: ResultDocument = serde_json::from_slice(payload)
            .map_err(|err| CoreError::Parse(format!("invalid result document: {err}")))?;

        doc.checks
            .into_iter()
            .map(|entry| {
                let status: CheckStatus = entry.status.parse().map_err(|_| {
                    CoreError::Parse(format!(
                        "rule {} has unknown status {}",
                        entry.id, entry.status
                    ))
                })?;
                let check_name = naming::check_name(scan.name(), &entry.id);
                let remediations = entry
                    .remediations
                    .into_iter()
                    .enumerate()
                    .map(|(idx, payload)| ComplianceRemediation {
                        metadata: ObjectMeta::named(
                            scan.namespace(),
                            naming::remediation_name(&check_name, idx),
                        ),
                        spec: RemediationSpec {
                            apply: false,
                            current: payload,
                            outdated: None,
                        },
                        status: Default::default(),
                    })
                    .collect();

                Ok(ParseResult {
                    check: Some(ComplianceCheck {
                        metadata: ObjectMeta::named(scan.namespace(), check_name),
                        id: entry.id.clone(),
                        status,
                        severity: entry.severity,
                        description: entry.description,
                    }),
                    id: entry.id,
                    remediations,
                })
            })
            .collect()
    }
}
