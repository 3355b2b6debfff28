use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;
use crate::meta::{impl_object, ObjectMeta};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum CheckStatus {
    #[default]
    Pass,
    Fail,
    Info,
    Error,
    Skip,
}

impl CheckStatus {
    pub const ALL: [CheckStatus; 5] = [
        CheckStatus::Pass,
        CheckStatus::Fail,
        CheckStatus::Info,
        CheckStatus::Error,
        CheckStatus::Skip,
    ];

    /// Ordering used when sources disagree: higher wins.
    pub fn severity(self) -> u8 {
        match self {
            CheckStatus::Skip => 0,
            CheckStatus::Pass => 1,
            CheckStatus::Info => 2,
            CheckStatus::Fail => 3,
            CheckStatus::Error => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Info => "INFO",
            CheckStatus::Error => "ERROR",
            CheckStatus::Skip => "SKIP",
        }
    }

    /// Statuses for which a remediation is worth materializing.
    pub fn carries_remediation(self) -> bool {
        matches!(self, CheckStatus::Pass | CheckStatus::Fail | CheckStatus::Info)
    }
}

impl FromStr for CheckStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ModelError::InvalidName(format!("unknown check status {s}")))
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluated outcome of one rule for one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ComplianceCheck {
    pub metadata: ObjectMeta,
    /// Rule identifier from the content.
    pub id: String,
    pub status: CheckStatus,
    pub severity: String,
    pub description: String,
}

impl_object!(ComplianceCheck, "ComplianceCheckResult");

impl ComplianceCheck {
    /// Compares everything but metadata and status.
    pub fn same_except_status(&self, other: &Self) -> bool {
        self.id == other.id
            && self.severity == other.severity
            && self.description == other.description
    }
}
