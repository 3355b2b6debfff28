use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};
use crate::labels;
use crate::meta::{impl_object, Labels, ObjectMeta};
use crate::quantity::Quantity;

/// Which kind of target a scan runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanType {
    #[default]
    Node,
    Platform,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Node => "Node",
            ScanType::Platform => "Platform",
        }
    }
}

impl FromStr for ScanType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // Unset scan type defaults to Node.
            "" | "Node" => Ok(ScanType::Node),
            "Platform" => Ok(ScanType::Platform),
            other => Err(ModelError::InvalidScanType(other.to_string())),
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum ScanPhase {
    #[default]
    Pending,
    Launching,
    Running,
    Aggregating,
    Done,
}

impl ScanPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanPhase::Pending => "PENDING",
            ScanPhase::Launching => "LAUNCHING",
            ScanPhase::Running => "RUNNING",
            ScanPhase::Aggregating => "AGGREGATING",
            ScanPhase::Done => "DONE",
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a scan. Only meaningful once the phase reaches `Done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanResult {
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "NOT-AVAILABLE"))]
    NotAvailable,
    #[cfg_attr(feature = "serde", serde(rename = "COMPLIANT"))]
    Compliant,
    #[cfg_attr(feature = "serde", serde(rename = "NON-COMPLIANT"))]
    NonCompliant,
    #[cfg_attr(feature = "serde", serde(rename = "ERROR"))]
    Error,
    #[cfg_attr(feature = "serde", serde(rename = "NOT-APPLICABLE"))]
    NotApplicable,
    #[cfg_attr(feature = "serde", serde(rename = "INCONSISTENT"))]
    Inconsistent,
}

impl ScanResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanResult::NotAvailable => "NOT-AVAILABLE",
            ScanResult::Compliant => "COMPLIANT",
            ScanResult::NonCompliant => "NON-COMPLIANT",
            ScanResult::Error => "ERROR",
            ScanResult::NotApplicable => "NOT-APPLICABLE",
            ScanResult::Inconsistent => "INCONSISTENT",
        }
    }
}

impl FromStr for ScanResult {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "NOT-AVAILABLE" => ScanResult::NotAvailable,
            "COMPLIANT" => ScanResult::Compliant,
            "NON-COMPLIANT" => ScanResult::NonCompliant,
            "ERROR" => ScanResult::Error,
            "NOT-APPLICABLE" => ScanResult::NotApplicable,
            "INCONSISTENT" => ScanResult::Inconsistent,
            other => {
                return Err(ModelError::InvalidName(format!(
                    "unknown scan result {other}"
                )));
            }
        })
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct RawResultStorage {
    /// Claim size, e.g. `1Gi`. Empty means the controller default.
    pub size: String,
    pub access_modes: Vec<String>,
    pub storage_class_name: Option<String>,
    /// Number of result directories the receiver keeps. Zero means default.
    pub rotation: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct ScanSpec {
    /// Raw scan type as written by the user; see [`ScanSpec::scan_type`].
    pub scan_type: String,
    pub content_image: String,
    /// Path of the datastream inside the content image.
    pub content: String,
    pub profile: String,
    /// Restricts the scan to a single rule.
    pub rule: Option<String>,
    pub node_selector: Labels,
    pub raw_result_storage: RawResultStorage,
    /// Fail validation on unschedulable nodes instead of skipping them.
    /// Unset means strict.
    pub strict_node_scan: Option<bool>,
    /// Keeps workloads and the result server around after `Done`.
    pub debug: bool,
}

impl ScanSpec {
    pub fn scan_type(&self) -> Result<ScanType> {
        self.scan_type.parse()
    }

    pub fn strict_node_scan(&self) -> bool {
        self.strict_node_scan.unwrap_or(true)
    }

    /// Node selector merged with the OS family constraint.
    pub fn effective_node_selector(&self) -> Labels {
        let mut selector = self.node_selector.clone();
        selector.insert(
            labels::NODE_OS_LABEL.to_string(),
            labels::NODE_OS_LINUX.to_string(),
        );
        selector
    }

    pub fn validate_storage_size(&self) -> Result<()> {
        if self.raw_result_storage.size.is_empty() {
            return Ok(());
        }
        Quantity::parse(&self.raw_result_storage.size).map(|_| ())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub result: ScanResult,
    pub error_message: String,
    pub warnings: String,
    /// Bumped on every rescan; result directories are keyed by it.
    pub current_index: u64,
    pub results_storage: Option<StorageReference>,
}

impl ScanStatus {
    /// Advances the rescan index, wrapping to zero at the maximum.
    pub fn advance_index(&mut self) {
        self.current_index = self.current_index.wrapping_add(1);
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.result = ScanResult::Error;
        self.error_message = message.into();
        self.phase = ScanPhase::Done;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Scan {
    pub metadata: ObjectMeta,
    pub spec: ScanSpec,
    pub status: ScanStatus,
}

impl_object!(Scan, "ComplianceScan");

impl Scan {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ScanSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: ScanStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn needs_rescan(&self) -> bool {
        self.metadata.has_annotation(labels::RESCAN_ANNOTATION)
    }

    /// Labels every per-scan resource carries.
    pub fn selector_labels(&self) -> Labels {
        let mut selector = Labels::new();
        selector.insert(labels::SCAN_NAME.to_string(), self.metadata.name.clone());
        selector
    }
}
