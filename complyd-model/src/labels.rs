//! Well-known label, annotation and data keys.
//!
//! Per-scan resources are always labelled with [`SCAN_NAME`] so teardown can
//! walk label selectors instead of relying on store garbage collection.

/// Finalizer placed on every scan until teardown has run.
pub const SCAN_FINALIZER: &str = "scan.finalizers.complyd.io";

/// Presence requests a rescan of a finished scan.
pub const RESCAN_ANNOTATION: &str = "complyd.io/rescan";

pub const SCAN_NAME: &str = "complyd.io/scan-name";
/// Presence-only label marking per-target result artifacts.
pub const RESULT_ARTIFACT: &str = "complyd.io/scan-result";
pub const WORKLOAD: &str = "workload";
pub const NODE_NAME: &str = "complyd.io/node-name";
pub const TARGET_ROLE: &str = "complyd.io/target-role";

pub const WORKLOAD_SCANNER: &str = "scanner";
pub const WORKLOAD_AGGREGATOR: &str = "aggregator";
pub const WORKLOAD_RESULT_SERVER: &str = "resultserver";

pub const STORAGE_CLAIM: &str = "complyd.io/scan-storage";
pub const SCRIPT_CONFIG: &str = "complyd.io/scan-script";

/// Applied to checks whose per-target evaluations disagree.
pub const CHECK_INCONSISTENT: &str = "complyd.io/check-inconsistent";
pub const CHECK_STATUS: &str = "complyd.io/check-status";
pub const CHECK_SEVERITY: &str = "complyd.io/check-severity";
/// Rescan index a check was last written for.
pub const CHECK_SCAN_INDEX: &str = "complyd.io/scan-index";
pub const REMEDIATION_OUTDATED: &str = "complyd.io/outdated-remediation";

pub const INCONSISTENT_SOURCE: &str = "complyd.io/inconsistent-source";
pub const MOST_COMMON_STATUS: &str = "complyd.io/most-common-status";
pub const CHECK_ERROR: &str = "complyd.io/error-msg";

/// Sideband marker: the payload is base64 of a bzip2 stream.
pub const ARTIFACT_COMPRESSED: &str = "openscap-scan-result/compressed";
/// Sideband marker: the aggregator has consumed this artifact.
pub const ARTIFACT_PROCESSED: &str = "compliance-remediations/processed";
/// Names the node (or platform target) the artifact came from.
pub const ARTIFACT_SOURCE: &str = "openscap-scan-result/node";
pub const ARTIFACT_RESULT: &str = "compliance.complyd.io/scan-result";
pub const ARTIFACT_ERROR: &str = "compliance.complyd.io/scan-error-msg";

pub const KEY_EXIT_CODE: &str = "exit-code";
pub const KEY_RESULTS: &str = "results";
pub const KEY_ERROR_MSG: &str = "error-msg";
pub const KEY_WARNINGS: &str = "warnings";

pub const EXIT_COMPLIANT: &str = "0";
pub const EXIT_NON_COMPLIANT: &str = "2";
pub const EXIT_UNSCHEDULABLE: &str = "unschedulable";

pub const NODE_OS_LABEL: &str = "kubernetes.io/os";
pub const NODE_OS_LINUX: &str = "linux";
