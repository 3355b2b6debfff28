//! Per-target result artifacts.
//!
//! An artifact is a config map keyed by (scan, target) holding the scanner's
//! exit code, its payload (raw or base64 of a bzip2 stream), optional warnings
//! and presence-only sideband markers.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;

use complyd_model::{ConfigMap, Object, ObjectMeta, Scan, ScanResult, labels};

use crate::error::{CoreError, Result};

/// Payloads above this size are compressed before they are sent or stored.
pub const COMPRESSION_THRESHOLD: usize = 1_048_570;

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|err| CoreError::Decode(format!("bzip2 compression failed: {err}")))?;
    encoder
        .finish()
        .map_err(|err| CoreError::Decode(format!("bzip2 compression failed: {err}")))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    BzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| CoreError::Decode(format!("bzip2 stream is corrupt: {err}")))?;
    Ok(out)
}

/// Describes the artifact a scan workload (or the controller, on its behalf)
/// writes for one target.
#[derive(Debug, Clone)]
pub struct ArtifactSpec<'a> {
    pub name: String,
    /// Either [`labels::KEY_RESULTS`] or [`labels::KEY_ERROR_MSG`].
    pub payload_key: &'a str,
    pub source: &'a str,
    pub payload: &'a [u8],
    pub compress: bool,
    pub exit_code: &'a str,
    pub warnings: &'a str,
}

/// Builds the artifact config map, owned by and labelled for `scan`.
pub fn build_artifact(scan: &Scan, spec: ArtifactSpec<'_>) -> Result<ConfigMap> {
    let mut meta = ObjectMeta::named(scan.namespace(), spec.name);
    meta.labels = scan.selector_labels();
    meta.labels.insert(labels::RESULT_ARTIFACT.into(), String::new());
    meta.annotations
        .insert(labels::ARTIFACT_SOURCE.into(), spec.source.to_string());
    meta.set_controller_owner(scan.as_owner());

    let payload = if spec.compress {
        meta.annotations
            .insert(labels::ARTIFACT_COMPRESSED.into(), String::new());
        STANDARD.encode(compress(spec.payload)?)
    } else {
        String::from_utf8(spec.payload.to_vec()).map_err(|err| {
            CoreError::Decode(format!(
                "uncompressed {} payload for '{}' is not valid UTF-8: {err}",
                spec.payload_key, spec.source
            ))
        })?
    };

    let mut cm = ConfigMap {
        metadata: meta,
        data: Default::default(),
    };
    cm.data
        .insert(labels::KEY_EXIT_CODE.into(), spec.exit_code.to_string());
    cm.data.insert(spec.payload_key.to_string(), payload);
    if !spec.warnings.is_empty() {
        cm.data
            .insert(labels::KEY_WARNINGS.into(), spec.warnings.to_string());
    }
    Ok(cm)
}

/// Best-effort error artifact recorded when a target's workload could not be scheduled.
pub fn unschedulable_artifact(scan: &Scan, name: String, target: &str, message: &str) -> Result<ConfigMap> {
    build_artifact(
        scan,
        ArtifactSpec {
            name,
            payload_key: labels::KEY_ERROR_MSG,
            source: target,
            payload: message.as_bytes(),
            compress: false,
            exit_code: labels::EXIT_UNSCHEDULABLE,
            warnings: "",
        },
    )
}

pub fn is_compressed(cm: &ConfigMap) -> bool {
    cm.metadata.has_annotation(labels::ARTIFACT_COMPRESSED)
}

pub fn is_processed(cm: &ConfigMap) -> bool {
    cm.metadata.has_annotation(labels::ARTIFACT_PROCESSED)
}

pub fn source(cm: &ConfigMap) -> &str {
    cm.metadata
        .annotations
        .get(labels::ARTIFACT_SOURCE)
        .map(String::as_str)
        .unwrap_or_default()
}

/// Returns the decoded results payload, or `None` when the artifact carries none.
pub fn decode_payload(cm: &ConfigMap) -> Result<Option<Vec<u8>>> {
    let Some(raw) = cm.value(labels::KEY_RESULTS) else {
        return Ok(None);
    };
    if !is_compressed(cm) {
        return Ok(Some(raw.as_bytes().to_vec()));
    }
    let compressed = STANDARD.decode(raw.trim()).map_err(|err| {
        CoreError::Decode(format!(
            "ConfigMap '{}' holds invalid base64: {err}",
            cm.metadata.name
        ))
    })?;
    decompress(&compressed).map(Some)
}

/// Maps the exit-code contract onto a result: `"0"` is compliant, `"2"`
/// non-compliant and anything else an error carrying `error-msg`.
pub fn exit_code_result(cm: &ConfigMap) -> (ScanResult, String) {
    let name = &cm.metadata.name;
    match cm.value(labels::KEY_EXIT_CODE) {
        Some(labels::EXIT_COMPLIANT) => (ScanResult::Compliant, String::new()),
        Some(labels::EXIT_NON_COMPLIANT) => (ScanResult::NonCompliant, String::new()),
        Some(_) => match cm.value(labels::KEY_ERROR_MSG) {
            Some(msg) => (ScanResult::Error, msg.to_string()),
            None => (
                ScanResult::Error,
                format!("The ConfigMap '{name}' was missing 'error-msg'"),
            ),
        },
        None => (
            ScanResult::Error,
            format!("The ConfigMap '{name}' was missing 'exit-code'"),
        ),
    }
}

/// Detects scanner failures that make aggregation pointless. Unschedulable
/// targets are not treated as failures here.
pub fn check_unknown_error(cm: &ConfigMap) -> Result<()> {
    let name = &cm.metadata.name;
    let Some(exit_code) = cm.value(labels::KEY_EXIT_CODE) else {
        return Err(CoreError::non_retriable(format!(
            "the ConfigMap '{name}' was missing 'exit-code'"
        )));
    };

    match exit_code {
        labels::EXIT_COMPLIANT | labels::EXIT_NON_COMPLIANT | labels::EXIT_UNSCHEDULABLE => Ok(()),
        other => match cm.value(labels::KEY_ERROR_MSG) {
            Some(msg) => Err(CoreError::non_retriable(msg)),
            None => Err(CoreError::non_retriable(format!(
                "the ConfigMap '{name}' was missing 'error-msg' despite exitcode {other}"
            ))),
        },
    }
}

/// Whether the aggregator has annotated the artifact with its result.
pub fn result_ready(cm: &ConfigMap) -> bool {
    cm.metadata.has_annotation(labels::ARTIFACT_RESULT)
}

/// Reads the result recorded by the aggregator. Errors carry their message.
pub fn recorded_result(cm: &ConfigMap) -> (ScanResult, Option<String>) {
    let name = &cm.metadata.name;
    let Some(raw) = cm.metadata.annotations.get(labels::ARTIFACT_RESULT) else {
        return (
            ScanResult::Error,
            Some(format!("the ConfigMap '{name}' annotation was missing the result key")),
        );
    };

    match raw.parse::<ScanResult>() {
        Ok(result @ (ScanResult::Compliant | ScanResult::NonCompliant | ScanResult::NotApplicable)) => {
            (result, None)
        }
        _ => {
            let msg = cm
                .metadata
                .annotations
                .get(labels::ARTIFACT_ERROR)
                .cloned()
                .unwrap_or_else(|| format!("Undefined error in ConfigMap {name}"));
            (ScanResult::Error, Some(msg))
        }
    }
}
