//! Result collector running next to the scanner in every scan workload.
//!
//! Waits for the scanner to leave its exit code, uploads the full report to
//! the scan's receiver and records the per-target artifact the controller
//! aggregates.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{StatusCode, header};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use complyd_config::{CollectorConfig, EndpointConfigError};
use complyd_core::{
    CoreError,
    artifact::{self, ArtifactSpec},
    retry::with_retry,
};
use complyd_model::{ConfigMap, Scan, ScanSpec, labels};

use crate::receiver::{BZIP2_ENCODING, REPORT_NAME_HEADER};
use crate::tls::{self, TlsError};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    Config(#[from] EndpointConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("timed out waiting for {0}")]
    Timeout(PathBuf),

    #[error("cancelled while waiting for {0}")]
    Cancelled(PathBuf),

    #[error("couldn't read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("failed to build artifact: {0}")]
    Artifact(#[from] CoreError),

    #[error("failed to encode artifact: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload to result server failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("result server answered {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

impl UploadError {
    /// Transport failures and server-side errors are worth another attempt;
    /// a rejected request will be rejected again.
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Transport(_) => true,
            UploadError::Rejected { status, .. } => status.is_server_error(),
        }
    }
}

/// Bytes ready to leave the pod, compressed when they were too large.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

impl Payload {
    pub fn prepare(raw: Vec<u8>, threshold: usize) -> Result<Self, CoreError> {
        if raw.len() > threshold {
            let bytes = artifact::compress(&raw)?;
            debug!(target: "collector", raw = raw.len(), compressed = bytes.len(), "compressed payload");
            Ok(Self {
                bytes,
                compressed: true,
            })
        } else {
            Ok(Self {
                bytes: raw,
                compressed: false,
            })
        }
    }
}

/// What a finished collection produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOutcome {
    pub exit_code: String,
    /// Whether the full report was sent to the receiver.
    pub uploaded: bool,
    pub artifact_file: PathBuf,
}

/// Waits until `path` exists with content, then returns its bytes.
pub async fn wait_for_file(
    path: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, CollectError> {
    let poll = async {
        loop {
            match fs::metadata(path).await {
                Ok(meta) if meta.len() > 0 => {
                    return fs::read(path).await.map_err(|source| CollectError::Read {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CollectError::Read {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(CollectError::Cancelled(path.to_path_buf())),
        res = tokio::time::timeout(timeout, poll) => {
            res.unwrap_or_else(|_| Err(CollectError::Timeout(path.to_path_buf())))
        }
    }
}

/// Warnings are optional; a missing or unreadable file means none.
pub async fn read_warnings(path: &Path) -> String {
    match fs::read_to_string(path).await {
        Ok(contents) => contents.trim_matches('\n').to_string(),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(target: "collector", path = %path.display(), error = %err, "ignoring unreadable warnings file");
            }
            String::new()
        }
    }
}

/// Exit codes other than compliant and non-compliant mean the scanner itself
/// failed.
pub fn exit_code_is_error(exit_code: &str) -> bool {
    exit_code != labels::EXIT_COMPLIANT && exit_code != labels::EXIT_NON_COMPLIANT
}

/// Mutual-TLS client for the scan's receiver.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    url: Url,
    report_name: String,
}

impl Uploader {
    pub fn new(client: reqwest::Client, url: Url, report_name: impl Into<String>) -> Self {
        Self {
            client,
            url,
            report_name: report_name.into(),
        }
    }

    pub async fn upload(&self, payload: &Payload) -> Result<(), UploadError> {
        info!(target: "collector", url = %self.url, report = %self.report_name, "uploading to result server");
        let mut request = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, "application/xml")
            .header(REPORT_NAME_HEADER, &self.report_name)
            .body(payload.bytes.clone());
        if payload.compressed {
            request = request.header(header::CONTENT_ENCODING, BZIP2_ENCODING);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected { status, body })
    }
}

/// Scan shell carrying just what the artifact needs from its owner.
fn owning_scan(config: &CollectorConfig) -> Scan {
    let mut scan = Scan::new(&config.namespace, &config.scan, ScanSpec::default());
    scan.metadata.uid = config.owner_uid.clone();
    scan
}

/// Builds the artifact record for this target.
pub fn collected_artifact(
    config: &CollectorConfig,
    exit_code: &str,
    payload_key: &str,
    payload: &[u8],
    warnings: &str,
) -> Result<ConfigMap, CoreError> {
    artifact::build_artifact(
        &owning_scan(config),
        ArtifactSpec {
            name: config.report_name.clone(),
            payload_key,
            source: &config.source,
            payload,
            compress: payload.len() > config.compression_threshold || std::str::from_utf8(payload).is_err(),
            exit_code,
            warnings,
        },
    )
}

async fn write_artifact(path: &Path, artifact: &ConfigMap) -> Result<(), CollectError> {
    let encoded = serde_json::to_vec_pretty(artifact)?;
    let write_err = |source: std::io::Error| CollectError::Write {
        path: path.to_path_buf(),
        source,
    };
    let partial = path.with_extension("part");
    fs::write(&partial, encoded).await.map_err(write_err)?;
    fs::rename(&partial, path).await.map_err(write_err)
}

/// Collects one target's results with an HTTPS client built from the
/// configured trust material.
pub async fn run(config: &CollectorConfig, cancel: &CancellationToken) -> Result<CollectOutcome, CollectError> {
    let url = config.validate()?;
    let client = tls::collector_client(&config.tls).await?;
    collect(config, Uploader::new(client, url, &config.report_name), cancel).await
}

/// Collection with an explicit uploader.
pub async fn collect(
    config: &CollectorConfig,
    uploader: Uploader,
    cancel: &CancellationToken,
) -> Result<CollectOutcome, CollectError> {
    let raw_exit = wait_for_file(&config.exit_code_file, config.timeout, cancel).await?;
    let exit_code = String::from_utf8_lossy(&raw_exit).trim().to_string();
    info!(target: "collector", exit_code = %exit_code, "got exit code from file");
    let warnings = read_warnings(&config.warnings_file).await;

    if exit_code_is_error(&exit_code) {
        let output = wait_for_file(&config.output_file, config.timeout, cancel).await?;
        // error-msg is surfaced verbatim in the scan status, so it stays plain text.
        let output = String::from_utf8_lossy(&output).into_owned();
        let artifact = collected_artifact(config, &exit_code, labels::KEY_ERROR_MSG, output.as_bytes(), &warnings)?;
        write_artifact(&config.artifact_file, &artifact).await?;
        info!(target: "collector", artifact = %config.artifact_file.display(), "recorded scanner error");
        return Ok(CollectOutcome {
            exit_code,
            uploaded: false,
            artifact_file: config.artifact_file.clone(),
        });
    }

    let arf = wait_for_file(&config.arf_file, config.timeout, cancel).await?;
    let report = Payload::prepare(arf, config.compression_threshold)?;
    with_retry(&config.retry, UploadError::is_retriable, || uploader.upload(&report)).await?;
    info!(target: "collector", compressed = report.compressed, "uploaded to result server");

    let results = wait_for_file(&config.results_file, config.timeout, cancel).await?;
    let artifact = collected_artifact(config, &exit_code, labels::KEY_RESULTS, &results, &warnings)?;
    write_artifact(&config.artifact_file, &artifact).await?;
    info!(target: "collector", artifact = %config.artifact_file.display(), "recorded scan results");

    Ok(CollectOutcome {
        exit_code,
        uploaded: true,
        artifact_file: config.artifact_file.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_stay_raw() {
        let payload = Payload::prepare(b"<xml/>".to_vec(), 64).expect("prepare");
        assert!(!payload.compressed);
        assert_eq!(payload.bytes, b"<xml/>");
    }

    #[test]
    fn large_payloads_are_compressed() {
        let raw = vec![b'a'; 4096];
        let payload = Payload::prepare(raw.clone(), 1024).expect("prepare");
        assert!(payload.compressed);
        assert_eq!(artifact::decompress(&payload.bytes).expect("decompress"), raw);
    }

    #[test]
    fn only_compliant_and_non_compliant_are_results() {
        assert!(!exit_code_is_error("0"));
        assert!(!exit_code_is_error("2"));
        assert!(exit_code_is_error("1"));
        assert!(exit_code_is_error(""));
    }

    #[test]
    fn server_errors_are_retried() {
        let rejected = |status| UploadError::Rejected {
            status,
            body: String::new(),
        };
        assert!(rejected(StatusCode::SERVICE_UNAVAILABLE).is_retriable());
        assert!(!rejected(StatusCode::BAD_REQUEST).is_retriable());
    }

    #[tokio::test]
    async fn waiting_gives_up_after_the_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("exit_code");
        let err = wait_for_file(&missing, Duration::from_millis(50), &CancellationToken::new())
            .await
            .expect_err("timeout");
        assert!(matches!(err, CollectError::Timeout(path) if path == missing));
    }

    #[tokio::test]
    async fn empty_files_are_not_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exit_code");
        std::fs::write(&path, "").expect("write");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            wait_for_file(&path, Duration::from_secs(5), &cancel).await,
            Err(CollectError::Cancelled(_))
        ));
    }

    fn config_in(dir: &Path) -> CollectorConfig {
        CollectorConfig {
            arf_file: dir.join("report-arf.xml"),
            results_file: dir.join("report.xml"),
            output_file: dir.join("cmd_output"),
            exit_code_file: dir.join("exit_code"),
            warnings_file: dir.join("warning_output"),
            report_name: "workers-node-a-pod".into(),
            scan: "workers".into(),
            namespace: "compliance".into(),
            owner_uid: "scan-uid".into(),
            source: "node-a".into(),
            artifact_file: dir.join("artifact.json"),
            result_server_uri: "https://localhost:8443/".into(),
            tls: complyd_config::TlsPaths {
                cert: dir.join("tls.crt"),
                key: dir.join("tls.key"),
                ca: dir.join("ca.crt"),
            },
            compression_threshold: 1024,
            timeout: Duration::from_secs(5),
            retry: Default::default(),
        }
    }

    #[test]
    fn binary_results_are_kept_compressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = [b"<xml>".as_slice(), &[0xc3, 0x28], b"</xml>"].concat();
        let cm = collected_artifact(&config_in(dir.path()), "2", labels::KEY_RESULTS, &results, "")
            .expect("artifact");
        assert!(artifact::is_compressed(&cm));
        assert_eq!(artifact::decode_payload(&cm).expect("decode"), Some(results));
    }

    #[tokio::test]
    async fn scanner_error_output_is_recorded_as_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        std::fs::write(&config.exit_code_file, "1").expect("write");
        std::fs::write(&config.output_file, [b"oscap: bad input ".as_slice(), &[0xff]].concat()).expect("write");
        let uploader = Uploader::new(
            reqwest::Client::new(),
            Url::parse(&config.result_server_uri).expect("url"),
            &config.report_name,
        );

        let outcome = collect(&config, uploader, &CancellationToken::new()).await.expect("collect");
        assert!(!outcome.uploaded);
        let cm: ConfigMap =
            serde_json::from_slice(&std::fs::read(&outcome.artifact_file).expect("artifact")).expect("json");
        assert!(!artifact::is_compressed(&cm));
        assert_eq!(cm.value(labels::KEY_ERROR_MSG), Some("oscap: bad input \u{fffd}"));
    }

    #[tokio::test]
    async fn missing_warnings_are_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_warnings(&dir.path().join("warning_output")).await, "");
        std::fs::write(dir.path().join("warning_output"), "kubelet config unreadable\n\n").expect("write");
        assert_eq!(
            read_warnings(&dir.path().join("warning_output")).await,
            "kubelet config unreadable"
        );
    }
}
