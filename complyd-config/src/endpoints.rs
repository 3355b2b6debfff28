//! Settings for the two processes that run inside scan-scoped workloads: the
//! result receiver and the collector that uploads to it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use complyd_core::artifact::COMPRESSION_THRESHOLD;
use complyd_core::config::RetryConfig;

/// Directories the receiver never treats as result directories.
pub const IGNORED_DIRS: &[&str] = &["lost+found"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointConfigError {
    #[error("rotation must keep at least one result directory")]
    ZeroRotation,
    #[error("port must not be zero")]
    ZeroPort,
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("invalid result server uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
}

/// PEM files presented and trusted on one side of the mutual TLS channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Root CA of the scan; peers must chain to it.
    pub ca: PathBuf,
}

/// Result receiver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Root of the raw result storage mount.
    pub root: PathBuf,
    pub port: u16,
    /// Scan the receiver collects for; logged with every upload.
    pub owner: String,
    /// Rescan index; uploads land in `<root>/<scan_index>/`.
    pub scan_index: u64,
    /// Number of index directories kept after rotation.
    pub rotation: u16,
    pub tls: TlsPaths,
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), EndpointConfigError> {
        if self.rotation == 0 {
            return Err(EndpointConfigError::ZeroRotation);
        }
        if self.port == 0 {
            return Err(EndpointConfigError::ZeroPort);
        }
        if self.owner.trim().is_empty() {
            return Err(EndpointConfigError::Empty("owner"));
        }
        Ok(())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(self.scan_index.to_string())
    }
}

/// Collector settings: where the scanner left its output and where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Full ARF report, uploaded to the receiver.
    pub arf_file: PathBuf,
    /// XCCDF results, recorded in the artifact for aggregation.
    pub results_file: PathBuf,
    /// Scanner command output, recorded as the error message on failure.
    pub output_file: PathBuf,
    pub exit_code_file: PathBuf,
    pub warnings_file: PathBuf,
    /// Artifact name, also sent as the report name header.
    pub report_name: String,
    pub scan: String,
    pub namespace: String,
    pub owner_uid: String,
    /// Node the results came from, empty for platform scans.
    pub source: String,
    /// Where the artifact record is written for the store adapter.
    pub artifact_file: PathBuf,
    pub result_server_uri: String,
    pub tls: TlsPaths,
    /// Payloads larger than this are bzip2 compressed.
    pub compression_threshold: usize,
    /// How long to wait for the scanner to produce each file.
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl CollectorConfig {
    pub fn default_compression_threshold() -> usize {
        COMPRESSION_THRESHOLD
    }

    pub fn validate(&self) -> Result<Url, EndpointConfigError> {
        for (field, value) in [
            ("report name", &self.report_name),
            ("scan", &self.scan),
            ("namespace", &self.namespace),
        ] {
            if value.trim().is_empty() {
                return Err(EndpointConfigError::Empty(field));
            }
        }
        let uri = Url::parse(&self.result_server_uri).map_err(|err| EndpointConfigError::InvalidUri {
            uri: self.result_server_uri.clone(),
            reason: err.to_string(),
        })?;
        if uri.scheme() != "https" {
            return Err(EndpointConfigError::InvalidUri {
                uri: self.result_server_uri.clone(),
                reason: "results are only uploaded over https".into(),
            });
        }
        Ok(uri)
    }
}
