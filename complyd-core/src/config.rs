use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune controller behaviour.
///
/// All fields carry defaults so a deployment only needs to supply the values
/// it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Namespace every per-scan resource is created in.
    pub namespace: String,
    /// Requeue cadence and worker count for the reconcile loop.
    pub reconcile: ReconcileConfig,
    /// Backoff policy wrapped around object writes.
    pub retry: RetryConfig,
    /// Container images used for scan, aggregator and result server workloads.
    pub images: WorkloadImages,
    /// Defaults applied to raw result storage claims.
    pub storage: StorageDefaults,
    /// Result receiver endpoint settings.
    pub result_server: ResultServerSettings,
    /// In-process event fan-out sizing.
    pub events: EventBusConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "complyd".into(),
            reconcile: ReconcileConfig::default(),
            retry: RetryConfig::default(),
            images: WorkloadImages::default(),
            storage: StorageDefaults::default(),
            result_server: ResultServerSettings::default(),
            events: EventBusConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Poll interval used whenever something is not ready yet.
    pub requeue_after_ms: u64,
    /// Number of concurrent reconcile workers. Each scan is still handled by
    /// at most one worker at a time.
    pub workers: usize,
    /// First delay applied after a reconcile returns an error.
    pub error_backoff_base_ms: u64,
    /// Upper bound for the per-key error backoff.
    pub error_backoff_max_ms: u64,
}

impl ReconcileConfig {
    pub fn requeue_after(&self) -> Duration {
        Duration::from_millis(self.requeue_after_ms)
    }

    /// Shorter delay used while waiting for a freshly created object to show up.
    pub fn requeue_not_found(&self) -> Duration {
        Duration::from_millis(self.requeue_after_ms / 2)
    }

    pub fn error_backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let scaled = self.error_backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(scaled.min(self.error_backoff_max_ms))
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_after_ms: 10_000,
            workers: 4,
            error_backoff_base_ms: 5,
            error_backoff_max_ms: 1_000 * 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Growth factor between consecutive attempts.
    pub multiplier: f32,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Anchor delay before jitter for the given zero-based retry number.
    pub fn anchor_delay_ms(&self, retry: u16) -> u64 {
        let factor = f64::from(self.multiplier.max(1.0)).powi(i32::from(retry));
        let scaled = (self.backoff_base_ms as f64) * factor;
        scaled.min(self.backoff_max_ms as f64).max(0.0) as u64
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            backoff_base_ms: 500,
            backoff_max_ms: 60 * 1_000,
            multiplier: 1.5,
            jitter_ratio: 0.5,
        }
    }
}

/// Images for every workload the controller launches. Built once at process
/// start and handed to the workload manager.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkloadImages {
    pub scanner: String,
    pub log_collector: String,
    pub aggregator: String,
    pub result_server: String,
    /// Used when a scan does not name its own content image.
    pub content: String,
}

impl Default for WorkloadImages {
    fn default() -> Self {
        Self {
            scanner: "ghcr.io/complyd/openscap-ocp:latest".into(),
            log_collector: "ghcr.io/complyd/complyd:latest".into(),
            aggregator: "ghcr.io/complyd/complyd:latest".into(),
            result_server: "ghcr.io/complyd/complyd:latest".into(),
            content: "ghcr.io/complyd/compliance-content:latest".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageDefaults {
    pub size: String,
    pub access_mode: String,
    pub storage_class_name: Option<String>,
    /// Result directories the receiver keeps per scan.
    pub rotation: u16,
}

impl Default for StorageDefaults {
    fn default() -> Self {
        Self {
            size: "1Gi".into(),
            access_mode: "ReadWriteOnce".into(),
            storage_class_name: None,
            rotation: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResultServerSettings {
    pub port: u16,
    /// Validity of the per-scan CA and leaf certificates.
    pub cert_validity_days: u32,
}

impl Default for ResultServerSettings {
    fn default() -> Self {
        Self {
            port: 8443,
            cert_validity_days: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}
