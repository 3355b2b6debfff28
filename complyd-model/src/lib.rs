//! Core data model definitions shared across complyd crates.
//!
//! Every object the orchestrator reads or writes is described here as a plain
//! struct carrying an [`ObjectMeta`]. The types intentionally mirror the shape
//! of Kubernetes-style resources (metadata, spec, status) so that the object
//! store port in `complyd-core` can stay generic over them.
#![allow(missing_docs)]

pub mod check;
pub mod cluster;
pub mod error;
pub mod event;
pub mod labels;
pub mod meta;
pub mod quantity;
pub mod remediation;
pub mod scan;

// Intentionally curated re-exports for downstream consumers.
pub use check::{CheckStatus, ComplianceCheck};
pub use cluster::{
    ClaimPhase, ConfigMap, Container, Deployment, DeploymentSpec, Node, NodeSpec,
    Pod, PodCondition, PodPhase, PodSpec, PodStatus, Secret, Service, ServiceSpec,
    StorageClaim, StorageClaimSpec, StorageClaimStatus,
};
pub use error::{ModelError, Result as ModelResult};
pub use event::{Event, EventType};
pub use meta::{LabelSelector, Labels, Object, ObjectKey, ObjectMeta, ObjectReference, OwnerReference};
pub use quantity::Quantity;
pub use remediation::{
    ComplianceRemediation, RemediationPayload, RemediationSpec, RemediationState,
    RemediationStatus,
};
pub use scan::{
    RawResultStorage, Scan, ScanPhase, ScanResult, ScanSpec, ScanStatus, ScanType,
    StorageReference,
};
