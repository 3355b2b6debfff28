use crate::meta::{impl_object, ObjectMeta};

/// An opaque fix; `kind` tells the applier how to interpret `body`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RemediationPayload {
    pub kind: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RemediationSpec {
    /// Apply intent; owned by the operator, never flipped by the controller.
    pub apply: bool,
    pub current: RemediationPayload,
    pub outdated: Option<RemediationPayload>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RemediationState {
    #[default]
    Pending,
    NotApplied,
    Applied,
    Outdated,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct RemediationStatus {
    pub application_state: RemediationState,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ComplianceRemediation {
    pub metadata: ObjectMeta,
    pub spec: RemediationSpec,
    pub status: RemediationStatus,
}

impl_object!(ComplianceRemediation, "ComplianceRemediation");
