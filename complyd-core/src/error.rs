use complyd_model::ModelError;
use thiserror::Error;

/// Failures reported by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("conflict updating {kind} {key}: stored version {current}, given {given}")]
    Conflict {
        kind: &'static str,
        key: String,
        current: u64,
        given: u64,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Quota or admission rejections.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, StoreError::Forbidden(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("trust material error: {0}")]
    Trust(String),

    /// A scan workload could not be placed on its target.
    #[error("Couldn't schedule scan pod '{pod}': {message}")]
    Unschedulable { pod: String, message: String },

    /// Surfaced into scan status instead of being retried.
    #[error("{0}")]
    NonRetriable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn non_retriable(message: impl Into<String>) -> Self {
        CoreError::NonRetriable(message.into())
    }

    /// Whether the controller should retry the operation that produced this error.
    ///
    /// Anything not explicitly classified is treated as transient.
    pub fn is_retriable(&self) -> bool {
        match self {
            CoreError::NonRetriable(_) | CoreError::Model(_) => false,
            CoreError::Store(store) => !matches!(
                store,
                StoreError::Forbidden(_) | StoreError::Invalid(_)
            ),
            _ => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::Store(err) if err.is_not_found())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CoreError::Store(err) if err.is_already_exists())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
