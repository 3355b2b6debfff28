use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidScanType(String),
    InvalidQuantity(String),
    InvalidName(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidScanType(value) => {
                write!(f, "invalid scan type: {value}")
            }
            ModelError::InvalidQuantity(value) => {
                write!(f, "invalid storage quantity: {value}")
            }
            ModelError::InvalidName(msg) => write!(f, "invalid name: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
