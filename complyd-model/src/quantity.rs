use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};

/// A storage size such as `1Gi` or `500M`, kept in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(u64);

const SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
];

impl Quantity {
    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::InvalidQuantity(raw.to_string()));
        }

        let (digits, multiplier) = SUFFIXES
            .iter()
            .find_map(|(suffix, mult)| {
                trimmed.strip_suffix(suffix).map(|rest| (rest, *mult))
            })
            .unwrap_or((trimmed, 1));

        let value: u64 = digits
            .parse()
            .map_err(|_| ModelError::InvalidQuantity(raw.to_string()))?;
        value
            .checked_mul(multiplier)
            .map(Quantity)
            .ok_or_else(|| ModelError::InvalidQuantity(raw.to_string()))
    }
}

impl FromStr for Quantity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
