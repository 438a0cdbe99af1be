//! Error types for key parsing and name validation.

use thiserror::Error;

/// Errors that can occur when parsing keys or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// A cluster key is missing the `/` separator.
    #[error("cluster key missing '/' separator: {0}")]
    MissingSeparator(String),

    /// The name exceeds the DNS-1123 label limit.
    #[error("name '{name}' is {len} characters, limit is {max}")]
    TooLong {
        name: String,
        len: usize,
        max: usize,
    },

    /// The name contains characters outside `[a-z0-9-]` or starts/ends with `-`.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
