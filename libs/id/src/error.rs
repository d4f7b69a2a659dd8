//! Errors produced while parsing identifiers.

use thiserror::Error;

/// Why an identifier string was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Nothing to parse.
    #[error("identifier cannot be empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("identifier missing '_' separator")]
    MissingSeparator,

    /// The prefix names a different entity.
    #[error("wrong identifier prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The part after the prefix is not a ULID.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A counter value outside its allowed range.
    #[error("{kind} must be at least {min}, got {actual}")]
    OutOfRange {
        kind: &'static str,
        min: i64,
        actual: i64,
    },
}

impl IdError {
    /// True when the input named another entity type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
