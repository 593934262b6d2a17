//! Structured error types for binary parsing.
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::BuildId;
use thiserror::Error;

/// Errors produced while reading symbols or metadata out of on-disk
/// binaries. Callers treat these as a failed load for one Dso; they never
/// abort sample iteration.
#[derive(Error, Debug)]
pub enum BinaryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed file {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("{0} doesn't contain a symbol table")]
    NoSymbolTable(String),

    #[error("{0} has no build id note")]
    NoBuildId(String),

    #[error("build id mismatch for {path}: expected {expected}, found {found}")]
    BuildIdMismatch {
        path: String,
        expected: BuildId,
        found: BuildId,
    },
}

impl BinaryError {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        BinaryError::Malformed {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
