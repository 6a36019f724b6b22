//! Error types for the conflict helpers

use tandem_core::domain::DomainError;
use thiserror::Error;

/// Errors that can occur while building conflict copies
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// The conflict copy name is not a valid path
    #[error("invalid conflict path: {0}")]
    InvalidPath(#[from] DomainError),
}
