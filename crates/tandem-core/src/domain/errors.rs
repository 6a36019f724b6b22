//! Domain error types
//!
//! Structural errors raised while building or validating records. They
//! indicate a bug in an upstream collaborator and are never retried.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid checksum (expected base64 MD5)
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    /// Unknown side name
    #[error("Invalid side: {0}")]
    InvalidSide(String),

    /// Unknown platform name
    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),

    /// A record is missing a field its document type requires
    #[error("Invalid record {path}: {reason}")]
    InvalidRecord {
        /// Path of the offending record
        path: String,
        /// What is wrong with it
        reason: String,
    },
}
