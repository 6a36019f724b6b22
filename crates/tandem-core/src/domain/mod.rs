//! Domain entities and business logic
//!
//! This module contains the core domain types for Tandem:
//! - Sides and platform naming rules
//! - Newtypes for validated paths, identities and checksums
//! - The `ChangeRecord` entity and its revision bookkeeping
//! - Domain-specific error types

pub mod errors;
pub mod newtypes;
pub mod platform;
pub mod record;
pub mod side;

// Re-export commonly used types
pub use errors::DomainError;
pub use newtypes::*;
pub use platform::Platform;
pub use record::{
    same_binary, same_file, same_folder, ChangeRecord, DocType, Incompatibility,
    IncompatibilityKind, RemoteRef, RevisionRef, Sides, NOTE_MIME_TYPE,
};
pub use side::{Side, SidePair};
