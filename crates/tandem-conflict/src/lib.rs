//! Tandem Conflict - Naming conflicts between the two replicas
//!
//! Provides:
//! - Identity conflict detection (paths folding to the same local file)
//! - Conflict copy naming
//! - Platform naming restrictions (reserved characters and names, lengths)

pub mod detector;
pub mod error;
pub mod incompatibility;
pub mod namer;

pub use detector::{IdConflictInfo, IdentityConflictDetector};
pub use error::ConflictError;
pub use incompatibility::{detect_incompatibilities, PathRestrictions};
pub use namer::{is_conflict_name, ConflictNamer};
