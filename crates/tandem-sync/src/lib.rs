//! Tandem Sync - Reconciliation and synchronization engine
//!
//! Provides:
//! - Validation and merging of changes reported by either side
//! - Dependency ordering of pending changes
//! - A drain loop applying changes to the side that is behind
//! - Error classification and retry policy
//!
//! ## Modules
//!
//! - [`prep`] - Validates raw side changes before merging them
//! - [`merge`] - Folds side changes into the metadata store
//! - [`graph`] - Classifies pending changes and orders them
//! - [`engine`] - Sync driver applying changes through the side writers
//! - [`lifecycle`] - Start/stop state machine and blocking
//! - [`errors`] - Sync error codes and retry delays
//! - [`filesystem`] - Local filesystem side adapter (atomic writes, trash)
//! - [`ignore`] - Gitignore-style rules for local changes

pub mod engine;
pub mod errors;
pub mod filesystem;
pub mod graph;
pub mod ignore;
pub mod lifecycle;
pub mod merge;
pub mod prep;

pub use engine::{SyncEngine, SyncEvent};
pub use errors::{SyncError, SyncErrorCode};
pub use filesystem::LocalSide;
pub use graph::{classify, Classified, DependencyGraph, Operation, OperationKind};
pub use ignore::GlobIgnore;
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use merge::Merge;
pub use prep::{Prep, PrepError};
