//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! sync engine. Their implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IMetadataStore`] - Record storage, revision history and change feed
//! - [`IWriter`] / [`IReader`] - Applying records to and streaming content from a replica
//! - [`IWatcher`] - Change detection on a replica
//! - [`IIgnoreMatcher`] - Local ignore rules

pub mod ignore;
pub mod metadata_store;
pub mod side;

pub use ignore::{IIgnoreMatcher, NoIgnore};
pub use metadata_store::{Change, IMetadataStore, LockGuard, RevisionConflict};
pub use side::{
    IReader, IWatcher, IWriter, IdleWatcher, Progress, ReadStream, SideAdapter, WriteError,
    WriteErrorKind,
};
