//! Replica ports (driven/secondary ports)
//!
//! Each replica exposes a writer that applies records to it, a reader that
//! streams file content out of it, and a watcher that feeds its changes to
//! the merge engine.
//!
//! ## Design Notes
//!
//! - Writers return a typed [`WriteError`] because the sync driver picks
//!   its retry policy from the error kind.
//! - There is no back-reference between the two sides. Content transfers
//!   receive the peer's reader explicitly.
//! - Writers take `&mut ChangeRecord` so adapters can record identifiers
//!   assigned on their side (remote id and revision, inode).

use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncRead;

use crate::domain::{ChangeRecord, DocPath, Side};

// ============================================================================
// WriteError
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteErrorKind {
    /// The replica could not be reached at all
    Unreachable,
    /// A network hiccup worth retrying immediately
    Transient,
    MissingPermissions,
    NoDiskSpace,
    NoRemoteSpace,
    /// Terms of service or similar acceptance pending
    UserActionRequired,
    RevokedAuthorization,
    /// The remote revision moved on since the record was merged
    NeedsRemoteMerge,
    /// A document with the same name already exists on the replica
    ConflictingName,
    IncompatibleDoc,
    ExcludedDir,
    /// The parent folder is being moved and is not synced yet
    UnsyncedParentMove,
    Other,
}

/// Failure reported by a writer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
}

impl WriteError {
    pub fn new(kind: WriteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(WriteErrorKind::Other, message)
    }

    /// Worth retrying right away, without blocking the sync
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, WriteErrorKind::Transient)
    }
}

impl From<std::io::Error> for WriteError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EBUSY) => {
                WriteErrorKind::MissingPermissions
            }
            Some(libc::ENOSPC) => WriteErrorKind::NoDiskSpace,
            Some(libc::ENAMETOOLONG) | Some(libc::EILSEQ) => WriteErrorKind::IncompatibleDoc,
            _ => match err.kind() {
                ErrorKind::PermissionDenied => WriteErrorKind::MissingPermissions,
                ErrorKind::AlreadyExists => WriteErrorKind::ConflictingName,
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::Interrupted
                | ErrorKind::TimedOut => WriteErrorKind::Transient,
                _ => WriteErrorKind::Other,
            },
        };

        Self::new(kind, err.to_string())
    }
}

impl From<anyhow::Error> for WriteError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<std::io::Error>() {
            Ok(io) => io.into(),
            Err(err) => Self::other(format!("{err:#}")),
        }
    }
}

// ============================================================================
// IReader
// ============================================================================

/// Byte stream of a file with its known length
pub struct ReadStream {
    pub length: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("length", &self.length)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait IReader: Send + Sync {
    /// Opens the content of `record` as stored on this replica
    async fn create_read_stream(&self, record: &ChangeRecord) -> anyhow::Result<ReadStream>;
}

// ============================================================================
// IWriter
// ============================================================================

/// Callback receiving the number of bytes transferred so far
pub type Progress<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Port trait applying records to one replica
#[async_trait::async_trait]
pub trait IWriter: Send + Sync {
    /// Creates a file, reading its content from the peer replica
    async fn add_file(
        &self,
        record: &mut ChangeRecord,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError>;

    /// Replaces a file's content, reading it from the peer replica
    ///
    /// `previous` is the revision this replica last reflected, when known.
    async fn overwrite_file(
        &self,
        record: &mut ChangeRecord,
        previous: Option<&ChangeRecord>,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError>;

    /// Updates file metadata (executable bit, dates, tags) without content
    async fn update_file_metadata(&self, record: &mut ChangeRecord) -> Result<(), WriteError>;

    async fn add_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError>;

    async fn update_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError>;

    /// Moves the document found at `from.path` to `record.path`
    async fn move_record(
        &self,
        record: &mut ChangeRecord,
        from: &ChangeRecord,
    ) -> Result<(), WriteError>;

    /// Refreshes the replica identifiers of a record moved by its ancestor
    async fn assign_new_revision(&self, record: &mut ChangeRecord) -> Result<(), WriteError>;

    /// Moves a file (or folder) to the replica's trash
    async fn trash(&self, record: &mut ChangeRecord) -> Result<(), WriteError>;

    /// Removes a folder once its content is gone
    async fn delete_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError>;

    /// Renames a document out of the way of a conflicting one
    async fn rename_conflicting(
        &self,
        record: &mut ChangeRecord,
        new_path: &DocPath,
    ) -> Result<(), WriteError>;

    /// Whether the replica is reachable
    async fn ping(&self) -> bool {
        true
    }
}

// ============================================================================
// IWatcher
// ============================================================================

/// Source of change events for one replica
#[async_trait::async_trait]
pub trait IWatcher: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    fn is_running(&self) -> bool;
}

/// Watcher that never reports anything, for replicas fed by other means
#[derive(Debug, Default)]
pub struct IdleWatcher {
    running: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl IWatcher for IdleWatcher {
    async fn start(&self) -> anyhow::Result<()> {
        self.running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}

// ============================================================================
// SideAdapter
// ============================================================================

/// Everything the sync driver needs to talk to one replica
#[derive(Clone)]
pub struct SideAdapter {
    pub side: Side,
    pub writer: Arc<dyn IWriter>,
    pub reader: Arc<dyn IReader>,
    pub watcher: Arc<dyn IWatcher>,
}

impl std::fmt::Debug for SideAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideAdapter")
            .field("side", &self.side)
            .field("watching", &self.watcher.is_running())
            .finish()
    }
}
