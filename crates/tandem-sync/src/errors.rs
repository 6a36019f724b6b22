//! Errors raised while applying a change to one side
//!
//! Every failure of a writer or of the store during `apply` is wrapped into
//! a [`SyncError`]. Its [`SyncErrorCode`] decides whether the driver blocks,
//! retries later or gives up on the change.

use std::fmt;
use std::time::Duration;

use tandem_core::config::RetryConfig;
use tandem_core::domain::{ChangeRecord, DocPath, Side};
use tandem_core::ports::{WriteError, WriteErrorKind};
use thiserror::Error;

// ============================================================================
// SyncErrorCode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncErrorCode {
    MissingPermissions,
    NoDiskSpace,
    NoRemoteSpace,
    NeedsRemoteMerge,
    UserActionRequired,
    RevokedAuthorization,
    Unreachable,
    ConflictingName,
    IncompatibleDoc,
    ExcludedDir,
    UnsyncedParentMove,
    Unknown,
}

impl SyncErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncErrorCode::MissingPermissions => "MissingPermissions",
            SyncErrorCode::NoDiskSpace => "NoDiskSpace",
            SyncErrorCode::NoRemoteSpace => "NoRemoteSpace",
            SyncErrorCode::NeedsRemoteMerge => "NeedsRemoteMerge",
            SyncErrorCode::UserActionRequired => "UserActionRequired",
            SyncErrorCode::RevokedAuthorization => "RevokedAuthorization",
            SyncErrorCode::Unreachable => "Unreachable",
            SyncErrorCode::ConflictingName => "ConflictingName",
            SyncErrorCode::IncompatibleDoc => "IncompatibleDoc",
            SyncErrorCode::ExcludedDir => "ExcludedDir",
            SyncErrorCode::UnsyncedParentMove => "UnsyncedParentMove",
            SyncErrorCode::Unknown => "UnknownSyncError",
        }
    }

    /// Codes that stop the drain loop until the condition clears
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            SyncErrorCode::MissingPermissions
                | SyncErrorCode::NoDiskSpace
                | SyncErrorCode::NoRemoteSpace
                | SyncErrorCode::NeedsRemoteMerge
                | SyncErrorCode::UserActionRequired
                | SyncErrorCode::RevokedAuthorization
                | SyncErrorCode::Unreachable
        )
    }

    /// Codes the user is told about while the sync is blocked
    pub fn needs_user_action(self) -> bool {
        !matches!(
            self,
            SyncErrorCode::Unreachable | SyncErrorCode::ConflictingName | SyncErrorCode::Unknown
        )
    }
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<WriteErrorKind> for SyncErrorCode {
    fn from(kind: WriteErrorKind) -> Self {
        match kind {
            WriteErrorKind::Unreachable => SyncErrorCode::Unreachable,
            WriteErrorKind::MissingPermissions => SyncErrorCode::MissingPermissions,
            WriteErrorKind::NoDiskSpace => SyncErrorCode::NoDiskSpace,
            WriteErrorKind::NoRemoteSpace => SyncErrorCode::NoRemoteSpace,
            WriteErrorKind::UserActionRequired => SyncErrorCode::UserActionRequired,
            WriteErrorKind::RevokedAuthorization => SyncErrorCode::RevokedAuthorization,
            WriteErrorKind::NeedsRemoteMerge => SyncErrorCode::NeedsRemoteMerge,
            WriteErrorKind::ConflictingName => SyncErrorCode::ConflictingName,
            WriteErrorKind::IncompatibleDoc => SyncErrorCode::IncompatibleDoc,
            WriteErrorKind::ExcludedDir => SyncErrorCode::ExcludedDir,
            WriteErrorKind::UnsyncedParentMove => SyncErrorCode::UnsyncedParentMove,
            WriteErrorKind::Transient | WriteErrorKind::Other => SyncErrorCode::Unknown,
        }
    }
}

// ============================================================================
// SyncError
// ============================================================================

/// A change that could not be applied on `side`
#[derive(Debug, Clone, Error)]
pub struct SyncError {
    pub side: Side,
    pub code: SyncErrorCode,
    pub path: Option<DocPath>,
    pub message: String,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: ", self.code)?;
        if let Some(path) = &self.path {
            write!(f, "{}: ", path)?;
        }
        f.write_str(&self.message)
    }
}

impl SyncError {
    pub fn new(side: Side, code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            side,
            code,
            path: None,
            message: message.into(),
        }
    }

    /// Classifies an error raised while applying `record` on `side`
    pub fn wrap(err: anyhow::Error, side: Side, record: Option<&ChangeRecord>) -> Self {
        let path = record.map(|r| r.path.clone());

        let (code, message) = match err.downcast::<SyncError>() {
            Ok(sync_err) => (sync_err.code, sync_err.message),
            Err(err) => {
                let write_err = match err.downcast::<WriteError>() {
                    Ok(write_err) => write_err,
                    Err(err) => WriteError::from(err),
                };
                (SyncErrorCode::from(write_err.kind), write_err.message)
            }
        };

        Self {
            side,
            code,
            path,
            message,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.code.is_blocking()
    }

    /// How long the driver stays blocked before retrying
    pub fn retry_delay(&self, retry: &RetryConfig, heartbeat: Duration) -> Duration {
        retry_delay(self.code, retry, heartbeat)
    }
}

/// Delay before the blocked driver retries after an error with `code`
pub fn retry_delay(code: SyncErrorCode, retry: &RetryConfig, heartbeat: Duration) -> Duration {
    let secs = |s: u64| Duration::from_secs(s);
    match code {
        SyncErrorCode::Unreachable => secs(retry.unreachable_secs),
        SyncErrorCode::UserActionRequired | SyncErrorCode::RevokedAuthorization => {
            secs(retry.user_action_required_secs)
        }
        SyncErrorCode::MissingPermissions => secs(retry.missing_permissions_secs),
        SyncErrorCode::NoDiskSpace => secs(retry.no_disk_space_secs),
        SyncErrorCode::NoRemoteSpace => secs(retry.no_remote_space_secs),
        SyncErrorCode::ExcludedDir => secs(retry.excluded_dir_secs),
        // The parent's own retry unblocks it
        SyncErrorCode::UnsyncedParentMove => Duration::ZERO,
        _ => heartbeat,
    }
}
