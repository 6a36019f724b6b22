//! Identity conflict detection
//!
//! Two records conflict when they would land on the same file of the local
//! filesystem (same folded identity) while being different documents.
//! Detection is pure: the merge engine executes the rename.

use std::fmt;

use tandem_core::domain::{ChangeRecord, DocPath, Platform, Side};
use tracing::debug;

/// Description of a detected identity conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdConflictInfo {
    /// Side reporting the incoming change
    pub side: Side,
    pub incoming: DocPath,
    pub existing: DocPath,
    pub platform: Platform,
}

impl IdConflictInfo {
    pub fn description(&self) -> String {
        format!(
            "Identity conflict between new {} {} and existing {}: both would be the same file on {}",
            self.side, self.incoming, self.existing, self.platform
        )
    }
}

impl fmt::Display for IdConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Detects identity conflicts between records
pub struct IdentityConflictDetector;

impl IdentityConflictDetector {
    /// Whether `incoming` and `existing` are different documents sharing an
    /// identity
    ///
    /// Records bound to the same remote document are never in conflict: a
    /// case-only rename of a document is legitimate.
    pub fn exists_between(incoming: &ChangeRecord, existing: &ChangeRecord) -> bool {
        let same_remote = matches!(
            (&incoming.remote, &existing.remote),
            (Some(a), Some(b)) if a.id == b.id
        );

        incoming.id == existing.id && incoming.path != existing.path && !same_remote
    }

    /// Checks whether merging `incoming` over `existing` would shadow a
    /// different document
    ///
    /// `was` is the source of a move. Moving a record onto its own identity
    /// (a case-only rename) is not a conflict.
    pub fn detect(
        side: Side,
        incoming: &ChangeRecord,
        existing: Option<&ChangeRecord>,
        was: Option<&ChangeRecord>,
        platform: Platform,
    ) -> Option<IdConflictInfo> {
        let existing = existing?;

        if existing.deleted {
            return None;
        }
        if let Some(was) = was {
            if was.path == existing.path {
                return None;
            }
        }
        if !Self::exists_between(incoming, existing) {
            return None;
        }

        let info = IdConflictInfo {
            side,
            incoming: incoming.path.clone(),
            existing: existing.path.clone(),
            platform,
        };
        debug!(%side, incoming = %info.incoming, existing = %info.existing, "Identity conflict detected");
        Some(info)
    }
}
