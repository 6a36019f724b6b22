//! ChangeRecord domain entity
//!
//! A `ChangeRecord` is the canonical, persisted state of one file or folder.
//! Both replicas report changes against it, and the sync driver propagates
//! it to whichever side is behind.
//!
//! ## Revision counters
//!
//! ```text
//!   sides.target   revision both sides must reach
//!   sides.local    last revision reflected on the local filesystem
//!   sides.remote   last revision reflected on the remote service
//!
//!   local == target && remote == target   synchronized
//!   local <  target                       local side must be updated
//!   remote < target                       remote side must be updated
//! ```
//!
//! `target` is owned by the metadata store: every persisted write bumps it
//! by exactly one.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Checksum, DocPath, RecordId};
use super::platform::Platform;
use super::side::Side;

/// Mime type of collaborative notes, edited through an external editor
pub const NOTE_MIME_TYPE: &str = "text/vnd.cozy.note+markdown";

// ============================================================================
// DocType
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    File,
    Folder,
}

impl DocType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocType::File => "file",
            DocType::Folder => "folder",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sides
// ============================================================================

/// Per-side revision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sides {
    pub target: u64,
    pub local: u64,
    pub remote: u64,
}

impl Sides {
    #[must_use]
    pub fn get(&self, side: Side) -> u64 {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }

    pub fn set(&mut self, side: Side, rev: u64) {
        match side {
            Side::Local => self.local = rev,
            Side::Remote => self.remote = rev,
        }
    }

    /// The side whose counter lags behind the other, if any
    #[must_use]
    pub fn outdated_side(&self) -> Option<Side> {
        use std::cmp::Ordering;
        match self.local.cmp(&self.remote) {
            Ordering::Less => Some(Side::Local),
            Ordering::Greater => Some(Side::Remote),
            Ordering::Equal => None,
        }
    }
}

// ============================================================================
// References between records
// ============================================================================

/// Pointer to one stored revision of a record
///
/// Used for `move_from` and `overwrite` so related records are looked up in
/// the store's history instead of being embedded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionRef {
    pub id: RecordId,
    pub target: u64,
}

impl RevisionRef {
    /// Reference to the revision `record` will have once persisted
    #[must_use]
    pub fn next_of(record: &ChangeRecord) -> Self {
        Self {
            id: record.id.clone(),
            target: record.sides.target + 1,
        }
    }

    /// Reference to the revision `record` has in the store
    #[must_use]
    pub fn current_of(record: &ChangeRecord) -> Self {
        Self {
            id: record.id.clone(),
            target: record.sides.target,
        }
    }
}

/// Identity of the matching remote document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: String,
    pub rev: String,
}

// ============================================================================
// Incompatibility
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncompatibilityKind {
    ReservedChars,
    ReservedName,
    ForbiddenLastChar,
    NameMaxBytes,
    DirNameMaxBytes,
    PathMaxBytes,
}

/// A naming rule of the local platform that a record path breaks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incompatibility {
    pub kind: IncompatibilityKind,
    /// Offending component, or the whole path for length violations
    pub name: String,
    /// Path of the offending ancestor or of the record itself
    pub path: String,
    pub doc_type: DocType,
    pub platform: Platform,
    /// Reserved characters found, or the length limit exceeded
    pub detail: Option<String>,
}

// ============================================================================
// ChangeRecord
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: RecordId,
    pub path: DocPath,
    pub doc_type: DocType,
    #[serde(default)]
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub remote: Option<RemoteRef>,
    #[serde(default)]
    pub ino: Option<u64>,
    #[serde(default)]
    pub sides: Sides,
    #[serde(default)]
    pub move_from: Option<RevisionRef>,
    #[serde(default)]
    pub move_to: Option<RecordId>,
    #[serde(default)]
    pub overwrite: Option<RevisionRef>,
    #[serde(default)]
    pub child_move: bool,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub incompatibilities: Vec<Incompatibility>,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ChangeRecord {
    /// Create a record with no revision yet
    #[must_use]
    pub fn new(path: DocPath, doc_type: DocType, platform: Platform) -> Self {
        Self {
            id: RecordId::for_path(&path, platform),
            path,
            doc_type,
            checksum: None,
            size: None,
            executable: false,
            class: None,
            mime: None,
            tags: BTreeSet::new(),
            created_at: None,
            updated_at: Utc::now(),
            remote: None,
            ino: None,
            sides: Sides::default(),
            move_from: None,
            move_to: None,
            overwrite: None,
            child_move: false,
            trashed: false,
            deleted: false,
            incompatibilities: Vec::new(),
            errors: 0,
            metadata: None,
        }
    }

    #[must_use]
    pub fn file(path: DocPath, checksum: Checksum, platform: Platform) -> Self {
        let mut record = Self::new(path, DocType::File, platform);
        record.checksum = Some(checksum);
        record
    }

    #[must_use]
    pub fn folder(path: DocPath, platform: Platform) -> Self {
        Self::new(path, DocType::Folder, platform)
    }

    /// Move this record to a new path, recomputing its identity
    pub fn set_path(&mut self, path: DocPath, platform: Platform) {
        self.id = RecordId::for_path(&path, platform);
        self.path = path;
    }

    pub fn is_file(&self) -> bool {
        self.doc_type == DocType::File
    }

    pub fn is_folder(&self) -> bool {
        self.doc_type == DocType::Folder
    }

    pub fn is_up_to_date(&self, side: Side) -> bool {
        self.sides.get(side) == self.sides.target
    }

    pub fn is_at_least_up_to_date(&self, side: Side) -> bool {
        self.sides.get(side) >= self.sides.target
    }

    /// Whether both sides have seen at least one revision
    pub fn was_synced(&self) -> bool {
        self.sides.local > 0 && self.sides.remote > 0
    }

    pub fn is_note(&self) -> bool {
        self.mime.as_deref() == Some(NOTE_MIME_TYPE) && self.metadata.is_some()
    }

    pub fn has_incompatibilities(&self) -> bool {
        !self.incompatibilities.is_empty()
    }

    /// Record a change observed on `side`
    ///
    /// Counters are copied from `prev` (the stored record) and `side` is
    /// moved to the revision this write will create.
    pub fn mark_side(&mut self, side: Side, prev: Option<&ChangeRecord>) {
        let target = prev.map_or(0, |p| p.sides.target);
        self.sides = prev.map_or_else(Sides::default, |p| p.sides);
        self.sides.set(side, target + 1);
    }

    /// Counters for a record recreated over the tombstone `prev`
    ///
    /// The identity keeps its revision numbering. The other side keeps its
    /// counter only while it has not yet applied the deletion, so the
    /// recreation reaches it as an edit instead of a duplicate add.
    pub fn revive_over(&mut self, side: Side, prev: &ChangeRecord) {
        let other = side.other();
        let other_rev = prev.sides.get(other);
        let deletion_pending = other_rev > 0 && other_rev < prev.sides.target;

        self.sides = Sides {
            target: prev.sides.target,
            ..Sides::default()
        };
        if deletion_pending {
            self.sides.set(other, other_rev);
            if other == Side::Remote && self.remote.is_none() {
                self.remote = prev.remote.clone();
            }
        } else if other == Side::Remote {
            self.remote = None;
        }
        self.sides.set(side, prev.sides.target + 1);
    }

    /// Set both sides to the revision this write will create
    ///
    /// Returns that revision.
    pub fn mark_as_up_to_date(&mut self) -> u64 {
        let rev = self.sides.target + 1;
        self.sides.local = rev;
        self.sides.remote = rev;
        self.errors = 0;
        rev
    }

    /// Keep the most recent modification date of both records
    pub fn assign_max_date(&mut self, prev: &ChangeRecord) {
        if prev.updated_at > self.updated_at {
            self.updated_at = prev.updated_at;
        }
        if self.created_at.is_none() {
            self.created_at = prev.created_at;
        }
    }

    /// Forget the remote document so the next sync recreates it
    pub fn dissociate_remote(&mut self) {
        self.remote = None;
        self.sides.remote = 0;
    }

    /// Forget the local file so the next sync recreates it
    pub fn dissociate_local(&mut self) {
        self.ino = None;
        self.sides.local = 0;
    }

    pub fn dissociate(&mut self, side: Side) {
        match side {
            Side::Local => self.dissociate_local(),
            Side::Remote => self.dissociate_remote(),
        }
    }

    pub fn remove_move_hints(&mut self) {
        self.move_from = None;
        self.move_to = None;
        self.overwrite = None;
        self.child_move = false;
    }
}

/// Both records describe the same content
pub fn same_binary(one: &ChangeRecord, two: &ChangeRecord) -> bool {
    one.checksum.is_some() && one.checksum == two.checksum
}

/// Both file records are equivalent, ignoring bookkeeping fields
pub fn same_file(one: &ChangeRecord, two: &ChangeRecord, platform: Platform) -> bool {
    let executable_matches = !platform.supports_executable_bit() || one.executable == two.executable;

    one.path == two.path
        && one.doc_type == two.doc_type
        && one.checksum == two.checksum
        && one.remote == two.remote
        && one.tags == two.tags
        && one.size == two.size
        && one.trashed == two.trashed
        && one.ino == two.ino
        && executable_matches
}

/// Both folder records are equivalent, ignoring bookkeeping fields
pub fn same_folder(one: &ChangeRecord, two: &ChangeRecord) -> bool {
    one.path == two.path
        && one.doc_type == two.doc_type
        && one.remote == two.remote
        && one.tags == two.tags
        && one.trashed == two.trashed
        && one.ino == two.ino
}
