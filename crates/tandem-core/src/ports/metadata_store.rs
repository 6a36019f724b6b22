//! Metadata store port (driven/secondary port)
//!
//! This module defines the contract of the store holding every
//! `ChangeRecord`, their revision history and the change feed consumed by
//! the sync driver.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//!   The one error callers must classify, [`RevisionConflict`], is a typed
//!   error recovered with `downcast_ref`.
//! - `put` is optimistic: the record must carry the `sides.target` currently
//!   stored, and the store persists it with `target + 1`.
//! - `LockGuard` is an RAII guard: dropping it releases the sync lock.

use thiserror::Error;

use crate::domain::{ChangeRecord, DocPath, RecordId, RevisionRef};

// ============================================================================
// Change feed
// ============================================================================

/// One entry of the change feed: the latest revision of a record
#[derive(Debug, Clone)]
pub struct Change {
    /// Store-wide sequence number of this revision
    pub seq: u64,
    pub record: ChangeRecord,
}

// ============================================================================
// RevisionConflict
// ============================================================================

/// Optimistic concurrency failure: the record changed since it was read
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Revision conflict on {id}: expected target {expected}, stored target is {stored}")]
pub struct RevisionConflict {
    pub id: RecordId,
    pub expected: u64,
    pub stored: u64,
}

impl RevisionConflict {
    /// Whether `err` (or one of its causes) is a revision conflict
    pub fn is(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.downcast_ref::<RevisionConflict>().is_some())
    }
}

// ============================================================================
// LockGuard
// ============================================================================

/// RAII handle for the store-wide sync lock
///
/// When this handle is dropped, the lock is released so another drain loop
/// can acquire it.
pub struct LockGuard {
    release_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// The callback will be invoked exactly once when the guard is dropped.
    pub fn new(release_fn: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release_fn: Some(Box::new(release_fn)),
        }
    }

    /// Explicitly releases the lock, consuming the guard
    pub fn release(mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            release_fn();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            release_fn();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.release_fn.is_some())
            .finish()
    }
}

// ============================================================================
// IMetadataStore trait
// ============================================================================

/// Port trait for the record store
///
/// ## Implementation Notes
///
/// - Tombstones (records with `deleted` set) are returned by `get`,
///   `get_by_path` and `changes_since` until they are erased.
/// - A revision stays reachable through `get_revision` while a side may
///   still be diffed against it (from the lowest non-zero side counter of
///   the live record) or while a live record's `move_from` or `overwrite`
///   points at it. Older history may be pruned.
/// - `wait_for_changes` must be cancel-safe: dropping the future stops the
///   wait.
#[async_trait::async_trait]
pub trait IMetadataStore: Send + Sync {
    /// Retrieves the live record with the given identity
    async fn get(&self, id: &RecordId) -> anyhow::Result<Option<ChangeRecord>>;

    /// Retrieves the live record at the exact given path
    async fn get_by_path(&self, path: &DocPath) -> anyhow::Result<Option<ChangeRecord>>;

    /// Retrieves one stored revision of a record
    async fn get_revision(&self, rev: &RevisionRef) -> anyhow::Result<Option<ChangeRecord>>;

    /// Retrieves the revision of `record` stored `steps` writes ago
    async fn previous_revision(
        &self,
        record: &ChangeRecord,
        steps: u64,
    ) -> anyhow::Result<Option<ChangeRecord>> {
        let Some(target) = record.sides.target.checked_sub(steps) else {
            return Ok(None);
        };
        if target == 0 {
            return Ok(None);
        }
        self.get_revision(&RevisionRef {
            id: record.id.clone(),
            target,
        })
        .await
    }

    /// Retrieves every live, non-deleted descendant of `id`, sorted by path
    async fn by_recursive_path(&self, id: &RecordId) -> anyhow::Result<Vec<ChangeRecord>>;

    /// Persists one record
    ///
    /// # Errors
    /// Fails with [`RevisionConflict`] when `record.sides.target` differs
    /// from the stored target (0 for a new record).
    async fn put(&self, record: ChangeRecord) -> anyhow::Result<ChangeRecord>;

    /// Persists several records atomically
    ///
    /// Either all records are written or none is.
    async fn bulk_put(&self, records: Vec<ChangeRecord>) -> anyhow::Result<Vec<ChangeRecord>>;

    /// Removes the live record
    ///
    /// Revisions other records still reference stay reachable.
    async fn erase(&self, id: &RecordId) -> anyhow::Result<()>;

    /// Removes the live record only if it is still at `target`
    ///
    /// # Errors
    /// Fails with [`RevisionConflict`] when a newer revision was written
    /// meanwhile. A missing record is not an error.
    async fn erase_if_target(&self, id: &RecordId, target: u64) -> anyhow::Result<()>;

    /// Latest revision of every live record changed after `since`, in
    /// sequence order
    async fn changes_since(&self, since: u64) -> anyhow::Result<Vec<Change>>;

    /// Waits until a change with a sequence greater than `since` exists
    ///
    /// Returns the latest sequence number.
    async fn wait_for_changes(&self, since: u64) -> anyhow::Result<u64>;

    /// Latest sequence number assigned by the store
    async fn update_seq(&self) -> anyhow::Result<u64>;

    /// Acquires the store-wide sync lock on behalf of `owner`
    async fn lock(&self, owner: &str) -> anyhow::Result<LockGuard>;

    /// Last sequence number fully processed by the sync driver
    async fn checkpoint(&self) -> anyhow::Result<u64>;

    async fn set_checkpoint(&self, seq: u64) -> anyhow::Result<()>;
}
