//! Reconciliation of side changes into the metadata store
//!
//! [`Merge`] is the only component creating or structurally changing
//! records. Each operation reads the stored record, decides whether the
//! reported change is new, a no-op or a conflict, marks the reporting side
//! and persists the result.
//!
//! ## Concurrency
//!
//! Operations touching the same identities are serialized with per-identity
//! async mutexes. A [`RevisionConflict`] raised by the store means another
//! writer (usually the sync driver) updated a record in between; the whole
//! operation is retried against fresh data.
//!
//! ## Conflicts
//!
//! Conflicts are resolved by renaming one of the documents to a conflict
//! copy on the side holding it. Identity conflicts (two paths folding to the
//! same local file) are always resolved on the remote side.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use tandem_conflict::{detect_incompatibilities, ConflictNamer, IdentityConflictDetector};
use tandem_core::config::Config;
use tandem_core::domain::{
    same_binary, same_file, same_folder, ChangeRecord, DocType, Platform, RecordId, RevisionRef,
    Side, SidePair,
};
use tandem_core::ports::{IMetadataStore, IWriter, RevisionConflict};

/// Attempts of one operation when the store reports a revision conflict
const MAX_MERGE_ATTEMPTS: u32 = 3;

// ============================================================================
// Per-identity locks
// ============================================================================

#[derive(Default)]
struct IdLocks {
    locks: DashMap<RecordId, Arc<Mutex<()>>>,
}

impl IdLocks {
    /// Locks every identity, in a global order so two operations sharing
    /// identities cannot deadlock
    async fn acquire(&self, mut ids: Vec<RecordId>) -> Vec<OwnedMutexGuard<()>> {
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.locks.entry(id).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Forgets locks nobody holds or waits for
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

async fn retry_on_conflict<T, F, Fut>(operation: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Err(e) if attempt < MAX_MERGE_ATTEMPTS && RevisionConflict::is(&e) => {
                debug!(operation, attempt, error = %e, "Record changed while merging, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

// ============================================================================
// Field inheritance
// ============================================================================

fn inherit_content(doc: &mut ChangeRecord, from: &ChangeRecord) {
    if doc.size.is_none() {
        doc.size = from.size;
    }
    if doc.class.is_none() {
        doc.class = from.class.clone();
    }
    if doc.mime.is_none() {
        doc.mime = from.mime.clone();
    }
}

/// Tags are owned by the remote side: an empty set means "unknown"
fn inherit_identifiers(doc: &mut ChangeRecord, from: &ChangeRecord) {
    if doc.tags.is_empty() {
        doc.tags = from.tags.clone();
    }
    if doc.remote.is_none() {
        doc.remote = from.remote.clone();
    }
    if doc.ino.is_none() {
        doc.ino = from.ino;
    }
}

/// Counters of `doc` written over whatever is stored at its identity
fn mark_over(doc: &mut ChangeRecord, side: Side, stored: Option<&ChangeRecord>) {
    match stored {
        Some(tombstone) if tombstone.deleted => doc.revive_over(side, tombstone),
        stored => doc.mark_side(side, stored),
    }
}

// ============================================================================
// Merge
// ============================================================================

pub struct Merge {
    store: Arc<dyn IMetadataStore>,
    writers: SidePair<Arc<dyn IWriter>>,
    namer: ConflictNamer,
    platform: Platform,
    sync_root: PathBuf,
    locks: IdLocks,
}

impl Merge {
    pub fn new(
        store: Arc<dyn IMetadataStore>,
        writers: SidePair<Arc<dyn IWriter>>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            writers,
            namer: ConflictNamer::new(config.conflicts.max_base_name_chars),
            platform: config.sync.platform(),
            sync_root: config.sync.root.clone(),
            locks: IdLocks::default(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    async fn serialized<T, F, Fut>(
        &self,
        ids: Vec<RecordId>,
        operation: &'static str,
        f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guards = self.locks.acquire(ids).await;
        let result = retry_on_conflict(operation, f).await;
        drop(guards);
        self.locks.prune();
        result
    }

    fn check_compatibility(&self, record: &mut ChangeRecord) {
        record.incompatibilities = detect_incompatibilities(record, &self.sync_root, self.platform);
        if record.has_incompatibilities() {
            debug!(path = %record.path, count = record.incompatibilities.len(), "Record is incompatible with the local platform");
        }
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// A file was added on `side`
    pub async fn add_file(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        self.serialized(vec![doc.id.clone()], "add_file", || {
            self.add_file_once(side, doc)
        })
        .await
    }

    /// A file content or metadata changed on `side`
    pub async fn update_file(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        self.serialized(vec![doc.id.clone()], "update_file", || {
            self.update_file_once(side, doc)
        })
        .await
    }

    /// A folder was added or updated on `side`
    pub async fn put_folder(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        self.serialized(vec![doc.id.clone()], "put_folder", || {
            self.put_folder_once(side, doc)
        })
        .await
    }

    /// A file was moved from `was` to `doc` on `side`
    pub async fn move_file(&self, side: Side, doc: &ChangeRecord, was: &ChangeRecord) -> Result<()> {
        self.serialized(vec![doc.id.clone(), was.id.clone()], "move_file", || {
            self.move_file_once(side, doc, was)
        })
        .await
    }

    /// A folder was moved from `was` to `doc` on `side`, with its content
    pub async fn move_folder(
        &self,
        side: Side,
        doc: &ChangeRecord,
        was: &ChangeRecord,
    ) -> Result<()> {
        self.serialized(vec![doc.id.clone(), was.id.clone()], "move_folder", || {
            self.move_folder_once(side, doc, was)
        })
        .await
    }

    /// The file at `was` was moved to the trash of `side`, as `doc`
    pub async fn trash_file(
        &self,
        side: Side,
        was: &ChangeRecord,
        doc: &ChangeRecord,
    ) -> Result<()> {
        self.serialized(vec![was.id.clone()], "trash_file", || {
            self.do_trash(side, was, doc, DocType::File)
        })
        .await
    }

    /// The folder at `was` was moved to the trash of `side`, as `doc`
    pub async fn trash_folder(
        &self,
        side: Side,
        was: &ChangeRecord,
        doc: &ChangeRecord,
    ) -> Result<()> {
        self.serialized(vec![was.id.clone()], "trash_folder", || {
            self.trash_folder_once(side, was, doc)
        })
        .await
    }

    pub async fn delete_file(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        self.serialized(vec![doc.id.clone()], "delete_file", || {
            self.delete_file_once(side, doc)
        })
        .await
    }

    pub async fn delete_folder(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        self.serialized(vec![doc.id.clone()], "delete_folder", || {
            self.delete_folder_once(side, doc)
        })
        .await
    }

    /// A trashed file at `was` was restored to `doc`
    pub async fn restore_file(
        &self,
        side: Side,
        was: &ChangeRecord,
        doc: &ChangeRecord,
    ) -> Result<()> {
        self.serialized(vec![doc.id.clone(), was.id.clone()], "restore_file", || async move {
            if was.id != doc.id {
                if let Err(e) = self.delete_file_once(side, was).await {
                    warn!(path = %was.path, error = %e, "Could not forget the trashed file");
                }
            }
            self.update_file_once(side, doc).await
        })
        .await
    }

    /// A trashed folder at `was` was restored to `doc`
    pub async fn restore_folder(
        &self,
        side: Side,
        was: &ChangeRecord,
        doc: &ChangeRecord,
    ) -> Result<()> {
        self.serialized(vec![doc.id.clone(), was.id.clone()], "restore_folder", || async move {
            if was.id != doc.id {
                if let Err(e) = self.delete_folder_once(side, was).await {
                    warn!(path = %was.path, error = %e, "Could not forget the trashed folder");
                }
            }
            self.put_folder_once(side, doc).await
        })
        .await
    }

    /// Renames the remote document blocking the upload of `doc`
    ///
    /// The renamed document comes back through the remote watcher as a new
    /// document; nothing is persisted here.
    pub async fn resolve_remote_conflict(&self, doc: &ChangeRecord) -> Result<()> {
        let new_path = self.namer.conflict_path(&doc.path)?;
        let mut blocker = doc.clone();
        blocker.remote = None;

        warn!(path = %doc.path, conflict = %new_path, "Renaming conflicting remote document");
        self.writers
            .remote
            .rename_conflicting(&mut blocker, &new_path)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    /// Creates missing or deleted ancestors of `doc`, top down
    async fn ensure_parent_exists(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        for ancestor in doc.path.ancestors() {
            let id = RecordId::for_path(&ancestor, self.platform);
            let stored = self.store.get(&id).await?;
            if matches!(&stored, Some(record) if !record.deleted) {
                continue;
            }

            let mut folder = ChangeRecord::folder(ancestor, self.platform);
            mark_over(&mut folder, side, stored.as_ref());
            self.check_compatibility(&mut folder);

            debug!(path = %folder.path, %side, "Creating missing parent folder");
            self.store.put(folder).await?;
        }
        Ok(())
    }

    /// Persists `doc` as a new record, possibly over a tombstone
    async fn put_new(
        &self,
        side: Side,
        doc: &ChangeRecord,
        tombstone: Option<&ChangeRecord>,
    ) -> Result<()> {
        let mut record = doc.clone();
        record.remove_move_hints();
        record.trashed = false;
        record.deleted = false;
        record.errors = 0;
        mark_over(&mut record, side, tombstone);

        self.ensure_parent_exists(side, &record).await?;
        self.check_compatibility(&mut record);

        info!(path = %record.path, %side, doc_type = %record.doc_type, "New record");
        self.store.put(record).await?;
        Ok(())
    }

    /// Renames the document of `record` on `side` to a conflict path
    ///
    /// The returned record keeps the identifiers and counters of `record`.
    async fn rename_on_side(&self, side: Side, record: &ChangeRecord) -> Result<ChangeRecord> {
        let new_path = self.namer.conflict_path(&record.path)?;
        warn!(%side, path = %record.path, conflict = %new_path, "Resolving conflict by renaming");

        let mut renamed = record.clone();
        self.writers
            .get(side)
            .rename_conflicting(&mut renamed, &new_path)
            .await?;
        renamed.set_path(new_path, self.platform);
        renamed.remove_move_hints();
        renamed.errors = 0;
        Ok(renamed)
    }

    /// Renames `record` away on `side` and turns it into a new document
    /// only known to that side
    async fn rename_away(&self, side: Side, record: &ChangeRecord) -> Result<ChangeRecord> {
        let mut conflict = self.rename_on_side(side, record).await?;
        conflict.trashed = false;
        conflict.deleted = false;
        conflict.mark_side(side, None);
        match side {
            Side::Local => conflict.remote = None,
            Side::Remote => conflict.ino = None,
        }
        self.check_compatibility(&mut conflict);
        Ok(conflict)
    }

    async fn resolve_conflict(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        let conflict = self.rename_away(side, doc).await?;
        self.ensure_parent_exists(side, &conflict).await?;
        self.store.put(conflict).await?;
        Ok(())
    }

    /// Keeps the local `doc` in place and the remote content of `file` as a
    /// conflict copy
    async fn keep_both_versions(&self, mut doc: ChangeRecord, file: &ChangeRecord) -> Result<()> {
        let conflict = self.rename_away(Side::Remote, file).await?;
        doc.dissociate_remote();
        self.check_compatibility(&mut doc);
        self.store.bulk_put(vec![doc, conflict]).await?;
        Ok(())
    }

    async fn resolve_identity_conflict(
        &self,
        side: Side,
        doc: &ChangeRecord,
        existing: &ChangeRecord,
    ) -> Result<()> {
        warn!(
            %side,
            incoming = %doc.path,
            existing = %existing.path,
            platform = %self.platform,
            "Identity conflict"
        );
        match side {
            Side::Remote => self.resolve_conflict(Side::Remote, doc).await,
            // The local change comes back once the remote rename reaches the
            // local side
            Side::Local => self.move_remote_away(existing).await,
        }
    }

    /// Renames `existing` on the remote side and records it as a remote move
    async fn move_remote_away(&self, existing: &ChangeRecord) -> Result<()> {
        let mut dst = self.rename_on_side(Side::Remote, existing).await?;
        dst.mark_side(Side::Remote, None);
        self.move_recursively(Side::Remote, dst, existing).await
    }

    fn identity_conflict(
        &self,
        side: Side,
        doc: &ChangeRecord,
        existing: Option<&ChangeRecord>,
        was: Option<&ChangeRecord>,
    ) -> bool {
        IdentityConflictDetector::detect(side, doc, existing, was, self.platform).is_some()
    }

    // ========================================================================
    // Files
    // ========================================================================

    async fn add_file_once(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        let file = match self.store.get(&doc.id).await? {
            None => return self.put_new(side, doc, None).await,
            Some(tombstone) if tombstone.deleted => {
                return self.put_new(side, doc, Some(&tombstone)).await
            }
            Some(file) => file,
        };

        if self.identity_conflict(side, doc, Some(&file), None) {
            return self.resolve_identity_conflict(side, doc, &file).await;
        }
        if file.is_folder() {
            return self.resolve_conflict(side, doc).await;
        }

        let mut record = doc.clone();
        record.remove_move_hints();
        record.mark_side(side, Some(&file));
        record.assign_max_date(&file);

        if same_binary(&record, &file) {
            inherit_content(&mut record, &file);
            inherit_identifiers(&mut record, &file);
            if same_file(&record, &file, self.platform) {
                debug!(path = %record.path, %side, "Up to date");
                return Ok(());
            }
            self.check_compatibility(&mut record);
            self.store.put(record).await?;
            return Ok(());
        }

        if side == Side::Local && file.sides.local > 0 {
            return self.resolve_initial_add(doc, record, &file).await;
        }
        self.resolve_conflict(side, doc).await
    }

    /// A known file has new local content at startup: it was modified while
    /// the application was not running
    async fn resolve_initial_add(
        &self,
        doc: &ChangeRecord,
        marked: ChangeRecord,
        file: &ChangeRecord,
    ) -> Result<()> {
        if file.sides.remote == 0 || file.sides.local >= file.sides.remote {
            debug!(path = %doc.path, "File changed locally while offline");
            return self.update_file_once(Side::Local, doc).await;
        }

        let last_local = self
            .store
            .get_revision(&RevisionRef {
                id: file.id.clone(),
                target: file.sides.local,
            })
            .await?;
        if matches!(&last_local, Some(prev) if same_binary(prev, doc)) {
            debug!(path = %doc.path, "Only the remote content changed");
            return Ok(());
        }

        self.keep_both_versions(marked, file).await
    }

    async fn update_file_once(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        let file = match self.store.get(&doc.id).await? {
            None => return self.put_new(side, doc, None).await,
            Some(tombstone) if tombstone.deleted => {
                return self.put_new(side, doc, Some(&tombstone)).await
            }
            Some(file) => file,
        };

        if file.is_folder() {
            bail!("Cannot update file {}: a folder exists at this path", doc.path);
        }

        let mut record = doc.clone();
        record.mark_side(side, Some(&file));
        record.assign_max_date(&file);
        if record.move_from.is_none() {
            record.move_from = file.move_from.clone();
            record.overwrite = file.overwrite.clone();
        }
        inherit_identifiers(&mut record, &file);
        if !self.platform.supports_executable_bit() {
            record.executable = file.executable;
        }

        if same_binary(&record, &file) {
            inherit_content(&mut record, &file);
            if same_file(&record, &file, self.platform) {
                debug!(path = %record.path, %side, "Up to date");
                return Ok(());
            }
        } else if !file.is_at_least_up_to_date(side) {
            if side == Side::Local && file.is_note() {
                return self.keep_both_versions(record, &file).await;
            }

            self.resolve_conflict(side, doc).await?;
            if side == Side::Remote {
                let mut old = file.clone();
                old.dissociate_remote();
                self.store.put(old).await?;
            }
            return Ok(());
        }

        self.check_compatibility(&mut record);
        self.store.put(record).await?;
        Ok(())
    }

    async fn move_file_once(&self, side: Side, doc: &ChangeRecord, was: &ChangeRecord) -> Result<()> {
        let other = side.other();
        let was = match self.store.get(&was.id).await? {
            Some(was) if !was.deleted => was,
            _ => {
                debug!(src = %was.path, dst = %doc.path, "Move source is gone, adding destination");
                return self.add_file_once(side, doc).await;
            }
        };

        if was.sides.get(side) == 0 {
            return self.add_file_once(side, doc).await;
        }

        if was.sides.get(other) == 0 {
            // Unknown on the other side: an addition at the destination
            let mut added = doc.clone();
            added.remove_move_hints();
            if doc.id == was.id {
                return self.update_file_once(side, &added).await;
            }
            debug!(src = %was.path, dst = %doc.path, "Move of an unsynced file, re-adding");
            self.store.erase_if_target(&was.id, was.sides.target).await?;
            return self.add_file_once(side, &added).await;
        }

        let mut dst = doc.clone();
        dst.remove_move_hints();
        dst.assign_max_date(&was);
        if same_binary(&dst, &was) {
            inherit_content(&mut dst, &was);
        }
        inherit_identifiers(&mut dst, &was);

        if dst.id == was.id {
            dst.mark_side(side, Some(&was));
            dst.move_from = Some(RevisionRef::current_of(&was));
            self.check_compatibility(&mut dst);
            info!(src = %was.path, dst = %dst.path, %side, "File renamed in place");
            self.store.put(dst).await?;
            return Ok(());
        }

        let existing = self.store.get(&dst.id).await?;
        if self.identity_conflict(side, &dst, existing.as_ref(), Some(&was)) {
            if let Some(existing) = &existing {
                return self.resolve_identity_conflict(side, doc, existing).await;
            }
        }

        mark_over(&mut dst, side, existing.as_ref());
        dst.move_from = Some(RevisionRef::next_of(&was));

        let mut src = was.clone();
        src.mark_side(side, Some(&was));
        src.deleted = true;
        src.errors = 0;

        if let Some(file) = existing.as_ref().filter(|f| !f.deleted) {
            if same_file(&dst, file, self.platform) {
                debug!(path = %dst.path, %side, "Up to date");
                return Ok(());
            }
            if file.path == dst.path && doc.overwrite.is_none() {
                let mut renamed = self.rename_on_side(side, &dst).await?;
                renamed.mark_side(side, None);
                renamed.move_from = Some(RevisionRef::next_of(&was));
                self.check_compatibility(&mut renamed);
                src.move_to = Some(renamed.id.clone());
                self.store.bulk_put(vec![src, renamed]).await?;
                return Ok(());
            }
            dst.overwrite = Some(RevisionRef::current_of(file));
        }

        src.move_to = Some(dst.id.clone());
        self.ensure_parent_exists(side, &dst).await?;
        self.check_compatibility(&mut dst);

        info!(src = %src.path, dst = %dst.path, %side, "File moved");
        self.store.bulk_put(vec![src, dst]).await?;
        Ok(())
    }

    // ========================================================================
    // Folders
    // ========================================================================

    async fn put_folder_once(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        let folder = match self.store.get(&doc.id).await? {
            None => return self.put_new(side, doc, None).await,
            Some(tombstone) if tombstone.deleted => {
                return self.put_new(side, doc, Some(&tombstone)).await
            }
            Some(folder) => folder,
        };

        if folder.is_file() {
            return self.resolve_conflict(side, doc).await;
        }
        if self.identity_conflict(side, doc, Some(&folder), None) {
            return self.resolve_identity_conflict(side, doc, &folder).await;
        }

        let mut record = doc.clone();
        record.remove_move_hints();
        record.mark_side(side, Some(&folder));
        record.assign_max_date(&folder);
        inherit_identifiers(&mut record, &folder);

        if same_folder(&record, &folder) {
            debug!(path = %record.path, %side, "Up to date");
            return Ok(());
        }
        self.check_compatibility(&mut record);
        self.store.put(record).await?;
        Ok(())
    }

    async fn move_folder_once(
        &self,
        side: Side,
        doc: &ChangeRecord,
        was: &ChangeRecord,
    ) -> Result<()> {
        let was = match self.store.get(&was.id).await? {
            Some(was) if !was.deleted && was.sides.get(side) > 0 => was,
            _ => {
                debug!(src = %was.path, dst = %doc.path, "Move source unknown, adding destination");
                return self.put_folder_once(side, doc).await;
            }
        };

        let mut folder = doc.clone();
        folder.remove_move_hints();
        folder.assign_max_date(&was);
        inherit_identifiers(&mut folder, &was);

        if folder.id == was.id {
            folder.mark_side(side, Some(&was));
            self.ensure_parent_exists(side, &folder).await?;
            return self.move_recursively(side, folder, &was).await;
        }

        let existing = self.store.get(&folder.id).await?;
        if self.identity_conflict(side, &folder, existing.as_ref(), Some(&was)) {
            if let Some(existing) = &existing {
                return self.resolve_identity_conflict(side, doc, existing).await;
            }
        }

        if let Some(dst) = existing.as_ref().filter(|d| !d.deleted) {
            let local_only = side == Side::Local && dst.sides.remote == 0;
            if dst.path == folder.path && doc.overwrite.is_none() && !local_only {
                let mut renamed = self.rename_on_side(side, &folder).await?;
                renamed.mark_side(side, None);
                self.ensure_parent_exists(side, &renamed).await?;
                return self.move_recursively(side, renamed, &was).await;
            }
            folder.overwrite = Some(RevisionRef::current_of(dst));
        }

        mark_over(&mut folder, side, existing.as_ref());
        self.ensure_parent_exists(side, &folder).await?;

        info!(src = %was.path, dst = %folder.path, %side, "Folder moved");
        self.move_recursively(side, folder, &was).await
    }

    /// Moves `was` and every live descendant under `dst`
    ///
    /// `dst` comes with its counters already marked. Descendants moved along
    /// become child moves: the other side only refreshes their identifiers
    /// once the parent move has been applied.
    async fn move_recursively(
        &self,
        side: Side,
        mut dst: ChangeRecord,
        was: &ChangeRecord,
    ) -> Result<()> {
        let other = side.other();
        let children = self.store.by_recursive_path(&was.id).await?;
        let mut bulk = Vec::with_capacity(2 * children.len() + 2);
        let mut erased = Vec::new();

        if was.sides.get(other) == 0 {
            dst.move_from = None;
            if dst.id != was.id {
                erased.push(was.id.clone());
            }
        } else if dst.id == was.id {
            dst.move_from = Some(RevisionRef::current_of(was));
        } else {
            let mut src = was.clone();
            src.mark_side(side, Some(was));
            src.deleted = true;
            src.errors = 0;
            src.move_to = Some(dst.id.clone());
            dst.move_from = Some(RevisionRef::next_of(was));
            bulk.push(src);
        }
        self.check_compatibility(&mut dst);
        let (from_path, to_path) = (was.path.clone(), dst.path.clone());
        bulk.push(dst);

        for child in children {
            let Some(new_path) = child.path.rebase(&from_path, &to_path) else {
                continue;
            };
            let mut moved = child.clone();
            moved.set_path(new_path, self.platform);
            moved.remove_move_hints();
            moved.errors = 0;

            let same_id = moved.id == child.id;
            let base = if same_id {
                None
            } else {
                self.store.get(&moved.id).await?
            };

            if child.sides.get(other) == 0 {
                // Never synced on the other side: added anew at its destination
                if same_id {
                    moved.mark_side(side, Some(&child));
                } else {
                    mark_over(&mut moved, side, base.as_ref());
                    erased.push(child.id.clone());
                }
            } else if same_id {
                let mut hop = child.clone();
                hop.mark_side(side, Some(&child));
                hop.child_move = true;
                hop.errors = 0;

                let mut persisted_hop = hop.clone();
                persisted_hop.sides.target += 1;
                moved.mark_side(side, Some(&persisted_hop));
                moved.move_from = Some(RevisionRef::current_of(&persisted_hop));
                bulk.push(hop);
            } else {
                let mut src = child.clone();
                src.mark_side(side, Some(&child));
                src.deleted = true;
                src.child_move = true;
                src.errors = 0;
                src.move_to = Some(moved.id.clone());

                mark_over(&mut moved, side, base.as_ref());
                moved.move_from = Some(RevisionRef::next_of(&child));
                bulk.push(src);
            }

            self.check_compatibility(&mut moved);
            bulk.push(moved);
        }

        debug!(src = %from_path, dst = %to_path, records = bulk.len(), "Persisting folder move");
        self.store.bulk_put(bulk).await?;
        for id in erased {
            self.store.erase(&id).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Trash and deletion
    // ========================================================================

    async fn do_trash(
        &self,
        side: Side,
        was: &ChangeRecord,
        doc: &ChangeRecord,
        doc_type: DocType,
    ) -> Result<()> {
        let record = match self.store.get(&was.id).await? {
            Some(record) if !record.deleted => record,
            _ => {
                debug!(path = %was.path, %side, "Nothing to trash");
                return Ok(());
            }
        };

        if record.doc_type != doc_type {
            error!(
                path = %record.path,
                expected = %doc_type,
                found = %record.doc_type,
                "Trashed document type does not match the record"
            );
            return Ok(());
        }

        let unsynced_edit = side == Side::Remote && record.is_file() && !same_binary(doc, &record);
        if record.is_file() && (unsynced_edit || !record.is_up_to_date(side)) {
            info!(path = %record.path, %side, "Trashed file was modified on the other side, keeping it");
            let mut kept = record.clone();
            kept.dissociate(side);
            kept.errors = 0;
            self.store.put(kept).await?;
            return Ok(());
        }

        let mut trashed = record.clone();
        trashed.mark_side(side, Some(&record));
        trashed.trashed = true;
        trashed.deleted = true;
        trashed.errors = 0;

        info!(path = %trashed.path, %side, "Trashed");
        self.store.put(trashed).await?;
        Ok(())
    }

    async fn trash_folder_once(
        &self,
        side: Side,
        was: &ChangeRecord,
        doc: &ChangeRecord,
    ) -> Result<()> {
        let folder = match self.store.get(&was.id).await? {
            Some(folder) if !folder.deleted => folder,
            _ => return Ok(()),
        };
        if folder.is_file() {
            return self.do_trash(side, was, doc, DocType::Folder).await;
        }

        let children = self.store.by_recursive_path(&folder.id).await?;
        if children.iter().any(|c| c.is_file() && !c.is_up_to_date(side)) {
            info!(path = %folder.path, %side, "Trashed folder has content changed on the other side, restoring it");
            let mut restored = folder.clone();
            restored.mark_side(side.other(), Some(&folder));
            restored.sides.set(side, 0);
            restored.trashed = false;
            self.store.put(restored).await?;
            return Ok(());
        }

        let mut bulk: Vec<ChangeRecord> = children
            .iter()
            .map(|child| {
                let mut tombstone = child.clone();
                tombstone.mark_side(side, Some(child));
                tombstone.deleted = true;
                tombstone.errors = 0;
                tombstone
            })
            .collect();

        let mut trashed = folder.clone();
        trashed.mark_side(side, Some(&folder));
        trashed.trashed = true;
        trashed.deleted = true;
        trashed.errors = 0;
        bulk.push(trashed);

        info!(path = %folder.path, %side, descendants = children.len(), "Folder trashed");
        self.store.bulk_put(bulk).await?;
        Ok(())
    }

    async fn delete_file_once(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        let file = match self.store.get(&doc.id).await? {
            Some(file) if !file.deleted && file.sides.get(side) > 0 => file,
            _ => {
                debug!(path = %doc.path, %side, "Nothing to delete");
                return Ok(());
            }
        };

        if !file.is_up_to_date(side) {
            info!(path = %file.path, %side, "Deleted document was modified on the other side, keeping it");
            let mut kept = file.clone();
            kept.dissociate(side);
            kept.errors = 0;
            self.store.put(kept).await?;
            return Ok(());
        }

        let mut tombstone = file.clone();
        tombstone.mark_side(side, Some(&file));
        tombstone.deleted = true;
        tombstone.errors = 0;

        info!(path = %tombstone.path, %side, "Deleted");
        self.store.put(tombstone).await?;
        Ok(())
    }

    async fn delete_folder_once(&self, side: Side, doc: &ChangeRecord) -> Result<()> {
        let folder = match self.store.get(&doc.id).await? {
            Some(folder) if !folder.deleted && folder.sides.get(side) > 0 => folder,
            _ => {
                debug!(path = %doc.path, %side, "Nothing to delete");
                return Ok(());
            }
        };

        let children = self.store.by_recursive_path(&folder.id).await?;
        let mut preserved: HashSet<RecordId> = HashSet::new();
        let mut bulk = Vec::with_capacity(children.len() + 1);

        // Children before parents, so preserving a child preserves its parent
        for node in children.iter().rev().chain(std::iter::once(&folder)) {
            if preserved.contains(&node.id) || !node.is_up_to_date(side) {
                let mut kept = node.clone();
                kept.dissociate(side);
                kept.errors = 0;
                if let Some(parent) = node.id.parent() {
                    preserved.insert(parent);
                }
                bulk.push(kept);
            } else {
                let mut tombstone = node.clone();
                tombstone.mark_side(side, Some(node));
                tombstone.deleted = true;
                tombstone.errors = 0;
                bulk.push(tombstone);
            }
        }

        if !preserved.is_empty() {
            info!(path = %folder.path, %side, "Deleted folder has content modified on the other side, keeping it");
        }
        info!(path = %folder.path, %side, descendants = children.len(), "Folder deleted");
        self.store.bulk_put(bulk).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::domain::Sides;

    #[tokio::test]
    async fn test_retry_on_conflict_retries_revision_conflicts_only() {
        let mut calls = 0;
        let result: Result<u32> = retry_on_conflict("test", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(anyhow::Error::new(RevisionConflict {
                        id: RecordId::from_stored("a"),
                        expected: 1,
                        stored: 2,
                    }))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: Result<()> = retry_on_conflict("test", || {
            calls += 1;
            async { Err(anyhow::anyhow!("disk full")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_gives_up() {
        let mut calls = 0;
        let result: Result<()> = retry_on_conflict("test", || {
            calls += 1;
            async {
                Err(anyhow::Error::new(RevisionConflict {
                    id: RecordId::from_stored("a"),
                    expected: 1,
                    stored: 2,
                }))
            }
        })
        .await;
        assert!(RevisionConflict::is(&result.unwrap_err()));
        assert_eq!(calls, MAX_MERGE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_id_locks_are_pruned_once_released() {
        let locks = IdLocks::default();
        let guards = locks
            .acquire(vec![
                RecordId::from_stored("b"),
                RecordId::from_stored("a"),
                RecordId::from_stored("b"),
            ])
            .await;
        assert_eq!(guards.len(), 2);
        locks.prune();
        assert_eq!(locks.locks.len(), 2);

        drop(guards);
        locks.prune();
        assert!(locks.locks.is_empty());
    }

    #[test]
    fn test_inherit_identifiers_keeps_known_values() {
        use tandem_core::domain::{DocPath, RemoteRef};

        let mut from = ChangeRecord::folder(DocPath::new("a").unwrap(), Platform::Linux);
        from.tags.insert("work".into());
        from.ino = Some(7);
        from.remote = Some(RemoteRef {
            id: "r".into(),
            rev: "1".into(),
        });

        let mut doc = ChangeRecord::folder(DocPath::new("a").unwrap(), Platform::Linux);
        doc.ino = Some(9);
        inherit_identifiers(&mut doc, &from);
        assert_eq!(doc.ino, Some(9));
        assert_eq!(doc.remote, from.remote);
        assert!(doc.tags.contains("work"));
    }

    #[test]
    fn test_mark_over_tombstone_revives() {
        use tandem_core::domain::DocPath;

        let mut tombstone = ChangeRecord::folder(DocPath::new("a").unwrap(), Platform::Linux);
        tombstone.sides = Sides {
            target: 4,
            local: 4,
            remote: 4,
        };
        tombstone.deleted = true;

        let mut doc = ChangeRecord::folder(DocPath::new("a").unwrap(), Platform::Linux);
        mark_over(&mut doc, Side::Remote, Some(&tombstone));
        assert_eq!(doc.sides.target, 4);
        assert_eq!(doc.sides.remote, 5);
        assert_eq!(doc.sides.local, 0);
    }
}
