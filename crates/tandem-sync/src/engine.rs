//! Synchronization driver
//!
//! The [`SyncEngine`] drains the store's change feed and applies every
//! pending change to the side that lags behind.
//!
//! ## Sync Flow
//!
//! 1. **Wait**: sleep until the store reports a change past the checkpoint
//! 2. **Batch**: under the store lock, classify the pending changes and
//!    order them with the dependency graph
//! 3. **Apply**: call the writer of the outdated side, then record the new
//!    revision counters and advance the checkpoint
//!
//! ## Failure Handling
//!
//! Errors are wrapped into a [`SyncError`]. Blocking codes stop the drain
//! loop until a retry task unblocks it. Other codes are retried on the next
//! batches until `max_sync_attempts`, after which the change is abandoned.
//!
//! ## Transfer Retry
//!
//! Content transfers retry transient writer errors a few times with a fixed
//! delay before the error is surfaced.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use tandem_core::config::{Config, RetryConfig, SyncConfig};
use tandem_core::domain::{
    same_binary, same_file, same_folder, ChangeRecord, DocPath, RecordId, Side, SidePair,
};
use tandem_core::ports::{
    Change, IIgnoreMatcher, IMetadataStore, RevisionConflict, SideAdapter, WriteError,
};

use crate::errors::{SyncError, SyncErrorCode};
use crate::graph::{classify, Classified, DependencyGraph, Operation, OperationKind};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::merge::Merge;

/// Capacity of the event channel before slow subscribers lag
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// SyncEvent
// ============================================================================

/// Notification published while the driver runs
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStart,
    SyncEnd,
    /// Sequence number of the change being applied
    SyncCurrent(u64),
    TransferStarted {
        side: Side,
        path: DocPath,
    },
    TransferMove {
        side: Side,
        path: DocPath,
        from: DocPath,
    },
    TransferProgress {
        side: Side,
        path: DocPath,
        bytes: u64,
    },
    DeleteFile(DocPath),
    Online,
    Offline,
    UserActionRequired {
        code: SyncErrorCode,
        seq: Option<u64>,
    },
    Fatal(String),
}

/// Answer of the user to a blocking error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserAction {
    Done,
    InProgress,
    Skipped,
}

/// State shared by the changes of one batch
#[derive(Debug, Default)]
struct Batch {
    /// Parents trashed children already waited for
    awaited_parents: HashSet<RecordId>,
}

#[derive(Debug, Clone, Copy)]
enum Transfer<'a> {
    Add,
    /// Replaces the content, with the revision the side last reflected
    Overwrite(Option<&'a ChangeRecord>),
}

// ============================================================================
// Checkpoint helpers
// ============================================================================

/// Advances the checkpoint to `seq`, never backwards
async fn acknowledge(store: &dyn IMetadataStore, seq: u64) -> Result<()> {
    let checkpoint = store.checkpoint().await?;
    if seq > checkpoint {
        store.set_checkpoint(seq).await?;
        trace!(seq, "Checkpoint advanced");
    }
    Ok(())
}

/// Gives up on a change that failed too many times
async fn skip_change(
    store: &dyn IMetadataStore,
    seq: u64,
    record: Option<&ChangeRecord>,
    err: &SyncError,
) -> Result<()> {
    let errors = record.map_or(0, |r| r.errors);
    error!(
        error = %err,
        path = ?record.map(|r| r.path.as_str()),
        seq,
        attempts = errors + 1,
        "Failed to sync too many times, giving up"
    );
    acknowledge(store, seq).await
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Drain loop applying merged changes to the side that is behind
pub struct SyncEngine {
    store: Arc<dyn IMetadataStore>,
    merge: Arc<Merge>,
    ignore: Arc<dyn IIgnoreMatcher>,
    sides: SidePair<SideAdapter>,
    lifecycle: Arc<Lifecycle>,
    events: broadcast::Sender<SyncEvent>,
    sync_config: SyncConfig,
    retry_config: RetryConfig,
    /// Identity under which the store lock is taken
    owner: String,
    /// Held by the drain loop while it runs
    running: Mutex<()>,
    user_actions: StdMutex<Option<mpsc::UnboundedSender<UserAction>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn IMetadataStore>,
        merge: Arc<Merge>,
        ignore: Arc<dyn IIgnoreMatcher>,
        sides: SidePair<SideAdapter>,
        config: &Config,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            merge,
            ignore,
            sides,
            lifecycle: Arc::new(Lifecycle::new()),
            events,
            sync_config: config.sync.clone(),
            retry_config: config.retry.clone(),
            owner: format!("sync-{}", Uuid::new_v4()),
            running: Mutex::new(()),
            user_actions: StdMutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// A stop is in progress
    fn interrupted(&self) -> bool {
        self.lifecycle.state() == LifecycleState::Stopping
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    /// Starts the watchers and drains changes until the engine is stopped
    ///
    /// # Errors
    ///
    /// Fails when a watcher cannot start or a batch fails for a reason
    /// other than stopping. The engine is stopped and `Fatal` is emitted.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;
        let running = self.running.lock().await;

        if let Err(err) = self.start_watchers().await {
            drop(running);
            return Err(self.fatal(err).await);
        }

        if let Err(err) = self.lifecycle.end_start() {
            // Stopped while starting
            if self.lifecycle.will_stop() {
                return Ok(());
            }
            return Err(err.into());
        }
        info!(owner = %self.owner, "Sync started");

        let result = self.run().await;
        drop(running);
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fatal(err).await),
        }
    }

    async fn start_watchers(&self) -> Result<()> {
        for side in Side::ALL {
            self.sides
                .get(side)
                .watcher
                .start()
                .await
                .with_context(|| format!("Failed to start the {side} watcher"))?;
        }
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        while !self.lifecycle.will_stop() {
            self.lifecycle.ready().await;
            if self.lifecycle.will_stop() {
                break;
            }
            if let Err(err) = self.sync(false).await {
                if self.lifecycle.will_stop() {
                    break;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn fatal(&self, err: anyhow::Error) -> anyhow::Error {
        error!(error = %format!("{err:#}"), "Sync fatal");
        self.emit(SyncEvent::Fatal(format!("{err:#}")));
        if let Err(stop_err) = self.stop().await {
            warn!(error = %stop_err, "Failed to stop after fatal error");
        }
        err
    }

    /// Stops the drain loop and both watchers
    ///
    /// Waits for the change being applied to finish.
    pub async fn stop(&self) -> Result<()> {
        if self.lifecycle.will_stop() {
            debug!("Sync already stopping");
            return Ok(());
        }
        self.lifecycle.begin_stop()?;

        for side in Side::ALL {
            if let Err(err) = self.sides.get(side).watcher.stop().await {
                warn!(%side, error = %err, "Failed to stop watcher");
            }
        }

        let _running = self.running.lock().await;
        self.lifecycle.unblock_all();
        if let Ok(mut actions) = self.user_actions.lock() {
            actions.take();
        }
        self.lifecycle.end_stop()?;
        info!("Sync stopped");
        Ok(())
    }

    /// Restarts the engine, returning the handle of the new drain loop
    pub async fn force_sync(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        self.stop().await?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.start().await }))
    }

    // ========================================================================
    // Drain loop
    // ========================================================================

    /// Waits for new changes (unless `manual_run`), then drains them
    pub async fn sync(&self, manual_run: bool) -> Result<()> {
        if !manual_run {
            let checkpoint = self.store.checkpoint().await?;
            let token = self.lifecycle.cancellation_token();
            trace!(checkpoint, "Waiting for changes");
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                seq = self.store.wait_for_changes(checkpoint) => {
                    seq?;
                }
            }
        }

        self.emit(SyncEvent::SyncStart);
        let result = self.sync_batch().await;
        self.emit(SyncEvent::SyncEnd);
        result
    }

    /// Applies pending changes batch after batch until none is left
    pub async fn sync_batch(&self) -> Result<()> {
        while !self.interrupted() {
            self.lifecycle.ready().await;
            if self.interrupted() || self.lifecycle.is_blocked() {
                break;
            }

            let lock = self.store.lock(&self.owner).await?;
            let result = self.drain_once().await;
            drop(lock);

            match result {
                Ok(true) => {}
                Ok(false) => {
                    debug!("No more metadata changes for now");
                    break;
                }
                Err(_) if self.interrupted() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// One batch under the store lock
    ///
    /// Returns whether there were changes to process.
    async fn drain_once(&self) -> Result<bool> {
        let checkpoint = self.store.checkpoint().await?;
        let changes = self.store.changes_since(checkpoint).await?;
        if changes.is_empty() {
            return Ok(false);
        }

        let mut classified = Vec::with_capacity(changes.len());
        for change in changes {
            classified.push(classify(self.store.as_ref(), self.ignore.as_ref(), change).await?);
        }
        let ordered = DependencyGraph::of_changes(classified).into_ordered();
        debug!(count = ordered.len(), checkpoint, "Applying batch");
        let mut batch = Batch::default();

        for item in ordered {
            if self.interrupted() || self.lifecycle.is_blocked() {
                break;
            }

            let checkpoint = self.store.checkpoint().await?;
            if item.seq() < checkpoint {
                match item.kind() {
                    OperationKind::Skip | OperationKind::Null => {}
                    _ => self.defer(&item).await?,
                }
                continue;
            }

            self.emit(SyncEvent::SyncCurrent(item.seq()));
            self.apply(item, &mut batch).await?;
        }
        Ok(true)
    }

    /// Gives a change overtaken by the checkpoint a fresh sequence number
    async fn defer(&self, item: &Classified) -> Result<()> {
        let record = item.record();
        let Some(side) = item.side else {
            return Ok(());
        };

        let mut bumped = record.clone();
        bumped.mark_side(side.other(), Some(record));
        match self.store.put(bumped).await {
            Ok(_) => {
                debug!(path = %record.path, seq = item.seq(), "Change deferred to next batch");
                Ok(())
            }
            Err(err) if RevisionConflict::is(&err) => {
                debug!(path = %record.path, "Deferred change already superseded");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Apply
    // ========================================================================

    async fn apply(&self, item: Classified, batch: &mut Batch) -> Result<()> {
        let Classified {
            change,
            side,
            operation,
        } = item;
        let seq = change.seq;
        let mut record = change.record.clone();
        debug!(path = %record.path, seq, operation = %operation.kind(), "Applying change");

        if matches!(operation, Operation::Skip) {
            if record.deleted
                && !record.was_synced()
                && !self.ignore.should_ignore(&record.path, record.doc_type)
            {
                self.erase_if_unchanged(&record).await?;
                if record.is_file() {
                    self.emit(SyncEvent::DeleteFile(record.path.clone()));
                }
            }
            return acknowledge(self.store.as_ref(), seq).await;
        }

        let Some(side) = side else {
            info!(path = %record.path, "Up to date");
            acknowledge(self.store.as_ref(), seq).await?;
            if record.deleted {
                self.erase_if_unchanged(&record).await?;
            }
            return Ok(());
        };

        if matches!(operation, Operation::Delete) && self.carried_by_parent(&record, side, batch).await? {
            info!(path = %record.path, %side, "Will be removed with its parent folder");
            acknowledge(self.store.as_ref(), seq).await?;
            self.erase_if_unchanged(&record).await?;
            if record.is_file() {
                self.emit(SyncEvent::DeleteFile(record.path.clone()));
            }
            return Ok(());
        }

        match self.apply_doc(&mut record, side, &operation).await {
            Ok(()) => {
                acknowledge(self.store.as_ref(), seq).await?;
                trace!(path = %record.path, seq, %side, "Applied change");
                if let Operation::Move { from } = &operation {
                    self.erase_consumed_source(&record, from).await?;
                }
                if record.deleted {
                    self.erase_if_unchanged(&record).await
                } else {
                    record.move_from = None;
                    record.overwrite = None;
                    self.update_revs(record, side).await
                }
            }
            Err(err) => self.handle_failure(change, record, side, err).await,
        }
    }

    async fn apply_doc(
        &self,
        record: &mut ChangeRecord,
        side: Side,
        operation: &Operation,
    ) -> Result<()> {
        let current = record.sides.get(side);

        if record.has_incompatibilities() && side == Side::Local && record.move_to.is_none() {
            return self.skip_incompatible(record, side, operation).await;
        }
        if record.deleted && current == 0 {
            return Ok(());
        }

        match operation {
            Operation::MoveSource => {
                debug!(path = %record.path, "Ignoring deleted move source");
                Ok(())
            }
            Operation::Move { from } => self.apply_move(record, side, from).await,
            Operation::Delete => {
                debug!(path = %record.path, doc_type = %record.doc_type, "Applying deletion");
                let writer = &self.sides.get(side).writer;
                if record.is_file() {
                    writer.trash(record).await?;
                    self.emit(SyncEvent::DeleteFile(record.path.clone()));
                } else {
                    writer.delete_folder(record).await?;
                }
                Ok(())
            }
            Operation::Add => {
                debug!(path = %record.path, doc_type = %record.doc_type, "Applying addition");
                self.do_add(record, side).await
            }
            Operation::Edit => self.apply_edit(record, side, current).await,
            Operation::Null | Operation::Skip => Ok(()),
        }
    }

    async fn skip_incompatible(
        &self,
        record: &ChangeRecord,
        side: Side,
        operation: &Operation,
    ) -> Result<()> {
        match operation {
            Operation::Move { from } if !from.has_incompatibilities() => {
                if from.child_move {
                    debug!(path = %record.path, "Incompatible document trashed with its parent");
                    return Ok(());
                }
                warn!(
                    path = %record.path,
                    oldpath = %from.path,
                    "Trashing local document since its new remote name is incompatible"
                );
                let mut was = (**from).clone();
                self.sides.get(side).writer.trash(&mut was).await?;
                if was.is_file() {
                    self.emit(SyncEvent::DeleteFile(was.path));
                }
            }
            _ => {
                warn!(
                    path = %record.path,
                    incompatibilities = record.incompatibilities.len(),
                    "Not syncing incompatible document"
                );
            }
        }
        Ok(())
    }

    async fn apply_move(
        &self,
        record: &mut ChangeRecord,
        side: Side,
        from: &ChangeRecord,
    ) -> Result<()> {
        debug!(path = %record.path, oldpath = %from.path, "Applying move");
        let writer = &self.sides.get(side).writer;

        if from.has_incompatibilities() && side == Side::Local {
            self.do_add(record, side).await?;
        } else if from.child_move {
            writer.assign_new_revision(record).await?;
            self.emit_move(side, record, from);
        } else {
            if self.source_moved_with_parent(from).await? {
                let mut source = from.clone();
                writer.assign_new_revision(&mut source).await?;
            }
            writer.move_record(record, from).await?;
            self.emit_move(side, record, from);
        }

        if record.is_file() && self.content_changed(record, from).await? {
            if let Err(err) = self
                .transfer_with_retry(side, record, Transfer::Overwrite(Some(from)))
                .await
            {
                // The move itself is done and must not be replayed
                record.move_from = None;
                return Err(err.into());
            }
            self.emit(SyncEvent::TransferStarted {
                side,
                path: record.path.clone(),
            });
        }
        Ok(())
    }

    fn emit_move(&self, side: Side, record: &ChangeRecord, from: &ChangeRecord) {
        if record.is_file() {
            self.emit(SyncEvent::TransferMove {
                side,
                path: record.path.clone(),
                from: from.path.clone(),
            });
        }
    }

    async fn source_moved_with_parent(&self, from: &ChangeRecord) -> Result<bool> {
        let Some(source_ref) = &from.move_from else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_revision(source_ref)
            .await?
            .is_some_and(|source| source.child_move))
    }

    async fn content_changed(&self, record: &ChangeRecord, from: &ChangeRecord) -> Result<bool> {
        if !same_binary(from, record) {
            return Ok(true);
        }
        let Some(overwrite_ref) = &record.overwrite else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_revision(overwrite_ref)
            .await?
            .is_some_and(|overwritten| !same_binary(&overwritten, record)))
    }

    async fn apply_edit(&self, record: &mut ChangeRecord, side: Side, current: u64) -> Result<()> {
        let steps = record.sides.target.saturating_sub(current);
        let Some(old) = self.store.previous_revision(record, steps).await? else {
            debug!(path = %record.path, "Previous revision missing, overwriting");
            return self.do_overwrite(record, side).await;
        };
        let writer = &self.sides.get(side).writer;

        if record.is_folder() {
            if same_folder(&old, record) {
                debug!(path = %record.path, "Ignoring timestamp-only change");
            } else {
                writer.update_folder(record).await?;
            }
        } else if same_binary(&old, record) {
            if same_file(&old, record, self.merge.platform()) {
                debug!(path = %record.path, "Ignoring timestamp-only change");
            } else {
                writer.update_file_metadata(record).await?;
            }
        } else {
            self.transfer_with_retry(side, record, Transfer::Overwrite(Some(&old)))
                .await?;
            self.emit(SyncEvent::TransferStarted {
                side,
                path: record.path.clone(),
            });
        }
        Ok(())
    }

    async fn do_add(&self, record: &mut ChangeRecord, side: Side) -> Result<()> {
        if record.is_file() {
            self.transfer_with_retry(side, record, Transfer::Add).await?;
            self.emit(SyncEvent::TransferStarted {
                side,
                path: record.path.clone(),
            });
        } else {
            self.sides.get(side).writer.add_folder(record).await?;
        }
        Ok(())
    }

    async fn do_overwrite(&self, record: &mut ChangeRecord, side: Side) -> Result<()> {
        if record.is_file() {
            self.transfer_with_retry(side, record, Transfer::Overwrite(None))
                .await?;
            self.emit(SyncEvent::TransferStarted {
                side,
                path: record.path.clone(),
            });
        } else {
            self.sides.get(side).writer.add_folder(record).await?;
        }
        Ok(())
    }

    /// Streams content from the peer side, retrying transient errors
    async fn transfer_with_retry(
        &self,
        side: Side,
        record: &mut ChangeRecord,
        transfer: Transfer<'_>,
    ) -> Result<(), WriteError> {
        let writer = &self.sides.get(side).writer;
        let source = self.sides.get(side.other()).reader.as_ref();

        let events = self.events.clone();
        let path = record.path.clone();
        let progress = move |bytes: u64| {
            let _ = events.send(SyncEvent::TransferProgress {
                side,
                path: path.clone(),
                bytes,
            });
        };

        let mut attempt = 0;
        loop {
            let result = match transfer {
                Transfer::Add => writer.add_file(record, source, &progress).await,
                Transfer::Overwrite(previous) => {
                    writer
                        .overwrite_file(record, previous, source, &progress)
                        .await
                }
            };

            match result {
                Err(err) if err.is_transient() && attempt < self.sync_config.transfer_retries => {
                    attempt += 1;
                    let delay = self.sync_config.transfer_retry_delay();
                    warn!(
                        path = %record.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(()) => {
                    if attempt > 0 {
                        info!(path = %record.path, attempt, "Transfer succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Whether the deletion of `record` is carried by its parent's
    ///
    /// A trashed document waits `trashing_delay` for its parent's deletion
    /// to be merged, once per parent and batch.
    async fn carried_by_parent(
        &self,
        record: &ChangeRecord,
        side: Side,
        batch: &mut Batch,
    ) -> Result<bool> {
        let Some(parent_id) = record.id.parent() else {
            return Ok(false);
        };

        let mut parent = self.store.get(&parent_id).await?;
        if record.trashed
            && parent.as_ref().is_some_and(|p| !p.deleted)
            && batch.awaited_parents.insert(parent_id.clone())
        {
            let token = self.lifecycle.cancellation_token();
            tokio::select! {
                _ = token.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.sync_config.trashing_delay()) => {}
            }
            parent = self.store.get(&parent_id).await?;
        }

        Ok(parent.is_some_and(|p| p.deleted && p.move_to.is_none() && !p.is_up_to_date(side)))
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    /// Erases `record` unless a newer revision was merged meanwhile
    ///
    /// Watchers merge without the sync lock, so the check and the removal
    /// happen in one store operation.
    async fn erase_if_unchanged(&self, record: &ChangeRecord) -> Result<()> {
        match self
            .store
            .erase_if_target(&record.id, record.sides.target)
            .await
        {
            Err(err) if RevisionConflict::is(&err) => {
                debug!(path = %record.path, "Record changed since it was applied, keeping it");
                Ok(())
            }
            result => result,
        }
    }

    /// Erases the tombstone left at the source of an applied move
    async fn erase_consumed_source(&self, record: &ChangeRecord, from: &ChangeRecord) -> Result<()> {
        if from.id == record.id {
            return Ok(());
        }
        match self.store.get(&from.id).await? {
            Some(source) if source.deleted && source.move_to.is_some() => {
                self.erase_if_unchanged(&source).await
            }
            _ => Ok(()),
        }
    }

    /// Marks both sides up to date with the revision just applied
    async fn update_revs(&self, mut record: ChangeRecord, side: Side) -> Result<()> {
        let applied = record.sides.target;
        record.mark_as_up_to_date();

        let err = match self.store.put(record.clone()).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        if !RevisionConflict::is(&err) {
            return Err(err);
        }

        // A newer revision was merged while applying this one
        let Some(mut stored) = self.store.get(&record.id).await? else {
            return Ok(());
        };
        let other = side.other();
        let other_up_to_date = stored.is_up_to_date(other);
        stored.sides.set(side, applied);
        if other_up_to_date {
            stored.sides.set(other, stored.sides.target + 1);
        }
        if let Err(err) = self.store.put(stored).await {
            warn!(path = %record.path, error = %err, "Race condition while updating revisions");
        }
        Ok(())
    }

    /// Counts a failed attempt, keeping the source side up to date
    async fn update_errors(&self, mut record: ChangeRecord, seq: u64, err: &SyncError) -> Result<()> {
        let stored = record.clone();
        record.errors += 1;
        record.mark_side(err.side.other(), Some(&stored));

        match self.store.put(record).await {
            Ok(_) => Ok(()),
            Err(put_err) if RevisionConflict::is(&put_err) => {
                info!(seq, path = %stored.path, "Ignored change superseded by a newer revision");
                acknowledge(self.store.as_ref(), seq).await
            }
            Err(put_err) => Err(put_err),
        }
    }

    /// Retries a change after its conflicting remote name was freed
    async fn retry_after_rename(&self, mut record: ChangeRecord, side: Side) -> Result<()> {
        let Some(stored) = self.store.get(&record.id).await? else {
            return Ok(());
        };
        if stored.sides.target != record.sides.target {
            return Ok(());
        }
        record.errors = 0;
        record.mark_side(side.other(), Some(&stored));
        match self.store.put(record).await {
            Ok(_) => Ok(()),
            Err(err) if RevisionConflict::is(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Applies the failure policy to a change the writer could not apply
    ///
    /// Blocking codes leave the record untouched: the change is replayed
    /// once unblocked and never counts toward `max_sync_attempts`.
    async fn handle_failure(
        &self,
        change: Change,
        record: ChangeRecord,
        side: Side,
        err: anyhow::Error,
    ) -> Result<()> {
        let seq = change.seq;
        let sync_err = SyncError::wrap(err, side, Some(&record));
        warn!(error = %sync_err, path = %record.path, seq, "Sync error");

        let below_cap = record.errors < self.sync_config.max_sync_attempts;
        match sync_err.code {
            code if code.is_blocking() => {
                self.block_sync_for(sync_err, Some(change), false);
            }
            SyncErrorCode::ConflictingName => {
                if below_cap {
                    // Another change may free the name, or a remote change
                    // not yet merged took it
                    self.update_errors(record, seq, &sync_err).await?;
                    self.block_sync_for(sync_err, Some(change), false);
                } else if side == Side::Remote {
                    error!(path = %record.path, "Document already exists on the remote side");
                    self.merge.resolve_remote_conflict(&record).await?;
                    self.retry_after_rename(record, side).await?;
                    acknowledge(self.store.as_ref(), seq).await?;
                } else {
                    skip_change(self.store.as_ref(), seq, Some(&record), &sync_err).await?;
                }
            }
            _ => {
                if below_cap {
                    self.update_errors(record, seq, &sync_err).await?;
                } else {
                    skip_change(self.store.as_ref(), seq, Some(&record), &sync_err).await?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Blocking and retries
    // ========================================================================

    /// Blocks the drain loop for an error reported by the remote watcher
    ///
    /// The remote watcher is stopped until the retry.
    pub fn block_for_remote_error(&self, err: SyncError) {
        self.block_sync_for(err, None, true);
    }

    fn block_sync_for(&self, err: SyncError, change: Option<Change>, from_remote_watcher: bool) {
        debug!(code = %err.code, "Blocking sync for error");
        let code = err.code;
        let seq = change.as_ref().map(|c| c.seq);
        self.lifecycle.block_for(code);

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        if let Ok(mut actions) = self.user_actions.lock() {
            *actions = Some(actions_tx);
        }

        let remote = self.sides.get(Side::Remote).clone();
        if from_remote_watcher {
            let watcher = Arc::clone(&remote.watcher);
            tokio::spawn(async move {
                if let Err(err) = watcher.stop().await {
                    warn!(error = %err, "Failed to pause the remote watcher");
                }
            });
        }

        match code {
            SyncErrorCode::Unreachable => self.emit(SyncEvent::Offline),
            code if code.needs_user_action() => {
                self.emit(SyncEvent::UserActionRequired { code, seq });
            }
            // Solved without the user
            _ => {}
        }

        let task = RetryTask {
            delay: err.retry_delay(&self.retry_config, self.sync_config.heartbeat()),
            err,
            change,
            lifecycle: Arc::clone(&self.lifecycle),
            store: Arc::clone(&self.store),
            remote,
            events: self.events.clone(),
        };
        tokio::spawn(task.run(self.lifecycle.cancellation_token(), actions_rx));
    }

    fn send_user_action(&self, action: UserAction) {
        let sent = self
            .user_actions
            .lock()
            .ok()
            .and_then(|actions| actions.as_ref().map(|tx| tx.send(action).is_ok()))
            .unwrap_or(false);
        if !sent {
            debug!(?action, "No blocked change waiting for the user");
        }
    }

    /// The user fixed the blocking condition, retry now
    pub fn user_action_done(&self) {
        self.send_user_action(UserAction::Done);
    }

    /// The user is fixing the blocking condition, postpone the retry
    pub fn user_action_in_progress(&self) {
        self.send_user_action(UserAction::InProgress);
    }

    /// The user gave up, skip the blocked change
    pub fn user_action_skipped(&self) {
        self.send_user_action(UserAction::Skipped);
    }
}

// ============================================================================
// RetryTask
// ============================================================================

/// Timer unblocking the drain loop after a blocking error
struct RetryTask {
    err: SyncError,
    change: Option<Change>,
    delay: Duration,
    lifecycle: Arc<Lifecycle>,
    store: Arc<dyn IMetadataStore>,
    remote: SideAdapter,
    events: broadcast::Sender<SyncEvent>,
}

impl RetryTask {
    async fn run(self, token: CancellationToken, mut actions: mpsc::UnboundedReceiver<UserAction>) {
        let sleep = tokio::time::sleep(self.delay);
        tokio::pin!(sleep);
        let mut actions_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = &mut sleep => {
                    if self.retry().await {
                        return;
                    }
                    sleep.as_mut().reset(Instant::now() + self.delay);
                }
                action = actions.recv(), if actions_open => match action {
                    Some(UserAction::Done) => {
                        if self.retry().await {
                            return;
                        }
                        sleep.as_mut().reset(Instant::now() + self.delay);
                    }
                    Some(UserAction::InProgress) => {
                        sleep.as_mut().reset(Instant::now() + self.delay);
                    }
                    Some(UserAction::Skipped) => {
                        self.skip().await;
                        return;
                    }
                    // Superseded by a newer blocking error
                    None => actions_open = false,
                },
            }
        }
    }

    /// Unblocks the sync unless the remote side is still unreachable
    async fn retry(&self) -> bool {
        debug!(code = %self.err.code, "Retrying after blocking error");
        if self.err.code == SyncErrorCode::Unreachable {
            if self.remote.writer.ping().await {
                let _ = self.events.send(SyncEvent::Online);
            } else {
                let _ = self.events.send(SyncEvent::Offline);
                return false;
            }
        }
        self.resume().await;
        true
    }

    async fn skip(&self) {
        debug!(code = %self.err.code, "User skipped required action");
        if let Some(change) = &self.change {
            if let Err(err) =
                skip_change(self.store.as_ref(), change.seq, Some(&change.record), &self.err).await
            {
                warn!(error = %err, "Failed to skip change");
            }
        }
        self.resume().await;
    }

    async fn resume(&self) {
        if !self.remote.watcher.is_running() {
            if let Err(err) = self.remote.watcher.start().await {
                warn!(error = %err, "Failed to restart the remote watcher");
            }
        }
        self.lifecycle.unblock_for(self.err.code);
    }
}
