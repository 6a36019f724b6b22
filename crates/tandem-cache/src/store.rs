//! SQLite implementation of IMetadataStore
//!
//! Records are stored as JSON bodies next to the few columns queries need.
//!
//! ## Type Mapping
//!
//! | Domain Type    | SQL Type | Strategy                                  |
//! |----------------|----------|-------------------------------------------|
//! | RecordId       | TEXT     | Identity string via `.as_str()`           |
//! | DocPath        | TEXT     | Path string via `.as_str()`               |
//! | sides.target   | INTEGER  | `i64`, checked conversion                 |
//! | ChangeRecord   | TEXT     | serde_json serialization                  |
//!
//! ## Revisions
//!
//! Every write appends a row to `revisions` and upserts the live row in
//! `records`. The `revisions` rowid is the store-wide sequence number that
//! orders the change feed.
//!
//! History is pruned as records are written and erased. A revision is kept
//! while it is at or after the `keep_from` of its live record (the oldest
//! revision one of the sides still reflects) or while a live record's
//! `move_from` or `overwrite` points at it.

use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::{watch, Mutex};

use tandem_core::domain::{ChangeRecord, DocPath, RecordId, RevisionRef};
use tandem_core::ports::{Change, IMetadataStore, LockGuard, RevisionConflict};

use crate::CacheError;

/// Name of the checkpoint row owned by the sync driver
const SYNC_CHECKPOINT: &str = "sync";

/// SQLite-based implementation of the metadata store port
///
/// Writes are serialized through `write_lock` so the target check and the
/// insert happen against a stable view of the table.
pub struct SqliteMetadataStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    sync_lock: Arc<Mutex<()>>,
    seq_tx: watch::Sender<u64>,
}

impl SqliteMetadataStore {
    /// Opens the store on an already migrated pool
    ///
    /// # Errors
    ///
    /// Returns `CacheError::QueryFailed` if the latest sequence number cannot
    /// be read.
    pub async fn open(pool: SqlitePool) -> Result<Self, CacheError> {
        // Pruning may drop the newest rows, the autoincrement counter stays
        let last_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'revisions'), 0)",
        )
        .fetch_one(&pool)
        .await?;
        let (seq_tx, _) = watch::channel(from_i64(last_seq)?);

        tracing::debug!(seq = last_seq, "Metadata store opened");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            sync_lock: Arc::new(Mutex::new(())),
            seq_tx,
        })
    }

    /// Persists `records` in one transaction, in order
    ///
    /// A record appearing twice must carry the target written by its first
    /// occurrence.
    async fn write(&self, records: Vec<ChangeRecord>) -> anyhow::Result<Vec<ChangeRecord>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let _writing = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(records.len());
        let mut last_seq = 0;

        for mut record in records {
            let stored = stored_row(&mut tx, &record.id).await?;
            if stored.target != record.sides.target {
                return Err(anyhow::Error::new(RevisionConflict {
                    id: record.id.clone(),
                    expected: record.sides.target,
                    stored: stored.target,
                }));
            }
            record.sides.target = stored.target + 1;
            last_seq = insert_revision(&mut tx, &record).await?;

            prune_history(&mut tx, &record.id).await?;
            let kept = references(&record);
            for released in stored.references.iter().filter(|r| !kept.contains(r)) {
                prune_history(&mut tx, &released.id).await?;
            }
            saved.push(record);
        }

        tx.commit().await?;
        self.seq_tx.send_replace(last_seq);

        tracing::trace!(count = saved.len(), seq = last_seq, "Records persisted");
        Ok(saved)
    }

    /// Deletes the live row of `id`, only at `expected` target when given
    async fn remove(&self, id: &RecordId, expected: Option<u64>) -> anyhow::Result<()> {
        let _writing = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let stored = stored_row(&mut tx, id).await?;
        if stored.target == 0 {
            return Ok(());
        }
        if let Some(expected) = expected.filter(|&t| t != stored.target) {
            return Err(anyhow::Error::new(RevisionConflict {
                id: id.clone(),
                expected,
                stored: stored.target,
            }));
        }

        sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        prune_history(&mut tx, id).await?;
        for released in &stored.references {
            prune_history(&mut tx, &released.id).await?;
        }
        tx.commit().await?;

        tracing::trace!(id = %id, "Record erased");
        Ok(())
    }
}

// ============================================================================
// Helper functions for row handling
// ============================================================================

fn to_i64(value: u64) -> Result<i64, CacheError> {
    i64::try_from(value)
        .map_err(|_| CacheError::SerializationError(format!("Value out of range: {}", value)))
}

fn from_i64(value: i64) -> Result<u64, CacheError> {
    u64::try_from(value)
        .map_err(|_| CacheError::SerializationError(format!("Negative value: {}", value)))
}

fn record_from_row(row: &SqliteRow) -> Result<ChangeRecord, CacheError> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

/// What a write needs to know about the live row it replaces
struct StoredRow {
    /// 0 when there is no live row
    target: u64,
    references: Vec<RevisionRef>,
}

async fn stored_row(tx: &mut Transaction<'_, Sqlite>, id: &RecordId) -> Result<StoredRow, CacheError> {
    let row = sqlx::query(
        r#"
        SELECT target, move_from_id, move_from_target, overwrite_id, overwrite_target
        FROM records WHERE id = ?
        "#,
    )
    .bind(id.as_str())
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(StoredRow {
            target: 0,
            references: Vec::new(),
        });
    };

    let mut references = Vec::new();
    for (id_col, target_col) in [
        ("move_from_id", "move_from_target"),
        ("overwrite_id", "overwrite_target"),
    ] {
        let id: Option<String> = row.try_get(id_col)?;
        let target: Option<i64> = row.try_get(target_col)?;
        if let (Some(id), Some(target)) = (id, target) {
            references.push(RevisionRef {
                id: RecordId::from_stored(id),
                target: from_i64(target)?,
            });
        }
    }

    Ok(StoredRow {
        target: from_i64(row.try_get("target")?)?,
        references,
    })
}

/// Revisions of other records `record` points at
fn references(record: &ChangeRecord) -> Vec<RevisionRef> {
    record
        .move_from
        .iter()
        .chain(record.overwrite.iter())
        .cloned()
        .collect()
}

/// Oldest revision of `record` one of the sides may still be diffed against
///
/// A side at 0 never saw the record and gets a full add instead.
fn history_floor(record: &ChangeRecord) -> u64 {
    let sides = record.sides;
    [sides.local, sides.remote]
        .into_iter()
        .filter(|&rev| rev > 0)
        .min()
        .map_or(sides.target, |rev| rev.min(sides.target))
}

/// Drops the revisions of `id` nothing can reach anymore
///
/// Without a live row, only the revisions referenced by other records stay.
async fn prune_history(tx: &mut Transaction<'_, Sqlite>, id: &RecordId) -> Result<(), CacheError> {
    let pruned = sqlx::query(
        r#"
        DELETE FROM revisions
        WHERE id = ?
          AND target < COALESCE((SELECT keep_from FROM records WHERE id = ?), 9223372036854775807)
          AND NOT EXISTS (
              SELECT 1 FROM records r
              WHERE (r.move_from_id = revisions.id AND r.move_from_target = revisions.target)
                 OR (r.overwrite_id = revisions.id AND r.overwrite_target = revisions.target)
          )
        "#,
    )
    .bind(id.as_str())
    .bind(id.as_str())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if pruned > 0 {
        tracing::trace!(id = %id, pruned, "Revision history pruned");
    }
    Ok(())
}

/// Appends `record` to the history and makes it the live revision
///
/// Returns the sequence number assigned to the revision.
async fn insert_revision(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ChangeRecord,
) -> Result<u64, CacheError> {
    let body = serde_json::to_string(record)?;
    let target = to_i64(record.sides.target)?;

    let seq = sqlx::query("INSERT INTO revisions (id, target, body) VALUES (?, ?, ?)")
        .bind(record.id.as_str())
        .bind(target)
        .bind(&body)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();

    let move_from_target = record.move_from.as_ref().map(|r| to_i64(r.target)).transpose()?;
    let overwrite_target = record.overwrite.as_ref().map(|r| to_i64(r.target)).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO records (
            id, path, target, seq, deleted, keep_from,
            move_from_id, move_from_target, overwrite_id, overwrite_target, body
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            path = excluded.path,
            target = excluded.target,
            seq = excluded.seq,
            deleted = excluded.deleted,
            keep_from = excluded.keep_from,
            move_from_id = excluded.move_from_id,
            move_from_target = excluded.move_from_target,
            overwrite_id = excluded.overwrite_id,
            overwrite_target = excluded.overwrite_target,
            body = excluded.body
        "#,
    )
    .bind(record.id.as_str())
    .bind(record.path.as_str())
    .bind(target)
    .bind(seq)
    .bind(record.deleted)
    .bind(to_i64(history_floor(record))?)
    .bind(record.move_from.as_ref().map(|r| r.id.as_str()))
    .bind(move_from_target)
    .bind(record.overwrite.as_ref().map(|r| r.id.as_str()))
    .bind(overwrite_target)
    .bind(&body)
    .execute(&mut **tx)
    .await?;

    from_i64(seq)
}

// ============================================================================
// IMetadataStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IMetadataStore for SqliteMetadataStore {
    async fn get(&self, id: &RecordId) -> anyhow::Result<Option<ChangeRecord>> {
        let row = sqlx::query("SELECT body FROM records WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_by_path(&self, path: &DocPath) -> anyhow::Result<Option<ChangeRecord>> {
        let row = sqlx::query("SELECT body FROM records WHERE path = ? ORDER BY seq DESC LIMIT 1")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_revision(&self, rev: &RevisionRef) -> anyhow::Result<Option<ChangeRecord>> {
        let row = sqlx::query(
            "SELECT body FROM revisions WHERE id = ? AND target = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(rev.id.as_str())
        .bind(to_i64(rev.target)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn by_recursive_path(&self, id: &RecordId) -> anyhow::Result<Vec<ChangeRecord>> {
        let prefix = format!("{}/", id.as_str());
        let prefix_len = to_i64(prefix.chars().count() as u64)?;

        let rows = sqlx::query(
            r#"
            SELECT body FROM records
            WHERE substr(id, 1, ?) = ? AND deleted = 0
            ORDER BY path
            "#,
        )
        .bind(prefix_len)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    async fn put(&self, record: ChangeRecord) -> anyhow::Result<ChangeRecord> {
        let mut saved = self.write(vec![record]).await?;
        saved
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Store returned no record for a single put"))
    }

    async fn bulk_put(&self, records: Vec<ChangeRecord>) -> anyhow::Result<Vec<ChangeRecord>> {
        self.write(records).await
    }

    async fn erase(&self, id: &RecordId) -> anyhow::Result<()> {
        self.remove(id, None).await
    }

    async fn erase_if_target(&self, id: &RecordId, target: u64) -> anyhow::Result<()> {
        self.remove(id, Some(target)).await
    }

    async fn changes_since(&self, since: u64) -> anyhow::Result<Vec<Change>> {
        let rows = sqlx::query("SELECT seq, body FROM records WHERE seq > ? ORDER BY seq")
            .bind(to_i64(since)?)
            .fetch_all(&self.pool)
            .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq")?;
            changes.push(Change {
                seq: from_i64(seq)?,
                record: record_from_row(row)?,
            });
        }
        Ok(changes)
    }

    async fn wait_for_changes(&self, since: u64) -> anyhow::Result<u64> {
        let mut rx = self.seq_tx.subscribe();
        loop {
            let seq = *rx.borrow_and_update();
            if seq > since {
                return Ok(seq);
            }
            rx.changed()
                .await
                .map_err(|_| anyhow::anyhow!("Metadata store closed"))?;
        }
    }

    async fn update_seq(&self) -> anyhow::Result<u64> {
        Ok(*self.seq_tx.borrow())
    }

    async fn lock(&self, owner: &str) -> anyhow::Result<LockGuard> {
        tracing::trace!(owner, "Waiting for sync lock");
        let guard = self.sync_lock.clone().lock_owned().await;
        tracing::trace!(owner, "Sync lock acquired");

        let owner = owner.to_string();
        Ok(LockGuard::new(move || {
            drop(guard);
            tracing::trace!(owner = %owner, "Sync lock released");
        }))
    }

    async fn checkpoint(&self) -> anyhow::Result<u64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT seq FROM checkpoints WHERE name = ?")
            .bind(SYNC_CHECKPOINT)
            .fetch_optional(&self.pool)
            .await?;
        Ok(seq.map_or(Ok(0), from_i64)?)
    }

    async fn set_checkpoint(&self, seq: u64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (name, seq) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET seq = excluded.seq
            "#,
        )
        .bind(SYNC_CHECKPOINT)
        .bind(to_i64(seq)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
