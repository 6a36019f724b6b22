//! Validation of side changes before they are merged
//!
//! Watchers report changes with whatever they know about a document. [`Prep`]
//! checks them, fixes the document type and identity, applies the local
//! ignore rules and hands them to [`Merge`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use tandem_core::config::Config;
use tandem_core::domain::{ChangeRecord, DocPath, DocType, DomainError, Platform, RecordId, Side};
use tandem_core::ports::IIgnoreMatcher;

use crate::merge::Merge;

/// A change rejected before reaching the store
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("Invalid move from {from} to {to}")]
    InvalidMove { from: DocPath, to: DocPath },

    #[error("Missing revision for moved document {0}")]
    MissingRevision(DocPath),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The change was valid but merging it failed
    #[error(transparent)]
    Merge(#[from] anyhow::Error),
}

pub type PrepResult = Result<(), PrepError>;

fn ensure_valid_checksum(doc: &ChangeRecord) -> Result<(), DomainError> {
    if doc.checksum.is_none() {
        return Err(DomainError::InvalidRecord {
            path: doc.path.to_string(),
            reason: "missing checksum".to_string(),
        });
    }
    Ok(())
}

fn ensure_valid_move(doc: &ChangeRecord, was: &ChangeRecord) -> PrepResult {
    if doc.path == was.path {
        warn!(path = %doc.path, "Invalid move");
        return Err(PrepError::InvalidMove {
            from: was.path.clone(),
            to: doc.path.clone(),
        });
    }
    if was.sides.target == 0 {
        warn!(path = %was.path, "Missing revision");
        return Err(PrepError::MissingRevision(was.path.clone()));
    }
    Ok(())
}

pub struct Prep {
    merge: Arc<Merge>,
    ignore: Arc<dyn IIgnoreMatcher>,
    platform: Platform,
    trash_dir: String,
}

impl Prep {
    pub fn new(merge: Arc<Merge>, ignore: Arc<dyn IIgnoreMatcher>, config: &Config) -> Self {
        Self {
            platform: merge.platform(),
            merge,
            ignore,
            trash_dir: config.sync.trash_dir.clone(),
        }
    }

    fn assign(&self, doc: &mut ChangeRecord, doc_type: DocType) {
        doc.doc_type = doc_type;
        doc.id = RecordId::for_path(&doc.path, self.platform);
    }

    fn is_ignored(&self, side: Side, doc: &ChangeRecord) -> bool {
        let ignored = side == Side::Local && self.ignore.should_ignore(&doc.path, doc.doc_type);
        if ignored {
            debug!(path = %doc.path, "Ignored local change");
        }
        ignored
    }

    /// `doc` when given, otherwise `was` under the trash folder
    fn trashed_doc(&self, was: &ChangeRecord, doc: Option<ChangeRecord>) -> Result<ChangeRecord, DomainError> {
        let mut doc = match doc {
            Some(doc) => doc,
            None => {
                let mut doc = was.clone();
                doc.path = DocPath::new(format!("{}/{}", self.trash_dir, was.path))?;
                doc
            }
        };
        doc.trashed = true;
        Ok(doc)
    }

    // ========================================================================
    // Additions and updates
    // ========================================================================

    pub async fn add_file(&self, side: Side, mut doc: ChangeRecord) -> PrepResult {
        debug!(path = %doc.path, %side, "add_file");
        ensure_valid_checksum(&doc)?;
        self.assign(&mut doc, DocType::File);
        if self.is_ignored(side, &doc) {
            return Ok(());
        }
        Ok(self.merge.add_file(side, &doc).await?)
    }

    pub async fn update_file(&self, side: Side, mut doc: ChangeRecord) -> PrepResult {
        debug!(path = %doc.path, %side, "update_file");
        ensure_valid_checksum(&doc)?;
        self.assign(&mut doc, DocType::File);
        if self.is_ignored(side, &doc) {
            return Ok(());
        }
        Ok(self.merge.update_file(side, &doc).await?)
    }

    pub async fn put_folder(&self, side: Side, mut doc: ChangeRecord) -> PrepResult {
        debug!(path = %doc.path, %side, "put_folder");
        self.assign(&mut doc, DocType::Folder);
        if self.is_ignored(side, &doc) {
            return Ok(());
        }
        Ok(self.merge.put_folder(side, &doc).await?)
    }

    // ========================================================================
    // Moves
    // ========================================================================

    pub async fn move_file(
        &self,
        side: Side,
        mut doc: ChangeRecord,
        mut was: ChangeRecord,
    ) -> PrepResult {
        debug!(path = %doc.path, oldpath = %was.path, %side, "move_file");
        ensure_valid_checksum(&doc)?;
        ensure_valid_move(&doc, &was)?;
        self.assign(&mut doc, DocType::File);
        self.assign(&mut was, DocType::File);

        match (self.is_ignored(side, &doc), self.is_ignored(side, &was)) {
            (true, true) => Ok(()),
            (true, false) => Ok(self.merge.delete_file(side, &was).await?),
            (false, true) => Ok(self.merge.add_file(side, &doc).await?),
            (false, false) => Ok(self.merge.move_file(side, &doc, &was).await?),
        }
    }

    pub async fn move_folder(
        &self,
        side: Side,
        mut doc: ChangeRecord,
        mut was: ChangeRecord,
    ) -> PrepResult {
        debug!(path = %doc.path, oldpath = %was.path, %side, "move_folder");
        ensure_valid_move(&doc, &was)?;
        self.assign(&mut doc, DocType::Folder);
        self.assign(&mut was, DocType::Folder);

        match (self.is_ignored(side, &doc), self.is_ignored(side, &was)) {
            (true, true) => Ok(()),
            (true, false) => Ok(self.merge.delete_folder(side, &was).await?),
            (false, true) => Ok(self.merge.put_folder(side, &doc).await?),
            (false, false) => Ok(self.merge.move_folder(side, &doc, &was).await?),
        }
    }

    // ========================================================================
    // Trash, restoration and deletion
    // ========================================================================

    pub async fn trash_file(
        &self,
        side: Side,
        mut was: ChangeRecord,
        doc: Option<ChangeRecord>,
    ) -> PrepResult {
        debug!(oldpath = %was.path, %side, "trash_file");
        let mut doc = self.trashed_doc(&was, doc)?;
        ensure_valid_checksum(&doc)?;
        self.assign(&mut doc, DocType::File);
        self.assign(&mut was, DocType::File);
        Ok(self.merge.trash_file(side, &was, &doc).await?)
    }

    pub async fn trash_folder(
        &self,
        side: Side,
        mut was: ChangeRecord,
        doc: Option<ChangeRecord>,
    ) -> PrepResult {
        debug!(oldpath = %was.path, %side, "trash_folder");
        let mut doc = self.trashed_doc(&was, doc)?;
        self.assign(&mut doc, DocType::Folder);
        self.assign(&mut was, DocType::Folder);
        Ok(self.merge.trash_folder(side, &was, &doc).await?)
    }

    pub async fn restore_file(
        &self,
        side: Side,
        mut was: ChangeRecord,
        mut doc: ChangeRecord,
    ) -> PrepResult {
        debug!(path = %doc.path, oldpath = %was.path, %side, "restore_file");
        ensure_valid_checksum(&doc)?;
        doc.trashed = false;
        self.assign(&mut doc, DocType::File);
        self.assign(&mut was, DocType::File);
        Ok(self.merge.restore_file(side, &was, &doc).await?)
    }

    pub async fn restore_folder(
        &self,
        side: Side,
        mut was: ChangeRecord,
        mut doc: ChangeRecord,
    ) -> PrepResult {
        debug!(path = %doc.path, oldpath = %was.path, %side, "restore_folder");
        doc.trashed = false;
        self.assign(&mut doc, DocType::Folder);
        self.assign(&mut was, DocType::Folder);
        Ok(self.merge.restore_folder(side, &was, &doc).await?)
    }

    pub async fn delete_file(&self, side: Side, mut doc: ChangeRecord) -> PrepResult {
        debug!(path = %doc.path, %side, "delete_file");
        self.assign(&mut doc, DocType::File);
        if self.is_ignored(side, &doc) {
            return Ok(());
        }
        Ok(self.merge.delete_file(side, &doc).await?)
    }

    pub async fn delete_folder(&self, side: Side, mut doc: ChangeRecord) -> PrepResult {
        debug!(path = %doc.path, %side, "delete_folder");
        self.assign(&mut doc, DocType::Folder);
        if self.is_ignored(side, &doc) {
            return Ok(());
        }
        Ok(self.merge.delete_folder(side, &doc).await?)
    }
}
