//! Local filesystem side adapter
//!
//! Implements [`IWriter`] and [`IReader`] on a folder of the local disk
//! using `tokio::fs`.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content is streamed into a hidden temporary file of
//!   the destination folder, then renamed over the destination. A crash
//!   never leaves a partial file at a synced path.
//! - **Trash**: trashed documents are moved under `<root>/<trash_dir>/`
//!   instead of being removed, keeping their relative path.
//! - **Inodes**: every write records the inode of the document so the local
//!   watcher can recognize it later.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use tandem_core::domain::{ChangeRecord, DocPath};
use tandem_core::ports::{IReader, IWriter, Progress, ReadStream, WriteError, WriteErrorKind};

/// Size of the buffer used to stream content to disk
const COPY_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// LocalSide struct
// ============================================================================

/// Adapter bridging the replica ports to a folder of the local disk
#[derive(Debug, Clone)]
pub struct LocalSide {
    root: PathBuf,
    trash_dir: String,
}

impl LocalSide {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, trash_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            trash_dir: trash_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a synced path
    pub fn abspath(&self, path: &DocPath) -> PathBuf {
        path.as_str()
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    /// Location of a trashed document, keeping its relative path
    pub fn trash_path(&self, path: &DocPath) -> PathBuf {
        path.as_str()
            .split('/')
            .fold(self.root.join(&self.trash_dir), |acc, part| acc.join(part))
    }

    async fn ensure_parent(&self, target: &Path) -> Result<(), WriteError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Hidden sibling of `target` receiving content until it is complete
    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}.tandem-tmp"))
    }

    /// Streams the peer's content into `record.path`, replacing it atomically
    async fn write_content(
        &self,
        record: &mut ChangeRecord,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError> {
        let target = self.abspath(&record.path);
        self.ensure_parent(&target).await?;

        let mut stream = source.create_read_stream(record).await?;
        let tmp_path = Self::temp_path(&target);
        debug!(?tmp_path, length = stream.length, "Writing to temporary file");

        let copied = self
            .copy_to(&mut stream, &tmp_path, progress)
            .await
            .map_err(WriteError::from);
        let copied = match copied {
            Ok(copied) => copied,
            Err(err) => {
                // Best effort, the write error is what matters
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if copied != stream.length {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(WriteError::new(
                WriteErrorKind::Transient,
                format!(
                    "Truncated content for {}: expected {} bytes, got {copied}",
                    record.path, stream.length
                ),
            ));
        }

        set_executable(&tmp_path, record.executable).await?;
        tokio::fs::rename(&tmp_path, &target).await?;
        record.size = Some(copied);
        self.assign_ino(record, &target).await
    }

    async fn copy_to(
        &self,
        stream: &mut ReadStream,
        tmp_path: &Path,
        progress: Progress<'_>,
    ) -> std::io::Result<u64> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let read = stream.reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).await?;
            total += read as u64;
            progress(total);
        }
        file.sync_all().await?;
        Ok(total)
    }

    async fn assign_ino(&self, record: &mut ChangeRecord, target: &Path) -> Result<(), WriteError> {
        let metadata = tokio::fs::symlink_metadata(target).await?;
        record.ino = inode(&metadata);
        Ok(())
    }

    /// Moves `from` to `to`, refusing to replace another document
    async fn rename_exclusive(&self, from: &Path, to: &Path) -> Result<(), WriteError> {
        if let Ok(dst) = tokio::fs::symlink_metadata(to).await {
            let src = tokio::fs::symlink_metadata(from).await?;
            // A case-only rename on a case-insensitive disk sees itself
            let same_entry = matches!((inode(&src), inode(&dst)), (Some(a), Some(b)) if a == b);
            if !same_entry {
                return Err(WriteError::new(
                    WriteErrorKind::ConflictingName,
                    format!("{} already exists", to.display()),
                ));
            }
        }
        self.ensure_parent(to).await?;
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    /// Whether an earlier run already moved `from` to `target`
    ///
    /// The source must be gone and the destination must be the same
    /// document: same inode when known, otherwise same kind (and size for
    /// files).
    async fn already_moved(
        &self,
        record: &ChangeRecord,
        from: &ChangeRecord,
        source: &Path,
        target: &Path,
    ) -> Result<bool, WriteError> {
        match tokio::fs::symlink_metadata(source).await {
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let dst = match tokio::fs::symlink_metadata(target).await {
            Ok(dst) => dst,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if let (Some(expected), Some(found)) = (from.ino, inode(&dst)) {
            return Ok(expected == found);
        }
        Ok(if record.is_folder() {
            dst.is_dir()
        } else {
            dst.is_file() && record.size.map_or(true, |size| size == dst.len())
        })
    }

    /// Moves the document at `path` under the trash folder
    async fn move_to_trash(&self, path: &DocPath) -> Result<(), WriteError> {
        let source = self.abspath(path);
        if tokio::fs::symlink_metadata(&source).await.is_err() {
            debug!(%path, "Nothing to trash");
            return Ok(());
        }

        let dest = self.trash_path(path);
        if let Ok(metadata) = tokio::fs::symlink_metadata(&dest).await {
            // Older trashed copy with the same path
            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&dest).await?;
            } else {
                tokio::fs::remove_file(&dest).await?;
            }
        }
        self.ensure_parent(&dest).await?;
        tokio::fs::rename(&source, &dest).await?;
        Ok(())
    }
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

#[cfg(unix)]
async fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    let mode = permissions.mode();
    let mode = if executable {
        mode | 0o111
    } else {
        mode & !0o111
    };
    permissions.set_mode(mode);
    tokio::fs::set_permissions(path, permissions).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

// ============================================================================
// IReader implementation
// ============================================================================

#[async_trait::async_trait]
impl IReader for LocalSide {
    #[instrument(skip(self, record), fields(path = %record.path))]
    async fn create_read_stream(&self, record: &ChangeRecord) -> anyhow::Result<ReadStream> {
        let file = tokio::fs::File::open(self.abspath(&record.path)).await?;
        let length = file.metadata().await?.len();
        Ok(ReadStream {
            length,
            reader: Box::new(file),
        })
    }
}

// ============================================================================
// IWriter implementation
// ============================================================================

#[async_trait::async_trait]
impl IWriter for LocalSide {
    #[instrument(skip_all, fields(path = %record.path))]
    async fn add_file(
        &self,
        record: &mut ChangeRecord,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError> {
        debug!("Adding file");
        self.write_content(record, source, progress).await
    }

    #[instrument(skip_all, fields(path = %record.path))]
    async fn overwrite_file(
        &self,
        record: &mut ChangeRecord,
        _previous: Option<&ChangeRecord>,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError> {
        debug!("Overwriting file");
        self.write_content(record, source, progress).await
    }

    #[instrument(skip_all, fields(path = %record.path))]
    async fn update_file_metadata(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        let target = self.abspath(&record.path);
        set_executable(&target, record.executable).await?;
        self.assign_ino(record, &target).await
    }

    #[instrument(skip_all, fields(path = %record.path))]
    async fn add_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        let target = self.abspath(&record.path);
        debug!("Creating folder");
        tokio::fs::create_dir_all(&target).await?;
        self.assign_ino(record, &target).await
    }

    async fn update_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.add_folder(record).await
    }

    #[instrument(skip_all, fields(path = %record.path, from = %from.path))]
    async fn move_record(
        &self,
        record: &mut ChangeRecord,
        from: &ChangeRecord,
    ) -> Result<(), WriteError> {
        let source = self.abspath(&from.path);
        let target = self.abspath(&record.path);
        if self.already_moved(record, from, &source, &target).await? {
            debug!("Move already applied");
        } else {
            debug!("Moving");
            self.rename_exclusive(&source, &target).await?;
        }
        self.assign_ino(record, &target).await
    }

    async fn assign_new_revision(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        let target = self.abspath(&record.path);
        match tokio::fs::symlink_metadata(&target).await {
            Ok(metadata) => {
                record.ino = inode(&metadata);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %record.path, "Moved child not found on disk");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, fields(path = %record.path))]
    async fn trash(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        debug!("Trashing");
        self.move_to_trash(&record.path).await
    }

    #[instrument(skip_all, fields(path = %record.path))]
    async fn delete_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        let target = self.abspath(&record.path);
        match tokio::fs::remove_dir(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            // Content left behind (ignored or unsynced files) goes to the trash
            Err(_) => self.move_to_trash(&record.path).await,
        }
    }

    #[instrument(skip_all, fields(path = %record.path, new_path = %new_path))]
    async fn rename_conflicting(
        &self,
        record: &mut ChangeRecord,
        new_path: &DocPath,
    ) -> Result<(), WriteError> {
        let source = self.abspath(&record.path);
        let target = self.abspath(new_path);
        self.rename_exclusive(&source, &target).await?;
        self.assign_ino(record, &target).await
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use tandem_core::domain::{Checksum, Platform};

    use super::*;

    /// Serves the same bytes for every record
    struct BytesReader(Vec<u8>);

    #[async_trait::async_trait]
    impl IReader for BytesReader {
        async fn create_read_stream(&self, _record: &ChangeRecord) -> anyhow::Result<ReadStream> {
            Ok(ReadStream {
                length: self.0.len() as u64,
                reader: Box::new(Cursor::new(self.0.clone())),
            })
        }
    }

    fn no_progress(_: u64) {}

    fn file(path: &str) -> ChangeRecord {
        ChangeRecord::file(
            DocPath::new(path).unwrap(),
            Checksum::from_digest([1; 16]),
            Platform::Linux,
        )
    }

    fn folder(path: &str) -> ChangeRecord {
        ChangeRecord::folder(DocPath::new(path).unwrap(), Platform::Linux)
    }

    fn side(dir: &TempDir) -> LocalSide {
        LocalSide::new(dir.path(), ".tandem-trash")
    }

    #[tokio::test]
    async fn test_add_file_creates_parents_and_records_inode() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        let mut record = file("a/b/hello.txt");

        local
            .add_file(&mut record, &BytesReader(b"Hello, Tandem!".to_vec()), &no_progress)
            .await
            .unwrap();

        let content = tokio::fs::read(dir.path().join("a/b/hello.txt")).await.unwrap();
        assert_eq!(content, b"Hello, Tandem!");
        assert_eq!(record.size, Some(14));
        #[cfg(unix)]
        assert!(record.ino.is_some());
        assert!(!dir.path().join("a/b/.hello.txt.tandem-tmp").exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        let mut record = file("doc.txt");
        local
            .add_file(&mut record, &BytesReader(b"first".to_vec()), &no_progress)
            .await
            .unwrap();

        let seen = std::sync::Mutex::new(Vec::new());
        let progress = |n: u64| seen.lock().unwrap().push(n);
        local
            .overwrite_file(&mut record, None, &BytesReader(b"second".to_vec()), &progress)
            .await
            .unwrap();

        let content = tokio::fs::read(dir.path().join("doc.txt")).await.unwrap();
        assert_eq!(content, b"second");
        assert_eq!(seen.lock().unwrap().last(), Some(&6));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executable_bit_follows_record() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        let mut record = file("run.sh");
        record.executable = true;
        local
            .add_file(&mut record, &BytesReader(b"#!/bin/sh".to_vec()), &no_progress)
            .await
            .unwrap();
        let mode = std::fs::metadata(dir.path().join("run.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);

        record.executable = false;
        local.update_file_metadata(&mut record).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0);
    }

    #[tokio::test]
    async fn test_move_record() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        let from = folder("src");
        local.add_folder(&mut from.clone()).await.unwrap();
        std::fs::write(dir.path().join("src/a.txt"), b"a").unwrap();

        let mut dst = folder("nested/dst");
        local.move_record(&mut dst, &from).await.unwrap();

        assert!(!dir.path().join("src").exists());
        assert!(dir.path().join("nested/dst/a.txt").exists());
    }

    #[tokio::test]
    async fn test_move_already_applied_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        let mut from = file("a.txt");
        local
            .add_file(&mut from, &BytesReader(b"moved".to_vec()), &no_progress)
            .await
            .unwrap();
        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();

        let mut dst = file("b.txt");
        local.move_record(&mut dst, &from).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"moved");
        assert_eq!(dst.ino, from.ino);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_source_with_other_destination_is_not_a_replay() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        let mut from = file("a.txt");
        local
            .add_file(&mut from, &BytesReader(b"a".to_vec()), &no_progress)
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"unrelated").unwrap();

        assert!(local.move_record(&mut file("b.txt"), &from).await.is_err());
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"unrelated");
    }

    #[tokio::test]
    async fn test_move_onto_other_document_is_a_conflicting_name() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let err = local
            .move_record(&mut file("b.txt"), &file("a.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, WriteErrorKind::ConflictingName);
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_trash_keeps_relative_path() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"a").unwrap();

        local.trash(&mut file("docs/a.txt")).await.unwrap();

        assert!(!dir.path().join("docs/a.txt").exists());
        assert!(dir.path().join(".tandem-trash/docs/a.txt").exists());

        // Trashing a missing document is a no-op
        local.trash(&mut file("docs/a.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_folder() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::create_dir_all(dir.path().join("full")).unwrap();
        std::fs::write(dir.path().join("full/.cache"), b"x").unwrap();

        local.delete_folder(&mut folder("empty")).await.unwrap();
        local.delete_folder(&mut folder("full")).await.unwrap();
        local.delete_folder(&mut folder("missing")).await.unwrap();

        assert!(!dir.path().join("empty").exists());
        assert!(!dir.path().join("full").exists());
        assert!(dir.path().join(".tandem-trash/full/.cache").exists());
    }

    #[tokio::test]
    async fn test_rename_conflicting() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let new_path = DocPath::new("a-conflict-2024.txt").unwrap();
        local.rename_conflicting(&mut file("a.txt"), &new_path).await.unwrap();

        assert!(!dir.path().join("a.txt").exists());
        assert!(dir.path().join("a-conflict-2024.txt").exists());
    }

    #[tokio::test]
    async fn test_read_stream_reports_length() {
        let dir = TempDir::new().unwrap();
        let local = side(&dir);
        std::fs::write(dir.path().join("data.bin"), b"twelve bytes").unwrap();

        let mut stream = local.create_read_stream(&file("data.bin")).await.unwrap();
        assert_eq!(stream.length, 12);
        let mut content = Vec::new();
        stream.reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"twelve bytes");
    }
}
