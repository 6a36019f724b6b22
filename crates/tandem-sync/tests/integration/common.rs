//! Common test utilities for tandem-sync integration tests
//!
//! Provides an in-memory remote replica and a harness wiring it to a
//! temporary local folder, an in-memory metadata store and a sync engine.
//! Tests play the role of both watchers by feeding changes to [`Prep`].

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use tandem_cache::{DatabasePool, SqliteMetadataStore};
use tandem_core::config::{Config, ConfigBuilder};
use tandem_core::domain::{
    ChangeRecord, Checksum, DocPath, Platform, RemoteRef, Side, SidePair,
};
use tandem_core::ports::{
    IMetadataStore, IReader, IWriter, IdleWatcher, Progress, ReadStream, SideAdapter, WriteError,
    WriteErrorKind,
};
use tandem_sync::{GlobIgnore, LocalSide, Merge, Prep, SyncEngine};

/// Deterministic content digest standing in for MD5
pub fn checksum(content: &[u8]) -> Checksum {
    let mut digest = [0u8; 16];
    for (salt, chunk) in digest.chunks_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        salt.hash(&mut hasher);
        content.hash(&mut hasher);
        chunk.copy_from_slice(&hasher.finish().to_be_bytes());
    }
    Checksum::from_digest(digest)
}

pub fn path(p: &str) -> DocPath {
    DocPath::new(p).unwrap()
}

// ============================================================================
// MemoryRemote
// ============================================================================

#[derive(Debug, Clone)]
struct RemoteDoc {
    id: String,
    rev: u64,
    folder: bool,
    content: Vec<u8>,
}

impl RemoteDoc {
    fn reference(&self) -> RemoteRef {
        RemoteRef {
            id: self.id.clone(),
            rev: self.rev.to_string(),
        }
    }
}

/// Remote replica keeping documents in a map keyed by path
///
/// Moves, trashing and folder deletion carry descendants along, like a real
/// remote tree would.
#[derive(Default)]
pub struct MemoryRemote {
    docs: Mutex<BTreeMap<String, RemoteDoc>>,
    next_id: AtomicU64,
    failures: Mutex<Vec<WriteError>>,
    ops: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

fn is_within(key: &str, root: &str) -> bool {
    key == root || key.starts_with(&format!("{root}/"))
}

impl MemoryRemote {
    fn new_id(&self) -> String {
        format!("remote-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Makes the next `count` writes fail with `kind`
    pub fn fail_next(&self, count: usize, kind: WriteErrorKind) {
        let mut failures = self.failures.lock().unwrap();
        failures.extend((0..count).map(|_| WriteError::new(kind, "scripted failure")));
    }

    pub fn pending_failures(&self) -> usize {
        self.failures.lock().unwrap().len()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Writer operations applied so far, as "<op> <path>"
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    pub fn exists(&self, p: &str) -> bool {
        self.docs.lock().unwrap().contains_key(p)
    }

    pub fn content(&self, p: &str) -> Option<Vec<u8>> {
        self.docs
            .lock()
            .unwrap()
            .get(p)
            .filter(|doc| !doc.folder)
            .map(|doc| doc.content.clone())
    }

    // ------------------------------------------------------------------------
    // Changes made "by another client", returned the way a watcher reports them
    // ------------------------------------------------------------------------

    pub fn put_file(&self, p: &str, content: &[u8]) -> ChangeRecord {
        let doc = RemoteDoc {
            id: self.new_id(),
            rev: 1,
            folder: false,
            content: content.to_vec(),
        };
        self.docs.lock().unwrap().insert(p.to_string(), doc.clone());
        Self::file_record(p, &doc)
    }

    pub fn update_file(&self, p: &str, content: &[u8]) -> ChangeRecord {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs.get_mut(p).unwrap();
        doc.rev += 1;
        doc.content = content.to_vec();
        Self::file_record(p, doc)
    }

    pub fn mkdir(&self, p: &str) -> ChangeRecord {
        let doc = RemoteDoc {
            id: self.new_id(),
            rev: 1,
            folder: true,
            content: Vec::new(),
        };
        self.docs.lock().unwrap().insert(p.to_string(), doc.clone());
        let mut record = ChangeRecord::folder(path(p), Platform::Linux);
        record.remote = Some(doc.reference());
        record
    }

    /// Moves the document at `from` (and its content, for a folder) to `to`
    pub fn move_doc(&self, from: &str, to: &str) -> ChangeRecord {
        let mut docs = self.docs.lock().unwrap();
        Self::move_tree(&mut docs, from, to);
        let doc = docs.get_mut(to).unwrap();
        doc.rev += 1;
        if doc.folder {
            let mut record = ChangeRecord::folder(path(to), Platform::Linux);
            record.remote = Some(doc.reference());
            record
        } else {
            Self::file_record(to, doc)
        }
    }

    fn file_record(p: &str, doc: &RemoteDoc) -> ChangeRecord {
        let mut record = ChangeRecord::file(path(p), checksum(&doc.content), Platform::Linux);
        record.size = Some(doc.content.len() as u64);
        record.remote = Some(doc.reference());
        record
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn begin(&self, op: &str, record: &ChangeRecord) -> Result<(), WriteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(WriteError::new(WriteErrorKind::Unreachable, "remote is offline"));
        }
        if let Some(err) = self.failures.lock().unwrap().pop() {
            return Err(err);
        }
        self.ops.lock().unwrap().push(format!("{op} {}", record.path));
        Ok(())
    }

    /// Path of the document `record` points at: by remote id, then by path
    fn locate(docs: &BTreeMap<String, RemoteDoc>, record: &ChangeRecord) -> Option<String> {
        if let Some(remote) = &record.remote {
            if let Some((key, _)) = docs.iter().find(|(_, doc)| doc.id == remote.id) {
                return Some(key.clone());
            }
        }
        docs.contains_key(record.path.as_str())
            .then(|| record.path.as_str().to_string())
    }

    fn move_tree(docs: &mut BTreeMap<String, RemoteDoc>, from: &str, to: &str) {
        let keys: Vec<String> = docs.keys().filter(|k| is_within(k, from)).cloned().collect();
        for key in keys {
            if let Some(doc) = docs.remove(&key) {
                docs.insert(format!("{to}{}", &key[from.len()..]), doc);
            }
        }
    }

    fn remove_tree(docs: &mut BTreeMap<String, RemoteDoc>, root: &str) {
        docs.retain(|key, _| !is_within(key, root));
    }

    async fn read_all(source: &dyn IReader, record: &ChangeRecord) -> Result<Vec<u8>, WriteError> {
        let mut stream = source.create_read_stream(record).await?;
        let mut content = Vec::new();
        stream.reader.read_to_end(&mut content).await?;
        Ok(content)
    }

    fn touch(docs: &mut BTreeMap<String, RemoteDoc>, key: &str, record: &mut ChangeRecord) {
        if let Some(doc) = docs.get_mut(key) {
            doc.rev += 1;
            record.remote = Some(doc.reference());
        }
    }
}

#[async_trait::async_trait]
impl IReader for MemoryRemote {
    async fn create_read_stream(&self, record: &ChangeRecord) -> anyhow::Result<ReadStream> {
        let docs = self.docs.lock().unwrap();
        let key = Self::locate(&docs, record)
            .ok_or_else(|| anyhow::anyhow!("no remote document for {}", record.path))?;
        let content = docs[&key].content.clone();
        Ok(ReadStream {
            length: content.len() as u64,
            reader: Box::new(Cursor::new(content)),
        })
    }
}

#[async_trait::async_trait]
impl IWriter for MemoryRemote {
    async fn add_file(
        &self,
        record: &mut ChangeRecord,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError> {
        self.begin("add_file", record)?;
        let content = Self::read_all(source, record).await?;
        progress(content.len() as u64);

        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(record.path.as_str()) {
            return Err(WriteError::new(
                WriteErrorKind::ConflictingName,
                format!("{} already exists", record.path),
            ));
        }
        let doc = RemoteDoc {
            id: self.new_id(),
            rev: 1,
            folder: false,
            content,
        };
        record.remote = Some(doc.reference());
        docs.insert(record.path.as_str().to_string(), doc);
        Ok(())
    }

    async fn overwrite_file(
        &self,
        record: &mut ChangeRecord,
        _previous: Option<&ChangeRecord>,
        source: &dyn IReader,
        progress: Progress<'_>,
    ) -> Result<(), WriteError> {
        self.begin("overwrite_file", record)?;
        let content = Self::read_all(source, record).await?;
        progress(content.len() as u64);

        let mut docs = self.docs.lock().unwrap();
        let key = Self::locate(&docs, record).unwrap_or_else(|| record.path.as_str().to_string());
        let doc = docs.entry(key).or_insert_with(|| RemoteDoc {
            id: self.new_id(),
            rev: 0,
            folder: false,
            content: Vec::new(),
        });
        doc.rev += 1;
        doc.content = content;
        record.remote = Some(doc.reference());
        Ok(())
    }

    async fn update_file_metadata(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.begin("update_file_metadata", record)?;
        let mut docs = self.docs.lock().unwrap();
        if let Some(key) = Self::locate(&docs, record) {
            Self::touch(&mut docs, &key, record);
        }
        Ok(())
    }

    async fn add_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.begin("add_folder", record)?;
        let mut docs = self.docs.lock().unwrap();
        let key = record.path.as_str().to_string();
        if let Some(doc) = docs.get(&key).filter(|doc| doc.folder) {
            record.remote = Some(doc.reference());
            return Ok(());
        }
        let doc = RemoteDoc {
            id: self.new_id(),
            rev: 1,
            folder: true,
            content: Vec::new(),
        };
        record.remote = Some(doc.reference());
        docs.insert(key, doc);
        Ok(())
    }

    async fn update_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.begin("update_folder", record)?;
        let mut docs = self.docs.lock().unwrap();
        if let Some(key) = Self::locate(&docs, record) {
            Self::touch(&mut docs, &key, record);
        }
        Ok(())
    }

    async fn move_record(
        &self,
        record: &mut ChangeRecord,
        from: &ChangeRecord,
    ) -> Result<(), WriteError> {
        self.begin("move_record", record)?;
        let mut docs = self.docs.lock().unwrap();
        let Some(src) = Self::locate(&docs, from) else {
            return Err(WriteError::other(format!("{} not found", from.path)));
        };
        let dst = record.path.as_str().to_string();
        Self::move_tree(&mut docs, &src, &dst);
        Self::touch(&mut docs, &dst, record);
        Ok(())
    }

    async fn assign_new_revision(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.begin("assign_new_revision", record)?;
        let docs = self.docs.lock().unwrap();
        if let Some(doc) = docs.get(record.path.as_str()) {
            record.remote = Some(doc.reference());
        }
        Ok(())
    }

    async fn trash(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.begin("trash", record)?;
        let mut docs = self.docs.lock().unwrap();
        if let Some(key) = Self::locate(&docs, record) {
            Self::remove_tree(&mut docs, &key);
        }
        Ok(())
    }

    async fn delete_folder(&self, record: &mut ChangeRecord) -> Result<(), WriteError> {
        self.begin("delete_folder", record)?;
        let mut docs = self.docs.lock().unwrap();
        if let Some(key) = Self::locate(&docs, record) {
            Self::remove_tree(&mut docs, &key);
        }
        Ok(())
    }

    async fn rename_conflicting(
        &self,
        record: &mut ChangeRecord,
        new_path: &DocPath,
    ) -> Result<(), WriteError> {
        self.begin("rename_conflicting", record)?;
        let mut docs = self.docs.lock().unwrap();
        let Some(src) = Self::locate(&docs, record) else {
            return Err(WriteError::other(format!("{} not found", record.path)));
        };
        Self::move_tree(&mut docs, &src, new_path.as_str());
        Self::touch(&mut docs, new_path.as_str(), record);
        Ok(())
    }

    async fn ping(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A local folder, a memory remote and everything wired between them
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub store: Arc<dyn IMetadataStore>,
    pub local: Arc<LocalSide>,
    pub remote: Arc<MemoryRemote>,
    pub prep: Prep,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|builder| builder).await
    }

    pub async fn with_config(configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        let dir = TempDir::new().unwrap();
        let base = ConfigBuilder::new()
            .sync_root(dir.path().to_path_buf())
            .sync_transfer_retries(1, 1)
            .sync_trashing_delay_ms(10);
        let config = configure(base).build();
        let platform = config.sync.platform();

        let pool = DatabasePool::in_memory().await.unwrap();
        let store: Arc<dyn IMetadataStore> =
            Arc::new(SqliteMetadataStore::open(pool.pool().clone()).await.unwrap());

        let local = Arc::new(LocalSide::new(dir.path(), config.sync.trash_dir.clone()));
        let remote = Arc::new(MemoryRemote::default());

        let local_writer: Arc<dyn IWriter> = local.clone();
        let remote_writer: Arc<dyn IWriter> = remote.clone();
        let merge = Arc::new(Merge::new(
            store.clone(),
            SidePair::new(local_writer.clone(), remote_writer.clone()),
            &config,
        ));
        let ignore = Arc::new(GlobIgnore::from_config(
            &config.ignore,
            &config.sync.trash_dir,
            platform,
        ));
        let prep = Prep::new(merge.clone(), ignore.clone(), &config);

        let sides = SidePair::new(
            SideAdapter {
                side: Side::Local,
                writer: local_writer,
                reader: local.clone(),
                watcher: Arc::new(IdleWatcher::default()),
            },
            SideAdapter {
                side: Side::Remote,
                writer: remote_writer,
                reader: remote.clone(),
                watcher: Arc::new(IdleWatcher::default()),
            },
        );
        let engine = Arc::new(SyncEngine::new(store.clone(), merge, ignore, sides, &config));

        Self {
            dir,
            config,
            store,
            local,
            remote,
            prep,
            engine,
        }
    }

    pub fn abspath(&self, p: &str) -> PathBuf {
        self.local.abspath(&path(p))
    }

    /// Drains every pending change once
    pub async fn sync(&self) {
        self.engine.sync(true).await.unwrap();
    }

    pub async fn stored(&self, p: &str) -> Option<ChangeRecord> {
        self.store.get_by_path(&path(p)).await.unwrap()
    }

    /// Every record of the store at its latest revision
    pub async fn records(&self) -> Vec<ChangeRecord> {
        self.store
            .changes_since(0)
            .await
            .unwrap()
            .into_iter()
            .map(|change| change.record)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Local changes, returned the way the local watcher reports them
    // ------------------------------------------------------------------------

    pub fn write_local(&self, p: &str, content: &[u8]) -> ChangeRecord {
        let target = self.abspath(p);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&target, content).unwrap();
        self.local_doc(p)
    }

    pub fn mkdir_local(&self, p: &str) -> ChangeRecord {
        std::fs::create_dir_all(self.abspath(p)).unwrap();
        self.local_doc(p)
    }

    /// Record describing what is currently on disk at `p`
    pub fn local_doc(&self, p: &str) -> ChangeRecord {
        let target = self.abspath(p);
        let metadata = std::fs::metadata(&target).unwrap();
        let platform = self.config.sync.platform();

        let mut record = if metadata.is_dir() {
            ChangeRecord::folder(path(p), platform)
        } else {
            let content = std::fs::read(&target).unwrap();
            let mut file = ChangeRecord::file(path(p), checksum(&content), platform);
            file.size = Some(content.len() as u64);
            file
        };
        record.ino = Some(metadata.ino());
        record
    }

    pub fn read_local(&self, p: &str) -> Option<Vec<u8>> {
        std::fs::read(self.abspath(p)).ok()
    }
}
