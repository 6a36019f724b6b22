//! End-to-end scenarios: changes merged from the watchers, then synced
//!
//! - Moving a folder that never reached the remote side
//! - Case-only identity clash on a case-insensitive platform
//! - Local deletion racing a remote update
//! - Folder deletion cascading to every descendant, or stopping at content
//!   modified on the other side
//! - Synced folder and file moves

use tandem_core::domain::{Platform, Side};
use tandem_sync::SyncEvent;

use crate::common::Harness;

#[tokio::test]
async fn test_unsynced_folder_move_collapses_to_destination() {
    let h = Harness::new().await;

    let src = h.mkdir_local("src");
    h.prep.put_folder(Side::Local, src).await.unwrap();
    let file = h.write_local("src/a.txt", b"hello");
    h.prep.add_file(Side::Local, file).await.unwrap();

    std::fs::rename(h.abspath("src"), h.abspath("dst")).unwrap();
    let was = h.stored("src").await.unwrap();
    let dst = h.local_doc("dst");
    h.prep.move_folder(Side::Local, dst, was).await.unwrap();

    assert!(h.stored("src").await.is_none());
    assert!(h.stored("src/a.txt").await.is_none());

    h.sync().await;

    assert_eq!(h.remote.paths(), vec!["dst".to_string(), "dst/a.txt".to_string()]);
    assert_eq!(h.remote.content("dst/a.txt"), Some(b"hello".to_vec()));
    assert!(h.remote.ops().iter().all(|op| !op.starts_with("move_record")));
}

#[tokio::test]
async fn test_case_only_clash_renames_the_remote_document() {
    let h = Harness::with_config(|b| b.sync_platform(Platform::Windows)).await;

    let local = h.write_local("ALFRED", b"local content");
    h.prep.add_file(Side::Local, local).await.unwrap();

    let incoming = h.remote.put_file("alfred", b"remote content");
    h.prep.add_file(Side::Remote, incoming).await.unwrap();

    // The local file keeps its place, the remote one is renamed away
    let kept = h.stored("ALFRED").await.unwrap();
    assert!(kept.remote.is_none());
    assert!(!h.remote.exists("alfred"));
    let conflict = h
        .remote
        .paths()
        .into_iter()
        .find(|p| p.starts_with("alfred-conflict-"))
        .unwrap();
    assert!(h.stored(&conflict).await.is_some());

    h.sync().await;

    assert_eq!(h.remote.content("ALFRED"), Some(b"local content".to_vec()));
    assert_eq!(h.remote.content(&conflict), Some(b"remote content".to_vec()));
    assert_eq!(h.read_local(&conflict), Some(b"remote content".to_vec()));
    assert_eq!(h.read_local("ALFRED"), Some(b"local content".to_vec()));
}

#[tokio::test]
async fn test_local_delete_of_remotely_updated_file_restores_it() {
    let h = Harness::new().await;

    let file = h.write_local("notes.txt", b"v1");
    h.prep.add_file(Side::Local, file).await.unwrap();
    h.sync().await;
    assert_eq!(h.remote.content("notes.txt"), Some(b"v1".to_vec()));

    let updated = h.remote.update_file("notes.txt", b"v2");
    h.prep.update_file(Side::Remote, updated).await.unwrap();

    std::fs::remove_file(h.abspath("notes.txt")).unwrap();
    let deleted = h.stored("notes.txt").await.unwrap();
    h.prep.delete_file(Side::Local, deleted).await.unwrap();

    let kept = h.stored("notes.txt").await.unwrap();
    assert!(!kept.deleted);
    assert_eq!(kept.sides.local, 0);

    h.sync().await;

    assert_eq!(h.read_local("notes.txt"), Some(b"v2".to_vec()));
    assert_eq!(h.remote.content("notes.txt"), Some(b"v2".to_vec()));
    let synced = h.stored("notes.txt").await.unwrap();
    assert_eq!(synced.sides.local, synced.sides.target);
    assert_eq!(synced.sides.remote, synced.sides.target);
}

#[tokio::test]
async fn test_folder_deletion_removes_every_descendant() {
    let h = Harness::new().await;

    let dir = h.mkdir_local("dir");
    h.prep.put_folder(Side::Local, dir).await.unwrap();
    let sub = h.mkdir_local("dir/sub");
    h.prep.put_folder(Side::Local, sub).await.unwrap();
    for name in ["dir/a.txt", "dir/b.txt", "dir/sub/c.txt"] {
        let file = h.write_local(name, name.as_bytes());
        h.prep.add_file(Side::Local, file).await.unwrap();
    }
    h.sync().await;
    assert_eq!(h.remote.paths().len(), 5);

    std::fs::remove_dir_all(h.abspath("dir")).unwrap();
    let folder = h.stored("dir").await.unwrap();
    h.prep.delete_folder(Side::Local, folder).await.unwrap();

    let tombstones = h.records().await.into_iter().filter(|r| r.deleted).count();
    assert_eq!(tombstones, 5);

    let mut events = h.engine.subscribe();
    h.sync().await;

    assert!(h.remote.paths().is_empty());
    assert!(h.records().await.is_empty());

    let mut deleted_files = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::DeleteFile(path) = event {
            deleted_files.push(path.to_string());
        }
    }
    deleted_files.sort();
    assert_eq!(deleted_files, vec!["dir/a.txt", "dir/b.txt", "dir/sub/c.txt"]);
}

#[tokio::test]
async fn test_synced_folder_move_carries_its_content() {
    let h = Harness::new().await;
    let src = h.mkdir_local("src");
    h.prep.put_folder(Side::Local, src).await.unwrap();
    let sub = h.mkdir_local("src/sub");
    h.prep.put_folder(Side::Local, sub).await.unwrap();
    for name in ["src/a.txt", "src/sub/b.txt"] {
        let file = h.write_local(name, name.as_bytes());
        h.prep.add_file(Side::Local, file).await.unwrap();
    }
    h.sync().await;

    std::fs::rename(h.abspath("src"), h.abspath("dst")).unwrap();
    let was = h.stored("src").await.unwrap();
    h.prep
        .move_folder(Side::Local, h.local_doc("dst"), was)
        .await
        .unwrap();
    let ops_before = h.remote.ops().len();

    h.sync().await;

    assert_eq!(
        h.remote.paths(),
        vec!["dst", "dst/a.txt", "dst/sub", "dst/sub/b.txt"]
    );
    assert_eq!(h.remote.content("dst/sub/b.txt"), Some(b"src/sub/b.txt".to_vec()));

    // One remote move for the folder, the children only follow it
    let moves: Vec<String> = h.remote.ops()[ops_before..]
        .iter()
        .filter(|op| op.starts_with("move_record"))
        .cloned()
        .collect();
    assert_eq!(moves, vec!["move_record dst".to_string()]);

    for record in h.records().await {
        assert!(record.path.as_str().starts_with("dst"), "{}", record.path);
        assert_eq!(record.sides.local, record.sides.target, "{}", record.path);
        assert_eq!(record.sides.remote, record.sides.target, "{}", record.path);
    }
}

#[tokio::test]
async fn test_remote_move_into_synced_folder() {
    let h = Harness::new().await;
    let dir = h.mkdir_local("dir");
    h.prep.put_folder(Side::Local, dir).await.unwrap();
    let file = h.write_local("a.txt", b"payload");
    h.prep.add_file(Side::Local, file).await.unwrap();
    h.sync().await;

    let was = h.stored("a.txt").await.unwrap();
    let moved = h.remote.move_doc("a.txt", "dir/a.txt");
    h.prep.move_file(Side::Remote, moved, was).await.unwrap();
    h.sync().await;

    assert_eq!(h.read_local("dir/a.txt"), Some(b"payload".to_vec()));
    assert_eq!(h.read_local("a.txt"), None);
    assert!(h.stored("a.txt").await.is_none());
    let record = h.stored("dir/a.txt").await.unwrap();
    assert_eq!(record.sides.local, record.sides.target);
}

#[tokio::test]
async fn test_folder_deletion_keeps_remotely_modified_descendant_and_ancestors() {
    let h = Harness::new().await;
    for folder in ["a", "a/b"] {
        let doc = h.mkdir_local(folder);
        h.prep.put_folder(Side::Local, doc).await.unwrap();
    }
    for name in ["a/b/c.txt", "a/other.txt"] {
        let file = h.write_local(name, b"v1");
        h.prep.add_file(Side::Local, file).await.unwrap();
    }
    h.sync().await;

    let updated = h.remote.update_file("a/b/c.txt", b"v2");
    h.prep.update_file(Side::Remote, updated).await.unwrap();

    std::fs::remove_dir_all(h.abspath("a")).unwrap();
    let folder = h.stored("a").await.unwrap();
    h.prep.delete_folder(Side::Local, folder).await.unwrap();

    for kept in ["a", "a/b", "a/b/c.txt"] {
        let record = h.stored(kept).await.unwrap();
        assert!(!record.deleted, "{kept}");
        assert_eq!(record.sides.local, 0, "{kept}");
    }
    assert!(h.stored("a/other.txt").await.unwrap().deleted);

    h.sync().await;

    assert_eq!(h.remote.paths(), vec!["a", "a/b", "a/b/c.txt"]);
    assert_eq!(h.read_local("a/b/c.txt"), Some(b"v2".to_vec()));
    assert_eq!(h.read_local("a/other.txt"), None);
    assert!(h.stored("a/other.txt").await.is_none());
}
