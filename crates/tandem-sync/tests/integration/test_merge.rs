//! Merge behavior against a real store and replica fakes
//!
//! Covers what watchers reporting the same or clashing changes leave in
//! the metadata store, and how those records are then synced.

use tandem_core::domain::{ChangeRecord, RevisionRef, Side, NOTE_MIME_TYPE};

use crate::common::Harness;

#[tokio::test]
async fn test_reported_move_is_idempotent() {
    let h = Harness::new().await;
    let file = h.write_local("a.txt", b"content");
    h.prep.add_file(Side::Local, file).await.unwrap();
    h.sync().await;

    std::fs::rename(h.abspath("a.txt"), h.abspath("b.txt")).unwrap();
    let was = h.stored("a.txt").await.unwrap();
    h.prep
        .move_file(Side::Local, h.local_doc("b.txt"), was.clone())
        .await
        .unwrap();
    let seq = h.store.update_seq().await.unwrap();

    // Reported again, e.g. after a watcher restart
    h.prep
        .move_file(Side::Local, h.local_doc("b.txt"), was)
        .await
        .unwrap();
    assert_eq!(h.store.update_seq().await.unwrap(), seq);

    h.sync().await;
    assert_eq!(h.remote.paths(), vec!["b.txt".to_string()]);
    assert_eq!(h.remote.content("b.txt"), Some(b"content".to_vec()));
    assert!(h.stored("a.txt").await.is_none());
}

#[tokio::test]
async fn test_same_content_added_on_both_sides_is_not_a_conflict() {
    let h = Harness::new().await;
    let local = h.write_local("same.txt", b"identical");
    h.prep.add_file(Side::Local, local).await.unwrap();

    let remote = h.remote.put_file("same.txt", b"identical");
    let remote_ref = remote.remote.clone();
    h.prep.add_file(Side::Remote, remote).await.unwrap();

    let record = h.stored("same.txt").await.unwrap();
    assert_eq!(record.remote, remote_ref);
    assert!(record.sides.local > 0);
    assert!(record.sides.remote > 0);
    assert!(h.remote.ops().is_empty());
}

#[tokio::test]
async fn test_different_content_added_on_both_sides_keeps_both() {
    let h = Harness::new().await;
    let local = h.write_local("report.txt", b"mine");
    h.prep.add_file(Side::Local, local).await.unwrap();

    let remote = h.remote.put_file("report.txt", b"theirs");
    h.prep.add_file(Side::Remote, remote).await.unwrap();

    let conflict = h
        .remote
        .paths()
        .into_iter()
        .find(|p| p.starts_with("report-conflict-") && p.ends_with(".txt"))
        .unwrap();
    assert!(!h.remote.exists("report.txt"));
    assert!(h.stored(&conflict).await.is_some());

    h.sync().await;
    assert_eq!(h.remote.content("report.txt"), Some(b"mine".to_vec()));
    assert_eq!(h.read_local(&conflict), Some(b"theirs".to_vec()));
}

#[tokio::test]
async fn test_trashed_folder_with_remote_edit_is_restored() {
    let h = Harness::new().await;
    let dir = h.mkdir_local("dir");
    h.prep.put_folder(Side::Local, dir).await.unwrap();
    let file = h.write_local("dir/a.txt", b"v1");
    h.prep.add_file(Side::Local, file).await.unwrap();
    h.sync().await;

    let updated = h.remote.update_file("dir/a.txt", b"v2");
    h.prep.update_file(Side::Remote, updated).await.unwrap();

    let was = h.stored("dir").await.unwrap();
    h.prep.trash_folder(Side::Local, was, None).await.unwrap();

    let folder = h.stored("dir").await.unwrap();
    assert!(!folder.deleted);
    assert!(!folder.trashed);
    assert_eq!(folder.sides.local, 0);
}

#[tokio::test]
async fn test_ignored_local_changes_are_not_merged() {
    let h = Harness::with_config(|b| b.ignore_pattern("*.log")).await;
    let file = h.write_local("debug.log", b"noise");
    h.prep.add_file(Side::Local, file).await.unwrap();

    assert!(h.stored("debug.log").await.is_none());
    assert_eq!(h.store.update_seq().await.unwrap(), 0);
}

#[tokio::test]
async fn test_ignore_rules_only_apply_to_local_changes() {
    let h = Harness::with_config(|b| b.ignore_pattern("*.log")).await;
    let incoming = h.remote.put_file("server.log", b"remote log");
    h.prep.add_file(Side::Remote, incoming).await.unwrap();

    let record = h.stored("server.log").await.unwrap();
    assert!(record.sides.remote > 0);
    assert_eq!(record.sides.local, 0);
}

#[tokio::test]
async fn test_local_move_over_existing_file_overwrites_it() {
    let h = Harness::new().await;
    for (name, content) in [("a.txt", b"from a"), ("b.txt", b"from b")] {
        let file = h.write_local(name, content);
        h.prep.add_file(Side::Local, file).await.unwrap();
    }
    h.sync().await;

    std::fs::rename(h.abspath("a.txt"), h.abspath("b.txt")).unwrap();
    let was = h.stored("a.txt").await.unwrap();
    let replaced = h.stored("b.txt").await.unwrap();
    let mut doc = h.local_doc("b.txt");
    doc.overwrite = Some(RevisionRef::current_of(&replaced));
    h.prep.move_file(Side::Local, doc, was).await.unwrap();

    let moved = h.stored("b.txt").await.unwrap();
    assert!(moved.overwrite.is_some());
    assert!(moved.move_from.is_some());

    h.sync().await;

    assert_eq!(h.remote.paths(), vec!["b.txt".to_string()]);
    assert_eq!(h.remote.content("b.txt"), Some(b"from a".to_vec()));
    assert!(h.stored("a.txt").await.is_none());
    let synced = h.stored("b.txt").await.unwrap();
    assert!(synced.overwrite.is_none());
    assert_eq!(synced.sides.remote, synced.sides.target);
}

#[tokio::test]
async fn test_local_edit_of_remotely_edited_note_keeps_local_in_place() {
    let h = Harness::new().await;
    let as_note = |mut record: ChangeRecord| {
        record.mime = Some(NOTE_MIME_TYPE.to_string());
        record.metadata = Some(serde_json::json!({ "title": "todo" }));
        record
    };

    let note = as_note(h.remote.put_file("todo.cozy-note", b"v1"));
    h.prep.add_file(Side::Remote, note).await.unwrap();
    h.sync().await;
    assert_eq!(h.read_local("todo.cozy-note"), Some(b"v1".to_vec()));

    let remote_edit = as_note(h.remote.update_file("todo.cozy-note", b"remote v2"));
    h.prep.update_file(Side::Remote, remote_edit).await.unwrap();

    let local_edit = h.write_local("todo.cozy-note", b"local v2");
    h.prep.update_file(Side::Local, local_edit).await.unwrap();

    // The remote version is the one renamed away
    let conflict = h
        .remote
        .paths()
        .into_iter()
        .find(|p| p.starts_with("todo-conflict-"))
        .unwrap();
    assert!(!h.remote.exists("todo.cozy-note"));
    let kept = h.stored("todo.cozy-note").await.unwrap();
    assert!(kept.remote.is_none());

    h.sync().await;

    assert_eq!(h.read_local("todo.cozy-note"), Some(b"local v2".to_vec()));
    assert_eq!(h.remote.content("todo.cozy-note"), Some(b"local v2".to_vec()));
    assert_eq!(h.read_local(&conflict), Some(b"remote v2".to_vec()));
}
