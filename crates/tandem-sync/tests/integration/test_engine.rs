//! Sync driver behavior: convergence, error policy and the run loop

use std::time::{Duration, Instant};

use tandem_core::domain::Side;
use tandem_core::ports::{IWriter, WriteErrorKind};
use tandem_sync::{LifecycleState, SyncEvent};

use crate::common::Harness;

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_changes_from_both_sides_converge() {
    let h = Harness::new().await;

    let folder = h.mkdir_local("photos");
    h.prep.put_folder(Side::Local, folder).await.unwrap();
    let file = h.write_local("photos/cat.jpg", b"meow");
    h.prep.add_file(Side::Local, file).await.unwrap();

    let remote_folder = h.remote.mkdir("docs");
    h.prep.put_folder(Side::Remote, remote_folder).await.unwrap();
    let remote_file = h.remote.put_file("docs/todo.md", b"- sync");
    h.prep.add_file(Side::Remote, remote_file).await.unwrap();

    h.sync().await;

    assert_eq!(h.read_local("docs/todo.md"), Some(b"- sync".to_vec()));
    assert_eq!(h.remote.content("photos/cat.jpg"), Some(b"meow".to_vec()));
    for record in h.records().await {
        assert_eq!(record.sides.local, record.sides.target, "{}", record.path);
        assert_eq!(record.sides.remote, record.sides.target, "{}", record.path);
    }
    assert_eq!(
        h.store.checkpoint().await.unwrap(),
        h.store.update_seq().await.unwrap()
    );

    // A second pass has nothing left to write
    let ops = h.remote.ops().len();
    h.sync().await;
    assert_eq!(h.remote.ops().len(), ops);
}

#[tokio::test]
async fn test_failing_change_is_abandoned_after_max_attempts() {
    let h = Harness::with_config(|b| b.sync_max_sync_attempts(2)).await;
    h.remote.fail_next(3, WriteErrorKind::Other);

    let file = h.write_local("stuck.txt", b"data");
    h.prep.add_file(Side::Local, file).await.unwrap();
    h.sync().await;

    assert_eq!(h.remote.pending_failures(), 0);
    assert!(!h.remote.exists("stuck.txt"));
    let record = h.stored("stuck.txt").await.unwrap();
    assert_eq!(record.errors, 2);
    assert_eq!(
        h.store.checkpoint().await.unwrap(),
        h.store.update_seq().await.unwrap()
    );

    // Later changes still go through
    let other = h.write_local("fine.txt", b"ok");
    h.prep.add_file(Side::Local, other).await.unwrap();
    h.sync().await;
    assert_eq!(h.remote.paths(), vec!["fine.txt".to_string()]);
}

#[tokio::test]
async fn test_move_already_on_disk_is_marked_up_to_date() {
    let h = Harness::new().await;
    let file = h.write_local("a.txt", b"content");
    h.prep.add_file(Side::Local, file).await.unwrap();
    h.sync().await;

    let was = h.stored("a.txt").await.unwrap();
    let moved = h.remote.move_doc("a.txt", "b.txt");
    h.prep.move_file(Side::Remote, moved, was.clone()).await.unwrap();

    // A previous run renamed the file, then stopped before recording it
    let mut dst = h.stored("b.txt").await.unwrap();
    h.local.move_record(&mut dst, &was).await.unwrap();

    h.sync().await;

    let record = h.stored("b.txt").await.unwrap();
    assert_eq!(record.errors, 0);
    assert_eq!(record.sides.local, record.sides.target);
    assert_eq!(record.sides.remote, record.sides.target);
    assert!(record.move_from.is_none());
    assert!(h.stored("a.txt").await.is_none());
    assert_eq!(h.read_local("b.txt"), Some(b"content".to_vec()));
    assert_eq!(h.read_local("a.txt"), None);
    assert_eq!(
        h.store.checkpoint().await.unwrap(),
        h.store.update_seq().await.unwrap()
    );
}

#[tokio::test]
async fn test_trashed_siblings_wait_for_their_parent_once() {
    let h = Harness::with_config(|b| b.sync_trashing_delay_ms(300)).await;
    let dir = h.mkdir_local("dir");
    h.prep.put_folder(Side::Local, dir).await.unwrap();
    let names: Vec<String> = (0..6).map(|i| format!("dir/{i}.txt")).collect();
    for name in &names {
        let file = h.write_local(name, name.as_bytes());
        h.prep.add_file(Side::Local, file).await.unwrap();
    }
    h.sync().await;

    for name in &names {
        let was = h.stored(name).await.unwrap();
        std::fs::remove_file(h.abspath(name)).unwrap();
        h.prep.trash_file(Side::Local, was, None).await.unwrap();
    }

    let started = Instant::now();
    h.sync().await;

    assert!(started.elapsed() < Duration::from_millis(1200));
    assert_eq!(h.remote.paths(), vec!["dir".to_string()]);
}

#[tokio::test]
async fn test_unreachable_remote_blocks_until_back_online() {
    let h = Harness::new().await;
    let mut events = h.engine.subscribe();
    h.remote.set_unreachable(true);

    let file = h.write_local("offline.txt", b"later");
    h.prep.add_file(Side::Local, file).await.unwrap();
    let seq = h.store.update_seq().await.unwrap();
    h.sync().await;

    assert!(h.engine.lifecycle().is_blocked());
    // Blocking leaves the record as merged
    assert_eq!(h.stored("offline.txt").await.unwrap().errors, 0);
    assert_eq!(h.store.update_seq().await.unwrap(), seq);
    assert!(!h.remote.exists("offline.txt"));
    let mut offline = false;
    while let Ok(event) = events.try_recv() {
        offline |= event == SyncEvent::Offline;
    }
    assert!(offline);

    h.remote.set_unreachable(false);
    h.engine.user_action_done();
    let engine = h.engine.clone();
    wait_until(move || !engine.lifecycle().is_blocked()).await;

    h.sync().await;
    assert_eq!(h.remote.content("offline.txt"), Some(b"later".to_vec()));
}

#[tokio::test]
async fn test_running_engine_syncs_new_changes_until_stopped() {
    let h = Harness::new().await;
    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.start().await });
    h.engine.lifecycle().started().await;

    let file = h.write_local("live.txt", b"watching");
    h.prep.add_file(Side::Local, file).await.unwrap();

    let remote = h.remote.clone();
    wait_until(move || remote.exists("live.txt")).await;

    h.engine.stop().await.unwrap();
    run.await.unwrap().unwrap();
    assert_eq!(h.engine.lifecycle().state(), LifecycleState::Stopped);
}
