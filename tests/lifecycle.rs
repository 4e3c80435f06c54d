//! Single-process lifecycle: create, update, reopen, compact, close.

mod fixtures;

use fishtrap::store::scan::scan_directory;
use fishtrap::store::snapshot::read_snapshot;
use fishtrap::Error;
use tempfile::TempDir;

use fixtures::{Doc, app_id, doc, files_with_suffix, open_db, shard_id};

#[test]
fn create_update_read_reopen() {
    let temp = TempDir::new().unwrap();
    let db = open_db(temp.path(), shard_id(1), doc(0, &[]));

    let updated = db.update(|d| d.something = 2).unwrap();
    assert_eq!(updated.something, 2);
    assert_eq!(db.get().unwrap().something, 2);

    db.close().unwrap();
    assert!(matches!(db.get(), Err(Error::Closed)));
    assert!(matches!(db.update(|d| d.something = 9), Err(Error::Closed)));

    db.open().unwrap();
    assert_eq!(db.get().unwrap().something, 2);
}

#[test]
fn single_process_compaction() {
    let temp = TempDir::new().unwrap();
    let db = open_db(temp.path(), shard_id(1), doc(0, &[]));
    db.update(|d| d.something = 2).unwrap();

    db.force_compaction().unwrap();

    let snapshots = files_with_suffix(temp.path(), ".sdsn");
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].contains(".00000001."), "{snapshots:?}");
    assert!(files_with_suffix(temp.path(), ".sdsh").is_empty());
    assert!(files_with_suffix(temp.path(), ".sdlk").is_empty());

    assert_eq!(db.get().unwrap().something, 2);

    db.close().unwrap();
    db.open().unwrap();
    assert_eq!(db.get().unwrap().something, 2);
}

#[test]
fn compaction_records_ancestor_sequences() {
    let temp = TempDir::new().unwrap();
    let p1 = open_db(temp.path(), shard_id(1), doc(0, &[]));
    let p2 = open_db(temp.path(), shard_id(2), doc(0, &[]));

    p1.update(|d| d.something = 1).unwrap();
    p1.update(|d| d.something = 2).unwrap();
    p2.update(|d| d.other.push("from p2".into())).unwrap();

    p1.force_compaction().unwrap();

    let scan = scan_directory(temp.path(), app_id(), shard_id(1), false).unwrap();
    let desc = scan.snapshot_at(1).expect("snapshot at generation 1");
    let snapshot = read_snapshot::<Doc>(temp.path(), desc, app_id()).unwrap();
    assert_eq!(snapshot.ancestors.get(&shard_id(1)), Some(&2));
    assert_eq!(snapshot.ancestors.get(&shard_id(2)), Some(&1));
}

#[test]
fn post_compaction_hook_sees_merged_and_base() {
    let temp = TempDir::new().unwrap();
    let (tx, rx) = crossbeam::channel::unbounded::<(Doc, Doc)>();
    let db = fishtrap::Database::new(
        fixtures::test_config(temp.path(), shard_id(1)),
        doc(0, &[]),
        Box::new(fixtures::merge_docs),
        Some(Box::new(move |merged: &Doc, base: &Doc| {
            let _ = tx.send((merged.clone(), base.clone()));
        })),
    )
    .unwrap();

    db.update(|d| d.something = 2).unwrap();
    db.force_compaction().unwrap();

    let (merged, base) = rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("hook fired");
    assert_eq!(merged.something, 2);
    assert_eq!(base, doc(0, &[]));
}

#[test]
fn updates_without_changes_write_nothing() {
    let temp = TempDir::new().unwrap();
    let db = open_db(temp.path(), shard_id(1), doc(0, &[]));

    db.update(|_| {}).unwrap();
    assert!(files_with_suffix(temp.path(), ".sdsh").is_empty());

    db.update(|d| d.something = 1).unwrap();
    assert_eq!(files_with_suffix(temp.path(), ".sdsh").len(), 1);
}

#[test]
fn updater_panic_leaves_queue_running() {
    let temp = TempDir::new().unwrap();
    let db = open_db(temp.path(), shard_id(1), doc(0, &[]));

    assert!(matches!(
        db.update(|_| panic!("user bug")),
        Err(Error::UpdaterPanicked)
    ));
    assert_eq!(db.get().unwrap(), doc(0, &[]));

    db.update(|d| d.something = 3).unwrap();
    assert_eq!(db.get().unwrap().something, 3);
}

#[test]
fn close_and_open_are_idempotent() {
    let temp = TempDir::new().unwrap();
    let db = open_db(temp.path(), shard_id(1), doc(0, &[]));
    db.close().unwrap();
    db.close().unwrap();
    db.open().unwrap();
    db.open().unwrap();
    assert_eq!(db.get().unwrap(), doc(0, &[]));
}

#[test]
fn transactions_survive_reopen_in_order() {
    let temp = TempDir::new().unwrap();
    let db = open_db(temp.path(), shard_id(1), doc(0, &[]));
    for i in 1..=5 {
        db.update(move |d| {
            d.something = i;
            d.other.push(format!("step {i}"));
        })
        .unwrap();
    }
    db.close().unwrap();
    db.open().unwrap();

    let value = db.get().unwrap();
    assert_eq!(value.something, 5);
    assert_eq!(value.other.len(), 5);
    assert_eq!(value.other[4], "step 5");
}

#[test]
fn distinct_shards_per_process() {
    let temp = TempDir::new().unwrap();
    let p1 = open_db(temp.path(), shard_id(1), doc(0, &[]));
    let p2 = open_db(temp.path(), shard_id(2), doc(0, &[]));

    p1.update(|d| d.something = 1).unwrap();
    p2.update(|d| d.something = 2).unwrap();

    let shards = files_with_suffix(temp.path(), ".sdsh");
    assert_eq!(shards.len(), 2);
    assert!(shards.iter().any(|n| n.starts_with(&shard_id(1).to_string())));
    assert!(shards.iter().any(|n| n.starts_with(&shard_id(2).to_string())));

    // Local writes are invisible to peers until reconciliation.
    assert_eq!(p1.get().unwrap().something, 1);
    assert_eq!(p2.get().unwrap().something, 2);
}
