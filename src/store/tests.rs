//! Unit tests for the state stores.

use super::*;
use crate::task::TaskStatus;
use crate::test_support::descriptor;
use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

fn file_store(tmp: &TempDir) -> FileStore {
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("state"))
        .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
    FileStore::open(&root).unwrap_or_else(|err| panic!("open file store: {err}"))
}

fn exercise_contract(store: &dyn StateStore) {
    let first = descriptor("task-a", "alice", TaskStatus::Running);
    let second = descriptor("task-b", "alice", TaskStatus::Submitted);
    let finished = descriptor("task-c", "alice", TaskStatus::Completed);
    let foreign = descriptor("task-d", "bob", TaskStatus::Running);
    for record in [&first, &second, &finished, &foreign] {
        store.insert(record).expect("insert");
    }

    assert_eq!(store.count_active("alice").expect("count"), 2);
    assert_eq!(store.count_active("bob").expect("count"), 1);
    assert_eq!(store.count_active("carol").expect("count"), 0);

    let found = store.find(&first.task_id).expect("find");
    assert_eq!(found.as_ref(), Some(&first));

    let updated = store
        .update(&first.task_id, &TaskUpdate::status(TaskStatus::Failed))
        .expect("update")
        .expect("record exists");
    assert_eq!(updated.status, TaskStatus::Failed);
    assert_eq!(store.count_active("alice").expect("count"), 1);

    assert!(store.delete(&second.task_id).expect("delete"));
    assert!(!store.delete(&second.task_id).expect("second delete"));
    let resurrected = store
        .update(&second.task_id, &TaskUpdate::status(TaskStatus::Running))
        .expect("update after delete");
    assert!(resurrected.is_none(), "update must not resurrect a record");
    assert!(store.find(&second.task_id).expect("find").is_none());
}

#[rstest]
fn memory_store_honours_contract() {
    exercise_contract(&MemoryStore::new());
}

#[rstest]
fn file_store_honours_contract() {
    let tmp = TempDir::new().expect("tempdir");
    exercise_contract(&file_store(&tmp));
}

#[rstest]
fn file_store_rejects_duplicates_and_bad_keys() {
    let tmp = TempDir::new().expect("tempdir");
    let store = file_store(&tmp);
    let record = descriptor("task-a", "alice", TaskStatus::Submitted);
    store.insert(&record).expect("insert");

    let err = store.insert(&record).expect_err("duplicate insert");
    assert!(matches!(err, StoreError::Duplicate { .. }));

    let traversal = descriptor("../escape", "alice", TaskStatus::Submitted);
    let err = store.insert(&traversal).expect_err("path-like key");
    assert!(matches!(err, StoreError::InvalidKey { .. }));
}

#[rstest]
fn file_store_survives_reopen() {
    let tmp = TempDir::new().expect("tempdir");
    let record = descriptor("task-a", "alice", TaskStatus::Running);
    file_store(&tmp).insert(&record).expect("insert");

    let reopened = file_store(&tmp);
    assert_eq!(reopened.find(&record.task_id).expect("find"), Some(record));
}

#[rstest]
fn results_are_only_recorded_once() {
    let store = MemoryStore::new();
    let record = descriptor("task-a", "alice", TaskStatus::Running);
    store.insert(&record).expect("insert");

    let first = BTreeMap::from([(String::from("energyout"), Utf8PathBuf::from("/w/energyout.out"))]);
    let second = BTreeMap::from([(String::from("gromitout"), Utf8PathBuf::from("/w/gromitout.out"))]);
    store
        .update(&record.task_id, &TaskUpdate::completed(first.clone()))
        .expect("complete");
    let after = store
        .update(&record.task_id, &TaskUpdate::completed(second))
        .expect("second complete")
        .expect("record exists");

    assert_eq!(after.results, first);
}

#[rstest]
fn unavailable_memory_store_surfaces_errors() {
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let err = store.count_active("alice").expect_err("store is down");
    assert!(matches!(err, StoreError::Unavailable { .. }));
}

#[rstest]
fn file_store_update_keeps_a_record_deleted_before_commit_deleted() {
    let tmp = TempDir::new().expect("tempdir");
    let store = file_store(&tmp);
    let record = descriptor("task-a", "alice", TaskStatus::Running);
    store.insert(&record).expect("insert");

    let updated = store
        .update_staged(
            &record.task_id,
            &TaskUpdate::status(TaskStatus::Failed),
            || assert!(store.delete(&record.task_id).expect("delete")),
        )
        .expect("update");

    assert!(updated.is_none());
    assert!(store.find(&record.task_id).expect("find").is_none());
    let leftovers: Vec<_> = std::fs::read_dir(store.root())
        .expect("list state dir")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
}

#[rstest]
fn memory_store_rejects_selected_status_updates() {
    let store = MemoryStore::new();
    let record = descriptor("task-a", "alice", TaskStatus::Running);
    store.insert(&record).expect("insert");
    store.reject_status_updates(&[TaskStatus::Completed]);

    let err = store
        .update(&record.task_id, &TaskUpdate::completed(BTreeMap::new()))
        .expect_err("completion rejected");
    assert!(matches!(err, StoreError::Unavailable { .. }));
    store
        .update(&record.task_id, &TaskUpdate::status(TaskStatus::Succeeded))
        .expect("other statuses still apply");

    store.reject_status_updates(&[]);
    let done = store
        .update(&record.task_id, &TaskUpdate::completed(BTreeMap::new()))
        .expect("completion")
        .expect("record exists");
    assert_eq!(done.status, TaskStatus::Completed);
}
