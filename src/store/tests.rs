use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::vector::needs_embedding;

fn config(root: &Path) -> StoreConfig {
    StoreConfig::new(root.join("store"), root.join("locks")).with_dimensions(4)
}

fn handle(root: &Path) -> StoreHandle {
    StoreHandle::new(config(root), Box::new(InProcessProbe))
}

fn message(id: &str, index: i64, content: &str) -> Row {
    MessageRow::unembedded(id, "conv-1", index, content, 4).to_row()
}

#[test]
fn ensure_tables_creates_empty_typed_tables() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());

    let report = store.ensure_tables().unwrap();
    assert_eq!(report.created.len(), 2);
    assert!(report.recreated.is_empty());
    assert!(!report.resync_required);

    let messages = store.messages().unwrap();
    assert_eq!(messages.count(None).unwrap(), 0);
    let vector = messages
        .columns()
        .iter()
        .find(|column| column.name == "vector")
        .unwrap();
    assert_eq!(vector.ty, ColumnType::Vector);
    assert!(dir.path().join("store/messages").join(BACKING_FILE).is_file());
}

#[test]
fn connect_and_ensure_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    store.ensure_tables().unwrap();
    store
        .messages()
        .unwrap()
        .upsert(&[message("m1", 0, "hello")])
        .unwrap();

    store.connect().unwrap();
    let report = store.ensure_tables().unwrap();
    assert!(report.created.is_empty());
    assert_eq!(store.messages().unwrap().count(None).unwrap(), 1);
}

#[test]
fn reopening_after_reset_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    store.ensure_tables().unwrap();
    store
        .messages()
        .unwrap()
        .upsert(&[message("m1", 0, "hello"), message("m2", 1, "world")])
        .unwrap();

    store.reset();
    assert!(!store.is_connected());
    let report = store.ensure_tables().unwrap();
    assert!(report.created.is_empty());
    assert_eq!(store.messages().unwrap().count(None).unwrap(), 2);
}

#[test]
fn upsert_updates_existing_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    let messages = store.messages().unwrap();
    messages.upsert(&[message("m1", 0, "hello")]).unwrap();

    let update = Row::new()
        .with("id", Value::Text("m1".to_string()))
        .with("vector", Value::Vector(vec![0.5, 0.5, 0.5, 0.5]));
    messages.upsert(&[update]).unwrap();

    let rows = messages.query(None, None).unwrap();
    assert_eq!(rows.len(), 1);
    let row = MessageRow::from_row(&rows[0]).unwrap();
    assert_eq!(row.content, "hello");
    assert_eq!(row.vector, vec![0.5, 0.5, 0.5, 0.5]);
}

#[test]
fn upsert_rejects_rows_without_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    let row = Row::new().with("content", Value::Text("orphan".to_string()));
    let err = store.messages().unwrap().upsert(&[row]).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);
}

#[test]
fn missing_backing_file_recreates_table_and_requires_resync() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    store.ensure_tables().unwrap();
    store
        .messages()
        .unwrap()
        .upsert(&[message("m1", 0, "hello")])
        .unwrap();
    store.reset();

    fs::remove_file(dir.path().join("store/messages").join(BACKING_FILE)).unwrap();

    let report = store.ensure_tables().unwrap();
    assert!(report.resync_required);
    assert!(store.resync_required());
    assert_eq!(store.messages().unwrap().count(None).unwrap(), 0);
}

#[test]
fn garbage_backing_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    store.ensure_tables().unwrap();
    store.reset();

    let backing = dir.path().join("store/conversations").join(BACKING_FILE);
    let _ = fs::remove_file(dir.path().join("store/conversations/data.sqlite-wal"));
    let _ = fs::remove_file(dir.path().join("store/conversations/data.sqlite-shm"));
    fs::write(&backing, vec![0x5a_u8; 4096]).unwrap();

    let report = store.ensure_tables().unwrap();
    assert!(report.resync_required);
    assert_eq!(store.table(CONVERSATIONS_TABLE).unwrap().count(None).unwrap(), 0);
}

#[test]
fn failed_preflight_sweeps_dead_locks() {
    let dir = tempfile::tempdir().unwrap();
    let locks = dir.path().join("locks");
    fs::create_dir_all(&locks).unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    fs::write(
        locks.join("embed.lock"),
        format!("{{\"pid\":{dead_pid},\"started_at_ms\":0}}"),
    )
    .unwrap();

    fs::create_dir_all(dir.path().join("store/broken")).unwrap();

    let mut store = handle(dir.path());
    store.connect().unwrap();
    assert!(!locks.join("embed.lock").exists());
    assert!(!dir.path().join("store/broken").exists());
    assert!(store.resync_required());
}

/// Reports the store as locked by another writer. With `corrupt_first` the
/// very first store check claims corruption instead, which sends `connect`
/// into repair.
struct BusyStore {
    store_checks: Arc<AtomicUsize>,
    corrupt_first: bool,
}

impl PreflightProbe for BusyStore {
    fn check_store(&self, _root: &Path, _timeout: Duration) -> Result<Vec<String>, StoreError> {
        let previous = self.store_checks.fetch_add(1, Ordering::SeqCst);
        if self.corrupt_first && previous == 0 {
            return Err(StoreError::Corrupted {
                table: None,
                detail: "unreadable manifest".to_string(),
            });
        }
        Err(StoreError::Transient("database is locked".to_string()))
    }

    fn check_table(&self, root: &Path, table: &str, timeout: Duration) -> Result<(), StoreError> {
        InProcessProbe.check_table(root, table, timeout)
    }
}

fn store_with_one_message(root: &Path) {
    let mut store = handle(root);
    store.ensure_tables().unwrap();
    store
        .messages()
        .unwrap()
        .upsert(&[message("m1", 0, "hello")])
        .unwrap();
}

fn busy_handle(root: &Path, corrupt_first: bool) -> (StoreHandle, Arc<AtomicUsize>) {
    let store_checks = Arc::new(AtomicUsize::new(0));
    let probe = BusyStore {
        store_checks: Arc::clone(&store_checks),
        corrupt_first,
    };
    let config = config(root).with_preflight_retry(RetryPolicy::immediate(3));
    (StoreHandle::new(config, Box::new(probe)), store_checks)
}

#[test]
fn busy_store_is_left_untouched() {
    let dir = tempfile::tempdir().unwrap();
    store_with_one_message(dir.path());

    let (mut busy, store_checks) = busy_handle(dir.path(), false);
    let err = busy.connect().unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(store_checks.load(Ordering::SeqCst), 3);
    assert!(!busy.resync_required());

    let mut store = handle(dir.path());
    assert_eq!(store.messages().unwrap().count(None).unwrap(), 1);
}

#[test]
fn store_busy_after_repair_is_not_reset() {
    let dir = tempfile::tempdir().unwrap();
    store_with_one_message(dir.path());

    let (mut busy, store_checks) = busy_handle(dir.path(), true);
    let err = busy.connect().unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(store_checks.load(Ordering::SeqCst), 4);
    assert!(dir.path().join("store/messages").join(BACKING_FILE).is_file());

    let mut store = handle(dir.path());
    assert_eq!(store.messages().unwrap().count(None).unwrap(), 1);
}

#[test]
fn ragged_vector_blob_reads_as_needing_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    store.ensure_tables().unwrap();
    store
        .messages()
        .unwrap()
        .upsert(&[message("m1", 0, "one"), message("m2", 1, "two")])
        .unwrap();
    store
        .messages()
        .unwrap()
        .upsert(&[Row::new()
            .with("id", Value::Text("m1".to_string()))
            .with("vector", Value::Vector(vec![1.0, 2.0, 3.0, 4.0]))])
        .unwrap();

    let backing = dir.path().join("store/messages").join(BACKING_FILE);
    let connection = rusqlite::Connection::open(backing).unwrap();
    connection
        .execute("UPDATE records SET vector = X'000000' WHERE id = 'm2'", [])
        .unwrap();
    drop(connection);

    let rows = store.messages().unwrap().query(None, None).unwrap();
    assert_eq!(rows.len(), 2);
    let messages = rows
        .iter()
        .filter_map(MessageRow::from_row)
        .map(|message| (message.id.clone(), message))
        .collect::<HashMap<String, MessageRow>>();
    assert_eq!(messages["m1"].vector, vec![1.0, 2.0, 3.0, 4.0]);
    assert!(messages["m2"].vector.is_empty());
    assert_eq!(messages["m2"].content, "two");
    assert!(needs_embedding(&messages["m2"].vector, 4));
    assert!(!needs_embedding(&messages["m1"].vector, 4));
}

#[test]
fn recover_all_drops_every_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    store.ensure_tables().unwrap();

    let dropped = store.recover_table(None).unwrap();
    assert!(dropped.contains(&MESSAGES_TABLE.to_string()));
    assert!(dropped.contains(&CONVERSATIONS_TABLE.to_string()));
    assert!(!dir.path().join("store/messages").exists());

    let report = store.ensure_tables().unwrap();
    assert_eq!(report.created.len(), 2);
    assert!(report.resync_required);
}

#[test]
fn fts_index_tracks_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    let messages = store.messages().unwrap();
    messages
        .upsert(&[message("m1", 0, "borrow checker"), message("m2", 1, "lifetimes")])
        .unwrap();
    assert_eq!(messages.build_fts_index(&["search_text"]).unwrap(), 2);
    assert_eq!(messages.fts_match_count("borrow").unwrap(), 1);

    messages.upsert(&[message("m3", 2, "borrow again")]).unwrap();
    messages.build_fts_index(&["search_text"]).unwrap();
    assert_eq!(messages.fts_match_count("borrow").unwrap(), 2);
}

#[test]
fn vector_index_needs_enough_embedded_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    let messages = store.messages().unwrap();

    let rows = (0..12)
        .map(|index| {
            let mut row = MessageRow::unembedded(&format!("m{index}"), "c", index, "x", 4);
            if index < 10 {
                row.vector = vec![index as f32, 1.0, 0.0, 0.0];
            }
            row.to_row()
        })
        .collect::<Vec<Row>>();
    messages.upsert(&rows).unwrap();

    assert_eq!(messages.build_vector_index("vector", 4, 11).unwrap(), None);
    let stats = messages.build_vector_index("vector", 4, 8).unwrap().unwrap();
    assert_eq!(stats.rows, 10);
    assert!(stats.partitions >= 1);
}

#[test]
fn prune_keeps_latest_version_and_grace_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    let messages = store.messages().unwrap();
    messages.upsert(&[message("m1", 0, "a")]).unwrap();
    messages.upsert(&[message("m2", 1, "b")]).unwrap();
    let latest = messages.version().unwrap();

    let kept_in_grace = messages.prune_versions(Duration::from_secs(300)).unwrap();
    assert_eq!(kept_in_grace.versions_removed, 0);

    std::thread::sleep(Duration::from_millis(5));
    let pruned = messages.prune_versions(Duration::ZERO).unwrap();
    assert!(pruned.versions_removed > 0);
    assert_eq!(pruned.versions_kept, 1);
    assert_eq!(messages.version().unwrap(), latest);
}

#[test]
fn compact_preserves_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = handle(dir.path());
    let messages = store.messages().unwrap();
    messages
        .upsert(&[message("m1", 0, "a"), message("m2", 1, "b")])
        .unwrap();
    messages
        .delete_keys(&[Value::Text("m1".to_string())])
        .unwrap();

    messages.compact().unwrap();
    assert_eq!(messages.count(None).unwrap(), 1);
}

#[test]
fn preflight_reports_missing_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("messages")).unwrap();

    let outcome = run_preflight(dir.path(), None);
    assert!(!outcome.ok);
    assert_eq!(outcome.kind.as_deref(), Some("corrupted"));
    assert_eq!(outcome.table.as_deref(), Some("messages"));

    let err = outcome.into_result().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Corrupted(Some("messages".to_string())));
}

#[test]
fn preflight_of_missing_store_is_empty_and_ok() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = run_preflight(&dir.path().join("absent"), None);
    assert!(outcome.ok);
    assert!(outcome.tables.is_empty());
}
