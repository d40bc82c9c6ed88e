use std::path::PathBuf;

use serde_json::json;

use vdc_api_types::{error_code, ErrorCode};

use super::*;

struct TempDir(PathBuf);

impl TempDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vdc-store-test-{name}-{}-{}",
            std::process::id(),
            vdc_api_types::time::epoch_millis(),
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[test]
fn basic_crud() {
    let store = Store::in_memory();

    assert_eq!(store.get("/vm/a"), None);

    let rev = store.put("/vm/a", &json!({"name": "a"}), Expect::Absent).unwrap();
    assert_eq!(rev, 1);

    let (value, rev) = store.get("/vm/a").unwrap();
    assert_eq!(value["name"], "a");
    assert_eq!(rev, 1);

    let rev2 = store.put("/vm/a", &json!({"name": "b"}), Expect::Rev(rev)).unwrap();
    assert!(rev2 > rev);

    store.delete("/vm/a", Expect::Rev(rev2)).unwrap();
    assert_eq!(store.get("/vm/a"), None);
}

#[test]
fn cas_conflicts() {
    let store = Store::in_memory();
    let rev = store.put("/vm/a", &json!(1), Expect::Absent).unwrap();

    let err = store.put("/vm/a", &json!(2), Expect::Absent).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Conflict);

    let err = store.put("/vm/a", &json!(2), Expect::Rev(rev + 7)).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Conflict);

    let err = store.put("/vm/missing", &json!(2), Expect::Rev(1)).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::NotFound);

    // the value is untouched after failed CAS
    let (value, _) = store.get("/vm/a").unwrap();
    assert_eq!(value, json!(1));
}

#[test]
fn batches_are_atomic() {
    let store = Store::in_memory();
    store.put("/vm/a", &json!(1), Expect::Absent).unwrap();

    // second op conflicts, first op must not apply
    let err = store
        .batch(vec![
            TxOp::put("/vm/b".into(), Expect::Absent, &json!(2)).unwrap(),
            TxOp::put("/vm/a".into(), Expect::Absent, &json!(3)).unwrap(),
        ])
        .unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Conflict);
    assert_eq!(store.get("/vm/b"), None);

    let rev = store
        .batch(vec![
            TxOp::put("/vm/b".into(), Expect::Absent, &json!(2)).unwrap(),
            TxOp::delete("/vm/a".into(), Expect::Any),
        ])
        .unwrap();
    assert_eq!(store.get("/vm/b").unwrap().1, rev);
    assert_eq!(store.get("/vm/a"), None);
}

#[test]
fn prefix_listing_is_ordered() {
    let store = Store::in_memory();
    store.put("/vm/c", &json!(3), Expect::Absent).unwrap();
    store.put("/vm/a", &json!(1), Expect::Absent).unwrap();
    store.put("/disk/x", &json!(0), Expect::Absent).unwrap();
    store.put("/vm/b", &json!(2), Expect::Absent).unwrap();

    let keys: Vec<String> = store.list("/vm/").into_iter().map(|(k, _, _)| k).collect();
    assert_eq!(keys, ["/vm/a", "/vm/b", "/vm/c"]);
}

#[test]
fn persistence_across_reopen() {
    let dir = TempDir::new("reopen");

    {
        let store = Store::open(&dir.0).unwrap();
        store.put("/vm/a", &json!({"x": 1}), Expect::Absent).unwrap();
        store.put("/vm/b", &json!({"x": 2}), Expect::Absent).unwrap();
        store.delete("/vm/a", Expect::Any).unwrap();
    }

    let store = Store::open(&dir.0).unwrap();
    assert_eq!(store.revision(), 3);
    assert_eq!(store.get("/vm/a"), None);
    let (value, _) = store.get("/vm/b").unwrap();
    assert_eq!(value["x"], 2);
}

#[test]
fn compaction_preserves_state() {
    let dir = TempDir::new("compact");

    {
        let store = Store::open(&dir.0).unwrap();
        for i in 0..10 {
            store
                .put(&format!("/vm/{i}"), &json!(i), Expect::Absent)
                .unwrap();
        }
        store.compact().unwrap();
        store.put("/vm/after", &json!("late"), Expect::Absent).unwrap();
    }

    let store = Store::open(&dir.0).unwrap();
    assert_eq!(store.revision(), 11);
    assert_eq!(store.list("/vm/").len(), 11);
    assert_eq!(store.get("/vm/after").unwrap().0, json!("late"));
}

#[test]
fn torn_log_tail_is_discarded() {
    let dir = TempDir::new("torn");

    {
        let store = Store::open(&dir.0).unwrap();
        store.put("/vm/a", &json!(1), Expect::Absent).unwrap();
    }

    // simulate a crash mid-append
    use std::io::Write;
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.0.join(LOG_NAME))
        .unwrap();
    log.write_all(b"{\"rev\":2,\"items\":[{\"key\":\"/vm/").unwrap();
    drop(log);

    let store = Store::open(&dir.0).unwrap();
    assert_eq!(store.revision(), 1);
    assert!(store.get("/vm/a").is_some());
}

#[test]
fn second_writer_is_rejected() {
    let dir = TempDir::new("lock");
    let _store = Store::open(&dir.0).unwrap();
    assert!(Store::open(&dir.0).is_err());
}

#[tokio::test]
async fn watch_delivers_replay_and_live() {
    let store = Store::in_memory();
    store.put("/vm/a", &json!(1), Expect::Absent).unwrap();
    store.put("/disk/x", &json!(9), Expect::Absent).unwrap();

    let mut watcher = store.watch("/vm/", 0);

    // replayed
    let event = watcher.next().await.unwrap();
    assert_eq!(event.key, "/vm/a");
    assert_eq!(event.rev, 1);

    // live, filtered by prefix
    store.put("/disk/y", &json!(0), Expect::Absent).unwrap();
    store.put("/vm/b", &json!(2), Expect::Absent).unwrap();
    let event = watcher.next().await.unwrap();
    assert_eq!(event.key, "/vm/b");
    assert!(event.rev > 1);

    // deletions arrive as tombstones
    store.delete("/vm/b", Expect::Any).unwrap();
    let event = watcher.next().await.unwrap();
    assert_eq!(event.key, "/vm/b");
    assert!(event.value.is_none());
}

#[tokio::test]
async fn watch_revisions_are_monotone() {
    let store = Store::in_memory();
    for i in 0..20 {
        store
            .put(&format!("/vm/{i:02}"), &json!(i), Expect::Absent)
            .unwrap();
    }

    let mut watcher = store.watch("/vm/", 0);
    let mut last = 0;
    for _ in 0..20 {
        let event = watcher.next().await.unwrap();
        assert!(event.rev > last);
        last = event.rev;
    }
}

#[tokio::test]
async fn stale_watch_requests_resync() {
    let store = Store::in_memory();
    store.put("/vm/a", &json!(1), Expect::Absent).unwrap();

    // fill the tail far past capacity so revision 1 is evicted
    for i in 0..(TAIL_CAPACITY + 10) {
        store
            .put("/pad/x", &json!(i), Expect::Any)
            .unwrap();
    }

    let mut watcher = store.watch("/vm/", 0);
    match watcher.next().await {
        Err(WatchError::Resync) => (),
        other => panic!("expected resync, got {other:?}"),
    }

    // restarting from the current revision works
    let rev = store.revision();
    let mut watcher = store.watch("/vm/", rev);
    store.put("/vm/b", &json!(2), Expect::Absent).unwrap();
    let event = watcher.next().await.unwrap();
    assert_eq!(event.key, "/vm/b");
}
