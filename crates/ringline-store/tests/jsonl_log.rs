use std::io::Write;
use std::sync::Arc;

use ringline_store::{CallPersistence, CallStore, JsonlCallLog, ORPHANED_DETAIL};
use ringline_types::{CallMode, CallRecord, CallState, TurnEntry};

fn record(id: &str) -> CallRecord {
    CallRecord::new(id, "+15551234567", "+15550000000", CallMode::Notify)
}

#[test]
fn missing_file_loads_empty_and_parents_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/deeper/calls.jsonl");
    let log = JsonlCallLog::open(&path).expect("should open log");
    assert!(path.exists());
    assert!(log.load().expect("should load").is_empty());
}

#[test]
fn last_write_wins_in_first_seen_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlCallLog::open(dir.path().join("calls.jsonl")).unwrap();

    let mut a = record("a");
    log.append(&a).unwrap();
    log.append(&record("b")).unwrap();
    a.state = CallState::Ringing;
    log.append(&a).unwrap();

    let loaded = log.load().unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].call_id, "a");
    assert_eq!(loaded[0].state, CallState::Ringing);
    assert_eq!(loaded[1].call_id, "b");
}

#[test]
fn corrupt_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.jsonl");
    let log = JsonlCallLog::open(&path).unwrap();
    log.append(&record("a")).unwrap();

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "{{not json").unwrap();
    writeln!(file).unwrap();
    drop(file);

    log.append(&record("b")).unwrap();
    let ids: Vec<String> = log.load().unwrap().into_iter().map(|r| r.call_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn store_history_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls.jsonl");

    {
        let log: Arc<dyn CallPersistence> = Arc::new(JsonlCallLog::open(&path).unwrap());
        let store = CallStore::new(5, Some(log));
        store.create(record("finished")).await.unwrap();
        store
            .append_transcript("finished", TurnEntry::bot("Your order shipped."))
            .await
            .unwrap();
        store
            .transition("finished", CallState::Completed, None)
            .await
            .unwrap();
        store.create(record("in-flight")).await.unwrap();
        store
            .transition("in-flight", CallState::Active, None)
            .await
            .unwrap();
        store.flush().await;
    }

    let log = Arc::new(JsonlCallLog::open(&path).unwrap());
    let store = CallStore::new(5, Some(log.clone() as Arc<dyn CallPersistence>));
    let orphaned = store.restore(log.load().unwrap()).await;
    assert_eq!(orphaned, 1);

    let finished = store.get("finished").await.unwrap();
    assert_eq!(finished.state, CallState::Completed);
    assert_eq!(finished.transcript.len(), 1);

    let in_flight = store.get("in-flight").await.unwrap();
    assert_eq!(in_flight.state, CallState::Error);
    assert_eq!(in_flight.error_detail.as_deref(), Some(ORPHANED_DETAIL));

    // The orphaning itself was written back.
    store.flush().await;
    let reloaded = log.load().unwrap();
    let in_flight = reloaded.iter().find(|r| r.call_id == "in-flight").unwrap();
    assert_eq!(in_flight.state, CallState::Error);
}
