//! Unit tests for the call store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ringline_types::{CallError, CallMode, CallRecord, CallState, TurnEntry, TurnRole};

use crate::error::StoreError;
use crate::log::CallPersistence;
use crate::store::{CallStore, ORPHANED_DETAIL};

fn record(id: &str) -> CallRecord {
    CallRecord::new(id, "+15551234567", "+15550000000", CallMode::Conversation)
}

async fn store_with(ids: &[&str], limit: usize) -> CallStore {
    let store = CallStore::new(limit, None);
    for id in ids {
        store.create(record(id)).await.expect("should create call");
    }
    store
}

/// Persistence sink that keeps snapshots in memory, optionally failing.
#[derive(Default)]
struct MemorySink {
    appended: Mutex<Vec<CallRecord>>,
    fail: bool,
}

impl CallPersistence for MemorySink {
    fn append(&self, record: &CallRecord) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.appended.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<CallRecord>, StoreError> {
        Ok(self.appended.lock().unwrap().clone())
    }
}

// ── create / get ─────────────────────────────────────────────────────

#[tokio::test]
async fn create_stamps_times_and_get_returns_a_copy() {
    let store = store_with(&[], 5).await;
    let created = store.create(record("a")).await.expect("should create");
    assert!(created.created_at.timestamp() > 0);
    assert_eq!(created.created_at, created.updated_at);
    assert_eq!(created.state, CallState::Initiated);

    let mut copy = store.get("a").await.expect("should get");
    copy.to = "changed".to_string();
    assert_eq!(store.get("a").await.unwrap().to, "+15551234567");
}

#[tokio::test]
async fn unknown_call_is_not_found() {
    let store = store_with(&[], 5).await;
    assert_eq!(
        store.get("nope").await,
        Err(CallError::NotFound("nope".to_string()))
    );
    assert!(matches!(
        store.transition("nope", CallState::Ringing, None).await,
        Err(CallError::NotFound(_))
    ));
    assert!(matches!(
        store.append_transcript("nope", TurnEntry::bot("hi")).await,
        Err(CallError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_call_id_is_rejected() {
    let store = store_with(&["a"], 5).await;
    assert!(matches!(
        store.create(record("a")).await,
        Err(CallError::InvalidInput(_))
    ));
}

// ── admission control ────────────────────────────────────────────────

#[tokio::test]
async fn limit_counts_only_live_calls() {
    let store = store_with(&["a", "b"], 2).await;
    assert_eq!(store.create(record("c")).await, Err(CallError::LimitReached(2)));

    store
        .transition("a", CallState::Completed, None)
        .await
        .expect("should complete");
    store.create(record("c")).await.expect("slot should be free");
    assert_eq!(store.active_calls().await.len(), 2);
}

#[tokio::test]
async fn concurrent_creates_never_exceed_the_limit() {
    let store = Arc::new(CallStore::new(3, None));
    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.create(record(&format!("call-{}", i))).await.is_ok()
        }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(store.active_calls().await.len(), 3);
}

// ── transitions ──────────────────────────────────────────────────────

#[tokio::test]
async fn terminal_transition_stamps_end_and_positive_duration() {
    let store = store_with(&["a"], 5).await;
    store.transition("a", CallState::Ringing, None).await.unwrap();
    let ended = store
        .transition("a", CallState::Completed, None)
        .await
        .expect("should complete");
    assert!(ended.ended_at.is_some());
    assert!(ended.duration_ms.unwrap() >= 1);
}

#[tokio::test]
async fn terminal_calls_reject_further_transitions() {
    let store = store_with(&["a"], 5).await;
    store.transition("a", CallState::Busy, None).await.unwrap();
    for next in CallState::ALL {
        assert!(matches!(
            store.transition("a", next, None).await,
            Err(CallError::InvalidInput(_))
        ));
    }
    assert_eq!(store.get("a").await.unwrap().state, CallState::Busy);
}

#[tokio::test]
async fn backwards_transition_is_rejected_and_leaves_state() {
    let store = store_with(&["a"], 5).await;
    store.transition("a", CallState::Answered, None).await.unwrap();
    assert!(store.transition("a", CallState::Ringing, None).await.is_err());
    assert_eq!(store.get("a").await.unwrap().state, CallState::Answered);
}

#[tokio::test]
async fn detail_is_recorded() {
    let store = store_with(&["a"], 5).await;
    let rec = store
        .transition("a", CallState::Failed, Some("carrier rejected".to_string()))
        .await
        .unwrap();
    assert_eq!(rec.error_detail.as_deref(), Some("carrier rejected"));
}

#[tokio::test]
async fn provider_id_lookup() {
    let store = store_with(&["a", "b"], 5).await;
    store.set_provider_call_id("b", "CA123").await.unwrap();
    assert_eq!(store.find_by_provider_id("CA123").await.unwrap().call_id, "b");
    assert!(matches!(
        store.find_by_provider_id("CA999").await,
        Err(CallError::NotFound(_))
    ));
}

// ── transcripts ──────────────────────────────────────────────────────

#[tokio::test]
async fn existing_entries_are_returned_immediately() {
    let store = store_with(&["a"], 5).await;
    store.append_transcript("a", TurnEntry::bot("hello")).await.unwrap();
    store.append_transcript("a", TurnEntry::user("hi")).await.unwrap();

    let entries = store
        .wait_for_transcript("a", 1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].role, TurnRole::User);
    assert!(!entries[0].is_unstamped());
}

#[tokio::test]
async fn waiter_is_woken_by_append() {
    let store = Arc::new(store_with(&["a"], 5).await);
    store.append_transcript("a", TurnEntry::bot("hello")).await.unwrap();

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_for_transcript("a", 1, Duration::from_secs(5)).await })
    };

    // Let the waiter register before appending.
    while store.waiter_count("a") == 0 {
        tokio::task::yield_now().await;
    }
    store.append_transcript("a", TurnEntry::user("yes")).await.unwrap();

    let entries = waiter.await.unwrap().expect("wait should succeed");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "yes");
    assert_eq!(store.waiter_count("a"), 0);
}

#[tokio::test]
async fn timeout_returns_empty_and_deregisters() {
    let store = store_with(&["a"], 5).await;
    let entries = store
        .wait_for_transcript("a", 0, Duration::from_millis(20))
        .await
        .expect("timeout is not an error");
    assert!(entries.is_empty());
    assert_eq!(store.waiter_count("a"), 0);
}

#[tokio::test]
async fn ended_call_with_nothing_new_is_invalid() {
    let store = store_with(&["a"], 5).await;
    store.transition("a", CallState::Completed, None).await.unwrap();
    assert!(matches!(
        store.wait_for_transcript("a", 0, Duration::from_secs(1)).await,
        Err(CallError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn hangup_wakes_waiters_with_nothing_new() {
    let store = Arc::new(store_with(&["a"], 5).await);
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_for_transcript("a", 0, Duration::from_secs(5)).await })
    };
    while store.waiter_count("a") == 0 {
        tokio::task::yield_now().await;
    }
    store.transition("a", CallState::HangupUser, None).await.unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should wake before its own timeout")
        .unwrap()
        .unwrap();
    assert!(entries.is_empty());
}

// ── listing / restore / persistence ─────────────────────────────────

#[tokio::test]
async fn all_calls_are_newest_first() {
    let store = store_with(&["first"], 5).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    store.create(record("second")).await.unwrap();
    let ids: Vec<String> = store.all_calls().await.into_iter().map(|r| r.call_id).collect();
    assert_eq!(ids, vec!["second", "first"]);
}

#[tokio::test]
async fn restore_orphans_live_calls() {
    let store = store_with(&[], 5).await;
    let mut done = record("done");
    done.state = CallState::Completed;
    let live = record("live");

    let orphaned = store.restore(vec![done, live]).await;
    assert_eq!(orphaned, 1);

    let live = store.get("live").await.unwrap();
    assert_eq!(live.state, CallState::Error);
    assert_eq!(live.error_detail.as_deref(), Some(ORPHANED_DETAIL));
    assert_eq!(store.get("done").await.unwrap().state, CallState::Completed);
    assert!(store.active_calls().await.is_empty());
}

#[tokio::test]
async fn every_change_is_persisted() {
    let sink = Arc::new(MemorySink::default());
    let store = CallStore::new(5, Some(sink.clone() as Arc<dyn CallPersistence>));
    store.create(record("a")).await.unwrap();
    store.set_provider_call_id("a", "CA1").await.unwrap();
    store.append_transcript("a", TurnEntry::bot("hi")).await.unwrap();
    store.transition("a", CallState::Completed, None).await.unwrap();
    // Rejected transitions write nothing.
    let _ = store.transition("a", CallState::Ringing, None).await;
    store.flush().await;

    let appended = sink.appended.lock().unwrap();
    assert_eq!(appended.len(), 4);
    assert_eq!(appended[3].state, CallState::Completed);
    assert_eq!(appended[3].transcript.len(), 1);
}

#[tokio::test]
async fn persistence_failure_does_not_fail_operations() {
    let sink = Arc::new(MemorySink {
        fail: true,
        ..Default::default()
    });
    let store = CallStore::new(5, Some(sink as Arc<dyn CallPersistence>));
    store.create(record("a")).await.expect("create should still succeed");
    store
        .transition("a", CallState::Ringing, None)
        .await
        .expect("transition should still succeed");
}

/// Sink whose writes take a long time.
struct SlowSink {
    appended: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallPersistence for SlowSink {
    fn append(&self, record: &CallRecord) -> Result<(), StoreError> {
        std::thread::sleep(Duration::from_millis(300));
        self.appended.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<CallRecord>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn slow_log_does_not_hold_up_the_store() {
    let appended = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        appended: appended.clone(),
    };
    let store = CallStore::new(5, Some(Arc::new(sink) as Arc<dyn CallPersistence>));

    store.create(record("a")).await.unwrap();
    let started = std::time::Instant::now();
    store.transition("a", CallState::Ringing, None).await.unwrap();
    store.get("a").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    store.flush().await;
    let appended = appended.lock().unwrap();
    assert_eq!(appended.len(), 2);
    assert_eq!(appended[1].state, CallState::Ringing);
}

#[tokio::test]
async fn append_reports_the_entry_index() {
    let store = store_with(&["a"], 5).await;
    assert_eq!(store.append_transcript("a", TurnEntry::bot("one")).await, Ok(0));
    assert_eq!(store.append_transcript("a", TurnEntry::user("two")).await, Ok(1));
}
