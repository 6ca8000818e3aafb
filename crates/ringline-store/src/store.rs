use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use ringline_types::{CallError, CallRecord, CallState, TurnEntry};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::log::CallPersistence;

/// Detail recorded on calls that were live when the process last stopped.
pub const ORPHANED_DETAIL: &str = "orphaned by restart";

type Waiters = HashMap<String, Vec<(u64, oneshot::Sender<()>)>>;

enum PersistOp {
    Record(Box<CallRecord>),
    Flush(oneshot::Sender<()>),
}

/// In-memory registry of calls.
///
/// # Lock ordering
///
/// Two locks are involved: `records` (async `RwLock`) and `waiters` (a
/// plain `Mutex`, never held across an await).
///
/// - Appends take `records` for writing, release it, then take `waiters`.
/// - Waits take `records` for reading, then take `waiters` while still
///   holding the read lock, so an append cannot land between the check and
///   the registration.
///
/// No path takes `waiters` first and then `records`.
///
/// Snapshots for the call log are queued while `records` is held, so they
/// reach the log in mutation order, and written by a background task.
pub struct CallStore {
    records: RwLock<HashMap<String, CallRecord>>,
    waiters: Mutex<Waiters>,
    next_waiter: AtomicU64,
    max_concurrent: usize,
    log_tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl CallStore {
    /// Creates an empty store.
    ///
    /// # Panics
    ///
    /// With `persistence` set this spawns the log writer, so it must be
    /// called from within a Tokio runtime.
    pub fn new(max_concurrent: usize, persistence: Option<Arc<dyn CallPersistence>>) -> Self {
        let log_tx = persistence.map(|persistence| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_log(persistence, rx));
            tx
        });
        Self {
            records: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            max_concurrent,
            log_tx,
        }
    }

    /// Waits until every change made so far has been handed to the log.
    pub async fn flush(&self) {
        let Some(tx) = &self.log_tx else {
            return;
        };
        let (done, flushed) = oneshot::channel();
        if tx.send(PersistOp::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Admits a new call.
    ///
    /// # Errors
    ///
    /// `LimitReached` when the live-call ceiling is met, `InvalidInput` for a
    /// duplicate call ID.
    pub async fn create(&self, mut record: CallRecord) -> Result<CallRecord, CallError> {
        let mut records = self.records.write().await;

        let active = records.values().filter(|r| !r.is_terminal()).count();
        if active >= self.max_concurrent {
            return Err(CallError::LimitReached(active));
        }
        if records.contains_key(&record.call_id) {
            return Err(CallError::InvalidInput(format!(
                "call {} already exists",
                record.call_id
            )));
        }

        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;
        self.persist(&record);
        records.insert(record.call_id.clone(), record.clone());

        tracing::debug!(call_id = %record.call_id, active = active + 1, "call created");
        Ok(record)
    }

    pub async fn get(&self, call_id: &str) -> Result<CallRecord, CallError> {
        self.records
            .read()
            .await
            .get(call_id)
            .cloned()
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))
    }

    /// Moves a call to `new_state` if the state machine allows it.
    ///
    /// Terminal transitions stamp `ended_at` and the duration, and wake any
    /// transcript waiters so they stop waiting on a finished call.
    pub async fn transition(
        &self,
        call_id: &str,
        new_state: CallState,
        detail: Option<String>,
    ) -> Result<CallRecord, CallError> {
        let updated = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;

            if !record.state.can_transition_to(new_state) {
                return Err(CallError::InvalidInput(format!(
                    "invalid transition {} -> {}",
                    record.state, new_state
                )));
            }

            let now = Utc::now();
            let previous = record.state;
            record.state = new_state;
            record.updated_at = now;
            if let Some(detail) = detail {
                record.error_detail = Some(detail);
            }
            if new_state.is_terminal() {
                record.ended_at = Some(now);
                let elapsed = (now - record.created_at).num_milliseconds();
                record.duration_ms = Some(elapsed.max(1));
            }
            self.persist(record);

            tracing::debug!(
                call_id = %call_id,
                from = %previous,
                to = %new_state,
                "call state changed"
            );
            record.clone()
        };

        if new_state.is_terminal() {
            self.notify(call_id);
        }
        Ok(updated)
    }

    pub async fn set_provider_call_id(
        &self,
        call_id: &str,
        provider_call_id: &str,
    ) -> Result<(), CallError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;
        record.provider_call_id = Some(provider_call_id.to_string());
        record.updated_at = Utc::now();
        self.persist(record);
        Ok(())
    }

    /// Appends a turn and wakes every task waiting on this call's transcript.
    ///
    /// Returns the index of the new entry.
    pub async fn append_transcript(
        &self,
        call_id: &str,
        mut entry: TurnEntry,
    ) -> Result<usize, CallError> {
        let index = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;
            if entry.is_unstamped() {
                entry.timestamp = Utc::now();
            }
            record.transcript.push(entry);
            record.updated_at = Utc::now();
            self.persist(record);
            record.transcript.len() - 1
        };
        self.notify(call_id);
        Ok(index)
    }

    /// Returns transcript entries from `after_index` on, waiting up to
    /// `timeout` for one to arrive if there are none yet.
    ///
    /// A timeout yields an empty list, not an error.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call, `InvalidInput` when the call has ended
    /// and nothing new will ever arrive.
    pub async fn wait_for_transcript(
        &self,
        call_id: &str,
        after_index: usize,
        timeout: Duration,
    ) -> Result<Vec<TurnEntry>, CallError> {
        let (waiter_id, rx) = {
            let records = self.records.read().await;
            let record = records
                .get(call_id)
                .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;

            if record.transcript.len() > after_index {
                return Ok(record.transcript[after_index..].to_vec());
            }
            if record.is_terminal() {
                return Err(CallError::InvalidInput(format!(
                    "call {} has ended ({})",
                    call_id, record.state
                )));
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            self.lock_waiters()
                .entry(call_id.to_string())
                .or_default()
                .push((waiter_id, tx));
            (waiter_id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => {
                let records = self.records.read().await;
                Ok(records
                    .get(call_id)
                    .map(|r| r.transcript.get(after_index..).unwrap_or_default().to_vec())
                    .unwrap_or_default())
            }
            Err(_) => {
                self.deregister(call_id, waiter_id);
                Ok(Vec::new())
            }
        }
    }

    /// Every call that has not reached a terminal state.
    pub async fn active_calls(&self) -> Vec<CallRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect()
    }

    /// Every call, newest first.
    pub async fn all_calls(&self) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self.records.read().await.values().cloned().collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls
    }

    pub async fn find_by_provider_id(&self, provider_call_id: &str) -> Result<CallRecord, CallError> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.provider_call_id.as_deref() == Some(provider_call_id))
            .cloned()
            .ok_or_else(|| CallError::NotFound(provider_call_id.to_string()))
    }

    /// Loads records from a previous run.
    ///
    /// Calls that were still live are marked `error` since their media
    /// streams and provider callbacks did not survive the restart. Returns
    /// the number of calls orphaned this way.
    pub async fn restore(&self, restored: Vec<CallRecord>) -> usize {
        let mut records = self.records.write().await;
        let mut orphaned = 0;
        for mut record in restored {
            if !record.is_terminal() {
                let now = Utc::now();
                record.state = CallState::Error;
                record.error_detail = Some(ORPHANED_DETAIL.to_string());
                record.updated_at = now;
                record.ended_at = Some(now);
                record.duration_ms = Some((now - record.created_at).num_milliseconds().max(1));
                self.persist(&record);
                orphaned += 1;
            }
            records.insert(record.call_id.clone(), record);
        }
        orphaned
    }

    fn persist(&self, record: &CallRecord) {
        if let Some(tx) = &self.log_tx {
            if tx.send(PersistOp::Record(Box::new(record.clone()))).is_err() {
                tracing::warn!(call_id = %record.call_id, "call log writer has stopped");
            }
        }
    }

    fn notify(&self, call_id: &str) {
        let woken = self.lock_waiters().remove(call_id).unwrap_or_default();
        for (_, tx) in woken {
            let _ = tx.send(());
        }
    }

    fn deregister(&self, call_id: &str, waiter_id: u64) {
        let mut waiters = self.lock_waiters();
        if let Some(list) = waiters.get_mut(call_id) {
            list.retain(|(id, _)| *id != waiter_id);
            if list.is_empty() {
                waiters.remove(call_id);
            }
        }
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, Waiters> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("waiter mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self, call_id: &str) -> usize {
        self.lock_waiters().get(call_id).map_or(0, Vec::len)
    }
}

/// Writes queued snapshots in order, on the blocking pool.
async fn write_log(
    persistence: Arc<dyn CallPersistence>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Record(record) => {
                let call_id = record.call_id.clone();
                let persistence = persistence.clone();
                match tokio::task::spawn_blocking(move || persistence.append(&record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(call_id = %call_id, error = %e, "failed to persist call record");
                    }
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, error = %e, "call log write panicked");
                    }
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
