//! Offline-aware state synchronization.
//!
//! Every storage call becomes a [`SyncOperation`]. Online, the call runs at once
//! with bounded retries for transient failures. Offline, mutations are queued and
//! answered optimistically while reads degrade to empty results. Reconnecting, or
//! the periodic timer, replays whatever is still pending or failed.

mod types;

pub use types::*;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::BackgroundTask;
use crate::clock::{Clock, system_clock};
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, StorageQuery, with_id};

#[derive(Default)]
struct Queue {
    /// sequence -> operation
    ops: BTreeMap<u64, SyncOperation>,
    /// Operations currently being executed by some caller
    in_flight: HashSet<u64>,
}

/// Queue of storage operations in front of a [`StorageBackend`].
pub struct StateSyncEngine {
    config: SyncConfig,
    backend: Arc<dyn StorageBackend>,
    online: AtomicBool,
    queue: RwLock<Queue>,
    sequence: AtomicU64,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    replay_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    ticker: BackgroundTask,
}

impl StateSyncEngine {
    pub fn new(backend: Arc<dyn StorageBackend>, config: SyncConfig) -> Self {
        Self::with_clock(backend, config, system_clock())
    }

    pub fn with_clock(
        backend: Arc<dyn StorageBackend>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            backend,
            online: AtomicBool::new(true),
            queue: RwLock::new(Queue::default()),
            sequence: AtomicU64::new(0),
            last_sync: RwLock::new(None),
            replay_lock: Mutex::new(()),
            clock,
            ticker: BackgroundTask::new("sync_interval"),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Flip connectivity. Going online replays the outstanding queue.
    pub async fn set_online(&self, online: bool) -> SyncReport {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        match (was_online, online) {
            (false, true) => {
                info!("Storage back online, replaying queued operations");
                self.sync_pending().await
            }
            (true, false) => {
                warn!("Storage offline, queueing mutations");
                SyncReport::default()
            }
            _ => SyncReport::default(),
        }
    }

    /// Create a record. Offline, the record is returned as submitted.
    pub async fn create(&self, table: &str, data: Value) -> Result<Value> {
        let (id, record) = with_id(data)?;
        let record = Value::Object(record);
        match self
            .enqueue(SyncOpType::Create, table, Some(id), Some(record.clone()), None)
            .await
        {
            Some(op) => self.execute_with_retry(op).await,
            None => Ok(record),
        }
    }

    /// Read a record. Offline, nothing is found.
    pub async fn read(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let Some(op) = self
            .enqueue(SyncOpType::Read, table, Some(id.to_string()), None, None)
            .await
        else {
            debug!(table, id, "Offline read");
            return Ok(None);
        };
        let value = self.execute_with_retry(op).await?;
        Ok((!value.is_null()).then_some(value))
    }

    /// Shallow-merge into a record. Offline, the patch is echoed back with the id.
    pub async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value> {
        if !data.is_object() {
            return Err(Error::validation("Update data must be a JSON object"));
        }
        let queued = self
            .enqueue(
                SyncOpType::Update,
                table,
                Some(id.to_string()),
                Some(data.clone()),
                None,
            )
            .await;

        match queued {
            Some(op) => self.execute_with_retry(op).await,
            None => {
                let mut optimistic = data;
                if let Some(map) = optimistic.as_object_mut() {
                    map.insert("id".into(), Value::String(id.to_string()));
                }
                Ok(optimistic)
            }
        }
    }

    /// Delete a record. Offline, a stub carrying the id stands in for it.
    pub async fn delete(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let Some(op) = self
            .enqueue(SyncOpType::Delete, table, Some(id.to_string()), None, None)
            .await
        else {
            return Ok(Some(json!({ "id": id })));
        };
        let value = self.execute_with_retry(op).await?;
        Ok((!value.is_null()).then_some(value))
    }

    /// Query a table. Offline, the result is empty.
    pub async fn query(&self, table: &str, query: StorageQuery) -> Result<Vec<Value>> {
        let Some(op) = self
            .enqueue(SyncOpType::Query, table, None, None, Some(query))
            .await
        else {
            debug!(table, "Offline query");
            return Ok(Vec::new());
        };
        match self.execute_with_retry(op).await? {
            Value::Array(records) => Ok(records),
            _ => Ok(Vec::new()),
        }
    }

    /// Track a new operation.
    ///
    /// Online, the operation is claimed for the caller under the same lock that
    /// inserts it, and the claimed copy is returned. A replay never sees it
    /// unclaimed. Offline, mutations stay pending for replay while reads are not
    /// tracked at all.
    async fn enqueue(
        &self,
        op_type: SyncOpType,
        table: &str,
        entity_id: Option<String>,
        data: Option<Value>,
        query: Option<StorageQuery>,
    ) -> Option<SyncOperation> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let op = SyncOperation {
            id: Uuid::new_v4().to_string(),
            op_type,
            table: table.to_string(),
            entity_id,
            data,
            query,
            timestamp: self.clock.now(),
            sequence: seq,
            status: SyncStatus::Pending,
            retry_count: 0,
            error: None,
            permanent: false,
        };

        let mut queue = self.queue.write().await;
        if self.is_online() {
            queue.in_flight.insert(seq);
            queue.ops.insert(seq, op.clone());
            return Some(op);
        }
        if op_type.is_mutation() {
            debug!(op_id = %op.id, op_type = %op_type, table, "Sync operation queued");
            queue.ops.insert(seq, op);
        }
        None
    }

    /// Run one operation against the backend.
    async fn run(&self, op: &SyncOperation) -> Result<Value> {
        let entity = move || {
            op.entity_id
                .as_deref()
                .ok_or_else(|| Error::storage(format!("Operation {} has no entity id", op.id)))
        };

        match op.op_type {
            SyncOpType::Create => {
                let data = op.data.clone().unwrap_or_else(|| json!({}));
                self.backend.create(&op.table, data).await
            }
            SyncOpType::Read => Ok(self
                .backend
                .read(&op.table, entity()?)
                .await?
                .unwrap_or(Value::Null)),
            SyncOpType::Update => {
                let data = op.data.clone().unwrap_or_else(|| json!({}));
                self.backend.update(&op.table, entity()?, data).await
            }
            SyncOpType::Delete => Ok(self
                .backend
                .delete(&op.table, entity()?)
                .await?
                .unwrap_or(Value::Null)),
            SyncOpType::Query => {
                let query = op.query.clone().unwrap_or_default();
                Ok(Value::Array(self.backend.query(&op.table, &query).await?))
            }
        }
    }

    /// Claim an operation for execution. `None` if it is gone or already claimed.
    async fn claim(&self, seq: u64) -> Option<SyncOperation> {
        let mut queue = self.queue.write().await;
        let op = queue.ops.get(&seq)?.clone();
        queue.in_flight.insert(seq).then_some(op)
    }

    async fn settle(&self, seq: u64, status: SyncStatus, retry_count: u32, error: Option<&Error>) {
        let mut queue = self.queue.write().await;
        if status != SyncStatus::Pending {
            queue.in_flight.remove(&seq);
        }
        if let Some(op) = queue.ops.get_mut(&seq) {
            op.status = status;
            op.retry_count = retry_count;
            op.permanent = error.is_some_and(|e| !e.is_transient());
            op.error = error.map(|e| e.to_string());
        }
    }

    /// Execute now, retrying transient failures with linear backoff.
    ///
    /// `op` must already be claimed by [`Self::enqueue`].
    async fn execute_with_retry(&self, op: SyncOperation) -> Result<Value> {
        let seq = op.sequence;
        let attempts = self.config.max_retries.max(1);
        let mut failures = 0u32;

        loop {
            match self.run(&op).await {
                Ok(value) => {
                    self.settle(seq, SyncStatus::Completed, failures, None).await;
                    debug!(op_id = %op.id, retries = failures, "Sync operation completed");
                    return Ok(value);
                }
                Err(e) => {
                    failures += 1;
                    if !e.is_transient() || failures >= attempts {
                        self.settle(seq, SyncStatus::Failed, failures, Some(&e))
                            .await;
                        warn!(
                            op_id = %op.id,
                            op_type = %op.op_type,
                            table = %op.table,
                            attempts = failures,
                            error = %e,
                            "Sync operation failed"
                        );
                        return Err(e);
                    }

                    self.settle(seq, SyncStatus::Pending, failures, Some(&e))
                        .await;
                    let delay = self.config.retry_delay() * failures;
                    warn!(
                        op_id = %op.id,
                        attempt = failures,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sync operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Replay every pending or failed operation, oldest first, in batches.
    pub async fn sync_pending(&self) -> SyncReport {
        self.replay(SyncOperation::is_outstanding).await
    }

    /// Replay every operation that ended `failed`, permanent failures included.
    pub async fn retry_failed(&self) -> SyncReport {
        self.replay(|op| op.status == SyncStatus::Failed).await
    }

    async fn replay(&self, select: impl Fn(&SyncOperation) -> bool) -> SyncReport {
        if !self.is_online() {
            debug!("Skipping replay while offline");
            return SyncReport::default();
        }
        let _guard = self.replay_lock.lock().await;

        let mut due: Vec<(DateTime<Utc>, u64)> = {
            let queue = self.queue.read().await;
            queue
                .ops
                .values()
                .filter(|op| select(op) && !queue.in_flight.contains(&op.sequence))
                .map(|op| (op.timestamp, op.sequence))
                .collect()
        };
        due.sort();

        let mut report = SyncReport::default();
        for batch in due.chunks(self.config.batch_size.max(1)) {
            for &(_, seq) in batch {
                if !self.is_online() {
                    warn!("Went offline mid-replay, stopping");
                    return report;
                }
                let Some(op) = self.claim(seq).await else {
                    continue;
                };

                report.attempted += 1;
                let retries = op.retry_count + 1;
                match self.run(&op).await {
                    Ok(_) => {
                        self.settle(seq, SyncStatus::Completed, op.retry_count, None)
                            .await;
                        report.completed += 1;
                    }
                    Err(e) => {
                        warn!(op_id = %op.id, error = %e, "Replay failed");
                        self.settle(seq, SyncStatus::Failed, retries, Some(&e))
                            .await;
                        report.failed += 1;
                    }
                }
            }
            debug!(batch = batch.len(), "Replayed sync batch");
        }

        *self.last_sync.write().await = Some(self.clock.now());
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                completed = report.completed,
                failed = report.failed,
                "Sync replay finished"
            );
        }
        report
    }

    pub async fn status(&self) -> SyncState {
        let queue = self.queue.read().await;
        let mut state = SyncState {
            online: self.is_online(),
            pending: 0,
            failed: 0,
            completed: 0,
            last_sync: *self.last_sync.read().await,
        };
        for op in queue.ops.values() {
            match op.status {
                SyncStatus::Pending => state.pending += 1,
                SyncStatus::Failed => state.failed += 1,
                SyncStatus::Completed => state.completed += 1,
            }
        }
        state
    }

    /// Every tracked operation in submission order.
    pub async fn operations(&self) -> Vec<SyncOperation> {
        let queue = self.queue.read().await;
        queue.ops.values().cloned().collect()
    }

    pub async fn get_operation(&self, id: &str) -> Option<SyncOperation> {
        let queue = self.queue.read().await;
        queue.ops.values().find(|op| op.id == id).cloned()
    }

    /// Drop completed operations. Pending and failed ones are kept.
    pub async fn clear_completed(&self) -> usize {
        let mut queue = self.queue.write().await;
        let before = queue.ops.len();
        queue.ops.retain(|_, op| op.status != SyncStatus::Completed);
        before - queue.ops.len()
    }

    /// Try one last replay, then empty the queue.
    pub async fn flush(&self) -> SyncReport {
        let report = self.sync_pending().await;
        let mut queue = self.queue.write().await;
        let abandoned = queue
            .ops
            .values()
            .filter(|op| op.is_outstanding())
            .count();
        if abandoned > 0 {
            warn!(abandoned, "Dropping unsynced operations on flush");
        }
        let in_flight = std::mem::take(&mut queue.in_flight);
        queue.ops.retain(|seq, _| in_flight.contains(seq));
        queue.in_flight = in_flight;
        report
    }

    /// Start the periodic replay.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.ticker.spawn(self.config.sync_interval(), move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(sync) => {
                        sync.sync_pending().await;
                        sync.clear_completed().await;
                        true
                    }
                    None => false,
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// Stop the timer and drain the queue.
    pub async fn shutdown(&self) -> SyncReport {
        self.ticker.stop();
        let report = self.flush().await;
        debug!("Sync engine shut down");
        report
    }
}
