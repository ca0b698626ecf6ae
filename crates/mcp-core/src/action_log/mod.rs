//! Buffered audit log with rollback-candidate discovery.
//!
//! Writes land in a buffer and are flushed when it fills or on a timer. Flushing
//! assigns monotonically increasing ids, appends to the in-memory log and hands
//! the batch to an optional [`ActionLogSink`] for durable storage. Reads flush
//! first, so a caller always sees its own writes.

mod types;

pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::background::BackgroundTask;
use crate::clock::{self, Clock, system_clock};
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, StorageQuery};

/// How often retention cleanup runs once started.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Durable destination for flushed entries.
#[async_trait]
pub trait ActionLogSink: Send + Sync {
    async fn persist(&self, entries: &[ActionLogEntry]) -> Result<()>;

    async fn mark_rolled_back(&self, _id: u64, _rollback_id: &str) -> Result<()> {
        Ok(())
    }

    async fn purge_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

/// Persists entries as records of a storage table, keyed by the entry id.
pub struct StorageSink {
    backend: Arc<dyn StorageBackend>,
    table: String,
}

impl StorageSink {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_table(backend, "action_log")
    }

    pub fn with_table(backend: Arc<dyn StorageBackend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
        }
    }
}

#[async_trait]
impl ActionLogSink for StorageSink {
    async fn persist(&self, entries: &[ActionLogEntry]) -> Result<()> {
        for entry in entries {
            let mut record = serde_json::to_value(entry)?;
            record["id"] = json!(entry.id.to_string());
            record["entryId"] = json!(entry.id);
            self.backend.create(&self.table, record).await?;
        }
        Ok(())
    }

    async fn mark_rolled_back(&self, id: u64, rollback_id: &str) -> Result<()> {
        self.backend
            .update(
                &self.table,
                &id.to_string(),
                json!({ "rollbackId": rollback_id }),
            )
            .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for record in self.backend.query(&self.table, &StorageQuery::new()).await? {
            let stale = record
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(crate::clock::parse_datetime)
                .is_some_and(|t| t < cutoff);
            if let (true, Some(id)) = (stale, crate::storage::record_id(&record)) {
                self.backend.delete(&self.table, id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Audit log for every terminal command state.
pub struct ActionLogger {
    config: ActionLogConfig,
    buffer: Mutex<Vec<ActionRecord>>,
    /// Flushed entries in id order
    entries: RwLock<Vec<ActionLogEntry>>,
    next_id: AtomicU64,
    sink: Option<Arc<dyn ActionLogSink>>,
    clock: Arc<dyn Clock>,
    flusher: BackgroundTask,
    retention: BackgroundTask,
}

impl ActionLogger {
    pub fn new(config: ActionLogConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: ActionLogConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buffer: Mutex::new(Vec::new()),
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sink: None,
            clock,
            flusher: BackgroundTask::new("action_log_flush"),
            retention: BackgroundTask::new("action_log_retention"),
        }
    }

    /// Attach durable storage.
    pub fn with_sink(mut self, sink: Arc<dyn ActionLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ActionLogConfig {
        &self.config
    }

    /// Buffer a record, flushing if the buffer is full.
    pub async fn log(&self, record: ActionRecord) {
        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record);
            buffer.len() >= self.config.buffer_size
        };
        if full {
            self.flush().await;
        }
    }

    /// Number of records waiting for a flush.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Assign ids to buffered records and append them to the log.
    ///
    /// Sink failures are logged; the entries stay in the in-memory log.
    pub async fn flush(&self) -> usize {
        let batch: Vec<ActionLogEntry> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return 0;
            }
            let mut entries = self.entries.write().await;
            let batch: Vec<ActionLogEntry> = buffer
                .drain(..)
                .map(|record| {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    ActionLogEntry::from_record(id, record)
                })
                .collect();
            entries.extend(batch.iter().cloned());
            batch
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&batch).await {
                warn!(count = batch.len(), error = %e, "Failed to persist action log batch");
            }
        }
        debug!(count = batch.len(), "Flushed action log");
        batch.len()
    }

    /// Matching entries, newest first, paginated.
    pub async fn query(&self, filter: &ActionLogFilter) -> Vec<ActionLogEntry> {
        self.flush().await;
        let entries = self.entries.read().await;
        let mut matched: Vec<&ActionLogEntry> =
            entries.iter().filter(|e| filter.matches(e)).collect();
        newest_first(&mut matched);

        matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: u64) -> Option<ActionLogEntry> {
        self.flush().await;
        let entries = self.entries.read().await;
        entries.iter().find(|e| e.id == id).cloned()
    }

    /// Successful create/update/delete actions on a target that nothing has
    /// reversed yet, newest first.
    pub async fn get_rollback_candidates(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Vec<ActionLogEntry> {
        self.flush().await;
        let entries = self.entries.read().await;
        let mut candidates: Vec<&ActionLogEntry> = entries
            .iter()
            .filter(|e| {
                e.success
                    && e.rollback_id.is_none()
                    && e.target_type == target_type
                    && e.target_id == target_id
                    && matches!(e.action.as_str(), "create" | "update" | "delete")
            })
            .collect();
        newest_first(&mut candidates);
        candidates.into_iter().cloned().collect()
    }

    /// Record that a later action reversed entry `id`.
    pub async fn mark_rolled_back(&self, id: u64, rollback_id: &str) -> Result<ActionLogEntry> {
        self.flush().await;
        let updated = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| Error::not_found("Action log entry", id.to_string()))?;
            if let Some(existing) = &entry.rollback_id {
                return Err(Error::validation(format!(
                    "Action {} was already rolled back ({})",
                    id, existing
                )));
            }
            entry.rollback_id = Some(rollback_id.to_string());
            entry.clone()
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.mark_rolled_back(id, rollback_id).await {
                warn!(entry_id = id, error = %e, "Failed to persist rollback marker");
            }
        }
        info!(entry_id = id, rollback_id, "Action marked as rolled back");
        Ok(updated)
    }

    /// Aggregate counts, optionally limited to entries at or after `since`.
    pub async fn get_action_stats(&self, since: Option<DateTime<Utc>>) -> ActionStats {
        self.flush().await;
        let entries = self.entries.read().await;
        let mut stats = ActionStats::default();
        let mut total_ms = 0u64;

        for entry in entries
            .iter()
            .filter(|e| since.is_none_or(|t| e.timestamp >= t))
        {
            stats.total += 1;
            if entry.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            total_ms += entry.execution_time_ms;
            *stats
                .by_action
                .entry(format!("{}:{}", entry.action, entry.target_type))
                .or_default() += 1;
            if let Some(agent) = &entry.agent_id {
                *stats.by_agent.entry(agent.clone()).or_default() += 1;
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.successful as f64 / stats.total as f64;
            stats.average_execution_ms = total_ms as f64 / stats.total as f64;
        }
        stats
    }

    /// The most recent `limit` entries.
    pub async fn get_recent_activity(&self, limit: usize) -> Vec<ActionLogEntry> {
        self.query(&ActionLogFilter::new().page(limit, 0)).await
    }

    /// Purge entries older than `retention_days`. Returns how many were removed.
    pub async fn cleanup(&self, retention_days: u32) -> usize {
        self.flush().await;
        let cutoff = self.clock.now() - clock::hours(u64::from(retention_days) * 24);
        let removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|e| e.timestamp >= cutoff);
            before - entries.len()
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.purge_before(cutoff).await {
                warn!(error = %e, "Failed to purge persisted action log");
            }
        }
        if removed > 0 {
            info!(removed, retention_days, "Purged old action log entries");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.flush().await;
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the flush timer and the retention sweep.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.flusher.spawn(self.config.flush_interval(), move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(logger) => {
                        logger.flush().await;
                        true
                    }
                    None => false,
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.retention.spawn(RETENTION_SWEEP_INTERVAL, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(logger) => {
                        logger.cleanup(logger.config.retention_days).await;
                        true
                    }
                    None => false,
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.flusher.is_running()
    }

    /// Stop the timers and flush whatever is buffered.
    pub async fn shutdown(&self) -> usize {
        self.flusher.stop();
        self.retention.stop();
        let flushed = self.flush().await;
        debug!(flushed, "Action logger shut down");
        flushed
    }
}

impl Default for ActionLogger {
    fn default() -> Self {
        Self::new(ActionLogConfig::default())
    }
}

fn newest_first(entries: &mut [&ActionLogEntry]) {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use crate::clock::ManualClock;
    use crate::storage::MemoryBackend;

    fn record(action: &str, target_id: &str, success: bool, now: DateTime<Utc>) -> ActionRecord {
        ActionRecord {
            command: format!("{}:item:{}", action, target_id),
            action: action.into(),
            target_type: "item".into(),
            target_id: target_id.into(),
            agent_id: Some("a1".into()),
            session_id: None,
            parameters: None,
            result: None,
            success,
            error_message: (!success).then(|| "boom".to_string()),
            execution_time_ms: 10,
            timestamp: now,
        }
    }

    fn logger(buffer: usize) -> (ActionLogger, ManualClock) {
        let clock = ManualClock::new();
        let logger = ActionLogger::with_clock(
            ActionLogConfig::default().with_buffer_size(buffer),
            Arc::new(clock.clone()),
        );
        (logger, clock)
    }

    #[tokio::test]
    async fn test_buffer_flushes_when_full() {
        let (log, clock) = logger(2);
        log.log(record("create", "i1", true, clock.now())).await;
        assert_eq!(log.buffered().await, 1);

        log.log(record("update", "i1", true, clock.now())).await;
        assert_eq!(log.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let (log, clock) = logger(100);
        for i in 0..3 {
            log.log(record("create", &format!("i{}", i), true, clock.now()))
                .await;
        }
        log.flush().await;
        log.log(record("delete", "i0", true, clock.now())).await;

        let mut ids: Vec<u64> = log
            .query(&ActionLogFilter::new())
            .await
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_query_filters_and_pages() {
        let (log, clock) = logger(100);
        let start = clock.now();
        log.log(record("create", "i1", true, clock.now())).await;
        clock.advance(ChronoDuration::minutes(1));
        log.log(record("update", "i1", false, clock.now())).await;
        clock.advance(ChronoDuration::minutes(1));
        log.log(record("update", "i2", true, clock.now())).await;

        let failed = log.query(&ActionLogFilter::new().success(false)).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("boom"));

        let on_i1 = log.query(&ActionLogFilter::new().target("item", "i1")).await;
        assert_eq!(on_i1.len(), 2);
        assert_eq!(on_i1[0].action, "update");

        let window = log
            .query(&ActionLogFilter::new().between(start, start + ChronoDuration::seconds(90)))
            .await;
        assert_eq!(window.len(), 2);

        let page = log.query(&ActionLogFilter::new().page(1, 1)).await;
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].target_id, "i1");
        assert_eq!(page[0].action, "update");
    }

    #[tokio::test]
    async fn test_rollback_candidates() {
        let (log, clock) = logger(100);
        log.log(record("create", "i1", true, clock.now())).await;
        clock.advance(ChronoDuration::seconds(1));
        log.log(record("read", "i1", true, clock.now())).await;
        log.log(record("update", "i1", false, clock.now())).await;
        clock.advance(ChronoDuration::seconds(1));
        log.log(record("update", "i1", true, clock.now())).await;
        log.log(record("delete", "i2", true, clock.now())).await;

        let candidates = log.get_rollback_candidates("item", "i1").await;
        let actions: Vec<&str> = candidates.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["update", "create"]);

        log.mark_rolled_back(candidates[0].id, "rb-1").await.unwrap();
        let remaining = log.get_rollback_candidates("item", "i1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, "create");

        assert!(log.mark_rolled_back(candidates[0].id, "rb-2").await.is_err());
        assert!(log.mark_rolled_back(999, "rb").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stats_and_recent() {
        let (log, clock) = logger(100);
        log.log(record("create", "i1", true, clock.now())).await;
        log.log(record("create", "i2", true, clock.now())).await;
        log.log(record("delete", "i1", false, clock.now())).await;

        let stats = log.get_action_stats(None).await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_action["create:item"], 2);
        assert_eq!(stats.by_agent["a1"], 3);
        assert_eq!(stats.average_execution_ms, 10.0);

        assert_eq!(log.get_recent_activity(2).await.len(), 2);
        assert_eq!(ActionLogger::default().get_action_stats(None).await.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_retention_cleanup() {
        let (log, clock) = logger(100);
        log.log(record("create", "old", true, clock.now())).await;
        clock.advance(ChronoDuration::days(31));
        log.log(record("create", "new", true, clock.now())).await;

        assert_eq!(log.cleanup(30).await, 1);
        let left = log.query(&ActionLogFilter::new()).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].target_id, "new");
    }

    #[tokio::test]
    async fn test_storage_sink_persists() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new();
        let log = ActionLogger::with_clock(ActionLogConfig::default(), Arc::new(clock.clone()))
            .with_sink(Arc::new(StorageSink::new(backend.clone())));

        log.log(record("create", "i1", true, clock.now())).await;
        log.flush().await;
        log.mark_rolled_back(1, "rb-1").await.unwrap();

        let stored = backend.read("action_log", "1").await.unwrap().unwrap();
        assert_eq!(stored["entryId"], 1);
        assert_eq!(stored["rollbackId"], "rb-1");

        clock.advance(ChronoDuration::days(40));
        log.cleanup(30).await;
        assert_eq!(backend.count("action_log").await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_keeps_everything() {
        let (log, clock) = logger(100);
        log.log(record("create", "i1", true, clock.now())).await;

        assert_eq!(log.cleanup(u32::MAX).await, 0);
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let (log, clock) = logger(100);
        let log = Arc::new(log);
        log.start();
        log.log(record("create", "i1", true, clock.now())).await;

        assert_eq!(log.shutdown().await, 1);
        assert!(!log.is_running());
    }
}
