//! FIFO-bounded log of dispensing outcomes

use crate::model::{HistoryEntry, HistoryRecord};
use crate::store::{HistoryRepository, StoreResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Default number of records kept, matching the device's own limit
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Append-only history with deterministic eviction of the oldest records
pub struct HistoryLog {
    repository: Arc<dyn HistoryRepository>,
    capacity: usize,
    signal: watch::Sender<Vec<HistoryRecord>>,
}

impl HistoryLog {
    pub fn new(repository: Arc<dyn HistoryRepository>, capacity: usize) -> Self {
        let (signal, _) = watch::channel(Vec::new());
        Self {
            repository,
            capacity,
            signal,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert unconditionally, then evict oldest records until within capacity
    pub async fn append(&self, entry: HistoryEntry) -> StoreResult<HistoryRecord> {
        let record = self.repository.insert_history(entry).await?;

        let mut total = self.repository.count_history().await?;
        if total > self.capacity {
            while total > self.capacity {
                let Some(oldest) = self.repository.oldest_history().await? else {
                    break;
                };
                self.repository.delete_history(oldest.id).await?;
                debug!(
                    record_id = oldest.id,
                    timestamp = %oldest.timestamp,
                    "Evicted oldest history record"
                );
                total -= 1;
            }
            info!(capacity = self.capacity, "History trimmed to capacity");
        }

        self.refresh().await?;
        Ok(record)
    }

    pub async fn clear(&self) -> StoreResult<()> {
        self.repository.clear_history().await?;
        info!("History cleared");
        self.refresh().await
    }

    /// All records, newest first
    pub async fn list(&self) -> StoreResult<Vec<HistoryRecord>> {
        self.repository.list_history().await
    }

    /// Records at or after `start`, newest first
    pub async fn since(&self, start: DateTime<Utc>) -> StoreResult<Vec<HistoryRecord>> {
        let mut records = self.repository.list_history().await?;
        records.retain(|r| r.timestamp >= start);
        Ok(records)
    }

    pub async fn count(&self) -> StoreResult<usize> {
        self.repository.count_history().await
    }

    /// Continuously updated view of the log, newest first
    pub fn subscribe(&self) -> watch::Receiver<Vec<HistoryRecord>> {
        self.signal.subscribe()
    }

    /// Re-read the repository into the watch signal
    pub async fn refresh(&self) -> StoreResult<()> {
        let records = self.repository.list_history().await?;
        self.signal.send_replace(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DoseOutcome;
    use crate::store::LocalStore;
    use chrono::TimeZone;

    fn entry(secs: i64, compartment: u8) -> HistoryEntry {
        HistoryEntry {
            dose_id: Some(compartment as i64),
            medication: format!("Med-{compartment}"),
            compartment,
            outcome: DoseOutcome::Taken,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_append_below_capacity_keeps_everything() {
        let log = HistoryLog::new(Arc::new(LocalStore::in_memory()), 3);
        log.append(entry(10, 1)).await.unwrap();
        log.append(entry(20, 2)).await.unwrap();
        assert_eq!(log.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_overflow_evicts_lowest_timestamp() {
        let log = HistoryLog::new(Arc::new(LocalStore::in_memory()), 3);
        // Out-of-order device timestamps: eviction follows timestamp, not insertion
        log.append(entry(30, 1)).await.unwrap();
        log.append(entry(10, 2)).await.unwrap();
        log.append(entry(20, 3)).await.unwrap();
        log.append(entry(40, 4)).await.unwrap();

        let remaining: Vec<i64> = log
            .list()
            .await
            .unwrap()
            .iter()
            .map(|r| r.timestamp.timestamp())
            .collect();
        assert_eq!(remaining, vec![40, 30, 20]);
    }

    #[tokio::test]
    async fn test_since_filters_by_timestamp() {
        let log = HistoryLog::new(Arc::new(LocalStore::in_memory()), 10);
        for secs in [100, 200, 300] {
            log.append(entry(secs, 1)).await.unwrap();
        }
        let recent = log.since(Utc.timestamp_opt(200, 0).unwrap()).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_signal_tracks_append_and_clear() {
        let log = HistoryLog::new(Arc::new(LocalStore::in_memory()), 10);
        let rx = log.subscribe();

        log.append(entry(100, 1)).await.unwrap();
        assert_eq!(rx.borrow().len(), 1);

        log.clear().await.unwrap();
        assert!(rx.borrow().is_empty());
    }
}
