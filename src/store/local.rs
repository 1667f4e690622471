//! In-process store with optional JSON file persistence

use super::{DoseRepository, HistoryRepository, StoreError, StoreResult};
use crate::model::{Compartment, Dose, DoseId, HistoryEntry, HistoryRecord, NewDose};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    next_dose_id: DoseId,
    doses: BTreeMap<DoseId, Dose>,
    next_history_id: u64,
    history: Vec<HistoryRecord>,
}

impl StoreState {
    fn allocate_dose_id(&mut self) -> DoseId {
        self.next_dose_id = self.next_dose_id.max(0) + 1;
        self.next_dose_id
    }

    fn allocate_history_id(&mut self) -> u64 {
        self.next_history_id += 1;
        self.next_history_id
    }
}

/// Dose and history store
///
/// Every mutation is written through to the state file when one is
/// configured, while the state lock is held so writes land in order. A
/// mutation is applied to a copy of the state and only becomes visible once
/// that copy has been written.
pub struct LocalStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
        }
    }

    /// Open a file-backed store, starting empty if the file does not exist
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: StoreState = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    doses = state.doses.len(),
                    history = state.history.len(),
                    "Loaded dispenser state"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file yet, starting empty");
                StoreState::default()
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, state: &StoreState) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Persisted dispenser state");
        Ok(())
    }

    /// Persist `next`, then make it the current state
    async fn commit(
        &self,
        state: &mut MutexGuard<'_, StoreState>,
        next: StoreState,
    ) -> StoreResult<()> {
        self.persist(&next).await?;
        **state = next;
        Ok(())
    }
}

#[async_trait]
impl DoseRepository for LocalStore {
    async fn list_doses(&self) -> StoreResult<Vec<Dose>> {
        let state = self.state.lock().await;
        let mut doses: Vec<Dose> = state.doses.values().cloned().collect();
        doses.sort_by(|a, b| a.time.cmp(&b.time).then(a.compartment.cmp(&b.compartment)));
        Ok(doses)
    }

    async fn get_dose(&self, id: DoseId) -> StoreResult<Option<Dose>> {
        Ok(self.state.lock().await.doses.get(&id).cloned())
    }

    async fn get_dose_by_compartment(
        &self,
        compartment: Compartment,
    ) -> StoreResult<Option<Dose>> {
        let state = self.state.lock().await;
        Ok(state
            .doses
            .values()
            .find(|d| d.compartment == compartment)
            .cloned())
    }

    async fn insert_dose(&self, dose: NewDose) -> StoreResult<Dose> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let id = next.allocate_dose_id();
        let dose = dose.with_id(id);
        next.doses.insert(id, dose.clone());
        self.commit(&mut state, next).await?;
        Ok(dose)
    }

    async fn update_dose(&self, dose: &Dose) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        match next.doses.get_mut(&dose.id) {
            Some(existing) => *existing = dose.clone(),
            None => return Err(StoreError::NotFound(format!("dose {}", dose.id))),
        }
        self.commit(&mut state, next).await
    }

    async fn delete_dose(&self, id: DoseId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let existed = next.doses.remove(&id).is_some();
        if existed {
            self.commit(&mut state, next).await?;
        }
        Ok(existed)
    }
}

#[async_trait]
impl HistoryRepository for LocalStore {
    async fn list_history(&self) -> StoreResult<Vec<HistoryRecord>> {
        let state = self.state.lock().await;
        let mut history = state.history.clone();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(history)
    }

    async fn insert_history(&self, entry: HistoryEntry) -> StoreResult<HistoryRecord> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let id = next.allocate_history_id();
        let record = entry.with_id(id);
        next.history.push(record.clone());
        self.commit(&mut state, next).await?;
        Ok(record)
    }

    async fn delete_history(&self, id: u64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.history.retain(|r| r.id != id);
        let existed = next.history.len() != state.history.len();
        if existed {
            self.commit(&mut state, next).await?;
        }
        Ok(existed)
    }

    async fn clear_history(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.history.clear();
        self.commit(&mut state, next).await
    }

    async fn count_history(&self) -> StoreResult<usize> {
        Ok(self.state.lock().await.history.len())
    }

    async fn oldest_history(&self) -> StoreResult<Option<HistoryRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .min_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DoseOutcome;
    use chrono::{TimeZone, Utc};

    fn entry(secs: i64) -> HistoryEntry {
        HistoryEntry {
            dose_id: None,
            medication: "A".to_string(),
            compartment: 1,
            outcome: DoseOutcome::Taken,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = LocalStore::in_memory();
        let a = store
            .insert_dose(NewDose::new("08:00".parse().unwrap(), 1, "A"))
            .await
            .unwrap();
        let b = store
            .insert_dose(NewDose::new("09:00".parse().unwrap(), 2, "B"))
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.get_dose(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_doses_listed_by_time_ascending() {
        let store = LocalStore::in_memory();
        for (time, compartment) in [("20:00", 1), ("06:30", 2), ("12:15", 3)] {
            store
                .insert_dose(NewDose::new(time.parse().unwrap(), compartment, "X"))
                .await
                .unwrap();
        }
        let times: Vec<String> = store
            .list_doses()
            .await
            .unwrap()
            .iter()
            .map(|d| d.time.to_string())
            .collect();
        assert_eq!(times, vec!["06:30", "12:15", "20:00"]);
    }

    #[tokio::test]
    async fn test_lookup_by_compartment() {
        let store = LocalStore::in_memory();
        let dose = store
            .insert_dose(NewDose::new("08:00".parse().unwrap(), 5, "A"))
            .await
            .unwrap();
        assert_eq!(store.get_dose_by_compartment(5).await.unwrap(), Some(dose));
        assert_eq!(store.get_dose_by_compartment(6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_unknown_dose_fails() {
        let store = LocalStore::in_memory();
        let ghost = NewDose::new("08:00".parse().unwrap(), 1, "A").with_id(42);
        assert!(matches!(
            store.update_dose(&ghost).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = LocalStore::in_memory();
        let dose = store
            .insert_dose(NewDose::new("08:00".parse().unwrap(), 1, "A"))
            .await
            .unwrap();
        assert!(store.delete_dose(dose.id).await.unwrap());
        assert!(!store.delete_dose(dose.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_order_and_oldest() {
        let store = LocalStore::in_memory();
        store.insert_history(entry(300)).await.unwrap();
        store.insert_history(entry(100)).await.unwrap();
        store.insert_history(entry(200)).await.unwrap();

        let listed: Vec<i64> = store
            .list_history()
            .await
            .unwrap()
            .iter()
            .map(|r| r.timestamp.timestamp())
            .collect();
        assert_eq!(listed, vec![300, 200, 100]);

        let oldest = store.oldest_history().await.unwrap().unwrap();
        assert_eq!(oldest.timestamp.timestamp(), 100);
        assert_eq!(store.count_history().await.unwrap(), 3);

        store.clear_history().await.unwrap();
        assert_eq!(store.count_history().await.unwrap(), 0);
        assert_eq!(store.oldest_history().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = LocalStore::open(&path).await.unwrap();
        let dose = store
            .insert_dose(NewDose::new("07:30".parse().unwrap(), 1, "A"))
            .await
            .unwrap();
        store.insert_history(entry(1_700_000_000)).await.unwrap();
        drop(store);

        let reopened = LocalStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_doses().await.unwrap(), vec![dose.clone()]);
        assert_eq!(reopened.count_history().await.unwrap(), 1);

        let next = reopened
            .insert_dose(NewDose::new("08:30".parse().unwrap(), 2, "B"))
            .await
            .unwrap();
        assert!(next.id > dose.id, "identifiers must stay unique after reload");
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            LocalStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
