//! Persistence contract for doses and history
//!
//! The engine only talks to storage through [`DoseRepository`] and
//! [`HistoryRepository`]. [`LocalStore`] implements both, in memory or backed
//! by a JSON state file.

use crate::model::{Compartment, Dose, DoseId, HistoryEntry, HistoryRecord, NewDose};
use async_trait::async_trait;
use thiserror::Error;

pub mod local;

pub use local::LocalStore;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write/query contract for the dose schedule
#[async_trait]
pub trait DoseRepository: Send + Sync {
    /// All doses ordered by time of day ascending
    async fn list_doses(&self) -> StoreResult<Vec<Dose>>;

    async fn get_dose(&self, id: DoseId) -> StoreResult<Option<Dose>>;

    async fn get_dose_by_compartment(&self, compartment: Compartment)
        -> StoreResult<Option<Dose>>;

    /// Persist a new dose and assign its identifier
    async fn insert_dose(&self, dose: NewDose) -> StoreResult<Dose>;

    /// Replace an existing dose; `NotFound` if the identifier is unknown
    async fn update_dose(&self, dose: &Dose) -> StoreResult<()>;

    /// Remove a dose, returning whether it existed
    async fn delete_dose(&self, id: DoseId) -> StoreResult<bool>;
}

/// Read/write/query contract for the dispensing history
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// All records ordered by timestamp descending
    async fn list_history(&self) -> StoreResult<Vec<HistoryRecord>>;

    async fn insert_history(&self, entry: HistoryEntry) -> StoreResult<HistoryRecord>;

    async fn delete_history(&self, id: u64) -> StoreResult<bool>;

    async fn clear_history(&self) -> StoreResult<()>;

    async fn count_history(&self) -> StoreResult<usize>;

    /// Record with the lowest timestamp
    async fn oldest_history(&self) -> StoreResult<Option<HistoryRecord>>;
}
