//! Error types for dispenser synchronization
//!
//! Layer errors (`SessionError`, `StoreError`, `ConfigError`) fold into
//! [`SyncError`], the error callers of the engine see. Decode failures and
//! reconciliation misses are logged where they happen and never reach here.

use crate::model::{Compartment, DoseId};
use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Compartment {compartment} already has a dose assigned; remove it first")]
    CompartmentOccupied { compartment: Compartment },

    #[error("Invalid dose: {message}")]
    InvalidDose { message: String },

    #[error("Dose {id} not found")]
    DoseNotFound { id: DoseId },

    #[error("Connection error: {0}")]
    Connection(#[from] crate::transport::mqtt::SessionError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl SyncError {
    /// Create invalid dose error
    pub fn invalid_dose<S: Into<String>>(message: S) -> Self {
        Self::InvalidDose {
            message: message.into(),
        }
    }

    /// Failures a user should be told about; everything else degrades silently
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SyncError::CompartmentOccupied { .. }
                | SyncError::InvalidDose { .. }
                | SyncError::Connection(_)
        )
    }
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
