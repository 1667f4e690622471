//! Dose synchronization between the local schedule and the dispenser

pub mod engine;
pub mod state;

pub use engine::{validate_dose, ConfirmationOutcome, ReconcileOutcome, SyncEngine, SyncSettings};
pub use state::{ReportSequenceGuard, ResyncDecision, ResyncTracker, SyncState};
