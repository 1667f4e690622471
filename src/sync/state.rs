//! Pure synchronization state tracking

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::task::JoinHandle;

/// Whether the device is believed to hold the local schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unsynced,
    Resyncing,
    Synced,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Resyncing => "resyncing",
            SyncState::Synced => "synced",
        };
        f.write_str(name)
    }
}

/// What to do with a connect notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncDecision {
    Start,
    /// A resync for an older link is still running; cancel it first
    Supersede,
    /// This link generation already had its resync
    Duplicate,
}

/// One resync per physical connection
///
/// Connect notifications arrive from two paths (explicit connect and the
/// connectivity poll) and may both carry the same link generation.
#[derive(Debug, Default)]
pub struct ResyncTracker {
    last_started: Option<u64>,
    in_flight: Option<JoinHandle<()>>,
}

impl ResyncTracker {
    pub fn decide(&self, generation: u64) -> ResyncDecision {
        match self.last_started {
            Some(last) if generation <= last => ResyncDecision::Duplicate,
            _ if self.is_running() => ResyncDecision::Supersede,
            _ => ResyncDecision::Start,
        }
    }

    /// Claim `generation` before its task is spawned
    pub fn claim(&mut self, generation: u64) {
        self.cancel();
        self.last_started = Some(generation);
    }

    pub fn attach(&mut self, handle: JoinHandle<()>) {
        self.in_flight = Some(handle);
    }

    /// Abort the running resync, returning whether one was running
    pub fn cancel(&mut self) -> bool {
        match self.in_flight.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// True if `generation` is still the most recent resync
    pub fn is_current(&self, generation: u64) -> bool {
        self.last_started == Some(generation)
    }

    pub fn last_started(&self) -> Option<u64> {
        self.last_started
    }

    fn is_running(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Staleness guard for active-dose reports carrying a sequence number
///
/// Reports without `seq` are always accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportSequenceGuard {
    last_accepted: Option<u64>,
}

impl ReportSequenceGuard {
    pub fn accept(&mut self, sequence: Option<u64>) -> bool {
        let Some(sequence) = sequence else {
            return true;
        };
        match self.last_accepted {
            Some(last) if sequence <= last => false,
            _ => {
                self.last_accepted = Some(sequence);
                true
            }
        }
    }

    pub fn last_accepted(&self) -> Option<u64> {
        self.last_accepted
    }
}
