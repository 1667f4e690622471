//! Shared link flags and the periodic connectivity poll
//!
//! rumqttc reconnects on its own while the event driver keeps polling, and
//! that reconnection can happen without anyone asking for it. The poll in
//! [`run_link_monitor`] compares the physical link flag with the session's
//! connected signal and reconciles the two.

use super::connection::ReconnectConfig;
use super::message_handler::EventForwarder;
use super::session::SessionCommand;
use crate::transport::SessionEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Physical link flags plus the connected signal observers subscribe to
#[derive(Debug)]
pub struct LinkState {
    up: AtomicBool,
    connecting: AtomicBool,
    generation: AtomicU64,
    connected_tx: watch::Sender<bool>,
}

impl LinkState {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            up: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            connected_tx,
        }
    }

    /// Record a ConnAck and return the new link generation
    pub fn mark_up(&self) -> u64 {
        self.up.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn mark_down(&self) {
        self.up.store(false, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn set_connecting(&self, connecting: bool) {
        self.connecting.store(connecting, Ordering::SeqCst);
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Set the connected signal, returning whether it changed
    pub fn set_connected(&self, connected: bool) -> bool {
        self.connected_tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one connectivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCheck {
    Steady,
    /// Link is up but the session still believes it is disconnected
    Restored,
    /// Link is down but the session still believes it is connected
    Lost,
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Pure connectivity and retry decisions
pub struct LinkMonitor;

impl LinkMonitor {
    /// Compare the physical link with the connected signal
    ///
    /// While an explicit connect is in flight the connect path owns the
    /// transition, so a link that comes up is not reported as restored.
    pub fn assess(link_up: bool, connected: bool, connecting: bool) -> LinkCheck {
        match (link_up, connected) {
            (true, false) if !connecting => LinkCheck::Restored,
            (false, true) => LinkCheck::Lost,
            _ => LinkCheck::Steady,
        }
    }

    /// Determine if another connection attempt should be made
    ///
    /// `failed_attempts` counts every connect made so far, the first one
    /// included, so `max_attempts` bounds the total number of connects.
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay_ms: config.calculate_backoff_delay(failed_attempts),
        }
    }
}

/// Poll the link every `interval` until the worker goes away
pub async fn run_link_monitor(
    link: Arc<LinkState>,
    commands: mpsc::Sender<SessionCommand>,
    events: EventForwarder,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(interval_ms = interval.as_millis() as u64, "Connectivity poll started");

    loop {
        ticker.tick().await;

        match LinkMonitor::assess(link.is_up(), link.is_connected(), link.is_connecting()) {
            LinkCheck::Steady => {}
            LinkCheck::Restored => {
                let generation = link.generation();
                info!(generation, "Client library restored the link on its own");
                if commands
                    .send(SessionCommand::LinkRestored { generation })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            LinkCheck::Lost => {
                if link.set_connected(false) {
                    warn!("Connectivity poll found the link down");
                    events
                        .forward(SessionEvent::Disconnected {
                            reason: "link down at connectivity poll".to_string(),
                        })
                        .await;
                }
            }
        }
    }

    debug!("Connectivity poll stopped");
}
