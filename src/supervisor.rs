//! Connection supervision
//!
//! The supervisor owns the connection lifecycle: it makes the first connect,
//! retries failures on the backoff schedule, reconnects after an observed
//! loss and releases the session when asked to stop.

use crate::config::DispenserConfig;
use crate::sync::SyncEngine;
use crate::transport::mqtt::{LinkMonitor, ReconnectConfig, ReconnectionDecision};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Retry and timing policy for the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub startup_delay: Duration,
    /// Pause between seeing the link drop and reconnecting
    pub loss_delay: Duration,
    pub reconnect: ReconnectConfig,
    pub sync_clock_on_connect: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(1),
            loss_delay: Duration::from_secs(3),
            reconnect: ReconnectConfig::default(),
            sync_clock_on_connect: true,
        }
    }
}

impl From<&DispenserConfig> for SupervisorSettings {
    fn from(config: &DispenserConfig) -> Self {
        Self {
            startup_delay: Duration::from_millis(config.retry.startup_delay_ms),
            loss_delay: Duration::from_millis(config.retry.loss_delay_ms),
            reconnect: ReconnectConfig::from(&config.retry),
            sync_clock_on_connect: config.sync.sync_clock_on_connect,
        }
    }
}

/// Why the supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
    MaxAttemptsExceeded,
    /// The transport's connection signal closed
    TransportClosed,
}

pub struct ConnectionSupervisor {
    engine: Arc<SyncEngine>,
    settings: SupervisorSettings,
}

impl ConnectionSupervisor {
    pub fn new(engine: Arc<SyncEngine>, settings: SupervisorSettings) -> Self {
        Self { engine, settings }
    }

    /// Keep the link up until `shutdown` turns true or its sender is dropped.
    /// The session is disconnected before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SupervisorExit {
        let exit = self.supervise(&mut shutdown).await;
        info!(?exit, "Connection supervisor stopping");
        if let Err(e) = self.engine.transport().disconnect().await {
            warn!(error = %e, "Disconnect during shutdown failed");
        }
        exit
    }

    async fn supervise(&self, shutdown: &mut watch::Receiver<bool>) -> SupervisorExit {
        if !sleep_unless_shutdown(self.settings.startup_delay, shutdown).await {
            return SupervisorExit::Shutdown;
        }

        let mut connection = self.engine.connection_state();
        loop {
            if let Err(exit) = self.connect_with_retry(shutdown).await {
                return exit;
            }

            tokio::select! {
                lost = wait_for_loss(&mut connection) => {
                    if !lost {
                        return SupervisorExit::TransportClosed;
                    }
                }
                _ = shutdown_requested(shutdown) => return SupervisorExit::Shutdown,
            }

            info!(
                delay_ms = self.settings.loss_delay.as_millis() as u64,
                "Connection lost, reconnecting after delay"
            );
            if !sleep_unless_shutdown(self.settings.loss_delay, shutdown).await {
                return SupervisorExit::Shutdown;
            }
        }
    }

    async fn connect_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SupervisorExit> {
        let mut attempts = 0;
        loop {
            if *shutdown.borrow() {
                return Err(SupervisorExit::Shutdown);
            }

            match self.engine.transport().connect().await {
                Ok(outcome) => {
                    info!(
                        generation = outcome.generation,
                        already_connected = outcome.already_connected,
                        "Connected to broker"
                    );
                    if self.settings.sync_clock_on_connect {
                        drop(self.engine.set_clock());
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    match LinkMonitor::should_attempt_reconnection(
                        attempts,
                        &self.settings.reconnect,
                        false,
                    ) {
                        ReconnectionDecision::Proceed { attempt, delay_ms } => {
                            warn!(error = %e, attempt, delay_ms, "Connect failed, retrying");
                            let delay = Duration::from_millis(delay_ms);
                            if !sleep_unless_shutdown(delay, shutdown).await {
                                return Err(SupervisorExit::Shutdown);
                            }
                        }
                        ReconnectionDecision::AbortMaxAttemptsExceeded => {
                            error!(error = %e, attempts, "Giving up on broker connection");
                            return Err(SupervisorExit::MaxAttemptsExceeded);
                        }
                        ReconnectionDecision::AbortShutdownRequested => {
                            return Err(SupervisorExit::Shutdown);
                        }
                    }
                }
            }
        }
    }
}

/// False if the signal closed before the link dropped
async fn wait_for_loss(connection: &mut watch::Receiver<bool>) -> bool {
    connection.wait_for(|connected| !*connected).await.is_ok()
}

/// Resolves once the flag is true or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("Shutdown sender dropped");
    }
}

/// Returns false if shutdown arrived first
async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_requested(shutdown) => false,
    }
}
