//! Pure connection configuration for the MQTT session
//!
//! This module contains the session error type, option construction from the
//! broker section, retry timing, and the ConnAck wait used by `connect()`.

use crate::config::{BrokerSection, RetrySection};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

/// Session-level connection errors
///
/// None of these are fatal; the supervisor retries on all of them.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No ConnAck within {0:?}")]
    Timeout(Duration),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Session worker is no longer running")]
    WorkerGone,
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Progress of a single network connection, as seen by the event driver
#[derive(Debug, Clone, PartialEq)]
pub enum LinkStatus {
    Connecting,
    /// ConnAck received; carries the link generation it was assigned
    Up(u64),
    Failed(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of connect attempts, the first included (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![5_000, 10_000],
            sustained_delay: 10_000,
        }
    }
}

impl From<&RetrySection> for ReconnectConfig {
    fn from(retry: &RetrySection) -> Self {
        Self {
            max_attempts: retry.max_attempts,
            backoff_pattern: retry.backoff_pattern_ms.clone(),
            sustained_delay: retry.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based); sustains after the pattern runs out
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Build rumqttc options from the broker section
pub fn configure_mqtt_options(config: &BrokerSection) -> Result<MqttOptions, SessionError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| SessionError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let secure = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(SessionError::InvalidBrokerUrl(config.broker_url.clone())),
    };

    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);

    if secure {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    // Subscriptions are not kept across reconnects; the session re-subscribes
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}

/// Wait until the driver reports ConnAck, a failure, or the timeout elapses
pub async fn wait_for_connection_confirmation(
    mut status_rx: watch::Receiver<LinkStatus>,
    timeout: Duration,
) -> Result<u64, SessionError> {
    let confirmation = tokio::time::timeout(timeout, async {
        loop {
            match &*status_rx.borrow_and_update() {
                LinkStatus::Up(generation) => return Ok(*generation),
                LinkStatus::Failed(reason) => {
                    return Err(SessionError::ConnectionFailed(reason.clone()))
                }
                LinkStatus::Connecting => {}
            }
            if status_rx.changed().await.is_err() {
                return Err(SessionError::ConnectionFailed(
                    "Event driver stopped before ConnAck".to_string(),
                ));
            }
        }
    })
    .await;

    match confirmation {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(timeout)),
    }
}
