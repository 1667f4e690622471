//! Transport layer for the dispenser link
//!
//! This module provides the transport abstraction the engine and supervisor
//! are written against, and the MQTT session that implements it.

use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::{mpsc, watch};

pub mod mqtt;

pub use mqtt::SessionError;

/// How a connection came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    /// `connect()` was called and succeeded
    Explicit,
    /// The client library reconnected on its own; seen by the connectivity poll
    AutoReconnect,
}

/// Events raised by a session, in the order they were observed
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A physical connection is up. `generation` increases with every broker
    /// acknowledgement, so the same connection may be reported twice (once
    /// per origin) with the same generation.
    Connected {
        generation: u64,
        origin: ConnectOrigin,
    },
    Disconnected {
        reason: String,
    },
    Message {
        topic: String,
        payload: Bytes,
    },
}

/// Result of a successful `connect()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub generation: u64,
    /// True when the link was already up and no network connect was issued
    pub already_connected: bool,
}

/// Transport trait for the dispenser session
///
/// This trait provides an abstraction over the broker connection to enable
/// dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect (idempotent) and subscribe to the inbound topics
    async fn connect(&self) -> Result<ConnectOutcome, SessionError>;

    /// Publish one payload; fails with `NotConnected` instead of queueing
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError>;

    /// Release the session; state is disconnected afterwards whatever happens
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Continuously updated connected flag
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// Set the sender that receives connectivity and message events
    async fn set_event_sender(&self, sender: mpsc::Sender<SessionEvent>);
}
