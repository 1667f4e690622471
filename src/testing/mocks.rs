//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for the MQTT session. It records every publish
//! with the (tokio) instant it happened, so throttle spacing can be checked
//! under paused time, and lets tests drive connectivity changes and inbound
//! messages by hand.

use crate::transport::{ConnectOrigin, ConnectOutcome, SessionError, SessionEvent, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

/// One recorded publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub at: Instant,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub should_fail: AtomicBool,
    connect_attempts: AtomicU32,
    generation: AtomicU64,
    connected_tx: watch::Sender<bool>,
    event_sender: Mutex<Option<mpsc::Sender<SessionEvent>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            should_fail: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            connected_tx,
            event_sender: Mutex::new(None),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose connects fail until `set_should_fail(false)`
    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.set_should_fail(true);
        transport
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn published_topics(&self) -> Vec<String> {
        self.published
            .lock()
            .await
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }

    pub async fn clear_published(&self) {
        self.published.lock().await.clear();
    }

    /// Push a raw session event to the engine
    pub async fn inject_event(&self, event: SessionEvent) {
        let sender = self.event_sender.lock().await.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Deliver an inbound message as if the device had published it
    pub async fn inject_message(&self, topic: &str, payload: impl Into<Bytes>) {
        self.inject_event(SessionEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
        .await;
    }

    /// The link drops without anyone asking
    pub async fn simulate_link_loss(&self, reason: &str) {
        if self.set_connected(false) {
            self.inject_event(SessionEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await;
        }
    }

    /// The client library reconnects by itself and the poll notices
    pub async fn simulate_auto_reconnect(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_connected(true);
        self.inject_event(SessionEvent::Connected {
            generation,
            origin: ConnectOrigin::AutoReconnect,
        })
        .await;
        generation
    }

    fn set_connected(&self, connected: bool) -> bool {
        self.connected_tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }

        if *self.connected_tx.borrow() {
            return Ok(ConnectOutcome {
                generation: self.generation(),
                already_connected: true,
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_connected(true);
        self.inject_event(SessionEvent::Connected {
            generation,
            origin: ConnectOrigin::Explicit,
        })
        .await;

        Ok(ConnectOutcome {
            generation,
            already_connected: false,
        })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        if !*self.connected_tx.borrow() {
            return Err(SessionError::NotConnected);
        }
        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        if self.set_connected(false) {
            self.inject_event(SessionEvent::Disconnected {
                reason: "client disconnect".to_string(),
            })
            .await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    async fn set_event_sender(&self, sender: mpsc::Sender<SessionEvent>) {
        *self.event_sender.lock().await = Some(sender);
    }
}
