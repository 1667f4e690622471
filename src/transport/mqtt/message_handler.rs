//! Pure routing of rumqttc events and forwarding of session events
//!
//! The event driver classifies every polled event with
//! [`MessageHandler::route_event`] and hands the resulting session events to
//! an [`EventForwarder`], which the engine subscribes to.

use crate::protocol::Topic;
use crate::transport::SessionEvent;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Pure routing decisions based on rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event polled from the event loop
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAcknowledged
                }
                Packet::ConnAck(ack) => EventRoute::ConnectionRefused(format!("{:?}", ack.code)),
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether a received publish should be forwarded to the engine
    ///
    /// The device does not retain its events, so a retained message on an
    /// inbound topic is stale by definition.
    pub fn should_forward(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }
        if Topic::inbound_from_path(topic).is_none() {
            debug!(topic, "Ignoring message on unsubscribed topic");
            return false;
        }
        true
    }
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    /// Broker answered the connect with a non-success return code
    ConnectionRefused(String),
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    SubscriptionConfirmed {
        packet_id: u16,
        rejected: usize,
    },
    /// Broker closed the session
    Disconnected,
    /// Our own disconnect packet went out
    DisconnectSent,
    /// PingResp, PubAck and similar
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Shared handle to the engine's event channel
///
/// The driver, the link monitor and the worker all raise events through the
/// same forwarder. Events raised before a sender is configured are dropped.
#[derive(Clone, Default)]
pub struct EventForwarder {
    sender: Arc<Mutex<Option<mpsc::Sender<SessionEvent>>>>,
}

impl EventForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_sender(&self, sender: mpsc::Sender<SessionEvent>) {
        *self.sender.lock().await = Some(sender);
    }

    pub async fn forward(&self, event: SessionEvent) {
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(sender) => {
                if sender.send(event).await.is_err() {
                    warn!("Session event receiver dropped, event lost");
                }
            }
            None => {
                debug!(?event, "No event sender configured, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let ack = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_event(&ack),
            EventRoute::ConnectionAcknowledged
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_event(&refused),
            EventRoute::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("dose/confirmed", QoS::AtLeastOnce, r#"{"compartimiento":3}"#);
        let route = MessageHandler::route_event(&Event::Incoming(Packet::Publish(publish)));
        match route {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "dose/confirmed");
                assert_eq!(&payload[..], br#"{"compartimiento":3}"#);
                assert!(!retain);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_route_suback_counts_rejections() {
        let suback = SubAck::new(
            4,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::SubAck(suback))),
            EventRoute::SubscriptionConfirmed {
                packet_id: 4,
                rejected: 1
            }
        );
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_should_forward() {
        assert!(MessageHandler::should_forward("dose/skipped", false));
        assert!(!MessageHandler::should_forward("dose/skipped", true));
        // Outbound topic echoed back by a wildcard subscriber
        assert!(!MessageHandler::should_forward("config/dose", false));
    }

    #[tokio::test]
    async fn test_forwarder_delivers_after_sender_set() {
        let forwarder = EventForwarder::new();
        forwarder
            .forward(SessionEvent::Disconnected {
                reason: "dropped".to_string(),
            })
            .await;

        let (tx, mut rx) = mpsc::channel(4);
        forwarder.set_sender(tx).await;
        forwarder
            .forward(SessionEvent::Disconnected {
                reason: "kept".to_string(),
            })
            .await;

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Disconnected {
                reason: "kept".to_string()
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
