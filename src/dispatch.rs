//! Decoding of inbound device messages into typed events
//!
//! The dispatcher never mutates state. A message it cannot decode is logged
//! and dropped; nothing downstream ever sees it.

use crate::protocol::{
    ActiveDosesMessage, AlarmActiveMessage, DeviceEvent, DoseEventMessage, DoseReport,
    RemoteDoseSnapshot, Topic,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an inbound message produced no event
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Not an inbound topic: {0}")]
    UnknownTopic(String),
    #[error("Malformed payload on {topic}: {source}")]
    Malformed {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Turns (topic, payload) pairs into [`DeviceEvent`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageDispatcher;

impl MessageDispatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<DeviceEvent, DecodeError> {
        let topic = Topic::inbound_from_path(topic)
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;

        let event = match topic {
            Topic::DoseConfirmed => {
                DeviceEvent::DoseConfirmed(DoseReport::from(parse::<DoseEventMessage>(
                    topic, payload,
                )?))
            }
            Topic::DoseSkipped => {
                DeviceEvent::DoseSkipped(DoseReport::from(parse::<DoseEventMessage>(
                    topic, payload,
                )?))
            }
            Topic::AlarmActive => {
                let alarm: AlarmActiveMessage = parse(topic, payload)?;
                DeviceEvent::AlarmActive {
                    medication: alarm.medication,
                    compartment: alarm.compartment,
                    time_label: alarm.time_label,
                }
            }
            Topic::ActiveDoses => {
                let report: ActiveDosesMessage = parse(topic, payload)?;
                let listed = report.doses.len();
                DeviceEvent::ActiveDoseReport {
                    snapshot: RemoteDoseSnapshot::from(report),
                    listed,
                }
            }
            Topic::Status => {
                DeviceEvent::DeviceStatus(String::from_utf8_lossy(payload).trim().to_string())
            }
            _ => return Err(DecodeError::UnknownTopic(topic.path().to_string())),
        };

        Ok(event)
    }

    /// Decode, logging and dropping anything that does not decode
    pub fn route(&self, topic: &str, payload: &[u8]) -> Option<DeviceEvent> {
        match self.decode(topic, payload) {
            Ok(event) => {
                debug!(topic, kind = event.kind(), "Decoded device event");
                Some(event)
            }
            Err(DecodeError::UnknownTopic(topic)) => {
                debug!(%topic, "Ignoring message on unknown topic");
                None
            }
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Dropping undecodable device message"
                );
                None
            }
        }
    }
}

fn parse<T: DeserializeOwned>(topic: Topic, payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed {
        topic: topic.path(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_confirmation() {
        let event = MessageDispatcher::new()
            .decode(
                "dose/confirmed",
                br#"{"dosis_id":4,"medicamento":"B","compartimiento":3,"timestamp":1700000000}"#,
            )
            .unwrap();
        match event {
            DeviceEvent::DoseConfirmed(report) => {
                assert_eq!(report.dose_id, Some(4));
                assert_eq!(report.compartment, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_skip_uses_same_schema() {
        let event = MessageDispatcher::new()
            .decode("dose/skipped", br#"{"compartimiento":6}"#)
            .unwrap();
        assert!(matches!(event, DeviceEvent::DoseSkipped(r) if r.compartment == 6));
    }

    #[test]
    fn test_decode_active_dose_report() {
        let event = MessageDispatcher::new()
            .decode(
                "device/active-doses",
                br#"{"dosis":[{"compartimiento":2,"hora":"08:00"},{"compartimiento":5}],"total":2}"#,
            )
            .unwrap();
        match event {
            DeviceEvent::ActiveDoseReport { snapshot, listed } => {
                assert_eq!(listed, 2);
                assert!(snapshot.contains(2));
                assert!(snapshot.contains(5));
                assert!(!snapshot.contains(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_alarm_defaults() {
        let event = MessageDispatcher::new()
            .decode("alarm/active", br#"{"compartimiento":1}"#)
            .unwrap();
        assert_eq!(
            event,
            DeviceEvent::AlarmActive {
                medication: "Medication".to_string(),
                compartment: 1,
                time_label: "--:--".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_status_is_opaque_text() {
        let event = MessageDispatcher::new()
            .decode("status", b" online \n")
            .unwrap();
        assert_eq!(event, DeviceEvent::DeviceStatus("online".to_string()));
    }

    #[test]
    fn test_unknown_and_outbound_topics_rejected() {
        let dispatcher = MessageDispatcher::new();
        assert!(matches!(
            dispatcher.decode("weather/today", b"{}"),
            Err(DecodeError::UnknownTopic(_))
        ));
        assert!(matches!(
            dispatcher.decode("config/dose", b"{}"),
            Err(DecodeError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let dispatcher = MessageDispatcher::new();
        assert!(matches!(
            dispatcher.decode("dose/confirmed", b"{not json"),
            Err(DecodeError::Malformed { topic: "dose/confirmed", .. })
        ));
        // Missing compartment must not guess one
        assert!(dispatcher
            .route("dose/confirmed", br#"{"medicamento":"A"}"#)
            .is_none());
    }
}
