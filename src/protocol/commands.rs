//! Outbound commands and their wire encoding
//!
//! Every command maps to exactly one topic and one payload shape.

use super::messages::{DeleteDoseMessage, DoseConfigMessage};
use super::topics::Topic;
use crate::model::{Compartment, Dose};
use chrono::{Local, NaiveDateTime};

/// Clock format understood by the device firmware
pub const CLOCK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A command for the dispenser
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    ConfigureDose(DoseConfigMessage),
    DeleteDose { compartment: Compartment },
    ClearAll,
    SetClock(NaiveDateTime),
    StopAlarm,
    TestLed(bool),
    TestBuzzer(bool),
    RequestActiveDoses,
}

impl OutboundCommand {
    pub fn configure(dose: &Dose) -> Self {
        OutboundCommand::ConfigureDose(DoseConfigMessage::from(dose))
    }

    /// Clock command carrying the current local time
    pub fn set_clock_now() -> Self {
        OutboundCommand::SetClock(Local::now().naive_local())
    }

    pub fn topic(&self) -> Topic {
        match self {
            OutboundCommand::ConfigureDose(_) => Topic::ConfigDose,
            OutboundCommand::DeleteDose { .. } => Topic::DeleteDose,
            OutboundCommand::ClearAll => Topic::ClearAll,
            OutboundCommand::SetClock(_) => Topic::ConfigClock,
            OutboundCommand::StopAlarm => Topic::AlarmStop,
            OutboundCommand::TestLed(_) => Topic::TestLed,
            OutboundCommand::TestBuzzer(_) => Topic::TestBuzzer,
            OutboundCommand::RequestActiveDoses => Topic::RequestDoses,
        }
    }

    /// Encode the payload for this command's topic
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = match self {
            OutboundCommand::ConfigureDose(message) => serde_json::to_vec(message)?,
            OutboundCommand::DeleteDose { compartment } => serde_json::to_vec(&DeleteDoseMessage {
                compartment: *compartment,
            })?,
            OutboundCommand::ClearAll => b"clear".to_vec(),
            OutboundCommand::SetClock(at) => at.format(CLOCK_FORMAT).to_string().into_bytes(),
            OutboundCommand::StopAlarm => b"stop".to_vec(),
            OutboundCommand::TestLed(on) | OutboundCommand::TestBuzzer(on) => {
                on_off(*on).as_bytes().to_vec()
            }
            OutboundCommand::RequestActiveDoses => b"sync".to_vec(),
        };
        Ok(payload)
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
