//! Wire schemas exchanged with the dispenser firmware
//!
//! Field names on the wire are the firmware's (`compartimiento`,
//! `medicamento`, ...); the Rust side uses the domain names. Inbound schemas
//! are lenient where the firmware is known to omit fields and strict where a
//! guessed value could delete the wrong dose.

use crate::model::{Compartment, Dose, DoseId, DoseOutcome, DoseTime, HistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Dose configuration pushed to the device on `config/dose`
///
/// # Examples
/// ```
/// use dispenser_sync::model::NewDose;
/// use dispenser_sync::protocol::DoseConfigMessage;
///
/// let dose = NewDose::new("07:30".parse().unwrap(), 1, "A").with_id(12);
/// let json = serde_json::to_string(&DoseConfigMessage::from(&dose)).unwrap();
/// assert_eq!(
///     json,
///     r#"{"dosis_id":12,"hora":"07:30","compartimiento":1,"medicamento":"A","activo":true}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseConfigMessage {
    #[serde(rename = "dosis_id")]
    pub dose_id: DoseId,
    #[serde(rename = "hora")]
    pub time: DoseTime,
    #[serde(rename = "compartimiento")]
    pub compartment: Compartment,
    #[serde(rename = "medicamento")]
    pub medication: String,
    #[serde(rename = "activo")]
    pub active: bool,
}

impl From<&Dose> for DoseConfigMessage {
    fn from(dose: &Dose) -> Self {
        Self {
            dose_id: dose.id,
            time: dose.time,
            compartment: dose.compartment,
            medication: dose.medication.clone(),
            active: dose.active,
        }
    }
}

/// Deletion keyed by compartment on `config/delete-dose`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDoseMessage {
    #[serde(rename = "compartimiento")]
    pub compartment: Compartment,
}

/// Payload of `dose/confirmed` and `dose/skipped`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DoseEventMessage {
    #[serde(default)]
    pub dose_id: Option<DoseId>,
    /// Older firmware spelling, used when `dose_id` is absent
    #[serde(rename = "dosis_id", default)]
    pub legacy_dose_id: Option<DoseId>,
    #[serde(rename = "medicamento", default = "unknown_medication")]
    pub medication: String,
    #[serde(rename = "compartimiento")]
    pub compartment: Compartment,
    /// Seconds since the epoch on the device clock
    #[serde(default)]
    pub timestamp: Option<i64>,
}

fn unknown_medication() -> String {
    "Unknown".to_string()
}

/// Payload of `alarm/active`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlarmActiveMessage {
    #[serde(rename = "medicamento", default = "default_alarm_medication")]
    pub medication: String,
    #[serde(rename = "compartimiento")]
    pub compartment: Compartment,
    #[serde(rename = "hora", default = "default_alarm_time")]
    pub time_label: String,
}

fn default_alarm_medication() -> String {
    "Medication".to_string()
}

fn default_alarm_time() -> String {
    "--:--".to_string()
}

/// Payload of `device/active-doses`, sent by the device after a restart
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActiveDosesMessage {
    #[serde(rename = "dosis")]
    pub doses: Vec<ActiveDoseEntry>,
    pub total: u32,
    /// Monotonic report counter, newer firmware only
    #[serde(default)]
    pub seq: Option<u64>,
}

/// One entry of an active-dose report; other firmware fields are ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActiveDoseEntry {
    #[serde(rename = "compartimiento")]
    pub compartment: Compartment,
}

/// Confirmation or omission of a dose, as seen by the device
#[derive(Debug, Clone, PartialEq)]
pub struct DoseReport {
    pub dose_id: Option<DoseId>,
    pub medication: String,
    pub compartment: Compartment,
    pub device_timestamp: DateTime<Utc>,
}

impl DoseReport {
    pub fn into_history_entry(self, outcome: DoseOutcome) -> HistoryEntry {
        HistoryEntry {
            dose_id: self.dose_id,
            medication: self.medication,
            compartment: self.compartment,
            outcome,
            timestamp: self.device_timestamp,
        }
    }
}

impl From<DoseEventMessage> for DoseReport {
    fn from(message: DoseEventMessage) -> Self {
        // Firmware sends -1 when it has no identifier for the dose
        let dose_id = message
            .dose_id
            .filter(|id| *id >= 0)
            .or(message.legacy_dose_id.filter(|id| *id >= 0));
        let device_timestamp = message
            .timestamp
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        Self {
            dose_id,
            medication: message.medication,
            compartment: message.compartment,
            device_timestamp,
        }
    }
}

/// Compartments the device currently holds as active
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDoseSnapshot {
    pub compartments: BTreeSet<Compartment>,
    pub declared_total: u32,
    pub sequence: Option<u64>,
}

impl RemoteDoseSnapshot {
    pub fn contains(&self, compartment: Compartment) -> bool {
        self.compartments.contains(&compartment)
    }

    /// True when the declared total disagrees with the listed entries
    pub fn total_mismatch(&self, listed: usize) -> bool {
        self.declared_total as usize != listed
    }
}

impl From<ActiveDosesMessage> for RemoteDoseSnapshot {
    fn from(message: ActiveDosesMessage) -> Self {
        Self {
            compartments: message.doses.iter().map(|d| d.compartment).collect(),
            declared_total: message.total,
            sequence: message.seq,
        }
    }
}

/// Typed inbound event produced by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    DoseConfirmed(DoseReport),
    DoseSkipped(DoseReport),
    AlarmActive {
        medication: String,
        compartment: Compartment,
        time_label: String,
    },
    ActiveDoseReport {
        snapshot: RemoteDoseSnapshot,
        /// Number of entries actually listed in the payload
        listed: usize,
    },
    DeviceStatus(String),
}

impl DeviceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::DoseConfirmed(_) => "dose_confirmed",
            DeviceEvent::DoseSkipped(_) => "dose_skipped",
            DeviceEvent::AlarmActive { .. } => "alarm_active",
            DeviceEvent::ActiveDoseReport { .. } => "active_dose_report",
            DeviceEvent::DeviceStatus(_) => "device_status",
        }
    }
}
