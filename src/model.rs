//! Domain types for the dispenser schedule and its history
//!
//! A [`Dose`] is the current value of one compartment's schedule entry. A
//! [`HistoryRecord`] is an immutable fact reported by the device.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Store-assigned dose identifier
pub type DoseId = i64;

/// Physical slot number on the device, starting at 1
pub type Compartment = u8;

/// Time of day in 24-hour `HH:mm` form
///
/// # Examples
/// ```
/// use dispenser_sync::model::DoseTime;
///
/// let time: DoseTime = "07:30".parse().unwrap();
/// assert_eq!(time.to_string(), "07:30");
/// assert!("7:3x".parse::<DoseTime>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DoseTime(NaiveTime);

#[derive(Debug, Error, PartialEq)]
#[error("Invalid time of day '{0}', expected HH:mm")]
pub struct InvalidDoseTime(pub String);

impl DoseTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for DoseTime {
    type Err = InvalidDoseTime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(Self)
            .map_err(|_| InvalidDoseTime(s.to_string()))
    }
}

impl fmt::Display for DoseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl Serialize for DoseTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DoseTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A dose that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDose {
    pub time: DoseTime,
    pub compartment: Compartment,
    pub medication: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NewDose {
    pub fn new(time: DoseTime, compartment: Compartment, medication: impl Into<String>) -> Self {
        Self {
            time,
            compartment,
            medication: medication.into(),
            active: true,
        }
    }

    pub fn with_id(self, id: DoseId) -> Dose {
        Dose {
            id,
            time: self.time,
            compartment: self.compartment,
            medication: self.medication,
            active: self.active,
        }
    }
}

/// A scheduled medication event, one per compartment at most
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dose {
    pub id: DoseId,
    pub time: DoseTime,
    pub compartment: Compartment,
    pub medication: String,
    pub active: bool,
}

/// Dispensing outcome reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseOutcome {
    Taken,
    Skipped,
}

impl fmt::Display for DoseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoseOutcome::Taken => write!(f, "taken"),
            DoseOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// A history fact before the store assigns its row identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Identifier the device reported for the dose, if any
    pub dose_id: Option<DoseId>,
    pub medication: String,
    pub compartment: Compartment,
    pub outcome: DoseOutcome,
    /// Device-reported time, never the local clock when the device sent one
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn with_id(self, id: u64) -> HistoryRecord {
        HistoryRecord {
            id,
            dose_id: self.dose_id,
            medication: self.medication,
            compartment: self.compartment,
            outcome: self.outcome,
            timestamp: self.timestamp,
        }
    }
}

/// Immutable dispensing outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub dose_id: Option<DoseId>,
    pub medication: String,
    pub compartment: Compartment,
    pub outcome: DoseOutcome,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dose_time_parse_and_display() {
        let time: DoseTime = "07:30".parse().unwrap();
        assert_eq!(time, DoseTime::from_hm(7, 30).unwrap());
        assert_eq!(time.to_string(), "07:30");

        let trimmed: DoseTime = " 21:05 ".parse().unwrap();
        assert_eq!(trimmed.to_string(), "21:05");
    }

    #[test]
    fn test_dose_time_rejects_invalid() {
        assert!("24:00".parse::<DoseTime>().is_err());
        assert!("12:60".parse::<DoseTime>().is_err());
        assert!("noon".parse::<DoseTime>().is_err());
        assert!("".parse::<DoseTime>().is_err());
    }

    #[test]
    fn test_dose_time_orders_by_time_of_day() {
        let early: DoseTime = "06:45".parse().unwrap();
        let late: DoseTime = "21:00".parse().unwrap();
        assert!(early < late);
    }

    #[test]
    fn test_dose_time_serde_as_string() {
        let dose = NewDose::new("08:00".parse().unwrap(), 2, "Ibuprofen").with_id(4);
        let json = serde_json::to_value(&dose).unwrap();
        assert_eq!(json["time"], "08:00");

        let back: Dose = serde_json::from_value(json).unwrap();
        assert_eq!(back, dose);
    }

    #[test]
    fn test_new_dose_defaults_active() {
        let parsed: NewDose =
            serde_json::from_str(r#"{"time":"10:15","compartment":3,"medication":"B"}"#).unwrap();
        assert!(parsed.active);
    }
}
