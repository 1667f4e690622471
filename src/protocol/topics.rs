//! Topic table shared with the dispenser firmware
//!
//! Every inbound and outbound topic is fixed. Outbound topics are the ones the
//! app publishes to, inbound topics are subscribed on every (re)connect.

use std::fmt;

/// All topics exchanged with the dispenser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    // app -> device
    ConfigDose,
    ConfigClock,
    AlarmStop,
    DeleteDose,
    TestLed,
    TestBuzzer,
    RequestDoses,
    ClearAll,
    // device -> app
    Status,
    DoseConfirmed,
    DoseSkipped,
    AlarmActive,
    ActiveDoses,
}

/// Topics subscribed on every successful connect
pub const INBOUND_TOPICS: [Topic; 5] = [
    Topic::Status,
    Topic::DoseConfirmed,
    Topic::DoseSkipped,
    Topic::AlarmActive,
    Topic::ActiveDoses,
];

impl Topic {
    pub fn path(&self) -> &'static str {
        match self {
            Topic::ConfigDose => "config/dose",
            Topic::ConfigClock => "config/clock",
            Topic::AlarmStop => "alarm/stop",
            Topic::DeleteDose => "config/delete-dose",
            Topic::TestLed => "test/led",
            Topic::TestBuzzer => "test/buzzer",
            Topic::RequestDoses => "request/doses",
            Topic::ClearAll => "clear-all",
            Topic::Status => "status",
            Topic::DoseConfirmed => "dose/confirmed",
            Topic::DoseSkipped => "dose/skipped",
            Topic::AlarmActive => "alarm/active",
            Topic::ActiveDoses => "device/active-doses",
        }
    }

    /// Resolve an inbound topic path; outbound and unknown paths yield None
    pub fn inbound_from_path(path: &str) -> Option<Topic> {
        INBOUND_TOPICS.iter().copied().find(|t| t.path() == path)
    }

    pub fn is_inbound(&self) -> bool {
        INBOUND_TOPICS.contains(self)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_lookup() {
        assert_eq!(
            Topic::inbound_from_path("dose/confirmed"),
            Some(Topic::DoseConfirmed)
        );
        assert_eq!(
            Topic::inbound_from_path("device/active-doses"),
            Some(Topic::ActiveDoses)
        );
        assert_eq!(Topic::inbound_from_path("status"), Some(Topic::Status));
    }

    #[test]
    fn test_outbound_paths_are_not_inbound() {
        assert_eq!(Topic::inbound_from_path("config/dose"), None);
        assert_eq!(Topic::inbound_from_path("clear-all"), None);
        assert_eq!(Topic::inbound_from_path("history/data"), None);
        assert!(!Topic::ConfigDose.is_inbound());
        assert!(Topic::AlarmActive.is_inbound());
    }

    #[test]
    fn test_topic_paths_are_unique() {
        let all = [
            Topic::ConfigDose,
            Topic::ConfigClock,
            Topic::AlarmStop,
            Topic::DeleteDose,
            Topic::TestLed,
            Topic::TestBuzzer,
            Topic::RequestDoses,
            Topic::ClearAll,
            Topic::Status,
            Topic::DoseConfirmed,
            Topic::DoseSkipped,
            Topic::AlarmActive,
            Topic::ActiveDoses,
        ];
        let paths: std::collections::HashSet<_> = all.iter().map(|t| t.path()).collect();
        assert_eq!(paths.len(), all.len());
    }
}
