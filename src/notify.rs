//! Delivery of device alarms to whoever looks after the patient
//!
//! The engine forwards every `alarm/active` event to an [`AlarmNotifier`].
//! [`LogNotifier`] is the default; [`ChannelNotifier`] hands alarms to a UI
//! or any other consumer over a channel.

use crate::model::Compartment;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A dose alarm currently sounding on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmNotice {
    pub medication: String,
    pub compartment: Compartment,
    /// Scheduled time as the device printed it, `--:--` when unknown
    pub time_label: String,
}

pub trait AlarmNotifier: Send + Sync {
    fn alarm_active(&self, alarm: &AlarmNotice);
}

/// Writes alarms to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AlarmNotifier for LogNotifier {
    fn alarm_active(&self, alarm: &AlarmNotice) {
        warn!(
            medication = %alarm.medication,
            compartment = alarm.compartment,
            time = %alarm.time_label,
            "Dose alarm active on dispenser"
        );
    }
}

/// Forwards alarms over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<AlarmNotice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlarmNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AlarmNotifier for ChannelNotifier {
    fn alarm_active(&self, alarm: &AlarmNotice) {
        if self.sender.send(alarm.clone()).is_err() {
            debug!(compartment = alarm.compartment, "Alarm receiver gone, notice dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> AlarmNotice {
        AlarmNotice {
            medication: "Ibuprofeno".to_string(),
            compartment: 2,
            time_label: "08:00".to_string(),
        }
    }

    #[test]
    fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.alarm_active(&notice());
        assert_eq!(rx.try_recv().unwrap(), notice());
    }

    #[test]
    fn test_channel_notifier_survives_closed_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.alarm_active(&notice());
    }
}
