//! Dose synchronization engine
//!
//! The engine owns every local mutation of the dose schedule and the
//! history, reacts to session events, and keeps the device in step with the
//! local schedule by running a full resync once per physical connection.

use super::state::{ReportSequenceGuard, ResyncDecision, ResyncTracker, SyncState};
use crate::config::DispenserConfig;
use crate::dispatch::MessageDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::history::{HistoryLog, DEFAULT_HISTORY_CAPACITY};
use crate::model::{Compartment, Dose, DoseId, DoseOutcome, HistoryRecord, NewDose};
use crate::notify::{AlarmNotice, AlarmNotifier, LogNotifier};
use crate::protocol::{DeviceEvent, DoseReport, OutboundCommand, RemoteDoseSnapshot};
use crate::publisher::{CommandPublisher, PublishReceipt, QueuedCommand};
use crate::resync_span;
use crate::store::{DoseRepository, HistoryRepository, StoreError};
use crate::transport::{ConnectOrigin, SessionEvent, Transport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const EVENT_CAPACITY: usize = 256;

/// Timings and limits the engine works with
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Wait after connect before the clear-all, for subscriptions to settle
    pub post_connect_delay: Duration,
    /// Pause after the clear-all before the first dose
    pub clear_settle: Duration,
    /// Pause after every dose configuration in a resync
    pub dose_spacing: Duration,
    pub compartments: Compartment,
    pub history_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            post_connect_delay: Duration::from_secs(2),
            clear_settle: Duration::from_millis(500),
            dose_spacing: Duration::from_millis(300),
            compartments: 8,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl From<&DispenserConfig> for SyncSettings {
    fn from(config: &DispenserConfig) -> Self {
        Self {
            post_connect_delay: config.sync.post_connect_delay(),
            clear_settle: config.sync.clear_settle(),
            dose_spacing: config.sync.dose_spacing(),
            compartments: config.dispenser.compartments,
            history_capacity: config.history.capacity,
        }
    }
}

/// Result of applying a confirmation or omission
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationOutcome {
    pub record: HistoryRecord,
    /// The local dose that was retired; None is a reconciliation miss
    pub removed: Option<Dose>,
}

/// Result of applying an active-dose report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub removed: Vec<Dose>,
    /// The report's sequence number was not newer than the last one applied
    pub stale: bool,
}

/// Check a dose against the dispenser layout
pub fn validate_dose(
    compartments: Compartment,
    compartment: Compartment,
    medication: &str,
) -> SyncResult<()> {
    if compartment == 0 || compartment > compartments {
        return Err(SyncError::invalid_dose(format!(
            "compartment {compartment} outside 1..={compartments}"
        )));
    }
    if medication.trim().is_empty() {
        return Err(SyncError::invalid_dose("medication must not be empty"));
    }
    Ok(())
}

pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    publisher: CommandPublisher,
    doses: Arc<dyn DoseRepository>,
    history: HistoryLog,
    dispatcher: MessageDispatcher,
    notifier: Arc<dyn AlarmNotifier>,
    settings: SyncSettings,
    /// Serializes check-then-write sequences on the dose store
    mutation: Mutex<()>,
    resync: Mutex<ResyncTracker>,
    report_guard: Mutex<ReportSequenceGuard>,
    doses_tx: watch::Sender<Vec<Dose>>,
    sync_state_tx: watch::Sender<SyncState>,
    device_status_tx: watch::Sender<Option<String>>,
}

impl SyncEngine {
    /// Build an engine over one store implementing both repositories.
    /// Must be called from within a Tokio runtime.
    pub fn new<S>(transport: Arc<dyn Transport>, store: Arc<S>, settings: SyncSettings) -> Self
    where
        S: DoseRepository + HistoryRepository + 'static,
    {
        Self::with_repositories(
            transport,
            store.clone(),
            store,
            Arc::new(LogNotifier),
            settings,
        )
    }

    pub fn with_repositories(
        transport: Arc<dyn Transport>,
        doses: Arc<dyn DoseRepository>,
        history: Arc<dyn HistoryRepository>,
        notifier: Arc<dyn AlarmNotifier>,
        settings: SyncSettings,
    ) -> Self {
        let (doses_tx, _) = watch::channel(Vec::new());
        let (sync_state_tx, _) = watch::channel(SyncState::Unsynced);
        let (device_status_tx, _) = watch::channel(None);

        Self {
            publisher: CommandPublisher::new(transport.clone()),
            transport,
            doses,
            history: HistoryLog::new(history, settings.history_capacity),
            dispatcher: MessageDispatcher::new(),
            notifier,
            settings,
            mutation: Mutex::new(()),
            resync: Mutex::new(ResyncTracker::default()),
            report_guard: Mutex::new(ReportSequenceGuard::default()),
            doses_tx,
            sync_state_tx,
            device_status_tx,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlarmNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Load the signals from the store, attach to the transport's events and
    /// spawn the run loop
    pub async fn start(self: &Arc<Self>) -> SyncResult<JoinHandle<()>> {
        self.refresh_doses().await?;
        self.history.refresh().await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        self.transport.set_event_sender(events_tx).await;

        info!(
            compartments = self.settings.compartments,
            history_capacity = self.settings.history_capacity,
            "Sync engine started"
        );
        Ok(tokio::spawn(self.clone().run(events_rx)))
    }

    /// Handle session events in arrival order until the transport goes away
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_session_event(event).await;
        }
        debug!("Session event stream closed");
    }

    pub async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Connected { generation, origin } => {
                self.on_connected(generation, origin).await;
            }
            SessionEvent::Disconnected { reason } => {
                self.on_disconnected(&reason).await;
            }
            SessionEvent::Message { topic, payload } => {
                if let Err(e) = self.handle_message(&topic, &payload).await {
                    error!(%topic, error = %e, "Failed to apply device message");
                }
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, generation: u64, origin: ConnectOrigin) {
        let mut tracker = self.resync.lock().await;
        match tracker.decide(generation) {
            ResyncDecision::Duplicate => {
                debug!(generation, ?origin, "Resync already triggered for this link");
                return;
            }
            ResyncDecision::Supersede => {
                info!(generation, "Newer link supersedes the running resync");
            }
            ResyncDecision::Start => {}
        }

        tracker.claim(generation);
        self.sync_state_tx.send_replace(SyncState::Resyncing);
        info!(generation, ?origin, "Link up, scheduling full resync");
        let handle = tokio::spawn(self.clone().resync(generation));
        tracker.attach(handle);
    }

    async fn on_disconnected(&self, reason: &str) {
        if self.resync.lock().await.cancel() {
            info!("Resync cancelled by disconnect");
        }
        self.sync_state_tx.send_replace(SyncState::Unsynced);
        warn!(%reason, "Dispenser link down");
    }

    /// Clear the device, then push every local dose with throttling
    async fn resync(self: Arc<Self>, generation: u64) {
        let span = resync_span!(generation);
        async {
            if !self.settings.post_connect_delay.is_zero() {
                tokio::time::sleep(self.settings.post_connect_delay).await;
            }

            info!("Clearing device schedule");
            let cleared = self
                .publisher
                .send_spaced(vec![QueuedCommand::new(
                    OutboundCommand::ClearAll,
                    self.settings.clear_settle,
                )])
                .await;

            let doses = match self.doses.list_doses().await {
                Ok(doses) => doses,
                Err(e) => {
                    error!(error = %e, "Could not read local doses for resync");
                    self.finish_resync(generation, false).await;
                    return;
                }
            };

            let items: Vec<QueuedCommand> = doses
                .iter()
                .map(|dose| {
                    QueuedCommand::new(OutboundCommand::configure(dose), self.settings.dose_spacing)
                })
                .collect();
            let pushed = self.publisher.send_spaced(items).await;

            let complete = cleared.is_complete() && pushed.is_complete();
            info!(
                doses = doses.len(),
                published = pushed.published,
                dropped = cleared.dropped + pushed.dropped,
                "Resync finished"
            );
            self.finish_resync(generation, complete).await;
        }
        .instrument(span)
        .await
    }

    async fn finish_resync(&self, generation: u64, complete: bool) {
        let tracker = self.resync.lock().await;
        if !tracker.is_current(generation) {
            return;
        }
        let state = if complete && self.transport.is_connected() {
            SyncState::Synced
        } else {
            SyncState::Unsynced
        };
        self.sync_state_tx.send_replace(state);
    }

    /// Decode and apply one inbound message; undecodable messages are dropped
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> SyncResult<()> {
        match self.dispatcher.route(topic, payload) {
            Some(event) => self.apply_device_event(event).await,
            None => Ok(()),
        }
    }

    pub async fn apply_device_event(&self, event: DeviceEvent) -> SyncResult<()> {
        match event {
            DeviceEvent::DoseConfirmed(report) => {
                self.record_dose_outcome(report, DoseOutcome::Taken).await?;
            }
            DeviceEvent::DoseSkipped(report) => {
                self.record_dose_outcome(report, DoseOutcome::Skipped).await?;
            }
            DeviceEvent::ActiveDoseReport { snapshot, listed } => {
                self.reconcile_active_doses(&snapshot, listed).await?;
            }
            DeviceEvent::AlarmActive {
                medication,
                compartment,
                time_label,
            } => {
                self.notifier.alarm_active(&AlarmNotice {
                    medication,
                    compartment,
                    time_label,
                });
            }
            DeviceEvent::DeviceStatus(status) => {
                info!(%status, "Device status");
                self.device_status_tx.send_replace(Some(status));
            }
        }
        Ok(())
    }

    /// Append the outcome to history and retire the local dose the device used
    ///
    /// No deletion is published: the device already discarded the dose.
    pub async fn record_dose_outcome(
        &self,
        report: DoseReport,
        outcome: DoseOutcome,
    ) -> SyncResult<ConfirmationOutcome> {
        let _guard = self.mutation.lock().await;
        let compartment = report.compartment;
        let record = self.history.append(report.into_history_entry(outcome)).await?;

        let removed = match self.doses.get_dose_by_compartment(compartment).await? {
            Some(dose) => {
                self.doses.delete_dose(dose.id).await?;
                self.refresh_doses().await?;
                info!(
                    dose_id = dose.id,
                    compartment,
                    %outcome,
                    "Dose retired after device report"
                );
                Some(dose)
            }
            None => {
                warn!(compartment, %outcome, "No local dose for reported compartment");
                None
            }
        };

        Ok(ConfirmationOutcome { record, removed })
    }

    /// Drop every local dose the device no longer reports as active
    pub async fn reconcile_active_doses(
        &self,
        snapshot: &RemoteDoseSnapshot,
        listed: usize,
    ) -> SyncResult<ReconcileOutcome> {
        let _guard = self.mutation.lock().await;

        if !self.report_guard.lock().await.accept(snapshot.sequence) {
            warn!(seq = ?snapshot.sequence, "Discarding stale active-dose report");
            return Ok(ReconcileOutcome {
                removed: Vec::new(),
                stale: true,
            });
        }

        if snapshot.total_mismatch(listed) {
            warn!(
                declared = snapshot.declared_total,
                listed, "Active-dose report total disagrees with its list"
            );
        }

        let mut removed = Vec::new();
        for dose in self.doses.list_doses().await? {
            if !snapshot.contains(dose.compartment) {
                self.doses.delete_dose(dose.id).await?;
                removed.push(dose);
            }
        }

        if !removed.is_empty() {
            self.refresh_doses().await?;
        }
        info!(
            reported = snapshot.compartments.len(),
            removed = removed.len(),
            "Reconciled with device report"
        );
        Ok(ReconcileOutcome {
            removed,
            stale: false,
        })
    }

    fn validate(&self, compartment: Compartment, medication: &str) -> SyncResult<()> {
        validate_dose(self.settings.compartments, compartment, medication)
    }

    /// Persist a new dose and push it to the device
    pub async fn add_dose(&self, dose: NewDose) -> SyncResult<Dose> {
        self.validate(dose.compartment, &dose.medication)?;
        let _guard = self.mutation.lock().await;

        if self
            .doses
            .get_dose_by_compartment(dose.compartment)
            .await?
            .is_some()
        {
            return Err(SyncError::CompartmentOccupied {
                compartment: dose.compartment,
            });
        }

        let dose = self.doses.insert_dose(dose).await?;
        self.refresh_doses().await?;
        info!(
            dose_id = dose.id,
            compartment = dose.compartment,
            time = %dose.time,
            "Dose added"
        );
        self.publisher.send(OutboundCommand::configure(&dose));
        Ok(dose)
    }

    /// Persist changes to an existing dose and republish it
    ///
    /// Updates skip the occupancy check, so moving a dose into a compartment
    /// that already holds another one stores both.
    pub async fn update_dose(&self, dose: Dose) -> SyncResult<Dose> {
        self.validate(dose.compartment, &dose.medication)?;
        let _guard = self.mutation.lock().await;

        match self.doses.update_dose(&dose).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(SyncError::DoseNotFound { id: dose.id }),
            Err(e) => return Err(e.into()),
        }
        self.refresh_doses().await?;
        info!(dose_id = dose.id, compartment = dose.compartment, "Dose updated");
        self.publisher.send(OutboundCommand::configure(&dose));
        Ok(dose)
    }

    /// Remove a dose locally and tell the device to drop its compartment
    pub async fn delete_dose(&self, id: DoseId) -> SyncResult<Dose> {
        let _guard = self.mutation.lock().await;

        let dose = self
            .doses
            .get_dose(id)
            .await?
            .ok_or(SyncError::DoseNotFound { id })?;
        self.doses.delete_dose(id).await?;
        self.refresh_doses().await?;
        info!(dose_id = id, compartment = dose.compartment, "Dose deleted");
        self.publisher.send(OutboundCommand::DeleteDose {
            compartment: dose.compartment,
        });
        Ok(dose)
    }

    pub async fn list_doses(&self) -> SyncResult<Vec<Dose>> {
        Ok(self.doses.list_doses().await?)
    }

    pub async fn history(&self) -> SyncResult<Vec<HistoryRecord>> {
        Ok(self.history.list().await?)
    }

    /// History recorded at or after `start`, newest first
    pub async fn history_since(&self, start: DateTime<Utc>) -> SyncResult<Vec<HistoryRecord>> {
        Ok(self.history.since(start).await?)
    }

    pub async fn clear_history(&self) -> SyncResult<()> {
        Ok(self.history.clear().await?)
    }

    /// Set the device clock to the current local time
    pub fn set_clock(&self) -> PublishReceipt {
        self.publisher.send(OutboundCommand::set_clock_now())
    }

    pub fn stop_alarm(&self) -> PublishReceipt {
        self.publisher.send(OutboundCommand::StopAlarm)
    }

    pub fn test_led(&self, on: bool) -> PublishReceipt {
        self.publisher.send(OutboundCommand::TestLed(on))
    }

    pub fn test_buzzer(&self, on: bool) -> PublishReceipt {
        self.publisher.send(OutboundCommand::TestBuzzer(on))
    }

    /// Ask the device to report its active doses
    pub fn request_active_doses(&self) -> PublishReceipt {
        self.publisher.send(OutboundCommand::RequestActiveDoses)
    }

    /// Clear the device schedule; the local schedule is untouched
    pub fn clear_remote_doses(&self) -> PublishReceipt {
        self.publisher.send(OutboundCommand::ClearAll)
    }

    pub fn publisher(&self) -> &CommandPublisher {
        &self.publisher
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn sync_state(&self) -> SyncState {
        *self.sync_state_tx.borrow()
    }

    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync_state_tx.subscribe()
    }

    pub fn subscribe_doses(&self) -> watch::Receiver<Vec<Dose>> {
        self.doses_tx.subscribe()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<Vec<HistoryRecord>> {
        self.history.subscribe()
    }

    pub fn subscribe_device_status(&self) -> watch::Receiver<Option<String>> {
        self.device_status_tx.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.transport.connection_state()
    }

    async fn refresh_doses(&self) -> SyncResult<()> {
        let doses = self.doses.list_doses().await?;
        self.doses_tx.send_replace(doses);
        Ok(())
    }
}
