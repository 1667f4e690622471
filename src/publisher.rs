//! Outbound command queue
//!
//! All commands for the device go through one queue drained by a single
//! consumer task. A batch is published in order and each item carries the
//! pause to observe after it, so the resync push can be throttled without
//! holding up anything queued behind a standalone command.

use crate::protocol::OutboundCommand;
use crate::transport::Transport;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One queued command and the pause that follows it
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub command: OutboundCommand,
    pub pause_after: Duration,
}

impl QueuedCommand {
    pub fn new(command: OutboundCommand, pause_after: Duration) -> Self {
        Self {
            command,
            pause_after,
        }
    }

    pub fn immediate(command: OutboundCommand) -> Self {
        Self::new(command, Duration::ZERO)
    }
}

/// Outcome of one batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub published: usize,
    /// Not connected, or the payload failed to encode
    pub dropped: usize,
    /// The requester went away before the batch finished
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.dropped == 0 && !self.cancelled
    }
}

/// Resolves once a standalone command has been handled
///
/// Dropping the receipt does not cancel the command.
#[derive(Debug)]
pub struct PublishReceipt(oneshot::Receiver<BatchReport>);

impl PublishReceipt {
    pub async fn wait(self) -> BatchReport {
        self.0.await.unwrap_or(BatchReport {
            cancelled: true,
            ..BatchReport::default()
        })
    }

    /// True if the command went out
    pub async fn published(self) -> bool {
        self.wait().await.published > 0
    }
}

struct Batch {
    items: Vec<QueuedCommand>,
    done: oneshot::Sender<BatchReport>,
    /// Skip the rest of the batch once `done` has no receiver
    cancellable: bool,
}

/// Handle to the outbound queue
pub struct CommandPublisher {
    queue: mpsc::UnboundedSender<Batch>,
    consumer: JoinHandle<()>,
}

impl CommandPublisher {
    /// Spawn the consumer task. Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (queue, batches) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(drain(transport, batches));
        Self { queue, consumer }
    }

    /// Queue a standalone command with no pause after it
    pub fn send(&self, command: OutboundCommand) -> PublishReceipt {
        self.enqueue(vec![QueuedCommand::immediate(command)], false)
    }

    /// Queue a batch and wait for it; dropping the future cancels what is left
    pub async fn send_spaced(&self, items: Vec<QueuedCommand>) -> BatchReport {
        self.enqueue(items, true).wait().await
    }

    /// Wait until everything queued before this call has been handled
    pub async fn flush(&self) {
        self.enqueue(Vec::new(), false).wait().await;
    }

    fn enqueue(&self, items: Vec<QueuedCommand>, cancellable: bool) -> PublishReceipt {
        let (done, receipt) = oneshot::channel();
        let batch = Batch {
            items,
            done,
            cancellable,
        };
        if self.queue.send(batch).is_err() {
            error!("Command queue consumer is gone, batch discarded");
        }
        PublishReceipt(receipt)
    }
}

impl Drop for CommandPublisher {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

async fn drain(transport: Arc<dyn Transport>, mut batches: mpsc::UnboundedReceiver<Batch>) {
    while let Some(batch) = batches.recv().await {
        let Batch {
            items,
            mut done,
            cancellable,
        } = batch;
        let mut report = BatchReport::default();

        for item in items {
            if cancellable && done.is_closed() {
                report.cancelled = true;
                break;
            }

            let topic = item.command.topic().path();
            match item.command.encode() {
                Ok(payload) => match transport.publish(topic, payload, QoS::AtLeastOnce).await {
                    Ok(()) => {
                        report.published += 1;
                        debug!(topic, "Command published");
                    }
                    Err(e) => {
                        report.dropped += 1;
                        warn!(topic, error = %e, "Command dropped");
                    }
                },
                Err(e) => {
                    report.dropped += 1;
                    error!(topic, error = %e, "Command payload failed to encode");
                }
            }

            if !item.pause_after.is_zero() {
                if cancellable {
                    tokio::select! {
                        _ = tokio::time::sleep(item.pause_after) => {}
                        _ = done.closed() => {}
                    }
                } else {
                    tokio::time::sleep(item.pause_after).await;
                }
            }
        }

        let _ = done.send(report);
    }
    debug!("Command queue closed");
}
