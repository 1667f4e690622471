//! The MQTT session: one worker task, one event driver, one connectivity poll
//!
//! Every network-affecting operation (connect, subscribe, publish,
//! disconnect) is a [`SessionCommand`] processed in order by a single worker
//! task. The worker owns the rumqttc client. The event driver polls the
//! rumqttc event loop and keeps polling after a loss, so the library
//! reconnects on its own; the poll in [`super::link_monitor`] turns those
//! silent reconnects into session events.

use super::connection::{
    configure_mqtt_options, wait_for_connection_confirmation, LinkStatus, ReconnectConfig,
    SessionError,
};
use super::link_monitor::{run_link_monitor, LinkState};
use super::message_handler::{EventForwarder, EventRoute, MessageHandler};
use crate::config::{BrokerSection, DispenserConfig};
use crate::protocol::INBOUND_TOPICS;
use crate::session_span;
use crate::transport::{ConnectOrigin, ConnectOutcome, SessionEvent, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 32;
const COMMAND_CAPACITY: usize = 64;
/// How long a disconnect waits for the driver to flush the DISCONNECT packet
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests processed by the session worker
#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        reply: Reply<ConnectOutcome>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        reply: Reply<()>,
    },
    /// Raised by the connectivity poll when the library reconnected by itself
    LinkRestored {
        generation: u64,
    },
    Disconnect {
        reply: Reply<()>,
    },
}

/// Handle to a running session
///
/// Dropping the handle stops the connectivity poll; the worker then drains
/// and releases the connection.
pub struct MqttSession {
    commands: mpsc::Sender<SessionCommand>,
    link: Arc<LinkState>,
    events: EventForwarder,
    monitor: JoinHandle<()>,
}

impl MqttSession {
    /// Start the worker and the connectivity poll. Must be called from within
    /// a Tokio runtime. No network traffic happens until `connect()`.
    pub fn new(config: BrokerSection, reconnect: ReconnectConfig) -> Result<Self, SessionError> {
        // Fail fast on a bad broker URL rather than at the first connect
        configure_mqtt_options(&config)?;

        let link = Arc::new(LinkState::new());
        let events = EventForwarder::new();
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let poll_interval = config.poll_interval();
        let span = session_span!(config.client_id);

        let worker = SessionWorker {
            config,
            reconnect,
            link: link.clone(),
            events: events.clone(),
            connection: None,
        };
        tokio::spawn(worker.run(command_rx).instrument(span.clone()));

        let monitor = tokio::spawn(
            run_link_monitor(link.clone(), commands.clone(), events.clone(), poll_interval)
                .instrument(span),
        );

        Ok(Self {
            commands,
            link,
            events,
            monitor,
        })
    }

    pub fn from_config(config: &DispenserConfig) -> Result<Self, SessionError> {
        Self::new(config.broker.clone(), ReconnectConfig::from(&config.retry))
    }

    /// Number of ConnAcks seen so far
    pub fn generation(&self) -> u64 {
        self.link.generation()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::WorkerGone)?;
        response.await.map_err(|_| SessionError::WorkerGone)?
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

#[async_trait]
impl Transport for MqttSession {
    async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        self.request(|reply| SessionCommand::Connect { reply }).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        let topic = topic.to_string();
        self.request(|reply| SessionCommand::Publish {
            topic,
            payload,
            qos,
            reply,
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Disconnect { reply })
            .await
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    async fn set_event_sender(&self, sender: mpsc::Sender<SessionEvent>) {
        self.events.set_sender(sender).await;
    }
}

struct ActiveConnection {
    client: AsyncClient,
    driver: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActiveConnection {
    fn abort(self) {
        self.shutdown_tx.send_replace(true);
        self.driver.abort();
    }
}

struct SessionWorker {
    config: BrokerSection,
    reconnect: ReconnectConfig,
    link: Arc<LinkState>,
    events: EventForwarder,
    connection: Option<ActiveConnection>,
}

impl SessionWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        debug!("Session worker started");
        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Connect { reply } => {
                    let _ = reply.send(self.connect().await);
                }
                SessionCommand::Publish {
                    topic,
                    payload,
                    qos,
                    reply,
                } => {
                    let _ = reply.send(self.publish(&topic, payload, qos));
                }
                SessionCommand::LinkRestored { generation } => {
                    self.restore(generation).await;
                }
                SessionCommand::Disconnect { reply } => {
                    let _ = reply.send(self.disconnect().await);
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        self.link.mark_down();
        self.link.set_connected(false);
        debug!("Session worker stopped");
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, SessionError> {
        if self.connection.is_some() && self.link.is_up() {
            let generation = self.link.generation();
            // The library may have reconnected before the poll noticed
            if self.link.set_connected(true) {
                self.subscribe_inbound().await;
                self.events
                    .forward(SessionEvent::Connected {
                        generation,
                        origin: ConnectOrigin::Explicit,
                    })
                    .await;
            }
            debug!(generation, "Already connected, no network connect issued");
            return Ok(ConnectOutcome {
                generation,
                already_connected: true,
            });
        }

        if let Some(stale) = self.connection.take() {
            debug!("Releasing stale connection before reconnecting");
            stale.abort();
        }

        let options = configure_mqtt_options(&self.config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.link.set_connecting(true);
        let driver = EventDriver {
            link: self.link.clone(),
            events: self.events.clone(),
            status_tx,
            reconnect: self.reconnect.clone(),
            shutdown_rx,
        };
        let driver = tokio::spawn(driver.run(event_loop).in_current_span());

        info!(broker = %self.config.broker_url, "Connecting to broker");
        let timeout = self.config.connection_timeout();
        let generation = match wait_for_connection_confirmation(status_rx, timeout).await {
            Ok(generation) => generation,
            Err(e) => {
                self.link.set_connecting(false);
                driver.abort();
                self.link.mark_down();
                warn!(error = %e, "Connect attempt failed");
                return Err(e);
            }
        };

        self.connection = Some(ActiveConnection {
            client,
            driver,
            shutdown_tx,
        });
        self.subscribe_inbound().await;
        self.link.set_connected(true);
        self.link.set_connecting(false);

        info!(generation, "Connected to broker");
        self.events
            .forward(SessionEvent::Connected {
                generation,
                origin: ConnectOrigin::Explicit,
            })
            .await;

        Ok(ConnectOutcome {
            generation,
            already_connected: false,
        })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        match &self.connection {
            Some(connection) if self.link.is_connected() => {
                connection.client.try_publish(topic, qos, false, payload)?;
                debug!(topic, "Publish queued");
                Ok(())
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn restore(&mut self, generation: u64) {
        if self.connection.is_none() || !self.link.is_up() {
            return;
        }
        if !self.link.set_connected(true) {
            return;
        }
        self.subscribe_inbound().await;
        info!(generation, "Session restored after autonomous reconnect");
        self.events
            .forward(SessionEvent::Connected {
                generation: self.link.generation(),
                origin: ConnectOrigin::AutoReconnect,
            })
            .await;
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let result = match self.connection.take() {
            Some(mut connection) => {
                let requested = connection.client.try_disconnect().map_err(SessionError::from);
                if !self.link.is_up() {
                    connection.shutdown_tx.send_replace(true);
                }
                let stopped = tokio::time::timeout(DISCONNECT_GRACE, &mut connection.driver)
                    .await
                    .is_ok();
                if !stopped {
                    warn!("Event driver did not stop in time, aborting");
                    connection.abort();
                }
                requested
            }
            None => Ok(()),
        };

        self.link.mark_down();
        if self.link.set_connected(false) {
            self.events
                .forward(SessionEvent::Disconnected {
                    reason: "client disconnect".to_string(),
                })
                .await;
        }
        info!("Disconnected from broker");
        result
    }

    async fn subscribe_inbound(&self) {
        let Some(connection) = &self.connection else {
            return;
        };
        for topic in INBOUND_TOPICS {
            match connection
                .client
                .subscribe(topic.path(), QoS::AtLeastOnce)
                .await
            {
                Ok(()) => debug!(topic = topic.path(), "Subscribed"),
                Err(e) => warn!(topic = topic.path(), error = %e, "Subscribe failed"),
            }
        }
    }
}

/// Polls one rumqttc event loop until shutdown
struct EventDriver {
    link: Arc<LinkState>,
    events: EventForwarder,
    status_tx: watch::Sender<LinkStatus>,
    reconnect: ReconnectConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventDriver {
    async fn run(mut self, mut event_loop: EventLoop) {
        let mut failures = 0u32;

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                polled = event_loop.poll() => match polled {
                    Ok(event) => match MessageHandler::route_event(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            failures = 0;
                            let generation = self.link.mark_up();
                            self.status_tx.send_replace(LinkStatus::Up(generation));
                            debug!(generation, "ConnAck received");
                        }
                        EventRoute::ConnectionRefused(code) => {
                            self.link_lost(format!("connection refused: {code}")).await;
                            failures += 1;
                            if !self.backoff(failures).await {
                                break;
                            }
                        }
                        EventRoute::MessageReceived { topic, payload, retain } => {
                            if MessageHandler::should_forward(&topic, retain) {
                                self.events
                                    .forward(SessionEvent::Message { topic, payload })
                                    .await;
                            }
                        }
                        EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                            if rejected > 0 {
                                warn!(packet_id, rejected, "Broker rejected subscriptions");
                            } else {
                                debug!(packet_id, "Subscription confirmed");
                            }
                        }
                        EventRoute::Disconnected => {
                            self.link_lost("broker closed the session".to_string()).await;
                        }
                        EventRoute::DisconnectSent => {
                            self.link.mark_down();
                            break;
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            debug!(target: "mqtt_transport", %event, "MQTT event");
                        }
                        EventRoute::OutgoingEvent => {}
                    },
                    Err(e) => {
                        self.link_lost(e.to_string()).await;
                        failures += 1;
                        if !self.backoff(failures).await {
                            break;
                        }
                    }
                }
            }
        }

        debug!("Event driver stopped");
    }

    /// Loss callback: flip the connected signal once and report it
    async fn link_lost(&self, reason: String) {
        self.link.mark_down();
        self.status_tx.send_replace(LinkStatus::Failed(reason.clone()));
        if self.link.set_connected(false) {
            warn!(%reason, "Connection lost");
            self.events
                .forward(SessionEvent::Disconnected { reason })
                .await;
        } else {
            debug!(%reason, "Event loop error while disconnected");
        }
    }

    /// Sleep before the next poll; false when shutdown was requested meanwhile
    async fn backoff(&mut self, failures: u32) -> bool {
        let delay_ms = self.reconnect.calculate_backoff_delay(failures);
        debug!(attempt = failures, delay_ms, "Waiting before the next reconnect attempt");
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                !(changed.is_err() || *self.shutdown_rx.borrow())
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}
