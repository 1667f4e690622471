//! MQTT v3.1.1 session for the dispenser link
//!
//! The module is split into focused sub-modules:
//!
//! - [`connection`] - Option construction, retry timing and the ConnAck wait
//! - [`message_handler`] - Pure routing of rumqttc events and event forwarding
//! - [`link_monitor`] - Shared link flags and the periodic connectivity poll
//! - [`session`] - The worker task, the event driver and the public handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use dispenser_sync::config::BrokerSection;
//! use dispenser_sync::transport::mqtt::{MqttSession, ReconnectConfig};
//! use dispenser_sync::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let broker = BrokerSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     ..BrokerSection::default()
//! };
//!
//! let session = MqttSession::new(broker, ReconnectConfig::default())?;
//! let outcome = session.connect().await?;
//! println!("link generation {}", outcome.generation);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod link_monitor;
pub mod message_handler;
pub mod session;

pub use connection::{LinkStatus, ReconnectConfig, SessionError};
pub use link_monitor::{LinkCheck, LinkMonitor, LinkState, ReconnectionDecision};
pub use message_handler::{EventForwarder, EventRoute, MessageHandler};
pub use session::{MqttSession, SessionCommand};
