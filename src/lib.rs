//! Dispenser Sync - Rust Implementation
//!
//! Session management and dose synchronization for an MQTT medication
//! dispenser.
//!
//! # Overview
//!
//! The application and the dispenser each own a copy of the dose schedule.
//! This crate keeps them consistent over an unreliable broker link:
//! - MQTT v3.1.1 session with explicit connect and a connectivity poll
//! - Wire codec for the fixed set of dispenser topics
//! - Sync engine that resyncs the device once per physical reconnect
//! - Bounded dispensing history fed by device confirmations
//! - Connection supervisor with fixed backoff and clock sync
//!
//! # Quick Start
//!
//! ```rust
//! use dispenser_sync::model::NewDose;
//! use dispenser_sync::protocol::OutboundCommand;
//! use dispenser_sync::store::LocalStore;
//! use dispenser_sync::sync::{SyncEngine, SyncSettings};
//! use dispenser_sync::testing::MockTransport;
//! use dispenser_sync::transport::Transport;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MockTransport::new());
//! let engine = Arc::new(SyncEngine::new(
//!     transport.clone(),
//!     Arc::new(LocalStore::in_memory()),
//!     SyncSettings::default(),
//! ));
//! engine.start().await?;
//! transport.connect().await?;
//!
//! let dose = engine
//!     .add_dose(NewDose::new("07:30".parse()?, 1, "Ibuprofen"))
//!     .await?;
//! assert_eq!(
//!     OutboundCommand::configure(&dose).topic().path(),
//!     "config/dose"
//! );
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod publisher;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod testing;
pub mod transport;

// Re-export commonly used types
pub use config::DispenserConfig;
pub use error::{SyncError, SyncResult};
pub use model::{Dose, DoseOutcome, DoseTime, HistoryRecord, NewDose};
pub use supervisor::{ConnectionSupervisor, SupervisorExit, SupervisorSettings};
pub use sync::{SyncEngine, SyncSettings, SyncState};
pub use transport::mqtt::MqttSession;
pub use transport::{SessionEvent, Transport};
