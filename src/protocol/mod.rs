//! Wire codec for the dispenser protocol
//!
//! Topic table, inbound payload schemas and outbound command encoding.

pub mod commands;
pub mod messages;
pub mod topics;

pub use commands::*;
pub use messages::*;
pub use topics::*;
