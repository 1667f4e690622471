//! Observability for the dispenser daemon
//!
//! Structured logging and the span macros used around sessions and resyncs.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
