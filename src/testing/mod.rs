//! Testing utilities and mock implementations
//!
//! Lets the engine, publisher and supervisor run without a broker.

pub mod mocks;

pub use mocks::*;
