//! Testing utilities and mock implementations
//!
//! Mock channel and store implementations for exercising the command and
//! telemetry paths without an MQTT broker or a real document store.

pub mod mocks;

pub use mocks::*;
