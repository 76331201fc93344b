//! Wire message types and topic scheme for the tracker protocol
//!
//! This module implements the JSON payloads and topic layout shared by
//! the app, the tracker devices and the supporting tooling.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
