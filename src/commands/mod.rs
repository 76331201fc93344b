//! Vehicle command dispatch
//!
//! Dispatches lock/unlock commands over the broker channel, correlates
//! firmware acknowledgements and degrades unconfirmed commands to the
//! retained pending topic.

pub mod dispatcher;

pub use dispatcher::{CommandDispatcher, CommandError, CommandOutcome};
