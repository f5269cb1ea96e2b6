//! Workflow coordination: request records and the coordinator state machine

pub mod coordinator;
pub mod types;

pub use coordinator::Coordinator;
pub use types::*;
