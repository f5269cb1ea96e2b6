// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod telemetry;
}

pub mod agents; // Stage agents and the handler adapter
pub mod collab; // Parser, vector index and answer generator
pub mod coord; // Workflow coordinator
pub mod pipeline; // Caller-facing facade
pub mod pubsub; // Message bus

// Re-exports for convenience
pub use core::config::PipelineConfig;
pub use core::errors::{RagError, Result, StageError};
pub use core::telemetry::init_tracing;

pub use coord::{
    Coordinator, RequestRecord, RequestStatus, ResultDetail, SystemStats, WorkflowKind,
    WorkflowResult,
};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use pubsub::{Message, MessageBus, MessageHandler, MessageKind, Payload, TraceId};
