pub mod bus;
pub mod message;

pub use bus::{FnHandler, MessageBus, MessageHandler, WeakMessageBus};
pub use message::{
    ErrorReport, GenerationComplete, IndexingComplete, IngestionComplete, IngestionRequest,
    Message, MessageKind, Payload, RetrievalRequest, RetrievalResult, Source, TraceId,
};
