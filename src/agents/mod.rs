//! Pipeline stages. Each agent consumes one message kind (or a few) and
//! publishes exactly one follow-up under the same trace.

pub mod generation;
pub mod ingestion;
pub mod retrieval;
pub mod stage;

pub use generation::{GenerationAgent, NO_CONTEXT_ANSWER};
pub use ingestion::{DocumentInfo, IngestionAgent};
pub use retrieval::{RetrievalAgent, RetrievalStats, NO_DOCUMENTS_NOTE, NO_SEARCH_TERMS_NOTE};
pub use stage::{StageAgent, StageHandler};

/// Receiver names on the bus
pub mod names {
    pub const COORDINATOR: &str = "coordinator";
    pub const INGESTION: &str = "ingestion";
    pub const RETRIEVAL: &str = "retrieval";
    pub const GENERATION: &str = "generation";
}
