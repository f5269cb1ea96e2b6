//! Caller-facing facade over the bus, coordinator and stage agents

pub mod builder;

pub use builder::PipelineBuilder;

use std::sync::Arc;
use std::time::Duration;

use crate::agents::{GenerationAgent, IngestionAgent, RetrievalAgent};
use crate::coord::{Coordinator, RequestRecord, SystemStats};
use crate::core::config::PipelineConfig;
use crate::core::errors::Result;
use crate::pubsub::{Message, MessageBus, TraceId};

/// A running document Q&A pipeline.
///
/// Submissions return a trace immediately; the work happens on the bus
/// mailboxes. Use [`poll`](Self::poll) or [`wait`](Self::wait) to observe it.
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) bus: MessageBus,
    pub(crate) coordinator: Coordinator,
    pub(crate) ingestion: Arc<IngestionAgent>,
    pub(crate) retrieval: Arc<RetrievalAgent>,
    pub(crate) generation: Arc<GenerationAgent>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn submit_document(
        &self,
        filename: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> TraceId {
        self.coordinator.start_document_workflow(filename, content)
    }

    /// Starts a query; `None` uses the configured default `top_k`
    pub fn submit_query(&self, query: impl Into<String>, top_k: Option<usize>) -> TraceId {
        let top_k = top_k.unwrap_or(self.config.retrieval.default_top_k);
        self.coordinator.start_query_workflow(query, top_k)
    }

    pub fn poll(&self, trace: &TraceId) -> Option<RequestRecord> {
        self.coordinator.poll(trace)
    }

    pub async fn wait(&self, trace: &TraceId, timeout: Duration) -> Result<RequestRecord> {
        self.coordinator.wait(trace, timeout).await
    }

    /// [`wait`](Self::wait) with the configured default timeout
    pub async fn wait_default(&self, trace: &TraceId) -> Result<RequestRecord> {
        self.coordinator
            .wait(trace, self.config.coordinator.default_wait_timeout())
            .await
    }

    pub fn stats(&self) -> SystemStats {
        self.coordinator.stats()
    }

    pub fn clear(&self) {
        self.coordinator.clear()
    }

    pub fn history(&self, trace: Option<&TraceId>) -> Vec<Message> {
        self.bus.history(trace)
    }

    pub fn trace_dot(&self, trace: &TraceId) -> String {
        self.bus.trace_dot(trace)
    }

    /// Stops every mailbox after it drains
    pub async fn shutdown(&self) {
        self.bus.shutdown().await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn ingestion(&self) -> &IngestionAgent {
        &self.ingestion
    }

    pub fn retrieval(&self) -> &RetrievalAgent {
        &self.retrieval
    }

    pub fn generation(&self) -> &GenerationAgent {
        &self.generation
    }
}
