use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::agents::{GenerationAgent, IngestionAgent, RetrievalAgent, StageHandler};
use crate::collab::{
    AnswerGenerator, ChatCompletionGenerator, DocumentParser, InMemoryVectorIndex,
    TemplateGenerator, TextChunker, TextDocumentParser, VectorIndex,
};
use crate::coord::Coordinator;
use crate::core::config::PipelineConfig;
use crate::core::errors::Result;
use crate::pipeline::Pipeline;
use crate::pubsub::MessageBus;

/// Builder for a wired [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    parser: Option<Arc<dyn DocumentParser>>,
    index: Option<Arc<dyn VectorIndex>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
}

impl PipelineBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the parser used by the ingestion stage
    pub fn with_parser(mut self, parser: Arc<dyn DocumentParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Set the vector index used by the retrieval stage
    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the answer generator used by the generation stage
    pub fn with_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set chunk size and overlap for the default parser
    pub fn chunking(mut self, chunk_size: usize, overlap: usize) -> Self {
        self.config.chunking.chunk_size = chunk_size;
        self.config.chunking.overlap = overlap;
        self
    }

    /// Set the `top_k` used when a query does not give one
    pub fn default_top_k(mut self, top_k: usize) -> Self {
        self.config.retrieval.default_top_k = top_k;
        self
    }

    /// Set the timeout used by [`Pipeline::wait_default`].
    ///
    /// The configuration holds whole seconds, so the value is rounded up:
    /// 200ms becomes 1s and 1500ms becomes 2s.
    pub fn default_wait_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.config.coordinator.default_wait_timeout_secs = secs.max(1);
        self
    }

    /// Validate the configuration, subscribe every component and return the
    /// pipeline. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = self.config;

        let parser: Arc<dyn DocumentParser> = match self.parser {
            Some(parser) => parser,
            None => Arc::new(TextDocumentParser::new(TextChunker::new(&config.chunking))),
        };
        let index: Arc<dyn VectorIndex> = match self.index {
            Some(index) => index,
            None => Arc::new(InMemoryVectorIndex::new(
                config.retrieval.embedding_dimension,
            )),
        };
        let generator: Arc<dyn AnswerGenerator> = match self.generator {
            Some(generator) => generator,
            None if config.generation.enabled => {
                match ChatCompletionGenerator::new(config.generation.clone()) {
                    Ok(generator) => Arc::new(generator),
                    Err(e) => {
                        warn!(error = %e, "Chat completion unavailable, using template answers");
                        Arc::new(TemplateGenerator)
                    }
                }
            }
            None => Arc::new(TemplateGenerator),
        };

        let bus = MessageBus::new();
        let coordinator = Coordinator::attach(bus.clone())?;

        let ingestion = Arc::new(IngestionAgent::new(parser));
        let retrieval = Arc::new(RetrievalAgent::new(index, config.retrieval.min_score));
        let generation = Arc::new(GenerationAgent::new(generator));
        StageHandler::register(ingestion.clone(), &bus)?;
        StageHandler::register(retrieval.clone(), &bus)?;
        StageHandler::register(generation.clone(), &bus)?;

        info!(
            receivers = ?bus.receivers(),
            model = %generation.model_info().model,
            "Pipeline ready"
        );

        Ok(Pipeline {
            config,
            bus,
            coordinator,
            ingestion,
            retrieval,
            generation,
        })
    }
}
