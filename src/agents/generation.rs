use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agents::names::{COORDINATOR, GENERATION};
use crate::agents::stage::StageAgent;
use crate::collab::{AnswerGenerator, ModelInfo, TemplateGenerator};
use crate::core::errors::StageError;
use crate::pubsub::{GenerationComplete, Message, MessageKind, Payload, Source};

pub const NO_CONTEXT_ANSWER: &str = "I couldn't find relevant information in the uploaded \
documents to answer your question. Please make sure you've uploaded documents that contain \
information related to your query.";

/// Turns retrieved context into the final answer for the coordinator.
///
/// When the configured generator fails, the answer is rebuilt from the
/// context with [`TemplateGenerator`] so a query with context always gets
/// an answer.
pub struct GenerationAgent {
    generator: Arc<dyn AnswerGenerator>,
    fallback: TemplateGenerator,
}

impl GenerationAgent {
    pub fn new(generator: Arc<dyn AnswerGenerator>) -> Self {
        Self {
            generator,
            fallback: TemplateGenerator,
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        self.generator.model_info()
    }
}

fn round_score(score: f32) -> f32 {
    (score * 1000.0).round() / 1000.0
}

#[async_trait]
impl StageAgent for GenerationAgent {
    fn name(&self) -> &'static str {
        GENERATION
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::RetrievalResult]
    }

    async fn process(&self, message: &Message) -> Result<Message, StageError> {
        let Payload::RetrievalResult(retrieved) = message.payload() else {
            return Err(StageError::protocol(format!(
                "generation cannot handle {}",
                message.kind()
            )));
        };

        let completed = if retrieved.context.is_empty() {
            GenerationComplete {
                query: retrieved.query.clone(),
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                context_used: false,
            }
        } else {
            let answer = match self
                .generator
                .generate(&retrieved.query, &retrieved.context)
                .await
            {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(
                        trace = %message.trace(),
                        error = %e,
                        "Generator failed, using template answer"
                    );
                    self.fallback
                        .generate(&retrieved.query, &retrieved.context)
                        .await?
                }
            };
            GenerationComplete {
                query: retrieved.query.clone(),
                answer,
                sources: retrieved
                    .sources
                    .iter()
                    .map(|source| Source {
                        similarity_score: round_score(source.similarity_score),
                        ..source.clone()
                    })
                    .collect(),
                context_used: true,
            }
        };

        info!(
            trace = %message.trace(),
            context_used = completed.context_used,
            sources = completed.sources.len(),
            "Answer generated"
        );
        Ok(message.follow_up(
            GENERATION,
            COORDINATOR,
            Payload::GenerationComplete(completed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::names::RETRIEVAL;
    use crate::pubsub::{RetrievalResult, TraceId};
    use pretty_assertions::assert_eq;

    struct BrokenGenerator;

    #[async_trait]
    impl AnswerGenerator for BrokenGenerator {
        async fn generate(&self, _query: &str, _context: &[String]) -> Result<String, StageError> {
            Err(StageError::generation("upstream returned status 503"))
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                model: "broken".to_string(),
                provider: "Test".to_string(),
                api_key_configured: true,
                status: "active".to_string(),
            }
        }
    }

    fn retrieved(context: &[&str]) -> Message {
        Message::new(
            RETRIEVAL,
            GENERATION,
            TraceId::from("gen-trace"),
            Payload::RetrievalResult(RetrievalResult {
                query: "What is X?".to_string(),
                context: context.iter().map(|c| c.to_string()).collect(),
                sources: context
                    .iter()
                    .enumerate()
                    .map(|(i, _)| Source {
                        filename: "notes.txt".to_string(),
                        chunk_index: i,
                        similarity_score: 0.123456,
                        file_type: "txt".to_string(),
                    })
                    .collect(),
                note: None,
            }),
        )
    }

    fn completed(reply: &Message) -> &GenerationComplete {
        match reply.payload() {
            Payload::GenerationComplete(done) => done,
            other => panic!("expected generation-complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_context_gives_fixed_answer() {
        let agent = GenerationAgent::new(Arc::new(TemplateGenerator));
        let reply = agent.process(&retrieved(&[])).await.unwrap();
        let done = completed(&reply);
        assert_eq!(done.answer, NO_CONTEXT_ANSWER);
        assert!(!done.context_used);
        assert!(done.sources.is_empty());
        assert_eq!(reply.receiver(), COORDINATOR);
    }

    #[tokio::test]
    async fn test_sources_are_rounded() {
        let agent = GenerationAgent::new(Arc::new(TemplateGenerator));
        let reply = agent.process(&retrieved(&["X is a letter."])).await.unwrap();
        let done = completed(&reply);
        assert!(done.context_used);
        assert_eq!(done.sources[0].similarity_score, 0.123);
    }

    #[tokio::test]
    async fn test_generator_failure_falls_back_to_template() {
        let agent = GenerationAgent::new(Arc::new(BrokenGenerator));
        let reply = agent.process(&retrieved(&["X is a letter."])).await.unwrap();
        let done = completed(&reply);
        assert!(done.answer.contains("X is a letter."));
        assert_eq!(agent.model_info().model, "broken");
    }
}
