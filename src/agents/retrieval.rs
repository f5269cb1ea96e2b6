use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::agents::names::{COORDINATOR, GENERATION, RETRIEVAL};
use crate::agents::stage::StageAgent;
use crate::collab::{ChunkMetadata, VectorIndex};
use crate::core::errors::StageError;
use crate::pubsub::{
    IndexingComplete, IngestionComplete, Message, MessageKind, Payload, RetrievalRequest,
    RetrievalResult, Source,
};

pub const NO_DOCUMENTS_NOTE: &str = "No documents have been uploaded yet.";
pub const NO_SEARCH_TERMS_NOTE: &str = "The query contains no searchable words.";

/// Blank or punctuation-only queries cannot match anything
fn has_search_terms(query: &str) -> bool {
    query.chars().any(char::is_alphanumeric)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub total_vectors: usize,
    pub total_documents: usize,
    pub total_chunks: usize,
}

/// Indexes ingested chunks and answers retrieval requests from the index
pub struct RetrievalAgent {
    index: Arc<dyn VectorIndex>,
    min_score: f32,
}

impl RetrievalAgent {
    pub fn new(index: Arc<dyn VectorIndex>, min_score: f32) -> Self {
        Self { index, min_score }
    }

    pub fn stats(&self) -> RetrievalStats {
        RetrievalStats {
            total_vectors: self.index.len(),
            total_documents: self.index.document_count(),
            total_chunks: self.index.len(),
        }
    }

    async fn index_document(
        &self,
        message: &Message,
        done: &IngestionComplete,
    ) -> Result<Message, StageError> {
        let metadata: Vec<ChunkMetadata> = (0..done.chunks.len())
            .map(|chunk_index| ChunkMetadata {
                doc_id: done.doc_id.clone(),
                filename: done.filename.clone(),
                chunk_index,
                file_type: done.file_type.clone(),
            })
            .collect();

        let inserted = self.index.add(&done.chunks, &metadata).await?;
        let vector_count = self.index.len();
        info!(
            trace = %message.trace(),
            filename = %done.filename,
            inserted,
            vector_count,
            "Document indexed"
        );

        Ok(message.follow_up(
            RETRIEVAL,
            COORDINATOR,
            Payload::IndexingComplete(IndexingComplete {
                status: "indexed".to_string(),
                doc_id: done.doc_id.clone(),
                filename: done.filename.clone(),
                vector_count,
                trace: message.trace().clone(),
            }),
        ))
    }

    async fn retrieve(
        &self,
        message: &Message,
        request: &RetrievalRequest,
    ) -> Result<Message, StageError> {
        let mut result = RetrievalResult {
            query: request.query.clone(),
            context: Vec::new(),
            sources: Vec::new(),
            note: None,
        };

        if self.index.is_empty() {
            result.note = Some(NO_DOCUMENTS_NOTE.to_string());
        } else if !has_search_terms(&request.query) {
            result.note = Some(NO_SEARCH_TERMS_NOTE.to_string());
        } else if request.top_k > 0 {
            let hits = self.index.query(&request.query, request.top_k).await?;
            for hit in hits.into_iter().filter(|hit| hit.score > self.min_score) {
                result.sources.push(Source {
                    filename: hit.metadata.filename,
                    chunk_index: hit.metadata.chunk_index,
                    similarity_score: hit.score,
                    file_type: hit.metadata.file_type,
                });
                result.context.push(hit.text);
            }
        }

        debug!(
            trace = %message.trace(),
            top_k = request.top_k,
            found = result.context.len(),
            "Retrieved context"
        );
        Ok(message.follow_up(RETRIEVAL, GENERATION, Payload::RetrievalResult(result)))
    }
}

#[async_trait]
impl StageAgent for RetrievalAgent {
    fn name(&self) -> &'static str {
        RETRIEVAL
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::IngestionComplete, MessageKind::RetrievalRequest]
    }

    async fn process(&self, message: &Message) -> Result<Message, StageError> {
        match message.payload() {
            Payload::IngestionComplete(done) => self.index_document(message, done).await,
            Payload::RetrievalRequest(request) => self.retrieve(message, request).await,
            _ => Err(StageError::protocol(format!(
                "retrieval cannot handle {}",
                message.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::InMemoryVectorIndex;
    use crate::pubsub::TraceId;
    use pretty_assertions::assert_eq;

    fn agent() -> RetrievalAgent {
        RetrievalAgent::new(Arc::new(InMemoryVectorIndex::new(256)), 0.1)
    }

    fn ingested(trace: &str, chunks: &[&str]) -> Message {
        let trace = TraceId::from(trace);
        Message::new(
            "ingestion",
            RETRIEVAL,
            trace.clone(),
            Payload::IngestionComplete(IngestionComplete {
                doc_id: format!("doc_{trace}"),
                filename: "guide.txt".to_string(),
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                chunk_count: chunks.len(),
                file_type: "txt".to_string(),
                trace,
            }),
        )
    }

    fn query(text: &str, top_k: usize) -> Message {
        Message::new(
            COORDINATOR,
            RETRIEVAL,
            TraceId::from("query-trace"),
            Payload::RetrievalRequest(RetrievalRequest {
                query: text.to_string(),
                top_k,
            }),
        )
    }

    fn context(reply: &Message) -> &RetrievalResult {
        match reply.payload() {
            Payload::RetrievalResult(result) => result,
            other => panic!("expected retrieval-result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_indexing_reports_total_vectors() {
        let agent = agent();
        agent.process(&ingested("t1", &["alpha beta"])).await.unwrap();
        let reply = agent
            .process(&ingested("t2", &["gamma delta", "epsilon"]))
            .await
            .unwrap();

        let Payload::IndexingComplete(done) = reply.payload() else {
            panic!("expected indexing-complete");
        };
        assert_eq!(done.vector_count, 3);
        assert_eq!(reply.receiver(), COORDINATOR);
        assert_eq!(agent.stats().total_documents, 2);
    }

    #[tokio::test]
    async fn test_empty_index_gives_empty_context() {
        let reply = agent().process(&query("What is X?", 5)).await.unwrap();
        let result = context(&reply);
        assert!(result.context.is_empty());
        assert_eq!(result.note.as_deref(), Some(NO_DOCUMENTS_NOTE));
        assert_eq!(reply.receiver(), GENERATION);
    }

    #[tokio::test]
    async fn test_zero_top_k_gives_empty_context() {
        let agent = agent();
        agent.process(&ingested("t1", &["X is a letter"])).await.unwrap();
        let reply = agent.process(&query("What is X?", 0)).await.unwrap();
        assert!(context(&reply).context.is_empty());
        assert!(context(&reply).note.is_none());
    }

    #[tokio::test]
    async fn test_relevant_chunks_are_returned_with_sources() {
        let agent = agent();
        agent
            .process(&ingested("t1", &["tokio schedules async tasks", "cats sleep"]))
            .await
            .unwrap();
        let reply = agent.process(&query("async tasks in tokio", 5)).await.unwrap();
        let result = context(&reply);
        assert_eq!(result.context[0], "tokio schedules async tasks");
        assert_eq!(result.sources[0].chunk_index, 0);
        assert_eq!(result.context.len(), result.sources.len());
        assert!(result.sources.iter().all(|s| s.similarity_score > 0.1));
    }

    #[tokio::test]
    async fn test_blank_query_gives_empty_context() {
        let agent = agent();
        let reply = agent.process(&query("   ", 3)).await.unwrap();
        assert_eq!(context(&reply).note.as_deref(), Some(NO_DOCUMENTS_NOTE));

        agent.process(&ingested("t1", &["X is a letter"])).await.unwrap();
        for text in ["", "???"] {
            let reply = agent.process(&query(text, 3)).await.unwrap();
            let result = context(&reply);
            assert!(result.context.is_empty());
            assert_eq!(result.note.as_deref(), Some(NO_SEARCH_TERMS_NOTE));
            assert_eq!(reply.receiver(), GENERATION);
        }
    }
}
