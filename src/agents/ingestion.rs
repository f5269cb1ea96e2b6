use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::agents::names::{INGESTION, RETRIEVAL};
use crate::agents::stage::StageAgent;
use crate::collab::DocumentParser;
use crate::core::errors::StageError;
use crate::pubsub::{IngestionComplete, Message, MessageKind, Payload, TraceId};

/// Summary of a document the ingestion stage has parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub doc_id: String,
    pub filename: String,
    pub file_type: String,
    pub chunk_count: usize,
    pub trace: TraceId,
    pub ingested_at: DateTime<Utc>,
}

/// Parses uploaded documents and hands their chunks to the retrieval stage
pub struct IngestionAgent {
    parser: Arc<dyn DocumentParser>,
    documents: DashMap<String, DocumentInfo>,
}

impl IngestionAgent {
    pub fn new(parser: Arc<dyn DocumentParser>) -> Self {
        Self {
            parser,
            documents: DashMap::new(),
        }
    }

    pub fn document_info(&self, doc_id: &str) -> Option<DocumentInfo> {
        self.documents.get(doc_id).map(|entry| entry.value().clone())
    }

    /// Every parsed document, oldest first
    pub fn processed_documents(&self) -> Vec<DocumentInfo> {
        let mut documents: Vec<DocumentInfo> = self
            .documents
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        documents.sort_by_key(|doc| doc.ingested_at);
        documents
    }
}

#[async_trait]
impl StageAgent for IngestionAgent {
    fn name(&self) -> &'static str {
        INGESTION
    }

    fn accepts(&self) -> &'static [MessageKind] {
        &[MessageKind::IngestionRequest]
    }

    async fn process(&self, message: &Message) -> Result<Message, StageError> {
        let Payload::IngestionRequest(request) = message.payload() else {
            return Err(StageError::protocol(format!(
                "ingestion cannot handle {}",
                message.kind()
            )));
        };
        let trace = message.trace();

        let parsed = self.parser.parse(&request.filename, &request.content).await?;
        let doc_id = format!("{}_{}", request.filename, trace);
        self.documents.insert(
            doc_id.clone(),
            DocumentInfo {
                doc_id: doc_id.clone(),
                filename: parsed.filename.clone(),
                file_type: parsed.file_type.clone(),
                chunk_count: parsed.chunk_count(),
                trace: trace.clone(),
                ingested_at: Utc::now(),
            },
        );

        info!(
            trace = %trace,
            filename = %request.filename,
            chunks = parsed.chunk_count(),
            "Document parsed"
        );

        let chunk_count = parsed.chunk_count();
        Ok(message.follow_up(
            INGESTION,
            RETRIEVAL,
            Payload::IngestionComplete(IngestionComplete {
                doc_id,
                filename: parsed.filename,
                chunks: parsed.chunks,
                chunk_count,
                file_type: parsed.file_type,
                trace: trace.clone(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::names::COORDINATOR;
    use crate::collab::TextDocumentParser;
    use crate::pubsub::IngestionRequest;
    use pretty_assertions::assert_eq;

    fn upload(filename: &str, content: &[u8]) -> Message {
        Message::new(
            COORDINATOR,
            INGESTION,
            TraceId::from("trace-7"),
            Payload::IngestionRequest(IngestionRequest {
                filename: filename.to_string(),
                content: content.to_vec(),
            }),
        )
    }

    #[tokio::test]
    async fn test_parsed_document_goes_to_retrieval() {
        let agent = IngestionAgent::new(Arc::new(TextDocumentParser::default()));
        let reply = agent
            .process(&upload("notes.txt", b"One.\n\nTwo.\n\nThree."))
            .await
            .unwrap();

        assert_eq!(reply.receiver(), RETRIEVAL);
        let Payload::IngestionComplete(done) = reply.payload() else {
            panic!("expected ingestion-complete");
        };
        assert_eq!(done.doc_id, "notes.txt_trace-7");
        assert_eq!(done.chunk_count, done.chunks.len());
        assert_eq!(done.trace, TraceId::from("trace-7"));

        let info = agent.document_info("notes.txt_trace-7").unwrap();
        assert_eq!(info.file_type, "txt");
        assert_eq!(agent.processed_documents().len(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_is_returned() {
        let agent = IngestionAgent::new(Arc::new(TextDocumentParser::default()));
        let err = agent.process(&upload("scan.pdf", b"%PDF-1.7")).await.unwrap_err();
        assert_eq!(err.message(), "Unsupported file type: .pdf");
        assert!(agent.processed_documents().is_empty());
    }
}
