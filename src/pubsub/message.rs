//! Message envelope and the closed set of payloads exchanged on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::errors::Result;

/// Opaque correlation token shared by every message of one workflow
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TraceId {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TraceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TraceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Message types understood by the pipeline
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    IngestionRequest,
    IngestionComplete,
    RetrievalRequest,
    IndexingComplete,
    RetrievalResult,
    GenerationComplete,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IngestionRequest => "ingestion-request",
            Self::IngestionComplete => "ingestion-complete",
            Self::RetrievalRequest => "retrieval-request",
            Self::IndexingComplete => "indexing-complete",
            Self::RetrievalResult => "retrieval-result",
            Self::GenerationComplete => "generation-complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retrieved chunk's provenance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub filename: String,
    pub chunk_index: usize,
    pub similarity_score: f32,
    pub file_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestionRequest {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestionComplete {
    pub doc_id: String,
    pub filename: String,
    pub chunks: Vec<String>,
    pub chunk_count: usize,
    pub file_type: String,
    pub trace: TraceId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexingComplete {
    pub status: String,
    pub doc_id: String,
    pub filename: String,
    /// Total vectors held by the index after this document was added
    pub vector_count: usize,
    pub trace: TraceId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub context: Vec<String>,
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationComplete {
    pub query: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub context_used: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    /// Category of the failure: parse, embedding, retrieval, generation, protocol or panic
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub trace: TraceId,
}

/// Typed payload; the variant fixes the message's [`MessageKind`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Payload {
    IngestionRequest(IngestionRequest),
    IngestionComplete(IngestionComplete),
    RetrievalRequest(RetrievalRequest),
    IndexingComplete(IndexingComplete),
    RetrievalResult(RetrievalResult),
    GenerationComplete(GenerationComplete),
    Error(ErrorReport),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::IngestionRequest(_) => MessageKind::IngestionRequest,
            Self::IngestionComplete(_) => MessageKind::IngestionComplete,
            Self::RetrievalRequest(_) => MessageKind::RetrievalRequest,
            Self::IndexingComplete(_) => MessageKind::IndexingComplete,
            Self::RetrievalResult(_) => MessageKind::RetrievalResult,
            Self::GenerationComplete(_) => MessageKind::GenerationComplete,
            Self::Error(_) => MessageKind::Error,
        }
    }

    /// Trace copy carried inside the payload, for the kinds that have one
    pub fn embedded_trace(&self) -> Option<&TraceId> {
        match self {
            Self::IngestionComplete(p) => Some(&p.trace),
            Self::IndexingComplete(p) => Some(&p.trace),
            Self::Error(p) => Some(&p.trace),
            _ => None,
        }
    }

    /// Filename this payload refers to, if any
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::IngestionRequest(p) => Some(&p.filename),
            Self::IngestionComplete(p) => Some(&p.filename),
            Self::IndexingComplete(p) => Some(&p.filename),
            Self::Error(p) => p.filename.as_deref(),
            _ => None,
        }
    }

    /// Query text this payload refers to, if any
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::RetrievalRequest(p) => Some(&p.query),
            Self::RetrievalResult(p) => Some(&p.query),
            Self::GenerationComplete(p) => Some(&p.query),
            Self::Error(p) => p.query.as_deref(),
            _ => None,
        }
    }
}

/// Immutable envelope published on the [`MessageBus`](super::MessageBus).
///
/// Fields are only reachable through getters; a message is never changed after
/// creation. Continuations are built with [`Message::follow_up`], which copies
/// the trace of the triggering message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    sender: String,
    receiver: String,
    trace: TraceId,
    payload: Payload,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        trace: TraceId,
        payload: Payload,
    ) -> Self {
        Self {
            id: cuid2::create_id(),
            sender: sender.into(),
            receiver: receiver.into(),
            trace,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Builds the response to `self`, keeping its trace
    pub fn follow_up(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::new(sender, receiver, self.trace.clone(), payload)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn trace(&self) -> &TraceId {
        &self.trace
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> Message {
        Message::new(
            "coordinator",
            "retrieval",
            TraceId::generate(),
            Payload::RetrievalRequest(RetrievalRequest {
                query: "What is X?".to_string(),
                top_k: 2,
            }),
        )
    }

    #[test]
    fn test_follow_up_keeps_trace() {
        let first = request();
        let second = first.follow_up(
            "retrieval",
            "generation",
            Payload::RetrievalResult(RetrievalResult {
                query: "What is X?".to_string(),
                context: vec![],
                sources: vec![],
                note: None,
            }),
        );
        assert_eq!(first.trace(), second.trace());
        assert_ne!(first.id(), second.id());
        assert_eq!(second.kind(), MessageKind::RetrievalResult);
        assert_eq!(second.sender(), "retrieval");
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_value(MessageKind::GenerationComplete).unwrap();
        assert_eq!(json, serde_json::json!("generation-complete"));
        assert_eq!(MessageKind::Error.to_string(), "error");
    }

    #[test]
    fn test_message_json_carries_type() {
        let msg = request();
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["type"], "retrieval-request");
        assert_eq!(value["payload"]["data"]["top_k"], 2);
        assert_eq!(value["trace"], msg.trace().as_str());
    }

    #[test]
    fn test_payload_subjects() {
        let report = Payload::Error(ErrorReport {
            error: "boom".to_string(),
            stage: "parse".to_string(),
            filename: Some("notes.txt".to_string()),
            query: None,
            trace: TraceId::from("t-1"),
        });
        assert_eq!(report.filename(), Some("notes.txt"));
        assert_eq!(report.query(), None);
        assert_eq!(report.embedded_trace(), Some(&TraceId::from("t-1")));
    }
}
