//! Collaborators the stage agents delegate to: parsing, vector search and
//! answer generation. Each sits behind a trait so tests and deployments can
//! swap implementations.

pub mod chunker;
pub mod generator;
pub mod index;
pub mod parser;

pub use chunker::TextChunker;
pub use generator::{AnswerGenerator, ChatCompletionGenerator, ModelInfo, TemplateGenerator};
pub use index::{ChunkMetadata, HashingEmbedder, InMemoryVectorIndex, ScoredChunk, VectorIndex};
pub use parser::{DocumentParser, ParsedDocument, TextDocumentParser};
