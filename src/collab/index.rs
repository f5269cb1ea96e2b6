use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::core::errors::StageError;

/// Where an indexed chunk came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: String,
    pub filename: String,
    pub chunk_index: usize,
    pub file_type: String,
}

/// One query hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Vector store consulted by the retrieval stage
#[async_trait]
pub trait VectorIndex: Send + Sync + 'static {
    /// Adds `chunks` with one metadata entry each; returns how many were inserted
    async fn add(&self, chunks: &[String], metadata: &[ChunkMetadata])
        -> Result<usize, StageError>;

    /// Best `top_k` hits by descending score; empty for an empty index or a
    /// query with no searchable tokens
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ScoredChunk>, StageError>;

    /// Total vectors held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct documents held
    fn document_count(&self) -> usize;
}

/// Feature-hashing embedder: lowercased word tokens are hashed into a
/// fixed number of signed buckets and the result is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>, StageError> {
        let mut vector = vec![0f32; self.dimension];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(StageError::embedding("text has no indexable tokens"));
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

fn fnv1a(token: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    token
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

struct IndexEntry {
    vector: Vec<f32>,
    text: String,
    metadata: ChunkMetadata,
}

/// Brute-force inner-product index kept in memory
pub struct InMemoryVectorIndex {
    embedder: HashingEmbedder,
    entries: RwLock<Vec<IndexEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            embedder: HashingEmbedder::new(dimension),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add(
        &self,
        chunks: &[String],
        metadata: &[ChunkMetadata],
    ) -> Result<usize, StageError> {
        if chunks.len() != metadata.len() {
            return Err(StageError::retrieval(format!(
                "{} chunks but {} metadata entries",
                chunks.len(),
                metadata.len()
            )));
        }

        // Embed everything first so a failure leaves the index untouched.
        let mut prepared = Vec::with_capacity(chunks.len());
        for (text, meta) in chunks.iter().zip(metadata) {
            prepared.push(IndexEntry {
                vector: self.embedder.embed(text)?,
                text: text.clone(),
                metadata: meta.clone(),
            });
        }

        let inserted = prepared.len();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(prepared);
        Ok(inserted)
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ScoredChunk>, StageError> {
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        // A query without tokens matches nothing.
        let Ok(query) = self.embedder.embed(text) else {
            return Ok(Vec::new());
        };
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<ScoredChunk> = entries
            .iter()
            .map(|entry| ScoredChunk {
                text: entry.text.clone(),
                score: dot(&query, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn document_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.metadata.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
