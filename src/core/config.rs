use crate::core::errors::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a [`Pipeline`](crate::pipeline::Pipeline).
///
/// Every section has sensible defaults, so a YAML file only needs the keys it
/// wants to override:
///
/// ```yaml
/// retrieval:
///   default_top_k: 3
/// generation:
///   enabled: true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub coordinator: CoordinatorConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Used by `Pipeline::wait_default`
    pub default_wait_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_secs: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters
    pub chunk_size: usize,
    /// Characters shared between neighbouring chunks
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            overlap: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    /// Hits scoring at or below this are dropped
    pub min_score: f32,
    pub embedding_dimension: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            min_score: 0.1,
            embedding_dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Use the chat-completion backend; otherwise answers are templated
    pub enabled: bool,
    pub model: String,
    pub api_base: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "llama3-8b-8192".to_string(),
            api_base: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            request_timeout_secs: 30,
        }
    }
}

impl GenerationConfig {
    /// Reads the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RagError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator.default_wait_timeout_secs == 0 {
            return Err(RagError::configuration_field(
                "default wait timeout must be greater than 0",
                "coordinator.default_wait_timeout_secs",
            ));
        }
        if self.chunking.chunk_size == 0 {
            return Err(RagError::configuration_field(
                "chunk_size must be greater than 0",
                "chunking.chunk_size",
            ));
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            return Err(RagError::configuration_field(
                "overlap must be smaller than chunk_size",
                "chunking.overlap",
            ));
        }
        if self.retrieval.embedding_dimension == 0 {
            return Err(RagError::configuration_field(
                "embedding_dimension must be greater than 0",
                "retrieval.embedding_dimension",
            ));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(RagError::configuration_field(
                "min_score must be between -1.0 and 1.0",
                "retrieval.min_score",
            ));
        }
        if self.generation.enabled && self.generation.api_base.trim().is_empty() {
            return Err(RagError::configuration_field(
                "api_base is required when generation is enabled",
                "generation.api_base",
            ));
        }
        if self.generation.request_timeout_secs == 0 {
            return Err(RagError::configuration_field(
                "request timeout must be greater than 0",
                "generation.request_timeout_secs",
            ));
        }
        Ok(())
    }
}
