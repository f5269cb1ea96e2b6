use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::config::GenerationConfig;
use crate::core::errors::{RagError, Result, StageError};

const SINGLE_CHUNK_PREVIEW: usize = 600;
const MULTI_CHUNK_PREVIEW: usize = 400;
const MULTI_CHUNK_SECTIONS: usize = 3;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions using only the \
provided context from uploaded documents. Be specific, cite the relevant context, mention \
conflicting information when you see it, and say so plainly when the context does not contain \
the answer. Prefer a partial but correct answer over speculation.";

/// Description of the backend behind an [`AnswerGenerator`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub provider: String,
    pub api_key_configured: bool,
    pub status: String,
}

/// Produces a natural-language answer from retrieved context
#[async_trait]
pub trait AnswerGenerator: Send + Sync + 'static {
    async fn generate(
        &self,
        query: &str,
        context: &[String],
    ) -> std::result::Result<String, StageError>;

    fn model_info(&self) -> ModelInfo;
}

/// Deterministic answer built by quoting the retrieved context
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateGenerator;

#[async_trait]
impl AnswerGenerator for TemplateGenerator {
    async fn generate(
        &self,
        query: &str,
        context: &[String],
    ) -> std::result::Result<String, StageError> {
        Ok(template_answer(query, context))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model: "template".to_string(),
            provider: "Fallback".to_string(),
            api_key_configured: false,
            status: "fallback".to_string(),
        }
    }
}

pub fn template_answer(query: &str, context: &[String]) -> String {
    const NOTE: &str = "*Note: this answer quotes the retrieved documents directly; \
                        no language model was used.*";
    match context {
        [] => format!("No context was retrieved for your query \"{query}\".\n\n{NOTE}"),
        [only] => format!(
            "Based on the uploaded document, I found relevant information \
             for your query \"{query}\":\n\n\
             **Key Information:**\n{}\n\n{NOTE}",
            preview(only, SINGLE_CHUNK_PREVIEW)
        ),
        many => {
            let mut answer = format!(
                "Based on the uploaded documents, I found {} relevant sections \
                 for your query \"{query}\":\n\n",
                many.len()
            );
            for (i, chunk) in many.iter().take(MULTI_CHUNK_SECTIONS).enumerate() {
                answer.push_str(&format!(
                    "**Section {}:**\n{}\n\n",
                    i + 1,
                    preview(chunk, MULTI_CHUNK_PREVIEW)
                ));
            }
            answer.push_str(NOTE);
            answer
        }
    }
}

/// First `limit` characters, with an ellipsis when something was cut
fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
pub struct ChatCompletionGenerator {
    client: Client,
    config: GenerationConfig,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl ChatCompletionGenerator {
    /// Builds the client; the API key must be present in the configured
    /// environment variable.
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            RagError::configuration_field(
                format!("environment variable {} is not set", config.api_key_env),
                "generation.api_key_env",
            )
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RagError::Http {
                url: config.api_base.clone(),
                source: e,
            })?;

        info!(
            model = %config.model,
            api_base = %config.api_base,
            "Chat completion generator ready"
        );
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn user_prompt(query: &str, context: &[String]) -> String {
        let numbered = context
            .iter()
            .enumerate()
            .map(|(i, chunk)| format!("Context {}:\n{}", i + 1, chunk))
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "Based on the following context from uploaded documents, \
             answer the user's question.\n\n\
             Context from documents:\n{numbered}\n\n\
             User Question: {query}\n\n\
             If the context does not contain enough information, say so and share what the \
             context does provide."
        )
    }
}

#[async_trait]
impl AnswerGenerator for ChatCompletionGenerator {
    async fn generate(
        &self,
        query: &str,
        context: &[String],
    ) -> std::result::Result<String, StageError> {
        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::user_prompt(query, context),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(url = %url, chunks = context.len(), "Requesting chat completion");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| StageError::generation(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(StageError::generation(format!(
                "{url} returned status {}",
                response.status().as_u16()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| StageError::generation(format!("invalid completion response: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|answer| !answer.is_empty())
            .ok_or_else(|| StageError::generation("completion response contained no answer"))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model: self.config.model.clone(),
            provider: "ChatCompletion".to_string(),
            api_key_configured: true,
            status: "active".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_chunk_template() {
        let answer = TemplateGenerator
            .generate("What is X?", &["X is a letter.".to_string()])
            .await
            .unwrap();
        assert!(answer.contains("your query \"What is X?\""));
        assert!(answer.contains("**Key Information:**\nX is a letter."));
    }

    #[tokio::test]
    async fn test_multi_chunk_template_caps_sections() {
        let context: Vec<String> = (1..=5).map(|i| format!("chunk {i}")).collect();
        let answer = TemplateGenerator.generate("q", &context).await.unwrap();
        assert!(answer.contains("I found 5 relevant sections"));
        assert!(answer.contains("**Section 3:**"));
        assert!(!answer.contains("**Section 4:**"));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo", 2), "hé...");
        assert_eq!(preview("hi", 2), "hi");
    }

    #[test]
    fn test_chat_generator_requires_api_key() {
        let config = GenerationConfig {
            api_key_env: "RAGBUS_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..GenerationConfig::default()
        };
        match ChatCompletionGenerator::new(config) {
            Err(RagError::Configuration { field, .. }) => {
                assert_eq!(field.as_deref(), Some("generation.api_key_env"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn test_user_prompt_numbers_context() {
        let prompt = ChatCompletionGenerator::user_prompt(
            "why?",
            &["first".to_string(), "second".to_string()],
        );
        assert!(prompt.contains("Context 1:\nfirst\n\nContext 2:\nsecond"));
        assert!(prompt.contains("User Question: why?"));
    }
}
