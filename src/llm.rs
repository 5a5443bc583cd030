//! Model inference seam.
//!
//! Every model-assisted stage (classification, vision captioning,
//! reflection, synthesis) goes through `LlmClient` so tests can substitute
//! a deterministic stub. The HTTP implementation speaks the Ollama
//! `/api/generate` protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Text generation seam. Implementations must be deterministic given a
/// deterministic backend; all pipeline non-determinism lives behind this
/// trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for a prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Caption an image for context merging. Default implementations may
    /// not support vision; callers degrade gracefully on error.
    async fn caption_image(&self, _image: &[u8]) -> Result<String> {
        anyhow::bail!("vision not supported by this model backend")
    }
}

/// HTTP model client configuration
#[derive(Debug, Clone)]
pub struct HttpLlmConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpLlmConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("CONCIERGE_MODEL_URL")
                .unwrap_or_else(|_| "http://localhost:11434/api/generate".to_string()),
            model: std::env::var("CONCIERGE_MODEL")
                .unwrap_or_else(|_| "llama3.2:3b".to_string()),
            api_key: std::env::var("CONCIERGE_MODEL_API_KEY").ok(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP-backed model client (Ollama-compatible generate endpoint).
pub struct HttpLlmClient {
    config: HttpLlmConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    async fn post(&self, req: &GenerateRequest<'_>) -> Result<String> {
        let mut builder = self.client.post(&self.config.url).json(req);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.context("model request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("model backend returned {}", response.status());
        }

        let body: GenerateResponse = response.json().await.context("invalid model response")?;
        debug!(chars = body.response.len(), "model completion received");
        Ok(body.response)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.post(&GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            images: None,
        })
        .await
    }

    async fn caption_image(&self, image: &[u8]) -> Result<String> {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        self.post(&GenerateRequest {
            model: &self.config.model,
            prompt: "Describe the salient objects and any visible text in this image, concisely.",
            stream: false,
            images: Some(vec![encoded]),
        })
        .await
    }
}

/// Extract the first balanced JSON object from model output.
///
/// Model-assisted stages require strict parseable output; anything the
/// caller cannot deserialize from this slice is treated as degraded output,
/// never guessed at.
pub fn extract_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, c) in s[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if end > start {
        Some(&s[start..end])
    } else {
        None
    }
}
