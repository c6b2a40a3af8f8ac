use std::sync::Arc;

use async_trait::async_trait;
use mnemo_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::providers::map_api_error;

/// Converts text into a fixed-dimension vector via a remote API.
///
/// Empty input yields a zero vector of the provider's native dimension,
/// never an error, so callers can treat "nothing to embed" uniformly.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Gemini embedContent API.
pub struct GeminiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

const GEMINI_EMBED_MODEL: &str = "text-embedding-004";
const GEMINI_DIMENSION: usize = 768;

impl GeminiEmbeddingProvider {
    pub fn new(api_key: impl Into<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| GEMINI_EMBED_MODEL.to_string()),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:embedContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    fn provider_id(&self) -> &str {
        "gemini"
    }

    fn dimension(&self) -> usize {
        GEMINI_DIMENSION
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension()]);
        }

        let payload = GeminiEmbedRequest {
            model: format!("models/{}", self.model),
            content: GeminiEmbedContent {
                parts: vec![GeminiEmbedPart {
                    text: text.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::provider("gemini", format!("embed request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error("gemini", status.as_u16(), &body));
        }

        let payload: GeminiEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::provider("gemini", format!("failed to decode embedding: {e}")))?;
        payload.into_vector()
    }
}

#[derive(Debug, Serialize)]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiEmbedContent,
}

#[derive(Debug, Serialize)]
struct GeminiEmbedContent {
    parts: Vec<GeminiEmbedPart>,
}

#[derive(Debug, Serialize)]
struct GeminiEmbedPart {
    text: String,
}

/// Wire formats vary: the embedding arrives either as `{values: [...]}` or
/// as a bare float list. Both normalize to a flat vector.
#[derive(Debug, Deserialize)]
struct GeminiEmbedResponse {
    embedding: Option<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiEmbedding {
    Tagged { values: Vec<f32> },
    Flat(Vec<f32>),
}

impl GeminiEmbedResponse {
    fn into_vector(self) -> Result<Vec<f32>> {
        match self.embedding {
            Some(GeminiEmbedding::Tagged { values }) => Ok(values),
            Some(GeminiEmbedding::Flat(values)) => Ok(values),
            None => Err(Error::provider("gemini", "response missing embedding")),
        }
    }
}

/// OpenAI embeddings API.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

const OPENAI_EMBED_MODEL: &str = "text-embedding-3-small";
const OPENAI_DIMENSION: usize = 1536;

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: impl Into<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| OPENAI_EMBED_MODEL.to_string()),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn dimension(&self) -> usize {
        OPENAI_DIMENSION
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension()]);
        }

        let payload = OpenAiEmbedRequest {
            model: self.model.clone(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::provider("openai", format!("embed request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error("openai", status.as_u16(), &body));
        }

        let payload: OpenAiEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::provider("openai", format!("failed to decode embedding: {e}")))?;
        payload
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::provider("openai", "response carried no embeddings"))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiEmbedRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedDatum {
    embedding: Vec<f32>,
}

/// Ordered fallback chain over embedding providers, mirroring the model
/// router: retriable remote-API failures move to the next provider.
pub struct EmbeddingRouter {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingRouter {
    pub fn new(providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { providers }
    }

    /// Dimension of the primary provider's vectors.
    pub fn dimension(&self) -> usize {
        self.providers.first().map(|p| p.dimension()).unwrap_or(0)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.providers.is_empty() {
            return Err(Error::provider(
                "embeddings",
                "no embedding providers configured",
            ));
        }

        let mut last_error = None;
        for provider in &self.providers {
            match provider.embed(text).await {
                Ok(vector) => {
                    if last_error.is_some() {
                        info!("embedding served by fallback {}", provider.provider_id());
                    }
                    return Ok(vector);
                }
                Err(e) if e.is_provider_fallback() => {
                    warn!(
                        "embedding provider {} failed, trying next: {e}",
                        provider.provider_id()
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::provider("embeddings", "all embedding providers failed")))
    }
}
