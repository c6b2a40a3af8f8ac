use std::sync::Arc;

use async_trait::async_trait;
use mnemo_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cache::ResponseCache;
use crate::providers::{
    ChatRole, GenerationRequest, ModelInfo, ModelProvider, compose_system_prompt, map_api_error,
};

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini text generation over the REST generateContent API.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    cache: Option<Arc<ResponseCache>>,
}

impl GeminiProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
            cache,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    fn build_request(&self, request: &GenerationRequest) -> GeminiRequest {
        let mut contents = Vec::new();

        // The system prompt rides as the first user content; Gemini has no
        // dedicated system role on this endpoint.
        contents.push(GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: compose_system_prompt(request),
            }],
        });

        for turn in &request.history {
            contents.push(GeminiContent {
                role: match turn.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "model".to_string(),
                },
                parts: vec![GeminiPart {
                    text: turn.content.clone(),
                }],
            });
        }

        contents.push(GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: request.prompt.clone(),
            }],
        });

        GeminiRequest {
            contents,
            generation_config: GeminiGenerationConfig {
                temperature: request.options.temperature,
                max_output_tokens: request.options.max_tokens,
                top_p: request.options.top_p,
                top_k: request.options.top_k,
                stop_sequences: if request.options.stop_sequences.is_empty() {
                    None
                } else {
                    Some(request.options.stop_sequences.clone())
                },
            },
        }
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            provider: "google".to_string(),
            max_context_length: 1_000_000,
            supports_streaming: false,
            cost_per_1k_tokens: 0.00015,
        }
    }

    #[instrument(skip(self, request))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let fingerprint = if self.cache.is_some() && request.cacheable() {
            let fingerprint = ResponseCache::fingerprint(
                &request.prompt,
                &request.role_context,
                &request.history,
            );
            if let Some(cache) = &self.cache {
                if let Some(cached) = cache.get(&fingerprint) {
                    info!(model = %self.model, "serving cached response");
                    return Ok(cached);
                }
            }
            Some(fingerprint)
        } else {
            None
        };

        let body = self.build_request(request);
        debug!(model = %self.model, turns = body.contents.len(), "gemini request");

        let response = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider("gemini", format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error("gemini", status.as_u16(), &body));
        }

        let payload: GeminiResponse = response
            .json()
            .await
            .map_err(|e| Error::provider("gemini", format!("failed to parse response: {e}")))?;

        let text = payload
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| Error::provider("gemini", "response carried no candidates"))?;

        if let (Some(cache), Some(fingerprint)) = (&self.cache, fingerprint) {
            if let Err(e) = cache.set(&fingerprint, &request.prompt, &text) {
                debug!("failed to write response cache: {e}");
            }
        }

        Ok(text)
    }

    async fn is_available(&self) -> bool {
        let mut probe = GenerationRequest::from_prompt("ping");
        probe.options.max_tokens = 1;
        probe.options.bypass_cache = true;
        match self.generate(&probe).await {
            Ok(_) => true,
            Err(e) => {
                info!("gemini availability check failed: {e}");
                false
            }
        }
    }

    fn clear_cache(&self, max_age_secs: Option<u64>) -> usize {
        match &self.cache {
            Some(cache) => cache.sweep(max_age_secs.map(std::time::Duration::from_secs)),
            None => 0,
        }
    }
}

// --- Gemini wire types (private) ---

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "stopSequences", skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[cfg(test)]
mod tests {
    use super::{GeminiProvider, GeminiResponse};
    use crate::providers::{ChatTurn, GenerationRequest, ModelProvider, RoleContext};

    fn provider() -> GeminiProvider {
        GeminiProvider::new("test-key", None, None)
    }

    #[test]
    fn request_puts_system_prompt_first_and_user_prompt_last() {
        let request = GenerationRequest {
            role_context: RoleContext {
                name: "Friend".into(),
                ..Default::default()
            },
            history: vec![ChatTurn::user("earlier"), ChatTurn::assistant("reply")],
            ..GenerationRequest::from_prompt("what's new?")
        };

        let wire = provider().build_request(&request);
        assert_eq!(wire.contents.len(), 4);
        assert_eq!(wire.contents[0].role, "user");
        assert!(wire.contents[0].parts[0].text.contains("You are Mnemo"));
        assert_eq!(wire.contents[1].parts[0].text, "earlier");
        assert_eq!(wire.contents[2].role, "model");
        assert_eq!(wire.contents[3].parts[0].text, "what's new?");
    }

    #[test]
    fn generation_config_serializes_camel_case() {
        let wire = provider().build_request(&GenerationRequest::from_prompt("hi"));
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1000);
        assert_eq!(json["generationConfig"]["topK"], 40);
        assert!(json["generationConfig"].get("stopSequences").is_none());
    }

    #[test]
    fn response_text_is_extracted_from_first_candidate() {
        let payload: GeminiResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{"text": "Hello there!"}]
                    },
                    "finishReason": "STOP"
                }]
            }"#,
        )
        .unwrap();
        let text = payload
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text);
        assert_eq!(text.as_deref(), Some("Hello there!"));
    }

    #[test]
    fn endpoint_includes_model_and_key() {
        let endpoint = provider().endpoint();
        assert!(endpoint.contains("gemini-2.0-flash:generateContent"));
        assert!(endpoint.contains("key=test-key"));
    }

    #[test]
    fn info_reports_google_capabilities() {
        let info = provider().info();
        assert_eq!(info.provider, "google");
        assert_eq!(info.name, "gemini-2.0-flash");
        assert!(!info.supports_streaming);
    }
}
