use std::sync::Arc;

use async_trait::async_trait;
use mnemo_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cache::ResponseCache;
use crate::providers::{
    ChatRole, GenerationRequest, ModelInfo, ModelProvider, compose_system_prompt, map_api_error,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Chat Completions provider. Also works against OpenAI-compatible
/// APIs via `with_base_url`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    cache: Option<Arc<ResponseCache>>,
}

impl OpenAiProvider {
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
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_request(&self, request: &GenerationRequest) -> OpenAiRequest {
        let mut messages = vec![OpenAiMessage {
            role: "system".to_string(),
            content: compose_system_prompt(request),
        }];

        for turn in &request.history {
            messages.push(OpenAiMessage {
                role: match turn.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                },
                content: turn.content.clone(),
            });
        }

        messages.push(OpenAiMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        OpenAiRequest {
            model: self.model.clone(),
            messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
            top_p: request.options.top_p,
            stop: if request.options.stop_sequences.is_empty() {
                None
            } else {
                Some(request.options.stop_sequences.clone())
            },
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            provider: "openai".to_string(),
            max_context_length: 128_000,
            supports_streaming: false,
            cost_per_1k_tokens: 0.0006,
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
        debug!(model = %self.model, messages = body.messages.len(), "openai request");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider("openai", format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error("openai", status.as_u16(), &body));
        }

        let payload: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::provider("openai", format!("failed to parse response: {e}")))?;

        let text = payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::provider("openai", "response carried no choices"))?;

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
                info!("openai availability check failed: {e}");
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

// --- OpenAI wire types (private) ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{OpenAiProvider, OpenAiResponse};
    use crate::providers::{ChatTurn, GenerationRequest, ModelProvider, RoleContext};

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("test-key", None, None)
    }

    #[test]
    fn request_carries_system_then_history_then_prompt() {
        let request = GenerationRequest {
            role_context: RoleContext {
                name: "Mentor".into(),
                ..Default::default()
            },
            history: vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")],
            ..GenerationRequest::from_prompt("tell me more")
        };

        let wire = provider().build_request(&request);
        assert_eq!(wire.messages.len(), 4);
        assert_eq!(wire.messages[0].role, "system");
        assert!(wire.messages[0].content.contains("Mentor"));
        assert_eq!(wire.messages[1].role, "user");
        assert_eq!(wire.messages[2].role, "assistant");
        assert_eq!(wire.messages[3].content, "tell me more");
    }

    #[test]
    fn stop_sequences_are_omitted_when_empty() {
        let wire = provider().build_request(&GenerationRequest::from_prompt("hi"));
        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("stop").is_none());
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["max_tokens"], 1000);
    }

    #[test]
    fn response_text_comes_from_first_choice() {
        let payload: OpenAiResponse = serde_json::from_str(
            r#"{
                "choices": [{
                    "message": {"role": "assistant", "content": "OK"},
                    "finish_reason": "stop"
                }],
                "model": "gpt-4o-mini"
            }"#,
        )
        .unwrap();
        let text = payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        assert_eq!(text.as_deref(), Some("OK"));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let provider = provider().with_base_url("https://api.example.com/");
        assert_eq!(
            provider.endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn info_reports_openai_capabilities() {
        let info = provider().info();
        assert_eq!(info.provider, "openai");
        assert_eq!(info.max_context_length, 128_000);
    }
}
