use async_trait::async_trait;
use mnemo_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Persona and tone fed into the system prompt. Fields mirror the role rows
/// in storage; `tone_guidance` is filled in by sentiment analysis per turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleContext {
    pub name: String,
    pub personality: String,
    pub speaking_style: String,
    pub knowledge_areas: String,
    pub behaviors: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone_guidance: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of alternating conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub stop_sequences: Vec<String>,
    pub bypass_cache: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 0.95,
            top_k: 40,
            stop_sequences: Vec::new(),
            bypass_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub role_context: RoleContext,
    pub history: Vec<ChatTurn>,
    pub memory_context: Option<String>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            role_context: RoleContext::default(),
            history: Vec::new(),
            memory_context: None,
            options: GenerationOptions::default(),
        }
    }

    /// Responses are only cached in the mid-temperature band where output is
    /// effectively stable; anything else is intentionally non-deterministic.
    pub fn cacheable(&self) -> bool {
        !self.options.bypass_cache
            && (0.6..=0.8).contains(&self.options.temperature)
    }
}

/// Static capability card for a model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub max_context_length: u32,
    pub supports_streaming: bool,
    pub cost_per_1k_tokens: f64,
}

/// A text-generation backend. Implementations own their HTTP client and
/// response cache; they are constructed at startup and injected wherever
/// generation is needed.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn info(&self) -> ModelInfo;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Cheap availability probe; failures are reported as `false`, never as
    /// an error.
    async fn is_available(&self) -> bool;

    /// Drop expired cache entries, returning how many were removed.
    fn clear_cache(&self, max_age_secs: Option<u64>) -> usize {
        let _ = max_age_secs;
        0
    }
}

/// Compose the system prompt shared by all providers: fixed identity first,
/// the persona verbatim, then any memory context and the per-turn emotional
/// context.
pub fn compose_system_prompt(request: &GenerationRequest) -> String {
    let role = &request.role_context;
    let mut prompt = format!(
        "You are Mnemo, an emotionally aware AI companion, currently speaking as {name}.\n\
         \n\
         Your core identity: you are Mnemo. You remember what matters to the user,\n\
         notice how they feel, and adapt to their needs.\n\
         \n\
         Current persona:\n\
         - Name: {name}\n\
         - Personality: {personality}\n\
         - Speaking Style: {speaking_style}\n\
         - Knowledge Areas: {knowledge_areas}\n\
         - Behaviors: {behaviors}\n\
         \n\
         Guidelines:\n\
         1. Stay in character while keeping your core identity as Mnemo\n\
         2. Acknowledge the user's feelings when they show\n\
         3. Keep responses concise but meaningful\n\
         4. Invite the conversation to continue when it fits",
        name = role.name,
        personality = role.personality,
        speaking_style = role.speaking_style,
        knowledge_areas = role.knowledge_areas,
        behaviors = role.behaviors,
    );

    if let Some(memory_context) = &request.memory_context {
        if !memory_context.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(memory_context);
        }
    }

    if let Some(tone) = &role.tone_guidance {
        if !tone.is_empty() {
            prompt.push_str("\n\nCurrent Emotional Context:\n");
            prompt.push_str(tone);
        }
    }

    prompt
}

/// Map an HTTP failure from a provider API onto the error taxonomy.
/// 429 and rate-limit body tags become `RateLimit`, 401/403 and
/// authentication tags become `Auth`, everything else is `ProviderError`.
pub(crate) fn map_api_error(provider: &str, status: u16, body: &str) -> Error {
    let lowered = body.to_lowercase();
    if status == 429 || lowered.contains("rate_limit") {
        Error::rate_limit(provider, format!("HTTP {status}: {body}"))
    } else if status == 401 || status == 403 || lowered.contains("authentication") {
        Error::auth(provider, format!("HTTP {status}: {body}"))
    } else {
        Error::provider(provider, format!("HTTP {status}: {body}"))
    }
}
