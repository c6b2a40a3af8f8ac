use std::sync::Arc;

use mnemo_agents::{ChatTurn, GenerationRequest, ModelRouter, RoleContext};
use mnemo_common::{Error, Result};
use mnemo_db::{ConversationStore, Role, RoleStore, UserStore};
use mnemo_memory::{
    ExtractionContext, MemoryManager, RetrieveParams, SentimentAnalyzer, format_for_prompt,
};
use mnemo_security::RateLimiter;
use tracing::{debug, info};

use crate::errors::{report_error, user_reply_for};

/// How much technical detail the error reporter logs (0..=3).
const ERROR_DETAIL_LEVEL: u8 = 2;

/// An inbound user utterance plus the transport-level profile fields used
/// to upsert the user row.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: i64,
    pub text: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

impl IncomingMessage {
    pub fn text_only(user_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id,
            text: text.into(),
            username: None,
            first_name: None,
            last_name: None,
            language_code: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineReply {
    pub text: String,
    /// Model that produced the reply; absent when the reply came from the
    /// error router.
    pub served_by: Option<String>,
}

/// The conversation pipeline: throttle, read the user's emotional state,
/// ingest and retrieve memories, generate a persona-shaped reply, and
/// persist the exchange.
pub struct ChatEngine {
    users: UserStore,
    roles: RoleStore,
    conversations: ConversationStore,
    memory: Arc<MemoryManager>,
    sentiment: Arc<SentimentAnalyzer>,
    router: Arc<ModelRouter>,
    rate_limiter: Arc<RateLimiter>,
    max_history: usize,
    retrieval: RetrieveParams,
}

impl ChatEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: UserStore,
        roles: RoleStore,
        conversations: ConversationStore,
        memory: Arc<MemoryManager>,
        sentiment: Arc<SentimentAnalyzer>,
        router: Arc<ModelRouter>,
        rate_limiter: Arc<RateLimiter>,
        max_history: usize,
        retrieval: RetrieveParams,
    ) -> Self {
        Self {
            users,
            roles,
            conversations,
            memory,
            sentiment,
            router,
            rate_limiter,
            max_history,
            retrieval,
        }
    }

    /// Handle one inbound message. Never returns an error: failures are
    /// routed to a user-safe reply and logged with full detail.
    pub async fn handle_message(&self, message: IncomingMessage) -> EngineReply {
        match self.process(message).await {
            Ok(reply) => reply,
            Err(e) => {
                report_error(&e, ERROR_DETAIL_LEVEL);
                EngineReply {
                    text: user_reply_for(&e),
                    served_by: None,
                }
            }
        }
    }

    async fn process(&self, message: IncomingMessage) -> Result<EngineReply> {
        let check = self.rate_limiter.check(message.user_id);
        if check.limited {
            return Err(Error::RateLimited {
                retry_after_secs: check.reset_secs,
            });
        }
        if self.rate_limiter.near_limit(&check) {
            debug!(user_id = message.user_id, count = check.count, "user nearing rate limit");
        }

        self.users
            .ensure(
                message.user_id,
                message.username.as_deref(),
                message.first_name.as_deref(),
                message.last_name.as_deref(),
                message.language_code.as_deref(),
            )
            .await?;
        let user = self
            .users
            .get(message.user_id)
            .await?
            .ok_or_else(|| Error::Connection("user row vanished after upsert".into()))?;
        let preferences = self.users.preferences(message.user_id).await?;

        let sentiment = self.sentiment.analyze(&message.text).await;
        let adjustment = SentimentAnalyzer::adjustment(&sentiment);

        let mut memory_context = None;
        if preferences.memory_enabled {
            let extraction = ExtractionContext {
                username: message.username.clone(),
                language: message.language_code.clone(),
            };
            self.memory
                .ingest(message.user_id, &message.text, Some(&extraction))
                .await;

            let relevant = self
                .memory
                .retrieve(message.user_id, &message.text, &self.retrieval)
                .await;
            if !relevant.is_empty() {
                memory_context = Some(format_for_prompt(
                    &relevant,
                    self.memory.context_max_chars(),
                ));
            }
        }

        let role = self.resolve_role(user.current_role_id).await?;
        let role_id = role.as_ref().map(|r| r.role_id);
        let role_context = role_context_for(role, adjustment.tone_guidance);

        let history = self
            .conversations
            .recent(message.user_id, role_id, self.max_history)
            .await?;
        let mut turns = Vec::with_capacity(history.len() * 2);
        for exchange in &history {
            turns.push(ChatTurn::user(exchange.user_message.clone()));
            turns.push(ChatTurn::assistant(exchange.bot_response.clone()));
        }

        let mut request = GenerationRequest::from_prompt(message.text.clone());
        request.role_context = role_context;
        request.history = turns;
        request.memory_context = memory_context;
        request.options.temperature = adjustment.temperature;

        let (reply, served_by) = self.router.generate(&request, true).await?;

        self.conversations
            .append(message.user_id, role_id, &message.text, &reply)
            .await?;

        info!(
            user_id = message.user_id,
            model = %served_by,
            "handled message"
        );
        Ok(EngineReply {
            text: reply,
            served_by: Some(served_by),
        })
    }

    async fn resolve_role(&self, current_role_id: Option<i64>) -> Result<Option<Role>> {
        if let Some(role_id) = current_role_id {
            if let Some(role) = self.roles.get(role_id).await? {
                return Ok(Some(role));
            }
        }
        self.roles.default_role().await
    }
}

fn role_context_for(role: Option<Role>, tone_guidance: String) -> RoleContext {
    let tone_guidance = if tone_guidance.is_empty() {
        None
    } else {
        Some(tone_guidance)
    };
    match role {
        Some(role) => RoleContext {
            name: role.name,
            personality: role.personality.unwrap_or_default(),
            speaking_style: role.speaking_style.unwrap_or_default(),
            knowledge_areas: role.knowledge_areas.unwrap_or_default(),
            behaviors: role.behaviors.unwrap_or_default(),
            tone_guidance,
        },
        None => RoleContext {
            name: "Companion".to_string(),
            personality: "Helpful and friendly".to_string(),
            speaking_style: "Conversational".to_string(),
            knowledge_areas: "General knowledge".to_string(),
            behaviors: "Responds helpfully".to_string(),
            tone_guidance,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mnemo_agents::{
        EmbeddingProvider, EmbeddingRouter, GenerationRequest, ModelInfo, ModelProvider,
        ModelRouter,
    };
    use mnemo_common::{Error, Result};
    use mnemo_config::RetrievalConfig;
    use mnemo_db::{
        ConversationStore, Database, MemoryStore, RoleStore, UserStore, VectorStore,
    };
    use mnemo_memory::{MemoryExtractor, MemoryManager, RetrieveParams, SentimentAnalyzer};
    use mnemo_security::RateLimiter;

    use super::{ChatEngine, IncomingMessage};

    struct ScriptedModel {
        reply: &'static str,
        fail_with: Option<fn() -> Error>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        fn info(&self) -> ModelInfo {
            ModelInfo {
                name: "scripted".into(),
                provider: "fake".into(),
                max_context_length: 1000,
                supports_streaming: false,
                cost_per_1k_tokens: 0.0,
            }
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make_error) => Err(make_error()),
                None => Ok(self.reply.to_string()),
            }
        }

        async fn is_available(&self) -> bool {
            self.fail_with.is_none()
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn provider_id(&self) -> &str {
            "fixed"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    async fn engine_with(
        model: Arc<ScriptedModel>,
        max_requests: usize,
    ) -> (ChatEngine, ConversationStore) {
        let db = Database::in_memory().unwrap();
        let roles = RoleStore::new(db.clone());
        roles.seed_defaults().await.unwrap();

        let router = Arc::new(ModelRouter::new(vec![model as Arc<dyn ModelProvider>]));
        let embeddings = Arc::new(EmbeddingRouter::new(vec![Arc::new(FixedEmbedder)]));
        let memory = Arc::new(MemoryManager::new(
            MemoryStore::new(db.clone()),
            VectorStore::new(db.clone()),
            embeddings,
            MemoryExtractor::new(router.clone()),
            RetrievalConfig::default(),
        ));
        let conversations = ConversationStore::new(db.clone());

        let engine = ChatEngine::new(
            UserStore::new(db.clone()),
            roles,
            conversations.clone(),
            memory,
            Arc::new(SentimentAnalyzer::new(router.clone())),
            router,
            Arc::new(RateLimiter::new(60, max_requests, [])),
            10,
            RetrieveParams::from_config(&RetrievalConfig::default()),
        );
        (engine, conversations)
    }

    fn scripted(reply: &'static str) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel {
            reply,
            fail_with: None,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn reply_flows_through_and_is_persisted() {
        let model = scripted("Hello Alice!");
        let (engine, conversations) = engine_with(model, 100).await;

        let reply = engine
            .handle_message(IncomingMessage {
                user_id: 1,
                text: "hello there, my name is Alice".into(),
                username: Some("alice".into()),
                first_name: Some("Alice".into()),
                last_name: None,
                language_code: Some("en".into()),
            })
            .await;

        assert_eq!(reply.text, "Hello Alice!");
        assert_eq!(reply.served_by.as_deref(), Some("scripted"));

        let turns = conversations.recent(1, None, 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_message, "hello there, my name is Alice");
        assert_eq!(turns[0].bot_response, "Hello Alice!");
    }

    #[tokio::test]
    async fn rate_limited_user_gets_wait_message_without_model_call() {
        let model = scripted("should not appear");
        let (engine, conversations) = engine_with(model.clone(), 1).await;

        let first = engine
            .handle_message(IncomingMessage::text_only(1, "first message here"))
            .await;
        assert_eq!(first.text, "should not appear");
        let calls_after_first = model.calls.load(Ordering::SeqCst);

        let second = engine
            .handle_message(IncomingMessage::text_only(1, "second message here"))
            .await;
        assert!(second.text.contains("too quickly"));
        assert!(second.served_by.is_none());
        // No further model traffic for the limited message.
        assert_eq!(model.calls.load(Ordering::SeqCst), calls_after_first);

        let turns = conversations.recent(1, None, 10).await.unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_routes_to_safe_user_message() {
        let model = Arc::new(ScriptedModel {
            reply: "",
            fail_with: Some(|| Error::rate_limit("gemini", "quota")),
            calls: AtomicUsize::new(0),
        });
        let (engine, _) = engine_with(model, 100).await;

        let reply = engine
            .handle_message(IncomingMessage::text_only(1, "hello out there friend"))
            .await;
        assert!(reply.text.contains("AI brain"));
        assert!(reply.served_by.is_none());
    }

    #[tokio::test]
    async fn disabling_memory_skips_ingestion() {
        let model = scripted("ok");
        let (engine, _) = engine_with(model.clone(), 100).await;

        // First contact creates the preference row, then turn memory off.
        engine
            .handle_message(IncomingMessage::text_only(1, "first hello to create user"))
            .await;
        let db_users = &engine.users;
        let mut preferences = db_users.preferences(1).await.unwrap();
        preferences.memory_enabled = false;
        db_users.set_preferences(preferences).await.unwrap();
        let baseline = model.calls.load(Ordering::SeqCst);

        engine
            .handle_message(IncomingMessage::text_only(1, "another message from me"))
            .await;
        // Sentiment + reply only; no extraction call.
        assert_eq!(model.calls.load(Ordering::SeqCst), baseline + 2);
    }
}
