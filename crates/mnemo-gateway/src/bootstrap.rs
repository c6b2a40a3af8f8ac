use std::sync::Arc;
use std::time::Duration;

use mnemo_agents::{
    EmbeddingProvider, EmbeddingRouter, GeminiEmbeddingProvider, GeminiProvider, ModelProvider,
    ModelRouter, OpenAiEmbeddingProvider, OpenAiProvider, ResponseCache,
};
use mnemo_common::Result;
use mnemo_config::AppConfig;
use mnemo_db::{ConversationStore, Database, MemoryStore, RoleStore, UserStore, VectorStore};
use mnemo_memory::{
    Consolidator, DecayEngine, MaintenanceScheduler, MemoryExtractor, MemoryManager,
    RetrieveParams, SentimentAnalyzer,
};
use mnemo_security::RateLimiter;
use tracing::info;

/// Everything the binary needs, wired once at startup. No singletons:
/// components receive their collaborators explicitly so tests can swap in
/// fakes at any seam.
pub struct AppContext {
    pub database: Database,
    pub engine: Arc<crate::engine::ChatEngine>,
    pub scheduler: Arc<MaintenanceScheduler>,
    pub roles: RoleStore,
}

pub fn build(config: &AppConfig) -> Result<AppContext> {
    let database = Database::open(&config.database_path)?;

    let users = UserStore::new(database.clone());
    let roles = RoleStore::new(database.clone());
    let conversations = ConversationStore::new(database.clone());
    let memories = MemoryStore::new(database.clone());
    let vectors = VectorStore::new(database.clone());

    let cache = Arc::new(ResponseCache::new(
        &config.response_cache_dir,
        Some(Duration::from_secs(3600)),
    )?);

    let mut providers: Vec<Arc<dyn ModelProvider>> = vec![Arc::new(GeminiProvider::new(
        config.gemini_api_key.clone(),
        None,
        Some(cache.clone()),
    ))];
    let mut embedders: Vec<Arc<dyn EmbeddingProvider>> = vec![Arc::new(
        GeminiEmbeddingProvider::new(config.gemini_api_key.clone(), None),
    )];
    if config.enable_openai {
        providers.push(Arc::new(OpenAiProvider::new(
            config.openai_api_key.clone(),
            None,
            Some(cache),
        )));
        embedders.push(Arc::new(OpenAiEmbeddingProvider::new(
            config.openai_api_key.clone(),
            None,
        )));
    }
    info!(
        models = providers.len(),
        embedders = embedders.len(),
        "configured provider chains"
    );

    let router = Arc::new(ModelRouter::new(providers));
    let embeddings = Arc::new(EmbeddingRouter::new(embedders));

    let memory = Arc::new(MemoryManager::new(
        memories.clone(),
        vectors.clone(),
        embeddings.clone(),
        MemoryExtractor::new(router.clone()),
        config.retrieval.clone(),
    ));

    let consolidator = Arc::new(Consolidator::new(
        memories.clone(),
        vectors,
        embeddings,
        router.clone(),
        config.consolidation.clone(),
    ));
    let decay = Arc::new(DecayEngine::new(memories, config.decay.clone()));
    let scheduler = Arc::new(MaintenanceScheduler::new(
        users.clone(),
        conversations.clone(),
        consolidator,
        decay,
        config.maintenance_interval_hours,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_window_secs,
        config.rate_limit_max_requests,
        config.admin_user_ids.iter().copied(),
    ));

    let engine = Arc::new(crate::engine::ChatEngine::new(
        users,
        roles.clone(),
        conversations,
        memory,
        Arc::new(SentimentAnalyzer::new(router.clone())),
        router,
        rate_limiter,
        config.max_conversation_history,
        RetrieveParams::from_config(&config.retrieval),
    ));

    Ok(AppContext {
        database,
        engine,
        scheduler,
        roles,
    })
}
