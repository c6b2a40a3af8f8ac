use std::sync::Arc;

use mnemo_agents::EmbeddingRouter;
use mnemo_common::Result;
use mnemo_config::RetrievalConfig;
use mnemo_db::{
    MemoryFilter, MemoryRecord, MemorySort, MemorySource, MemoryStore, NewMemory, VectorStore,
};
use tracing::{debug, info, warn};

use crate::extractor::{ExtractedMemory, ExtractionContext, MemoryExtractor};

/// Knobs for one retrieval call; defaults come from [`RetrievalConfig`].
#[derive(Debug, Clone)]
pub struct RetrieveParams {
    pub max_memories: usize,
    pub min_importance: i64,
    pub use_semantic: bool,
    pub recency_weight: f64,
}

impl RetrieveParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            max_memories: config.max_memories,
            min_importance: config.min_importance,
            use_semantic: true,
            recency_weight: config.recency_weight,
        }
    }
}

/// Top-level memory API for the conversation pipeline: ingest new facts,
/// retrieve and rank what is relevant, and format it for the prompt.
pub struct MemoryManager {
    memories: MemoryStore,
    vectors: VectorStore,
    embeddings: Arc<EmbeddingRouter>,
    extractor: MemoryExtractor,
    config: RetrievalConfig,
}

impl MemoryManager {
    pub fn new(
        memories: MemoryStore,
        vectors: VectorStore,
        embeddings: Arc<EmbeddingRouter>,
        extractor: MemoryExtractor,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            memories,
            vectors,
            embeddings,
            extractor,
            config,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.memories
    }

    /// Extract memories from an utterance and persist them. A failure on one
    /// record never aborts the batch; embeddings are generated in the
    /// background, and retrieval degrades gracefully until they land.
    pub async fn ingest(
        &self,
        user_id: i64,
        utterance: &str,
        context: Option<&ExtractionContext>,
    ) -> Vec<ExtractedMemory> {
        let extracted = self.extractor.extract(utterance, context).await;
        if extracted.is_empty() {
            return extracted;
        }

        let origin: String = utterance.chars().take(100).collect();
        for record in &extracted {
            let new_memory = NewMemory::new(user_id, record.content.clone())
                .category(record.category.clone())
                .importance(record.importance)
                .source(MemorySource::Extracted)
                .context(format!("Extracted from message: {origin}..."))
                .confidence(0.8);

            match self.memories.add(new_memory).await {
                Ok(memory_id) => self.spawn_embedding(memory_id, record.content.clone()),
                Err(e) => {
                    warn!(user_id, "failed to persist extracted memory: {e}");
                }
            }
        }

        info!(
            user_id,
            count = extracted.len(),
            "ingested memories from message"
        );
        extracted
    }

    fn spawn_embedding(&self, memory_id: i64, content: String) {
        let embeddings = self.embeddings.clone();
        let vectors = self.vectors.clone();
        tokio::spawn(async move {
            match embeddings.embed(&content).await {
                Ok(vector) => {
                    if let Err(e) = vectors.upsert(memory_id, vector).await {
                        warn!(memory_id, "failed to store embedding: {e}");
                    }
                }
                Err(e) => warn!(memory_id, "failed to embed memory: {e}"),
            }
        });
    }

    /// Retrieve the memories most relevant to the current context, ranked by
    /// a blend of semantic similarity, importance, and recency.
    ///
    /// With recency weight `w`, the blend is
    /// `semantic·(1−w)·0.625 + importance·(1−w)·0.375 + recency·w`, which
    /// lands on 0.5/0.3/0.2 at the default `w = 0.2`.
    ///
    /// Like extraction and sentiment, retrieval degrades to an empty result
    /// on any failure so a broken memory subsystem never blocks a reply.
    pub async fn retrieve(
        &self,
        user_id: i64,
        context_text: &str,
        params: &RetrieveParams,
    ) -> Vec<MemoryRecord> {
        let pool_size = (params.max_memories * 3).max(15);

        let mut candidates: Vec<(MemoryRecord, Option<f32>)> = Vec::new();
        if params.use_semantic && !context_text.trim().is_empty() {
            match self.semantic_candidates(user_id, context_text, pool_size).await {
                Ok(found) if !found.is_empty() => candidates = found,
                Ok(_) => {}
                Err(e) => {
                    warn!(user_id, "semantic search failed, falling back to recency: {e}");
                }
            }
        }
        if candidates.is_empty() {
            let recent = self
                .memories
                .list(
                    user_id,
                    MemoryFilter {
                        min_importance: params.min_importance,
                        sort: MemorySort::Recency,
                        limit: Some(pool_size),
                        ..Default::default()
                    },
                )
                .await;
            match recent {
                Ok(recent) => {
                    candidates = recent.into_iter().map(|m| (m, None)).collect();
                }
                Err(e) => {
                    warn!(user_id, "memory listing failed, retrieving nothing: {e}");
                    return Vec::new();
                }
            }
        }

        candidates.retain(|(m, _)| m.importance >= params.min_importance);
        if candidates.is_empty() {
            return Vec::new();
        }

        let ranked = rank_candidates(candidates, params);
        let top: Vec<MemoryRecord> = ranked.into_iter().take(params.max_memories).collect();

        if let Err(e) = self
            .memories
            .touch(top.iter().map(|m| m.memory_id).collect())
            .await
        {
            warn!(user_id, "failed to refresh last_accessed: {e}");
        }
        debug!(user_id, count = top.len(), "retrieved relevant memories");
        top
    }

    async fn semantic_candidates(
        &self,
        user_id: i64,
        context_text: &str,
        pool_size: usize,
    ) -> Result<Vec<(MemoryRecord, Option<f32>)>> {
        let query = self.embeddings.embed(context_text).await?;
        let hits = self
            .vectors
            .search(user_id, query, pool_size, self.config.min_similarity)
            .await?;

        let mut found = Vec::with_capacity(hits.len());
        let now = chrono::Utc::now();
        for (memory_id, score) in hits {
            if let Some(memory) = self.memories.get_any(memory_id).await? {
                let expired = memory.expires_at.is_some_and(|at| at <= now);
                if !expired {
                    found.push((memory, Some(score)));
                }
            }
        }
        Ok(found)
    }

    /// Keyword or semantic content search, for explicit user-facing lookup.
    pub async fn search(
        &self,
        user_id: i64,
        query: &str,
        limit: usize,
        use_semantic: bool,
    ) -> Result<Vec<MemoryRecord>> {
        if use_semantic {
            match self.semantic_candidates(user_id, query, limit).await {
                Ok(found) if !found.is_empty() => {
                    return Ok(found.into_iter().map(|(m, _)| m).collect());
                }
                Ok(_) => {}
                Err(e) => warn!(user_id, "semantic search failed, using keywords: {e}"),
            }
        }
        self.memories.search_keyword(user_id, query, limit).await
    }

    /// Usage-based importance adjustment. The clamp here is deliberately
    /// wider than the ingest range so repeated recall can promote a memory
    /// beyond the initial scale.
    pub async fn reinforce(&self, memory_id: i64, delta: i64) -> Result<bool> {
        let Some(memory) = self.memories.get_any(memory_id).await? else {
            warn!(memory_id, "cannot reinforce: memory not found");
            return Ok(false);
        };

        let new_importance = (memory.importance + delta).clamp(1, 10);
        if new_importance == memory.importance {
            return Ok(true);
        }
        self.memories
            .set_importance(memory_id, new_importance)
            .await?;
        info!(
            memory_id,
            from = memory.importance,
            to = new_importance,
            "reinforced memory importance"
        );
        Ok(true)
    }

    pub fn context_max_chars(&self) -> usize {
        self.config.context_max_chars
    }
}

fn rank_candidates(
    candidates: Vec<(MemoryRecord, Option<f32>)>,
    params: &RetrieveParams,
) -> Vec<MemoryRecord> {
    let max_importance = candidates
        .iter()
        .map(|(m, _)| m.importance)
        .max()
        .unwrap_or(1)
        .max(1) as f64;

    let accessed: Vec<i64> = candidates
        .iter()
        .filter_map(|(m, _)| m.last_accessed.map(|t| t.timestamp()))
        .collect();
    let oldest = accessed.iter().min().copied().unwrap_or(0);
    let newest = accessed.iter().max().copied().unwrap_or(0);
    let time_range = ((newest - oldest) as f64).max(1.0);

    let w = params.recency_weight.clamp(0.0, 1.0);
    let semantic_weight = (1.0 - w) * 0.625;
    let importance_weight = (1.0 - w) * 0.375;

    let mut scored: Vec<(f64, MemoryRecord)> = candidates
        .into_iter()
        .map(|(memory, similarity)| {
            let semantic = similarity.map(|s| s as f64).unwrap_or(0.5);
            let importance = memory.importance as f64 / max_importance;
            let recency = memory
                .last_accessed
                .map(|t| (t.timestamp() - oldest) as f64 / time_range)
                .unwrap_or(0.0);

            let score =
                semantic * semantic_weight + importance * importance_weight + recency * w;
            (score, memory)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.memory_id.cmp(&a.1.memory_id))
    });
    scored.into_iter().map(|(_, memory)| memory).collect()
}

/// Render memories as a prompt block: importance-sorted, one line each,
/// truncated to the character budget.
pub fn format_for_prompt(memories: &[MemoryRecord], max_chars: usize) -> String {
    if memories.is_empty() {
        return String::new();
    }

    let mut sorted: Vec<&MemoryRecord> = memories.iter().collect();
    sorted.sort_by(|a, b| {
        b.importance
            .cmp(&a.importance)
            .then_with(|| b.memory_id.cmp(&a.memory_id))
    });

    let lines: Vec<String> = sorted
        .iter()
        .map(|memory| {
            format!(
                "{} [I:{}]: {}",
                capitalize(&memory.category),
                memory.importance,
                memory.content
            )
        })
        .collect();

    let mut block = format!("User Memory Context:\n{}", lines.join("\n"));
    if block.len() > max_chars {
        let cut = block
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= max_chars.saturating_sub(3))
            .last()
            .unwrap_or(0);
        block.truncate(cut);
        block.push_str("...");
    }
    block
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
