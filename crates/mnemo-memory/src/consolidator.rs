use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mnemo_agents::{EmbeddingRouter, GenerationRequest, ModelRouter};
use mnemo_common::Result;
use mnemo_config::ConsolidationConfig;
use mnemo_db::{
    MemoryFilter, MemoryRecord, MemorySort, MemorySource, MemoryStore, NewMemory, VectorStore,
    cosine_similarity,
};
use tracing::{info, warn};

use crate::cluster::{dbscan, mean_pairwise_similarity};

/// Clusters a user's semantically similar memories and asks the model to
/// synthesize one condensed memory per cluster.
pub struct Consolidator {
    memories: MemoryStore,
    vectors: VectorStore,
    embeddings: Arc<EmbeddingRouter>,
    router: Arc<ModelRouter>,
    config: ConsolidationConfig,
}

impl Consolidator {
    pub fn new(
        memories: MemoryStore,
        vectors: VectorStore,
        embeddings: Arc<EmbeddingRouter>,
        router: Arc<ModelRouter>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            memories,
            vectors,
            embeddings,
            router,
            config,
        }
    }

    /// Run one consolidation pass for a user. Returns the ids of the newly
    /// created consolidated memories. A failure inside one cluster aborts
    /// that cluster only.
    pub async fn run(&self, user_id: i64) -> Result<Vec<i64>> {
        let clusters = self.candidate_clusters(user_id).await?;
        if clusters.is_empty() {
            info!(user_id, "no consolidation candidates");
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for cluster in clusters.into_iter().take(self.config.max_consolidations) {
            match self.consolidate_cluster(user_id, &cluster).await {
                Ok(memory_id) => created.push(memory_id),
                Err(e) => {
                    warn!(user_id, "consolidation of one cluster failed: {e}");
                }
            }
        }

        info!(user_id, created = created.len(), "consolidation pass finished");
        Ok(created)
    }

    /// Groups of related memories worth consolidating, most coherent first.
    pub async fn candidate_clusters(&self, user_id: i64) -> Result<Vec<Vec<MemoryRecord>>> {
        let memories = self
            .memories
            .list(
                user_id,
                MemoryFilter {
                    min_importance: self.config.min_importance,
                    sort: MemorySort::Recency,
                    limit: Some(self.config.max_memories),
                    ..Default::default()
                },
            )
            .await?;

        if memories.len() < self.config.min_cluster_size {
            return Ok(Vec::new());
        }

        // Memories without an embedding cannot be clustered; drop them.
        let mut embedded: Vec<(MemoryRecord, Vec<f32>)> = Vec::new();
        for memory in memories {
            if let Some(embedding) = self.vectors.get(memory.memory_id).await? {
                embedded.push((memory, embedding));
            }
        }
        if embedded.len() < self.config.min_cluster_size {
            return Ok(Vec::new());
        }

        let n = embedded.len();
        let mut distances = vec![vec![0.0f64; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let similarity =
                    cosine_similarity(&embedded[i].1, &embedded[j].1) as f64;
                let distance = 1.0 - similarity;
                distances[i][j] = distance;
                distances[j][i] = distance;
            }
        }

        let eps = 1.0 - self.config.min_similarity as f64;
        let min_samples = self.config.min_cluster_size.saturating_sub(1).max(1);
        let labels = dbscan(&distances, eps, min_samples);

        let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (index, label) in labels.iter().enumerate() {
            if *label >= 0 {
                groups.entry(*label).or_default().push(index);
            }
        }

        let mut ranked: Vec<(f64, i64, Vec<usize>)> = groups
            .into_values()
            .filter(|members| {
                (self.config.min_cluster_size..=self.config.max_cluster_size)
                    .contains(&members.len())
            })
            .map(|members| {
                let coherence = mean_pairwise_similarity(&distances, &members);
                let newest = members
                    .iter()
                    .map(|&i| embedded[i].0.memory_id)
                    .max()
                    .unwrap_or(0);
                (coherence, newest, members)
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });

        Ok(ranked
            .into_iter()
            .map(|(_, _, members)| {
                members
                    .into_iter()
                    .map(|i| embedded[i].0.clone())
                    .collect()
            })
            .collect())
    }

    async fn consolidate_cluster(
        &self,
        user_id: i64,
        cluster: &[MemoryRecord],
    ) -> Result<i64> {
        let content = self.synthesize(cluster).await?;

        let mean_importance =
            cluster.iter().map(|m| m.importance).sum::<i64>() as f64 / cluster.len() as f64;
        let importance = (mean_importance.round() as i64).clamp(1, 5);
        let category = merged_category(cluster);
        let tags: BTreeSet<String> = cluster.iter().flat_map(|m| m.tags.clone()).collect();
        let source_ids: Vec<i64> = cluster.iter().map(|m| m.memory_id).collect();

        let consolidated_id = self
            .memories
            .add(NewMemory {
                user_id,
                content: content.clone(),
                category,
                importance,
                source: MemorySource::Consolidation,
                context: Some(format!(
                    "Consolidated from {} related memories",
                    cluster.len()
                )),
                confidence: 0.8,
                expires_at: None,
                tags: tags.into_iter().collect(),
                is_consolidated: true,
            })
            .await?;

        for memory in cluster {
            self.memories
                .mark_consolidated(
                    memory.memory_id,
                    consolidated_id,
                    self.config.mark_originals,
                )
                .await?;
            self.memories
                .add_relationship(memory.memory_id, consolidated_id, "part_of", 0.9)
                .await?;
        }

        self.memories
            .log_consolidation(user_id, &source_ids, consolidated_id, "auto")
            .await?;

        // Retrieval degrades gracefully without the embedding, so a failure
        // here is not fatal to the consolidation itself.
        match self.embeddings.embed(&content).await {
            Ok(vector) => {
                if let Err(e) = self.vectors.upsert(consolidated_id, vector).await {
                    warn!(consolidated_id, "failed to store embedding: {e}");
                }
            }
            Err(e) => warn!(consolidated_id, "failed to embed consolidated memory: {e}"),
        }

        info!(
            user_id,
            consolidated_id,
            sources = cluster.len(),
            "consolidated memory cluster"
        );
        Ok(consolidated_id)
    }

    async fn synthesize(&self, cluster: &[MemoryRecord]) -> Result<String> {
        let listing = cluster
            .iter()
            .map(|m| format!("- {}", m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You are helping to consolidate related memories into a single, comprehensive \
             memory. Analyze these related memories and create one consolidated memory that \
             captures all the important information.\n\
             \n\
             MEMORIES TO CONSOLIDATE:\n\
             {listing}\n\
             \n\
             GUIDELINES:\n\
             1. Combine all important information from the memories\n\
             2. Remove redundancies and duplications\n\
             3. Keep the consolidated memory concise but comprehensive\n\
             4. Use clear, factual language\n\
             5. Preserve specific details, names, dates, and numbers\n\
             \n\
             Provide ONLY the consolidated memory text, without any explanations or \
             additional comments."
        );

        let mut request = GenerationRequest::from_prompt(prompt);
        request.options.temperature = 0.3;
        request.options.bypass_cache = true;

        let (text, model) = self.router.generate(&request, true).await?;
        info!(model, "synthesized consolidated memory");
        Ok(text.trim().to_string())
    }
}

/// Single source category when unique, otherwise the most frequent one with
/// a deterministic tie-break.
fn merged_category(cluster: &[MemoryRecord]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for memory in cluster {
        *counts.entry(memory.category.as_str()).or_default() += 1;
    }
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(category, _)| category.to_string())
        .unwrap_or_else(|| "general".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use mnemo_agents::{
        EmbeddingProvider, EmbeddingRouter, GenerationRequest, ModelInfo, ModelProvider,
        ModelRouter,
    };
    use mnemo_common::Result;
    use mnemo_config::ConsolidationConfig;
    use mnemo_db::{Database, MemorySource, MemoryStore, NewMemory, UserStore, VectorStore};

    use super::{Consolidator, merged_category};

    struct ScriptedModel(&'static str);

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
            Ok(self.0.to_string())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn provider_id(&self) -> &str {
            "fixed"
        }

        fn dimension(&self) -> usize {
            3
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.5, 0.5, 0.0])
        }
    }

    async fn setup(config: ConsolidationConfig) -> (MemoryStore, VectorStore, Consolidator) {
        let db = Database::in_memory().unwrap();
        UserStore::new(db.clone())
            .ensure(1, None, None, None, None)
            .await
            .unwrap();
        let memories = MemoryStore::new(db.clone());
        let vectors = VectorStore::new(db);
        let consolidator = Consolidator::new(
            memories.clone(),
            vectors.clone(),
            Arc::new(EmbeddingRouter::new(vec![Arc::new(FixedEmbedder)])),
            Arc::new(ModelRouter::new(vec![Arc::new(ScriptedModel(
                "Plays chess: weekly games, board game nights with friends, collects vintage sets.",
            ))])),
            config,
        );
        (memories, vectors, consolidator)
    }

    #[tokio::test]
    async fn consolidates_a_tight_cluster_into_one_memory() {
        let config = ConsolidationConfig {
            max_consolidations: 1,
            ..Default::default()
        };
        let (memories, vectors, consolidator) = setup(config).await;

        let seeds = [
            ("I play chess weekly", vec![1.0f32, 0.0, 0.0]),
            ("I enjoy board games with friends", vec![0.95, 0.05, 0.0]),
            ("I collect vintage chess sets", vec![0.9, 0.1, 0.0]),
        ];
        let mut ids = Vec::new();
        for (content, embedding) in seeds {
            let id = memories
                .add(
                    NewMemory::new(1, content)
                        .category("hobbies")
                        .importance(3)
                        .tags(vec!["games".into()]),
                )
                .await
                .unwrap();
            vectors.upsert(id, embedding).await.unwrap();
            ids.push(id);
        }

        let created = consolidator.run(1).await.unwrap();
        assert_eq!(created.len(), 1);

        let merged = memories.get_any(created[0]).await.unwrap().unwrap();
        assert_eq!(merged.source, MemorySource::Consolidation);
        assert!(merged.is_consolidated);
        assert_eq!(merged.category, "hobbies");
        assert_eq!(merged.importance, 3);
        assert!(merged.tags.contains(&"games".to_string()));

        let mut sources = memories.sources_of(created[0]).await.unwrap();
        sources.sort_unstable();
        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(sources, expected);

        // Log payload agrees with the edge table.
        let mut logged = memories.logged_sources(created[0]).await.unwrap();
        logged.sort_unstable();
        assert_eq!(logged, expected);

        for id in ids {
            let original = memories.get_any(id).await.unwrap().unwrap();
            assert!(original.is_consolidated);
        }
    }

    #[tokio::test]
    async fn dissimilar_memories_produce_no_clusters() {
        let (memories, vectors, consolidator) = setup(ConsolidationConfig::default()).await;

        for (content, embedding) in [
            ("likes pasta", vec![1.0f32, 0.0, 0.0]),
            ("plays violin", vec![0.0, 1.0, 0.0]),
            ("fears spiders", vec![0.0, 0.0, 1.0]),
        ] {
            let id = memories.add(NewMemory::new(1, content)).await.unwrap();
            vectors.upsert(id, embedding).await.unwrap();
        }

        assert!(consolidator.run(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memories_without_embeddings_are_skipped() {
        let (memories, _vectors, consolidator) = setup(ConsolidationConfig::default()).await;
        memories.add(NewMemory::new(1, "no embedding a")).await.unwrap();
        memories.add(NewMemory::new(1, "no embedding b")).await.unwrap();

        assert!(consolidator.run(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_originals_false_leaves_sources_unflagged() {
        let config = ConsolidationConfig {
            mark_originals: false,
            max_consolidations: 1,
            ..Default::default()
        };
        let (memories, vectors, consolidator) = setup(config).await;

        let mut ids = Vec::new();
        for content in ["chess on mondays", "chess on fridays"] {
            let id = memories.add(NewMemory::new(1, content)).await.unwrap();
            vectors.upsert(id, vec![1.0, 0.0, 0.0]).await.unwrap();
            ids.push(id);
        }

        let created = consolidator.run(1).await.unwrap();
        assert_eq!(created.len(), 1);

        for id in ids {
            let original = memories.get_any(id).await.unwrap().unwrap();
            assert!(!original.is_consolidated);
        }
        // Edges are still recorded either way.
        assert_eq!(memories.sources_of(created[0]).await.unwrap().len(), 2);
    }

    #[test]
    fn merged_category_prefers_unique_then_mode() {
        use mnemo_db::MemoryRecord;

        fn record(category: &str) -> MemoryRecord {
            MemoryRecord {
                memory_id: 1,
                user_id: 1,
                content: String::new(),
                category: category.to_string(),
                importance: 3,
                source: MemorySource::Explicit,
                context: None,
                confidence: 1.0,
                expires_at: None,
                recall_count: 0,
                last_reinforced: None,
                is_consolidated: false,
                last_accessed: None,
                created_at: chrono::Utc::now(),
                tags: Vec::new(),
            }
        }

        assert_eq!(merged_category(&[record("hobbies"), record("hobbies")]), "hobbies");
        assert_eq!(
            merged_category(&[record("hobbies"), record("hobbies"), record("food")]),
            "hobbies"
        );
        // Tie broken deterministically.
        assert_eq!(merged_category(&[record("b"), record("a")]), "a");
    }
}
