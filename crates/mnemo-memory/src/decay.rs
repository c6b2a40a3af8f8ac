use mnemo_common::Result;
use mnemo_config::DecayConfig;
use mnemo_db::MemoryStore;
use tracing::{info, warn};

/// Gradually lowers the importance of old, rarely recalled memories.
///
/// Decay is monotonic: it only ever lowers importance, never raises it, and
/// never below 1. Consolidated memories are exempt.
pub struct DecayEngine {
    memories: MemoryStore,
    config: DecayConfig,
}

impl DecayEngine {
    pub fn new(memories: MemoryStore, config: DecayConfig) -> Self {
        Self { memories, config }
    }

    /// Apply one decay pass to a user's memories. Returns how many memories
    /// actually lost importance.
    pub async fn apply(&self, user_id: i64) -> Result<usize> {
        let factor = self.config.decay_factor.clamp(0.5, 0.95);
        let candidates = self
            .memories
            .decay_candidates(
                user_id,
                self.config.min_age_days,
                self.config.min_importance,
                self.config.max_per_run,
            )
            .await?;

        if candidates.is_empty() {
            return Ok(0);
        }

        let mut decayed = 0;
        for memory in candidates {
            let new_importance = ((memory.importance as f64 * factor).floor() as i64).max(1);
            if new_importance >= memory.importance {
                continue;
            }
            match self
                .memories
                .decay_importance(memory.memory_id, new_importance)
                .await
            {
                Ok(()) => decayed += 1,
                Err(e) => warn!(
                    memory_id = memory.memory_id,
                    "failed to decay memory: {e}"
                ),
            }
        }

        if decayed > 0 {
            info!(user_id, decayed, "applied memory decay");
        }
        Ok(decayed)
    }

    /// Run decay for every user that owns memories. Returns
    /// `(users_processed, total_decayed)`.
    pub async fn apply_all(&self) -> Result<(usize, usize)> {
        let user_ids = self.memories.distinct_user_ids().await?;
        let mut total = 0;
        for user_id in &user_ids {
            match self.apply(*user_id).await {
                Ok(count) => total += count,
                Err(e) => warn!(user_id, "decay failed for user: {e}"),
            }
        }
        Ok((user_ids.len(), total))
    }
}

#[cfg(test)]
mod tests {
    use mnemo_config::DecayConfig;
    use mnemo_db::{Database, MemoryStore, NewMemory, UserStore};

    use super::DecayEngine;

    async fn setup() -> (Database, MemoryStore) {
        let db = Database::in_memory().unwrap();
        UserStore::new(db.clone())
            .ensure(1, None, None, None, None)
            .await
            .unwrap();
        (db.clone(), MemoryStore::new(db))
    }

    async fn backdate(db: &Database, memory_id: i64, days: i64) {
        db.with_conn(move |conn| {
            conn.execute(
                "UPDATE memories SET created_at = datetime('now', ?1),
                        last_accessed = datetime('now', ?1)
                 WHERE memory_id = ?2",
                rusqlite::params![format!("-{days} days"), memory_id],
            )
            .map_err(|e| mnemo_common::Error::Connection(e.to_string()))?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn old_memory_decays_and_gains_audit_note() {
        let (db, memories) = setup().await;
        let id = memories
            .add(NewMemory::new(1, "old hobby").importance(3))
            .await
            .unwrap();
        backdate(&db, id, 60).await;

        let engine = DecayEngine::new(memories.clone(), DecayConfig::default());
        assert_eq!(engine.apply(1).await.unwrap(), 1);

        let memory = memories.get_any(id).await.unwrap().unwrap();
        assert_eq!(memory.importance, 2); // floor(3 * 0.9)
        assert_eq!(
            memory.context.as_deref(),
            Some("Importance decayed to 2")
        );
    }

    #[tokio::test]
    async fn fresh_memories_are_untouched() {
        let (_db, memories) = setup().await;
        memories
            .add(NewMemory::new(1, "new fact").importance(4))
            .await
            .unwrap();

        let engine = DecayEngine::new(memories.clone(), DecayConfig::default());
        assert_eq!(engine.apply(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn importance_never_drops_below_one() {
        let (db, memories) = setup().await;
        let id = memories
            .add(NewMemory::new(1, "barely matters").importance(2))
            .await
            .unwrap();
        backdate(&db, id, 60).await;

        let config = DecayConfig {
            decay_factor: 0.5,
            min_importance: 1,
            ..Default::default()
        };
        let engine = DecayEngine::new(memories.clone(), config);
        engine.apply(1).await.unwrap();

        let memory = memories.get_any(id).await.unwrap().unwrap();
        assert_eq!(memory.importance, 1);

        // A second pass cannot push it lower, and reports no decay.
        backdate(&db, id, 60).await;
        assert_eq!(engine.apply(1).await.unwrap(), 0);
        assert_eq!(memories.get_any(id).await.unwrap().unwrap().importance, 1);
    }

    #[tokio::test]
    async fn consolidated_memories_are_exempt() {
        let (db, memories) = setup().await;
        let source = memories
            .add(NewMemory::new(1, "source").importance(3))
            .await
            .unwrap();
        let merged = memories
            .add(NewMemory::new(1, "merged").importance(3))
            .await
            .unwrap();
        memories.mark_consolidated(source, merged, true).await.unwrap();
        backdate(&db, source, 60).await;

        let engine = DecayEngine::new(memories.clone(), DecayConfig::default());
        assert_eq!(engine.apply(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn apply_all_visits_every_user() {
        let (db, memories) = setup().await;
        UserStore::new(db.clone())
            .ensure(2, None, None, None, None)
            .await
            .unwrap();

        let a = memories
            .add(NewMemory::new(1, "u1 fact").importance(4))
            .await
            .unwrap();
        let b = memories
            .add(NewMemory::new(2, "u2 fact").importance(4))
            .await
            .unwrap();
        backdate(&db, a, 60).await;
        backdate(&db, b, 60).await;

        let engine = DecayEngine::new(memories, DecayConfig::default());
        let (users, total) = engine.apply_all().await.unwrap();
        assert_eq!(users, 2);
        assert_eq!(total, 2);
    }
}
