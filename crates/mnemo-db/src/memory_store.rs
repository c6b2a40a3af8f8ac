use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use mnemo_common::{Error, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pool::{Database, map_sql_error};

/// Upper bound on the `context` audit trail; oldest annotations are dropped
/// past this so repeated decay/consolidation notes cannot grow unbounded.
const CONTEXT_AUDIT_MAX_CHARS: usize = 1024;

const MEMORY_COLUMNS: &str = "m.memory_id, m.user_id, m.content, m.category, m.importance, \
     m.source, m.context, m.confidence, m.expires_at, m.recall_count, m.last_reinforced, \
     m.is_consolidated, m.last_accessed, m.created_at";

/// A persisted fact about a user. Snapshots are immutable; mutations go back
/// through [`MemoryStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: i64,
    pub user_id: i64,
    pub content: String,
    pub category: String,
    pub importance: i64,
    pub source: MemorySource,
    pub context: Option<String>,
    pub confidence: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub recall_count: i64,
    pub last_reinforced: Option<DateTime<Utc>>,
    pub is_consolidated: bool,
    pub last_accessed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// Insert shape for new memories before persistence assigns an id.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub user_id: i64,
    pub content: String,
    pub category: String,
    pub importance: i64,
    pub source: MemorySource,
    pub context: Option<String>,
    pub confidence: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub is_consolidated: bool,
}

impl NewMemory {
    pub fn new(user_id: i64, content: impl Into<String>) -> Self {
        Self {
            user_id,
            content: content.into(),
            category: "general".to_string(),
            importance: 1,
            source: MemorySource::Explicit,
            context: None,
            confidence: 1.0,
            expires_at: None,
            tags: Vec::new(),
            is_consolidated: false,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn importance(mut self, importance: i64) -> Self {
        self.importance = importance;
        self
    }

    pub fn source(mut self, source: MemorySource) -> Self {
        self.source = source;
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Explicit,
    Extracted,
    Inferred,
    Consolidation,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Extracted => "extracted",
            Self::Inferred => "inferred",
            Self::Consolidation => "consolidation",
        }
    }

    fn from_db(value: &str) -> Result<Self> {
        match value {
            "explicit" => Ok(Self::Explicit),
            "extracted" => Ok(Self::Extracted),
            "inferred" => Ok(Self::Inferred),
            "consolidation" | "consolidated" => Ok(Self::Consolidation),
            other => Err(Error::query(
                "memories.source",
                format!("unknown memory source: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemorySort {
    #[default]
    Importance,
    Confidence,
    Recency,
    RecallCount,
}

/// Filters recognized by [`MemoryStore::list`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub category: Option<String>,
    pub min_importance: i64,
    pub max_importance: Option<i64>,
    pub min_confidence: f64,
    pub include_expired: bool,
    pub tags: Vec<String>,
    pub sort: MemorySort,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_type: String,
    pub strength: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedMemory {
    pub memory: MemoryRecord,
    pub relationship: Relationship,
}

/// Typed operations over memories, tags, relationships, consolidation edges,
/// and per-category summaries.
#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
}

impl MemoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a memory, or reinforce the existing row when the exact
    /// (user, content) pair is already stored. Reinforcement keeps the higher
    /// importance, nudges confidence up, and bumps the recall count.
    pub async fn add(&self, memory: NewMemory) -> Result<i64> {
        let mut memory = memory;
        memory.importance = memory.importance.clamp(1, 5);
        memory.confidence = memory.confidence.clamp(0.0, 1.0);

        self.db
            .with_tx(move |tx| {
                let now = Utc::now().to_rfc3339();
                let existing: Option<(i64, i64, f64, i64)> = tx
                    .query_row(
                        "SELECT memory_id, importance, confidence, recall_count
                         FROM memories WHERE user_id = ?1 AND content = ?2",
                        params![memory.user_id, memory.content],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(map_sql_error("select existing memory")(other)),
                    })?;

                let memory_id = match existing {
                    Some((memory_id, old_importance, old_confidence, recall_count)) => {
                        let new_importance = old_importance.max(memory.importance);
                        let new_confidence =
                            (old_confidence + memory.confidence * 0.1).min(1.0);
                        tx.execute(
                            "UPDATE memories SET
                                importance = ?1,
                                confidence = ?2,
                                recall_count = ?3,
                                last_accessed = ?4,
                                last_reinforced = ?4
                             WHERE memory_id = ?5",
                            params![
                                new_importance,
                                new_confidence,
                                recall_count + 1,
                                now,
                                memory_id
                            ],
                        )
                        .map_err(map_sql_error("reinforce memory"))?;
                        info!(user_id = memory.user_id, memory_id, "reinforced existing memory");
                        memory_id
                    }
                    None => {
                        // The initial add counts as the first recall.
                        tx.execute(
                            "INSERT INTO memories
                                (user_id, content, category, importance, source, context,
                                 confidence, expires_at, is_consolidated, recall_count,
                                 last_accessed, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
                            params![
                                memory.user_id,
                                memory.content,
                                memory.category,
                                memory.importance,
                                memory.source.as_str(),
                                memory.context,
                                memory.confidence,
                                memory.expires_at.map(|t| t.to_rfc3339()),
                                memory.is_consolidated,
                                now,
                            ],
                        )
                        .map_err(map_sql_error("insert memory"))?;
                        let memory_id = tx.last_insert_rowid();
                        info!(
                            user_id = memory.user_id,
                            memory_id,
                            category = %memory.category,
                            "added new memory"
                        );
                        memory_id
                    }
                };

                attach_tags(tx, memory.user_id, memory_id, &memory.tags)?;
                Ok(memory_id)
            })
            .await
    }

    pub async fn get(&self, user_id: i64, memory_id: i64) -> Result<Option<MemoryRecord>> {
        let found = self
            .db
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories m
                     WHERE m.memory_id = ?1 AND m.user_id = ?2"
                );
                let mut rows = query_memories(conn, &sql, params![memory_id, user_id])?;
                if rows.is_empty() {
                    return Ok(None);
                }
                touch_memories(conn, &[memory_id])?;
                Ok(Some(rows.remove(0)))
            })
            .await?;
        Ok(found)
    }

    /// Fetch without a user scope check. Used internally when following
    /// consolidation edges, which may reference a different owner's view.
    pub async fn get_any(&self, memory_id: i64) -> Result<Option<MemoryRecord>> {
        self.db
            .with_conn(move |conn| {
                let sql =
                    format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.memory_id = ?1");
                let mut rows = query_memories(conn, &sql, params![memory_id])?;
                Ok(if rows.is_empty() {
                    None
                } else {
                    Some(rows.remove(0))
                })
            })
            .await
    }

    /// Query memories with filtering and sorting. Every returned row has its
    /// `last_accessed` refreshed; recall counts are only bumped by explicit
    /// reinforcement.
    pub async fn list(&self, user_id: i64, filter: MemoryFilter) -> Result<Vec<MemoryRecord>> {
        self.db
            .with_conn(move |conn| {
                let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m");
                let mut values: Vec<Value> = Vec::new();

                if !filter.tags.is_empty() {
                    sql.push_str(
                        " JOIN memory_tag_associations mta ON m.memory_id = mta.memory_id
                          JOIN memory_tags mt ON mta.tag_id = mt.tag_id",
                    );
                }

                sql.push_str(" WHERE m.user_id = ? AND m.importance >= ? AND m.confidence >= ?");
                values.push(Value::Integer(user_id));
                values.push(Value::Integer(filter.min_importance));
                values.push(Value::Real(filter.min_confidence));

                if let Some(category) = &filter.category {
                    sql.push_str(" AND m.category = ?");
                    values.push(Value::Text(category.clone()));
                }
                if let Some(max_importance) = filter.max_importance {
                    sql.push_str(" AND m.importance <= ?");
                    values.push(Value::Integer(max_importance));
                }
                if !filter.include_expired {
                    sql.push_str(
                        " AND (m.expires_at IS NULL OR datetime(m.expires_at) > datetime('now'))",
                    );
                }
                if !filter.tags.is_empty() {
                    let placeholders = vec!["?"; filter.tags.len()].join(", ");
                    sql.push_str(&format!(" AND mt.tag_name IN ({placeholders})"));
                    for tag in &filter.tags {
                        values.push(Value::Text(tag.clone()));
                    }
                    // All-of semantics: a memory matches only when it carries
                    // every requested tag.
                    sql.push_str(" GROUP BY m.memory_id HAVING COUNT(DISTINCT mt.tag_name) = ?");
                    values.push(Value::Integer(filter.tags.len() as i64));
                }

                sql.push_str(match filter.sort {
                    MemorySort::Importance => {
                        " ORDER BY m.importance DESC, datetime(m.last_accessed) DESC, m.memory_id DESC"
                    }
                    MemorySort::Confidence => {
                        " ORDER BY m.confidence DESC, m.importance DESC, m.memory_id DESC"
                    }
                    MemorySort::Recency => {
                        " ORDER BY datetime(m.last_accessed) DESC, m.memory_id DESC"
                    }
                    MemorySort::RecallCount => {
                        " ORDER BY m.recall_count DESC, m.importance DESC, m.memory_id DESC"
                    }
                });

                if let Some(limit) = filter.limit {
                    sql.push_str(" LIMIT ?");
                    values.push(Value::Integer(limit as i64));
                }

                let memories = query_memories_dyn(conn, &sql, values)?;
                let ids: Vec<i64> = memories.iter().map(|m| m.memory_id).collect();
                touch_memories(conn, &ids)?;
                Ok(memories)
            })
            .await
    }

    /// Plain substring scan over memory contents.
    pub async fn search_keyword(
        &self,
        user_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let pattern = format!("%{}%", query.trim());
        self.db
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories m
                     WHERE m.user_id = ?1 AND m.content LIKE ?2
                     ORDER BY m.importance DESC, m.memory_id DESC
                     LIMIT ?3"
                );
                let memories =
                    query_memories(conn, &sql, params![user_id, pattern, limit as i64])?;
                let ids: Vec<i64> = memories.iter().map(|m| m.memory_id).collect();
                touch_memories(conn, &ids)?;
                Ok(memories)
            })
            .await
    }

    /// Delete a memory after checking ownership. Embeddings, tag edges, and
    /// consolidation edges go with it via cascade.
    pub async fn delete(&self, user_id: i64, memory_id: i64) -> Result<bool> {
        self.db
            .with_tx(move |tx| {
                let owner: Option<i64> = tx
                    .query_row(
                        "SELECT user_id FROM memories WHERE memory_id = ?1",
                        params![memory_id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(map_sql_error("select memory owner")(other)),
                    })?;

                match owner {
                    None => Ok(false),
                    Some(owner) if owner != user_id => Err(Error::Unauthorized(format!(
                        "memory {memory_id} does not belong to user {user_id}"
                    ))),
                    Some(_) => {
                        tx.execute(
                            "DELETE FROM memories WHERE memory_id = ?1",
                            params![memory_id],
                        )
                        .map_err(map_sql_error("delete memory"))?;
                        Ok(true)
                    }
                }
            })
            .await
    }

    /// Refresh `last_accessed` for a set of memories.
    pub async fn touch(&self, memory_ids: Vec<i64>) -> Result<()> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        self.db
            .with_conn(move |conn| touch_memories(conn, &memory_ids))
            .await
    }

    /// Write a new importance value directly. The caller is responsible for
    /// clamping; used by usage-based reinforcement.
    pub async fn set_importance(&self, memory_id: i64, importance: i64) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE memories SET importance = ?1 WHERE memory_id = ?2",
                    params![importance, memory_id],
                )
                .map_err(map_sql_error("update memory importance"))?;
                Ok(())
            })
            .await
    }

    /// Lower a memory's importance and append an audit note to its context.
    pub async fn decay_importance(&self, memory_id: i64, new_importance: i64) -> Result<()> {
        self.db
            .with_tx(move |tx| {
                let context: Option<String> = tx
                    .query_row(
                        "SELECT context FROM memories WHERE memory_id = ?1",
                        params![memory_id],
                        |row| row.get(0),
                    )
                    .map_err(map_sql_error("select memory context"))?;

                let note = format!("Importance decayed to {new_importance}");
                let context = append_context_note(context, &note);
                tx.execute(
                    "UPDATE memories SET importance = ?1, context = ?2 WHERE memory_id = ?3",
                    params![new_importance, context, memory_id],
                )
                .map_err(map_sql_error("decay memory importance"))?;
                Ok(())
            })
            .await
    }

    /// Memories eligible for decay: old enough, important enough, never
    /// consolidated, least-recently-used first.
    pub async fn decay_candidates(
        &self,
        user_id: i64,
        min_age_days: i64,
        min_importance: i64,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let cutoff = (Utc::now() - chrono::Duration::days(min_age_days)).to_rfc3339();
        self.db
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories m
                     WHERE m.user_id = ?1
                       AND m.importance >= ?2
                       AND datetime(m.created_at) < datetime(?3)
                       AND m.is_consolidated = 0
                     ORDER BY datetime(m.last_accessed) ASC, m.recall_count ASC,
                              datetime(m.created_at) ASC
                     LIMIT ?4"
                );
                query_memories(conn, &sql, params![user_id, min_importance, cutoff, limit as i64])
            })
            .await
    }

    /// Record a consolidation edge from a source memory to the memory that
    /// replaced it. When `mark_source` is set, the source is also flagged
    /// and its context gains a pointer to the consolidated memory.
    pub async fn mark_consolidated(
        &self,
        memory_id: i64,
        consolidated_memory_id: i64,
        mark_source: bool,
    ) -> Result<()> {
        self.db
            .with_tx(move |tx| {
                if mark_source {
                    let context: Option<String> = tx
                        .query_row(
                            "SELECT context FROM memories WHERE memory_id = ?1",
                            params![memory_id],
                            |row| row.get(0),
                        )
                        .map_err(map_sql_error("select memory context"))?;
                    let note = format!("Consolidated into memory {consolidated_memory_id}");
                    let context = append_context_note(context, &note);
                    tx.execute(
                        "UPDATE memories SET is_consolidated = 1, context = ?1 WHERE memory_id = ?2",
                        params![context, memory_id],
                    )
                    .map_err(map_sql_error("mark memory consolidated"))?;
                }

                tx.execute(
                    "INSERT OR IGNORE INTO memory_consolidations
                        (original_memory_id, consolidated_memory_id)
                     VALUES (?1, ?2)",
                    params![memory_id, consolidated_memory_id],
                )
                .map_err(map_sql_error("insert consolidation edge"))?;
                Ok(())
            })
            .await
    }

    /// Original memory ids behind a consolidated memory.
    pub async fn sources_of(&self, consolidated_memory_id: i64) -> Result<Vec<i64>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT original_memory_id FROM memory_consolidations
                         WHERE consolidated_memory_id = ?1
                         ORDER BY original_memory_id",
                    )
                    .map_err(map_sql_error("prepare consolidation sources"))?;
                let ids = stmt
                    .query_map(params![consolidated_memory_id], |row| row.get(0))
                    .map_err(map_sql_error("query consolidation sources"))?
                    .collect::<std::result::Result<Vec<i64>, _>>()
                    .map_err(map_sql_error("collect consolidation sources"))?;
                Ok(ids)
            })
            .await
    }

    pub async fn log_consolidation(
        &self,
        user_id: i64,
        source_ids: &[i64],
        consolidated_memory_id: i64,
        consolidation_type: &str,
    ) -> Result<i64> {
        let sources_json = serde_json::to_string(source_ids)?;
        let consolidation_type = consolidation_type.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO memory_consolidation_log
                        (user_id, source_memories, consolidated_memory_id, consolidation_type)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, sources_json, consolidated_memory_id, consolidation_type],
                )
                .map_err(map_sql_error("insert consolidation log"))?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Source ids recorded in the consolidation log for a consolidated
    /// memory, decoded from the persisted JSON list.
    pub async fn logged_sources(&self, consolidated_memory_id: i64) -> Result<Vec<i64>> {
        self.db
            .with_conn(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT source_memories FROM memory_consolidation_log
                         WHERE consolidated_memory_id = ?1
                         ORDER BY log_id DESC LIMIT 1",
                        params![consolidated_memory_id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(map_sql_error("select consolidation log")(other)),
                    })?;
                match raw {
                    Some(raw) => Ok(serde_json::from_str(&raw)?),
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    /// Create or strengthen a directed relationship between two memories.
    pub async fn add_relationship(
        &self,
        source_memory_id: i64,
        target_memory_id: i64,
        relationship_type: &str,
        strength: f64,
    ) -> Result<()> {
        let relationship_type = relationship_type.to_string();
        let strength = strength.clamp(0.0, 1.0);
        self.db
            .with_conn(move |conn| {
                let updated = conn
                    .execute(
                        "UPDATE memory_relationships SET strength = ?1
                         WHERE source_memory_id = ?2 AND target_memory_id = ?3
                           AND relationship_type = ?4",
                        params![strength, source_memory_id, target_memory_id, relationship_type],
                    )
                    .map_err(map_sql_error("update relationship"))?;
                if updated == 0 {
                    conn.execute(
                        "INSERT INTO memory_relationships
                            (source_memory_id, target_memory_id, relationship_type, strength)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![source_memory_id, target_memory_id, relationship_type, strength],
                    )
                    .map_err(map_sql_error("insert relationship"))?;
                }
                Ok(())
            })
            .await
    }

    /// Direct neighbors of a memory in both directions. Graph queries are
    /// bounded to depth 1; no traversal.
    pub async fn related(
        &self,
        memory_id: i64,
        relationship_type: Option<String>,
        min_strength: f64,
    ) -> Result<Vec<RelatedMemory>> {
        self.db
            .with_conn(move |conn| {
                let mut results = Vec::new();
                for (sql_direction, direction) in [
                    (
                        format!(
                            "SELECT {MEMORY_COLUMNS}, r.relationship_type, r.strength
                             FROM memories m
                             JOIN memory_relationships r ON m.memory_id = r.target_memory_id
                             WHERE r.source_memory_id = ?1 AND r.strength >= ?2"
                        ),
                        Direction::Outgoing,
                    ),
                    (
                        format!(
                            "SELECT {MEMORY_COLUMNS}, r.relationship_type, r.strength
                             FROM memories m
                             JOIN memory_relationships r ON m.memory_id = r.source_memory_id
                             WHERE r.target_memory_id = ?1 AND r.strength >= ?2"
                        ),
                        Direction::Incoming,
                    ),
                ] {
                    let mut sql = sql_direction;
                    let mut values: Vec<Value> = vec![
                        Value::Integer(memory_id),
                        Value::Real(min_strength),
                    ];
                    if let Some(kind) = &relationship_type {
                        sql.push_str(" AND r.relationship_type = ?3");
                        values.push(Value::Text(kind.clone()));
                    }
                    sql.push_str(" ORDER BY r.strength DESC, m.memory_id DESC");

                    let mut stmt = conn.prepare(&sql).map_err(map_sql_error("prepare related"))?;
                    let rows = stmt
                        .query_map(params_from_iter(values), |row| {
                            let memory = row_to_memory(row)?;
                            let relationship_type: String = row.get(14)?;
                            let strength: f64 = row.get(15)?;
                            Ok((memory, relationship_type, strength))
                        })
                        .map_err(map_sql_error("query related"))?
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(map_sql_error("collect related"))?;

                    for (mut memory, relationship_type, strength) in rows {
                        memory.tags = load_tags(conn, memory.memory_id)?;
                        results.push(RelatedMemory {
                            memory,
                            relationship: Relationship {
                                relationship_type,
                                strength,
                                direction,
                            },
                        });
                    }
                }
                Ok(results)
            })
            .await
    }

    /// Upsert the single summary row for (user, category).
    pub async fn upsert_summary(&self, user_id: i64, category: &str, summary: &str) -> Result<()> {
        let category = category.to_string();
        let summary = summary.to_string();
        self.db
            .with_conn(move |conn| {
                let updated = conn
                    .execute(
                        "UPDATE memory_summaries
                         SET summary = ?1, last_updated = datetime('now')
                         WHERE user_id = ?2 AND category = ?3",
                        params![summary, user_id, category],
                    )
                    .map_err(map_sql_error("update summary"))?;
                if updated == 0 {
                    conn.execute(
                        "INSERT INTO memory_summaries (user_id, summary, category)
                         VALUES (?1, ?2, ?3)",
                        params![user_id, summary, category],
                    )
                    .map_err(map_sql_error("insert summary"))?;
                }
                Ok(())
            })
            .await
    }

    pub async fn summary(&self, user_id: i64, category: Option<&str>) -> Result<Option<String>> {
        let category = category.map(|c| c.to_string());
        self.db
            .with_conn(move |conn| {
                let mut sql =
                    "SELECT summary FROM memory_summaries WHERE user_id = ?".to_string();
                let mut values: Vec<Value> = vec![Value::Integer(user_id)];
                if let Some(category) = &category {
                    sql.push_str(" AND category = ?");
                    values.push(Value::Text(category.clone()));
                }
                sql.push_str(" ORDER BY last_updated DESC LIMIT 1");

                let mut stmt = conn.prepare(&sql).map_err(map_sql_error("prepare summary"))?;
                let summary = stmt
                    .query_row(params_from_iter(values), |row| row.get(0))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(map_sql_error("query summary")(other)),
                    })?;
                Ok(summary)
            })
            .await
    }

    /// Every user id that owns at least one memory.
    pub async fn distinct_user_ids(&self) -> Result<Vec<i64>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT DISTINCT user_id FROM memories ORDER BY user_id")
                    .map_err(map_sql_error("prepare distinct users"))?;
                let ids = stmt
                    .query_map([], |row| row.get(0))
                    .map_err(map_sql_error("query distinct users"))?
                    .collect::<std::result::Result<Vec<i64>, _>>()
                    .map_err(map_sql_error("collect distinct users"))?;
                Ok(ids)
            })
            .await
    }
}

fn attach_tags(
    tx: &rusqlite::Transaction<'_>,
    user_id: i64,
    memory_id: i64,
    tags: &[String],
) -> Result<()> {
    for tag_name in tags {
        let tag_id: i64 = match tx.query_row(
            "SELECT tag_id FROM memory_tags WHERE user_id = ?1 AND tag_name = ?2",
            params![user_id, tag_name],
            |row| row.get(0),
        ) {
            Ok(id) => id,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                tx.execute(
                    "INSERT INTO memory_tags (user_id, tag_name) VALUES (?1, ?2)",
                    params![user_id, tag_name],
                )
                .map_err(map_sql_error("insert tag"))?;
                tx.last_insert_rowid()
            }
            Err(e) => return Err(map_sql_error("select tag")(e)),
        };

        tx.execute(
            "INSERT OR IGNORE INTO memory_tag_associations (memory_id, tag_id) VALUES (?1, ?2)",
            params![memory_id, tag_id],
        )
        .map_err(map_sql_error("associate tag"))?;
    }
    Ok(())
}

fn touch_memories(conn: &Connection, memory_ids: &[i64]) -> Result<()> {
    if memory_ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; memory_ids.len()].join(", ");
    let sql = format!(
        "UPDATE memories SET last_accessed = datetime('now') WHERE memory_id IN ({placeholders})"
    );
    conn.execute(
        &sql,
        params_from_iter(memory_ids.iter().map(|id| Value::Integer(*id))),
    )
    .map_err(map_sql_error("touch memories"))?;
    Ok(())
}

fn load_tags(conn: &Connection, memory_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT mt.tag_name
             FROM memory_tag_associations mta
             JOIN memory_tags mt ON mta.tag_id = mt.tag_id
             WHERE mta.memory_id = ?1
             ORDER BY mt.tag_name",
        )
        .map_err(map_sql_error("prepare tag load"))?;
    let tags = stmt
        .query_map(params![memory_id], |row| row.get(0))
        .map_err(map_sql_error("query tags"))?
        .collect::<std::result::Result<Vec<String>, _>>()
        .map_err(map_sql_error("collect tags"))?;
    Ok(tags)
}

fn load_tags_for(conn: &Connection, memory_ids: &[i64]) -> Result<HashMap<i64, Vec<String>>> {
    let mut by_memory: HashMap<i64, Vec<String>> = HashMap::new();
    if memory_ids.is_empty() {
        return Ok(by_memory);
    }
    let placeholders = vec!["?"; memory_ids.len()].join(", ");
    let sql = format!(
        "SELECT mta.memory_id, mt.tag_name
         FROM memory_tag_associations mta
         JOIN memory_tags mt ON mta.tag_id = mt.tag_id
         WHERE mta.memory_id IN ({placeholders})
         ORDER BY mt.tag_name"
    );
    let mut stmt = conn.prepare(&sql).map_err(map_sql_error("prepare batch tags"))?;
    let rows = stmt
        .query_map(
            params_from_iter(memory_ids.iter().map(|id| Value::Integer(*id))),
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .map_err(map_sql_error("query batch tags"))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(map_sql_error("collect batch tags"))?;
    for (memory_id, tag) in rows {
        by_memory.entry(memory_id).or_default().push(tag);
    }
    Ok(by_memory)
}

fn query_memories<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare(sql).map_err(map_sql_error(sql))?;
    let mut memories = stmt
        .query_map(params, row_to_memory)
        .map_err(map_sql_error(sql))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(map_sql_error(sql))?;
    hydrate_tags(conn, &mut memories)?;
    Ok(memories)
}

fn query_memories_dyn(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare(sql).map_err(map_sql_error(sql))?;
    let mut memories = stmt
        .query_map(params_from_iter(values), row_to_memory)
        .map_err(map_sql_error(sql))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(map_sql_error(sql))?;
    hydrate_tags(conn, &mut memories)?;
    Ok(memories)
}

fn hydrate_tags(conn: &Connection, memories: &mut [MemoryRecord]) -> Result<()> {
    let ids: Vec<i64> = memories.iter().map(|m| m.memory_id).collect();
    let mut tags = load_tags_for(conn, &ids)?;
    for memory in memories {
        memory.tags = tags.remove(&memory.memory_id).unwrap_or_default();
    }
    Ok(())
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let source_raw: String = row.get(5)?;
    let source = MemorySource::from_db(&source_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(e.to_string())),
        )
    })?;

    Ok(MemoryRecord {
        memory_id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3)?,
        importance: row.get(4)?,
        source,
        context: row.get(6)?,
        confidence: row.get(7)?,
        expires_at: parse_optional_timestamp(row.get::<_, Option<String>>(8)?),
        recall_count: row.get(9)?,
        last_reinforced: parse_optional_timestamp(row.get::<_, Option<String>>(10)?),
        is_consolidated: row.get(11)?,
        last_accessed: parse_optional_timestamp(row.get::<_, Option<String>>(12)?),
        created_at: parse_optional_timestamp(Some(row.get::<_, String>(13)?))
            .unwrap_or_else(Utc::now),
        tags: Vec::new(),
    })
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        .ok()
}

/// Append an audit note, dropping the oldest notes once the trail exceeds
/// the cap.
fn append_context_note(context: Option<String>, note: &str) -> String {
    let mut combined = match context {
        Some(existing) if !existing.is_empty() => format!("{existing} | {note}"),
        _ => note.to_string(),
    };
    while combined.len() > CONTEXT_AUDIT_MAX_CHARS {
        match combined.split_once(" | ") {
            Some((_, rest)) => combined = rest.to_string(),
            None => {
                let excess = combined.len() - CONTEXT_AUDIT_MAX_CHARS;
                let cut = combined
                    .char_indices()
                    .map(|(i, _)| i)
                    .find(|&i| i >= excess)
                    .unwrap_or(0);
                combined = combined[cut..].to_string();
                break;
            }
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::{MemoryFilter, MemorySort, MemorySource, MemoryStore, NewMemory};
    use crate::pool::Database;
    use crate::users::UserStore;

    async fn store_with_user(user_id: i64) -> (Database, MemoryStore) {
        let db = Database::in_memory().expect("in-memory database should open");
        let users = UserStore::new(db.clone());
        users
            .ensure(user_id, Some("tester"), None, None, None)
            .await
            .expect("user should be created");
        (db.clone(), MemoryStore::new(db))
    }

    #[tokio::test]
    async fn add_then_get_round_trips_fields() {
        let (_db, store) = store_with_user(1).await;
        let memory_id = store
            .add(
                NewMemory::new(1, "I have a dog named Max")
                    .category("pets")
                    .importance(3)
                    .tags(vec!["animals".into(), "dog".into()]),
            )
            .await
            .expect("add should succeed");

        let memory = store
            .get(1, memory_id)
            .await
            .expect("get should succeed")
            .expect("memory should exist");
        assert_eq!(memory.content, "I have a dog named Max");
        assert_eq!(memory.category, "pets");
        assert_eq!(memory.importance, 3);
        assert_eq!(memory.tags, vec!["animals".to_string(), "dog".to_string()]);
        assert_eq!(memory.source, MemorySource::Explicit);
    }

    #[tokio::test]
    async fn duplicate_content_reinforces_instead_of_inserting() {
        let (_db, store) = store_with_user(1).await;
        let first = store
            .add(NewMemory::new(1, "I have a dog named Max").importance(2))
            .await
            .expect("first add should succeed");
        let second = store
            .add(NewMemory::new(1, "I have a dog named Max").importance(4))
            .await
            .expect("second add should succeed");
        assert_eq!(first, second);

        let memory = store
            .get(1, first)
            .await
            .expect("get should succeed")
            .expect("memory should exist");
        assert_eq!(memory.importance, 4);
        assert_eq!(memory.recall_count, 2);
        assert!(memory.last_reinforced.is_some());
        assert!(memory.confidence >= 1.0);

        let all = store
            .list(1, MemoryFilter::default())
            .await
            .expect("list should succeed");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn reinforcement_keeps_higher_existing_importance() {
        let (_db, store) = store_with_user(1).await;
        store
            .add(NewMemory::new(1, "fact").importance(5))
            .await
            .unwrap();
        let id = store
            .add(NewMemory::new(1, "fact").importance(2))
            .await
            .unwrap();
        let memory = store.get_any(id).await.unwrap().unwrap();
        assert_eq!(memory.importance, 5);
        assert_eq!(memory.recall_count, 2);
    }

    #[tokio::test]
    async fn importance_and_confidence_are_clamped_on_add() {
        let (_db, store) = store_with_user(1).await;
        let id = store
            .add(NewMemory::new(1, "loud fact").importance(99).confidence(7.0))
            .await
            .unwrap();
        let memory = store.get_any(id).await.unwrap().unwrap();
        assert_eq!(memory.importance, 5);
        assert_eq!(memory.confidence, 1.0);
    }

    #[tokio::test]
    async fn list_filters_by_tags_with_all_of_semantics() {
        let (_db, store) = store_with_user(1).await;
        store
            .add(NewMemory::new(1, "likes pasta").tags(vec!["food".into(), "italy".into()]))
            .await
            .unwrap();
        store
            .add(NewMemory::new(1, "likes sushi").tags(vec!["food".into()]))
            .await
            .unwrap();

        let both = store
            .list(
                1,
                MemoryFilter {
                    tags: vec!["food".into(), "italy".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].content, "likes pasta");

        let food = store
            .list(
                1,
                MemoryFilter {
                    tags: vec!["food".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(food.len(), 2);
    }

    #[tokio::test]
    async fn list_excludes_expired_by_default() {
        let (db, store) = store_with_user(1).await;
        let id = store.add(NewMemory::new(1, "short lived")).await.unwrap();
        db.with_conn(move |conn| {
            conn.execute(
                "UPDATE memories SET expires_at = datetime('now', '-1 day') WHERE memory_id = ?1",
                rusqlite::params![id],
            )
            .map_err(|e| mnemo_common::Error::Connection(e.to_string()))?;
            Ok(())
        })
        .await
        .unwrap();

        let visible = store.list(1, MemoryFilter::default()).await.unwrap();
        assert!(visible.is_empty());

        let all = store
            .list(
                1,
                MemoryFilter {
                    include_expired: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn list_sorts_by_importance_then_id_descending() {
        let (_db, store) = store_with_user(1).await;
        store
            .add(NewMemory::new(1, "minor").importance(1))
            .await
            .unwrap();
        store
            .add(NewMemory::new(1, "major").importance(5))
            .await
            .unwrap();
        store
            .add(NewMemory::new(1, "also major").importance(5))
            .await
            .unwrap();

        let sorted = store
            .list(
                1,
                MemoryFilter {
                    sort: MemorySort::Importance,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sorted[0].content, "also major");
        assert_eq!(sorted[1].content, "major");
        assert_eq!(sorted[2].content, "minor");
    }

    #[tokio::test]
    async fn list_refreshes_last_accessed_without_touching_recall_count() {
        let (_db, store) = store_with_user(1).await;
        let id = store.add(NewMemory::new(1, "tracked")).await.unwrap();

        store.list(1, MemoryFilter::default()).await.unwrap();
        let memory = store.get_any(id).await.unwrap().unwrap();
        assert!(memory.last_accessed.is_some());
        // Reads refresh recency but never count as recalls.
        assert_eq!(memory.recall_count, 1);
    }

    #[tokio::test]
    async fn delete_enforces_ownership() {
        let (db, store) = store_with_user(1).await;
        UserStore::new(db.clone())
            .ensure(2, None, None, None, None)
            .await
            .unwrap();
        let id = store.add(NewMemory::new(1, "private")).await.unwrap();

        let err = store.delete(2, id).await;
        assert!(matches!(err, Err(mnemo_common::Error::Unauthorized(_))));

        assert!(store.delete(1, id).await.unwrap());
        assert!(store.get_any(id).await.unwrap().is_none());
        assert!(!store.delete(1, id).await.unwrap());
    }

    #[tokio::test]
    async fn keyword_search_matches_substrings() {
        let (_db, store) = store_with_user(1).await;
        store.add(NewMemory::new(1, "I love pasta")).await.unwrap();
        store.add(NewMemory::new(1, "I play chess")).await.unwrap();

        let hits = store.search_keyword(1, "pasta", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "I love pasta");
    }

    #[tokio::test]
    async fn relationships_upsert_and_return_both_directions() {
        let (_db, store) = store_with_user(1).await;
        let a = store.add(NewMemory::new(1, "chess weekly")).await.unwrap();
        let b = store.add(NewMemory::new(1, "board games")).await.unwrap();

        store
            .add_relationship(a, b, "relates_to", 0.5)
            .await
            .unwrap();
        store
            .add_relationship(a, b, "relates_to", 0.9)
            .await
            .unwrap();

        let from_a = store.related(a, None, 0.0).await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].memory.memory_id, b);
        assert_eq!(from_a[0].relationship.strength, 0.9);
        assert_eq!(
            from_a[0].relationship.direction,
            super::Direction::Outgoing
        );

        let from_b = store.related(b, None, 0.0).await.unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].memory.memory_id, a);
        assert_eq!(
            from_b[0].relationship.direction,
            super::Direction::Incoming
        );
    }

    #[tokio::test]
    async fn consolidation_edges_and_log_round_trip() {
        let (_db, store) = store_with_user(1).await;
        let a = store.add(NewMemory::new(1, "one")).await.unwrap();
        let b = store.add(NewMemory::new(1, "two")).await.unwrap();
        let merged = store
            .add(
                NewMemory::new(1, "one and two")
                    .source(MemorySource::Consolidation),
            )
            .await
            .unwrap();

        store.mark_consolidated(a, merged, true).await.unwrap();
        store.mark_consolidated(b, merged, true).await.unwrap();
        store
            .log_consolidation(1, &[a, b], merged, "auto")
            .await
            .unwrap();

        let mut sources = store.sources_of(merged).await.unwrap();
        sources.sort_unstable();
        assert_eq!(sources, vec![a, b]);

        // Log payload must agree with the edge table.
        let mut logged = store.logged_sources(merged).await.unwrap();
        logged.sort_unstable();
        assert_eq!(logged, sources);

        let original = store.get_any(a).await.unwrap().unwrap();
        assert!(original.is_consolidated);
        assert!(
            original
                .context
                .unwrap()
                .contains(&format!("Consolidated into memory {merged}"))
        );
    }

    #[tokio::test]
    async fn summaries_upsert_one_row_per_category() {
        let (_db, store) = store_with_user(1).await;
        store.upsert_summary(1, "hobbies", "plays chess").await.unwrap();
        store
            .upsert_summary(1, "hobbies", "plays chess and go")
            .await
            .unwrap();

        let summary = store.summary(1, Some("hobbies")).await.unwrap();
        assert_eq!(summary.as_deref(), Some("plays chess and go"));
        assert!(store.summary(1, Some("food")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decay_candidates_respect_age_and_ordering() {
        let (db, store) = store_with_user(1).await;
        let old = store
            .add(NewMemory::new(1, "old fact").importance(3))
            .await
            .unwrap();
        store
            .add(NewMemory::new(1, "fresh fact").importance(3))
            .await
            .unwrap();
        db.with_conn(move |conn| {
            conn.execute(
                "UPDATE memories SET created_at = datetime('now', '-60 days'),
                        last_accessed = datetime('now', '-60 days')
                 WHERE memory_id = ?1",
                rusqlite::params![old],
            )
            .map_err(|e| mnemo_common::Error::Connection(e.to_string()))?;
            Ok(())
        })
        .await
        .unwrap();

        let candidates = store.decay_candidates(1, 30, 2, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].memory_id, old);
    }

    #[tokio::test]
    async fn decay_importance_appends_audit_note() {
        let (_db, store) = store_with_user(1).await;
        let id = store
            .add(NewMemory::new(1, "fading").importance(3))
            .await
            .unwrap();
        store.decay_importance(id, 2).await.unwrap();

        let memory = store.get_any(id).await.unwrap().unwrap();
        assert_eq!(memory.importance, 2);
        assert_eq!(
            memory.context.as_deref(),
            Some("Importance decayed to 2")
        );
    }

    #[tokio::test]
    async fn context_audit_trail_is_capped() {
        let mut context = None;
        for i in 0..200 {
            context = Some(super::append_context_note(
                context,
                &format!("Importance decayed to {i}"),
            ));
        }
        let trail = context.unwrap();
        assert!(trail.len() <= super::CONTEXT_AUDIT_MAX_CHARS);
        assert!(trail.ends_with("Importance decayed to 199"));
    }

    #[tokio::test]
    async fn distinct_user_ids_lists_memory_owners() {
        let (db, store) = store_with_user(1).await;
        UserStore::new(db.clone())
            .ensure(2, None, None, None, None)
            .await
            .unwrap();
        store.add(NewMemory::new(1, "a")).await.unwrap();
        store.add(NewMemory::new(2, "b")).await.unwrap();

        assert_eq!(store.distinct_user_ids().await.unwrap(), vec![1, 2]);
    }
}
