use chrono::{DateTime, Utc};
use mnemo_common::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::memory_store::parse_optional_timestamp;
use crate::pool::{Database, map_sql_error};

/// One exchange: what the user said and what the assistant replied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub message_id: i64,
    pub user_id: i64,
    pub role_id: Option<i64>,
    pub user_message: String,
    pub bot_response: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Append-only conversation history, pruned by maintenance past a retention
/// threshold.
#[derive(Clone)]
pub struct ConversationStore {
    db: Database,
}

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        user_id: i64,
        role_id: Option<i64>,
        user_message: &str,
        bot_response: &str,
    ) -> Result<i64> {
        let user_message = user_message.to_string();
        let bot_response = bot_response.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO conversations (user_id, role_id, user_message, bot_response)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, role_id, user_message, bot_response],
                )
                .map_err(map_sql_error("insert conversation"))?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Most recent turns for (user, role) in chronological order.
    pub async fn recent(
        &self,
        user_id: i64,
        role_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT message_id, user_id, role_id, user_message, bot_response, timestamp
                         FROM conversations
                         WHERE user_id = ?1 AND (?2 IS NULL OR role_id = ?2)
                         ORDER BY message_id DESC
                         LIMIT ?3",
                    )
                    .map_err(map_sql_error("prepare recent conversations"))?;
                let mut turns = stmt
                    .query_map(params![user_id, role_id, limit as i64], |row| {
                        Ok(ConversationTurn {
                            message_id: row.get(0)?,
                            user_id: row.get(1)?,
                            role_id: row.get(2)?,
                            user_message: row.get(3)?,
                            bot_response: row.get(4)?,
                            timestamp: parse_optional_timestamp(row.get(5)?),
                        })
                    })
                    .map_err(map_sql_error("query recent conversations"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(map_sql_error("collect recent conversations"))?;
                // Fetched newest-first for the tail; callers want oldest-first.
                turns.reverse();
                Ok(turns)
            })
            .await
    }

    /// Delete turns older than the retention threshold. Returns the number
    /// of deleted rows.
    pub async fn prune_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM conversations WHERE datetime(timestamp) < datetime(?1)",
                    params![cutoff],
                )
                .map_err(map_sql_error("prune conversations"))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::ConversationStore;
    use crate::pool::Database;
    use crate::users::UserStore;

    async fn setup() -> ConversationStore {
        let db = Database::in_memory().unwrap();
        UserStore::new(db.clone())
            .ensure(1, None, None, None, None)
            .await
            .unwrap();
        ConversationStore::new(db)
    }

    #[tokio::test]
    async fn append_and_recent_preserve_order() {
        let store = setup().await;
        store.append(1, None, "hi", "hello!").await.unwrap();
        store.append(1, None, "how are you", "doing well").await.unwrap();

        let turns = store.recent(1, None, 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user_message, "hi");
        assert_eq!(turns[1].user_message, "how are you");
    }

    #[tokio::test]
    async fn recent_limits_to_the_newest_turns() {
        let store = setup().await;
        for i in 0..5 {
            store
                .append(1, None, &format!("msg-{i}"), "ok")
                .await
                .unwrap();
        }
        let turns = store.recent(1, None, 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user_message, "msg-3");
        assert_eq!(turns[1].user_message, "msg-4");
    }

    #[tokio::test]
    async fn recent_filters_by_role_when_given() {
        let db = Database::in_memory().unwrap();
        UserStore::new(db.clone())
            .ensure(1, None, None, None, None)
            .await
            .unwrap();
        let roles = crate::users::RoleStore::new(db.clone());
        roles.seed_defaults().await.unwrap();
        let store = ConversationStore::new(db);

        store.append(1, Some(1), "as friend", "ok").await.unwrap();
        store.append(1, Some(2), "as mentor", "ok").await.unwrap();

        let mentor_turns = store.recent(1, Some(2), 10).await.unwrap();
        assert_eq!(mentor_turns.len(), 1);
        assert_eq!(mentor_turns[0].user_message, "as mentor");

        let any_role = store.recent(1, None, 10).await.unwrap();
        assert_eq!(any_role.len(), 2);
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let store = setup().await;
        store.append(1, None, "old", "ok").await.unwrap();
        store.append(1, None, "new", "ok").await.unwrap();

        // Nothing is older than 1 day yet.
        assert_eq!(store.prune_older_than(1).await.unwrap(), 0);
    }
}
