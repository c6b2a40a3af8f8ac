use chrono::{DateTime, Utc};
use mnemo_common::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::memory_store::parse_optional_timestamp;
use crate::pool::{Database, map_sql_error};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub current_role_id: Option<i64>,
    pub is_admin: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_interaction: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseLength {
    Short,
    #[default]
    Medium,
    Long,
}

impl ResponseLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "short" => Self::Short,
            "long" => Self::Long,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Formality {
    #[default]
    Casual,
    Neutral,
    Formal,
}

impl Formality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Casual => "casual",
            Self::Neutral => "neutral",
            Self::Formal => "formal",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "neutral" => Self::Neutral,
            "formal" => Self::Formal,
            _ => Self::Casual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: i64,
    pub language: String,
    pub response_length: ResponseLength,
    pub formality_level: Formality,
    pub memory_enabled: bool,
    pub voice_responses_enabled: bool,
}

impl UserPreferences {
    pub fn defaults(user_id: i64) -> Self {
        Self {
            user_id,
            language: "en".to_string(),
            response_length: ResponseLength::default(),
            formality_level: Formality::default(),
            memory_enabled: true,
            voice_responses_enabled: false,
        }
    }
}

/// User rows and per-user preferences. Users are created on first contact
/// and never deleted by the core.
#[derive(Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the user on first contact, or refresh profile fields and the
    /// last-interaction timestamp on every later one.
    pub async fn ensure(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        language_code: Option<&str>,
    ) -> Result<()> {
        let username = username.map(str::to_string);
        let first_name = first_name.map(str::to_string);
        let last_name = last_name.map(str::to_string);
        let language_code = language_code.map(str::to_string);
        self.db
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO users (user_id, username, first_name, last_name, language_code)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(user_id) DO UPDATE SET
                        username = COALESCE(excluded.username, users.username),
                        first_name = COALESCE(excluded.first_name, users.first_name),
                        last_name = COALESCE(excluded.last_name, users.last_name),
                        language_code = COALESCE(excluded.language_code, users.language_code),
                        last_interaction = datetime('now')",
                    params![user_id, username, first_name, last_name, language_code],
                )
                .map_err(map_sql_error("upsert user"))?;
                tx.execute(
                    "INSERT OR IGNORE INTO user_preferences (user_id) VALUES (?1)",
                    params![user_id],
                )
                .map_err(map_sql_error("insert default preferences"))?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<User>> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT user_id, username, first_name, last_name, language_code,
                            current_role_id, is_admin, created_at, last_interaction
                     FROM users WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok(User {
                            user_id: row.get(0)?,
                            username: row.get(1)?,
                            first_name: row.get(2)?,
                            last_name: row.get(3)?,
                            language_code: row.get(4)?,
                            current_role_id: row.get(5)?,
                            is_admin: row.get(6)?,
                            created_at: parse_optional_timestamp(row.get(7)?),
                            last_interaction: parse_optional_timestamp(row.get(8)?),
                        })
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error("select user")(other)),
                })
            })
            .await
    }

    pub async fn set_current_role(&self, user_id: i64, role_id: i64) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE users SET current_role_id = ?1 WHERE user_id = ?2",
                    params![role_id, user_id],
                )
                .map_err(map_sql_error("set current role"))?;
                Ok(())
            })
            .await
    }

    pub async fn all_user_ids(&self) -> Result<Vec<i64>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT user_id FROM users ORDER BY user_id")
                    .map_err(map_sql_error("prepare user ids"))?;
                let ids = stmt
                    .query_map([], |row| row.get(0))
                    .map_err(map_sql_error("query user ids"))?
                    .collect::<std::result::Result<Vec<i64>, _>>()
                    .map_err(map_sql_error("collect user ids"))?;
                Ok(ids)
            })
            .await
    }

    /// Preferences for a user, falling back to defaults when the row is
    /// missing.
    pub async fn preferences(&self, user_id: i64) -> Result<UserPreferences> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT language, response_length, formality_level,
                            memory_enabled, voice_responses_enabled
                     FROM user_preferences WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        let length: String = row.get(1)?;
                        let formality: String = row.get(2)?;
                        Ok(UserPreferences {
                            user_id,
                            language: row.get(0)?,
                            response_length: ResponseLength::from_db(&length),
                            formality_level: Formality::from_db(&formality),
                            memory_enabled: row.get(3)?,
                            voice_responses_enabled: row.get(4)?,
                        })
                    },
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        Ok(UserPreferences::defaults(user_id))
                    }
                    other => Err(map_sql_error("select preferences")(other)),
                })
            })
            .await
    }

    pub async fn set_preferences(&self, preferences: UserPreferences) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO user_preferences
                        (user_id, language, response_length, formality_level,
                         memory_enabled, voice_responses_enabled)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(user_id) DO UPDATE SET
                        language = excluded.language,
                        response_length = excluded.response_length,
                        formality_level = excluded.formality_level,
                        memory_enabled = excluded.memory_enabled,
                        voice_responses_enabled = excluded.voice_responses_enabled",
                    params![
                        preferences.user_id,
                        preferences.language,
                        preferences.response_length.as_str(),
                        preferences.formality_level.as_str(),
                        preferences.memory_enabled,
                        preferences.voice_responses_enabled,
                    ],
                )
                .map_err(map_sql_error("upsert preferences"))?;
                Ok(())
            })
            .await
    }
}

/// A persona the assistant can speak as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub speaking_style: Option<String>,
    pub knowledge_areas: Option<String>,
    pub behaviors: Option<String>,
    pub is_custom: bool,
    pub created_by: Option<i64>,
    pub is_featured: bool,
    pub is_popular: bool,
    pub category: Option<String>,
}

#[derive(Clone)]
pub struct RoleStore {
    db: Database,
}

const ROLE_COLUMNS: &str = "role_id, name, description, personality, speaking_style, \
     knowledge_areas, behaviors, is_custom, created_by, is_featured, is_popular, category";

struct RoleSeed {
    name: &'static str,
    description: &'static str,
    personality: &'static str,
    speaking_style: &'static str,
    knowledge_areas: &'static str,
    behaviors: &'static str,
    category: &'static str,
}

const DEFAULT_ROLES: &[RoleSeed] = &[
    RoleSeed {
        name: "Friendly Companion",
        description: "A casual, supportive friend for everyday conversations",
        personality: "Warm, empathetic, and supportive. Enjoys casual conversation and has a good sense of humor.",
        speaking_style: "Casual and conversational. Uses everyday language and speaks like a close friend would.",
        knowledge_areas: "Daily life, popular culture, relationships, casual advice",
        behaviors: "Asks follow-up questions, offers encouragement, remembers personal details",
        category: "companionship",
    },
    RoleSeed {
        name: "Wise Mentor",
        description: "A wise guide offering advice and encouragement",
        personality: "Patient, insightful, and encouraging. Draws from experience to provide guidance.",
        speaking_style: "Thoughtful and measured. Uses analogies to illustrate points.",
        knowledge_areas: "Personal development, career guidance, life skills, goal setting",
        behaviors: "Asks thought-provoking questions, shares wisdom, celebrates achievements",
        category: "guidance",
    },
    RoleSeed {
        name: "Compassionate Listener",
        description: "A compassionate listener providing emotional support",
        personality: "Empathetic, non-judgmental, and attentive. Creates a safe space for expression.",
        speaking_style: "Calm and measured. Uses reflective listening techniques.",
        knowledge_areas: "Emotional well-being, coping strategies, mindfulness, self-care",
        behaviors: "Practices active listening, validates feelings, asks clarifying questions",
        category: "support",
    },
    RoleSeed {
        name: "Sharp Detective",
        description: "A sharp-minded investigator who loves solving mysteries",
        personality: "Observant, analytical, and curious. Has a keen eye for details and patterns.",
        speaking_style: "Direct and inquisitive. Asks pointed questions.",
        knowledge_areas: "Logic puzzles, mystery stories, deductive reasoning",
        behaviors: "Notices inconsistencies, connects seemingly unrelated facts, explains reasoning",
        category: "entertainment",
    },
    RoleSeed {
        name: "Enthusiastic Adventurer",
        description: "An enthusiastic explorer ready for imaginary journeys",
        personality: "Brave, optimistic, and energetic. Approaches life as a grand adventure.",
        speaking_style: "Enthusiastic and colorful. Uses vivid descriptions.",
        knowledge_areas: "Travel, outdoor activities, geography, cultures, adventure stories",
        behaviors: "Suggests exciting scenarios, describes environments vividly",
        category: "entertainment",
    },
    RoleSeed {
        name: "Deep Thinker",
        description: "A deep thinker who ponders life's big questions",
        personality: "Contemplative, open-minded, and intellectually curious.",
        speaking_style: "Thoughtful and nuanced. Asks open-ended questions.",
        knowledge_areas: "Philosophy, ethics, existential questions, critical thinking",
        behaviors: "Explores multiple perspectives, questions assumptions, encourages deeper thinking",
        category: "guidance",
    },
    RoleSeed {
        name: "Humorous Character",
        description: "A humorous character who tries to make you laugh",
        personality: "Witty, playful, and light-hearted. Finds humor in everyday situations.",
        speaking_style: "Casual and humorous. Uses puns, jokes, and comedic timing.",
        knowledge_areas: "Comedy, pop culture references, wordplay, observational humor",
        behaviors: "Makes jokes, uses comedic callbacks, maintains a light-hearted tone",
        category: "entertainment",
    },
    RoleSeed {
        name: "Creative Narrator",
        description: "A creative narrator who can spin tales and scenarios",
        personality: "Imaginative, expressive, and dramatic. Has a flair for narrative.",
        speaking_style: "Vivid and descriptive. Creates atmosphere through words.",
        knowledge_areas: "Storytelling techniques, narrative structures, world-building",
        behaviors: "Creates immersive scenarios, develops characters and plots, builds suspense",
        category: "entertainment",
    },
];

impl RoleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the built-in personas once. Safe to call on every startup.
    pub async fn seed_defaults(&self) -> Result<usize> {
        self.db
            .with_tx(|tx| {
                let existing: i64 = tx
                    .query_row(
                        "SELECT count(*) FROM roles WHERE is_custom = 0",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(map_sql_error("count default roles"))?;
                if existing > 0 {
                    return Ok(0);
                }

                for seed in DEFAULT_ROLES {
                    tx.execute(
                        "INSERT INTO roles
                            (name, description, personality, speaking_style,
                             knowledge_areas, behaviors, is_custom, category, is_featured)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, 1)",
                        params![
                            seed.name,
                            seed.description,
                            seed.personality,
                            seed.speaking_style,
                            seed.knowledge_areas,
                            seed.behaviors,
                            seed.category,
                        ],
                    )
                    .map_err(map_sql_error("insert default role"))?;
                }
                info!("seeded {} default roles", DEFAULT_ROLES.len());
                Ok(DEFAULT_ROLES.len())
            })
            .await
    }

    pub async fn get(&self, role_id: i64) -> Result<Option<Role>> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE role_id = ?1"),
                    params![role_id],
                    row_to_role,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error("select role")(other)),
                })
            })
            .await
    }

    /// Default persona used when a user has not picked one.
    pub async fn default_role(&self) -> Result<Option<Role>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {ROLE_COLUMNS} FROM roles
                         WHERE is_custom = 0 ORDER BY role_id ASC LIMIT 1"
                    ),
                    [],
                    row_to_role,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(map_sql_error("select default role")(other)),
                })
            })
            .await
    }

    pub async fn list(&self, include_custom: bool) -> Result<Vec<Role>> {
        self.db
            .with_conn(move |conn| {
                let sql = if include_custom {
                    format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY role_id")
                } else {
                    format!(
                        "SELECT {ROLE_COLUMNS} FROM roles WHERE is_custom = 0 ORDER BY role_id"
                    )
                };
                let mut stmt = conn.prepare(&sql).map_err(map_sql_error("prepare roles"))?;
                let roles = stmt
                    .query_map([], row_to_role)
                    .map_err(map_sql_error("query roles"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(map_sql_error("collect roles"))?;
                Ok(roles)
            })
            .await
    }

    pub async fn create_custom(
        &self,
        created_by: i64,
        name: &str,
        description: Option<&str>,
        personality: Option<&str>,
        speaking_style: Option<&str>,
        knowledge_areas: Option<&str>,
        behaviors: Option<&str>,
    ) -> Result<i64> {
        let name = name.to_string();
        let description = description.map(str::to_string);
        let personality = personality.map(str::to_string);
        let speaking_style = speaking_style.map(str::to_string);
        let knowledge_areas = knowledge_areas.map(str::to_string);
        let behaviors = behaviors.map(str::to_string);
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO roles
                        (name, description, personality, speaking_style,
                         knowledge_areas, behaviors, is_custom, created_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                    params![
                        name,
                        description,
                        personality,
                        speaking_style,
                        knowledge_areas,
                        behaviors,
                        created_by,
                    ],
                )
                .map_err(map_sql_error("insert custom role"))?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }
}

fn row_to_role(row: &rusqlite::Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        role_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        personality: row.get(3)?,
        speaking_style: row.get(4)?,
        knowledge_areas: row.get(5)?,
        behaviors: row.get(6)?,
        is_custom: row.get(7)?,
        created_by: row.get(8)?,
        is_featured: row.get(9)?,
        is_popular: row.get(10)?,
        category: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{Formality, ResponseLength, RoleStore, UserPreferences, UserStore};
    use crate::pool::Database;

    #[tokio::test]
    async fn ensure_creates_user_and_default_preferences() {
        let db = Database::in_memory().unwrap();
        let users = UserStore::new(db);
        users
            .ensure(42, Some("alice"), Some("Alice"), None, Some("en"))
            .await
            .unwrap();

        let user = users.get(42).await.unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert!(!user.is_admin);

        let prefs = users.preferences(42).await.unwrap();
        assert!(prefs.memory_enabled);
        assert_eq!(prefs.response_length, ResponseLength::Medium);
        assert_eq!(prefs.formality_level, Formality::Casual);
    }

    #[tokio::test]
    async fn ensure_twice_keeps_profile_and_refreshes_interaction() {
        let db = Database::in_memory().unwrap();
        let users = UserStore::new(db);
        users
            .ensure(1, Some("bob"), None, None, None)
            .await
            .unwrap();
        users.ensure(1, None, None, None, None).await.unwrap();

        let user = users.get(1).await.unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("bob"));
        assert!(user.last_interaction.is_some());
    }

    #[tokio::test]
    async fn preferences_round_trip() {
        let db = Database::in_memory().unwrap();
        let users = UserStore::new(db);
        users.ensure(7, None, None, None, None).await.unwrap();

        let mut prefs = UserPreferences::defaults(7);
        prefs.response_length = ResponseLength::Long;
        prefs.formality_level = Formality::Formal;
        prefs.memory_enabled = false;
        users.set_preferences(prefs).await.unwrap();

        let loaded = users.preferences(7).await.unwrap();
        assert_eq!(loaded.response_length, ResponseLength::Long);
        assert_eq!(loaded.formality_level, Formality::Formal);
        assert!(!loaded.memory_enabled);
    }

    #[tokio::test]
    async fn seed_defaults_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let roles = RoleStore::new(db);
        let seeded = roles.seed_defaults().await.unwrap();
        assert_eq!(seeded, 8);
        assert_eq!(roles.seed_defaults().await.unwrap(), 0);

        let all = roles.list(false).await.unwrap();
        assert_eq!(all.len(), 8);
        assert!(all.iter().any(|r| r.name == "Wise Mentor"));
    }

    #[tokio::test]
    async fn default_role_is_first_builtin() {
        let db = Database::in_memory().unwrap();
        let roles = RoleStore::new(db);
        roles.seed_defaults().await.unwrap();
        let default = roles.default_role().await.unwrap().unwrap();
        assert_eq!(default.name, "Friendly Companion");
    }

    #[tokio::test]
    async fn custom_roles_are_tracked_per_creator() {
        let db = Database::in_memory().unwrap();
        let users = UserStore::new(db.clone());
        users.ensure(1, None, None, None, None).await.unwrap();
        let roles = RoleStore::new(db);
        let role_id = roles
            .create_custom(1, "Pirate", Some("Talks like a pirate"), None, None, None, None)
            .await
            .unwrap();
        let role = roles.get(role_id).await.unwrap().unwrap();
        assert!(role.is_custom);
        assert_eq!(role.created_by, Some(1));
    }
}
