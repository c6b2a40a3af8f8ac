/// Schema migrations, applied in order at startup. Each migration is
/// idempotent (`IF NOT EXISTS`) so re-running the list is safe.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[CORE_SCHEMA_V1, MEMORY_SCHEMA_V2];

const CORE_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "core_schema_v1",
    sql: "
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    language_code TEXT,
    current_role_id INTEGER REFERENCES roles(role_id),
    is_admin BOOLEAN NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_interaction TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user_preferences (
    user_id INTEGER PRIMARY KEY REFERENCES users(user_id),
    language TEXT NOT NULL DEFAULT 'en',
    response_length TEXT NOT NULL DEFAULT 'medium',
    formality_level TEXT NOT NULL DEFAULT 'casual',
    memory_enabled BOOLEAN NOT NULL DEFAULT 1,
    voice_responses_enabled BOOLEAN NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS roles (
    role_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    personality TEXT,
    speaking_style TEXT,
    knowledge_areas TEXT,
    behaviors TEXT,
    is_custom BOOLEAN NOT NULL DEFAULT 0,
    created_by INTEGER REFERENCES users(user_id),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    is_featured BOOLEAN NOT NULL DEFAULT 0,
    is_popular BOOLEAN NOT NULL DEFAULT 0,
    category TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(user_id),
    role_id INTEGER REFERENCES roles(role_id),
    user_message TEXT,
    bot_response TEXT,
    timestamp TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_conversations_user_id ON conversations (user_id);
CREATE INDEX IF NOT EXISTS idx_conversations_role_id ON conversations (role_id);
CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations (timestamp);
CREATE INDEX IF NOT EXISTS idx_conversations_user_role ON conversations (user_id, role_id);
",
};

const MEMORY_SCHEMA_V2: Migration = Migration {
    version: 2,
    name: "memory_schema_v2",
    sql: "
CREATE TABLE IF NOT EXISTS memories (
    memory_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(user_id),
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    importance INTEGER NOT NULL DEFAULT 1,
    source TEXT NOT NULL DEFAULT 'explicit',
    context TEXT,
    confidence REAL NOT NULL DEFAULT 1.0,
    expires_at TEXT,
    recall_count INTEGER NOT NULL DEFAULT 0,
    last_reinforced TEXT,
    is_consolidated BOOLEAN NOT NULL DEFAULT 0,
    last_accessed TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_memories_user_id ON memories (user_id);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories (importance);
CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories (created_at);
CREATE INDEX IF NOT EXISTS idx_memories_category ON memories (category);
CREATE INDEX IF NOT EXISTS idx_memories_confidence ON memories (confidence);
CREATE INDEX IF NOT EXISTS idx_memories_expires_at ON memories (expires_at);
CREATE INDEX IF NOT EXISTS idx_memories_recall_count ON memories (recall_count);
CREATE INDEX IF NOT EXISTS idx_memories_is_consolidated ON memories (is_consolidated);

CREATE TABLE IF NOT EXISTS memory_tags (
    tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(user_id),
    tag_name TEXT NOT NULL,
    UNIQUE(user_id, tag_name)
);

CREATE TABLE IF NOT EXISTS memory_tag_associations (
    memory_id INTEGER NOT NULL REFERENCES memories(memory_id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES memory_tags(tag_id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (memory_id, tag_id)
);

CREATE TABLE IF NOT EXISTS memory_relationships (
    relationship_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_memory_id INTEGER NOT NULL REFERENCES memories(memory_id) ON DELETE CASCADE,
    target_memory_id INTEGER NOT NULL REFERENCES memories(memory_id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS memory_consolidations (
    original_memory_id INTEGER NOT NULL REFERENCES memories(memory_id) ON DELETE CASCADE,
    consolidated_memory_id INTEGER NOT NULL REFERENCES memories(memory_id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (original_memory_id, consolidated_memory_id)
);

CREATE TABLE IF NOT EXISTS memory_consolidation_log (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    source_memories TEXT NOT NULL,
    consolidated_memory_id INTEGER NOT NULL,
    consolidation_type TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS memory_summaries (
    summary_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(user_id),
    summary TEXT NOT NULL,
    category TEXT,
    last_updated TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_memory_summaries_user_id ON memory_summaries (user_id);

CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_id INTEGER PRIMARY KEY REFERENCES memories(memory_id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
",
};
