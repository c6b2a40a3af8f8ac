use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime configuration, loaded from the environment.
///
/// Every knob has a default except the provider credentials; `validate`
/// reports everything that is missing in one pass so operators see the full
/// list instead of fixing one variable at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub gemini_api_key: String,
    pub openai_api_key: String,
    pub enable_openai: bool,

    pub database_path: PathBuf,
    pub response_cache_dir: PathBuf,

    pub max_conversation_history: usize,
    pub default_language: String,
    pub log_level: String,

    pub admin_user_ids: Vec<i64>,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_requests: usize,

    pub maintenance_interval_hours: u64,

    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub decay: DecayConfig,
}

/// Weights and limits for memory retrieval ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub max_memories: usize,
    pub min_importance: i64,
    pub recency_weight: f64,
    pub min_similarity: f32,
    pub context_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_memories: 5,
            min_importance: 2,
            recency_weight: 0.2,
            min_similarity: 0.7,
            context_max_chars: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub min_similarity: f32,
    pub max_memories: usize,
    pub min_importance: i64,
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
    pub max_consolidations: usize,
    pub mark_originals: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.75,
            max_memories: 100,
            min_importance: 1,
            min_cluster_size: 2,
            max_cluster_size: 5,
            max_consolidations: 3,
            mark_originals: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    pub decay_factor: f64,
    pub min_age_days: i64,
    pub min_importance: i64,
    pub max_per_run: usize,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.9,
            min_age_days: 30,
            min_importance: 2,
            max_per_run: 10,
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment. Malformed numeric
    /// values fall back to defaults with a warning rather than aborting;
    /// `validate` is the place where hard failures are reported.
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            openai_api_key: env_string("OPENAI_API_KEY", ""),
            enable_openai: env_bool("ENABLE_OPENAI", false),
            database_path: PathBuf::from(env_string("DATABASE_PATH", "data/mnemo.db")),
            response_cache_dir: PathBuf::from(env_string("RESPONSE_CACHE_DIR", "data/cache")),
            max_conversation_history: env_parse("MAX_CONVERSATION_HISTORY", 10),
            default_language: env_string("DEFAULT_LANGUAGE", "en"),
            log_level: env_string("LOG_LEVEL", "info"),
            admin_user_ids: env_id_list("ADMIN_USER_IDS"),
            rate_limit_window_secs: env_parse("RATE_LIMIT_WINDOW", 60),
            rate_limit_max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 20),
            maintenance_interval_hours: env_parse("MAINTENANCE_INTERVAL_HOURS", 24),
            retrieval: RetrievalConfig::default(),
            consolidation: ConsolidationConfig::default(),
            decay: DecayConfig::default(),
        }
    }

    /// Collect every configuration problem. Empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.gemini_api_key.is_empty() {
            errors.push("GEMINI_API_KEY is not set".to_string());
        }
        if self.enable_openai && self.openai_api_key.is_empty() {
            errors.push("OPENAI_API_KEY is not set but ENABLE_OPENAI is true".to_string());
        }
        if self.database_path.as_os_str().is_empty() {
            errors.push("DATABASE_PATH is not set".to_string());
        }
        if self.rate_limit_max_requests == 0 {
            errors.push("RATE_LIMIT_MAX_REQUESTS must be greater than zero".to_string());
        }

        errors
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid value for {key}: {raw:?}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_id_list(key: &str) -> Vec<i64> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match part.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("ignoring malformed user id in {key}: {part:?}");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    fn base_config() -> AppConfig {
        AppConfig {
            gemini_api_key: "key".into(),
            openai_api_key: String::new(),
            enable_openai: false,
            database_path: "data/mnemo.db".into(),
            response_cache_dir: "data/cache".into(),
            max_conversation_history: 10,
            default_language: "en".into(),
            log_level: "info".into(),
            admin_user_ids: vec![1],
            rate_limit_window_secs: 60,
            rate_limit_max_requests: 20,
            maintenance_interval_hours: 24,
            retrieval: Default::default(),
            consolidation: Default::default(),
            decay: Default::default(),
        }
    }

    #[test]
    fn valid_config_reports_no_errors() {
        assert!(base_config().validate().is_empty());
    }

    #[test]
    fn missing_gemini_key_is_reported() {
        let mut config = base_config();
        config.gemini_api_key.clear();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("GEMINI_API_KEY"));
    }

    #[test]
    fn enabling_openai_requires_its_key() {
        let mut config = base_config();
        config.enable_openai = true;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn retrieval_defaults_match_documented_weights() {
        let retrieval = super::RetrievalConfig::default();
        assert_eq!(retrieval.recency_weight, 0.2);
        assert_eq!(retrieval.max_memories, 5);
    }
}
