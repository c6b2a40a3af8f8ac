use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mnemo_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::providers::{ChatTurn, RoleContext};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    prompt: String,
    response: String,
    timestamp: u64,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    prompt: &'a str,
    role_context: &'a RoleContext,
    conversation_history: &'a [ChatTurn],
}

/// Content-addressed cache of model responses.
///
/// One JSON file per fingerprint; writes go through a temp file and an
/// atomic rename so concurrent readers never observe a torn entry. Expired
/// entries read as misses and are removed by the next sweep.
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        })
    }

    /// Stable 128-bit hex fingerprint of the cacheable tuple. The input is
    /// serialized through a key-sorted JSON value so field order can never
    /// change the name.
    pub fn fingerprint(
        prompt: &str,
        role_context: &RoleContext,
        conversation_history: &[ChatTurn],
    ) -> String {
        let input = FingerprintInput {
            prompt,
            role_context,
            conversation_history,
        };
        let canonical = serde_json::to_value(&input)
            .map(|value| value.to_string())
            .unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        digest[..16].iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn get(&self, fingerprint: &str) -> Option<String> {
        let path = self.entry_path(fingerprint);
        let raw = std::fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("discarding unreadable cache entry {fingerprint}: {e}");
                return None;
            }
        };

        if now_secs().saturating_sub(entry.timestamp) > self.ttl.as_secs() {
            debug!("cache expired for {fingerprint}");
            return None;
        }
        debug!("cache hit for {fingerprint}");
        Some(entry.response)
    }

    pub fn set(&self, fingerprint: &str, prompt: &str, response: &str) -> Result<()> {
        let entry = CacheEntry {
            prompt: prompt.to_string(),
            response: response.to_string(),
            timestamp: now_secs(),
        };
        let path = self.entry_path(fingerprint);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::Io(std::io::Error::other(format!("cache rename failed: {e}"))))?;
        Ok(())
    }

    /// Remove every entry older than `max_age` (the configured TTL when not
    /// given). Returns the number of removed entries.
    pub fn sweep(&self, max_age: Option<Duration>) -> usize {
        let max_age = max_age.unwrap_or(self.ttl).as_secs();
        let now = now_secs();
        let mut removed = 0;

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
                .is_none_or(|entry| now.saturating_sub(entry.timestamp) > max_age);
            if expired && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("swept {removed} expired cache entries");
        }
        removed
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
