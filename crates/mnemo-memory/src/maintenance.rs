use std::sync::Arc;
use std::time::Duration;

use mnemo_db::{ConversationStore, UserStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::consolidator::Consolidator;
use crate::decay::DecayEngine;

const ERROR_RETRY: Duration = Duration::from_secs(3600);
const CONVERSATION_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Default, Clone)]
pub struct MaintenanceStats {
    pub users_processed: usize,
    pub memories_consolidated: usize,
    pub memories_decayed: usize,
    pub conversations_pruned: usize,
}

/// Periodic background maintenance: per-user consolidation and decay, plus
/// conversation pruning. One user's failure never stops the sweep; shutdown
/// is only observed between users.
pub struct MaintenanceScheduler {
    users: UserStore,
    conversations: ConversationStore,
    consolidator: Arc<Consolidator>,
    decay: Arc<DecayEngine>,
    interval: Duration,
}

impl MaintenanceScheduler {
    pub fn new(
        users: UserStore,
        conversations: ConversationStore,
        consolidator: Arc<Consolidator>,
        decay: Arc<DecayEngine>,
        interval_hours: u64,
    ) -> Self {
        Self {
            users,
            conversations,
            consolidator,
            decay,
            interval: Duration::from_secs(interval_hours * 3600),
        }
    }

    /// Long-running loop; exits when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "maintenance scheduler started"
        );
        loop {
            match self.run_once(&shutdown).await {
                Ok(stats) => info!(
                    users = stats.users_processed,
                    consolidated = stats.memories_consolidated,
                    decayed = stats.memories_decayed,
                    pruned = stats.conversations_pruned,
                    "maintenance sweep finished"
                ),
                Err(e) => {
                    error!("maintenance sweep failed: {e}");
                    if wait_or_shutdown(&mut shutdown, ERROR_RETRY).await {
                        break;
                    }
                    continue;
                }
            }

            if wait_or_shutdown(&mut shutdown, self.interval).await {
                break;
            }
        }
        info!("maintenance scheduler stopped");
    }

    /// One full sweep over all users. Also exposed for the one-shot
    /// maintenance command.
    pub async fn run_once(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> mnemo_common::Result<MaintenanceStats> {
        let mut stats = MaintenanceStats::default();

        let user_ids = self.users.all_user_ids().await?;
        for user_id in user_ids {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping maintenance sweep");
                break;
            }

            match self.consolidator.run(user_id).await {
                Ok(created) => stats.memories_consolidated += created.len(),
                Err(e) => warn!(user_id, "consolidation failed: {e}"),
            }
            match self.decay.apply(user_id).await {
                Ok(count) => stats.memories_decayed += count,
                Err(e) => warn!(user_id, "decay failed: {e}"),
            }
            stats.users_processed += 1;
        }

        match self
            .conversations
            .prune_older_than(CONVERSATION_RETENTION_DAYS)
            .await
        {
            Ok(pruned) => stats.conversations_pruned = pruned,
            Err(e) => warn!("conversation pruning failed: {e}"),
        }

        Ok(stats)
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns true when
/// the caller should exit.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
