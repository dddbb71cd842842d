use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::correlator::RequestCorrelator;
use crate::store::BackupStore;

/// Drains the outbox against a freshly reconnected agent.
///
/// Entries are replayed strictly in id order and removed one at a time on
/// confirmed success. The first failure stops the pass: a later entry must
/// never be applied before an earlier one that failed, even if that leaves a
/// stuck entry blocking the queue until the next reconnect (ordering over
/// liveness; out-of-order grades would corrupt the journal).
pub struct ReplayEngine {
    correlator: Arc<RequestCorrelator>,
    store: Arc<BackupStore>,
    replay_timeout_ms: u64,
    drain_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReplayEngine {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        store: Arc<BackupStore>,
        replay_timeout_ms: u64,
    ) -> Self {
        Self {
            correlator,
            store,
            replay_timeout_ms,
            drain_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn drain_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.drain_locks.lock().await;
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Replays pending entries for `identity`, returning how many were
    /// confirmed and deleted. A second reconnect arriving mid-drain waits
    /// here instead of starting an overlapping pass.
    pub async fn drain(&self, identity: &str) -> usize {
        let lock = self.drain_lock(identity).await;
        let _drain_guard = lock.lock().await;

        let entries = self.store.outbox_entries(identity).await;
        if entries.is_empty() {
            return 0;
        }
        info!(agent_id = %identity, pending = entries.len(), "replaying outbox");

        let mut replayed = 0;
        for entry in entries {
            let result = self
                .correlator
                .call(
                    identity,
                    &entry.action_type,
                    entry.payload.clone(),
                    self.replay_timeout_ms,
                )
                .await;

            match result {
                Ok(result) if result.is_success() => {
                    if let Err(err) = self.store.remove_outbox_entry(entry.id).await {
                        warn!(agent_id = %identity, entry_id = entry.id, %err, "replayed entry could not be deleted, stopping drain");
                        break;
                    }
                    replayed += 1;
                }
                Ok(result) => {
                    warn!(
                        agent_id = %identity,
                        entry_id = entry.id,
                        action = %entry.action_type,
                        message = result.message.as_deref().unwrap_or(""),
                        "agent rejected replayed entry, stopping drain"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        agent_id = %identity,
                        entry_id = entry.id,
                        action = %entry.action_type,
                        %err,
                        "replay call failed, stopping drain"
                    );
                    break;
                }
            }
        }

        info!(agent_id = %identity, replayed, "replay pass finished");
        replayed
    }
}
