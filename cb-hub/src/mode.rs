use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Backup,
}

/// Per-identity operating mode.
///
/// One atomic flag per agent identity, so two agents (or a future shard)
/// cannot cross-contaminate each other's mode. NORMAL -> BACKUP trips
/// pessimistically on the first failed direct call; BACKUP -> NORMAL only
/// happens on an explicit reconnect event, never on an ad-hoc success.
#[derive(Default)]
pub struct ModeController {
    flags: tokio::sync::RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl ModeController {
    async fn flag(&self, identity: &str) -> Arc<AtomicBool> {
        {
            let guard = self.flags.read().await;
            if let Some(flag) = guard.get(identity) {
                return flag.clone();
            }
        }
        let mut guard = self.flags.write().await;
        guard
            .entry(identity.to_string())
            // New identities start in NORMAL; the very first call degrades
            // through the NotConnected path without a bootstrap state.
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub async fn mode(&self, identity: &str) -> Mode {
        if self.flag(identity).await.load(Ordering::Acquire) {
            Mode::Backup
        } else {
            Mode::Normal
        }
    }

    /// Trips `identity` into backup mode. Returns true on the transition
    /// edge (was NORMAL), false when already in BACKUP.
    pub async fn trip_backup(&self, identity: &str) -> bool {
        let tripped = !self.flag(identity).await.swap(true, Ordering::AcqRel);
        if tripped {
            warn!(agent_id = %identity, "agent unreachable, entering backup mode");
        }
        tripped
    }

    /// Restores `identity` to NORMAL on a reconnect event. Returns true when
    /// the identity was in BACKUP (the caller then owes a replay drain).
    pub async fn restore_normal(&self, identity: &str) -> bool {
        let restored = self.flag(identity).await.swap(false, Ordering::AcqRel);
        if restored {
            info!(agent_id = %identity, "agent reconnected, leaving backup mode");
        }
        restored
    }
}
