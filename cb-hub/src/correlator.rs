use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use agent_abi::{CommandEnvelope, CommandResult};
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, timeout};
use tracing::debug;
use uuid::Uuid;

use crate::error::RelayError;
use crate::registry::ConnectionRegistry;

/// Turns the asynchronous agent channel into synchronous call semantics.
///
/// Each call tags its envelope with a fresh correlation id and parks a
/// oneshot waiter in the pending table; the inbound reply path resolves the
/// waiter by id. The table lock is only held for insert/remove, never across
/// the wait, so unrelated calls do not serialize behind a slow agent.
pub struct RequestCorrelator {
    registry: Arc<ConnectionRegistry>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CommandResult>>>,
}

impl RequestCorrelator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `command` to `identity` and waits for the matching reply.
    ///
    /// Fails immediately with `NotConnected` when no channel is registered;
    /// never waits out the timeout in that case.
    pub async fn call(
        &self,
        identity: &str,
        command: &str,
        payload: Value,
        timeout_ms: u64,
    ) -> Result<CommandResult, RelayError> {
        let Some(channel) = self.registry.lookup(identity).await else {
            return Err(RelayError::NotConnected(identity.to_string()));
        };

        let correlation_id = Uuid::new_v4();
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(correlation_id, response_tx);
        }

        let envelope = CommandEnvelope {
            correlation_id,
            command: command.to_string(),
            payload,
            issued_at_unix_ms: now_unix_ms(),
        };
        if channel.push(envelope).is_err() {
            // Writer task already gone; treat like a missing channel.
            let mut pending = self.pending.lock().await;
            pending.remove(&correlation_id);
            return Err(RelayError::NotConnected(identity.to_string()));
        }

        match timeout(Duration::from_millis(timeout_ms), response_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                // Sender dropped without a reply (connection torn down).
                Err(RelayError::NotConnected(identity.to_string()))
            }
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&correlation_id);
                Err(RelayError::Timeout {
                    identity: identity.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Inbound reply path. A reply whose correlation id has no pending slot
    /// (already timed out, or spurious) is dropped without error.
    pub async fn complete(&self, correlation_id: Uuid, result: CommandResult) {
        let waiter = {
            let mut pending = self.pending.lock().await;
            pending.remove(&correlation_id)
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => {
                debug!(%correlation_id, "dropping reply with no pending call");
            }
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
