use std::collections::HashMap;

use agent_abi::CommandEnvelope;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Push handle for one live agent connection.
///
/// The channel id distinguishes this connection from any later connection
/// under the same identity, so a stale disconnect cleanup cannot knock out
/// a replacement channel.
#[derive(Clone)]
pub struct AgentChannel {
    pub channel_id: Uuid,
    sender: mpsc::UnboundedSender<CommandEnvelope>,
}

impl AgentChannel {
    pub fn new(sender: mpsc::UnboundedSender<CommandEnvelope>) -> Self {
        Self {
            channel_id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn push(&self, envelope: CommandEnvelope) -> Result<(), ()> {
        self.sender.send(envelope).map_err(|_| ())
    }
}

/// Pure routing state: agent identity -> current live channel.
///
/// At most one live channel per identity; registering a replacement
/// supersedes the previous one. No dispatch logic lives here.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: tokio::sync::RwLock<HashMap<String, AgentChannel>>,
}

impl ConnectionRegistry {
    /// Registers a channel for `identity`, returning the superseded channel
    /// if one was still present.
    pub async fn register(&self, identity: &str, channel: AgentChannel) -> Option<AgentChannel> {
        let superseded = {
            let mut guard = self.channels.write().await;
            guard.insert(identity.to_string(), channel)
        };
        info!(
            agent_id = %identity,
            superseded = superseded.is_some(),
            "agent channel registered"
        );
        superseded
    }

    pub async fn lookup(&self, identity: &str) -> Option<AgentChannel> {
        let guard = self.channels.read().await;
        guard.get(identity).cloned()
    }

    /// Removes the mapping only if `channel_id` still identifies the current
    /// channel. Returns true when a mapping was removed.
    pub async fn unregister_if_current(&self, identity: &str, channel_id: Uuid) -> bool {
        let mut guard = self.channels.write().await;
        match guard.get(identity) {
            Some(current) if current.channel_id == channel_id => {
                guard.remove(identity);
                info!(agent_id = %identity, "agent channel unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        let guard = self.channels.read().await;
        guard.contains_key(identity)
    }

    pub async fn connected_count(&self) -> usize {
        let guard = self.channels.read().await;
        guard.len()
    }
}
