//! Wire protocol between the classbridge hub and the classroom agent.
//!
//! The hub and the agent share one persistent WebSocket per connection. The
//! agent opens it, announces itself with [`AgentMessage::Hello`], and from
//! then on the hub pushes [`CommandEnvelope`] frames down while the agent
//! pushes [`AgentMessage::Reply`] frames back up. Every envelope carries a
//! fresh correlation id; a reply that does not quote a known correlation id
//! is dropped by the hub.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Command sent hub -> agent over the duplex channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: Uuid,
    pub command: String,
    pub payload: Value,
    pub issued_at_unix_ms: u64,
}

/// Frame sent agent -> hub over the duplex channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First frame on every connection; doubles as the reconnect signal
    /// that flips the hub out of backup mode.
    Hello {
        agent_id: String,
        #[serde(default)]
        agent_name: Option<String>,
    },
    Reply {
        correlation_id: Uuid,
        result: CommandResult,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Error,
}

/// Outcome of one command as reported by the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResult {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            status: CommandStatus::Success,
            data,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

pub const CMD_GET_GROUPS: &str = "get_groups";
pub const CMD_GET_STUDENTS: &str = "get_students";
pub const CMD_ADD_GROUP: &str = "add_group";
pub const CMD_ADD_STUDENT: &str = "add_student";
pub const CMD_ADD_JOURNAL_ENTRY: &str = "add_journal_entry";
pub const CMD_LOGIN: &str = "login";
pub const CMD_GET_TEACHER_TOPICS: &str = "get_teacher_topics";
pub const CMD_ADD_TEACHER_TOPIC: &str = "add_teacher_topic";

/// Commands the backup store can answer from its read cache.
pub fn is_backup_read(command: &str) -> bool {
    matches!(command, CMD_GET_GROUPS | CMD_GET_STUDENTS)
}

/// Commands that are durable mutations: served locally in backup mode and
/// queued in the outbox for replay. Reads are never outbox-worthy.
pub fn is_backup_mutation(command: &str) -> bool {
    matches!(
        command,
        CMD_ADD_GROUP | CMD_ADD_STUDENT | CMD_ADD_JOURNAL_ENTRY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_round_trips_with_tag() {
        let text = r#"{"type":"hello","agent_id":"classroom-pi"}"#;
        let message: AgentMessage = serde_json::from_str(text).expect("hello should parse");
        match message {
            AgentMessage::Hello {
                agent_id,
                agent_name,
            } => {
                assert_eq!(agent_id, "classroom-pi");
                assert!(agent_name.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn reply_without_data_omits_optional_fields() {
        let reply = AgentMessage::Reply {
            correlation_id: Uuid::new_v4(),
            result: CommandResult::success(None),
        };
        let text = serde_json::to_string(&reply).expect("reply should serialize");
        assert!(!text.contains("\"data\""));
        assert!(!text.contains("\"message\""));
        assert!(text.contains("\"status\":\"success\""));
    }

    #[test]
    fn mutation_and_read_classification_is_disjoint() {
        for command in [CMD_ADD_GROUP, CMD_ADD_STUDENT, CMD_ADD_JOURNAL_ENTRY] {
            assert!(is_backup_mutation(command));
            assert!(!is_backup_read(command));
        }
        for command in [CMD_GET_GROUPS, CMD_GET_STUDENTS] {
            assert!(is_backup_read(command));
            assert!(!is_backup_mutation(command));
        }
        assert!(!is_backup_mutation(CMD_LOGIN));
        assert!(!is_backup_read(CMD_GET_TEACHER_TOPICS));
    }
}
