use std::sync::Arc;

use agent_abi::{CommandResult, CommandStatus};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::correlator::RequestCorrelator;
use crate::error::RelayError;
use crate::mode::{Mode, ModeController};
use crate::store::BackupStore;

/// What a caller gets back from one relayed command. `backup_mode` is always
/// present so callers can surface a degraded-mode indicator.
#[derive(Clone, Debug, Serialize)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub backup_mode: bool,
}

impl CommandOutcome {
    fn from_result(result: CommandResult, backup_mode: bool) -> Self {
        Self {
            status: result.status,
            data: result.data,
            message: result.message,
            backup_mode,
        }
    }

    fn backup_success(data: Option<Value>, message: Option<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            data,
            message,
            backup_mode: true,
        }
    }

    fn backup_error(message: String) -> Self {
        Self {
            status: CommandStatus::Error,
            data: None,
            message: Some(message),
            backup_mode: true,
        }
    }

    pub fn served_from_backup(&self) -> bool {
        self.backup_mode
    }
}

/// The single entry point callers use. Decides per call whether to attempt
/// the live channel or the backup store, and owns the failover wiring
/// between the two.
pub struct RelayFacade {
    correlator: Arc<RequestCorrelator>,
    mode: Arc<ModeController>,
    store: Arc<BackupStore>,
}

impl RelayFacade {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        mode: Arc<ModeController>,
        store: Arc<BackupStore>,
    ) -> Self {
        Self {
            correlator,
            mode,
            store,
        }
    }

    pub async fn send_command(
        &self,
        identity: &str,
        command: &str,
        payload: Value,
        timeout_ms: u64,
    ) -> CommandOutcome {
        if self.mode.mode(identity).await == Mode::Normal {
            match self
                .correlator
                .call(identity, command, payload.clone(), timeout_ms)
                .await
            {
                Ok(result) => {
                    if result.is_success() {
                        self.absorb_success(command, &payload, &result).await;
                    }
                    return CommandOutcome::from_result(result, false);
                }
                Err(err) if err.trips_backup_mode() => {
                    self.mode.trip_backup(identity).await;
                }
                Err(err) => {
                    return CommandOutcome::backup_error(err.to_string());
                }
            }
        }

        self.serve_from_backup(identity, command, &payload).await
    }

    /// Keeps the local read model warm after a confirmed direct call:
    /// mutations are mirrored (no outbox entry), reads refresh the cache.
    async fn absorb_success(&self, command: &str, payload: &Value, result: &CommandResult) {
        let mirrored = if agent_abi::is_backup_mutation(command) {
            self.store.apply_mutation(command, payload).await
        } else {
            match (command, result.data.as_ref()) {
                (agent_abi::CMD_GET_GROUPS, Some(data)) => self.store.refresh_groups(data).await,
                (agent_abi::CMD_GET_STUDENTS, Some(data)) => {
                    self.store.refresh_students(data).await
                }
                _ => Ok(()),
            }
        };
        if let Err(err) = mirrored {
            // The agent already confirmed; a stale mirror is tolerable.
            warn!(command, %err, "failed to mirror confirmed command into backup store");
        }
    }

    async fn serve_from_backup(
        &self,
        identity: &str,
        command: &str,
        payload: &Value,
    ) -> CommandOutcome {
        match command {
            agent_abi::CMD_GET_GROUPS => {
                let groups = self.store.list_groups().await;
                CommandOutcome::backup_success(Some(json!(groups)), None)
            }
            agent_abi::CMD_GET_STUDENTS => {
                let group_name = payload["group_name"].as_str().unwrap_or("");
                let students = self.store.list_students(group_name).await;
                CommandOutcome::backup_success(Some(json!(students)), None)
            }
            agent_abi::CMD_LOGIN => {
                let teacher_id = payload["teacher_id"].as_str().unwrap_or("");
                let password = payload["password"].as_str().unwrap_or("");
                match self.store.find_teacher(teacher_id, password).await {
                    Some(teacher) => CommandOutcome::backup_success(
                        Some(json!({
                            "teacher": {
                                "id": teacher.teacher_id,
                                "name": teacher.name,
                                "role": teacher.role,
                            }
                        })),
                        None,
                    ),
                    None => CommandOutcome::backup_error("invalid credentials".to_string()),
                }
            }
            command if agent_abi::is_backup_mutation(command) => {
                match self
                    .store
                    .apply_mutation_queued(identity, command, payload)
                    .await
                {
                    Ok(()) => CommandOutcome::backup_success(
                        None,
                        Some(format!("{command} saved to backup store, queued for sync")),
                    ),
                    Err(err) => CommandOutcome::backup_error(err.to_string()),
                }
            }
            other => {
                CommandOutcome::backup_error(RelayError::BackupUnsupported(other.to_string()).to_string())
            }
        }
    }
}
