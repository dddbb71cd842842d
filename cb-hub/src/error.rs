use thiserror::Error;

/// Failure modes of a relayed command.
///
/// `NotConnected` and `Timeout` are the two triggers that trip an identity
/// into backup mode; the facade catches them and retries the call against
/// the local store, so callers only see them if the fallback fails too.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no live channel registered for agent {0}")]
    NotConnected(String),

    #[error("agent {identity} did not reply within {timeout_ms}ms")]
    Timeout { identity: String, timeout_ms: u64 },

    #[error("command {0} is unavailable in backup mode")]
    BackupUnsupported(String),

    #[error("backup store failure: {0}")]
    Store(String),
}

impl RelayError {
    /// True for the errors that flip an identity from NORMAL to BACKUP.
    pub fn trips_backup_mode(&self) -> bool {
        matches!(
            self,
            RelayError::NotConnected(_) | RelayError::Timeout { .. }
        )
    }
}
