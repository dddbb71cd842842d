mod correlator;
mod error;
mod mode;
mod registry;
mod relay;
mod replay;
mod server;
mod store;

pub use agent_abi::{AgentMessage, CommandEnvelope, CommandResult, CommandStatus};

pub use correlator::RequestCorrelator;
pub use error::RelayError;
pub use mode::{Mode, ModeController};
pub use registry::{AgentChannel, ConnectionRegistry};
pub use relay::{CommandOutcome, RelayFacade};
pub use replay::ReplayEngine;
pub use server::{HubConfig, HubState, build_hub_app};
pub use store::{
    BackupStore, GroupRecord, JournalEntry, OutboxEntry, StudentRecord, TeacherRecord,
};
