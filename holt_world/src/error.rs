use thiserror::Error;

use crate::object::ObjectId;

/// Error taxonomy shared by the core and its collaborators.
///
/// `Script` and `Timeout` both mean "discard the run's state"; they are kept
/// distinct because telemetry and recovery policy treat them differently.
/// Storage errors pass through unchanged and are never retried here.
#[derive(Debug, Clone, Error)]
pub enum WorldError {
    /// Uncaught error inside the VM, with file:line detail when Lua has it.
    #[error("script error in {origin}: {message}")]
    Script { origin: String, message: String },

    /// The per-call wall-clock budget elapsed and the VM was terminated.
    #[error("script execution exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    #[error("object {0} does not exist")]
    NotFound(ObjectId),

    #[error("storage: {0}")]
    Storage(String),

    #[error("scheduling: {0}")]
    Scheduling(String),

    /// A rejected operation: containment cycle, non-empty removal, bad
    /// script-supplied arguments.
    #[error("{0}")]
    Invalid(String),
}

impl WorldError {
    pub fn script(origin: impl Into<String>, message: impl Into<String>) -> Self {
        WorldError::Script {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WorldError::Timeout { .. })
    }
}
