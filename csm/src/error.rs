use crate::command::ContainerResult;

/// The error kinds this crate surfaces across its component boundaries.
///
/// Every fatal variant carries enough structure for the Apply Coordinator to
/// decide whether to flip `healthy` without string-matching a message; every
/// recoverable variant is returned to the caller as a normal response rather
/// than propagated as a panic or a generic error.
#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// Pre-replication validation error: container not open, token invalid,
    /// or any other rejection from the dispatcher's `validate_container_command`.
    /// Never replicated.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The block this request targets has already been finalized.
    #[error("block already finalized")]
    BlockAlreadyFinalized,

    /// Disk/dispatcher error while writing chunk payload outside the log.
    /// Fatal: marks the machine unhealthy.
    #[error("payload write failed: {0}")]
    PayloadWriteFailed(String),

    /// `dispatch` returned a result code outside the tolerated set, or threw.
    /// Fatal: marks the machine unhealthy and signals pipeline close.
    #[error("apply failed with untolerated result {0:?}")]
    ApplyFailed(ContainerResult),

    /// `take_snapshot` was invoked while the machine is unhealthy, or the
    /// snapshot file write/read itself failed.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    /// A replicated log entry failed to decode. Fatal: consensus treats this
    /// as a local error.
    #[error("failed to decode log entry: {0}")]
    DecodeFailed(String),

    /// The state machine has already transitioned `healthy -> false` and is
    /// refusing further work that requires durability.
    #[error("state machine is unhealthy")]
    Unhealthy,
}

impl StateMachineError {
    /// Fatal kinds flip `healthy` and force pipeline close; other kinds
    /// complete normally with an error response.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StateMachineError::PayloadWriteFailed(_)
                | StateMachineError::ApplyFailed(_)
                | StateMachineError::DecodeFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StateMachineError>;
