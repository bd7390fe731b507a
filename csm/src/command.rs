use serde::{Deserialize, Serialize};

/// The recognized command kinds, replacing polymorphism-by-type with a
/// tagged variant over a table-driven stage/context assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    CreateContainer,
    WriteChunk,
    PutBlock,
    FinalizeBlock,
    PutSmallFile,
    StreamInit,
    CloseContainer,
    DeleteContainer,
    ReadChunk,
    ReadContainer,
    GetSmallFile,
    Echo,
}

impl CommandKind {
    /// Commands that write a block and must therefore be checked against the
    /// finalized-block index before being allowed to replicate.
    pub fn touches_block(&self) -> bool {
        matches!(self, CommandKind::PutBlock | CommandKind::WriteChunk)
    }
}

/// Identifies a block within a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub container_id: i64,
    pub local_id: i64,
}

/// The stage a dispatcher context is tagged with, mirroring the two points in
/// the pipeline at which a command reaches local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Leader/follower payload write path, outside the replicated log.
    WriteData,
    /// Apply-side commit of replicated metadata.
    CommitData,
}

/// Result codes a dispatcher can return from `dispatch`. The four variants
/// other than `Success` are tolerated outcomes of `ApplyTransaction`
/// (expected races with container close); anything else is a durability
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerResult {
    Success,
    ContainerNotOpen,
    ClosedContainerIo,
    ChunkFileInconsistency,
    BlockAlreadyFinalized,
    Error,
}

impl ContainerResult {
    /// Result codes tolerated by the Apply Coordinator: these complete the
    /// apply future as a normal (non-fatal) response.
    pub fn is_tolerated(&self) -> bool {
        matches!(
            self,
            ContainerResult::Success
                | ContainerResult::ContainerNotOpen
                | ContainerResult::ClosedContainerIo
                | ContainerResult::ChunkFileInconsistency
        )
    }
}

/// A client request envelope, before the token/payload split that produces a
/// transaction's request-view and log-view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub cmd: CommandKind,
    pub container_id: i64,
    pub block: Option<BlockId>,
    /// Chunk index within the block, used by WriteChunk/ReadChunk.
    pub chunk_index: u64,
    /// Authentication token, verified upstream and stripped before
    /// replication.
    pub token: Option<bytes::Bytes>,
    /// Bulk payload. Non-empty only for WriteChunk/PutSmallFile on the
    /// request-view; always empty on the log-view.
    pub data: bytes::Bytes,
    /// Pipeline identifier stamped onto the log-view by the leader.
    pub pipeline_id: Option<crate::gid::Gid>,
}

impl ContainerRequest {
    /// Produces the log-view of this request: user data stripped so only
    /// metadata is replicated through the consensus log.
    pub fn to_log_view(&self, pipeline_id: crate::gid::Gid) -> ContainerRequest {
        let mut view = self.clone();
        view.data = bytes::Bytes::new();
        view.token = None;
        view.pipeline_id = Some(pipeline_id);
        view
    }
}

/// Response produced by `dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResponse {
    pub result: ContainerResult,
    pub message: Option<String>,
}

impl ContainerResponse {
    pub fn success() -> Self {
        Self {
            result: ContainerResult::Success,
            message: None,
        }
    }
}
