use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::command::{BlockId, ContainerRequest, ContainerResponse, Stage};

/// A dispatch-time context tagging a request with the phase of the pipeline
/// it is being executed from, plus whatever state that phase needs.
///
/// Built tagged `APPLY_TRANSACTION`, stage `COMMIT_DATA`, for apply-side
/// commits; carries the live `container -> BCSID` map so a dispatch can read
/// the current durability watermark for its container without a separate
/// lookup channel.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub stage: Stage,
    pub term: crate::log::Term,
    pub index: crate::log::LogIndex,
    pub container_bcsid: Arc<DashMap<i64, u64>>,
}

/// An open sink for the streaming bulk-write fast path.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn write(&self, data: Bytes) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    /// Invoked when `link` fails after the channel was opened; releases any
    /// partial on-disk state the channel accumulated.
    async fn clean_up(&self);
}

/// The downward contract to the chunk/block storage dispatcher. The
/// dispatcher owns on-disk layout, token validation, and the finalized-block
/// ledger; this crate only calls into it.
#[async_trait]
pub trait ContainerDispatcher: Send + Sync {
    /// Pre-replication check. Returns an error to reject before replication;
    /// the error must be classifiable as "container not open" vs. anything
    /// else so the caller can pick the right failure metric.
    async fn validate_container_command(&self, req: &ContainerRequest) -> anyhow::Result<()>;

    /// Returns true if `validate_container_command`'s failure was because the
    /// target container is not open (as opposed to any other rejection).
    fn is_container_not_open_error(&self, err: &anyhow::Error) -> bool;

    /// Executes a container command locally, returning a response carrying a
    /// [`crate::command::ContainerResult`].
    async fn dispatch(
        &self,
        req: &ContainerRequest,
        ctx: &DispatchContext,
    ) -> anyhow::Result<ContainerResponse>;

    /// Opens a data sink for the streaming bulk-write path.
    async fn get_stream_data_channel(
        &self,
        req: &ContainerRequest,
    ) -> anyhow::Result<Box<dyn DataChannel>>;

    /// Reconciles on-disk state against a restored snapshot, returning the
    /// set of containers this replica should have but does not.
    async fn build_missing_container_set_and_validate(
        &self,
        container_to_bcsid: &std::collections::HashMap<i64, u64>,
    ) -> anyhow::Result<HashSet<i64>>;

    async fn is_finalized_block_exist(&self, block: BlockId) -> bool;

    async fn add_finalized_block(&self, block: BlockId);

    async fn mark_container_for_close(&self, container_id: i64);

    async fn quasi_close_container(&self, container_id: i64, reason: &str);
}
