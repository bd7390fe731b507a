use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::apply::ApplyCoordinator;
use crate::cache::StateMachineDataCache;
use crate::command::{CommandKind, ContainerRequest, ContainerResponse, Stage};
use crate::config::Config;
use crate::container_op_pool::ContainerOpPool;
use crate::container_queue::ContainerTaskQueueMap;
use crate::dispatcher::{ContainerDispatcher, DispatchContext};
use crate::error::{Result, StateMachineError};
use crate::executor_pool::ChunkExecutorPoolSet;
use crate::gid::Gid;
use crate::log::{LogEntry, LogIndex, LogPosition, Term};
use crate::metrics::Metrics;
use crate::notifications::{NotificationSurface, OuterServerCapability};
use crate::snapshot::SnapshotManager;
use crate::stream::StreamManager;
use crate::transaction::{TransactionContext, TransactionOutcome, TransactionPipeline};

/// The replicated container state machine: the assembly of every component
/// behind the upward contract a consensus engine drives.
pub struct ContainerStateMachine {
    gid: Gid,
    dispatcher: Arc<dyn ContainerDispatcher>,
    metrics: Arc<Metrics>,
    healthy: Arc<AtomicBool>,
    container_bcsid: Arc<DashMap<i64, u64>>,
    cache: Arc<StateMachineDataCache>,
    executors: Arc<ChunkExecutorPoolSet>,
    container_op_pool: Arc<ContainerOpPool>,
    transaction_pipeline: TransactionPipeline,
    apply: Arc<ApplyCoordinator>,
    write_path: crate::write_path::WritePath,
    snapshot: SnapshotManager,
    stream: StreamManager,
    notifications: NotificationSurface,
}

impl ContainerStateMachine {
    pub fn new(
        gid: Gid,
        config: Config,
        dispatcher: Arc<dyn ContainerDispatcher>,
        outer: Arc<dyn OuterServerCapability>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let healthy = Arc::new(AtomicBool::new(true));
        let container_bcsid = Arc::new(DashMap::new());
        let cache = Arc::new(StateMachineDataCache::new(config.cache_byte_budget, metrics.clone()));
        let executors = Arc::new(ChunkExecutorPoolSet::new(config.chunk_executor_pool_count));
        let container_op_pool = Arc::new(ContainerOpPool::new(config.container_op_pool_size));
        let container_queues = Arc::new(ContainerTaskQueueMap::new(container_op_pool.clone()));

        let apply = Arc::new(ApplyCoordinator::new(
            config.max_pending_apply_txns,
            container_queues,
            dispatcher.clone(),
            container_bcsid.clone(),
            metrics.clone(),
            healthy.clone(),
            LogPosition::default(),
        ));

        let write_path = crate::write_path::WritePath::new(
            dispatcher.clone(),
            executors.clone(),
            cache.clone(),
            container_bcsid.clone(),
            metrics.clone(),
            healthy.clone(),
        );

        let snapshot = SnapshotManager::new(container_bcsid.clone(), healthy.clone(), dispatcher.clone());
        let stream = StreamManager::new(dispatcher.clone(), container_bcsid.clone());
        let notifications = NotificationSurface::new(
            gid,
            cache.clone(),
            apply.clone(),
            dispatcher.clone(),
            container_bcsid.clone(),
            outer,
            config.wait_on_all_followers,
        );
        let transaction_pipeline = TransactionPipeline::new(dispatcher.clone(), metrics.clone());

        Self {
            gid,
            dispatcher,
            metrics,
            healthy,
            container_bcsid,
            cache,
            executors,
            container_op_pool,
            transaction_pipeline,
            apply,
            write_path,
            snapshot,
            stream,
            notifications,
        }
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn is_healthy(&self) -> bool {
        self.apply.is_healthy()
    }

    pub fn last_applied(&self) -> LogPosition {
        self.apply.last_applied()
    }

    /// Current BCSID of `container_id`, if this replica has created it and
    /// not deleted it (invariant 2).
    pub fn container_bcsid(&self, container_id: i64) -> Option<u64> {
        self.container_bcsid.get(&container_id).map(|v| *v)
    }

    /// Initializes `last_applied` to a restored or fresh starting position
    /// and marks this replica as leader or follower for write-path caching.
    pub fn initialize(&self, initial: LogPosition, is_leader: bool) {
        self.apply.restore_last_applied(initial);
        self.write_path.set_leader(is_leader);
    }

    pub async fn start_transaction_for_client(
        &self,
        req: ContainerRequest,
        start_time_nanos: u64,
    ) -> TransactionOutcome {
        self.transaction_pipeline
            .start_transaction_for_client(req, self.gid, start_time_nanos)
            .await
    }

    pub fn start_transaction_for_log_entry(
        &self,
        entry: LogEntry,
        start_time_nanos: u64,
    ) -> TransactionOutcome {
        self.transaction_pipeline
            .start_transaction_for_log_entry(entry, start_time_nanos)
    }

    pub fn write(&self, ctx: &TransactionContext, term: Term, index: LogIndex) {
        self.write_path.write(term, index, ctx.request_view.clone());
    }

    /// Serves a follower's request for the state-machine-data of `index`:
    /// cache first, falling back to a dispatcher `ReadChunk` on the owning
    /// block's executor on miss.
    pub async fn read(&self, index: LogIndex, log_view: &ContainerRequest) -> Result<Bytes> {
        if let Some(bytes) = self.cache.get(index.value()) {
            return Ok(bytes);
        }
        self.metrics.cache_misses.inc();

        let Some(block) = log_view.block else {
            return Err(StateMachineError::PayloadWriteFailed(
                "cache miss for an entry with no block".to_string(),
            ));
        };
        let read_req = ContainerRequest {
            cmd: CommandKind::ReadChunk,
            ..log_view.clone()
        };
        let dispatcher = self.dispatcher.clone();
        let ctx = DispatchContext {
            stage: Stage::WriteData,
            term: Term(0),
            index,
            container_bcsid: self.container_bcsid.clone(),
        };
        let result = self
            .executors
            .submit(block.local_id, move || async move {
                dispatcher.dispatch(&read_req, &ctx).await
            })
            .await;

        match result {
            Ok(resp) if resp.result.is_tolerated() => Ok(log_view.data.clone()),
            Ok(resp) => {
                self.healthy
                    .store(false, std::sync::atomic::Ordering::SeqCst);
                Err(StateMachineError::ApplyFailed(resp.result))
            }
            Err(err) => {
                self.healthy
                    .store(false, std::sync::atomic::Ordering::SeqCst);
                Err(StateMachineError::PayloadWriteFailed(err.to_string()))
            }
        }
    }

    pub async fn flush(&self, up_to: LogIndex) -> Result<()> {
        self.write_path.flush(up_to).await
    }

    pub async fn apply_transaction(
        &self,
        term: Term,
        index: LogIndex,
        req: ContainerRequest,
    ) -> Result<ContainerResponse> {
        let result = self.apply.apply_transaction(term, index, req).await;
        if result.is_ok() {
            self.notifications.after_commit(index);
        }
        result
    }

    /// Reports the slowest follower's next-index to the cache eviction
    /// policy; only consulted when `wait_on_all_followers` is set.
    pub fn report_follower_progress(&self, min_follower_next: u64) {
        self.notifications.report_follower_progress(min_follower_next);
    }

    /// Read-only queries (ReadChunk/ReadContainer/GetSmallFile) execute
    /// directly against the dispatcher, bypassing the replicated log.
    pub async fn query(&self, req: &ContainerRequest) -> anyhow::Result<ContainerResponse> {
        let ctx = DispatchContext {
            stage: Stage::CommitData,
            term: Term(0),
            index: self.last_applied().index,
            container_bcsid: self.container_bcsid.clone(),
        };
        self.dispatcher.dispatch(req, &ctx).await
    }

    pub fn take_snapshot(&self, dir: &Path) -> Result<LogIndex> {
        self.snapshot.take_snapshot(dir, self.last_applied())
    }

    pub async fn restore(&self, path: &Path) -> Result<()> {
        let position = self.snapshot.restore(path).await?;
        self.apply.restore_last_applied(position);
        Ok(())
    }

    pub async fn stream(
        &self,
        req: ContainerRequest,
        put_block_request: ContainerRequest,
    ) -> Result<Gid> {
        self.stream.open(req, put_block_request).await
    }

    pub async fn write_to_stream(&self, id: Gid, data: Bytes) -> Result<()> {
        self.stream.write(id, data).await
    }

    pub async fn link(&self, id: Gid, term: Term, index: LogIndex) -> Result<ContainerResponse> {
        self.stream.link(id, term, index).await
    }

    pub fn truncate(&self, index: LogIndex) {
        self.notifications.truncate(index);
    }

    pub fn notify_term_index_updated(&self, term: Term, index: LogIndex) {
        self.notifications.notify_term_index_updated(term, index);
    }

    pub fn notify_not_leader(&self) {
        self.write_path.set_leader(false);
        self.notifications.notify_not_leader();
    }

    pub async fn notify_group_remove(&self) {
        self.notifications.notify_group_remove().await;
    }

    pub async fn notify_leader_changed(&self) {
        self.notifications.notify_leader_changed().await;
    }

    pub async fn notify_follower_slowness(&self) {
        self.notifications.notify_follower_slowness().await;
    }

    pub async fn notify_extended_no_leader(&self) {
        self.notifications.notify_extended_no_leader().await;
    }

    pub async fn notify_log_failed(&self) {
        self.notifications.notify_log_failed().await;
    }

    pub async fn notify_install_snapshot_from_leader(&self) {
        self.notifications.notify_install_snapshot_from_leader().await;
    }

    pub async fn notify_server_shutdown(&self, all_server: bool) {
        self.notifications.notify_server_shutdown(all_server).await;
    }

    /// Run on group-remove or node shutdown: clears cached
    /// state-machine-data and drains the container-op pool so outstanding
    /// apply-side work finishes before the state machine is torn down.
    pub async fn close(&self) {
        self.cache.clear();
        self.container_op_pool.drain().await;
    }
}
