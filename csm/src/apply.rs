use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::command::{CommandKind, ContainerRequest, ContainerResponse};
use crate::container_queue::ContainerTaskQueueMap;
use crate::dispatcher::{ContainerDispatcher, DispatchContext};
use crate::error::{Result, StateMachineError};
use crate::log::{LogIndex, LogPosition, Term};
use crate::metrics::Metrics;

/// Admission-controls apply-transactions, advances `last_applied`
/// contiguously, maintains the health flag, and owns the
/// `container -> BCSID` map (the snapshotable state).
pub struct ApplyCoordinator {
    admission: Arc<Semaphore>,
    state: Mutex<ApplyState>,
    healthy: Arc<AtomicBool>,
    container_queues: Arc<ContainerTaskQueueMap>,
    dispatcher: Arc<dyn ContainerDispatcher>,
    container_bcsid: Arc<DashMap<i64, u64>>,
    metrics: Arc<Metrics>,
}

struct ApplyState {
    /// Decouples "this index is done" from "the global watermark has
    /// advanced": apply completion is reordered by per-container
    /// parallelism, so a map (rather than a counter) is required to
    /// preserve the invariant that `last_applied` never skips a live index.
    completion_map: BTreeMap<u64, Term>,
    last_applied: LogPosition,
}

impl ApplyCoordinator {
    pub fn new(
        max_pending_apply_txns: usize,
        container_queues: Arc<ContainerTaskQueueMap>,
        dispatcher: Arc<dyn ContainerDispatcher>,
        container_bcsid: Arc<DashMap<i64, u64>>,
        metrics: Arc<Metrics>,
        healthy: Arc<AtomicBool>,
        initial: LogPosition,
    ) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(max_pending_apply_txns)),
            state: Mutex::new(ApplyState {
                completion_map: BTreeMap::new(),
                last_applied: initial,
            }),
            healthy,
            container_queues,
            dispatcher,
            container_bcsid,
            metrics,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn last_applied(&self) -> LogPosition {
        self.state.lock().last_applied
    }

    /// Installs `position` as `last_applied` directly, used when a snapshot
    /// restore supplies a starting point outside the normal commit path.
    pub fn restore_last_applied(&self, position: LogPosition) {
        self.state.lock().last_applied = position;
    }

    /// Flips `healthy` `true -> false` exactly once via CAS. Returns `true`
    /// the first time this call actually performs the transition, so the
    /// caller can drive "notify outer server" exactly once.
    pub fn mark_unhealthy(&self) -> bool {
        self.healthy
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Registers a no-op completion for a non-data log entry (conf changes,
    /// metadata) so `last_applied` can advance across it, then drains the
    /// completion map as far as contiguity allows.
    pub fn notify_term_index_updated(&self, term: Term, index: LogIndex) {
        let mut state = self.state.lock();
        state.completion_map.insert(index.value(), term);
        Self::advance_last_applied_locked(&mut state);
    }

    /// Admission-controls, dispatches via the per-container task queue, and
    /// folds the result into `last_applied`/`healthy`.
    pub async fn apply_transaction(
        &self,
        term: Term,
        index: LogIndex,
        req: ContainerRequest,
    ) -> Result<ContainerResponse> {
        if !self.is_healthy() {
            return Err(StateMachineError::Unhealthy);
        }

        let _permit = self
            .admission
            .acquire()
            .await
            .expect("apply admission semaphore closed");

        let container_id = req.container_id;
        let cmd = req.cmd;
        let dispatcher = self.dispatcher.clone();
        let ctx = DispatchContext {
            stage: crate::command::Stage::CommitData,
            term,
            index,
            container_bcsid: self.container_bcsid.clone(),
        };

        let dispatch_result = self
            .container_queues
            .submit(container_id, move || async move {
                dispatcher.dispatch(&req, &ctx).await
            })
            .await;

        // The permit is released here regardless of outcome (scope end),
        // converting unbounded commit pressure into bounded concurrency.
        match dispatch_result {
            Ok(resp) if resp.result.is_tolerated() => {
                if self.is_healthy() {
                    self.update_bcsid(container_id, index.value(), cmd);
                    let mut state = self.state.lock();
                    state.completion_map.insert(index.value(), term);
                    Self::advance_last_applied_locked(&mut state);
                }
                Ok(resp)
            }
            Ok(resp) => {
                self.metrics.apply_failures.inc();
                let err = StateMachineError::ApplyFailed(resp.result);
                if err.is_fatal() {
                    self.mark_unhealthy();
                }
                Err(err)
            }
            Err(err) => {
                tracing::warn!(error = %err, "apply dispatch failed");
                self.metrics.apply_failures.inc();
                let err = StateMachineError::ApplyFailed(crate::command::ContainerResult::Error);
                if err.is_fatal() {
                    self.mark_unhealthy();
                }
                Err(err)
            }
        }
    }

    fn update_bcsid(&self, container_id: i64, index: u64, cmd: CommandKind) {
        if cmd == CommandKind::DeleteContainer {
            self.container_bcsid.remove(&container_id);
        } else {
            self.container_bcsid.insert(container_id, index);
        }
    }

    fn advance_last_applied_locked(state: &mut ApplyState) {
        loop {
            let next = state.last_applied.index.value() + 1;
            let Some(term) = state.completion_map.remove(&next) else {
                break;
            };
            state.last_applied = LogPosition {
                term,
                index: LogIndex(next),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BlockId, CommandKind};
    use crate::dispatcher::DataChannel;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct SlowDispatcher {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl ContainerDispatcher for SlowDispatcher {
        async fn validate_container_command(&self, _req: &ContainerRequest) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_container_not_open_error(&self, _err: &anyhow::Error) -> bool {
            false
        }

        async fn dispatch(
            &self,
            _req: &ContainerRequest,
            _ctx: &DispatchContext,
        ) -> anyhow::Result<ContainerResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ContainerResponse::success())
        }

        async fn get_stream_data_channel(
            &self,
            _req: &ContainerRequest,
        ) -> anyhow::Result<Box<dyn DataChannel>> {
            unimplemented!()
        }

        async fn build_missing_container_set_and_validate(
            &self,
            _container_to_bcsid: &std::collections::HashMap<i64, u64>,
        ) -> anyhow::Result<HashSet<i64>> {
            Ok(HashSet::new())
        }

        async fn is_finalized_block_exist(&self, _block: BlockId) -> bool {
            false
        }

        async fn add_finalized_block(&self, _block: BlockId) {}

        async fn mark_container_for_close(&self, _container_id: i64) {}

        async fn quasi_close_container(&self, _container_id: i64, _reason: &str) {}
    }

    fn request(container_id: i64) -> ContainerRequest {
        ContainerRequest {
            cmd: CommandKind::WriteChunk,
            container_id,
            block: Some(BlockId {
                container_id,
                local_id: 100,
            }),
            chunk_index: 0,
            token: None,
            data: bytes::Bytes::new(),
            pipeline_id: None,
        }
    }

    #[tokio::test]
    async fn admission_bounds_concurrency() {
        // permits=2, five slow apply-transactions in flight at once.
        let dispatcher = Arc::new(SlowDispatcher {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: std::time::Duration::from_millis(30),
        });
        let coordinator = Arc::new(ApplyCoordinator::new(
            2,
            Arc::new(ContainerTaskQueueMap::new(Arc::new(
                crate::container_op_pool::ContainerOpPool::new(4),
            ))),
            dispatcher.clone(),
            Arc::new(DashMap::new()),
            Arc::new(Metrics::new()),
            Arc::new(AtomicBool::new(true)),
            LogPosition::default(),
        ));

        let mut handles = Vec::new();
        for i in 1..=5u64 {
            let coordinator = coordinator.clone();
            // Different containers so the per-container queue doesn't itself
            // serialize these; only the admission semaphore should.
            let req = request(i as i64);
            handles.push(tokio::spawn(async move {
                coordinator
                    .apply_transaction(Term(1), LogIndex(i), req)
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(dispatcher.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(coordinator.last_applied().index, LogIndex(5));
    }

    #[tokio::test]
    async fn contiguous_advancement_across_non_data_entries() {
        let dispatcher = Arc::new(SlowDispatcher {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: std::time::Duration::from_millis(1),
        });
        let coordinator = ApplyCoordinator::new(
            8,
            Arc::new(ContainerTaskQueueMap::new(Arc::new(
                crate::container_op_pool::ContainerOpPool::new(4),
            ))),
            dispatcher,
            Arc::new(DashMap::new()),
            Arc::new(Metrics::new()),
            Arc::new(AtomicBool::new(true)),
            LogPosition::default(),
        );

        coordinator
            .apply_transaction(Term(1), LogIndex(1), request(7))
            .await
            .unwrap();
        // A conf-change / metadata entry at index 2 with no data payload.
        coordinator.notify_term_index_updated(Term(1), LogIndex(2));
        coordinator
            .apply_transaction(Term(1), LogIndex(3), request(7))
            .await
            .unwrap();

        assert_eq!(coordinator.last_applied().index, LogIndex(3));
    }
}
