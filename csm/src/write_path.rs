use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cache::StateMachineDataCache;
use crate::command::{ContainerRequest, Stage};
use crate::dispatcher::{ContainerDispatcher, DispatchContext};
use crate::error::{Result, StateMachineError};
use crate::executor_pool::ChunkExecutorPoolSet;
use crate::log::{LogIndex, Term};
use crate::metrics::Metrics;

/// Writes WriteChunk payload to disk outside the replicated log, on every
/// replica, and lets `flush` express "payload durability precedes commit
/// acknowledgment" as a single awaitable.
pub struct WritePath {
    dispatcher: Arc<dyn ContainerDispatcher>,
    executors: Arc<ChunkExecutorPoolSet>,
    cache: Arc<StateMachineDataCache>,
    container_bcsid: Arc<DashMap<i64, u64>>,
    metrics: Arc<Metrics>,
    healthy: Arc<AtomicBool>,
    in_flight: Mutex<BTreeMap<u64, oneshot::Receiver<bool>>>,
    is_leader: AtomicBool,
}

impl WritePath {
    pub fn new(
        dispatcher: Arc<dyn ContainerDispatcher>,
        executors: Arc<ChunkExecutorPoolSet>,
        cache: Arc<StateMachineDataCache>,
        container_bcsid: Arc<DashMap<i64, u64>>,
        metrics: Arc<Metrics>,
        healthy: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dispatcher,
            executors,
            cache,
            container_bcsid,
            metrics,
            healthy,
            in_flight: Mutex::new(BTreeMap::new()),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }

    /// Step 1-4 of `writeStateMachineData`: cache on leader, dispatch to the
    /// block's executor, and track the in-flight result by index.
    pub fn write(&self, term: Term, index: LogIndex, req: ContainerRequest) {
        if self.is_leader.load(Ordering::SeqCst) {
            self.cache.insert(index.value(), req.data.clone());
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.in_flight.lock().insert(index.value(), done_rx);

        let dispatcher = self.dispatcher.clone();
        let healthy = self.healthy.clone();
        let metrics = self.metrics.clone();
        let local_block = req.block.map(|b| b.local_id).unwrap_or(0);
        let executors = self.executors.clone();
        let container_bcsid = self.container_bcsid.clone();

        tokio::spawn(async move {
            let ctx = DispatchContext {
                stage: Stage::WriteData,
                term,
                index,
                container_bcsid,
            };
            let result = executors
                .submit(local_block, move || async move { dispatcher.dispatch(&req, &ctx).await })
                .await;

            let ok = match result {
                Ok(resp) if resp.result.is_tolerated() => true,
                Ok(resp) => {
                    metrics.apply_failures.inc();
                    let err = StateMachineError::ApplyFailed(resp.result);
                    if err.is_fatal() {
                        healthy.store(false, Ordering::SeqCst);
                    }
                    false
                }
                Err(err) => {
                    metrics.apply_failures.inc();
                    let err = StateMachineError::PayloadWriteFailed(err.to_string());
                    if err.is_fatal() {
                        healthy.store(false, Ordering::SeqCst);
                    }
                    false
                }
            };
            let _ = done_tx.send(ok);
        });
    }

    /// Awaits every in-flight write with index <= `up_to`, as consensus does
    /// before advancing the durable log watermark.
    pub async fn flush(&self, up_to: LogIndex) -> Result<()> {
        let head = {
            let mut in_flight = self.in_flight.lock();
            let tail = in_flight.split_off(&(up_to.value() + 1));
            std::mem::replace(&mut *in_flight, tail)
        };

        let results = join_all(head.into_values()).await;
        if results
            .into_iter()
            .any(|r| matches!(r, Ok(false) | Err(_)))
        {
            return Err(StateMachineError::PayloadWriteFailed(
                "one or more chunk writes up to the flush index failed".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BlockId, CommandKind, ContainerResponse, ContainerResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};

    struct FakeDispatcher {
        fail: bool,
    }

    #[async_trait]
    impl ContainerDispatcher for FakeDispatcher {
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
            if self.fail {
                Ok(ContainerResponse {
                    result: ContainerResult::Error,
                    message: Some("disk full".to_string()),
                })
            } else {
                Ok(ContainerResponse::success())
            }
        }

        async fn get_stream_data_channel(
            &self,
            _req: &ContainerRequest,
        ) -> anyhow::Result<Box<dyn crate::dispatcher::DataChannel>> {
            unimplemented!()
        }

        async fn build_missing_container_set_and_validate(
            &self,
            _container_to_bcsid: &HashMap<i64, u64>,
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

    fn request(container_id: i64, data: &'static [u8]) -> ContainerRequest {
        ContainerRequest {
            cmd: CommandKind::WriteChunk,
            container_id,
            block: Some(BlockId {
                container_id,
                local_id: 1,
            }),
            chunk_index: 0,
            token: None,
            data: Bytes::from_static(data),
            pipeline_id: None,
        }
    }

    #[tokio::test]
    async fn leader_caches_payload_then_flush_succeeds() {
        let dispatcher = Arc::new(FakeDispatcher { fail: false });
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(StateMachineDataCache::new(1024, metrics.clone()));
        let path = WritePath::new(
            dispatcher,
            Arc::new(ChunkExecutorPoolSet::new(2)),
            cache.clone(),
            Arc::new(DashMap::new()),
            metrics,
            Arc::new(AtomicBool::new(true)),
        );
        path.set_leader(true);

        path.write(Term(1), LogIndex(10), request(7, b"abcd"));
        assert_eq!(cache.get(10), Some(Bytes::from_static(b"abcd")));

        path.flush(LogIndex(10)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_write_marks_unhealthy_and_fails_flush() {
        let dispatcher = Arc::new(FakeDispatcher { fail: true });
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(StateMachineDataCache::new(1024, metrics.clone()));
        let healthy = Arc::new(AtomicBool::new(true));
        let path = WritePath::new(
            dispatcher,
            Arc::new(ChunkExecutorPoolSet::new(2)),
            cache,
            Arc::new(DashMap::new()),
            metrics,
            healthy.clone(),
        );

        path.write(Term(1), LogIndex(1), request(7, b"abcd"));
        let result = path.flush(LogIndex(1)).await;

        assert!(result.is_err());
        assert!(!healthy.load(Ordering::SeqCst));
    }
}
