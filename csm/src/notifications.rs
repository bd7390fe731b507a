use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::apply::ApplyCoordinator;
use crate::cache::StateMachineDataCache;
use crate::dispatcher::ContainerDispatcher;
use crate::gid::Gid;
use crate::log::LogIndex;

/// The back-reference this state machine holds on its outer server, modeled
/// as an injected capability rather than ownership (Design Notes, "Cyclic
/// references").
#[async_trait]
pub trait OuterServerCapability: Send + Sync {
    async fn notify_group_add(&self, gid: Gid);
    async fn handle_node_slowness(&self, gid: Gid);
    async fn handle_no_leader(&self, gid: Gid);
    async fn handle_apply_transaction_failure(&self, gid: Gid);
    async fn handle_leader_changed_notification(&self, gid: Gid);
    async fn handle_node_log_failure(&self, gid: Gid);
    async fn handle_install_snapshot_from_leader(&self, gid: Gid);
    async fn notify_group_remove(&self, gid: Gid);
    /// Count of groups this host has already quasi-closed vs. the total it
    /// serves, sampled by `notify_server_shutdown` before scheduling the
    /// host terminate.
    async fn closed_group_count(&self) -> (usize, usize);
    async fn terminate_host(&self);
}

/// Process-wide single-shot latch: many groups closing at once must
/// terminate the host exactly once. Initialized at startup, never reset.
static HOST_SHUTDOWN_SCHEDULED: AtomicBool = AtomicBool::new(false);

/// Routes consensus-raised notifications to cache eviction,
/// apply-coordinator bookkeeping, and the outer server capability.
pub struct NotificationSurface {
    gid: Gid,
    cache: Arc<StateMachineDataCache>,
    apply: Arc<ApplyCoordinator>,
    dispatcher: Arc<dyn ContainerDispatcher>,
    container_bcsid: Arc<DashMap<i64, u64>>,
    outer: Arc<dyn OuterServerCapability>,
    wait_on_all_followers: bool,
    /// Slowest follower's next-index, as last reported by
    /// `report_follower_progress`. Starts at 0 (retain everything) so strict
    /// mode never evicts ahead of real follower data.
    min_follower_next: AtomicU64,
}

impl NotificationSurface {
    pub fn new(
        gid: Gid,
        cache: Arc<StateMachineDataCache>,
        apply: Arc<ApplyCoordinator>,
        dispatcher: Arc<dyn ContainerDispatcher>,
        container_bcsid: Arc<DashMap<i64, u64>>,
        outer: Arc<dyn OuterServerCapability>,
        wait_on_all_followers: bool,
    ) -> Self {
        Self {
            gid,
            cache,
            apply,
            dispatcher,
            container_bcsid,
            outer,
            wait_on_all_followers,
            min_follower_next: AtomicU64::new(0),
        }
    }

    pub fn notify_term_index_updated(&self, term: crate::log::Term, index: LogIndex) {
        self.apply.notify_term_index_updated(term, index);
    }

    /// Cache lifecycle hook run after a successful commit at `index`.
    /// Relaxed mode drops everything up to `index`; strict mode instead
    /// drops up to the slowest follower's next-index as last reported via
    /// `report_follower_progress`, so a slow follower backpressures
    /// admission rather than forcing a disk re-read.
    pub fn after_commit(&self, index: LogIndex) {
        if self.wait_on_all_followers {
            let bound = self.min_follower_next.load(Ordering::SeqCst).min(index.value());
            self.cache.remove_up_to(bound);
        } else {
            self.cache.remove_up_to(index.value());
        }
    }

    /// Records the slowest follower's next-index, as observed by the
    /// consensus integration. Only consulted in strict mode
    /// (`wait_on_all_followers = true`); has no effect otherwise.
    pub fn report_follower_progress(&self, min_follower_next: u64) {
        self.min_follower_next.store(min_follower_next, Ordering::SeqCst);
    }

    pub fn notify_not_leader(&self) {
        self.cache.clear();
    }

    pub fn truncate(&self, index: LogIndex) {
        self.cache.remove_above(index.value());
    }

    /// Best-effort quasi-close of every container this replica owns.
    pub async fn notify_group_remove(&self) {
        for entry in self.container_bcsid.iter() {
            self.dispatcher
                .quasi_close_container(*entry.key(), "group removed")
                .await;
        }
        self.outer.notify_group_remove(self.gid).await;
    }

    pub async fn notify_leader_changed(&self) {
        self.outer.handle_leader_changed_notification(self.gid).await;
    }

    pub async fn notify_follower_slowness(&self) {
        self.outer.handle_node_slowness(self.gid).await;
    }

    pub async fn notify_extended_no_leader(&self) {
        self.outer.handle_no_leader(self.gid).await;
    }

    pub async fn notify_log_failed(&self) {
        self.outer.handle_node_log_failure(self.gid).await;
    }

    pub async fn notify_install_snapshot_from_leader(&self) {
        self.outer.handle_install_snapshot_from_leader(self.gid).await;
    }

    /// Schedules a one-time delayed host terminate, guarded by a process-wide
    /// latch so concurrent shutdown notifications across many groups don't
    /// each try to terminate the host.
    pub async fn notify_server_shutdown(&self, all_server: bool) {
        if !all_server {
            return;
        }
        if HOST_SHUTDOWN_SCHEDULED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let (closed, total) = self.outer.closed_group_count().await;
        tracing::info!(closed, total, "scheduling host terminate");
        self.outer.terminate_host().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BlockId, ContainerRequest, ContainerResponse};
    use crate::container_queue::ContainerTaskQueueMap;
    use crate::dispatcher::{DataChannel, DispatchContext};
    use crate::metrics::Metrics;
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    struct FakeDispatcher {
        quasi_closed: std::sync::Mutex<Vec<i64>>,
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
            _container_to_bcsid: &HashMap<i64, u64>,
        ) -> anyhow::Result<HashSet<i64>> {
            Ok(HashSet::new())
        }

        async fn is_finalized_block_exist(&self, _block: BlockId) -> bool {
            false
        }

        async fn add_finalized_block(&self, _block: BlockId) {}

        async fn mark_container_for_close(&self, _container_id: i64) {}

        async fn quasi_close_container(&self, container_id: i64, _reason: &str) {
            self.quasi_closed.lock().unwrap().push(container_id);
        }
    }

    struct FakeOuter {
        group_removes: AtomicUsize,
    }

    #[async_trait]
    impl OuterServerCapability for FakeOuter {
        async fn notify_group_add(&self, _gid: Gid) {}
        async fn handle_node_slowness(&self, _gid: Gid) {}
        async fn handle_no_leader(&self, _gid: Gid) {}
        async fn handle_apply_transaction_failure(&self, _gid: Gid) {}
        async fn handle_leader_changed_notification(&self, _gid: Gid) {}
        async fn handle_node_log_failure(&self, _gid: Gid) {}
        async fn handle_install_snapshot_from_leader(&self, _gid: Gid) {}
        async fn notify_group_remove(&self, _gid: Gid) {
            self.group_removes.fetch_add(1, Ordering::SeqCst);
        }
        async fn closed_group_count(&self) -> (usize, usize) {
            (1, 1)
        }
        async fn terminate_host(&self) {}
    }

    fn surface(
        dispatcher: Arc<FakeDispatcher>,
        outer: Arc<FakeOuter>,
        container_bcsid: Arc<DashMap<i64, u64>>,
        wait_on_all_followers: bool,
    ) -> NotificationSurface {
        let metrics = Arc::new(Metrics::new());
        NotificationSurface::new(
            Gid::random(),
            Arc::new(StateMachineDataCache::new(1024, metrics.clone())),
            Arc::new(ApplyCoordinator::new(
                8,
                Arc::new(ContainerTaskQueueMap::new(Arc::new(
                    crate::container_op_pool::ContainerOpPool::new(4),
                ))),
                dispatcher.clone(),
                container_bcsid.clone(),
                metrics,
                Arc::new(AtomicBool::new(true)),
                crate::log::LogPosition::default(),
            )),
            dispatcher,
            container_bcsid,
            outer,
            wait_on_all_followers,
        )
    }

    #[tokio::test]
    async fn leader_step_down_clears_cache() {
        let dispatcher = Arc::new(FakeDispatcher {
            quasi_closed: std::sync::Mutex::new(Vec::new()),
        });
        let outer = Arc::new(FakeOuter {
            group_removes: AtomicUsize::new(0),
        });
        let surface = surface(dispatcher, outer, Arc::new(DashMap::new()), false);

        surface.cache.insert(20, Bytes::from_static(b"a"));
        surface.cache.insert(21, Bytes::from_static(b"b"));
        surface.cache.insert(22, Bytes::from_static(b"c"));

        surface.notify_not_leader();

        assert!(surface.cache.is_empty());
    }

    #[tokio::test]
    async fn group_remove_quasi_closes_every_container() {
        let dispatcher = Arc::new(FakeDispatcher {
            quasi_closed: std::sync::Mutex::new(Vec::new()),
        });
        let outer = Arc::new(FakeOuter {
            group_removes: AtomicUsize::new(0),
        });
        let container_bcsid = Arc::new(DashMap::new());
        container_bcsid.insert(7, 2);
        container_bcsid.insert(9, 4);
        let surface = surface(dispatcher.clone(), outer.clone(), container_bcsid, false);

        surface.notify_group_remove().await;

        let mut closed = dispatcher.quasi_closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, vec![7, 9]);
        assert_eq!(outer.group_removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relaxed_mode_drops_cache_up_to_applied_index() {
        let dispatcher = Arc::new(FakeDispatcher {
            quasi_closed: std::sync::Mutex::new(Vec::new()),
        });
        let outer = Arc::new(FakeOuter {
            group_removes: AtomicUsize::new(0),
        });
        let surface = surface(dispatcher, outer, Arc::new(DashMap::new()), false);

        surface.cache.insert(1, Bytes::from_static(b"a"));
        surface.cache.insert(2, Bytes::from_static(b"b"));

        surface.after_commit(LogIndex(1));

        assert!(surface.cache.get(1).is_none());
        assert!(surface.cache.get(2).is_some());
    }

    #[tokio::test]
    async fn strict_mode_waits_for_reported_follower_progress() {
        let dispatcher = Arc::new(FakeDispatcher {
            quasi_closed: std::sync::Mutex::new(Vec::new()),
        });
        let outer = Arc::new(FakeOuter {
            group_removes: AtomicUsize::new(0),
        });
        let surface = surface(dispatcher, outer, Arc::new(DashMap::new()), true);

        surface.cache.insert(1, Bytes::from_static(b"a"));
        surface.cache.insert(2, Bytes::from_static(b"b"));

        // No follower progress reported yet: strict mode must not evict
        // past index 0, unlike relaxed mode which would drop up to 2 here.
        surface.after_commit(LogIndex(2));
        assert!(surface.cache.get(1).is_some());
        assert!(surface.cache.get(2).is_some());

        surface.report_follower_progress(1);
        surface.after_commit(LogIndex(2));
        assert!(surface.cache.get(1).is_none());
        assert!(surface.cache.get(2).is_some());
    }
}
