use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Bounds concurrency for apply-side tasks and other generic asynchronous
/// work, sized from `Config::container_op_pool_size` (`numContainerOpExecutors`).
///
/// Unlike `ChunkExecutorPoolSet`, which pins work to one of `N` fixed lanes
/// by key, this pool has no per-key pinning: any task may run on any free
/// slot. [`ContainerTaskQueueMap`](crate::container_queue::ContainerTaskQueueMap)
/// uses it to bound how many per-container drain loops run at once.
pub struct ContainerOpPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ContainerOpPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "container-op pool needs at least one slot");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Spawns `task` once a slot is free. The permit is held for the
    /// duration of `task`, so the number of these spawned futures actually
    /// running at any time never exceeds `capacity`.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("container-op pool semaphore closed");
            task.await;
        });
    }

    /// Blocks until every slot is free, i.e. no spawned task is still
    /// running. Used on shutdown to let outstanding apply-side work finish
    /// before the state machine is torn down.
    pub async fn drain(&self) {
        let _ = self.semaphore.acquire_many(self.capacity as u32).await;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
