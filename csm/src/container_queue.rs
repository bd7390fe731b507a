use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};

use crate::container_op_pool::ContainerOpPool;

type BoxedTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Per-container FIFO serialization.
///
/// `submit` returns a future that completes when the task finishes;
/// concurrent submissions for the same container execute strictly serially,
/// *in submission order* — each container owns a queue of boxed tasks
/// drained by a single drain loop, the same structure `ChunkExecutorPoolSet`
/// uses per lane. Unlike that pool's fixed lanes, a container's drain loop
/// is spawned lazily on first use and retired once its queue empties, since
/// container ids are unbounded in cardinality and most are idle most of the
/// time; the drain loop itself runs on the shared [`ContainerOpPool`], so the
/// number of containers with work actually in flight at once is bounded by
/// the pool size rather than by how many distinct containers see traffic.
///
/// Retirement reuses the same race-free pattern as the map lookup: a
/// `pending` counter on the queue is incremented before a task is enqueued
/// and decremented only once that task has finished running, and the queue
/// entry is removed from the map only when a decrement observes the count
/// hit zero — gated through `DashMap::remove_if` so the check and the
/// removal share one shard lock. A concurrent `submit` that lands in
/// between increments `pending` again before the removal can observe zero,
/// so a queue is never dropped out from under a task that is using it.
#[derive(Clone)]
pub struct ContainerTaskQueueMap {
    queues: Arc<DashMap<i64, Arc<ContainerQueue>>>,
    pool: Arc<ContainerOpPool>,
}

#[derive(Default)]
struct ContainerQueue {
    state: Mutex<QueueState>,
    pending: AtomicUsize,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<BoxedTask>,
    draining: bool,
}

impl ContainerTaskQueueMap {
    pub fn new(pool: Arc<ContainerOpPool>) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            pool,
        }
    }

    /// Runs `task` strictly after every earlier-submitted task for the same
    /// `container_id` has finished, and strictly before any later one. The
    /// caller does not choose which pool `task` runs on; it runs on the
    /// container-op pool this map was built with.
    pub async fn submit<F, Fut, T>(&self, container_id: i64, task: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self
            .queues
            .entry(container_id)
            .or_insert_with(|| Arc::new(ContainerQueue::default()))
            .clone();

        queue.pending.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        let queues = self.queues.clone();
        let retire_queue = queue.clone();
        let boxed: BoxedTask = Box::new(move || {
            Box::pin(async move {
                let result = task().await;
                let _ = tx.send(result);
                if retire_queue.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    queues.remove_if(&container_id, |_, q| q.pending.load(Ordering::SeqCst) == 0);
                }
            })
        });

        let should_spawn_drain = {
            let mut state = queue.state.lock().await;
            state.tasks.push_back(boxed);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if should_spawn_drain {
            let queue = queue.clone();
            self.pool.spawn(Self::drain(queue));
        }

        rx.await.expect("container queue task dropped its result")
    }

    /// Pops and runs one task at a time until the queue is empty, then
    /// marks itself idle and returns. A `submit` that pushes while this is
    /// still running never spawns a second drain loop (see `submit`), so
    /// exactly one of these is ever active per container at a time.
    async fn drain(queue: Arc<ContainerQueue>) {
        loop {
            let next = {
                let mut state = queue.state.lock().await;
                match state.tasks.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        state.draining = false;
                        None
                    }
                }
            };
            let Some(task) = next else {
                break;
            };
            task().await;
        }
    }

    /// Number of containers with a live (possibly empty, but not yet
    /// retired) queue entry. Exposed for tests.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
