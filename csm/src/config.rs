/// Recognized configuration options. Loading these values out of a config
/// file or environment is the external loader's job; this crate only
/// consumes the resulting struct rather than self-loading.
#[derive(Debug, Clone)]
pub struct Config {
    /// `leader.pending.bytes.limit` — cache byte budget.
    pub cache_byte_budget: u64,

    /// `numContainerOpExecutors` — size of the container-op pool used for
    /// apply-side tasks and generic asynchronous work.
    pub container_op_pool_size: usize,

    /// Number of chunk-executor pools; a WriteChunk with local block id `L`
    /// always runs on pool `L mod N`.
    pub chunk_executor_pool_count: usize,

    /// `maxPendingApplyTxns` — apply-admission semaphore permits.
    pub max_pending_apply_txns: usize,

    /// `waitOnAllFollowers` — cache retention policy: strict (true) waits for
    /// the slowest follower's next-index before evicting; relaxed (false,
    /// default) evicts as soon as an entry is applied.
    pub wait_on_all_followers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_byte_budget: 32 * 1024 * 1024,
            container_op_pool_size: 8,
            chunk_executor_pool_count: 8,
            max_pending_apply_txns: 256,
            wait_on_all_followers: false,
        }
    }
}
