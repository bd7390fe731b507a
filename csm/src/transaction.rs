use std::sync::Arc;

use bytes::Bytes;

use crate::command::{CommandKind, ContainerRequest};
use crate::dispatcher::ContainerDispatcher;
use crate::error::StateMachineError;
use crate::gid::Gid;
use crate::log::LogEntry;
use crate::metrics::Metrics;

/// The two views of a request plus the bookkeeping needed for latency
/// accounting, carried together from the moment a transaction is started
/// through apply.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    /// Full request, including user data; used for local execution.
    pub request_view: ContainerRequest,
    /// Request with user data stripped; this is all that is replicated.
    pub log_view: ContainerRequest,
    pub start_time_nanos: u64,
    /// WriteChunk payload, carried alongside the log entry rather than
    /// inside it.
    pub state_machine_data: Option<Bytes>,
}

/// Outcome of starting a transaction: either a context ready to replicate
/// and apply, or a failure recorded without ever reaching the log.
pub enum TransactionOutcome {
    Ready(Box<TransactionContext>),
    Failed(StateMachineError),
}

/// Builds [`TransactionContext`]s on both the leader path (from a client
/// request) and the replica path (from an already-replicated log entry).
pub struct TransactionPipeline {
    dispatcher: Arc<dyn ContainerDispatcher>,
    metrics: Arc<Metrics>,
}

impl TransactionPipeline {
    pub fn new(dispatcher: Arc<dyn ContainerDispatcher>, metrics: Arc<Metrics>) -> Self {
        Self { dispatcher, metrics }
    }

    /// Leader-side: validate, split payload from metadata, and register
    /// finalized blocks synchronously so later requests see them.
    pub async fn start_transaction_for_client(
        &self,
        req: ContainerRequest,
        pipeline_id: Gid,
        start_time_nanos: u64,
    ) -> TransactionOutcome {
        if let Err(err) = self.dispatcher.validate_container_command(&req).await {
            if self.dispatcher.is_container_not_open_error(&err) {
                self.metrics.not_open_verify_failures.inc();
            } else {
                self.metrics.start_transaction_verify_failures.inc();
            }
            return TransactionOutcome::Failed(StateMachineError::ValidationFailed(err.to_string()));
        }

        if req.cmd.touches_block() {
            if let Some(block) = req.block {
                if self.dispatcher.is_finalized_block_exist(block).await {
                    return TransactionOutcome::Failed(StateMachineError::BlockAlreadyFinalized);
                }
            }
        }

        let mut state_machine_data = None;
        if req.cmd == CommandKind::WriteChunk {
            if req.data.is_empty() {
                return TransactionOutcome::Failed(StateMachineError::ValidationFailed(
                    "WriteChunk payload must not be empty".to_string(),
                ));
            }
            state_machine_data = Some(req.data.clone());
        }

        if req.cmd == CommandKind::FinalizeBlock {
            if let Some(block) = req.block {
                self.dispatcher.add_finalized_block(block).await;
            }
        }

        let log_view = req.to_log_view(pipeline_id);
        TransactionOutcome::Ready(Box::new(TransactionContext {
            request_view: req,
            log_view,
            start_time_nanos,
            state_machine_data,
        }))
    }

    /// Any-replica: decode the log-view from a committed log entry and
    /// reconstruct the request view, merging in its side-channel payload for
    /// WriteChunk. If decoding fails the transaction is marked failed rather
    /// than propagated as a panic; consensus surfaces the error.
    pub fn start_transaction_for_log_entry(
        &self,
        entry: LogEntry,
        start_time_nanos: u64,
    ) -> TransactionOutcome {
        let log_view: ContainerRequest = match bincode::deserialize(&entry.log_data) {
            Ok(view) => view,
            Err(err) => {
                return TransactionOutcome::Failed(StateMachineError::DecodeFailed(err.to_string()));
            }
        };

        let mut request_view = log_view.clone();
        if log_view.cmd == CommandKind::WriteChunk {
            match &entry.state_machine_data {
                Some(payload) => request_view.data = payload.clone(),
                None => {
                    return TransactionOutcome::Failed(StateMachineError::DecodeFailed(
                        "WriteChunk log entry missing state-machine-data".to_string(),
                    ));
                }
            }
        }

        TransactionOutcome::Ready(Box::new(TransactionContext {
            request_view,
            log_view,
            start_time_nanos,
            state_machine_data: entry.state_machine_data,
        }))
    }
}
