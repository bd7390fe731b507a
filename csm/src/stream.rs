use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::command::{ContainerRequest, ContainerResponse, Stage};
use crate::dispatcher::{ContainerDispatcher, DataChannel};
use crate::error::{Result, StateMachineError};
use crate::gid::Gid;
use crate::log::{LogIndex, Term};

struct OpenStream {
    channel: Box<dyn DataChannel>,
    put_block_request: ContainerRequest,
}

/// The optional fast path for large blocks: bytes go directly to a dispatcher
/// data channel out-of-band, and only the terminal PutBlock is replicated.
pub struct StreamManager {
    dispatcher: Arc<dyn ContainerDispatcher>,
    container_bcsid: Arc<DashMap<i64, u64>>,
    open: DashMap<Gid, Arc<Mutex<Option<OpenStream>>>>,
}

impl StreamManager {
    pub fn new(dispatcher: Arc<dyn ContainerDispatcher>, container_bcsid: Arc<DashMap<i64, u64>>) -> Self {
        Self {
            dispatcher,
            container_bcsid,
            open: DashMap::new(),
        }
    }

    /// Opens a data sink for `req` (whose `block` identifies the target) and
    /// returns the handle callers use to write bytes and later `link`.
    pub async fn open(&self, req: ContainerRequest, put_block_request: ContainerRequest) -> Result<Gid> {
        let channel = self
            .dispatcher
            .get_stream_data_channel(&req)
            .await
            .map_err(|err| StateMachineError::PayloadWriteFailed(err.to_string()))?;

        let id = Gid::random();
        self.open.insert(
            id,
            Arc::new(Mutex::new(Some(OpenStream {
                channel,
                put_block_request,
            }))),
        );
        Ok(id)
    }

    pub async fn write(&self, id: Gid, data: Bytes) -> Result<()> {
        let slot = self
            .open
            .get(&id)
            .ok_or_else(|| StateMachineError::PayloadWriteFailed("unknown stream".to_string()))?
            .clone();
        let guard = slot.lock().await;
        match guard.as_ref() {
            Some(entry) => entry
                .channel
                .write(data)
                .await
                .map_err(|err| StateMachineError::PayloadWriteFailed(err.to_string())),
            None => Err(StateMachineError::PayloadWriteFailed(
                "stream already linked".to_string(),
            )),
        }
    }

    /// Closes the channel and dispatches the cached PutBlock as a commit.
    /// On any failure the channel is cleaned up and the stream is dropped
    /// without ever being treated as linked.
    pub async fn link(&self, id: Gid, term: Term, index: LogIndex) -> Result<ContainerResponse> {
        let (_, slot) = self
            .open
            .remove(&id)
            .ok_or_else(|| StateMachineError::PayloadWriteFailed("unknown stream".to_string()))?;
        let mut guard = slot.lock().await;
        let entry = guard
            .take()
            .ok_or_else(|| StateMachineError::PayloadWriteFailed("stream already linked".to_string()))?;

        if let Err(err) = entry.channel.close().await {
            entry.channel.clean_up().await;
            return Err(StateMachineError::PayloadWriteFailed(err.to_string()));
        }

        let ctx = crate::dispatcher::DispatchContext {
            stage: Stage::CommitData,
            term,
            index,
            container_bcsid: self.container_bcsid.clone(),
        };
        match self.dispatcher.dispatch(&entry.put_block_request, &ctx).await {
            Ok(resp) if resp.result.is_tolerated() => Ok(resp),
            Ok(resp) => {
                entry.channel.clean_up().await;
                Err(StateMachineError::ApplyFailed(resp.result))
            }
            Err(err) => {
                entry.channel.clean_up().await;
                Err(StateMachineError::PayloadWriteFailed(err.to_string()))
            }
        }
    }
}
