use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::dispatcher::ContainerDispatcher;
use crate::error::{Result, StateMachineError};
use crate::log::{LogIndex, LogPosition, Term};

/// Persists and reloads the `container -> BCSID` index, the only
/// snapshotable state of this component.
pub struct SnapshotManager {
    container_bcsid: Arc<DashMap<i64, u64>>,
    healthy: Arc<AtomicBool>,
    dispatcher: Arc<dyn ContainerDispatcher>,
}

impl SnapshotManager {
    pub fn new(
        container_bcsid: Arc<DashMap<i64, u64>>,
        healthy: Arc<AtomicBool>,
        dispatcher: Arc<dyn ContainerDispatcher>,
    ) -> Self {
        Self {
            container_bcsid,
            healthy,
            dispatcher,
        }
    }

    /// The on-disk name for a snapshot taken at `(term, index)`, so restore
    /// can recover the position from the filename alone.
    pub fn snapshot_file_name(position: LogPosition) -> String {
        format!("snapshot-{}-{}.bin", position.term.0, position.index.value())
    }

    /// Refuses if unhealthy; otherwise serializes the index and fsyncs it in
    /// one write.
    pub fn take_snapshot(&self, dir: &Path, last_applied: LogPosition) -> Result<LogIndex> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(StateMachineError::SnapshotFailed(
                "state machine unhealthy".to_string(),
            ));
        }

        let snapshot: HashMap<i64, u64> = self
            .container_bcsid
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let bytes = bincode::serialize(&snapshot)
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;

        let path = dir.join(Self::snapshot_file_name(last_applied));
        let mut file = File::create(&path)
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;
        file.write_all(&bytes)
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;
        file.sync_all()
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;

        Ok(last_applied.index)
    }

    /// Reads `path`, merges its entries into the in-memory index, and asks
    /// the dispatcher to reconcile on-disk containers against it. The
    /// snapshot's `(term, index)` becomes the new `lastApplied` for the
    /// caller to install.
    pub async fn restore(&self, path: &Path) -> Result<LogPosition> {
        let position = Self::parse_snapshot_position(path).ok_or_else(|| {
            StateMachineError::SnapshotFailed(format!("unparseable snapshot path {path:?}"))
        })?;

        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;

        let snapshot: HashMap<i64, u64> = bincode::deserialize(&bytes)
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;

        for (container_id, bcsid) in &snapshot {
            self.container_bcsid.insert(*container_id, *bcsid);
        }

        let missing = self
            .dispatcher
            .build_missing_container_set_and_validate(&snapshot)
            .await
            .map_err(|err| StateMachineError::SnapshotFailed(err.to_string()))?;
        if !missing.is_empty() {
            tracing::warn!(count = missing.len(), "containers missing after snapshot restore");
        }

        Ok(position)
    }

    fn parse_snapshot_position(path: &Path) -> Option<LogPosition> {
        let stem = path.file_stem()?.to_str()?;
        let mut parts = stem.strip_prefix("snapshot-")?.split('-');
        let term = parts.next()?.parse::<u64>().ok()?;
        let index = parts.next()?.parse::<u64>().ok()?;
        Some(LogPosition {
            term: Term(term),
            index: LogIndex(index),
        })
    }
}
