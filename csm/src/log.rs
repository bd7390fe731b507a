//! The small slice of the consensus engine's data model that the state
//! machine is applied against: log positions and the entries that carry
//! replicated commands. The consensus engine itself (election, replication,
//! snapshot transport) lives outside this crate; these types are only the
//! contract surface it hands us.

use std::cmp::Ordering;

/// A Raft term. Monotonically non-decreasing across the lifetime of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Term(pub u64);

/// Position of an entry in the replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> LogIndex {
        LogIndex(self.0 + 1)
    }
}

impl PartialOrd for LogIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// A `(term, index)` pair identifying a committed position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}

/// A single consensus log entry as handed to the state machine.
///
/// `state_machine_data` is the side channel described in the data model:
/// WriteChunk payloads travel here instead of inside `log_data`, so they
/// never enter the replicated log body.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub log_data: bytes::Bytes,
    pub state_machine_data: Option<bytes::Bytes>,
}
