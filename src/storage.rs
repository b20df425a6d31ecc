use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{ElectionState, GroupId, LogEntry, LogIndex, Term};

/// One group's share of a write batch: an election-state update if it
/// changed, and the pending entries to append (already drained from the
/// group's in-memory `pending_entries` by the caller).
#[derive(Debug, Clone, Default)]
pub struct GroupWriteRequest {
    pub election_state: Option<ElectionState>,
    pub entries: Vec<LogEntry>,
}

/// What the writer durably recorded for one group. `last_index`/`last_term`
/// are `None` when the batch carried no new entries for that group (the
/// spec's `-1` sentinel, rendered as `Option` rather than a magic number).
#[derive(Debug, Clone, Default)]
pub struct GroupWriteResult {
    pub election_state: Option<ElectionState>,
    pub last_index: Option<LogIndex>,
    pub last_term: Option<Term>,
    pub entries: Vec<LogEntry>,
}

pub type WriteBatch = HashMap<GroupId, GroupWriteRequest>;
pub type WriteBatchResult = HashMap<GroupId, GroupWriteResult>;

/// Durable storage for per-group election state and log entries. Out of
/// scope per the engine's own design: the core only ever calls this
/// interface, never interprets how entries reach disk.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, batch: WriteBatch) -> Result<WriteBatchResult>;

    /// Entries `[lo, hi]` inclusive, in index order.
    fn get_log_entries(&self, group: GroupId, lo: LogIndex, hi: LogIndex) -> BoxStream<'static, LogEntry>;
}
