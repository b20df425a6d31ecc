//! In-memory [`Storage`] and [`Transport`] doubles for tests. Not meant for
//! production use: no persistence survives a process restart and the
//! "network" is just direct calls between handlers registered in the same
//! process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::storage::{Storage, WriteBatch, WriteBatchResult};
use crate::transport::{
    AppendEntries, Connection, RequestVote, RpcHandler, RpcResponse, Transport,
};
use crate::types::{ElectionState, GroupId, LogEntry, LogIndex, NodeId};

#[derive(Default)]
struct GroupLog {
    election_state: ElectionState,
    entries: Vec<LogEntry>,
}

/// A [`Storage`] backed by a `Mutex<HashMap<_>>`. Writes of out-of-order
/// entries truncate and overwrite from the first conflicting index, the
/// same behavior a real log would need on a term change.
#[derive(Default)]
pub struct InMemoryStorage {
    groups: Mutex<HashMap<GroupId, GroupLog>>,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn write(&self, batch: WriteBatch) -> Result<WriteBatchResult> {
        let mut groups = self.groups.lock().unwrap();
        let mut result = HashMap::with_capacity(batch.len());
        for (group_id, req) in batch {
            let log = groups.entry(group_id).or_default();
            if let Some(election_state) = req.election_state {
                log.election_state = election_state;
            }
            let (last_index, last_term) = match req.entries.first() {
                Some(first) => {
                    log.entries.retain(|e| e.index < first.index);
                    log.entries.extend(req.entries.iter().cloned());
                    let last = req.entries.last().unwrap();
                    (Some(last.index), Some(last.term))
                }
                None => (None, None),
            };
            result.insert(
                group_id,
                crate::storage::GroupWriteResult {
                    election_state: Some(log.election_state),
                    last_index,
                    last_term,
                    entries: req.entries,
                },
            );
        }
        Ok(result)
    }

    fn get_log_entries(&self, group: GroupId, lo: LogIndex, hi: LogIndex) -> BoxStream<'static, LogEntry> {
        let groups = self.groups.lock().unwrap();
        let entries: Vec<LogEntry> = groups
            .get(&group)
            .map(|log| log.entries.iter().filter(|e| e.index >= lo && e.index <= hi).cloned().collect())
            .unwrap_or_default();
        Box::pin(futures::stream::iter(entries))
    }
}

/// Shared registry of listening nodes plus a set of one-way-blocked links,
/// so tests can simulate a network partition by blocking both directions
/// between two nodes and healing it later.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: Mutex<HashMap<NodeId, Arc<dyn RpcHandler>>>,
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.lock().unwrap();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    pub fn heal(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.lock().unwrap();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    fn is_blocked(&self, from: NodeId, to: NodeId) -> bool {
        self.blocked.lock().unwrap().contains(&(from, to))
    }

    fn handler_for(&self, node: NodeId) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.lock().unwrap().get(&node).cloned()
    }
}

pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
}

impl InMemoryTransport {
    pub fn new(network: Arc<InMemoryNetwork>) -> Self {
        InMemoryTransport { network }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn listen(&self, local: NodeId, handler: Arc<dyn RpcHandler>) -> Result<()> {
        self.network.handlers.lock().unwrap().insert(local, handler);
        Ok(())
    }

    async fn connect(
        &self,
        local: NodeId,
        remote: NodeId,
        responses: tokio::sync::mpsc::UnboundedSender<RpcResponse>,
    ) -> Result<Box<dyn Connection>> {
        Ok(Box::new(InMemoryConnection { network: self.network.clone(), local, remote, responses }))
    }

    async fn stop(&self, local: NodeId) -> Result<()> {
        self.network.handlers.lock().unwrap().remove(&local);
        Ok(())
    }
}

struct InMemoryConnection {
    network: Arc<InMemoryNetwork>,
    local: NodeId,
    remote: NodeId,
    responses: tokio::sync::mpsc::UnboundedSender<RpcResponse>,
}

impl Connection for InMemoryConnection {
    fn send_request_vote(&self, req: RequestVote) {
        if self.network.is_blocked(self.local, self.remote) {
            return;
        }
        let network = self.network.clone();
        let responses = self.responses.clone();
        tokio::spawn(async move {
            if let Some(handler) = network.handler_for(req.header.dst) {
                let resp = handler.handle_request_vote(req).await;
                let _ = responses.send(RpcResponse::RequestVote(resp));
            }
        });
    }

    fn send_append_entries(&self, req: AppendEntries) {
        if self.network.is_blocked(self.local, self.remote) {
            return;
        }
        let network = self.network.clone();
        let responses = self.responses.clone();
        tokio::spawn(async move {
            if let Some(handler) = network.handler_for(req.header.dst) {
                let resp = handler.handle_append_entries(req).await;
                let _ = responses.send(RpcResponse::AppendEntries(resp));
            }
        });
    }
}
