use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{AppendEntries, Connection, RequestVote, RpcResponse, Transport};
use crate::types::NodeId;

struct PeerEntry {
    conn: Box<dyn Connection>,
    refcount: usize,
}

/// Reference-counted connections to remote nodes, shared across every group
/// that includes a given peer. One `PeerEntry` per remote `NodeId`: created
/// on first reference, refcount-incremented on subsequent ones, and
/// dropped wholesale on engine stop (per-group teardown is out of scope).
pub struct PeerTable {
    local: NodeId,
    transport: Arc<dyn Transport>,
    responses: mpsc::UnboundedSender<RpcResponse>,
    peers: HashMap<NodeId, PeerEntry>,
}

impl PeerTable {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        responses: mpsc::UnboundedSender<RpcResponse>,
    ) -> Self {
        PeerTable {
            local,
            transport,
            responses,
            peers: HashMap::new(),
        }
    }

    /// Ensures a connection to `node` exists, dialing it if this is the
    /// first group to reference it and incrementing the refcount otherwise.
    pub async fn acquire(&mut self, node: NodeId) -> Result<()> {
        if let Some(entry) = self.peers.get_mut(&node) {
            entry.refcount += 1;
            return Ok(());
        }
        let conn = self
            .transport
            .connect(self.local, node, self.responses.clone())
            .await
            .map_err(|_| Error::TransportDialFailed(node))?;
        debug!("dialed peer {:?}", node);
        self.peers.insert(node, PeerEntry { conn, refcount: 1 });
        Ok(())
    }

    pub fn send_request_vote(&self, node: NodeId, req: RequestVote) {
        if let Some(entry) = self.peers.get(&node) {
            entry.conn.send_request_vote(req);
        }
    }

    pub fn send_append_entries(&self, node: NodeId, req: AppendEntries) {
        if let Some(entry) = self.peers.get(&node) {
            entry.conn.send_append_entries(req);
        }
    }

    /// Closes every connection and stops listening. Idempotent.
    pub async fn stop(&mut self) {
        self.peers.clear();
        let _ = self.transport.stop(self.local).await;
    }
}
