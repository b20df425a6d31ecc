use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{GroupId, LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src: NodeId,
    pub dst: NodeId,
}

#[derive(Debug, Clone)]
pub struct RequestVote {
    pub header: Header,
    pub group: GroupId,
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub header: Header,
    pub group: GroupId,
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntries {
    pub header: Header,
    pub group: GroupId,
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub header: Header,
    pub group: GroupId,
    pub term: Term,
    pub success: bool,
}

/// Closed tagged union of everything a peer can push to us. Replaces the
/// "op-types-as-interface{}" dynamic dispatch flagged for redesign.
#[derive(Debug, Clone)]
pub enum RpcRequest {
    RequestVote(RequestVote),
    AppendEntries(AppendEntries),
}

#[derive(Debug, Clone)]
pub enum RpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

/// The engine, seen from Transport's side: something that answers inbound
/// requests. Transport holds only this sink reference, never the engine
/// itself, so there's no ownership cycle between Engine and Transport.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_request_vote(&self, req: RequestVote) -> RequestVoteResponse;
    async fn handle_append_entries(&self, req: AppendEntries) -> AppendEntriesResponse;
}

/// One outbound connection to a remote node. RPCs are fire-and-forget from
/// the caller's perspective: the reply surfaces later on the response
/// channel supplied to `Transport::connect`, tagged so the loop can route
/// it back to the right pending call.
#[async_trait]
pub trait Connection: Send + Sync {
    fn send_request_vote(&self, req: RequestVote);
    fn send_append_entries(&self, req: AppendEntries);
}

/// Delivers typed request/response messages between nodes. The engine
/// never serializes a byte: wire format is entirely Transport's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, local: NodeId, handler: std::sync::Arc<dyn RpcHandler>) -> Result<()>;

    /// `responses` is the single channel this connection's replies (to our
    /// own outbound requests) are funneled into.
    async fn connect(
        &self,
        local: NodeId,
        remote: NodeId,
        responses: mpsc::UnboundedSender<RpcResponse>,
    ) -> Result<Box<dyn Connection>>;

    async fn stop(&self, local: NodeId) -> Result<()>;
}
