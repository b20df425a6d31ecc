use crate::types::{GroupId, NodeId};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
///
/// Configuration errors are returned synchronously from construction.
/// Usage and transport errors are returned on an op's completion channel.
/// Invariant violations never reach a caller directly: see `Config::strict`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node id must be non-zero")]
    InvalidNodeId,

    #[error("transport is required")]
    MissingTransport,

    #[error("election_timeout_min/max must both be > 0 and min <= max")]
    InvalidElectionTimeout,

    #[error("group {0:?} already exists")]
    GroupExists(GroupId),

    #[error("group {0:?} does not exist")]
    NoSuchGroup(GroupId),

    #[error("this node is not the leader of group {0:?}")]
    NotLeader(GroupId),

    #[error("failed to dial peer {0:?}")]
    TransportDialFailed(NodeId),

    #[error("the engine has stopped")]
    EngineStopped,

    #[error("invariant violated: {0}")]
    Invariant(String),
}
