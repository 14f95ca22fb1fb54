//! Error taxonomy for the cluster layer.
//!
//! Callers of the command API always get a definite answer: a committed
//! index or an error that says whether resubmitting makes sense. Stale-term
//! corrections never surface here; they are handled inside the consensus
//! loop.

use thiserror::Error;

use crate::raft::NodeId;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("not the leader{}", leader_hint.map(|id| format!(", try node {}", id)).unwrap_or_default())]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("leadership changed before the command committed, resubmit")]
    LeadershipLost,

    #[error("timed out")]
    Timeout,

    #[error("node {0} is not part of the cluster")]
    NodeNotFound(NodeId),

    #[error("node {0} is already part of the cluster")]
    AlreadyInCluster(NodeId),

    #[error("node id {0} was claimed by a concurrent change, retry")]
    NodeIdTaken(NodeId),

    #[error("no database named {0}")]
    DatabaseNotFound(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl ClusterError {
    /// Whether the caller may retry or resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Io(_)
                | ClusterError::NotLeader { .. }
                | ClusterError::LeadershipLost
                | ClusterError::Timeout
                | ClusterError::NodeIdTaken(_)
        )
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
