//! Consensus protocol messages exchanged between nodes.
//!
//! Every message carries the sender's term so that a stale participant is
//! corrected by any traffic it receives. Responses travel as ordinary
//! messages over the same peer streams as requests.

use serde::{Deserialize, Serialize};

use super::NodeId;

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term under which the entry was created by a leader.
    pub term: u64,
    /// Position in the log, 1-based, dense.
    pub index: u64,
    /// Encoded command; empty for the no-op a new leader appends.
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        LogEntry {
            term,
            index,
            command,
        }
    }
}

/// All consensus messages between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResponse {
        term: u64,
        vote_granted: bool,
    },
    /// Log replication; doubles as heartbeat when `entries` is empty.
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        /// On success: highest index now known replicated on the follower.
        /// On failure: the follower's last log index, used by the leader as
        /// a backtrack hint instead of decrementing one index per round trip.
        match_index: u64,
    },
    /// Brings a far-behind follower up to date after log compaction.
    InstallSnapshot {
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        term: u64,
        success: bool,
    },
}

impl RaftMessage {
    /// The sender's term embedded in the message.
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }
}

/// A routed message: who sent it and who it is for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}
