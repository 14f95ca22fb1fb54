use std::collections::BTreeSet;

pub mod core;
pub mod log;
pub mod message;
pub mod node;
pub mod proposal;
mod segment;

/// Identifier of a node in the cluster.
pub type NodeId = u64;

/// Role of a node in the consensus protocol.
///
/// `Passive` is the state of a node that is not (or no longer) part of any
/// cluster: it accepts replication from a recognized leader but never votes
/// and never starts elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Passive,
    Follower,
    Candidate,
    Leader,
}

/// Membership view the replicated state machine exposes to the consensus
/// core: which nodes vote (and count toward quorum) and which nodes receive
/// the log at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    /// Full voting members.
    pub voters: BTreeSet<NodeId>,
    /// Every node the leader replicates to: members, promotables, watchers.
    pub replicas: BTreeSet<NodeId>,
}

impl Membership {
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// The replicated state machine applied from committed log entries.
pub trait StateMachine {
    fn apply(&mut self, index: u64, data: &[u8]);
    fn snapshot(&self) -> Vec<u8>;
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
    /// Current membership as derived from the applied commands.
    fn membership(&self) -> Membership;
}
