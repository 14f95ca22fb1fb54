//! The replicated cluster state: node membership and database topologies.
//!
//! Every change goes through the log as a `TopologyCommand`; applying the
//! committed prefix on any node reproduces the same state, so the topology
//! doubles as the consensus membership. Commands are idempotent, a replayed
//! prefix after a snapshot restore converges to the same state.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::raft::{Membership, NodeId, StateMachine};

/// Cluster-level node sets. A node is in exactly one of the three maps;
/// values are the node's advertised address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Full voting members.
    pub members: BTreeMap<NodeId, String>,
    /// Nodes receiving the log while catching up, promoted once close enough.
    pub promotables: BTreeMap<NodeId, String>,
    /// Non-voting nodes that only host databases.
    pub watchers: BTreeMap<NodeId, String>,
}

impl ClusterTopology {
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
            || self.promotables.contains_key(&id)
            || self.watchers.contains_key(&id)
    }

    pub fn node_addr(&self, id: NodeId) -> Option<&String> {
        self.members
            .get(&id)
            .or_else(|| self.promotables.get(&id))
            .or_else(|| self.watchers.get(&id))
    }

    /// Nodes eligible to host database replicas.
    pub fn database_hosts(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .keys()
            .chain(self.watchers.keys())
            .copied()
    }
}

/// Replica sets of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTopology {
    /// Fully caught-up replicas serving reads and writes.
    pub members: Vec<NodeId>,
    /// Replicas still seeding, promoted once their change vector is close.
    pub promotables: Vec<NodeId>,
    /// The member answering for this database's health decisions.
    pub responsible_node: Option<NodeId>,
    pub replication_factor: usize,
}

impl DatabaseTopology {
    pub fn all_replicas(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().chain(self.promotables.iter()).copied()
    }

    pub fn has_replica_on(&self, node: NodeId) -> bool {
        self.members.contains(&node) || self.promotables.contains(&node)
    }

    fn remove_node(&mut self, node: NodeId) {
        self.members.retain(|&n| n != node);
        self.promotables.retain(|&n| n != node);
        if self.responsible_node == Some(node) {
            self.responsible_node = self.members.first().copied();
        }
    }
}

/// Commands carried in the replicated log. Encoded with bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyCommand {
    AddNode {
        id: NodeId,
        addr: String,
        watcher: bool,
    },
    RemoveNode {
        id: NodeId,
    },
    PromoteNode {
        id: NodeId,
    },
    DemoteNode {
        id: NodeId,
    },
    CreateDatabase {
        name: String,
        replication_factor: usize,
    },
    DeleteDatabase {
        name: String,
    },
    AddDatabaseReplica {
        db: String,
        node: NodeId,
    },
    RemoveDatabaseReplica {
        db: String,
        node: NodeId,
    },
    PromoteDatabaseReplica {
        db: String,
        node: NodeId,
    },
    DemoteDatabaseReplica {
        db: String,
        node: NodeId,
    },
    ReassignResponsibleNode {
        db: String,
        node: NodeId,
    },
}

impl TopologyCommand {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("topology command serialization cannot fail")
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub topology: ClusterTopology,
    pub databases: BTreeMap<String, DatabaseTopology>,
    /// Index of the last command folded into this state.
    pub last_applied: u64,
}

impl ClusterState {
    /// Replicas hosted per eligible node, the placement load measure.
    fn replica_load(&self, node: NodeId) -> usize {
        self.databases
            .values()
            .filter(|db| db.has_replica_on(node))
            .count()
    }

    /// Least-loaded eligible hosts in deterministic order: by load, then by
    /// ascending node id. Excludes nodes already holding a replica of `db`.
    fn placement_candidates(&self, db: Option<&DatabaseTopology>) -> Vec<NodeId> {
        let mut hosts: Vec<NodeId> = self
            .topology
            .database_hosts()
            .filter(|&n| db.map_or(true, |d| !d.has_replica_on(n)))
            .collect();
        hosts.sort_by_key(|&n| (self.replica_load(n), n));
        hosts
    }

    fn apply(&mut self, index: u64, command: TopologyCommand) {
        if index <= self.last_applied {
            return;
        }
        self.last_applied = index;

        match command {
            TopologyCommand::AddNode { id, addr, watcher } => {
                if self.topology.contains(id) {
                    return;
                }
                if watcher {
                    self.topology.watchers.insert(id, addr);
                } else if self.topology.members.is_empty() {
                    // First node of the cluster starts as a member, there is
                    // nobody to catch up with.
                    self.topology.members.insert(id, addr);
                } else {
                    self.topology.promotables.insert(id, addr);
                }
            }
            TopologyCommand::RemoveNode { id } => {
                self.topology.members.remove(&id);
                self.topology.promotables.remove(&id);
                self.topology.watchers.remove(&id);
                for db in self.databases.values_mut() {
                    db.remove_node(id);
                }
            }
            TopologyCommand::PromoteNode { id } => {
                if let Some(addr) = self.topology.promotables.remove(&id) {
                    self.topology.members.insert(id, addr);
                }
            }
            TopologyCommand::DemoteNode { id } => {
                if let Some(addr) = self.topology.members.remove(&id) {
                    self.topology.promotables.insert(id, addr);
                }
            }
            TopologyCommand::CreateDatabase {
                name,
                replication_factor,
            } => {
                if self.databases.contains_key(&name) {
                    return;
                }
                let chosen: Vec<NodeId> = self
                    .placement_candidates(None)
                    .into_iter()
                    .take(replication_factor)
                    .collect();
                let topology = DatabaseTopology {
                    responsible_node: chosen.iter().min().copied(),
                    members: {
                        let mut m = chosen;
                        m.sort_unstable();
                        m
                    },
                    promotables: Vec::new(),
                    replication_factor,
                };
                self.databases.insert(name, topology);
            }
            TopologyCommand::DeleteDatabase { name } => {
                self.databases.remove(&name);
            }
            TopologyCommand::AddDatabaseReplica { db, node } => {
                if !self.topology.contains(node) {
                    return;
                }
                if let Some(topology) = self.databases.get_mut(&db) {
                    if !topology.has_replica_on(node) {
                        // New replicas always seed first.
                        topology.promotables.push(node);
                        topology.promotables.sort_unstable();
                    }
                }
            }
            TopologyCommand::RemoveDatabaseReplica { db, node } => {
                if let Some(topology) = self.databases.get_mut(&db) {
                    topology.remove_node(node);
                }
            }
            TopologyCommand::PromoteDatabaseReplica { db, node } => {
                if let Some(topology) = self.databases.get_mut(&db) {
                    if let Some(pos) = topology.promotables.iter().position(|&n| n == node) {
                        topology.promotables.remove(pos);
                        topology.members.push(node);
                        topology.members.sort_unstable();
                        if topology.responsible_node.is_none() {
                            topology.responsible_node = Some(node);
                        }
                    }
                }
            }
            TopologyCommand::DemoteDatabaseReplica { db, node } => {
                if let Some(topology) = self.databases.get_mut(&db) {
                    if let Some(pos) = topology.members.iter().position(|&n| n == node) {
                        topology.members.remove(pos);
                        topology.promotables.push(node);
                        topology.promotables.sort_unstable();
                        if topology.responsible_node == Some(node) {
                            topology.responsible_node = topology.members.first().copied();
                        }
                    }
                }
            }
            TopologyCommand::ReassignResponsibleNode { db, node } => {
                if let Some(topology) = self.databases.get_mut(&db) {
                    if topology.members.contains(&node) {
                        topology.responsible_node = Some(node);
                    }
                }
            }
        }
    }
}

/// Shared handle over the cluster state. The consensus loop applies through
/// it; the admin API and the maintenance supervisor read through it.
#[derive(Clone, Default)]
pub struct ClusterStateMachine {
    state: Arc<RwLock<ClusterState>>,
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_topology(&self) -> ClusterTopology {
        self.state.read().unwrap().topology.clone()
    }

    pub fn database(&self, name: &str) -> Option<DatabaseTopology> {
        self.state.read().unwrap().databases.get(name).cloned()
    }

    pub fn databases(&self) -> BTreeMap<String, DatabaseTopology> {
        self.state.read().unwrap().databases.clone()
    }

    pub fn node_addr(&self, id: NodeId) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .topology
            .node_addr(id)
            .cloned()
    }

    pub fn max_node_id(&self) -> NodeId {
        let state = self.state.read().unwrap();
        let t = &state.topology;
        t.members
            .keys()
            .chain(t.promotables.keys())
            .chain(t.watchers.keys())
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Nodes eligible to host a new replica of `db`, least loaded first.
    pub fn placement_candidates(&self, db: &DatabaseTopology) -> Vec<NodeId> {
        self.state.read().unwrap().placement_candidates(Some(db))
    }
}

impl StateMachine for ClusterStateMachine {
    fn apply(&mut self, index: u64, data: &[u8]) {
        let command: TopologyCommand = match bincode::deserialize(data) {
            Ok(c) => c,
            Err(e) => {
                // A corrupt command would diverge the cluster; skipping it
                // keeps the local replay consistent with what we can decode.
                log::error!("undecodable topology command at index {}: {}", index, e);
                return;
            }
        };
        log::debug!("apply {}: {:?}", index, command);
        self.state.write().unwrap().apply(index, command);
    }

    fn snapshot(&self) -> Vec<u8> {
        let state = self.state.read().unwrap();
        bincode::serialize(&*state).expect("cluster state serialization cannot fail")
    }

    fn on_snapshot(&mut self, _last_index: u64, _last_term: u64, data: &[u8]) {
        match bincode::deserialize::<ClusterState>(data) {
            Ok(restored) => *self.state.write().unwrap() = restored,
            Err(e) => log::error!("failed to restore cluster state snapshot: {}", e),
        }
    }

    fn membership(&self) -> Membership {
        let state = self.state.read().unwrap();
        let t = &state.topology;
        Membership {
            voters: t.members.keys().copied().collect(),
            replicas: t
                .members
                .keys()
                .chain(t.promotables.keys())
                .chain(t.watchers.keys())
                .copied()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut ClusterStateMachine, index: u64, command: TopologyCommand) {
        sm.apply(index, &command.encode());
    }

    fn add_node(sm: &mut ClusterStateMachine, index: u64, id: NodeId) {
        apply(
            sm,
            index,
            TopologyCommand::AddNode {
                id,
                addr: format!("127.0.0.1:{}", 7000 + id),
                watcher: false,
            },
        );
    }

    #[test]
    fn first_node_joins_as_member_later_nodes_as_promotables() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);

        let t = sm.cluster_topology();
        assert!(t.members.contains_key(&1));
        assert!(t.promotables.contains_key(&2));

        let m = sm.membership();
        assert_eq!(m.voters.len(), 1);
        assert_eq!(m.replicas.len(), 2);
    }

    #[test]
    fn promote_moves_node_into_voting_set() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        apply(&mut sm, 3, TopologyCommand::PromoteNode { id: 2 });

        let m = sm.membership();
        assert_eq!(m.voters.len(), 2);
        assert_eq!(
            sm.cluster_topology().members.get(&2).unwrap(),
            "127.0.0.1:7002"
        );
    }

    #[test]
    fn watchers_replicate_but_never_vote() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        apply(
            &mut sm,
            2,
            TopologyCommand::AddNode {
                id: 5,
                addr: "127.0.0.1:7005".to_string(),
                watcher: true,
            },
        );

        let m = sm.membership();
        assert!(!m.voters.contains(&5));
        assert!(m.replicas.contains(&5));
    }

    #[test]
    fn database_placement_prefers_least_loaded_nodes() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        add_node(&mut sm, 3, 3);
        apply(&mut sm, 4, TopologyCommand::PromoteNode { id: 2 });
        apply(&mut sm, 5, TopologyCommand::PromoteNode { id: 3 });

        apply(
            &mut sm,
            6,
            TopologyCommand::CreateDatabase {
                name: "orders".to_string(),
                replication_factor: 2,
            },
        );
        // Equal load: the two lowest ids win; responsible is the lowest.
        let orders = sm.database("orders").unwrap();
        assert_eq!(orders.members, vec![1, 2]);
        assert_eq!(orders.responsible_node, Some(1));

        apply(
            &mut sm,
            7,
            TopologyCommand::CreateDatabase {
                name: "users".to_string(),
                replication_factor: 2,
            },
        );
        // Node 3 hosts nothing yet and must be picked first.
        let users = sm.database("users").unwrap();
        assert!(users.members.contains(&3));
    }

    #[test]
    fn new_replica_seeds_as_promotable_then_promotes() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        apply(&mut sm, 3, TopologyCommand::PromoteNode { id: 2 });
        apply(
            &mut sm,
            4,
            TopologyCommand::CreateDatabase {
                name: "orders".to_string(),
                replication_factor: 1,
            },
        );

        apply(
            &mut sm,
            5,
            TopologyCommand::AddDatabaseReplica {
                db: "orders".to_string(),
                node: 2,
            },
        );
        let db = sm.database("orders").unwrap();
        assert_eq!(db.promotables, vec![2]);

        apply(
            &mut sm,
            6,
            TopologyCommand::PromoteDatabaseReplica {
                db: "orders".to_string(),
                node: 2,
            },
        );
        let db = sm.database("orders").unwrap();
        assert!(db.promotables.is_empty());
        assert_eq!(db.members, vec![1, 2]);
    }

    #[test]
    fn removing_a_node_purges_its_replicas_and_reassigns_responsibility() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        apply(&mut sm, 3, TopologyCommand::PromoteNode { id: 2 });
        apply(
            &mut sm,
            4,
            TopologyCommand::CreateDatabase {
                name: "orders".to_string(),
                replication_factor: 2,
            },
        );
        assert_eq!(sm.database("orders").unwrap().responsible_node, Some(1));

        apply(&mut sm, 5, TopologyCommand::RemoveNode { id: 1 });
        let db = sm.database("orders").unwrap();
        assert_eq!(db.members, vec![2]);
        assert_eq!(db.responsible_node, Some(2));
        assert!(!sm.cluster_topology().contains(1));
    }

    #[test]
    fn demoting_a_database_member_moves_it_back_to_promotable() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        apply(&mut sm, 3, TopologyCommand::PromoteNode { id: 2 });
        apply(
            &mut sm,
            4,
            TopologyCommand::CreateDatabase {
                name: "orders".to_string(),
                replication_factor: 2,
            },
        );

        apply(
            &mut sm,
            5,
            TopologyCommand::DemoteDatabaseReplica {
                db: "orders".to_string(),
                node: 1,
            },
        );
        let db = sm.database("orders").unwrap();
        assert_eq!(db.members, vec![2]);
        assert_eq!(db.promotables, vec![1]);
        assert_eq!(db.responsible_node, Some(2));
    }

    #[test]
    fn replay_is_idempotent_over_duplicate_indices() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        // Replaying an already-applied index must not change anything.
        apply(&mut sm, 2, TopologyCommand::RemoveNode { id: 1 });
        assert!(sm.cluster_topology().contains(1));
    }

    #[test]
    fn snapshot_round_trips_full_state() {
        let mut sm = ClusterStateMachine::new();
        add_node(&mut sm, 1, 1);
        add_node(&mut sm, 2, 2);
        apply(&mut sm, 3, TopologyCommand::PromoteNode { id: 2 });
        apply(
            &mut sm,
            4,
            TopologyCommand::CreateDatabase {
                name: "orders".to_string(),
                replication_factor: 2,
            },
        );

        let snapshot = sm.snapshot();
        let mut restored = ClusterStateMachine::new();
        restored.on_snapshot(4, 1, &snapshot);

        assert_eq!(restored.cluster_topology(), sm.cluster_topology());
        assert_eq!(restored.database("orders"), sm.database("orders"));
        // Replays under the snapshot index are ignored after restore.
        apply(&mut restored, 3, TopologyCommand::RemoveNode { id: 2 });
        assert!(restored.cluster_topology().contains(2));
    }
}
