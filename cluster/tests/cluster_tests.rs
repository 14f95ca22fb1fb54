//! Multi-node consensus and topology scenarios.
//!
//! The cores are driven directly, with messages shuttled in memory, so every
//! scenario is deterministic: elections fire when a test says the timeout
//! elapsed, partitions drop envelopes, and nothing depends on wall-clock
//! timing.

use std::collections::{BTreeMap, BTreeSet};

use tempfile::TempDir;

use cluster::raft::core::RaftCore;
use cluster::raft::message::Envelope;
use cluster::raft::{NodeId, Role};
use cluster::topology::{ClusterStateMachine, TopologyCommand};

struct Cluster {
    nodes: BTreeMap<NodeId, RaftCore<ClusterStateMachine>>,
    partitioned: BTreeSet<NodeId>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    /// Empty nodes with fresh stores; no topology yet.
    fn new(n: u64) -> Self {
        let mut nodes = BTreeMap::new();
        let mut dirs = Vec::new();
        for id in 1..=n {
            let dir = TempDir::new().unwrap();
            let store = cluster::raft::log::LogStore::open(dir.path(), 16).unwrap();
            let core = RaftCore::new(id, store, ClusterStateMachine::new()).unwrap();
            nodes.insert(id, core);
            dirs.push(dir);
        }
        Cluster {
            nodes,
            partitioned: BTreeSet::new(),
            _dirs: dirs,
        }
    }

    /// A running cluster of `n` voting members, built the way a real
    /// deployment is: node 1 bootstraps, the others join and get promoted.
    fn with_members(n: u64) -> Self {
        let mut cluster = Cluster::new(n);
        cluster.node(1).bootstrap().unwrap();
        cluster.commit(TopologyCommand::AddNode {
            id: 1,
            addr: addr_of(1),
            watcher: false,
        });
        for id in 2..=n {
            cluster.commit(TopologyCommand::AddNode {
                id,
                addr: addr_of(id),
                watcher: false,
            });
            cluster.commit(TopologyCommand::PromoteNode { id });
        }
        cluster.settle();
        cluster
    }

    fn node(&mut self, id: NodeId) -> &mut RaftCore<ClusterStateMachine> {
        self.nodes.get_mut(&id).unwrap()
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|c| c.role() == Role::Leader && !self.partitioned.contains(&c.id))
            .max_by_key(|c| c.current_term())
            .map(|c| c.id)
    }

    /// Deliver everything in flight until the wires are quiet.
    fn pump(&mut self) {
        for _ in 0..200 {
            let mut inflight: Vec<Envelope> = Vec::new();
            for core in self.nodes.values_mut() {
                inflight.extend(core.take_messages());
            }
            if inflight.is_empty() {
                return;
            }
            for envelope in inflight {
                if self.partitioned.contains(&envelope.from)
                    || self.partitioned.contains(&envelope.to)
                {
                    continue;
                }
                if let Some(target) = self.nodes.get_mut(&envelope.to) {
                    target.step(envelope);
                }
            }
        }
        panic!("messages still in flight after 200 rounds");
    }

    /// A few heartbeat rounds so commit indexes reach every follower.
    fn settle(&mut self) {
        for _ in 0..4 {
            if let Some(leader) = self.leader_id() {
                self.node(leader).on_heartbeat_tick();
            }
            self.pump();
        }
    }

    /// Propose on the current leader and drive it to commit everywhere.
    fn commit(&mut self, command: TopologyCommand) -> u64 {
        let leader = self.leader_id().expect("no leader to propose on");
        let index = self.node(leader).propose(command.encode()).unwrap();
        self.settle();
        index
    }

    fn partition(&mut self, id: NodeId) {
        self.partitioned.insert(id);
    }

    fn heal(&mut self, id: NodeId) {
        self.partitioned.remove(&id);
    }
}

fn addr_of(id: NodeId) -> String {
    format!("127.0.0.1:{}", 7000 + id)
}

// =============================================================================
// CLUSTER FORMATION
// =============================================================================

mod formation {
    use super::*;

    #[test]
    fn bootstrap_node_leads_a_single_node_cluster() {
        let mut cluster = Cluster::new(1);
        cluster.node(1).bootstrap().unwrap();
        let index = cluster.commit(TopologyCommand::AddNode {
            id: 1,
            addr: addr_of(1),
            watcher: false,
        });
        let node = cluster.node(1);
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.commit_index(), index);
        assert!(node.state_machine().cluster_topology().members.contains_key(&1));
    }

    #[test]
    fn joining_nodes_replicate_the_topology_and_become_voters() {
        let cluster = Cluster::with_members(3);
        for core in cluster.nodes.values() {
            let topology = core.state_machine().cluster_topology();
            assert_eq!(topology.members.len(), 3, "node {} topology", core.id);
            assert!(topology.promotables.is_empty());
            assert_eq!(core.membership().voters.len(), 3);
        }
    }

    #[test]
    fn fresh_node_starts_passive_until_admitted() {
        let mut cluster = Cluster::new(2);
        cluster.node(1).bootstrap().unwrap();
        cluster.commit(TopologyCommand::AddNode {
            id: 1,
            addr: addr_of(1),
            watcher: false,
        });
        assert_eq!(cluster.node(2).role(), Role::Passive);

        // A passive node never campaigns, no matter how long it waits.
        cluster.node(2).on_election_timeout();
        assert_eq!(cluster.node(2).role(), Role::Passive);

        // Admission turns it into a replicating follower.
        cluster.commit(TopologyCommand::AddNode {
            id: 2,
            addr: addr_of(2),
            watcher: false,
        });
        assert_eq!(cluster.node(2).role(), Role::Follower);
        assert!(cluster
            .node(2)
            .state_machine()
            .cluster_topology()
            .promotables
            .contains_key(&2));
    }

    #[test]
    fn watcher_receives_the_log_but_not_the_vote() {
        let mut cluster = Cluster::new(3);
        cluster.node(1).bootstrap().unwrap();
        cluster.commit(TopologyCommand::AddNode {
            id: 1,
            addr: addr_of(1),
            watcher: false,
        });
        cluster.commit(TopologyCommand::AddNode {
            id: 2,
            addr: addr_of(2),
            watcher: false,
        });
        cluster.commit(TopologyCommand::PromoteNode { id: 2 });
        cluster.commit(TopologyCommand::AddNode {
            id: 3,
            addr: addr_of(3),
            watcher: true,
        });
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "orders".to_string(),
            replication_factor: 1,
        });

        let watcher = cluster.node(3);
        assert!(watcher.state_machine().database("orders").is_some());
        assert!(!watcher.membership().voters.contains(&3));
    }
}

// =============================================================================
// ELECTIONS
// =============================================================================

mod elections {
    use super::*;

    #[test]
    fn surviving_majority_elects_a_new_leader() {
        let mut cluster = Cluster::with_members(3);
        let old_leader = cluster.leader_id().unwrap();
        let old_term = cluster.node(old_leader).current_term();

        cluster.partition(old_leader);
        let candidate = (1..=3).find(|&id| id != old_leader).unwrap();
        cluster.node(candidate).on_election_timeout();
        cluster.pump();

        assert_eq!(cluster.node(candidate).role(), Role::Leader);
        assert!(cluster.node(candidate).current_term() > old_term);
    }

    #[test]
    fn deposed_leader_steps_down_when_the_partition_heals() {
        let mut cluster = Cluster::with_members(3);
        let old_leader = cluster.leader_id().unwrap();

        cluster.partition(old_leader);
        let candidate = (1..=3).find(|&id| id != old_leader).unwrap();
        cluster.node(candidate).on_election_timeout();
        cluster.pump();
        let new_term = cluster.node(candidate).current_term();

        cluster.heal(old_leader);
        cluster.node(old_leader).on_heartbeat_tick();
        cluster.pump();

        let old = cluster.node(old_leader);
        assert_ne!(old.role(), Role::Leader);
        assert_eq!(old.current_term(), new_term);
    }

    #[test]
    fn no_leader_without_a_majority() {
        let mut cluster = Cluster::with_members(3);
        let leader = cluster.leader_id().unwrap();
        let others: Vec<NodeId> = (1..=3).filter(|&id| id != leader).collect();

        // Isolate everyone; the lone candidate cannot win.
        cluster.partition(leader);
        cluster.partition(others[1]);
        cluster.node(others[0]).on_election_timeout();
        cluster.pump();
        assert_eq!(cluster.node(others[0]).role(), Role::Candidate);
    }

    #[test]
    fn split_vote_resolves_on_the_next_timeout() {
        let mut cluster = Cluster::with_members(3);
        let leader = cluster.leader_id().unwrap();
        cluster.partition(leader);
        let others: Vec<NodeId> = (1..=3).filter(|&id| id != leader).collect();

        // Both survivors time out before exchanging any message: each votes
        // for itself and neither can win this term.
        cluster.node(others[0]).on_election_timeout();
        cluster.node(others[1]).on_election_timeout();
        cluster.pump();
        assert!(cluster.leader_id().is_none());

        // One of them times out again and wins cleanly.
        cluster.node(others[0]).on_election_timeout();
        cluster.pump();
        assert_eq!(cluster.node(others[0]).role(), Role::Leader);
    }
}

// =============================================================================
// REPLICATION AND DURABILITY
// =============================================================================

mod replication {
    use super::*;

    #[test]
    fn committed_commands_reach_every_node() {
        let mut cluster = Cluster::with_members(3);
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "orders".to_string(),
            replication_factor: 2,
        });
        for core in cluster.nodes.values() {
            let db = core
                .state_machine()
                .database("orders")
                .unwrap_or_else(|| panic!("node {} missing database", core.id));
            assert_eq!(db.members.len(), 2);
        }
    }

    #[test]
    fn disconnected_follower_catches_up_after_rejoining() {
        let mut cluster = Cluster::with_members(3);
        let leader = cluster.leader_id().unwrap();
        let follower = (1..=3).find(|&id| id != leader).unwrap();

        cluster.partition(follower);
        for i in 0..5 {
            cluster.commit(TopologyCommand::CreateDatabase {
                name: format!("db-{}", i),
                replication_factor: 1,
            });
        }
        cluster.heal(follower);
        cluster.settle();

        let behind = cluster.node(follower);
        assert_eq!(behind.state_machine().databases().len(), 5);
    }

    #[test]
    fn committed_entries_survive_a_leader_change() {
        let mut cluster = Cluster::with_members(3);
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "orders".to_string(),
            replication_factor: 3,
        });

        let old_leader = cluster.leader_id().unwrap();
        cluster.partition(old_leader);
        let candidate = (1..=3).find(|&id| id != old_leader).unwrap();
        cluster.node(candidate).on_election_timeout();
        cluster.pump();
        cluster.settle();

        assert!(cluster
            .node(candidate)
            .state_machine()
            .database("orders")
            .is_some());

        // And the new leadership can keep committing.
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "users".to_string(),
            replication_factor: 2,
        });
        let third = (1..=3)
            .find(|&id| id != old_leader && id != candidate)
            .unwrap();
        assert!(cluster.node(third).state_machine().database("users").is_some());
    }
}

// =============================================================================
// MEMBERSHIP CHANGES
// =============================================================================

mod membership {
    use super::*;

    #[test]
    fn removed_node_learns_of_its_removal_and_goes_passive() {
        let mut cluster = Cluster::with_members(3);
        let leader = cluster.leader_id().unwrap();
        let victim = (1..=3).find(|&id| id != leader).unwrap();

        cluster.commit(TopologyCommand::RemoveNode { id: victim });
        cluster.settle();

        assert_eq!(cluster.node(victim).role(), Role::Passive);
        for (&id, core) in &cluster.nodes {
            if id != victim {
                assert!(!core.state_machine().cluster_topology().contains(victim));
                assert_eq!(core.membership().voters.len(), 2);
            }
        }
    }

    #[test]
    fn removed_nodes_stale_campaign_cannot_disturb_the_cluster() {
        let mut cluster = Cluster::with_members(3);
        let leader = cluster.leader_id().unwrap();
        let victim = (1..=3).find(|&id| id != leader).unwrap();
        let term_before = cluster.node(leader).current_term();

        // Remove the victim while it cannot hear about it.
        cluster.partition(victim);
        cluster.commit(TopologyCommand::RemoveNode { id: victim });

        // It rejoins and campaigns with an inflated term.
        cluster.heal(victim);
        cluster.node(victim).on_election_timeout();
        cluster.node(victim).on_election_timeout();
        cluster.pump();

        assert_eq!(cluster.leader_id(), Some(leader));
        assert_eq!(cluster.node(leader).current_term(), term_before);
    }

    #[test]
    fn node_removal_purges_its_database_replicas() {
        let mut cluster = Cluster::with_members(3);
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "orders".to_string(),
            replication_factor: 3,
        });
        let victim = *cluster
            .node(1)
            .state_machine()
            .database("orders")
            .unwrap()
            .members
            .last()
            .unwrap();

        cluster.commit(TopologyCommand::RemoveNode { id: victim });
        cluster.settle();

        let leader = cluster.leader_id().unwrap();
        let db = cluster.node(leader).state_machine().database("orders").unwrap();
        assert!(!db.has_replica_on(victim));
        assert_eq!(db.members.len(), 2);
    }

    #[test]
    fn rejoining_under_a_new_identity_works() {
        let mut cluster = Cluster::with_members(3);
        let leader = cluster.leader_id().unwrap();
        let victim = (1..=3).find(|&id| id != leader).unwrap();
        cluster.commit(TopologyCommand::RemoveNode { id: victim });
        cluster.settle();
        assert_eq!(cluster.node(victim).role(), Role::Passive);

        // The operator re-adds the same process as a fresh promotable.
        cluster.commit(TopologyCommand::AddNode {
            id: victim,
            addr: addr_of(victim),
            watcher: false,
        });
        cluster.settle();
        assert_eq!(cluster.node(victim).role(), Role::Follower);

        cluster.commit(TopologyCommand::PromoteNode { id: victim });
        cluster.settle();
        assert!(cluster.node(victim).membership().voters.contains(&victim));
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

mod snapshots {
    use super::*;

    #[test]
    fn node_behind_the_compaction_horizon_is_seeded_from_a_snapshot() {
        let mut cluster = Cluster::new(2);
        cluster.node(1).bootstrap().unwrap();
        cluster.commit(TopologyCommand::AddNode {
            id: 1,
            addr: addr_of(1),
            watcher: false,
        });

        // Enough history to roll several segments, then compact.
        for i in 0..40 {
            cluster.commit(TopologyCommand::CreateDatabase {
                name: format!("db-{}", i),
                replication_factor: 1,
            });
        }
        cluster.node(1).save_snapshot().unwrap();
        assert!(cluster.node(1).store().first_index() > 1);

        // The joining node's log starts before the horizon, so the leader
        // must ship the snapshot instead of entries.
        cluster.commit(TopologyCommand::AddNode {
            id: 2,
            addr: addr_of(2),
            watcher: false,
        });
        cluster.settle();

        let joined = cluster.node(2);
        assert_eq!(joined.state_machine().databases().len(), 40);
        assert!(joined.state_machine().cluster_topology().contains(2));
        assert_eq!(joined.role(), Role::Follower);
    }
}

// =============================================================================
// DATABASE MAINTENANCE
// =============================================================================

mod maintenance {
    use super::*;
    use cluster::health::NodeHealth;
    use cluster::supervisor::{evaluate_database, NodeStatus, SupervisorConfig};
    use std::time::Duration;

    fn cfg() -> SupervisorConfig {
        SupervisorConfig {
            interval: Duration::from_secs(1),
            promotion_etag_tolerance: 2,
            demote_after: Duration::from_secs(30),
            remove_after: Duration::from_secs(300),
        }
    }

    /// A member drops off the network; the supervisor's decision demotes it,
    /// and the demotion propagates through consensus to every node.
    #[test]
    fn silent_member_is_demoted_cluster_wide() {
        let mut cluster = Cluster::with_members(3);
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "orders".to_string(),
            replication_factor: 2,
        });
        let leader = cluster.leader_id().unwrap();
        let db = cluster.node(leader).state_machine().database("orders").unwrap();
        let healthy_member = db.members[0];
        let dead_member = db.members[1];

        let mut statuses = BTreeMap::new();
        statuses.insert(
            healthy_member,
            NodeStatus {
                health: NodeHealth::Healthy,
                unheard_for: Duration::ZERO,
                etag: 10,
                progress: 0,
            },
        );
        statuses.insert(
            dead_member,
            NodeStatus {
                health: NodeHealth::Unreachable,
                unheard_for: Duration::from_secs(60),
                etag: 10,
                progress: 0,
            },
        );

        let commands = evaluate_database("orders", &db, &statuses, &[], &cfg());
        for command in commands {
            cluster.commit(command);
        }

        for core in cluster.nodes.values() {
            let db = core.state_machine().database("orders").unwrap();
            assert_eq!(db.members, vec![healthy_member]);
            assert_eq!(db.promotables, vec![dead_member]);
        }
    }

    /// A seeding replica reports an etag close to the members' and gets
    /// promoted into the serving set everywhere.
    #[test]
    fn caught_up_replica_is_promoted_cluster_wide() {
        let mut cluster = Cluster::with_members(3);
        cluster.commit(TopologyCommand::CreateDatabase {
            name: "orders".to_string(),
            replication_factor: 2,
        });
        let leader = cluster.leader_id().unwrap();
        let db = cluster.node(leader).state_machine().database("orders").unwrap();
        let spare = (1..=3).find(|&id| !db.has_replica_on(id)).unwrap();

        cluster.commit(TopologyCommand::AddDatabaseReplica {
            db: "orders".to_string(),
            node: spare,
        });

        let db = cluster.node(leader).state_machine().database("orders").unwrap();
        let mut statuses = BTreeMap::new();
        for &m in &db.members {
            statuses.insert(
                m,
                NodeStatus {
                    health: NodeHealth::Healthy,
                    unheard_for: Duration::ZERO,
                    etag: 100,
                    progress: 0,
                },
            );
        }
        statuses.insert(
            spare,
            NodeStatus {
                health: NodeHealth::Healthy,
                unheard_for: Duration::ZERO,
                etag: 99,
                progress: 0,
            },
        );

        let commands = evaluate_database("orders", &db, &statuses, &[], &cfg());
        assert_eq!(commands.len(), 1);
        for command in commands {
            cluster.commit(command);
        }

        for core in cluster.nodes.values() {
            let db = core.state_machine().database("orders").unwrap();
            assert!(db.members.contains(&spare));
            assert!(db.promotables.is_empty());
        }
    }
}
