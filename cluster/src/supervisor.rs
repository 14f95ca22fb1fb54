//! Leader-only database maintenance.
//!
//! While this node holds leadership it periodically reviews every database
//! topology against the observed node health and catch-up progress, and
//! fixes what it can through ordinary replicated commands: promote replicas
//! that caught up, demote members that went silent, refill topologies that
//! fell under their replication factor, and keep a responsible node
//! assigned. The moment leadership is lost the review task is aborted; the
//! next leader starts its own from the same replicated state.
//!
//! Decisions are pure functions over an observation snapshot, the runner
//! only gathers inputs and submits the resulting commands.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::health::{HealthTracker, NodeHealth};
use crate::metrics;
use crate::raft::node::RoleInfo;
use crate::raft::proposal::Proposal;
use crate::raft::{NodeId, Role};
use crate::topology::{ClusterStateMachine, ClusterTopology, DatabaseTopology, TopologyCommand};

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub interval: Duration,
    /// How far behind the current etag a seeding replica may be and still
    /// count as caught up.
    pub promotion_etag_tolerance: u64,
    /// Silence after which a member is demoted out of the serving set.
    pub demote_after: Duration,
    /// Silence after which a demoted replica is dropped from the topology.
    pub remove_after: Duration,
}

/// Everything the policy knows about one node at review time.
#[derive(Debug, Clone, Copy)]
pub struct NodeStatus {
    pub health: NodeHealth,
    pub unheard_for: Duration,
    /// Applied change etag for the database under review.
    pub etag: u64,
    /// Consensus log match index, for cluster-level promotion.
    pub progress: u64,
}

fn status_of(statuses: &BTreeMap<NodeId, NodeStatus>, node: NodeId) -> NodeStatus {
    statuses.get(&node).copied().unwrap_or(NodeStatus {
        health: NodeHealth::Unreachable,
        unheard_for: Duration::MAX,
        etag: 0,
        progress: 0,
    })
}

/// Review one database topology. `candidates` are nodes eligible to receive
/// a new replica, least loaded first, already excluding current replicas.
pub fn evaluate_database(
    name: &str,
    db: &DatabaseTopology,
    statuses: &BTreeMap<NodeId, NodeStatus>,
    candidates: &[NodeId],
    cfg: &SupervisorConfig,
) -> Vec<TopologyCommand> {
    let mut commands = Vec::new();

    // The reference etag is the most advanced serving member.
    let current_etag = db
        .members
        .iter()
        .map(|&m| status_of(statuses, m).etag)
        .max()
        .unwrap_or(0);

    // Promote seeding replicas that caught up.
    for &p in &db.promotables {
        let status = status_of(statuses, p);
        if status.health == NodeHealth::Healthy
            && current_etag.saturating_sub(status.etag) <= cfg.promotion_etag_tolerance
        {
            commands.push(TopologyCommand::PromoteDatabaseReplica {
                db: name.to_string(),
                node: p,
            });
        }
    }

    // Demote members that went silent, but never the last one: a topology
    // with no members could not recover its reference etag.
    let mut serving = db.members.len();
    for &m in &db.members {
        if serving <= 1 {
            break;
        }
        if status_of(statuses, m).unheard_for >= cfg.demote_after {
            commands.push(TopologyCommand::DemoteDatabaseReplica {
                db: name.to_string(),
                node: m,
            });
            serving -= 1;
        }
    }

    // Drop seeding replicas that stayed silent long past hope.
    for &p in &db.promotables {
        if status_of(statuses, p).unheard_for >= cfg.remove_after {
            commands.push(TopologyCommand::RemoveDatabaseReplica {
                db: name.to_string(),
                node: p,
            });
        }
    }

    // Refill up to the replication factor with healthy candidates.
    let replicas = db.members.len() + db.promotables.len();
    if replicas < db.replication_factor {
        let mut missing = db.replication_factor - replicas;
        for &c in candidates {
            if missing == 0 {
                break;
            }
            if status_of(statuses, c).health == NodeHealth::Healthy {
                commands.push(TopologyCommand::AddDatabaseReplica {
                    db: name.to_string(),
                    node: c,
                });
                missing -= 1;
            }
        }
    }

    // Keep a healthy responsible node assigned.
    let responsible_ok = db
        .responsible_node
        .map(|r| status_of(statuses, r).health == NodeHealth::Healthy)
        .unwrap_or(false);
    if !responsible_ok {
        if let Some(&replacement) = db
            .members
            .iter()
            .find(|&&m| status_of(statuses, m).health == NodeHealth::Healthy)
        {
            if db.responsible_node != Some(replacement) {
                commands.push(TopologyCommand::ReassignResponsibleNode {
                    db: name.to_string(),
                    node: replacement,
                });
            }
        }
    }

    commands
}

/// Review the cluster-level node sets: promote promotables whose log caught
/// up with the leader, demote members that went unreachable.
pub fn evaluate_cluster(
    topology: &ClusterTopology,
    statuses: &BTreeMap<NodeId, NodeStatus>,
    leader: NodeId,
    leader_last_index: u64,
    cfg: &SupervisorConfig,
) -> Vec<TopologyCommand> {
    let mut commands = Vec::new();

    for &p in topology.promotables.keys() {
        let status = status_of(statuses, p);
        if status.health == NodeHealth::Healthy
            && leader_last_index.saturating_sub(status.progress)
                <= cfg.promotion_etag_tolerance
        {
            commands.push(TopologyCommand::PromoteNode { id: p });
        }
    }

    // Demoting a voter shrinks the quorum, so only do it while a majority
    // of the remaining members is still around, and never to the leader.
    let mut voters = topology.members.len();
    for &m in topology.members.keys() {
        if m == leader || voters <= 1 {
            continue;
        }
        if status_of(statuses, m).health == NodeHealth::Unreachable
            && status_of(statuses, m).unheard_for >= cfg.demote_after
        {
            commands.push(TopologyCommand::DemoteNode { id: m });
            voters -= 1;
        }
    }

    commands
}

fn action_label(command: &TopologyCommand) -> &'static str {
    match command {
        TopologyCommand::PromoteNode { .. } => "promote_node",
        TopologyCommand::DemoteNode { .. } => "demote_node",
        TopologyCommand::PromoteDatabaseReplica { .. } => "promote",
        TopologyCommand::DemoteDatabaseReplica { .. } => "demote",
        TopologyCommand::RemoveDatabaseReplica { .. } => "remove",
        TopologyCommand::AddDatabaseReplica { .. } => "add",
        TopologyCommand::ReassignResponsibleNode { .. } => "reassign",
        _ => "other",
    }
}

/// Spawns the supervisor. It sleeps until this node becomes leader, runs a
/// review task for the duration of that leadership, and aborts it the
/// moment the role changes.
pub fn start(
    self_id: NodeId,
    mut role_rx: watch::Receiver<RoleInfo>,
    state: ClusterStateMachine,
    health: Arc<HealthTracker>,
    proposals: mpsc::Sender<Proposal>,
    cfg: SupervisorConfig,
) {
    tokio::spawn(async move {
        loop {
            while role_rx.borrow().role != Role::Leader {
                if role_rx.changed().await.is_err() {
                    return;
                }
            }
            log::info!("maintenance supervisor starting for this leadership term");
            let epoch = tokio::spawn(run_epoch(
                self_id,
                state.clone(),
                health.clone(),
                proposals.clone(),
                cfg,
            ));

            while role_rx.borrow().role == Role::Leader {
                if role_rx.changed().await.is_err() {
                    epoch.abort();
                    return;
                }
            }
            epoch.abort();
            log::info!("maintenance supervisor stopped, leadership lost");
        }
    });
}

async fn run_epoch(
    self_id: NodeId,
    state: ClusterStateMachine,
    health: Arc<HealthTracker>,
    proposals: mpsc::Sender<Proposal>,
    cfg: SupervisorConfig,
) {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        review_once(self_id, &state, &health, &proposals, &cfg).await;
    }
}

async fn review_once(
    self_id: NodeId,
    state: &ClusterStateMachine,
    health: &HealthTracker,
    proposals: &mpsc::Sender<Proposal>,
    cfg: &SupervisorConfig,
) {
    let topology = state.cluster_topology();
    let leader_last_index = health.progress(self_id);

    let mut commands = Vec::new();

    let cluster_statuses = observe(health, topology_nodes(&topology), "", self_id);
    commands.extend(evaluate_cluster(
        &topology,
        &cluster_statuses,
        self_id,
        leader_last_index,
        cfg,
    ));

    for (name, db) in state.databases() {
        let nodes: Vec<NodeId> = db
            .all_replicas()
            .chain(topology.database_hosts())
            .collect();
        let statuses = observe(health, nodes, &name, self_id);
        let candidates = state.placement_candidates(&db);
        commands.extend(evaluate_database(&name, &db, &statuses, &candidates, cfg));
    }

    for command in commands {
        let label = action_label(&command);
        log::info!("maintenance action: {:?}", command);
        let (proposal, rx) = Proposal::new(command.encode());
        if proposals.send(proposal).await.is_err() {
            return;
        }
        match rx.await {
            Ok(Ok(_)) => {
                metrics::SUPERVISOR_ACTION_VEC.with_label_values(&[label]).inc();
            }
            Ok(Err(e)) => {
                // Leadership moved under us; the epoch task dies shortly.
                log::warn!("maintenance action not committed: {}", e);
                return;
            }
            Err(_) => return,
        }
    }
}

fn topology_nodes(topology: &ClusterTopology) -> Vec<NodeId> {
    topology
        .members
        .keys()
        .chain(topology.promotables.keys())
        .chain(topology.watchers.keys())
        .copied()
        .collect()
}

fn observe(
    health: &HealthTracker,
    nodes: Vec<NodeId>,
    db: &str,
    self_id: NodeId,
) -> BTreeMap<NodeId, NodeStatus> {
    let mut statuses = BTreeMap::new();
    for node in nodes {
        let status = if node == self_id {
            // The leader always trusts itself.
            NodeStatus {
                health: NodeHealth::Healthy,
                unheard_for: Duration::ZERO,
                etag: health.database_etag(db, node),
                progress: health.progress(node),
            }
        } else {
            NodeStatus {
                health: health.node_health(node),
                unheard_for: health.unheard_for(node),
                etag: health.database_etag(db, node),
                progress: health.progress(node),
            }
        };
        statuses.insert(node, status);
    }
    statuses
}
