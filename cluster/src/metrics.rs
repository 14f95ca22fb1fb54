//! Metrics collection for the cluster consensus service
//!
//! This module provides functionality for collecting and exposing consensus
//! and maintenance metrics using Prometheus.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Elections this node has started
    pub static ref ELECTIONS_STARTED: Counter =
        Counter::new("elections_started", "elections started by this node").unwrap();

    /// Votes this node has granted
    pub static ref VOTES_GRANTED: Counter =
        Counter::new("votes_granted", "votes granted by this node").unwrap();

    /// Heartbeat / replication rounds sent while leader
    pub static ref HEARTBEATS_SENT: Counter =
        Counter::new("heartbeats_sent", "append entries rounds sent as leader").unwrap();

    /// Entries committed on this node
    pub static ref ENTRIES_COMMITTED: Counter =
        Counter::new("entries_committed", "log entries committed").unwrap();

    /// Entries applied to the topology state machine
    pub static ref ENTRIES_APPLIED: Counter =
        Counter::new("entries_applied", "log entries applied").unwrap();

    /// Proposals by outcome (committed / not_leader / leadership_lost)
    pub static ref PROPOSAL_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("proposals", "proposals by outcome"),
        &["outcome"]
    )
    .unwrap();

    /// Supervisor topology actions by kind (promote / demote / remove / add / reassign)
    pub static ref SUPERVISOR_ACTION_VEC: CounterVec = CounterVec::new(
        Opts::new("supervisor_actions", "maintenance actions by kind"),
        &["action"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(ELECTIONS_STARTED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(VOTES_GRANTED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(HEARTBEATS_SENT.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ENTRIES_COMMITTED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ENTRIES_APPLIED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSAL_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SUPERVISOR_ACTION_VEC.clone()));
}
