//! Liveness and catch-up bookkeeping for the maintenance supervisor.
//!
//! The consensus loop records every peer contact and, while leader, each
//! peer's replication progress. Database replicas additionally report their
//! applied change etag through the admin API. The supervisor reads all of
//! this to decide promotions, demotions and removals; nothing here mutates
//! the topology.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::raft::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    /// Unheard long enough to stop trusting it, not long enough to act.
    Suspected,
    Unreachable,
}

/// How long a node may stay silent before its health degrades.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub suspect_after: Duration,
    pub unreachable_after: Duration,
    /// Grace after process start during which silence means "not yet
    /// connected", not "down".
    pub startup_grace: Duration,
}

#[derive(Default)]
struct Inner {
    last_contact: HashMap<NodeId, Instant>,
    /// Replication progress (log match index), leader's view.
    progress: HashMap<NodeId, u64>,
    /// Applied change etag per (database, node), reported by the replicas.
    database_etags: HashMap<(String, NodeId), u64>,
}

pub struct HealthTracker {
    started_at: Instant,
    thresholds: HealthThresholds,
    inner: Mutex<Inner>,
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        HealthTracker {
            started_at: Instant::now(),
            thresholds,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record_contact(&self, node: NodeId) {
        self.inner
            .lock()
            .unwrap()
            .last_contact
            .insert(node, Instant::now());
    }

    pub fn record_progress(&self, node: NodeId, match_index: u64) {
        self.inner.lock().unwrap().progress.insert(node, match_index);
    }

    pub fn record_database_status(&self, db: &str, node: NodeId, etag: u64) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .database_etags
            .entry((db.to_string(), node))
            .or_insert(0);
        // Etags only move forward; a stale report never rolls one back.
        if etag > *entry {
            *entry = etag;
        }
    }

    pub fn progress(&self, node: NodeId) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .progress
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    pub fn database_etag(&self, db: &str, node: NodeId) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .database_etags
            .get(&(db.to_string(), node))
            .copied()
            .unwrap_or(0)
    }

    /// How long this node has been silent. A node never heard from counts
    /// from process start.
    pub fn unheard_for(&self, node: NodeId) -> Duration {
        let inner = self.inner.lock().unwrap();
        match inner.last_contact.get(&node) {
            Some(at) => at.elapsed(),
            None => self.started_at.elapsed(),
        }
    }

    pub fn node_health(&self, node: NodeId) -> NodeHealth {
        let inner = self.inner.lock().unwrap();
        let silent = match inner.last_contact.get(&node) {
            Some(at) => at.elapsed(),
            None => {
                // Within the startup grace the node gets the benefit of the
                // doubt.
                if self.started_at.elapsed() < self.thresholds.startup_grace {
                    return NodeHealth::Healthy;
                }
                self.started_at.elapsed()
            }
        };
        if silent < self.thresholds.suspect_after {
            NodeHealth::Healthy
        } else if silent < self.thresholds.unreachable_after {
            NodeHealth::Suspected
        } else {
            NodeHealth::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(suspect_ms: u64, unreachable_ms: u64, grace_ms: u64) -> HealthThresholds {
        HealthThresholds {
            suspect_after: Duration::from_millis(suspect_ms),
            unreachable_after: Duration::from_millis(unreachable_ms),
            startup_grace: Duration::from_millis(grace_ms),
        }
    }

    #[test]
    fn recently_heard_node_is_healthy() {
        let tracker = HealthTracker::new(thresholds(10_000, 60_000, 0));
        tracker.record_contact(1);
        assert_eq!(tracker.node_health(1), NodeHealth::Healthy);
    }

    #[test]
    fn silent_node_degrades_to_suspected_then_unreachable() {
        // Zero thresholds make any elapsed time count as silence.
        let suspected = HealthTracker::new(thresholds(0, 60_000, 0));
        suspected.record_contact(1);
        assert_eq!(suspected.node_health(1), NodeHealth::Suspected);

        let unreachable = HealthTracker::new(thresholds(0, 0, 0));
        unreachable.record_contact(1);
        assert_eq!(unreachable.node_health(1), NodeHealth::Unreachable);
    }

    #[test]
    fn unknown_node_is_healthy_within_startup_grace() {
        let tracker = HealthTracker::new(thresholds(0, 0, 60_000));
        assert_eq!(tracker.node_health(9), NodeHealth::Healthy);

        let expired = HealthTracker::new(thresholds(0, 0, 0));
        assert_eq!(expired.node_health(9), NodeHealth::Unreachable);
    }

    #[test]
    fn database_etags_never_regress() {
        let tracker = HealthTracker::new(thresholds(1000, 2000, 0));
        tracker.record_database_status("orders", 2, 17);
        tracker.record_database_status("orders", 2, 11);
        assert_eq!(tracker.database_etag("orders", 2), 17);
        assert_eq!(tracker.database_etag("orders", 3), 0);
    }
}
