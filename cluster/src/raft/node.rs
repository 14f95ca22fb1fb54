//! The consensus loop.
//!
//! One task per process owns the `RaftCore` together with its log store and
//! state machine. Everything reaches it through channels: peer messages on
//! the inbound mailbox, commands as `Proposal`s. Outbound envelopes are
//! handed to the transport through another channel, and role changes are
//! published on a watch channel for the rest of the process (admin API,
//! maintenance supervisor) to observe.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::error::ClusterError;
use crate::health::HealthTracker;
use crate::metrics;
use crate::raft::core::RaftCore;
use crate::raft::message::Envelope;
use crate::raft::proposal::Proposal;
use crate::raft::{NodeId, Role, StateMachine};

const OUT_MAILBOX_SIZE: usize = 1024;

/// Timers the loop runs on, taken from the runtime config at startup.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub snapshot_interval: Duration,
}

/// Snapshot of the node's consensus position, published on a watch channel
/// whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleInfo {
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
}

pub struct Node<S: StateMachine> {
    core: RaftCore<S>,
    my_mailbox: Receiver<Envelope>,
    out_mailbox: Sender<Envelope>,
    proposals: Receiver<Proposal>,
    proposed: VecDeque<Proposal>,
    role_tx: watch::Sender<RoleInfo>,
    health: Arc<HealthTracker>,
    timing: Timing,
}

impl<S: StateMachine + Send + 'static> Node<S> {
    /// Spawns the consensus loop. Returns the channel the transport drains
    /// for outbound traffic and the role watch.
    pub fn start(
        core: RaftCore<S>,
        my_mailbox: Receiver<Envelope>,
        proposals: Receiver<Proposal>,
        health: Arc<HealthTracker>,
        timing: Timing,
    ) -> (Receiver<Envelope>, watch::Receiver<RoleInfo>) {
        let (sx, out_mailbox) = mpsc::channel(OUT_MAILBOX_SIZE);
        let (role_tx, role_rx) = watch::channel(RoleInfo {
            role: core.role(),
            term: core.current_term(),
            leader: core.leader(),
        });

        let mut node = Node {
            core,
            my_mailbox,
            out_mailbox: sx,
            proposals,
            proposed: VecDeque::new(),
            role_tx,
            health,
            timing,
        };

        tokio::spawn(async move {
            node.run().await;
        });

        (out_mailbox, role_rx)
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.timing.election_timeout_min.as_millis() as u64;
        let max = self.timing.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn run(&mut self) {
        let mut election_timeout = self.random_election_timeout();
        let mut last_heartbeat = Instant::now();
        let mut last_snapshot_save = Instant::now();
        let mut last_snapshot_index = self.core.last_applied();
        let mut published = *self.role_tx.borrow();

        loop {
            tokio::select! {
                Some(envelope) = self.my_mailbox.recv() => {
                    self.step(envelope);
                    while let Ok(envelope) = self.my_mailbox.try_recv() {
                        self.step(envelope);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }

            // Heartbeat / replication retry while leader.
            if self.core.role() == Role::Leader
                && last_heartbeat.elapsed() >= self.timing.heartbeat_interval
            {
                self.core.on_heartbeat_tick();
                self.publish_replication_progress();
                last_heartbeat = Instant::now();
            }

            // Election timeout while waiting for a leader.
            if matches!(self.core.role(), Role::Follower | Role::Candidate)
                && self.core.last_leader_contact.elapsed() >= election_timeout
            {
                self.core.on_election_timeout();
                self.core.last_leader_contact = std::time::Instant::now();
                election_timeout = self.random_election_timeout();
            }

            // Periodic snapshot of the applied state.
            if last_snapshot_save.elapsed() >= self.timing.snapshot_interval
                && last_snapshot_index < self.core.last_applied()
            {
                match self.core.save_snapshot() {
                    Ok(()) => {
                        last_snapshot_index = self.core.last_applied();
                        log::info!("saved snapshot at index {}", last_snapshot_index);
                    }
                    Err(e) => log::error!("failed to save snapshot: {}", e),
                }
                last_snapshot_save = Instant::now();
            }

            self.drain_outbound();
            self.resolve_proposals();
            published = self.publish_role(published);
        }
    }

    fn step(&mut self, envelope: Envelope) {
        self.health.record_contact(envelope.from);
        self.core.step(envelope);
    }

    fn propose(&mut self, mut proposal: Proposal) {
        match self.core.propose(proposal.command.clone()) {
            Ok(index) => {
                proposal.proposed = index;
                self.proposed.push_back(proposal);
            }
            Err(e) => {
                metrics::PROPOSAL_COUNTER_VEC
                    .with_label_values(&["not_leader"])
                    .inc();
                proposal.resolve(Err(e));
            }
        }
    }

    /// Answer proposals whose entries have been applied; fail everything
    /// pending if leadership was lost in between (the entry may still
    /// commit under the next leader, the caller has to resubmit and check).
    fn resolve_proposals(&mut self) {
        if self.core.role() != Role::Leader {
            for mut proposal in self.proposed.drain(..) {
                metrics::PROPOSAL_COUNTER_VEC
                    .with_label_values(&["leadership_lost"])
                    .inc();
                proposal.resolve(Err(ClusterError::LeadershipLost));
            }
            return;
        }
        let applied = self.core.last_applied();
        while let Some(front) = self.proposed.front() {
            if front.proposed > applied {
                break;
            }
            let mut proposal = self.proposed.pop_front().unwrap();
            let index = proposal.proposed;
            metrics::PROPOSAL_COUNTER_VEC
                .with_label_values(&["committed"])
                .inc();
            proposal.resolve(Ok(index));
        }
    }

    fn drain_outbound(&mut self) {
        for envelope in self.core.take_messages() {
            if let Err(e) = self.out_mailbox.try_send(envelope) {
                // Replication traffic is re-sent on the next heartbeat.
                log::warn!("outbound mailbox full, dropping message: {}", e);
            }
        }
    }

    fn publish_role(&mut self, previous: RoleInfo) -> RoleInfo {
        let info = RoleInfo {
            role: self.core.role(),
            term: self.core.current_term(),
            leader: self.core.leader(),
        };
        if info != previous {
            log::info!(
                "role change: {:?} term {} leader {:?}",
                info.role,
                info.term,
                info.leader
            );
            let _ = self.role_tx.send(info);
        }
        info
    }

    /// While leader, expose each peer's replication progress so the
    /// maintenance supervisor can judge catch-up without touching the core.
    fn publish_replication_progress(&self) {
        self.health
            .record_progress(self.core.id, self.core.last_log_index());
        for &peer in &self.core.membership().replicas {
            if peer != self.core.id {
                self.health
                    .record_progress(peer, self.core.peer_match_index(peer));
            }
        }
    }
}
