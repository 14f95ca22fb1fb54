//! The consensus protocol automaton.
//!
//! `RaftCore` is transport-agnostic and synchronous: events go in
//! (`step`, `on_election_timeout`, `on_heartbeat_tick`, `propose`),
//! outbound envelopes accumulate in a queue the consensus loop drains.
//! All mutable consensus state lives here, owned by exactly one task.
//!
//! Quorum is counted over the Members of the applied topology: the state
//! machine is the cluster topology, so membership changes take effect as
//! soon as the command that carries them is applied. Promotables and
//! watchers receive the log but never vote and never count toward commit.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use crate::error::ClusterError;
use crate::metrics;

use super::log::{HardState, LogStore};
use super::message::{Envelope, LogEntry, RaftMessage};
use super::{Membership, NodeId, Role, StateMachine};

/// Cap on entries shipped in one AppendEntries round.
const MAX_ENTRIES_PER_APPEND: usize = 256;

pub struct RaftCore<S: StateMachine> {
    pub id: NodeId,
    store: LogStore,
    state_machine: S,
    role: Role,
    current_leader: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    membership: Membership,
    /// Leader volatile state, rebuilt on every election.
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    /// Peers removed from the topology that still need the log suffix
    /// telling them so, keyed by the index they must reach first.
    retiring: HashMap<NodeId, u64>,
    votes_received: BTreeSet<NodeId>,
    /// Outbound messages, drained by the consensus loop.
    out: VecDeque<Envelope>,
    /// Last valid leader contact (or granted vote); the loop compares this
    /// against the randomized election timeout.
    pub last_leader_contact: Instant,
}

impl<S: StateMachine> RaftCore<S> {
    /// Restores a node from its durable state: snapshot first, then replay
    /// of the committed log suffix, in index order.
    pub fn new(id: NodeId, store: LogStore, mut state_machine: S) -> std::io::Result<Self> {
        let mut last_applied = 0;
        if let Some((snap_index, snap_term, data)) = store.load_snapshot()? {
            state_machine.on_snapshot(snap_index, snap_term, &data);
            last_applied = snap_index;
        }

        let commit_index = store.hard_state().commit;
        let mut core = RaftCore {
            id,
            store,
            state_machine,
            role: Role::Passive,
            current_leader: None,
            commit_index,
            last_applied,
            membership: Membership::default(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            retiring: HashMap::new(),
            votes_received: BTreeSet::new(),
            out: VecDeque::new(),
            last_leader_contact: Instant::now(),
        };
        core.replay_committed();
        core.membership = core.state_machine.membership();
        core.role = core.passive_or_follower();
        Ok(core)
    }

    fn replay_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self
                .store
                .entry(self.last_applied)
                .expect("committed entry missing from log")
                .clone();
            if !entry.command.is_empty() {
                self.state_machine.apply(entry.index, &entry.command);
            }
        }
    }

    // === Accessors ===

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.store.hard_state().term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.current_leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn last_log_index(&self) -> u64 {
        self.store.last_index()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Replication progress of a peer, as far as this leader knows.
    pub fn peer_match_index(&self, peer: NodeId) -> u64 {
        self.match_index.get(&peer).copied().unwrap_or(0)
    }

    pub fn take_messages(&mut self) -> Vec<Envelope> {
        self.out.drain(..).collect()
    }

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.out.push_back(Envelope {
            from: self.id,
            to,
            message,
        });
    }

    // === Membership helpers ===

    /// Voters for quorum purposes. Before the bootstrap command is applied
    /// the topology is empty and the local node alone forms the quorum.
    fn effective_voters(&self) -> BTreeSet<NodeId> {
        if self.membership.voters.is_empty() {
            let mut only_self = BTreeSet::new();
            only_self.insert(self.id);
            only_self
        } else {
            self.membership.voters.clone()
        }
    }

    fn is_voter(&self, node: NodeId) -> bool {
        self.effective_voters().contains(&node)
    }

    fn passive_or_follower(&self) -> Role {
        if self.membership.replicas.contains(&self.id) {
            Role::Follower
        } else {
            Role::Passive
        }
    }

    fn replication_targets(&self) -> Vec<NodeId> {
        self.membership
            .replicas
            .iter()
            .chain(self.retiring.keys())
            .copied()
            .filter(|&n| n != self.id)
            .collect::<BTreeSet<NodeId>>()
            .into_iter()
            .collect()
    }

    // === Persistence helpers ===

    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) {
        let hs = HardState {
            term,
            voted_for,
            commit: self.store.hard_state().commit,
        };
        self.store
            .save_hard_state(hs)
            .expect("failed to persist hard state");
    }

    fn persist_commit(&mut self) {
        let mut hs = self.store.hard_state().clone();
        if hs.commit != self.commit_index {
            hs.commit = self.commit_index;
            self.store
                .save_hard_state(hs)
                .expect("failed to persist commit index");
        }
    }

    // === Event entry points ===

    /// Feed one message from a peer through the automaton.
    pub fn step(&mut self, envelope: Envelope) -> Vec<u64> {
        let from = envelope.from;
        let term = envelope.message.term();

        // Campaigns from nodes outside the voting set (typically a node
        // that has not yet applied its own removal) are refused without
        // adopting their term, so they cannot depose a working leader.
        if let RaftMessage::VoteRequest { candidate_id, .. } = &envelope.message {
            if !self.membership.is_empty() && !self.membership.voters.contains(candidate_id) {
                let current = self.current_term();
                self.send(
                    *candidate_id,
                    RaftMessage::VoteResponse {
                        term: current,
                        vote_granted: false,
                    },
                );
                return Vec::new();
            }
        }

        // Terms only advance through elections among voters, so a node
        // outside the topology cannot carry a legitimate newer term. Most
        // likely it inflated its own term campaigning after removal; adopt
        // nothing from it and stop replicating to it if we still were.
        let outsider = !self.membership.is_empty() && !self.membership.replicas.contains(&from);
        if outsider && term > self.current_term() {
            if self.retiring.remove(&from).is_some() {
                self.next_index.remove(&from);
                self.match_index.remove(&from);
            }
            return Vec::new();
        }

        // Any message with a newer term corrects this node first.
        if term > self.current_term() {
            self.step_down(term);
        }

        match envelope.message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                self.handle_vote_request(term, candidate_id, last_log_index, last_log_term);
                Vec::new()
            }
            RaftMessage::VoteResponse { term, vote_granted } => {
                self.handle_vote_response(from, term, vote_granted);
                Vec::new()
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => self.handle_append_entries_response(from, term, success, match_index),
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
            } => {
                self.handle_install_snapshot(
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    data,
                );
                Vec::new()
            }
            RaftMessage::InstallSnapshotResponse { term: _, success } => {
                if success && self.role == Role::Leader {
                    // The follower holds the snapshot; resume from the live suffix.
                    self.next_index.insert(from, self.store.first_index());
                }
                Vec::new()
            }
        }
    }

    /// A newer term was observed somewhere. Leader-role activity for the old
    /// term dies here; pending proposals are failed by the loop when it sees
    /// the role change.
    fn step_down(&mut self, term: u64) {
        let was = self.role;
        self.save_term_and_vote(term, None);
        self.role = self.passive_or_follower();
        self.current_leader = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.retiring.clear();
        if was == Role::Leader || was == Role::Candidate {
            log::info!(
                "node {} stepped down (was {:?}, saw term {})",
                self.id,
                was,
                term
            );
        }
    }

    // === Elections ===

    /// Called by the loop when the election timeout elapses with no leader
    /// contact. Passive nodes and non-members never campaign.
    pub fn on_election_timeout(&mut self) {
        if self.role == Role::Leader || self.role == Role::Passive {
            return;
        }
        if !self.is_voter(self.id) {
            return;
        }
        self.start_election();
    }

    fn start_election(&mut self) {
        let term = self.current_term() + 1;
        self.save_term_and_vote(term, Some(self.id));
        self.role = Role::Candidate;
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.last_leader_contact = Instant::now();
        metrics::ELECTIONS_STARTED.inc();
        log::info!("node {} starting election for term {}", self.id, term);

        let voters = self.effective_voters();
        if self.has_vote_majority() {
            // Single-voter cluster: the election is already won.
            self.become_leader();
            return;
        }
        let last_log_index = self.store.last_index();
        let last_log_term = self.store.last_term();
        for voter in voters {
            if voter == self.id {
                continue;
            }
            self.send(
                voter,
                RaftMessage::VoteRequest {
                    term,
                    candidate_id: self.id,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    fn has_vote_majority(&self) -> bool {
        let voters = self.effective_voters();
        let granted = self.votes_received.intersection(&voters).count();
        granted * 2 > voters.len()
    }

    fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        let granted = term >= self.current_term()
            && self.is_voter(self.id)
            && self.is_voter(candidate_id)
            && (self.store.hard_state().voted_for.is_none()
                || self.store.hard_state().voted_for == Some(candidate_id))
            && self.log_up_to_date(last_log_term, last_log_index);

        if granted {
            // The vote must be durable before the response leaves, or a
            // crash-restart could vote twice in this term.
            self.save_term_and_vote(self.current_term(), Some(candidate_id));
            self.last_leader_contact = Instant::now();
            metrics::VOTES_GRANTED.inc();
        }
        self.send(
            candidate_id,
            RaftMessage::VoteResponse {
                term: self.current_term(),
                vote_granted: granted,
            },
        );
    }

    /// Candidate log comparison by (last term, last index).
    fn log_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let my_last_term = self.store.last_term();
        let my_last_index = self.store.last_index();
        candidate_last_term > my_last_term
            || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
    }

    fn handle_vote_response(&mut self, from: NodeId, term: u64, vote_granted: bool) {
        if self.role != Role::Candidate || term < self.current_term() {
            return;
        }
        if vote_granted && self.is_voter(from) {
            self.votes_received.insert(from);
        }
        if self.has_vote_majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.current_leader = Some(self.id);
        log::info!(
            "node {} became leader for term {}",
            self.id,
            self.current_term()
        );

        let next = self.store.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        self.retiring.clear();
        for peer in self.replication_targets() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        // No-op entry: commits the previous terms' suffix indirectly and
        // establishes this term's commit point.
        let noop = LogEntry::new(self.current_term(), next, Vec::new());
        self.store
            .append(&[noop])
            .expect("failed to append election no-op");
        self.advance_commit();
        self.broadcast_append();
    }

    // === Replication ===

    /// Leader-side append. Returns the index assigned to the command; the
    /// loop resolves the caller once that index commits, or fails it on
    /// leadership loss.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<u64, ClusterError> {
        if self.role != Role::Leader {
            return Err(ClusterError::NotLeader {
                leader_hint: self.current_leader,
            });
        }
        let index = self.store.last_index() + 1;
        let entry = LogEntry::new(self.current_term(), index, command);
        self.store.append(&[entry])?;
        self.advance_commit();
        self.broadcast_append();
        Ok(index)
    }

    /// Heartbeat tick: the leader re-sends whatever each peer still needs;
    /// an empty batch is the heartbeat. This is also the retry path for
    /// lost replication traffic.
    pub fn on_heartbeat_tick(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        self.broadcast_append();
        metrics::HEARTBEATS_SENT.inc();
    }

    fn broadcast_append(&mut self) {
        for peer in self.replication_targets() {
            self.send_append_to(peer);
        }
    }

    fn send_append_to(&mut self, peer: NodeId) {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.store.last_index() + 1);

        if next < self.store.first_index() {
            // The peer is behind the compaction horizon; ship the snapshot.
            match self.store.load_snapshot() {
                Ok(Some((last_included_index, last_included_term, data))) => {
                    self.send(
                        peer,
                        RaftMessage::InstallSnapshot {
                            term: self.current_term(),
                            leader_id: self.id,
                            last_included_index,
                            last_included_term,
                            data,
                        },
                    );
                }
                Ok(None) => {
                    log::error!("no snapshot although log starts at {}", self.store.first_index());
                }
                Err(e) => {
                    log::error!("failed to load snapshot for peer {}: {}", peer, e);
                }
            }
            return;
        }

        let prev_log_index = next - 1;
        let prev_log_term = self.store.term(prev_log_index).unwrap_or(0);
        let entries = self.store.entries_from(next, MAX_ENTRIES_PER_APPEND);
        self.send(
            peer,
            RaftMessage::AppendEntries {
                term: self.current_term(),
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Vec<u64> {
        if term < self.current_term() {
            self.send(
                leader_id,
                RaftMessage::AppendEntriesResponse {
                    term: self.current_term(),
                    success: false,
                    match_index: self.store.last_index(),
                },
            );
            return Vec::new();
        }

        // Valid leader for this term: a candidate loses, a passive node that
        // is being replicated to has been (re)admitted to the cluster.
        self.role = Role::Follower;
        self.current_leader = Some(leader_id);
        self.last_leader_contact = Instant::now();

        // Log-matching check
        let prev_ok = match self.store.term(prev_log_index) {
            Some(t) => t == prev_log_term,
            // prev_log_index is either past our log or under our snapshot.
            None => false,
        };
        if !prev_ok {
            // Hint where our log actually ends (or where the durable prefix
            // resumes) so the leader backtracks in one step.
            let hint = if prev_log_index > self.store.last_index() {
                self.store.last_index()
            } else {
                self.commit_index
            };
            self.send(
                leader_id,
                RaftMessage::AppendEntriesResponse {
                    term: self.current_term(),
                    success: false,
                    match_index: hint,
                },
            );
            return Vec::new();
        }

        // Find the first entry that is actually new or conflicting; entries
        // already present with the same term are left alone (idempotent).
        let mut first_new = None;
        for (i, entry) in entries.iter().enumerate() {
            match self.store.term(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    // Conflict: overwrite the uncommitted suffix.
                    self.store
                        .truncate_from(entry.index)
                        .expect("failed to truncate conflicting suffix");
                    first_new = Some(i);
                    break;
                }
                None => {
                    first_new = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = first_new {
            self.store
                .append(&entries[i..])
                .expect("failed to append replicated entries");
        }

        // Only entries this append just confirmed matching are safe to
        // commit; anything we hold past `last_new_index` may be a stale
        // suffix the leader has yet to overwrite.
        let last_new_index = prev_log_index + entries.len() as u64;
        let mut applied = Vec::new();
        let new_commit = leader_commit.min(last_new_index);
        if new_commit > self.commit_index {
            metrics::ENTRIES_COMMITTED.inc_by((new_commit - self.commit_index) as f64);
            self.commit_index = new_commit;
            self.persist_commit();
            applied = self.apply_committed();
        }

        self.send(
            leader_id,
            RaftMessage::AppendEntriesResponse {
                term: self.current_term(),
                success: true,
                match_index: last_new_index.max(prev_log_index),
            },
        );
        applied
    }

    fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        term: u64,
        success: bool,
        match_index: u64,
    ) -> Vec<u64> {
        if self.role != Role::Leader || term < self.current_term() {
            return Vec::new();
        }
        // Late response from a peer we already stopped tracking.
        if !self.next_index.contains_key(&from) {
            return Vec::new();
        }

        if success {
            let known = self.match_index.entry(from).or_insert(0);
            if match_index > *known {
                *known = match_index;
            }
            let reached = *known;
            self.next_index.insert(from, reached + 1);

            // A retiring peer that holds the suffix containing its own
            // removal gets one last append carrying the commit point (so it
            // actually applies the removal and goes passive), then is
            // dropped for good.
            if let Some(&goal) = self.retiring.get(&from) {
                if reached >= goal {
                    self.retiring.remove(&from);
                    self.send_append_to(from);
                    self.next_index.remove(&from);
                    self.match_index.remove(&from);
                    return Vec::new();
                }
            }
            return self.advance_commit();
        }

        // Backtrack using the follower's hint, at least one step, never
        // below 1; resend immediately instead of waiting a heartbeat.
        let next = self
            .next_index
            .get(&from)
            .copied()
            .unwrap_or(self.store.last_index() + 1);
        let backed = next.saturating_sub(1).min(match_index + 1).max(1);
        self.next_index.insert(from, backed);
        self.send_append_to(from);
        Vec::new()
    }

    /// Advance the commit point: an entry commits once a majority of voters
    /// hold it and it belongs to the current term. Entries from earlier
    /// terms commit only by being covered by a current-term commit.
    fn advance_commit(&mut self) -> Vec<u64> {
        if self.role != Role::Leader {
            return Vec::new();
        }
        let voters = self.effective_voters();
        let mut new_commit = self.commit_index;
        for n in (self.commit_index + 1)..=self.store.last_index() {
            if self.store.term(n) != Some(self.current_term()) {
                continue;
            }
            let holders = voters
                .iter()
                .filter(|&&v| {
                    v == self.id || self.match_index.get(&v).copied().unwrap_or(0) >= n
                })
                .count();
            if holders * 2 > voters.len() {
                new_commit = n;
            }
        }
        if new_commit > self.commit_index {
            metrics::ENTRIES_COMMITTED.inc_by((new_commit - self.commit_index) as f64);
            self.commit_index = new_commit;
            self.persist_commit();
            return self.apply_committed();
        }
        Vec::new()
    }

    /// Applies everything committed but not yet applied, strictly in index
    /// order, then refreshes the membership view. Returns applied indices so
    /// the loop can resolve pending proposals.
    fn apply_committed(&mut self) -> Vec<u64> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self
                .store
                .entry(self.last_applied)
                .expect("committed entry missing from log")
                .clone();
            if !entry.command.is_empty() {
                self.state_machine.apply(entry.index, &entry.command);
                metrics::ENTRIES_APPLIED.inc();
            }
            applied.push(entry.index);
        }
        if !applied.is_empty() {
            self.refresh_membership();
        }
        applied
    }

    /// Re-reads membership after applies; reacts to this node being added
    /// to or removed from the cluster, and tracks replication targets.
    fn refresh_membership(&mut self) {
        let membership = self.state_machine.membership();
        if membership == self.membership {
            return;
        }
        self.membership = membership;

        if !self.membership.replicas.contains(&self.id) && !self.membership.is_empty() {
            // Removed from the cluster: out of every role, immediately.
            log::info!("node {} removed from cluster, going passive", self.id);
            self.role = Role::Passive;
            self.current_leader = None;
            self.votes_received.clear();
            self.next_index.clear();
            self.match_index.clear();
            return;
        }

        if self.role == Role::Leader {
            let next = self.store.last_index() + 1;
            let gone: Vec<NodeId> = self
                .next_index
                .keys()
                .copied()
                .filter(|n| !self.membership.replicas.contains(n))
                .collect();
            for peer in gone {
                // Keep replicating until the peer holds the entries that
                // removed it, then drop it.
                self.retiring.entry(peer).or_insert(self.last_applied);
            }
            for peer in self.replication_targets() {
                self.next_index.entry(peer).or_insert(next);
                self.match_index.entry(peer).or_insert(0);
            }
        }
    }

    // === Snapshots ===

    fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    ) {
        if term < self.current_term() {
            self.send(
                leader_id,
                RaftMessage::InstallSnapshotResponse {
                    term: self.current_term(),
                    success: false,
                },
            );
            return;
        }
        self.role = Role::Follower;
        self.current_leader = Some(leader_id);
        self.last_leader_contact = Instant::now();

        if last_included_index > self.last_applied {
            self.store
                .install_snapshot(last_included_index, last_included_term, data.clone())
                .expect("failed to install snapshot");
            self.state_machine
                .on_snapshot(last_included_index, last_included_term, &data);
            self.commit_index = self.commit_index.max(last_included_index);
            self.last_applied = last_included_index;
            self.refresh_membership();
            log::info!(
                "node {} installed snapshot through index {}",
                self.id,
                last_included_index
            );
        }
        self.send(
            leader_id,
            RaftMessage::InstallSnapshotResponse {
                term: self.current_term(),
                success: true,
            },
        );
    }

    /// Persist a snapshot of the applied state and compact the log under it.
    pub fn save_snapshot(&mut self) -> std::io::Result<()> {
        if self.last_applied == 0 {
            return Ok(());
        }
        let data = self.state_machine.snapshot();
        let last_term = self.store.term(self.last_applied).unwrap_or(0);
        self.store.save_snapshot(data, self.last_applied, last_term)
    }

    // === Bootstrap ===

    /// Turns a fresh node into a single-node cluster leader. The caller must
    /// follow up with the command that adds this node to the topology so the
    /// cluster state is reconstructible from the log alone.
    pub fn bootstrap(&mut self) -> Result<(), ClusterError> {
        if self.store.last_index() != 0 || !self.membership.is_empty() {
            return Err(ClusterError::Config(
                "bootstrap requires an empty log and no topology".to_string(),
            ));
        }
        self.save_term_and_vote(1, Some(self.id));
        self.role = Role::Leader;
        self.current_leader = Some(self.id);
        log::info!("node {} bootstrapping a new cluster", self.id);
        Ok(())
    }
}
