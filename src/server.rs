//! The per-server consensus state machine (§4.3): `Raft<H>` drives follower,
//! candidate (with Pre-Vote), and leader behavior, all side effects routed
//! through `H: Host`. Owns its `Log`, `NodeTable`, and `Membership` directly
//! — no `Arc`, no `Mutex`, no background tasks (§5).

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::entry::{Entry, EntryId, EntryRef, EntryStatus, EntryType, LogIndex, Term};
use crate::error::{Error, Result};
use crate::host::{ApplyOutcome, Host, InstallSnapshotProgress, MembershipEventKind};
use crate::log::Log;
use crate::membership::Membership;
use crate::message::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, RequestVote,
    RequestVoteResponse, VoteGranted,
};
use crate::node::{NodeId, NodeTable};

const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_LEASE_MAINTENANCE_GRACE: Duration = Duration::from_millis(100);

/// The three roles a server can occupy. `Candidate`'s `prevote` flag
/// distinguishes the probe phase (term not yet bumped) from the real-vote
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate { prevote: bool },
    Leader,
}

#[derive(Debug, Clone, Copy)]
struct SnapshotMeta {
    last_idx: LogIndex,
    last_term: Term,
}

/// The consensus engine for one cluster member.
pub struct Raft<H: Host> {
    host: H,
    log: Log,
    nodes: NodeTable,
    membership: Membership,

    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,

    election_timeout: Duration,
    request_timeout: Duration,
    lease_maintenance_grace: Duration,
    first_start: bool,
    started_at: Option<Instant>,
    last_seen_time: Option<Instant>,

    election_deadline: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,

    /// Who we last promised (via an accepted AppendEntries/InstallSnapshot)
    /// not to vote away from, and until when.
    granted_lease_to: Option<NodeId>,
    granted_lease_until: Option<Instant>,

    snapshot_in_progress: bool,
    pending_snapshot: Option<SnapshotMeta>,
}

impl<H: Host> Raft<H> {
    pub fn new(id: NodeId, host: H) -> Self {
        Raft {
            host,
            log: Log::new(),
            nodes: NodeTable::new(id),
            membership: Membership::new(),

            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,

            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lease_maintenance_grace: DEFAULT_LEASE_MAINTENANCE_GRACE,
            first_start: true,
            started_at: None,
            last_seen_time: None,

            election_deadline: None,
            last_heartbeat_sent: None,

            granted_lease_to: None,
            granted_lease_until: None,

            snapshot_in_progress: false,
            pending_snapshot: None,
        }
    }

    /// Resets the engine to a fresh follower with an empty log and node
    /// table, keeping the host and this server's own id.
    pub fn clear(&mut self) {
        let id = self.nodes.self_id();
        self.log.clear();
        self.nodes = NodeTable::new(id);
        self.membership = Membership::new();
        self.role = Role::Follower;
        self.current_term = 0;
        self.voted_for = None;
        self.commit_index = 0;
        self.last_applied = 0;
        self.leader_id = None;
        self.election_deadline = None;
        self.last_heartbeat_sent = None;
        self.granted_lease_to = None;
        self.granted_lease_until = None;
        self.snapshot_in_progress = false;
        self.pending_snapshot = None;
    }

    pub fn set_election_timeout(&mut self, t: Duration) {
        self.election_timeout = t;
    }

    pub fn set_request_timeout(&mut self, t: Duration) {
        self.request_timeout = t;
    }

    pub fn set_lease_maintenance_grace(&mut self, t: Duration) {
        self.lease_maintenance_grace = t;
    }

    pub fn set_first_start(&mut self, first_start: bool) {
        self.first_start = first_start;
    }

    // -- Membership bootstrap -------------------------------------------

    pub fn add_node(&mut self, id: NodeId, _is_self: bool) {
        let now = self.now();
        self.nodes.add_voting_node(id, now);
    }

    pub fn add_non_voting_node(&mut self, id: NodeId, _is_self: bool) {
        let now = self.now();
        self.nodes.add_non_voting_node(id, now);
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.nodes.remove_node(id);
    }

    // -- Queries -----------------------------------------------------------

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn current_idx(&self) -> LogIndex {
        self.log.current_idx()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn has_majority_leases(&mut self) -> bool {
        if !matches!(self.role, Role::Leader) {
            return false;
        }
        let now = self.now();
        let grace = self.election_timeout + self.lease_maintenance_grace;
        let mut count = 1usize; // self always counts toward its own lease majority.
        for n in self.nodes.voting_peers() {
            let ok = match n.lease {
                Some(l) if now < l => true,
                _ => now.saturating_duration_since(n.effective_time) < grace,
            };
            if ok {
                count += 1;
            }
        }
        count >= self.nodes.majority_size()
    }

    /// Confirms it is safe to serve a linearizable read locally: the caller
    /// must still hold a lease majority, or the read might be stale if a new
    /// leader has since been elected elsewhere. Returns
    /// [`Error::MightViolateLease`] rather than a stale answer.
    pub fn read_barrier(&mut self) -> Result<()> {
        if !matches!(self.role, Role::Leader) {
            return Err(Error::NotLeader { leader_hint: self.leader_id });
        }
        if !self.has_majority_leases() {
            return Err(Error::MightViolateLease);
        }
        Ok(())
    }

    pub fn msg_entry_response_committed(&self, r: EntryRef) -> EntryStatus {
        if r.index <= self.log.base() {
            // Only committed entries are ever folded into a snapshot.
            return EntryStatus::Committed;
        }
        match self.log.get_at(r.index) {
            Some(e) if e.term == r.term && e.id == r.id => {
                if r.index <= self.commit_index {
                    EntryStatus::Committed
                } else {
                    EntryStatus::Pending
                }
            }
            _ => EntryStatus::Invalidated,
        }
    }

    // -- Time handling (§9 Open Question: backwards clock) -----------------

    fn now(&mut self) -> Instant {
        let raw = self.host.get_time();
        self.normalize_time(raw)
    }

    fn normalize_time(&mut self, observed: Instant) -> Instant {
        if let Some(last) = self.last_seen_time {
            if observed < last {
                debug_assert!(false, "host clock moved backwards");
                self.host.log_message(
                    None,
                    crate::host::LogLevel::Warn,
                    "host clock moved backwards; clamping to previous reading",
                );
                return last;
            }
        }
        self.last_seen_time = Some(observed);
        observed
    }

    fn sample_election_deadline(&mut self, now: Instant) -> Instant {
        let r = self.host.get_rand().clamp(0.0, 0.999_999);
        let extra = self.election_timeout.mul_f64(r);
        now + self.election_timeout + extra
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        self.election_deadline = Some(self.sample_election_deadline(now));
    }

    // -- Role transitions ----------------------------------------------

    fn become_follower(&mut self, now: Instant) {
        if self.role != Role::Follower {
            info!(term = self.current_term, "stepping down to follower");
        }
        self.role = Role::Follower;
        self.reset_election_deadline(now);
    }

    fn observe_term(&mut self, term: Term, now: Instant) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.host.persist_term(term).map_err(Error::from_host)?;
            self.voted_for = None;
            self.become_follower(now);
        }
        Ok(())
    }

    fn has_outstanding_lease_elsewhere(&self, candidate: NodeId, now: Instant) -> bool {
        if !self.first_start {
            if let Some(started) = self.started_at {
                if now < started + self.election_timeout {
                    return true;
                }
            }
        }
        if let Some(owner) = self.granted_lease_to {
            if owner != candidate {
                if let Some(until) = self.granted_lease_until {
                    if now < until {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn start_election(&mut self, now: Instant) -> Result<()> {
        self.role = Role::Candidate { prevote: true };
        self.reset_election_deadline(now);
        self.nodes.clear_votes();
        info!(term = self.current_term, "starting pre-vote election");

        let msg = RequestVote {
            term: self.current_term,
            candidate_id: self.nodes.self_id(),
            last_log_idx: self.log.current_idx(),
            last_log_term: self.log.current_term(),
            prevote: true,
        };
        let self_id = self.nodes.self_id();
        for peer in self.nodes.ids().collect::<Vec<_>>() {
            if peer != self_id {
                self.host.send_requestvote(peer, &msg).map_err(Error::from_host)?;
            }
        }
        // A lone voter (or a voter with only non-voting peers) already has a
        // majority with no responses needed.
        if self.nodes.has_vote_majority() {
            return self.start_real_vote(now);
        }
        Ok(())
    }

    fn start_real_vote(&mut self, now: Instant) -> Result<()> {
        self.current_term += 1;
        self.host.persist_term(self.current_term).map_err(Error::from_host)?;
        let self_id = self.nodes.self_id();
        self.voted_for = Some(self_id);
        self.host.persist_vote(self_id).map_err(Error::from_host)?;
        self.role = Role::Candidate { prevote: false };
        self.nodes.clear_votes();
        self.reset_election_deadline(now);
        info!(term = self.current_term, "won pre-vote, starting real election");

        let msg = RequestVote {
            term: self.current_term,
            candidate_id: self_id,
            last_log_idx: self.log.current_idx(),
            last_log_term: self.log.current_term(),
            prevote: false,
        };
        for peer in self.nodes.ids().collect::<Vec<_>>() {
            if peer != self_id {
                self.host.send_requestvote(peer, &msg).map_err(Error::from_host)?;
            }
        }
        if self.nodes.has_vote_majority() {
            return self.become_leader(now);
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<()> {
        self.role = Role::Leader;
        self.leader_id = Some(self.nodes.self_id());
        self.nodes.reset_replication_state(self.log.current_idx() + 1, now);
        self.last_heartbeat_sent = None;
        info!(term = self.current_term, "became leader");

        let self_id = self.nodes.self_id();
        for peer in self.nodes.ids().collect::<Vec<_>>() {
            if peer != self_id {
                self.replicate_to(peer)?;
            }
        }
        self.last_heartbeat_sent = Some(now);
        Ok(())
    }

    // -- Replication ------------------------------------------------------

    fn replicate_to(&mut self, peer_id: NodeId) -> Result<()> {
        let Some(peer) = self.nodes.get(peer_id) else { return Ok(()) };
        let next_idx = peer.next_idx.max(1);

        if next_idx <= self.log.base() {
            let msg = InstallSnapshot {
                term: self.current_term,
                last_idx: self.log.base(),
                last_term: self.log.base_term(),
                payload: Vec::new(),
            };
            return self.host.send_installsnapshot(peer_id, &msg).map_err(Error::from_host);
        }

        let prev_log_idx = next_idx - 1;
        let prev_log_term = if prev_log_idx == self.log.base() {
            self.log.base_term()
        } else {
            self.log.term_at(prev_log_idx).unwrap_or(0)
        };
        let (entries, _) = self.log.get_from(next_idx);
        let entries = entries.to_vec();
        let msg = AppendEntries {
            term: self.current_term,
            leader_commit: self.commit_index,
            prev_log_idx,
            prev_log_term,
            n_entries: entries.len(),
            entries,
        };
        self.host.send_appendentries(peer_id, &msg).map_err(Error::from_host)
    }

    // -- Apply loop ---------------------------------------------------

    fn apply_ready(&mut self) -> Result<()> {
        if self.snapshot_in_progress {
            return Ok(());
        }
        while self.last_applied < self.commit_index {
            let idx = self.last_applied + 1;
            let Some(entry) = self.log.get_at(idx) else { break };
            let outcome = self.host.applylog(entry, idx).map_err(Error::from_host)?;
            match outcome {
                ApplyOutcome::Applied => {
                    self.last_applied = idx;
                    if let Some(e) = self.log.get_at(idx) {
                        let node = self.host.log_get_node_id(e, idx);
                        self.membership.commit_log(e, node, idx, &mut self.nodes);
                    }
                }
                ApplyOutcome::Shutdown => return Err(Error::Shutdown),
            }
        }
        Ok(())
    }

    fn advance_commit_index(&mut self) -> Result<()> {
        if !matches!(self.role, Role::Leader) {
            return Ok(());
        }
        let self_match = self.log.current_idx();
        let mut indices = self.nodes.match_indices_including_self(self_match);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let majority = self.nodes.majority_size();
        if majority == 0 || indices.len() < majority {
            return Ok(());
        }
        let candidate_n = indices[majority - 1];
        if candidate_n > self.commit_index {
            if let Some(term) = self.log.term_at(candidate_n) {
                if term == self.current_term {
                    debug!(index = candidate_n, "advancing commit index");
                    self.commit_index = candidate_n;
                    self.apply_ready()?;
                }
            }
        }
        Ok(())
    }

    // -- Periodic tick ------------------------------------------------

    pub fn periodic(&mut self, now: Instant) -> Result<()> {
        let now = self.normalize_time(now);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }

        match self.role {
            Role::Leader => {
                if !self.snapshot_in_progress {
                    let due = self
                        .last_heartbeat_sent
                        .map(|t| now.saturating_duration_since(t) >= self.request_timeout)
                        .unwrap_or(true);
                    if due {
                        self.last_heartbeat_sent = Some(now);
                        let self_id = self.nodes.self_id();
                        for peer in self.nodes.ids().collect::<Vec<_>>() {
                            if peer != self_id {
                                self.replicate_to(peer)?;
                            }
                        }
                    }
                }
                if !self.has_majority_leases() {
                    warn!("lost majority of leases, stepping down");
                    self.become_follower(now);
                }
            }
            Role::Follower | Role::Candidate { .. } => {
                if !self.snapshot_in_progress {
                    let is_voting = self.nodes.get(self.nodes.self_id()).map(|n| n.is_voting).unwrap_or(false);
                    if self.election_deadline.is_none() {
                        let d = self.sample_election_deadline(now);
                        self.election_deadline = Some(d);
                    }
                    let deadline = self.election_deadline.unwrap();
                    if is_voting && now >= deadline {
                        self.start_election(now)?;
                    }
                }
            }
        }

        if !self.snapshot_in_progress {
            self.apply_ready()?;
        }
        Ok(())
    }

    // -- RequestVote --------------------------------------------------

    pub fn recv_requestvote(&mut self, node: NodeId, msg: &RequestVote) -> Result<RequestVoteResponse> {
        let now = self.now();
        if !self.nodes.contains(node) {
            return Ok(RequestVoteResponse { term: self.current_term, vote_granted: VoteGranted::UnknownNode, prevote: msg.prevote });
        }
        if msg.term > self.current_term {
            self.observe_term(msg.term, now)?;
        }

        let deny = RequestVoteResponse { term: self.current_term, vote_granted: VoteGranted::Denied, prevote: msg.prevote };

        if msg.term < self.current_term {
            return Ok(deny);
        }
        if !msg.prevote {
            if let Some(v) = self.voted_for {
                if v != node {
                    return Ok(deny);
                }
            }
        }
        let up_to_date = msg.last_log_term > self.log.current_term()
            || (msg.last_log_term == self.log.current_term() && msg.last_log_idx >= self.log.current_idx());
        if !up_to_date {
            return Ok(deny);
        }
        if self.has_outstanding_lease_elsewhere(node, now) {
            return Ok(deny);
        }

        if msg.prevote {
            debug!(candidate = node, "granting pre-vote");
            return Ok(RequestVoteResponse { term: self.current_term, vote_granted: VoteGranted::Granted, prevote: true });
        }

        self.voted_for = Some(node);
        self.host.persist_vote(node).map_err(Error::from_host)?;
        self.reset_election_deadline(now);
        info!(candidate = node, term = self.current_term, "granting vote");
        Ok(RequestVoteResponse { term: self.current_term, vote_granted: VoteGranted::Granted, prevote: false })
    }

    pub fn recv_requestvote_response(&mut self, node: NodeId, resp: &RequestVoteResponse) -> Result<()> {
        let now = self.now();
        if resp.term > self.current_term {
            self.observe_term(resp.term, now)?;
            return Ok(());
        }
        let Role::Candidate { prevote } = self.role else { return Ok(()) };
        if resp.prevote != prevote {
            return Ok(()); // Stale response from a phase we've already left.
        }
        if resp.vote_granted != VoteGranted::Granted {
            return Ok(());
        }
        if let Some(n) = self.nodes.get_mut(node) {
            n.voted_for_me = true;
        }
        if !self.nodes.has_vote_majority() {
            return Ok(());
        }
        if prevote {
            self.start_real_vote(now)
        } else {
            self.become_leader(now)
        }
    }

    // -- AppendEntries --------------------------------------------------

    pub fn recv_appendentries(&mut self, node: NodeId, msg: &AppendEntries) -> Result<AppendEntriesResponse> {
        let now = self.now();
        if msg.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                current_idx: self.log.current_idx(),
                first_idx: msg.prev_log_idx + 1,
                lease: None,
            });
        }
        if msg.term > self.current_term {
            self.observe_term(msg.term, now)?;
        } else if let Role::Candidate { .. } = self.role {
            self.become_follower(now);
        }

        self.leader_id = Some(node);
        self.granted_lease_to = Some(node);
        let lease_until = now + self.election_timeout;
        self.granted_lease_until = Some(lease_until);
        self.reset_election_deadline(now);

        let prev_matches = if msg.prev_log_idx == 0 {
            true
        } else if msg.prev_log_idx == self.log.base() {
            msg.prev_log_term == self.log.base_term()
        } else {
            self.log.term_at(msg.prev_log_idx) == Some(msg.prev_log_term)
        };

        if !prev_matches {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                current_idx: self.log.current_idx(),
                first_idx: msg.prev_log_idx,
                lease: Some(lease_until),
            });
        }

        let mut first_new_idx = msg.prev_log_idx + 1 + msg.entries.len() as LogIndex;
        for (i, e) in msg.entries.iter().enumerate() {
            let idx = msg.prev_log_idx + 1 + i as LogIndex;
            let existing_term = if idx <= self.log.base() { Some(self.log.base_term()) } else { self.log.term_at(idx) };
            match existing_term {
                Some(t) if t == e.term => continue,
                Some(_) => {
                    if idx <= self.commit_index {
                        return Err(Error::Shutdown);
                    }
                    self.log.truncate_from_with_pop(idx, |batch, first| {
                        for (k, ent) in batch.iter().enumerate() {
                            let this_idx = first + k as LogIndex;
                            let node = self.host.log_get_node_id(ent, this_idx);
                            self.membership.pop_log(ent, node, this_idx, &mut self.nodes, now);
                        }
                        self.host.log_pop(batch, first).map_err(Error::from_host)
                    })?;
                    first_new_idx = idx;
                    break;
                }
                None => {
                    first_new_idx = idx;
                    break;
                }
            }
        }

        let skip = (first_new_idx - (msg.prev_log_idx + 1)) as usize;
        let to_append: Vec<Entry> = msg.entries[skip.min(msg.entries.len())..].to_vec();
        if !to_append.is_empty() {
            self.log.append_with_offer(to_append, |batch, first| {
                let accepted = self.host.log_offer(batch, first).map_err(Error::from_host)?;
                for (k, ent) in batch.iter().take(accepted).enumerate() {
                    let this_idx = first + k as LogIndex;
                    let node = self.host.log_get_node_id(ent, this_idx);
                    self.membership.offer_log(ent, node, this_idx, &mut self.nodes, now);
                }
                Ok(accepted)
            })?;
        }

        let last_new_index = (msg.prev_log_idx + msg.entries.len() as LogIndex).min(self.log.current_idx());
        if msg.leader_commit > self.commit_index {
            self.commit_index = msg.leader_commit.min(last_new_index);
        }
        self.apply_ready()?;

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            current_idx: self.log.current_idx(),
            first_idx: first_new_idx,
            lease: Some(lease_until),
        })
    }

    pub fn recv_appendentries_response(&mut self, node: NodeId, resp: &AppendEntriesResponse) -> Result<()> {
        let now = self.now();
        if resp.term > self.current_term {
            self.observe_term(resp.term, now)?;
            return Ok(());
        }
        if !matches!(self.role, Role::Leader) {
            return Ok(());
        }

        if resp.success {
            let mut became_sufficient = None;
            if let Some(n) = self.nodes.get_mut(node) {
                n.match_idx = resp.current_idx;
                n.next_idx = resp.current_idx + 1;
                if let Some(lease) = resp.lease {
                    n.lease = Some(lease);
                }
                if !n.is_voting && !n.has_sufficient_logs && n.match_idx + 1 >= self.log.current_idx() {
                    n.has_sufficient_logs = true;
                    became_sufficient = Some(node);
                }
            }
            if let Some(node_id) = became_sufficient {
                self.host.node_has_sufficient_logs(node_id).map_err(Error::from_host)?;
                self.host.notify_membership_event(node_id, None, MembershipEventKind::Promoted);
            }
            self.advance_commit_index()?;
        } else {
            let retry = if let Some(n) = self.nodes.get_mut(node) {
                n.next_idx = n.next_idx.saturating_sub(1).max(1).min(resp.current_idx + 1);
                true
            } else {
                false
            };
            if retry {
                self.replicate_to(node)?;
            }
        }
        Ok(())
    }

    // -- InstallSnapshot --------------------------------------------------

    pub fn recv_installsnapshot(&mut self, node: NodeId, msg: &InstallSnapshot) -> Result<InstallSnapshotResponse> {
        let now = self.now();
        if msg.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term, last_idx: self.log.current_idx(), complete: false, lease: None });
        }
        if msg.term > self.current_term {
            self.observe_term(msg.term, now)?;
        }
        self.leader_id = Some(node);
        self.granted_lease_to = Some(node);
        let lease_until = now + self.election_timeout;
        self.granted_lease_until = Some(lease_until);
        self.reset_election_deadline(now);

        if msg.last_idx <= self.commit_index {
            return Ok(InstallSnapshotResponse { term: self.current_term, last_idx: self.log.current_idx(), complete: true, lease: Some(lease_until) });
        }
        if self.log.term_at(msg.last_idx) == Some(msg.last_term) {
            self.commit_index = self.commit_index.max(msg.last_idx);
            self.apply_ready()?;
            return Ok(InstallSnapshotResponse { term: self.current_term, last_idx: self.log.current_idx(), complete: true, lease: Some(lease_until) });
        }

        let progress = self.host.recv_installsnapshot(node, msg).map_err(Error::from_host)?;
        let complete = progress == InstallSnapshotProgress::Complete;
        if complete {
            self.log.load_from_snapshot(msg.last_idx, msg.last_term);
            self.commit_index = msg.last_idx;
            self.last_applied = msg.last_idx;
        }
        Ok(InstallSnapshotResponse { term: self.current_term, last_idx: self.log.current_idx(), complete, lease: Some(lease_until) })
    }

    pub fn recv_installsnapshot_response(&mut self, node: NodeId, resp: &InstallSnapshotResponse) -> Result<()> {
        let now = self.now();
        if resp.term > self.current_term {
            self.observe_term(resp.term, now)?;
            return Ok(());
        }
        if !matches!(self.role, Role::Leader) {
            return Ok(());
        }
        self.host.recv_installsnapshot_response(node).map_err(Error::from_host)?;
        if resp.complete {
            if let Some(n) = self.nodes.get_mut(node) {
                n.match_idx = resp.last_idx;
                n.next_idx = resp.last_idx + 1;
                if let Some(lease) = resp.lease {
                    n.lease = Some(lease);
                }
            }
            self.advance_commit_index()?;
            // The snapshot only covers the compacted prefix; immediately
            // follow up with whatever the peer still needs beyond it.
            self.replicate_to(node)?;
        } else {
            self.replicate_to(node)?;
        }
        Ok(())
    }

    // -- Client entry submission ------------------------------------------

    pub fn recv_entry(&mut self, entry_type: EntryType, node_id: Option<NodeId>, id: EntryId, data: Vec<u8>) -> Result<EntryRef> {
        if !matches!(self.role, Role::Leader) {
            return Err(Error::NotLeader { leader_hint: self.leader_id });
        }
        if entry_type.is_cfg_change() {
            if self.snapshot_in_progress {
                return Err(Error::SnapshotInProgress);
            }
            let node = node_id.ok_or(Error::InvalidCfgChange("missing target node"))?;
            if node == self.nodes.self_id() {
                return Err(Error::InvalidCfgChange("cannot target the local node"));
            }
            self.membership.validate(entry_type, node, &self.nodes)?;
        }

        let term = self.current_term;
        let entry = match (entry_type, node_id) {
            (EntryType::Normal, _) => Entry::normal(term, id, data),
            (EntryType::NoopSnapshot, _) => Entry::noop_snapshot(term, id),
            (_, Some(n)) => Entry::cfg_change(term, id, entry_type, n),
            _ => return Err(Error::InvalidCfgChange("missing target node")),
        };

        let now = self.now();
        let idx = self.log.current_idx() + 1;
        let accepted = self.log.append_with_offer(vec![entry], |batch, first| {
            let n = self.host.log_offer(batch, first).map_err(Error::from_host)?;
            for (k, ent) in batch.iter().take(n).enumerate() {
                let this_idx = first + k as LogIndex;
                let node = self.host.log_get_node_id(ent, this_idx);
                self.membership.offer_log(ent, node, this_idx, &mut self.nodes, now);
            }
            Ok(n)
        })?;
        if accepted == 0 {
            return Err(Error::NoMem);
        }

        if self.nodes.voting_count() <= 1 {
            self.commit_index = self.commit_index.max(idx);
            self.apply_ready()?;
        }

        let self_id = self.nodes.self_id();
        for peer in self.nodes.ids().collect::<Vec<_>>() {
            if peer != self_id {
                self.replicate_to(peer)?;
            }
        }

        Ok(EntryRef { index: idx, term, id })
    }

    // -- Snapshot lifecycle ------------------------------------------------

    pub fn begin_snapshot(&mut self, idx: LogIndex) -> Result<()> {
        if self.snapshot_in_progress {
            return Err(Error::SnapshotInProgress);
        }
        if idx == 0 || idx > self.commit_index {
            return Err(Error::InvalidCfgChange("snapshot index beyond commit_index"));
        }
        while self.last_applied < idx {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.get_at(next) else { break };
            let outcome = self.host.applylog(entry, next).map_err(Error::from_host)?;
            if outcome == ApplyOutcome::Shutdown {
                return Err(Error::Shutdown);
            }
            self.last_applied = next;
        }
        let term = self
            .log
            .term_at(idx)
            .ok_or(Error::InvalidCfgChange("snapshot index not present in the log"))?;
        self.snapshot_in_progress = true;
        self.pending_snapshot = Some(SnapshotMeta { last_idx: idx, last_term: term });
        Ok(())
    }

    pub fn end_snapshot(&mut self) -> Result<()> {
        let meta = self.pending_snapshot.take().ok_or(Error::InvalidCfgChange("no snapshot in progress"))?;
        self.log.poll_to_with_poll(meta.last_idx, |batch, first| {
            self.host.log_poll(batch, first).map_err(Error::from_host)
        })?;
        self.snapshot_in_progress = false;
        info!(index = meta.last_idx, "snapshot complete, log compacted");
        Ok(())
    }

    pub fn begin_load_snapshot(&mut self, term: Term, idx: LogIndex) -> Result<()> {
        if self.snapshot_in_progress {
            return Err(Error::SnapshotInProgress);
        }
        let already_loaded = if idx == 0 {
            self.log.base() == 0 && self.log.count() == 0
        } else {
            self.log.base() == idx - 1 && self.log.count() == 1
        };
        if idx > 0 && already_loaded {
            return Err(Error::SnapshotAlreadyLoaded);
        }
        self.log.load_from_snapshot(idx, term);
        self.commit_index = idx;
        self.last_applied = idx;
        let self_id = self.nodes.self_id();
        self.nodes = NodeTable::new(self_id);
        self.snapshot_in_progress = true;
        Ok(())
    }

    pub fn end_load_snapshot(&mut self) -> Result<()> {
        if !self.snapshot_in_progress {
            return Err(Error::InvalidCfgChange("no snapshot load in progress"));
        }
        for n in self.nodes.peers_mut() {
            n.has_sufficient_logs = true;
        }
        self.snapshot_in_progress = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ApplyOutcome as Outcome, Host, InstallSnapshotProgress, LogLevel, MembershipEventKind};
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    #[derive(Debug, thiserror::Error)]
    #[error("mock host error")]
    struct MockError;

    struct TestHost {
        now: Instant,
        rand_seq: VecDeque<f64>,
        sent_votes: Vec<(NodeId, RequestVote)>,
        sent_appends: Vec<(NodeId, AppendEntries)>,
        applied: Vec<LogIndex>,
    }

    impl TestHost {
        fn new(start: Instant) -> Self {
            TestHost {
                now: start,
                rand_seq: VecDeque::new(),
                sent_votes: Vec::new(),
                sent_appends: Vec::new(),
                applied: Vec::new(),
            }
        }

        fn advance(&mut self, d: Duration) {
            self.now += d;
        }
    }

    impl Host for TestHost {
        type Error = MockError;

        fn send_requestvote(&mut self, node: NodeId, msg: &RequestVote) -> Result<(), Self::Error> {
            self.sent_votes.push((node, msg.clone()));
            Ok(())
        }
        fn send_appendentries(&mut self, node: NodeId, msg: &AppendEntries) -> Result<(), Self::Error> {
            self.sent_appends.push((node, msg.clone()));
            Ok(())
        }
        fn send_installsnapshot(&mut self, _node: NodeId, _msg: &InstallSnapshot) -> Result<(), Self::Error> {
            Ok(())
        }
        fn recv_installsnapshot(&mut self, _node: NodeId, _is: &InstallSnapshot) -> Result<InstallSnapshotProgress, Self::Error> {
            Ok(InstallSnapshotProgress::Complete)
        }
        fn recv_installsnapshot_response(&mut self, _node: NodeId) -> Result<(), Self::Error> {
            Ok(())
        }
        fn applylog(&mut self, _entry: &Entry, idx: LogIndex) -> Result<Outcome, Self::Error> {
            self.applied.push(idx);
            Ok(Outcome::Applied)
        }
        fn persist_vote(&mut self, _node_id: NodeId) -> Result<(), Self::Error> {
            Ok(())
        }
        fn persist_term(&mut self, _term: u64) -> Result<(), Self::Error> {
            Ok(())
        }
        fn log_offer(&mut self, entries: &[Entry], _idx: LogIndex) -> Result<usize, Self::Error> {
            Ok(entries.len())
        }
        fn log_poll(&mut self, _entries: &[Entry], _idx: LogIndex) -> Result<(), Self::Error> {
            Ok(())
        }
        fn log_pop(&mut self, _entries: &[Entry], _idx: LogIndex) -> Result<(), Self::Error> {
            Ok(())
        }
        fn log_get_node_id(&mut self, entry: &Entry, _idx: LogIndex) -> Option<NodeId> {
            entry.node_id
        }
        fn node_has_sufficient_logs(&mut self, _node: NodeId) -> Result<(), Self::Error> {
            Ok(())
        }
        fn notify_membership_event(&mut self, _node: NodeId, _entry: Option<&Entry>, _kind: MembershipEventKind) {}
        fn get_time(&mut self) -> Instant {
            self.now
        }
        fn get_rand(&mut self) -> f64 {
            self.rand_seq.pop_front().unwrap_or(0.0)
        }
        fn log_message(&mut self, _node: Option<NodeId>, _level: LogLevel, _message: &str) {}
    }

    fn single_node_leader() -> Raft<TestHost> {
        let start = Instant::now();
        let host = TestHost::new(start);
        let mut raft = Raft::new(1, host);
        raft.add_node(1, true);
        raft.periodic(start).unwrap();
        // A lone voter reaches a majority of itself without any peer
        // response, so starting the pre-vote round alone cascades all the
        // way to leader.
        raft.start_election(start).unwrap();
        assert_eq!(raft.role(), Role::Leader);
        raft
    }

    #[test]
    fn single_voter_becomes_leader_and_commits_immediately() {
        let mut raft = single_node_leader();
        assert_eq!(raft.role(), Role::Leader);
        let r = raft.recv_entry(EntryType::Normal, None, 42, vec![1, 2, 3]).unwrap();
        assert_eq!(r.index, 1);
        assert_eq!(raft.commit_index(), 1);
        assert_eq!(raft.msg_entry_response_committed(r), EntryStatus::Committed);
    }

    #[test]
    fn read_barrier_ok_for_lone_voter_leader() {
        let mut raft = single_node_leader();
        assert!(raft.read_barrier().is_ok());
    }

    #[test]
    fn read_barrier_rejects_non_leader() {
        let start = Instant::now();
        let host = TestHost::new(start);
        let mut raft: Raft<TestHost> = Raft::new(1, host);
        raft.add_node(1, true);
        let err = raft.read_barrier().unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));
    }

    #[test]
    fn not_leader_rejects_entry_submission() {
        let start = Instant::now();
        let host = TestHost::new(start);
        let mut raft: Raft<TestHost> = Raft::new(1, host);
        raft.add_node(1, true);
        raft.add_node(2, false);
        let err = raft.recv_entry(EntryType::Normal, None, 1, vec![]).unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));
    }

    #[test]
    fn three_node_election_reaches_leader() {
        let start = Instant::now();
        let host = TestHost::new(start);
        let mut raft = Raft::new(1, host);
        raft.add_node(1, true);
        raft.add_node(2, false);
        raft.add_node(3, false);
        raft.set_election_timeout(Duration::from_millis(1000));

        raft.periodic(start + Duration::from_millis(500)).unwrap();
        assert_eq!(raft.role(), Role::Follower);

        raft.periodic(start + Duration::from_millis(2100)).unwrap();
        assert_eq!(raft.role(), Role::Candidate { prevote: true });

        let prevote_grant = RequestVoteResponse { term: 0, vote_granted: VoteGranted::Granted, prevote: true };
        raft.recv_requestvote_response(2, &prevote_grant).unwrap();
        raft.recv_requestvote_response(3, &prevote_grant).unwrap();
        assert_eq!(raft.role(), Role::Candidate { prevote: false });
        assert_eq!(raft.current_term(), 1);

        let vote_grant = RequestVoteResponse { term: 1, vote_granted: VoteGranted::Granted, prevote: false };
        raft.recv_requestvote_response(2, &vote_grant).unwrap();
        raft.recv_requestvote_response(3, &vote_grant).unwrap();
        assert_eq!(raft.role(), Role::Leader);
        assert_eq!(raft.current_term(), 1);
    }

    #[test]
    fn append_entries_truncates_conflicting_tail() {
        let start = Instant::now();
        let host = TestHost::new(start);
        let mut raft = Raft::new(2, host);
        raft.add_node(1, false);
        raft.add_node(2, true);

        let msg1 = AppendEntries {
            term: 1,
            leader_commit: 0,
            prev_log_idx: 0,
            prev_log_term: 0,
            entries: vec![Entry::normal(1, 1, vec![1])],
            n_entries: 1,
        };
        raft.recv_appendentries(1, &msg1).unwrap();
        assert_eq!(raft.current_idx(), 1);

        let msg2 = AppendEntries {
            term: 2,
            leader_commit: 0,
            prev_log_idx: 0,
            prev_log_term: 0,
            entries: vec![Entry::normal(2, 2, vec![9])],
            n_entries: 1,
        };
        let resp = raft.recv_appendentries(1, &msg2).unwrap();
        assert!(resp.success);
        assert_eq!(raft.current_term(), 2);
        assert_eq!(raft.current_idx(), 1);
    }

    #[test]
    fn stale_term_append_entries_is_rejected() {
        let start = Instant::now();
        let host = TestHost::new(start);
        let mut raft = Raft::new(2, host);
        raft.add_node(1, false);
        raft.add_node(2, true);
        raft.observe_term(5, start).unwrap();

        let msg = AppendEntries { term: 1, leader_commit: 0, prev_log_idx: 0, prev_log_term: 0, entries: vec![], n_entries: 0 };
        let resp = raft.recv_appendentries(1, &msg).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
    }
}
