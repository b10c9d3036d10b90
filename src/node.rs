//! Per-peer bookkeeping (§4.2): the node table a leader consults to decide
//! what to replicate and whether it still holds a quorum lease.

use std::collections::HashMap;
use std::time::Instant;

use crate::entry::LogIndex;

/// Opaque, host-assigned identity of a cluster member. The engine only
/// compares these for equality and never interprets the bits.
pub type NodeId = u64;

/// Leader-side view of a single peer.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Whether this peer counts toward quorum/commit-index majorities.
    /// `false` for nodes in the non-voting catch-up phase.
    pub is_voting: bool,
    /// Set while this node is a Candidate and this peer has granted a vote
    /// for the current term. Meaningless (and unread) outside Candidate.
    pub voted_for_me: bool,
    /// Index of the next entry to send this peer.
    pub next_idx: LogIndex,
    /// Highest index this peer is known to have durably stored.
    pub match_idx: LogIndex,
    /// Last time this peer's `match_idx` advanced far enough to count toward
    /// the leader's lease (§4.3's lease tracking); `None` until the first
    /// successful probe.
    pub lease: Option<Instant>,
    /// When this node was added, for the non-voting catch-up grace window.
    pub effective_time: Instant,
    /// Set once a non-voting node's log has caught up closely enough that a
    /// promotion to voting would not stall the cluster (§4.2's "sufficient
    /// logs" gate on `AddVoting`/`Promote`).
    pub has_sufficient_logs: bool,
    /// Host-opaque per-node data (e.g. a transport address), round-tripped
    /// but never interpreted by the engine.
    pub udata: Vec<u8>,
}

impl Node {
    fn new(id: NodeId, is_voting: bool, now: Instant) -> Self {
        Node {
            id,
            is_voting,
            voted_for_me: false,
            next_idx: 1,
            match_idx: 0,
            lease: None,
            effective_time: now,
            has_sufficient_logs: is_voting,
            udata: Vec::new(),
        }
    }
}

/// The set of known peers, keyed by [`NodeId`].
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Node>,
    self_id: NodeId,
}

impl NodeTable {
    pub fn new(self_id: NodeId) -> Self {
        NodeTable { nodes: HashMap::new(), self_id }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All peers other than `self_id`.
    pub fn peers(&self) -> impl Iterator<Item = &Node> {
        let self_id = self.self_id;
        self.nodes.values().filter(move |n| n.id != self_id)
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        let self_id = self.self_id;
        self.nodes.values_mut().filter(move |n| n.id != self_id)
    }

    pub fn voting_peers(&self) -> impl Iterator<Item = &Node> {
        self.peers().filter(|n| n.is_voting)
    }

    pub fn voting_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_voting).count()
    }

    /// `floor(voting_count / 2) + 1`, including self if self is voting.
    pub fn majority_size(&self) -> usize {
        self.voting_count() / 2 + 1
    }

    pub fn add_voting_node(&mut self, id: NodeId, now: Instant) {
        self.nodes.entry(id).or_insert_with(|| Node::new(id, true, now)).is_voting = true;
    }

    pub fn add_non_voting_node(&mut self, id: NodeId, now: Instant) {
        self.nodes.entry(id).or_insert_with(|| Node::new(id, false, now));
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    pub fn promote(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.is_voting = true;
        }
    }

    pub fn demote(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.is_voting = false;
        }
    }

    pub fn clear_votes(&mut self) {
        for n in self.nodes.values_mut() {
            n.voted_for_me = false;
        }
    }

    pub fn votes_received(&self) -> usize {
        // Self always counts as a vote for itself once Candidate; only
        // voting peers count toward the peer total.
        1 + self.voting_peers().filter(|n| n.voted_for_me).count()
    }

    pub fn has_vote_majority(&self) -> bool {
        self.votes_received() >= self.majority_size()
    }

    /// `match_idx` values across all voting peers plus self's own
    /// `current_idx`, sorted descending — used by `find_next_commit_index`
    /// (§4.3) to locate the highest index a majority has stored.
    pub fn match_indices_including_self(&self, self_match: LogIndex) -> Vec<LogIndex> {
        let mut v: Vec<LogIndex> = self.voting_peers().map(|n| n.match_idx).collect();
        v.push(self_match);
        v.sort_unstable_by(|a, b| b.cmp(a));
        v
    }

    pub fn reset_replication_state(&mut self, next_idx: LogIndex, now: Instant) {
        for n in self.nodes.values_mut() {
            n.next_idx = next_idx;
            n.match_idx = 0;
            n.lease = None;
            // This peer becomes effective for the new leader as of now, not
            // whenever it first joined the cluster.
            n.effective_time = now;
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }
}
