//! Log entry value records (§3).

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// 1-based position of an [`Entry`] in the replicated log.
pub type LogIndex = u64;

/// Monotone election term.
pub type Term = u64;

/// Host-chosen opaque token used to match a submitted entry to its eventual
/// commit/apply notification. The engine never interprets this value.
pub type EntryId = u64;

/// What kind of change a log entry represents.
///
/// `NORMAL` carries application data. The remaining variants drive the
/// single-step membership-change state machine in [`crate::membership`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    AddNonVoting,
    AddVoting,
    Promote,
    Demote,
    RemoveVoting,
    RemoveNonVoting,
    /// A no-op entry appended by a new leader once a snapshot load completes,
    /// so there is something to commit to anchor reads against.
    NoopSnapshot,
}

impl EntryType {
    /// Whether this entry type is one of the "voting configuration change"
    /// kinds for which §4.2 allows only one pending (uncommitted) at a time.
    pub fn is_voting_cfg_change(self) -> bool {
        matches!(
            self,
            EntryType::AddVoting
                | EntryType::Promote
                | EntryType::Demote
                | EntryType::RemoveVoting
        )
    }

    /// Whether this entry type mutates membership at all (voting or not).
    pub fn is_cfg_change(self) -> bool {
        self.is_voting_cfg_change()
            || matches!(self, EntryType::AddNonVoting | EntryType::RemoveNonVoting)
    }

    /// The node id a membership-change entry targets, if any.
    pub fn target_node(self, node: Option<NodeId>) -> Option<NodeId> {
        if self.is_cfg_change() {
            node
        } else {
            None
        }
    }
}

/// A single entry in the replicated log.
///
/// Immutable once appended: the log never reorders entries or mutates them
/// in place, matching §3's ownership rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub id: EntryId,
    pub entry_type: EntryType,
    /// For membership-change entries, the node the change applies to.
    /// `None` for `Normal` and `NoopSnapshot` entries.
    pub node_id: Option<NodeId>,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn normal(term: Term, id: EntryId, data: Vec<u8>) -> Self {
        Entry { term, id, entry_type: EntryType::Normal, node_id: None, data }
    }

    pub fn cfg_change(term: Term, id: EntryId, entry_type: EntryType, node_id: NodeId) -> Self {
        debug_assert!(entry_type.is_cfg_change());
        Entry { term, id, entry_type, node_id: Some(node_id), data: Vec::new() }
    }

    pub fn noop_snapshot(term: Term, id: EntryId) -> Self {
        Entry { term, id, entry_type: EntryType::NoopSnapshot, node_id: None, data: Vec::new() }
    }
}

/// The `(term, index)` pair identifying a specific proposal made via
/// [`crate::server::Raft::recv_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub index: LogIndex,
    pub term: Term,
    pub id: EntryId,
}

/// Result of [`crate::server::Raft::msg_entry_response_committed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Safely replicated and applied/committed.
    Committed,
    /// Still pending replication.
    Pending,
    /// A different entry now occupies this index/term — this proposal will
    /// never commit.
    Invalidated,
}
