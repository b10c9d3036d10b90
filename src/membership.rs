//! Single-step membership changes (§4.2): validity matrix, the "one pending
//! voting change at a time" rule, and the `offer_log`/`pop_log` hooks that
//! keep the node table in sync as cfg-change entries are appended to or
//! removed from the log.

use std::time::Instant;

use crate::entry::{Entry, EntryType, LogIndex};
use crate::error::{Error, Result};
use crate::node::{NodeId, NodeTable};

/// Tracks the single in-flight voting configuration change, if any.
///
/// §4.2: at most one `AddVoting`/`Promote`/`Demote`/`RemoveVoting` entry may
/// be uncommitted at a time. `AddNonVoting`/`RemoveNonVoting` are exempt —
/// they don't touch the voting majority and may be freely pipelined.
#[derive(Debug, Default)]
pub struct Membership {
    pending_voting_change: Option<LogIndex>,
}

impl Membership {
    pub fn new() -> Self {
        Membership { pending_voting_change: None }
    }

    pub fn pending_voting_change(&self) -> Option<LogIndex> {
        self.pending_voting_change
    }

    /// Validates a proposed membership-change entry against the current
    /// node table and pending-change state, without applying it. Called
    /// before the entry is handed to the log.
    pub fn validate(&self, entry_type: EntryType, node: NodeId, nodes: &NodeTable) -> Result<()> {
        if entry_type.is_voting_cfg_change() {
            if let Some(pending) = self.pending_voting_change {
                return Err(Error::OneVotingChangeOnly { pending_index: pending });
            }
        }

        let exists = nodes.contains(node);
        let is_voting = nodes.get(node).map(|n| n.is_voting).unwrap_or(false);
        let has_sufficient_logs = nodes.get(node).map(|n| n.has_sufficient_logs).unwrap_or(false);

        let ok = match entry_type {
            EntryType::AddNonVoting => !exists,
            EntryType::AddVoting => !exists || (!is_voting && has_sufficient_logs),
            EntryType::Promote => exists && !is_voting && has_sufficient_logs,
            EntryType::Demote => exists && is_voting,
            EntryType::RemoveVoting => exists && is_voting,
            EntryType::RemoveNonVoting => exists && !is_voting,
            EntryType::Normal | EntryType::NoopSnapshot => true,
        };

        if ok {
            Ok(())
        } else {
            Err(Error::InvalidCfgChange(reason(entry_type, exists, is_voting, has_sufficient_logs)))
        }
    }

    /// Called once a cfg-change entry is appended (offered successfully) to
    /// the log, at `idx`. Applies the membership effect speculatively —
    /// before commit — matching Raft's "apply cfg changes as soon as
    /// appended, not only once committed" rule, and records a pending-voting
    /// marker so `validate` rejects a second voting change.
    ///
    /// `node` is resolved by the caller via the host's `log_get_node_id`
    /// upcall, since a host may store entries in a form that doesn't
    /// round-trip `Entry::node_id` directly.
    pub fn offer_log(&mut self, entry: &Entry, node: Option<NodeId>, idx: LogIndex, nodes: &mut NodeTable, now: Instant) {
        let Some(node) = node else { return };
        match entry.entry_type {
            EntryType::AddNonVoting => nodes.add_non_voting_node(node, now),
            EntryType::AddVoting => {
                nodes.add_voting_node(node, now);
                self.pending_voting_change = Some(idx);
            }
            EntryType::Promote => {
                nodes.promote(node);
                self.pending_voting_change = Some(idx);
            }
            EntryType::Demote => {
                nodes.demote(node);
                self.pending_voting_change = Some(idx);
            }
            EntryType::RemoveVoting => {
                self.pending_voting_change = Some(idx);
            }
            EntryType::RemoveNonVoting => {
                nodes.remove_node(node);
            }
            EntryType::Normal | EntryType::NoopSnapshot => {}
        }
    }

    /// Called once a cfg-change entry at `idx` commits: finalizes effects
    /// that were deferred until commit (`RemoveVoting` only removes the node
    /// from the table once the removal itself is safely committed, so a
    /// removed leader can still see its own removal replicated first).
    pub fn commit_log(&mut self, entry: &Entry, node: Option<NodeId>, idx: LogIndex, nodes: &mut NodeTable) {
        if entry.entry_type == EntryType::RemoveVoting {
            if let Some(node) = node {
                nodes.remove_node(node);
            }
        }
        if self.pending_voting_change == Some(idx) {
            self.pending_voting_change = None;
        }
    }

    /// Called when a cfg-change entry at `idx` is popped off the tail of the
    /// log (leader-change truncation, §4.1/§4.3): reverts the speculative
    /// effect `offer_log` applied and clears the pending-change marker if it
    /// pointed at this index.
    pub fn pop_log(&mut self, entry: &Entry, node: Option<NodeId>, idx: LogIndex, nodes: &mut NodeTable, now: Instant) {
        let Some(node) = node else { return };
        match entry.entry_type {
            EntryType::AddNonVoting => {
                nodes.remove_node(node);
            }
            EntryType::AddVoting => {
                nodes.remove_node(node);
            }
            EntryType::Promote => {
                nodes.demote(node);
            }
            EntryType::Demote => {
                nodes.promote(node);
            }
            EntryType::RemoveVoting => {
                // Reverting a removal that was never actually applied
                // (removal only takes effect at commit_log) is a no-op
                // beyond clearing the pending marker below.
                let _ = now;
            }
            EntryType::RemoveNonVoting => {
                nodes.add_non_voting_node(node, now);
            }
            EntryType::Normal | EntryType::NoopSnapshot => {}
        }
        if self.pending_voting_change == Some(idx) {
            self.pending_voting_change = None;
        }
    }
}

fn reason(entry_type: EntryType, exists: bool, is_voting: bool, has_sufficient_logs: bool) -> &'static str {
    match entry_type {
        EntryType::AddNonVoting if exists => "node already known",
        EntryType::AddVoting if exists && is_voting => "node is already voting",
        EntryType::AddVoting => "node has not caught up enough to add as voting",
        EntryType::Promote if !exists => "node unknown",
        EntryType::Promote if is_voting => "node is already voting",
        EntryType::Promote => "node has not caught up enough to promote",
        EntryType::Demote => "node unknown or already non-voting",
        EntryType::RemoveVoting => "node unknown or not voting",
        EntryType::RemoveNonVoting => "node unknown or is voting",
        _ => "invalid configuration change",
    }
}
