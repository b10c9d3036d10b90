//! The `Host` trait (§6.1): every side effect the engine needs — sending
//! messages, persisting state, reading the clock/RNG, logging — flows
//! through this single capability object. The engine never touches the
//! network, disk, clock, or RNG directly.

use std::time::Instant;

use crate::entry::{Entry, LogIndex};
use crate::message::{AppendEntries, InstallSnapshot, RequestVote};
use crate::node::NodeId;

/// Result of a `recv_installsnapshot` upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallSnapshotProgress {
    InProgress,
    Complete,
}

/// Result of an `applylog` upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Shutdown,
}

/// What kind of membership event `notify_membership_event` is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventKind {
    Added,
    Removed,
    Promoted,
    Demoted,
}

/// Severity for `log_message`, mirroring `tracing`'s levels so a host can
/// forward straight into its own subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Every capability the engine needs from its embedder.
///
/// Object-safe by construction (no generic methods, no `Self` return types)
/// so a host can be boxed as `Box<dyn Host<Error = E>>` if it wants to erase
/// the concrete type; the engine itself is generic over `H: Host` rather
/// than requiring that erasure (§5: no internal dynamic dispatch cost paid
/// unless the embedder chooses it).
///
/// All methods take `&mut self` and must be synchronous and non-reentrant:
/// a host implementation must never call back into the `Raft<H>` that is
/// currently invoking it.
pub trait Host {
    /// The host's own error type, surfaced to engine callers wrapped in
    /// [`crate::error::Error::Host`].
    type Error: std::error::Error + Send + Sync + 'static;

    fn send_requestvote(&mut self, node: NodeId, msg: &RequestVote) -> Result<(), Self::Error>;
    fn send_appendentries(&mut self, node: NodeId, msg: &AppendEntries) -> Result<(), Self::Error>;
    fn send_installsnapshot(&mut self, node: NodeId, msg: &InstallSnapshot) -> Result<(), Self::Error>;

    fn recv_installsnapshot(
        &mut self,
        node: NodeId,
        is: &InstallSnapshot,
    ) -> Result<InstallSnapshotProgress, Self::Error>;

    fn recv_installsnapshot_response(&mut self, node: NodeId) -> Result<(), Self::Error>;

    fn applylog(&mut self, entry: &Entry, idx: LogIndex) -> Result<ApplyOutcome, Self::Error>;

    /// Must be durable before the engine sends a granting `RequestVoteResponse`.
    fn persist_vote(&mut self, node_id: NodeId) -> Result<(), Self::Error>;

    /// Must be durable before the engine acts on the new term.
    fn persist_term(&mut self, term: u64) -> Result<(), Self::Error>;

    /// May partial-accept by returning fewer than `entries.len()`.
    fn log_offer(&mut self, entries: &[Entry], idx: LogIndex) -> Result<usize, Self::Error>;

    fn log_poll(&mut self, entries: &[Entry], idx: LogIndex) -> Result<(), Self::Error>;

    fn log_pop(&mut self, entries: &[Entry], idx: LogIndex) -> Result<(), Self::Error>;

    /// Used to interpret the `node_id` a cfg-change entry targets, for hosts
    /// that store entries in a form that doesn't round-trip it directly.
    fn log_get_node_id(&mut self, entry: &Entry, idx: LogIndex) -> Option<NodeId>;

    /// Fired exactly once per non-voting peer, the first time its log has
    /// caught up closely enough that promoting it would be safe.
    fn node_has_sufficient_logs(&mut self, node: NodeId) -> Result<(), Self::Error>;

    fn notify_membership_event(&mut self, node: NodeId, entry: Option<&Entry>, kind: MembershipEventKind);

    /// Must be non-decreasing across calls within one engine's lifetime.
    fn get_time(&mut self) -> Instant;

    /// Uniform in `[0, 1)`.
    fn get_rand(&mut self) -> f64;

    fn log_message(&mut self, node: Option<NodeId>, level: LogLevel, message: &str);
}
