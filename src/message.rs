//! Wire-level value records exchanged between servers (§4.4). The engine
//! never encodes or transmits these itself — a host moves them over
//! whatever transport it likes, using `Serialize`/`Deserialize` if that's
//! convenient, but the derive is offered as a courtesy, not a mandate (§6.3).

use serde::{Deserialize, Serialize};

use crate::entry::{Entry, LogIndex, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteGranted {
    Granted,
    Denied,
    UnknownNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: u64,
    pub last_log_idx: LogIndex,
    pub last_log_term: Term,
    pub prevote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: VoteGranted,
    pub prevote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_commit: LogIndex,
    pub prev_log_idx: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub n_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// The responder's `current_idx`, used by the leader to backtrack
    /// `next_idx` on failure or advance `match_idx` on success.
    pub current_idx: LogIndex,
    pub first_idx: LogIndex,
    /// An absolute time up to which the responder promises not to grant a
    /// vote to anyone else, computed at the moment it accepted this message.
    #[serde(skip)]
    pub lease: Option<std::time::Instant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub last_idx: LogIndex,
    pub last_term: Term,
    /// Host-defined snapshot payload; the engine never inspects this.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub last_idx: LogIndex,
    pub complete: bool,
    #[serde(skip)]
    pub lease: Option<std::time::Instant>,
}
