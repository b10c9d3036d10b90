//! A deterministic [`Host`] for integration tests.
//!
//! Messages a node "sends" land in a shared in-memory [`Network`] keyed by
//! destination, rather than actually being transmitted — the test driver
//! drains it and calls the matching `recv_*` method on the destination's
//! engine. The clock is a shared, explicitly-advanced `Instant` so every
//! node in a scenario agrees on "now", and `get_rand` draws from a scripted
//! queue so elections are reproducible across runs.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use raft::entry::{Entry, LogIndex};
use raft::host::{ApplyOutcome, Host, InstallSnapshotProgress, LogLevel, MembershipEventKind};
use raft::message::{AppendEntries, InstallSnapshot, RequestVote};
use raft::NodeId;

#[derive(Debug, thiserror::Error)]
#[error("mock host error: {0}")]
pub struct MockError(pub String);

#[derive(Debug, Clone)]
pub enum Outbox {
    RequestVote(RequestVote),
    AppendEntries(AppendEntries),
    InstallSnapshot(InstallSnapshot),
}

pub type Network = Rc<RefCell<HashMap<NodeId, VecDeque<(NodeId, Outbox)>>>>;

/// What a [`MockHost`] observed, readable independently of the `Raft` that
/// owns the host (which does not expose its host back to the caller).
#[derive(Default)]
pub struct Recorder {
    pub applied: Vec<LogIndex>,
    pub persisted_term: Option<u64>,
    pub persisted_vote: Option<NodeId>,
    pub sufficient_logs: Vec<NodeId>,
}

pub struct MockHost {
    id: NodeId,
    clock: Rc<Cell<Instant>>,
    network: Network,
    rand_seq: VecDeque<f64>,
    recorder: Rc<RefCell<Recorder>>,
}

impl MockHost {
    pub fn new(id: NodeId, clock: Rc<Cell<Instant>>, network: Network) -> (Self, Rc<RefCell<Recorder>>) {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        network.borrow_mut().entry(id).or_default();
        (MockHost { id, clock, network, rand_seq: VecDeque::new(), recorder: recorder.clone() }, recorder)
    }

    /// Queues a deterministic draw for `get_rand` (consumed once, in FIFO
    /// order; defaults to 0.0 once the queue is empty).
    pub fn push_rand(&mut self, v: f64) {
        self.rand_seq.push_back(v);
    }

    fn send(&mut self, to: NodeId, msg: Outbox) {
        self.network.borrow_mut().entry(to).or_default().push_back((self.id, msg));
    }
}

pub fn advance_clock(clock: &Rc<Cell<Instant>>, d: Duration) {
    clock.set(clock.get() + d);
}

impl Host for MockHost {
    type Error = MockError;

    fn send_requestvote(&mut self, node: NodeId, msg: &RequestVote) -> Result<(), Self::Error> {
        self.send(node, Outbox::RequestVote(msg.clone()));
        Ok(())
    }

    fn send_appendentries(&mut self, node: NodeId, msg: &AppendEntries) -> Result<(), Self::Error> {
        self.send(node, Outbox::AppendEntries(msg.clone()));
        Ok(())
    }

    fn send_installsnapshot(&mut self, node: NodeId, msg: &InstallSnapshot) -> Result<(), Self::Error> {
        self.send(node, Outbox::InstallSnapshot(msg.clone()));
        Ok(())
    }

    fn recv_installsnapshot(&mut self, _node: NodeId, _is: &InstallSnapshot) -> Result<InstallSnapshotProgress, Self::Error> {
        Ok(InstallSnapshotProgress::Complete)
    }

    fn recv_installsnapshot_response(&mut self, _node: NodeId) -> Result<(), Self::Error> {
        Ok(())
    }

    fn applylog(&mut self, _entry: &Entry, idx: LogIndex) -> Result<ApplyOutcome, Self::Error> {
        self.recorder.borrow_mut().applied.push(idx);
        Ok(ApplyOutcome::Applied)
    }

    fn persist_vote(&mut self, node_id: NodeId) -> Result<(), Self::Error> {
        self.recorder.borrow_mut().persisted_vote = Some(node_id);
        Ok(())
    }

    fn persist_term(&mut self, term: u64) -> Result<(), Self::Error> {
        self.recorder.borrow_mut().persisted_term = Some(term);
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

    fn node_has_sufficient_logs(&mut self, node: NodeId) -> Result<(), Self::Error> {
        self.recorder.borrow_mut().sufficient_logs.push(node);
        Ok(())
    }

    fn notify_membership_event(&mut self, _node: NodeId, _entry: Option<&Entry>, _kind: MembershipEventKind) {}

    fn get_time(&mut self) -> Instant {
        self.clock.get()
    }

    fn get_rand(&mut self) -> f64 {
        self.rand_seq.pop_front().unwrap_or(0.0)
    }

    fn log_message(&mut self, _node: Option<NodeId>, _level: LogLevel, _message: &str) {}
}
