//! A deterministic, I/O-free Raft consensus engine.
//!
//! `Raft<H>` implements leader election with Pre-Vote, log replication,
//! single-step membership change with a non-voting catch-up phase, log
//! compaction via snapshots, and leader leases for linearizable reads and
//! safe leadership handoff. It performs no networking, disk I/O, timing, or
//! randomness itself — every such effect is delegated to a host through the
//! [`Host`] trait. The engine is single-threaded, non-blocking, and never
//! spawns a task or holds a lock; callers serialize their own calls into it.
//!
//! ```no_run
//! use raft::{Raft, host::Host};
//! # fn wire_up<H: Host>(host: H) {
//! let mut raft = Raft::new(1, host);
//! raft.add_node(1, true);
//! raft.add_node(2, false);
//! raft.add_node(3, false);
//! # }
//! ```

pub mod entry;
pub mod error;
pub mod host;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod server;

pub use entry::{Entry, EntryId, EntryRef, EntryStatus, EntryType, LogIndex, Term};
pub use error::{Error, Result};
pub use host::Host;
pub use node::NodeId;
pub use server::{Raft, Role};
