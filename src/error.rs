use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the engine.
///
/// Operations that violate a protocol precondition return one of the
/// categorized variants below and leave engine state unchanged. `Shutdown`
/// is reserved for detected state-machine impossibilities (e.g. truncating
/// at or below `commit_index`) — the engine never silently corrupts
/// committed history.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<crate::node::NodeId> },

    #[error("a voting configuration change is already pending at index {pending_index}")]
    OneVotingChangeOnly { pending_index: u64 },

    #[error("a snapshot is currently in progress")]
    SnapshotInProgress,

    #[error("a snapshot has already been loaded")]
    SnapshotAlreadyLoaded,

    #[error("invalid configuration change: {0}")]
    InvalidCfgChange(&'static str),

    #[error("out of memory growing the log")]
    NoMem,

    #[error("operation might violate an outstanding leader lease")]
    MightViolateLease,

    #[error("host requested shutdown")]
    Shutdown,

    #[error("host callback failed: {0}")]
    Host(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary host error into [`Error::Host`].
    pub fn from_host<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Host(Box::new(err))
    }
}
