use thiserror::Error;

/// Errors surfaced by the replica's own plumbing.
///
/// Nothing in the Raft protocol itself raises these: `Start`,
/// `GetState`, vote/append handling all stay infallible and encode
/// failure in their return values, per the protocol's own error
/// taxonomy. `RaftError` only covers the ambient concerns around that
/// core: failing to make sense of whatever the persister handed back
/// at construction time.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The persister returned a non-empty blob that does not decode as
    /// a `PersistedState`. We treat this as a fatal misconfiguration
    /// rather than silently continuing with zero-valued state: a
    /// corrupt or foreign blob masquerading as valid state is exactly
    /// the kind of divergence Raft's safety properties assume cannot
    /// happen.
    #[error("persisted raft state is corrupt: {0}")]
    PersistedStateCorrupt(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
