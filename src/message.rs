use crate::replica::ReplicaId;
use serde::{Deserialize, Serialize};

/// A user-defined transition carried by the replicated log.
///
/// Blanket-implemented for any type that is cheap to clone and safe to
/// move across the replicator/applier/ticker threads, matching
/// `little_raft`'s own preference for a thin marker trait over a
/// hand-written bound list at every generic site. Persistence requires
/// `Serialize`/`DeserializeOwned` because `Command` values live inside
/// `LogEntry`, which is itself part of the on-disk blob.
pub trait Command:
    Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static
{
}

impl<T> Command for T where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static
{
}

/// The command carried by a log entry, plus the internal-only sentinel
/// that anchors index 0.
///
/// Keeping the sentinel as a variant rather than requiring `T: Default`
/// means an embedder's command type never needs a meaningless no-op
/// value just to satisfy the log's indexing convention.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum EntryCommand<T> {
    Sentinel,
    User(T),
}

/// One entry in the replicated log.
///
/// `index` is 1-based and dense; index 0 is always the sentinel entry
/// `{term: 0, command: Sentinel}` that every replica starts with, which
/// keeps `prev_log_index`/`prev_log_term` lookups total even when the
/// log is otherwise empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry<T> {
    pub term: u64,
    pub index: u64,
    pub(crate) command: EntryCommand<T>,
}

impl<T> LogEntry<T> {
    pub(crate) fn sentinel() -> Self {
        LogEntry {
            term: 0,
            index: 0,
            command: EntryCommand::Sentinel,
        }
    }

    pub(crate) fn new(term: u64, index: u64, command: T) -> Self {
        LogEntry {
            term,
            index,
            command: EntryCommand::User(command),
        }
    }

    /// `None` only for the index-0 sentinel.
    pub fn command(&self) -> Option<&T> {
        match &self.command {
            EntryCommand::Sentinel => None,
            EntryCommand::User(t) => Some(t),
        }
    }
}

/// Arguments for a `RequestVote` RPC.
#[derive(Clone, Debug)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: ReplicaId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Reply to a `RequestVote` RPC.
#[derive(Clone, Debug)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Arguments for an `AppendEntries` RPC. An empty `entries` is a pure
/// heartbeat.
#[derive(Clone, Debug)]
pub struct AppendEntriesArgs<T> {
    pub term: u64,
    pub leader_id: ReplicaId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<LogEntry<T>>,
}

/// Reply to an `AppendEntries` RPC. `x_term`/`x_index` are only
/// meaningful when `success` is false; they carry the fast-backtrack
/// hint described in the module docs on [`crate::replica`].
///
/// `x_term == -1` (encoded here as `None`) means the follower's log was
/// too short; `x_index` is then `last_log_index + 1`. Otherwise
/// `x_term` is the conflicting term and `x_index` is its first index.
#[derive(Clone, Debug)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub x_term: Option<u64>,
    pub x_index: u64,
}

/// A message delivered to the service on the apply channel.
///
/// `snapshot_*` fields are reserved by the wire contract but unused by
/// this core: snapshotting is a stubbed no-op (see
/// [`crate::replica::Replica::snapshot`]).
#[derive(Clone, Debug)]
pub struct ApplyMsg<T> {
    pub command_valid: bool,
    pub command: Option<T>,
    pub command_index: u64,

    pub snapshot_valid: bool,
    pub snapshot: Option<Vec<u8>>,
    pub snapshot_term: u64,
    pub snapshot_index: u64,
}

impl<T> ApplyMsg<T> {
    pub(crate) fn command(index: u64, command: T) -> Self {
        ApplyMsg {
            command_valid: true,
            command: Some(command),
            command_index: index,
            snapshot_valid: false,
            snapshot: None,
            snapshot_term: 0,
            snapshot_index: 0,
        }
    }
}
