use crate::error::{RaftError, Result};
use crate::message::{Command, LogEntry};
use crate::replica::ReplicaId;
use serde::{Deserialize, Serialize};

/// The whole of a replica's durable state, encoded as a single opaque
/// blob on every mutation of `{current_term, voted_for, log}`.
///
/// Field order here *is* the on-disk contract (§4.7 of the design
/// notes): changing it breaks round-tripping of blobs written by an
/// older build. `bincode` + `serde` derive is the pairing the rest of
/// this corpus reaches for when it needs a compact, symmetric
/// encode/decode pair for exactly this kind of internal wire-or-disk
/// format.
#[derive(Serialize, Deserialize)]
pub(crate) struct PersistedState<T> {
    pub current_term: u64,
    pub voted_for: Option<ReplicaId>,
    pub log: Vec<LogEntry<T>>,
}

impl<T: Command> PersistedState<T> {
    pub(crate) fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("PersistedState is always serializable")
    }

    pub(crate) fn decode(blob: &[u8]) -> Result<Self> {
        bincode::deserialize(blob).map_err(RaftError::PersistedStateCorrupt)
    }
}
