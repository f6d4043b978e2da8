use crate::message::{AppendEntriesArgs, AppendEntriesReply, Command, RequestVoteArgs, RequestVoteReply};
use crate::replica::ReplicaId;

/// The collaborator a `Replica` uses to reach its peers.
///
/// `None` stands for the transport's own lossy-call contract: a lost
/// request, a lost reply, or a dead peer all look the same from here,
/// and the caller's only obligation is to not block forever. `Some`
/// reply means a reply was received within whatever timeout the
/// transport enforces; this crate never imposes its own RPC timeout on
/// top of that.
///
/// Implementations must not block the calling thread indefinitely and
/// must be safe to call from multiple replicator threads concurrently.
pub trait Transport<T: Command>: Send + Sync {
    fn send_request_vote(&self, peer: ReplicaId, args: RequestVoteArgs) -> Option<RequestVoteReply>;

    fn send_append_entries(
        &self,
        peer: ReplicaId,
        args: AppendEntriesArgs<T>,
    ) -> Option<AppendEntriesReply>;
}

/// The collaborator a `Replica` uses to survive a crash.
///
/// `save` must be atomic with respect to a crash: a reader after
/// restart observes either the previous blob or the new one, never a
/// torn write. There is no append semantics; every call rewrites the
/// whole blob, matching the contract `little_raft`'s own `Persister`
/// helper (and the lab harness it was derived from) already expose.
pub trait Persister: Send + Sync {
    fn save(&self, blob: Vec<u8>);
    fn read(&self) -> Option<Vec<u8>>;
}
