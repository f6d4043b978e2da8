//! In-memory `Transport`/`Persister` fakes.
//!
//! These exist for two audiences at once: this crate's own
//! `#[cfg(test)]` unit tests and integration tests, and embedders who
//! want to exercise a multi-replica cluster in a single process before
//! wiring up real RPC and disk. Nothing here is behind `cfg(test)`, in
//! keeping with the corpus convention (e.g. `toydb`'s in-memory test
//! harness) of shipping the fake collaborators as ordinary library
//! code rather than duplicating them per test binary.

use crate::message::{AppendEntriesArgs, AppendEntriesReply, Command, RequestVoteArgs, RequestVoteReply};
use crate::replica::{Replica, ReplicaId};
use crate::transport::{Persister, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

/// An in-memory stand-in for stable storage. Holds at most one blob,
/// overwritten whole on every `save`, matching the real contract's "no
/// append semantics, no torn writes" — the in-memory case trivially
/// can't tear a write, so atomicity comes for free here.
pub struct MemoryPersister {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister {
            blob: Mutex::new(None),
        }
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, blob: Vec<u8>) {
        *self.blob.lock().unwrap() = Some(blob);
    }

    fn read(&self) -> Option<Vec<u8>> {
        self.blob.lock().unwrap().clone()
    }
}

/// A fully-connected, in-process "network" of replicas.
///
/// Replicas are registered after construction (`Replica::new` needs a
/// transport handle before the replica itself exists), and held by
/// `Weak` reference so the network doesn't keep a killed replica's
/// threads pinned alive. `disconnect`/`connect` simulate a partition
/// the way the lab harness this crate was distilled from does: a
/// disconnected replica can neither send nor receive RPCs until
/// reconnected, rather than modeling one-directional link loss.
pub struct MemoryNetwork<T: Command> {
    replicas: Mutex<HashMap<ReplicaId, Weak<Replica<T>>>>,
    disconnected: Mutex<HashSet<ReplicaId>>,
}

impl<T: Command> MemoryNetwork<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryNetwork {
            replicas: Mutex::new(HashMap::new()),
            disconnected: Mutex::new(HashSet::new()),
        })
    }

    /// Builds the `Transport` handle `id` should construct its
    /// `Replica` with. Call this before `Replica::new`, then
    /// `register` the resulting `Arc<Replica<_>>` once it exists.
    pub fn transport_for(self: &Arc<Self>, id: ReplicaId) -> Arc<dyn Transport<T>> {
        Arc::new(MemoryTransport {
            from: id,
            network: self.clone(),
        })
    }

    pub fn register(&self, id: ReplicaId, replica: &Arc<Replica<T>>) {
        self.replicas.lock().unwrap().insert(id, Arc::downgrade(replica));
    }

    /// Cuts `id` off from every other replica in both directions,
    /// simulating a network partition.
    pub fn disconnect(&self, id: ReplicaId) {
        self.disconnected.lock().unwrap().insert(id);
    }

    /// Heals a partition created by `disconnect`.
    pub fn connect(&self, id: ReplicaId) {
        self.disconnected.lock().unwrap().remove(&id);
    }

    fn is_connected(&self, id: ReplicaId) -> bool {
        !self.disconnected.lock().unwrap().contains(&id)
    }

    fn peer(&self, id: ReplicaId) -> Option<Arc<Replica<T>>> {
        self.replicas.lock().unwrap().get(&id)?.upgrade()
    }
}

struct MemoryTransport<T: Command> {
    from: ReplicaId,
    network: Arc<MemoryNetwork<T>>,
}

impl<T: Command> Transport<T> for MemoryTransport<T> {
    fn send_request_vote(&self, peer: ReplicaId, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        if !self.network.is_connected(self.from) || !self.network.is_connected(peer) {
            return None;
        }
        let replica = self.network.peer(peer)?;
        Some(replica.request_vote(args))
    }

    fn send_append_entries(
        &self,
        peer: ReplicaId,
        args: AppendEntriesArgs<T>,
    ) -> Option<AppendEntriesReply> {
        if !self.network.is_connected(self.from) || !self.network.is_connected(peer) {
            return None;
        }
        let replica = self.network.peer(peer)?;
        Some(replica.append_entries(args))
    }
}
