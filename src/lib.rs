//! `little_raft` implements the core of the Raft consensus protocol: a
//! per-replica role state machine (Follower/Candidate/Leader), a
//! replicated log with the fast-backtrack optimization for divergent
//! followers, commit advancement, and durability of the replica's
//! critical state.
//!
//! It does not implement an RPC transport, a stable-storage blob
//! store, or the state machine that consumes committed commands —
//! those are supplied by the embedder through the [`Transport`] and
//! [`Persister`] traits. See [`testing`] for in-memory implementations
//! of both, usable by embedders that want to exercise a cluster
//! without real I/O.
//!
//! ```no_run
//! use little_raft::{Config, Replica};
//! # use little_raft::testing::{MemoryNetwork, MemoryPersister};
//! # use crossbeam_channel::unbounded;
//! # fn build(my_id: usize, peer_ids: Vec<usize>) -> little_raft::Result<()> {
//! # let network = MemoryNetwork::new();
//! # let transport = network.transport_for(my_id);
//! # let persister = std::sync::Arc::new(MemoryPersister::new());
//! let (apply_tx, apply_rx) = unbounded();
//! let replica = Replica::<String>::new(
//!     my_id,
//!     peer_ids,
//!     transport,
//!     persister,
//!     apply_tx,
//!     Config::default(),
//! )?;
//!
//! let started = replica.start_command("set x = 1".to_string());
//! # let _ = (started, apply_rx);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod message;
mod persistence;
mod replica;
pub mod testing;
mod transport;

pub use config::Config;
pub use error::{RaftError, Result};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, Command, LogEntry, RequestVoteArgs,
    RequestVoteReply,
};
pub use replica::{Replica, ReplicaId};
pub use transport::{Persister, Transport};
