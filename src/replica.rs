//! The Raft replica: role state machine, log replication, commit
//! advancement, and the threads that drive them.
//!
//! A `Replica` is one logical actor built from several cooperating
//! threads that all share a single [`std::sync::RwLock`]-protected
//! state block (§5 of the design notes): a ticker thread that drives
//! election and heartbeat timing, one replicator thread per peer that
//! pushes `AppendEntries` when the local replica is leader, and an
//! applier thread that delivers newly committed entries to the service
//! in order. Incoming RPCs are served by whatever thread the embedder's
//! transport glue calls [`Replica::request_vote`] /
//! [`Replica::append_entries`] from; this crate does not own that
//! thread.
//!
//! No RPC is ever sent while the state lock is held: a thread snapshots
//! whatever it needs, drops the lock, makes the call, then re-acquires
//! the lock to apply the reply. The applier's channel send follows the
//! same discipline.

use crate::config::Config;
use crate::error::Result;
use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, Command, LogEntry, RequestVoteArgs,
    RequestVoteReply,
};
use crate::persistence::PersistedState;
use crate::transport::{Persister, Transport};
use crossbeam_channel::Sender;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Identifies a replica within its peer group.
pub type ReplicaId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// The single protected state block (§3 of the design notes).
///
/// Everything here is mutated only under the writer half of
/// `Replica::state`. `next_index`/`match_index` are only meaningful
/// while `role == Leader` but are kept around (rather than
/// `Option`-wrapped) since they are fully reinitialized on every
/// election and never read otherwise.
struct State<T> {
    current_term: u64,
    voted_for: Option<ReplicaId>,
    log: Vec<LogEntry<T>>,

    commit_index: u64,
    last_applied: u64,

    role: Role,
    next_index: BTreeMap<ReplicaId, u64>,
    match_index: BTreeMap<ReplicaId, u64>,

    next_election_deadline: Instant,
}

impl<T: Command> State<T> {
    fn last_log_index(&self) -> u64 {
        self.log.last().expect("log always has a sentinel").index
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().expect("log always has a sentinel").term
    }

    /// `(term, index) >= (mine's term, mine's index)` lexicographically,
    /// matching the "up-to-date log" definition in the glossary.
    fn candidate_is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry<T>> {
        self.log.get(index as usize)
    }
}

/// Per-peer wakeup: the replicator thread for that peer parks on its
/// own condvar, separate from the state lock, exactly as the condition
/// in §5's "per-peer condition variables" describes. The predicate
/// (`role == Leader && match_index[peer] < last_log_index`) is always
/// evaluated under the state lock; the mutex here only protects the
/// "has something changed" handoff with the condvar.
struct PeerSignal {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl PeerSignal {
    fn new() -> Self {
        PeerSignal {
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cvar.notify_all();
    }

    /// Blocks until notified or `timeout` elapses, whichever comes
    /// first. The timeout exists only so a killed replica's thread is
    /// guaranteed to wake up and notice the kill flag even if nothing
    /// else ever signals it again (§5 "Cancellation": waits are not
    /// cancellable mid-wait, activities poll the flag on every
    /// wakeup).
    fn wait(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap();
        let _ = self.cvar.wait_timeout(guard, timeout).unwrap();
    }
}

/// A single Raft replica.
///
/// Construct with [`Replica::new`], which spawns the ticker, one
/// replicator per peer, and the applier, then returns promptly per the
/// `Make` contract in §6 of the design notes. The returned value is
/// wrapped in an `Arc` because the spawned threads all hold a clone of
/// it; share that `Arc`, don't try to unwrap it.
pub struct Replica<T: Command> {
    id: ReplicaId,
    peer_ids: Vec<ReplicaId>,
    config: Config,

    state: RwLock<State<T>>,
    transport: Arc<dyn Transport<T>>,
    persister: Arc<dyn Persister>,
    apply_tx: Sender<ApplyMsg<T>>,

    killed: AtomicBool,
    peer_signals: BTreeMap<ReplicaId, PeerSignal>,
    apply_signal: PeerSignal,
}

impl<T: Command> Replica<T> {
    /// Builds a replica, restoring persisted state if the persister
    /// holds any, and spawns its background threads. Corresponds to
    /// `Make` in the design notes' §6.
    ///
    /// Returns an error if the persister holds a non-empty blob that
    /// fails to decode; per the resolved Open Question in
    /// `DESIGN.md`, this core fails fast rather than silently
    /// continuing with zero-valued state.
    pub fn new(
        id: ReplicaId,
        peer_ids: Vec<ReplicaId>,
        transport: Arc<dyn Transport<T>>,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg<T>>,
        config: Config,
    ) -> Result<Arc<Replica<T>>> {
        let (current_term, voted_for, log) = match persister.read() {
            Some(blob) if !blob.is_empty() => {
                let restored = PersistedState::<T>::decode(&blob)?;
                (restored.current_term, restored.voted_for, restored.log)
            }
            _ => (0, None, vec![LogEntry::sentinel()]),
        };

        let mut peer_signals = BTreeMap::new();
        for peer in &peer_ids {
            peer_signals.insert(*peer, PeerSignal::new());
        }

        let state = State {
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            next_election_deadline: Instant::now() + random_election_timeout(&config),
        };

        let replica = Arc::new(Replica {
            id,
            peer_ids,
            config,
            state: RwLock::new(state),
            transport,
            persister,
            apply_tx,
            killed: AtomicBool::new(false),
            peer_signals,
            apply_signal: PeerSignal::new(),
        });

        log::debug!(
            "replica {} started at term {}",
            replica.id,
            replica.state.read().unwrap().current_term
        );

        let ticker = replica.clone();
        thread::spawn(move || ticker.run_ticker());

        for peer in replica.peer_ids.clone() {
            let r = replica.clone();
            thread::spawn(move || r.run_replicator(peer));
        }

        let applier = replica.clone();
        thread::spawn(move || applier.run_applier());

        Ok(replica)
    }

    /// Appends `command` to the log if this replica is currently
    /// leader. Returns `None` if it is not; callers should retry
    /// against whoever they currently believe is leader. Corresponds
    /// to `Start` in §6; the Go source's `(-1, -1, false)` sentinel
    /// return becomes `None` here since Rust indices are unsigned.
    pub fn start_command(&self, command: T) -> Option<(u64, u64)> {
        let mut state = self.state.write().unwrap();
        if state.role != Role::Leader {
            return None;
        }

        let index = state.last_log_index() + 1;
        let term = state.current_term;
        state.log.push(LogEntry::new(term, index, command));
        self.persist(&state);
        log::debug!("replica {} appended entry {} at term {}", self.id, index, term);

        for peer in &self.peer_ids {
            self.peer_signals[peer].notify();
        }

        Some((index, term))
    }

    /// Returns `(current_term, is_leader)`.
    pub fn get_state(&self) -> (u64, bool) {
        let state = self.state.read().unwrap();
        (state.current_term, state.role == Role::Leader)
    }

    /// Idempotent shutdown signal. Every background thread polls this
    /// flag between units of work and exits promptly once it is set;
    /// after `kill` returns no further messages will appear on the
    /// apply channel from this replica.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        for signal in self.peer_signals.values() {
            signal.notify();
        }
        self.apply_signal.notify();
    }

    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Stubbed: log compaction is out of scope for this core (§1, §9
    /// Open Questions). A real implementation would trim `log` up to
    /// `last_included_index` and remember `snapshot` for followers
    /// that have fallen behind it.
    pub fn snapshot(&self, _last_included_index: u64, _snapshot: Vec<u8>) {}

    /// Stubbed companion to `snapshot`; always accepts, matching the
    /// Go source's unconditional `return true`.
    pub fn cond_install_snapshot(
        &self,
        _last_included_term: u64,
        _last_included_index: u64,
        _snapshot: &[u8],
    ) -> bool {
        true
    }

    fn persist(&self, state: &State<T>) {
        let blob = PersistedState {
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: state.log.clone(),
        }
        .encode();
        self.persister.save(blob);
    }

    fn quorum_size(&self) -> usize {
        (self.peer_ids.len() + 1) / 2 + 1
    }

    // ---- vote handler (§4.2) ----------------------------------------

    pub fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.write().unwrap();

        if args.term < state.current_term {
            return RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if args.term > state.current_term {
            self.step_down(&mut state, args.term);
        }

        let up_to_date = state.candidate_is_up_to_date(args.last_log_term, args.last_log_index);
        let can_vote = state.voted_for.is_none() || state.voted_for == Some(args.candidate_id);

        if up_to_date && can_vote {
            state.voted_for = Some(args.candidate_id);
            self.persist(&state);
            self.reset_election_deadline(&mut state);
            log::debug!(
                "replica {} grants vote to {} for term {}",
                self.id,
                args.candidate_id,
                state.current_term
            );
            RequestVoteReply {
                term: state.current_term,
                vote_granted: true,
            }
        } else {
            log::trace!(
                "replica {} rejects vote for {} (up_to_date={}, can_vote={})",
                self.id,
                args.candidate_id,
                up_to_date,
                can_vote
            );
            RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            }
        }
    }

    // ---- append handler (§4.3) ---------------------------------------

    pub fn append_entries(&self, args: AppendEntriesArgs<T>) -> AppendEntriesReply {
        let mut state = self.state.write().unwrap();

        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_term: None,
                x_index: state.last_log_index() + 1,
            };
        }
        if args.term > state.current_term || state.role == Role::Candidate {
            self.step_down(&mut state, args.term);
        }
        self.reset_election_deadline(&mut state);

        let last_log_index = state.last_log_index();
        if args.prev_log_index > last_log_index {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_term: None,
                x_index: last_log_index + 1,
            };
        }

        let prev_term = state
            .entry_at(args.prev_log_index)
            .expect("prev_log_index <= last_log_index checked above")
            .term;
        if prev_term != args.prev_log_term {
            let conflict_term = prev_term;
            let mut conflict_index = args.prev_log_index;
            while conflict_index > 1
                && state.entry_at(conflict_index - 1).unwrap().term == conflict_term
            {
                conflict_index -= 1;
            }
            state.log.truncate(args.prev_log_index as usize);
            self.persist(&state);
            log::debug!(
                "replica {} rejects append at term {}: conflict at index {} (conflict_term {})",
                self.id,
                args.term,
                args.prev_log_index,
                conflict_term
            );
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_term: Some(conflict_term),
                x_index: conflict_index,
            };
        }

        let prev_log_index = args.prev_log_index;
        let num_entries = args.entries.len() as u64;
        let mut log_mutated = false;
        for entry in args.entries {
            let local_len = state.log.len() as u64;
            let matches =
                entry.index < local_len && state.entry_at(entry.index).unwrap().term == entry.term;
            if !matches {
                state.log.truncate(entry.index as usize);
                state.log.push(entry);
                log_mutated = true;
            }
        }
        if log_mutated {
            self.persist(&state);
        }

        if args.leader_commit > state.commit_index {
            let last_new_entry_index = prev_log_index + num_entries;
            state.commit_index = std::cmp::min(args.leader_commit, last_new_entry_index);
            log::debug!("replica {} advances commit_index to {}", self.id, state.commit_index);
            self.apply_signal.notify();
        }

        AppendEntriesReply {
            term: state.current_term,
            success: true,
            x_term: None,
            x_index: 0,
        }
    }

    // ---- role transitions (§4.1) --------------------------------------

    /// `Any -> Follower` on an observed higher term (or, for
    /// `AppendEntries`, a candidate dropping to follower at an equal
    /// term). Always resets the election deadline, per the resolved
    /// Open Question in `DESIGN.md` (the Go source only did this when
    /// stepping down from Leader; this crate does it unconditionally
    /// on every term bump / valid leader contact).
    fn step_down(&self, state: &mut State<T>, term: u64) {
        state.current_term = term;
        state.voted_for = None;
        state.role = Role::Follower;
        self.persist(state);
        self.reset_election_deadline(state);
        log::debug!("replica {} steps down to follower at term {}", self.id, term);
    }

    fn reset_election_deadline(&self, state: &mut State<T>) {
        state.next_election_deadline = Instant::now() + random_election_timeout(&self.config);
    }

    /// Bumps the term, votes for self, and persists — everything an
    /// election needs while still holding the state lock. Returns the
    /// `(term, last_log_index, last_log_term)` to fan vote requests
    /// out with, or `None` if this replica became leader outright
    /// (solo cluster; a self-vote is already a majority).
    fn start_election(self: &Arc<Self>, state: &mut State<T>) -> Option<(u64, u64, u64)> {
        state.current_term += 1;
        state.role = Role::Candidate;
        state.voted_for = Some(self.id);
        self.persist(state);
        self.reset_election_deadline(state);

        let term = state.current_term;
        log::debug!("replica {} starts election for term {}", self.id, term);

        if 1 >= self.quorum_size() {
            self.become_leader(state);
            return None;
        }

        Some((term, state.last_log_index(), state.last_log_term()))
    }

    /// Fans vote requests out to every peer, off the state lock, one
    /// thread per peer (mirroring the original source's one
    /// goroutine per `sendRequestVote`). Each reply is applied under
    /// the state lock, discarding it if the election has since moved
    /// on (§4.1 "ties and stale votes").
    fn fan_out_votes(self: &Arc<Self>, term: u64, last_log_index: u64, last_log_term: u64) {
        let granted = Arc::new(Mutex::new(1usize)); // self-vote
        for &peer in &self.peer_ids {
            let replica = self.clone();
            let granted = granted.clone();
            thread::spawn(move || {
                let args = RequestVoteArgs {
                    term,
                    candidate_id: replica.id,
                    last_log_index,
                    last_log_term,
                };
                let reply = match replica.transport.send_request_vote(peer, args) {
                    Some(reply) => reply,
                    None => return,
                };

                let mut state = replica.state.write().unwrap();
                if state.role != Role::Candidate || state.current_term != term {
                    return;
                }
                if reply.term > state.current_term {
                    replica.step_down(&mut state, reply.term);
                    return;
                }
                if reply.vote_granted {
                    let mut granted = granted.lock().unwrap();
                    *granted += 1;
                    if *granted >= replica.quorum_size() {
                        replica.become_leader(&mut state);
                    }
                }
            });
        }
    }

    fn become_leader(self: &Arc<Self>, state: &mut State<T>) {
        state.role = Role::Leader;
        let next = state.last_log_index() + 1;
        state.next_index.clear();
        state.match_index.clear();
        for &peer in &self.peer_ids {
            state.next_index.insert(peer, next);
            state.match_index.insert(peer, 0);
        }
        log::debug!(
            "replica {} becomes leader at term {}",
            self.id,
            state.current_term
        );

        self.broadcast_heartbeat();
    }

    // ---- ticker thread (§4.1, §5) --------------------------------------

    fn run_ticker(self: Arc<Self>) {
        while !self.killed() {
            let (role, deadline) = {
                let state = self.state.read().unwrap();
                (state.role, state.next_election_deadline)
            };

            match role {
                Role::Leader => {
                    thread::sleep(self.config.heartbeat_timeout);
                    if self.killed() {
                        return;
                    }
                    if self.state.read().unwrap().role == Role::Leader {
                        self.broadcast_heartbeat();
                    }
                }
                Role::Follower | Role::Candidate => {
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    if self.killed() {
                        return;
                    }

                    let election = {
                        let mut state = self.state.write().unwrap();
                        if state.role != Role::Leader && Instant::now() >= state.next_election_deadline {
                            self.start_election(&mut state)
                        } else {
                            None
                        }
                    };
                    if let Some((term, last_log_index, last_log_term)) = election {
                        self.fan_out_votes(term, last_log_index, last_log_term);
                    }
                }
            }
        }
    }

    /// Pushes an `AppendEntries` to every peer right now, regardless of
    /// whether `needs_sync` would otherwise hold it back. A caught-up
    /// peer's `match_index` already equals `last_log_index`, so the
    /// per-peer replicator loop's wait predicate never trips for it;
    /// without this, a leader with only caught-up followers would never
    /// send the periodic heartbeat §4.4 requires to keep followers from
    /// timing out, and would lose leadership to spurious elections. One
    /// thread per peer mirrors the Go source's `go rf.Sync(peer)` fan-out
    /// from `broadcastHeartbeat`.
    fn broadcast_heartbeat(self: &Arc<Self>) {
        for &peer in &self.peer_ids {
            let replica = self.clone();
            thread::spawn(move || replica.sync_peer(peer));
        }
    }

    // ---- replicator thread, one per peer (§4.4) ------------------------

    fn needs_sync(&self, peer: ReplicaId) -> bool {
        let state = self.state.read().unwrap();
        state.role == Role::Leader && state.match_index[&peer] < state.last_log_index()
    }

    fn run_replicator(self: Arc<Self>, peer: ReplicaId) {
        // Poll on a bounded wait so a killed replica's replicator is
        // guaranteed to notice even with no further signals; `Start`
        // notifies this peer's signal directly for a prompt push between
        // heartbeats, while periodic heartbeats themselves are driven by
        // `broadcast_heartbeat` calling `sync_peer` directly rather than
        // through this signal.
        let poll = self.config.heartbeat_timeout;
        loop {
            if self.killed() {
                return;
            }
            while !self.needs_sync(peer) {
                if self.killed() {
                    return;
                }
                self.peer_signals[&peer].wait(poll);
            }
            self.sync_peer(peer);
        }
    }

    fn sync_peer(&self, peer: ReplicaId) {
        let (term, args) = {
            let state = self.state.read().unwrap();
            if state.role != Role::Leader {
                return;
            }
            let next = state.next_index[&peer];
            let prev_log_index = next - 1;
            let prev_log_term = state
                .entry_at(prev_log_index)
                .expect("next_index stays within the log")
                .term;
            let entries: Vec<LogEntry<T>> = state.log[(next as usize)..].to_vec();
            (
                state.current_term,
                AppendEntriesArgs {
                    term: state.current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit: state.commit_index,
                    entries,
                },
            )
        };

        let prev_log_index = args.prev_log_index;
        let sent_len = args.entries.len() as u64;

        let reply = match self.transport.send_append_entries(peer, args) {
            Some(reply) => reply,
            None => return,
        };

        let mut state = self.state.write().unwrap();
        if state.role != Role::Leader || state.current_term != term {
            return;
        }
        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }

        if reply.success {
            let new_match = prev_log_index + sent_len;
            let match_index = state.match_index.get_mut(&peer).unwrap();
            *match_index = std::cmp::max(*match_index, new_match);
            let match_index = *match_index;
            state.next_index.insert(peer, match_index + 1);
            self.maybe_advance_commit(&mut state, match_index);
        } else {
            let next = match reply.x_term {
                None => reply.x_index,
                Some(x_term) => {
                    let mut probe = prev_log_index;
                    while probe > 1 && state.entry_at(probe - 1).unwrap().term > x_term {
                        probe -= 1;
                    }
                    if state.entry_at(probe - 1).map(|e| e.term) == Some(x_term) {
                        probe
                    } else {
                        reply.x_index
                    }
                }
            };
            state.next_index.insert(peer, next);
            log::trace!(
                "replica {} backtracks next_index[{}] to {}",
                self.id,
                peer,
                next
            );
        }
    }

    // ---- commit advancement (§4.5) -------------------------------------

    fn maybe_advance_commit(&self, state: &mut State<T>, candidate: u64) {
        if candidate <= state.commit_index {
            return;
        }
        if state.entry_at(candidate).map(|e| e.term) != Some(state.current_term) {
            return;
        }

        let mut replications = 1; // the leader itself
        for &peer in &self.peer_ids {
            if state.match_index[&peer] >= candidate {
                replications += 1;
            }
        }
        if replications >= self.quorum_size() {
            state.commit_index = candidate;
            log::debug!("replica {} advances commit_index to {}", self.id, candidate);
            self.apply_signal.notify();
        }
    }

    // ---- applier thread (§4.6) ------------------------------------------

    fn run_applier(self: Arc<Self>) {
        let poll = self.config.heartbeat_timeout;
        loop {
            if self.killed() {
                return;
            }
            if !self.apply_next() {
                self.apply_signal.wait(poll);
            }
        }
    }

    /// Applies exactly one ready entry, if any, releasing the state
    /// lock before the (possibly blocking) channel send. Returns
    /// whether an entry was applied, so the caller can keep draining
    /// without waiting in between.
    fn apply_next(&self) -> bool {
        let msg = {
            let mut state = self.state.write().unwrap();
            if state.last_applied >= state.commit_index {
                return false;
            }
            state.last_applied += 1;
            let index = state.last_applied;
            let command = state
                .entry_at(index)
                .expect("last_applied <= commit_index <= last_log_index")
                .command()
                .expect("sentinel is never committed past index 0")
                .clone();
            ApplyMsg::command(index, command)
        };

        if self.apply_tx.send(msg).is_err() {
            log::warn!(
                "replica {} apply channel closed; applier stopping",
                self.id
            );
            self.killed.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }
}

fn random_election_timeout(config: &Config) -> Duration {
    let (low, high) = config.election_timeout;
    rand::thread_rng().gen_range(low..high)
}
