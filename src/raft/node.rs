//! The Raft peer.
//!
//! One peer-wide mutex guards all mutable state. Handlers validate, mutate,
//! persist, and return; nothing holds the mutex across a network call or the
//! application hand-off. Every task that re-acquires the mutex after a
//! round trip re-validates its anchor (role, term, and the commit index it
//! started from) and silently abandons the operation on mismatch; the next
//! heartbeat tick picks up where it left off.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{after, bounded, select, unbounded, Receiver, Sender};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::net::{ClientEnd, ServiceHandle};
use crate::storage::Persister;

use super::apply::{ApplyMsg, ApplyQueue};
use super::log::RaftLog;
use super::message::{
    AppendEntriesArgs, AppendEntriesReply, Entry, InstallSnapshotArgs, InstallSnapshotReply,
    RaftReply, RaftRequest, RequestVoteArgs, RequestVoteReply,
};

/// Leader heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

/// Lower bound of the election timeout. Comfortably above the heartbeat
/// period plus one RPC round trip, so a healthy leader never gets deposed.
pub const ELECTION_TIMEOUT_BASE: Duration = Duration::from_millis(600);

/// Width in milliseconds of the randomized span added to the base timeout.
pub const ELECTION_TIMEOUT_SPAN_MS: u64 = 300;

/// Role of a Raft peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive: accepts entries from the leader, votes in elections.
    Follower,
    /// Soliciting votes after an election timeout.
    Candidate,
    /// Accepts client commands and drives replication.
    Leader,
}

/// Everything guarded by the peer-wide mutex.
struct RaftState {
    role: Role,
    /// Highest term observed. Never decreases.
    current_term: u64,
    /// Peer voted for in `current_term`, if any.
    voted_for: Option<usize>,
    log: RaftLog,
    /// Highest index known committed. Never decreases.
    commit_index: u64,
    /// Highest index handed to the delivery pipeline.
    last_applied: u64,
    /// Leader-only: next log index to send to each peer.
    next_index: Vec<u64>,
    /// Leader-only: highest index known replicated on each peer.
    match_index: Vec<u64>,
    /// Leader-only: one outstanding replication RPC per target.
    in_flight: Vec<bool>,
}

/// Persistent record, written on every mutation of term, vote, or log.
#[derive(Serialize)]
struct PersistRecord<'a> {
    current_term: u64,
    voted_for: Option<usize>,
    log: &'a RaftLog,
}

#[derive(Deserialize)]
struct RestoreRecord {
    current_term: u64,
    voted_for: Option<usize>,
    log: RaftLog,
}

/// Encode the on-disk snapshot record: the two header fields in the wire
/// encoding, followed by the raw application blob.
pub fn encode_snapshot_record(
    last_included_index: u64,
    last_included_term: u64,
    blob: &[u8],
) -> Vec<u8> {
    let mut record =
        bincode::serialize(&last_included_index).expect("snapshot header encodes");
    record.extend(bincode::serialize(&last_included_term).expect("snapshot header encodes"));
    record.extend_from_slice(blob);
    record
}

/// Decode `(last_included_index, last_included_term)` from a snapshot record.
/// The remainder of the record is the application blob.
pub fn decode_snapshot_header(record: &[u8]) -> Option<(u64, u64)> {
    let mut cursor = Cursor::new(record);
    let index: u64 = bincode::deserialize_from(&mut cursor).ok()?;
    let term: u64 = bincode::deserialize_from(&mut cursor).ok()?;
    Some((index, term))
}

struct RaftInner {
    me: usize,
    peers: Vec<ClientEnd<RaftRequest, RaftReply>>,
    persister: Persister,
    state: Mutex<RaftState>,
    apply: ApplyQueue,
    /// One-slot reset signal for the election timer task.
    timer_reset: Sender<()>,
    killed: Arc<AtomicBool>,
}

/// A Raft peer handle. Cloning shares the peer.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Construct a peer, restore it from persisted state and snapshot, and
    /// launch its background tasks. Returns promptly.
    ///
    /// `peers` holds client ends to every peer, indexed by id (`peers[me]`
    /// is unused). `service` is this peer's incoming-RPC stream. Committed
    /// commands and snapshot fences are delivered in index order on
    /// `apply_tx`.
    pub fn new(
        peers: Vec<ClientEnd<RaftRequest, RaftReply>>,
        me: usize,
        persister: Persister,
        apply_tx: Sender<ApplyMsg>,
        service: ServiceHandle<RaftRequest, RaftReply>,
    ) -> Raft {
        let n = peers.len();
        let mut state = RaftState {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: vec![0; n],
            match_index: vec![0; n],
            in_flight: vec![false; n],
        };

        let raw = persister.read_raft_state();
        if !raw.is_empty() {
            match bincode::deserialize::<RestoreRecord>(&raw) {
                Ok(saved) => {
                    state.current_term = saved.current_term;
                    state.voted_for = saved.voted_for;
                    state.log = saved.log;
                }
                Err(e) => warn!("raft {}: persisted state unreadable: {}", me, e),
            }
        }

        let apply = ApplyQueue::new(apply_tx);

        // Reconcile the log base with the snapshot and rehydrate the
        // application before any command delivery resumes.
        let snapshot = persister.read_snapshot();
        if !snapshot.is_empty() {
            if let Some((last_index, last_term)) = decode_snapshot_header(&snapshot) {
                if last_index > state.log.base_index() {
                    state.log.compact(last_index, last_term);
                }
                apply.push(ApplyMsg::Snapshot {
                    data: snapshot.clone(),
                });
            }
        }
        state.commit_index = state.log.base_index();
        state.last_applied = state.log.base_index();

        let (timer_reset, reset_rx) = bounded(1);
        let inner = Arc::new(RaftInner {
            me,
            peers,
            persister,
            state: Mutex::new(state),
            apply,
            timer_reset,
            killed: Arc::new(AtomicBool::new(false)),
        });

        let timer = inner.clone();
        thread::spawn(move || timer.run_election_timer(reset_rx));
        let heart = inner.clone();
        thread::spawn(move || heart.run_heartbeats());
        let dispatch = inner.clone();
        service.spawn_dispatch(inner.killed.clone(), move |_from, req| dispatch.handle(req));

        Raft { inner }
    }

    /// Begin agreement on a command. Returns `Some((index, term))`, the slot
    /// the command will occupy if it commits, when this peer is the leader,
    /// and `None` otherwise. There is no guarantee the command ever commits.
    pub fn start(&self, command: Vec<u8>) -> Option<(u64, u64)> {
        if self.inner.killed() {
            return None;
        }
        let (index, term) = {
            let mut st = self.inner.state.lock().unwrap();
            if st.role != Role::Leader {
                return None;
            }
            let index = st.log.last_index() + 1;
            let term = st.current_term;
            st.log.append(Entry { term, command });
            self.inner.persist(&st);
            (index, term)
        };
        self.inner.broadcast_append_entries();
        Some((index, term))
    }

    /// Current term and whether this peer believes it is the leader.
    pub fn get_state(&self) -> (u64, bool) {
        let st = self.inner.state.lock().unwrap();
        (st.current_term, st.role == Role::Leader)
    }

    /// Size of the persisted Raft state, for snapshot-trigger heuristics.
    pub fn raft_state_size(&self) -> usize {
        self.inner.persister.raft_state_size()
    }

    /// Compact the log through `up_to`, recording `blob` as the
    /// application's state at that index. Out-of-range requests are ignored.
    pub fn issue_snapshot(&self, up_to: u64, blob: &[u8]) {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        if up_to <= st.log.base_index() || up_to > st.log.last_index() {
            debug!(
                "raft {}: snapshot at {} ignored, retained range is ({}, {}]",
                inner.me,
                up_to,
                st.log.base_index(),
                st.log.last_index()
            );
            return;
        }
        let last_term = st.log.term_at(up_to).expect("snapshot index bounds checked");
        st.log.compact(up_to, last_term);
        st.commit_index = st.commit_index.max(up_to);
        st.last_applied = st.last_applied.max(up_to);
        let record = encode_snapshot_record(up_to, last_term, blob);
        inner.persist_with_snapshot(&st, record);
    }

    /// Quiesce the peer. Idempotent; background tasks wind down and
    /// in-flight handlers complete without further effect.
    pub fn kill(&self) {
        if !self.inner.killed.swap(true, Ordering::SeqCst) {
            self.inner.apply.shutdown();
            // Wake the timer task so it observes the flag.
            let _ = self.inner.timer_reset.try_send(());
        }
    }

    pub fn killed(&self) -> bool {
        self.inner.killed()
    }
}

impl RaftInner {
    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Write the persistent record. Called with the mutex held, after every
    /// mutation of `current_term`, `voted_for`, or the log.
    fn persist(&self, st: &RaftState) {
        let record = PersistRecord {
            current_term: st.current_term,
            voted_for: st.voted_for,
            log: &st.log,
        };
        let data = bincode::serialize(&record).expect("state record encodes");
        self.persister.save_raft_state(data);
    }

    /// Write the persistent record and the snapshot record atomically.
    fn persist_with_snapshot(&self, st: &RaftState, snapshot: Vec<u8>) {
        let record = PersistRecord {
            current_term: st.current_term,
            voted_for: st.voted_for,
            log: &st.log,
        };
        let data = bincode::serialize(&record).expect("state record encodes");
        self.persister.save_state_and_snapshot(data, snapshot);
    }

    /// Adopt a higher term: clear the vote, fall back to follower. The
    /// caller persists.
    fn step_down(&self, st: &mut RaftState, term: u64) {
        debug!(
            "raft {}: stepping down, term {} -> {}",
            self.me, st.current_term, term
        );
        st.current_term = term;
        st.voted_for = None;
        st.role = Role::Follower;
    }

    /// Non-blocking one-slot signal; a pending reset is already enough.
    fn reset_election_timer(&self) {
        let _ = self.timer_reset.try_send(());
    }

    /// Hand every newly committed entry to the delivery pipeline, in index
    /// order. Called with the mutex held; the push never blocks.
    fn advance_applied(&self, st: &mut RaftState) {
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let command = st
                .log
                .entry(index)
                .expect("committed entries are retained")
                .command
                .clone();
            self.apply.push(ApplyMsg::Command { index, command });
            st.last_applied = index;
        }
    }

    // =========================================================================
    // RPC HANDLERS
    // =========================================================================

    fn handle(&self, req: RaftRequest) -> RaftReply {
        match req {
            RaftRequest::RequestVote(args) => {
                RaftReply::RequestVote(self.handle_request_vote(args))
            }
            RaftRequest::AppendEntries(args) => {
                RaftReply::AppendEntries(self.handle_append_entries(args))
            }
            RaftRequest::InstallSnapshot(args) => {
                RaftReply::InstallSnapshot(self.handle_install_snapshot(args))
            }
        }
    }

    /// Grant a vote iff the candidate's term is current, our vote in this
    /// term is free (or already theirs), and their log is at least as
    /// up to date as ours: strictly newer last term, or same last term and
    /// at least our last index.
    fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let (reply, granted) = {
            let mut st = self.state.lock().unwrap();
            if args.term > st.current_term {
                self.step_down(&mut st, args.term);
                self.persist(&st);
            }
            if args.term < st.current_term {
                (
                    RequestVoteReply {
                        term: st.current_term,
                        vote_granted: false,
                    },
                    false,
                )
            } else {
                let last_log_term = st.log.last_term();
                let last_log_index = st.log.last_index();
                let up_to_date = args.last_log_term > last_log_term
                    || (args.last_log_term == last_log_term
                        && args.last_log_index >= last_log_index);
                let vote_free =
                    st.voted_for.is_none() || st.voted_for == Some(args.candidate_id);
                if vote_free && up_to_date {
                    st.voted_for = Some(args.candidate_id);
                    self.persist(&st);
                    debug!(
                        "raft {}: vote granted to {} in term {}",
                        self.me, args.candidate_id, st.current_term
                    );
                    (
                        RequestVoteReply {
                            term: st.current_term,
                            vote_granted: true,
                        },
                        true,
                    )
                } else {
                    (
                        RequestVoteReply {
                            term: st.current_term,
                            vote_granted: false,
                        },
                        false,
                    )
                }
            }
        };
        // The reset signal goes out after the mutex is released.
        if granted {
            self.reset_election_timer();
        }
        reply
    }

    fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let (reply, from_live_leader) = {
            let mut st = self.state.lock().unwrap();
            self.append_entries_locked(&mut st, args)
        };
        if from_live_leader {
            self.reset_election_timer();
        }
        reply
    }

    fn append_entries_locked(
        &self,
        st: &mut RaftState,
        args: AppendEntriesArgs,
    ) -> (AppendEntriesReply, bool) {
        if args.term < st.current_term {
            return (
                AppendEntriesReply {
                    term: st.current_term,
                    success: false,
                    conflict_index: 0,
                },
                false,
            );
        }
        let mut should_persist = false;
        if args.term > st.current_term {
            self.step_down(st, args.term);
            should_persist = true;
        }
        // A live leader of our term; a candidate abandons its election.
        st.role = Role::Follower;

        let base = st.log.base_index();
        if args.prev_log_index >= base {
            if args.prev_log_index > st.log.last_index() {
                // Our log is missing the tail entirely; point the leader at
                // our next free slot.
                if should_persist {
                    self.persist(st);
                }
                return (
                    AppendEntriesReply {
                        term: st.current_term,
                        success: false,
                        conflict_index: st.log.last_index() + 1,
                    },
                    true,
                );
            }
            let local_term = st
                .log
                .term_at(args.prev_log_index)
                .expect("prev bounds checked");
            if local_term != args.prev_log_term {
                // Walk back over the whole conflicting term so the leader
                // skips it in one backoff.
                let mut conflict_index = args.prev_log_index;
                while conflict_index > base
                    && st.log.term_at(conflict_index - 1) == Ok(local_term)
                {
                    conflict_index -= 1;
                }
                if should_persist {
                    self.persist(st);
                }
                return (
                    AppendEntriesReply {
                        term: st.current_term,
                        success: false,
                        conflict_index,
                    },
                    true,
                );
            }
        }
        // prev matches, or lies inside our snapshot. Merge the entries:
        // truncate at the first term mismatch, leave matching entries
        // untouched so a delayed duplicate cannot roll back entries a newer
        // request already appended.
        let first = (args.prev_log_index + 1).max(base + 1);
        let skip = (first - args.prev_log_index - 1) as usize;
        let mut index = first;
        for entry in args.entries.iter().skip(skip) {
            if index <= st.log.last_index() {
                if st.log.term_at(index) != Ok(entry.term) {
                    st.log.truncate_from(index);
                    st.log.append(entry.clone());
                    should_persist = true;
                }
            } else {
                st.log.append(entry.clone());
                should_persist = true;
            }
            index += 1;
        }

        if args.leader_commit > st.commit_index {
            st.commit_index = args.leader_commit.min(st.log.last_index());
            self.advance_applied(st);
        }
        if should_persist {
            self.persist(st);
        }
        (
            AppendEntriesReply {
                term: st.current_term,
                success: true,
                conflict_index: 0,
            },
            true,
        )
    }

    fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let (reply, from_live_leader) = {
            let mut st = self.state.lock().unwrap();
            if args.term < st.current_term {
                (
                    InstallSnapshotReply {
                        term: st.current_term,
                    },
                    false,
                )
            } else {
                if args.term > st.current_term {
                    self.step_down(&mut st, args.term);
                    self.persist(&st);
                }
                st.role = Role::Follower;
                if args.last_included_index <= st.last_applied {
                    // Everything in this snapshot is already covered locally.
                    (
                        InstallSnapshotReply {
                            term: st.current_term,
                        },
                        true,
                    )
                } else {
                    debug!(
                        "raft {}: installing snapshot through {}",
                        self.me, args.last_included_index
                    );
                    st.log
                        .compact(args.last_included_index, args.last_included_term);
                    // Commit resumes past this point only through regular
                    // AppendEntries from the leader.
                    st.commit_index = args.last_included_index;
                    st.last_applied = args.last_included_index;
                    self.persist_with_snapshot(&st, args.data.clone());
                    self.apply.push(ApplyMsg::Snapshot { data: args.data });
                    (
                        InstallSnapshotReply {
                            term: st.current_term,
                        },
                        true,
                    )
                }
            }
        };
        if from_live_leader {
            self.reset_election_timer();
        }
        reply
    }

    // =========================================================================
    // ELECTION
    // =========================================================================

    /// Election timer task. Blocks on either the one-slot reset signal or a
    /// freshly drawn randomized timeout. Seeded per peer so draws across the
    /// cluster are independent.
    fn run_election_timer(self: Arc<Self>, reset_rx: Receiver<()>) {
        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(clock ^ (self.me as u64).wrapping_mul(0x9e3779b97f4a7c15));
        while !self.killed() {
            let timeout =
                ELECTION_TIMEOUT_BASE + Duration::from_millis(rng.gen_range(0..=ELECTION_TIMEOUT_SPAN_MS));
            select! {
                // A reset signal: a live leader or a granted vote. Loop
                // around and draw a fresh timeout.
                recv(reset_rx) -> _ => {}
                recv(after(timeout)) -> _ => self.election_timeout(),
            }
        }
    }

    /// The timeout fired with no live leader in sight: start an election.
    fn election_timeout(self: &Arc<Self>) {
        let args = {
            let mut st = self.state.lock().unwrap();
            if self.killed() || st.role == Role::Leader {
                return;
            }
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.me);
            self.persist(&st);
            debug!("raft {}: starting election for term {}", self.me, st.current_term);
            RequestVoteArgs {
                term: st.current_term,
                candidate_id: self.me,
                last_log_index: st.log.last_index(),
                last_log_term: st.log.last_term(),
            }
        };
        self.solicit_votes(args);
    }

    /// Fan RequestVote out to every peer and tally replies on a collector
    /// task, re-validating the candidacy anchor on every reply.
    fn solicit_votes(self: &Arc<Self>, args: RequestVoteArgs) {
        let (tx, rx) = unbounded();
        for p in 0..self.peers.len() {
            if p == self.me {
                continue;
            }
            let end = self.peers[p].clone();
            let tx = tx.clone();
            let request = RaftRequest::RequestVote(args.clone());
            thread::spawn(move || {
                let _ = tx.send(end.call(&request));
            });
        }
        drop(tx);

        let this = self.clone();
        thread::spawn(move || {
            // Votes still needed from others; our own vote is the +1 that
            // makes `needed + 1` a strict majority.
            let needed = this.peers.len() / 2;
            let mut granted = 0usize;
            if granted >= needed && this.try_become_leader(args.term) {
                return;
            }
            for reply in rx.iter() {
                let rep = match reply {
                    Some(RaftReply::RequestVote(rep)) => rep,
                    _ => continue,
                };
                {
                    let mut st = this.state.lock().unwrap();
                    if st.role != Role::Candidate || st.current_term != args.term {
                        return;
                    }
                    if rep.term > st.current_term {
                        this.step_down(&mut st, rep.term);
                        this.persist(&st);
                        return;
                    }
                }
                if rep.vote_granted {
                    granted += 1;
                }
                if granted >= needed {
                    this.try_become_leader(args.term);
                    return;
                }
            }
        });
    }

    /// Promote to leader if still the candidate of `term`. Initializes the
    /// per-follower progress state and asserts leadership with an immediate
    /// heartbeat round.
    fn try_become_leader(self: &Arc<Self>, term: u64) -> bool {
        let became = {
            let mut st = self.state.lock().unwrap();
            if st.role != Role::Candidate || st.current_term != term {
                false
            } else {
                st.role = Role::Leader;
                let next = st.log.last_index() + 1;
                for p in 0..self.peers.len() {
                    st.next_index[p] = next;
                    st.match_index[p] = 0;
                    st.in_flight[p] = false;
                }
                debug!("raft {}: leader of term {}", self.me, term);
                true
            }
        };
        if became {
            self.broadcast_append_entries();
        }
        became
    }

    // =========================================================================
    // REPLICATION
    // =========================================================================

    /// Heartbeat task: every tick, nudge replication to all followers while
    /// leader. A heartbeat is just an AppendEntries that may be empty.
    fn run_heartbeats(self: Arc<Self>) {
        while !self.killed() {
            self.broadcast_append_entries();
            thread::sleep(HEARTBEAT_INTERVAL);
        }
    }

    /// Launch one replication task per follower that doesn't already have
    /// one in flight.
    fn broadcast_append_entries(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        if self.killed() || st.role != Role::Leader {
            return;
        }
        let term = st.current_term;
        let commit_anchor = st.commit_index;
        for p in 0..self.peers.len() {
            if p == self.me || st.in_flight[p] {
                continue;
            }
            st.in_flight[p] = true;
            let this = self.clone();
            thread::spawn(move || this.replicate(p, term, commit_anchor));
        }
    }

    /// Drive one follower forward: AppendEntries with conflict backoff,
    /// degrading to InstallSnapshot when its next index falls into the
    /// snapshot range. Exactly one of these runs per follower at a time.
    ///
    /// The anchor (`term`, `commit_anchor`) is re-validated under the mutex
    /// after every round trip; any mismatch aborts without touching shared
    /// state.
    fn replicate(self: &Arc<Self>, peer: usize, term: u64, commit_anchor: u64) {
        enum Step {
            Append(AppendEntriesArgs),
            Snapshot(InstallSnapshotArgs),
            Done,
        }

        loop {
            let step = {
                let st = self.state.lock().unwrap();
                if self.killed()
                    || st.role != Role::Leader
                    || st.current_term != term
                    || st.commit_index != commit_anchor
                {
                    Step::Done
                } else if st.next_index[peer] <= st.log.base_index() {
                    Step::Snapshot(InstallSnapshotArgs {
                        term,
                        leader_id: self.me,
                        last_included_index: st.log.base_index(),
                        last_included_term: st
                            .log
                            .term_at(st.log.base_index())
                            .expect("sentinel always present"),
                        data: self.persister.read_snapshot(),
                    })
                } else {
                    let prev_log_index = st.next_index[peer] - 1;
                    let prev_log_term = st
                        .log
                        .term_at(prev_log_index)
                        .expect("next_index stays within the retained log");
                    Step::Append(AppendEntriesArgs {
                        term,
                        leader_id: self.me,
                        prev_log_index,
                        prev_log_term,
                        entries: st.log.slice_from(st.next_index[peer]),
                        leader_commit: st.commit_index,
                    })
                }
            };

            match step {
                Step::Done => break,
                Step::Snapshot(args) => {
                    let sent = self.peers[peer].call(&RaftRequest::InstallSnapshot(args.clone()));
                    let rep = match sent {
                        Some(RaftReply::InstallSnapshot(rep)) => rep,
                        // Unknown outcome; the next tick retries.
                        _ => break,
                    };
                    let mut st = self.state.lock().unwrap();
                    if st.role != Role::Leader || st.current_term != term {
                        break;
                    }
                    if rep.term > st.current_term {
                        self.step_down(&mut st, rep.term);
                        self.persist(&st);
                        break;
                    }
                    st.match_index[peer] = st.match_index[peer].max(args.last_included_index);
                    st.next_index[peer] = args.last_included_index + 1;
                    // The next tick resumes with AppendEntries from here.
                    break;
                }
                Step::Append(args) => {
                    let sent = self.peers[peer].call(&RaftRequest::AppendEntries(args.clone()));
                    let rep = match sent {
                        Some(RaftReply::AppendEntries(rep)) => rep,
                        _ => break,
                    };
                    let mut st = self.state.lock().unwrap();
                    if st.role != Role::Leader
                        || st.current_term != term
                        || st.commit_index != commit_anchor
                    {
                        break;
                    }
                    if rep.term > st.current_term {
                        self.step_down(&mut st, rep.term);
                        self.persist(&st);
                        break;
                    }
                    if st.next_index[peer] != args.prev_log_index + 1 {
                        // Someone else moved the progress marker; stale round.
                        break;
                    }
                    if rep.success {
                        st.match_index[peer] = args.prev_log_index + args.entries.len() as u64;
                        st.next_index[peer] = st.match_index[peer] + 1;
                        self.leader_commit_check(&mut st);
                        break;
                    }
                    // Log inconsistency: back off past the conflicting term
                    // and retry, possibly degrading to a snapshot.
                    st.next_index[peer] = if rep.conflict_index != 0 {
                        rep.conflict_index
                    } else {
                        args.prev_log_index
                    };
                }
            }
        }

        let mut st = self.state.lock().unwrap();
        st.in_flight[peer] = false;
    }

    /// Advance the leader's commit index to the highest current-term index
    /// replicated on a strict majority. Entries from prior terms are never
    /// counted on their own; they commit transitively.
    fn leader_commit_check(&self, st: &mut RaftState) {
        let n = self.peers.len();
        let mut index = st.log.last_index();
        while index > st.commit_index {
            let entry_term = st
                .log
                .term_at(index)
                .expect("uncommitted entries are retained");
            if entry_term < st.current_term {
                break;
            }
            let mut count = 1; // self
            for (p, &matched) in st.match_index.iter().enumerate() {
                if p != self.me && matched >= index {
                    count += 1;
                }
            }
            if count * 2 > n {
                debug!(
                    "raft {}: commit advances {} -> {}",
                    self.me, st.commit_index, index
                );
                st.commit_index = index;
                self.advance_applied(st);
                break;
            }
            index -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_record_round_trip() {
        let blob = b"application-state";
        let record = encode_snapshot_record(42, 7, blob);
        assert_eq!(decode_snapshot_header(&record), Some((42, 7)));
        // The header is two fixed-width fields; everything after is the blob.
        assert_eq!(&record[16..], blob);
    }

    #[test]
    fn test_snapshot_header_rejects_short_record() {
        assert_eq!(decode_snapshot_header(&[1, 2, 3]), None);
    }
}
