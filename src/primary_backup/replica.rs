//! Primary-backup replica with view change.
//!
//! Roles are positional: the primary of view `v` is replica `v mod N`. The
//! primary appends and returns immediately while a background task collects
//! a strict majority of Prepare acknowledgments; commit advancement is
//! strictly in order. View change is prompted by an external oracle and
//! reconciles the new view's log from a majority of ViewChange replies.
//!
//! A Prepare that arrives ahead of a gap waits on a condition variable keyed
//! on the log length; if the gap does not close within the wait budget the
//! replica turns to Recovering and pulls the whole state from the current
//! primary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use log::debug;

use crate::net::{ClientEnd, ServiceHandle};

use super::message::{
    PbReply, PbRequest, PrepareArgs, PrepareReply, RecoveryArgs, RecoveryReply, StartViewArgs,
    StartViewReply, ViewChangeArgs, ViewChangeReply,
};

/// How many condvar waits a gapped Prepare tolerates before the replica
/// gives up on in-order delivery and recovers from the primary.
pub const PREPARE_WAIT_LIMIT: u32 = 100;

/// Width of one Prepare gap wait.
const PREPARE_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Replica status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Serving the protocol in the current view.
    Normal,
    /// A view change that includes this replica is in progress.
    ViewChange,
    /// Pulling state from the primary after falling behind.
    Recovering,
}

/// The primary of `view` in a cluster of `n` replicas.
pub fn primary_for_view(view: u64, n: usize) -> usize {
    (view % n as u64) as usize
}

/// Everything guarded by the replica mutex.
struct ReplicaState {
    current_view: u64,
    status: Status,
    /// The latest view this replica had Normal status in.
    last_normal_view: u64,
    /// The command log; index 0 holds a dummy sentinel entry.
    log: Vec<Vec<u8>>,
    /// Entries at or below this index are committed.
    commit_index: u64,
}

struct ReplicaInner {
    me: usize,
    peers: Vec<ClientEnd<PbRequest, PbReply>>,
    state: Mutex<ReplicaState>,
    /// Signalled whenever the log grows or the commit index moves.
    progress: Condvar,
    killed: Arc<AtomicBool>,
}

/// A primary-backup replica handle. Cloning shares the replica.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl Replica {
    /// Construct a replica in `starting_view` and attach it to the network.
    pub fn new(
        peers: Vec<ClientEnd<PbRequest, PbReply>>,
        me: usize,
        starting_view: u64,
        service: ServiceHandle<PbRequest, PbReply>,
    ) -> Replica {
        let state = ReplicaState {
            current_view: starting_view,
            status: Status::Normal,
            last_normal_view: starting_view,
            log: vec![Vec::new()],
            commit_index: 0,
        };
        let inner = Arc::new(ReplicaInner {
            me,
            peers,
            state: Mutex::new(state),
            progress: Condvar::new(),
            killed: Arc::new(AtomicBool::new(false)),
        });
        let dispatch = inner.clone();
        service.spawn_dispatch(inner.killed.clone(), move |_from, req| dispatch.handle(req));
        Replica { inner }
    }

    /// Replicate a command. Only the primary of the current view accepts;
    /// it appends locally and returns `Some((index, view))` immediately,
    /// while replication proceeds in the background. `None` means this
    /// replica is not the primary (or is not Normal).
    pub fn start(&self, command: Vec<u8>) -> Option<(u64, u64)> {
        if self.inner.killed() {
            return None;
        }
        let (index, view, commit) = {
            let mut st = self.inner.state.lock().unwrap();
            if st.status != Status::Normal {
                return None;
            }
            if primary_for_view(st.current_view, self.inner.peers.len()) != self.inner.me {
                return None;
            }
            st.last_normal_view = st.current_view;
            st.log.push(command.clone());
            (
                (st.log.len() - 1) as u64,
                st.current_view,
                st.commit_index,
            )
        };
        let this = self.inner.clone();
        thread::spawn(move || this.issue_prepares(view, command, index, commit));
        Some((index, view))
    }

    /// Whether this replica considers `index` committed.
    pub fn is_committed(&self, index: u64) -> bool {
        let st = self.inner.state.lock().unwrap();
        st.commit_index >= index
    }

    /// The current view and whether it has Normal status here.
    pub fn view_status(&self) -> (u64, bool) {
        let st = self.inner.state.lock().unwrap();
        (st.current_view, st.status == Status::Normal)
    }

    /// The command replicated at `index`, if the log reaches that far.
    pub fn entry_at(&self, index: u64) -> Option<Vec<u8>> {
        let st = self.inner.state.lock().unwrap();
        st.log.get(index as usize).cloned()
    }

    /// Length of the log, counting the sentinel.
    pub fn log_len(&self) -> u64 {
        let st = self.inner.state.lock().unwrap();
        st.log.len() as u64
    }

    /// Quiesce the replica. Idempotent.
    pub fn kill(&self) {
        if !self.inner.killed.swap(true, Ordering::SeqCst) {
            // Unpark any handler waiting out a Prepare gap.
            self.inner.progress.notify_all();
        }
    }

    /// External oracle: prompt the primary of `new_view` to run the view
    /// change protocol. Ignored on every other replica and for stale views.
    /// Returns without waiting for the change to complete.
    pub fn prompt_view_change(&self, new_view: u64) {
        let inner = &self.inner;
        if primary_for_view(new_view, inner.peers.len()) != inner.me {
            return;
        }
        {
            let st = inner.state.lock().unwrap();
            if new_view <= st.current_view {
                return;
            }
        }
        let this = inner.clone();
        thread::spawn(move || this.run_view_change(new_view));
    }
}

impl ReplicaInner {
    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn handle(&self, req: PbRequest) -> PbReply {
        match req {
            PbRequest::Prepare(args) => PbReply::Prepare(self.handle_prepare(args)),
            PbRequest::Recovery(args) => PbReply::Recovery(self.handle_recovery(args)),
            PbRequest::ViewChange(args) => PbReply::ViewChange(self.handle_view_change(args)),
            PbRequest::StartView(args) => PbReply::StartView(self.handle_start_view(args)),
        }
    }

    // =========================================================================
    // REPLICATION (primary side)
    // =========================================================================

    /// Replicate one index to the backups and, on a strict majority of
    /// acknowledgments, advance the commit index in order.
    fn issue_prepares(&self, view: u64, command: Vec<u8>, index: u64, commit: u64) {
        let n = self.peers.len();
        let (tx, rx) = unbounded();
        for p in 0..n {
            if p == self.me {
                continue;
            }
            let end = self.peers[p].clone();
            let tx = tx.clone();
            let request = PbRequest::Prepare(PrepareArgs {
                view,
                primary_commit: commit,
                index,
                entry: command.clone(),
            });
            thread::spawn(move || {
                let _ = tx.send(end.call(&request));
            });
        }
        drop(tx);

        let majority = n / 2;
        let mut successes = 0usize;
        let mut stale = false;
        for reply in rx.iter() {
            if let Some(PbReply::Prepare(rep)) = reply {
                if rep.success {
                    successes += 1;
                } else if rep.view > view {
                    // A newer view exists; this replication attempt is void.
                    stale = true;
                }
            }
            if successes >= majority {
                break;
            }
        }

        if successes >= majority {
            self.commit_in_order(view, index);
        } else if !stale && !self.killed() {
            // Lost too many acknowledgments to the network; try the same
            // index again unless the world has moved on.
            let retry = {
                let st = self.state.lock().unwrap();
                st.current_view == view && st.status == Status::Normal
            };
            if retry {
                debug!("replica {}: re-preparing index {}", self.me, index);
                self.issue_prepares(view, command, index, commit);
            }
        }
    }

    /// Commit `index` once every lower index has committed. The wait sits on
    /// the progress condvar; earlier indices' collectors wake it as they
    /// commit, so the chain always drains front to back.
    fn commit_in_order(&self, view: u64, index: u64) {
        let mut st = self.state.lock().unwrap();
        loop {
            if self.killed() || st.current_view != view {
                return;
            }
            if st.commit_index >= index {
                // Covered by a later view change or a duplicate round.
                return;
            }
            if st.commit_index + 1 == index {
                st.commit_index = index;
                self.progress.notify_all();
                return;
            }
            st = self
                .progress
                .wait_timeout(st, PREPARE_WAIT_INTERVAL)
                .unwrap()
                .0;
        }
    }

    // =========================================================================
    // RPC HANDLERS
    // =========================================================================

    /// Accept a Prepare iff the view matches and the entry lands exactly at
    /// the end of the log. A gap waits for earlier Prepares to close it; an
    /// exhausted wait budget sends the replica into recovery.
    fn handle_prepare(&self, args: PrepareArgs) -> PrepareReply {
        let mut st = self.state.lock().unwrap();
        let mut waits = 0u32;
        loop {
            if st.current_view > args.view {
                return PrepareReply {
                    view: st.current_view,
                    success: false,
                };
            }
            if st.current_view == args.view {
                let len = st.log.len() as u64;
                if len == args.index {
                    st.last_normal_view = st.current_view;
                    st.log.push(args.entry.clone());
                    if args.primary_commit > st.commit_index {
                        // Bounded by our own tail; the rest arrives with
                        // later Prepares.
                        st.commit_index = args.primary_commit.min(st.log.len() as u64 - 1);
                    }
                    self.progress.notify_all();
                    return PrepareReply {
                        view: args.view,
                        success: true,
                    };
                }
                if len > args.index {
                    // Duplicate of an entry we already hold; acknowledge
                    // without modifying anything.
                    return PrepareReply {
                        view: args.view,
                        success: true,
                    };
                }
            }
            // Either our log has a gap below args.index, or our view is
            // behind. Wait for the protocol to close the distance.
            if waits >= PREPARE_WAIT_LIMIT || self.killed() {
                break;
            }
            waits += 1;
            st = self
                .progress
                .wait_timeout(st, PREPARE_WAIT_INTERVAL)
                .unwrap()
                .0;
        }

        if self.killed() {
            return PrepareReply {
                view: st.current_view,
                success: false,
            };
        }
        // The gap never closed: pull the whole state from the primary of the
        // view this Prepare came from.
        debug!(
            "replica {}: prepare gap at index {} unresolved, recovering",
            self.me, args.index
        );
        st.status = Status::Recovering;
        drop(st);
        self.recover(args.view);
        let st = self.state.lock().unwrap();
        PrepareReply {
            view: st.current_view,
            success: false,
        }
    }

    /// Pull log, view, and commit index from the primary of `view` and
    /// install them atomically.
    fn recover(&self, view: u64) {
        let target = primary_for_view(view, self.peers.len());
        let args = RecoveryArgs {
            view,
            server: self.me,
        };
        let reply = self.peers[target].call(&PbRequest::Recovery(args));
        if let Some(PbReply::Recovery(rep)) = reply {
            if rep.success {
                let mut st = self.state.lock().unwrap();
                // Views never move backwards, even through recovery.
                if rep.view >= st.current_view {
                    debug!(
                        "replica {}: recovered to view {} ({} entries, commit {})",
                        self.me,
                        rep.view,
                        rep.entries.len(),
                        rep.primary_commit
                    );
                    st.current_view = rep.view;
                    st.last_normal_view = rep.view;
                    st.log = rep.entries;
                    st.commit_index = rep.primary_commit;
                    st.status = Status::Normal;
                    self.progress.notify_all();
                }
            }
        }
    }

    /// Serve a recovery pull. Only a Normal replica's state is safe to copy.
    fn handle_recovery(&self, _args: RecoveryArgs) -> RecoveryReply {
        let st = self.state.lock().unwrap();
        if st.status == Status::Normal {
            RecoveryReply {
                view: st.current_view,
                entries: st.log.clone(),
                primary_commit: st.commit_index,
                success: true,
            }
        } else {
            RecoveryReply {
                view: st.current_view,
                entries: Vec::new(),
                primary_commit: 0,
                success: false,
            }
        }
    }

    // =========================================================================
    // VIEW CHANGE
    // =========================================================================

    /// Broadcast ViewChange for `new_view`, reconcile the winning log from a
    /// strict majority of successful replies, and establish the view with
    /// StartView.
    fn run_view_change(&self, new_view: u64) {
        let n = self.peers.len();
        let (tx, rx) = unbounded();
        // Every replica votes, this one included: the RPC goes to self too.
        for p in 0..n {
            let end = self.peers[p].clone();
            let tx = tx.clone();
            let request = PbRequest::ViewChange(ViewChangeArgs { view: new_view });
            thread::spawn(move || {
                let _ = tx.send(end.call(&request));
            });
        }
        drop(tx);

        let majority = n / 2 + 1;
        let mut successes: Vec<ViewChangeReply> = Vec::new();
        for reply in rx.iter() {
            if let Some(PbReply::ViewChange(rep)) = reply {
                if rep.success {
                    successes.push(rep);
                }
            }
            if successes.len() >= majority {
                break;
            }
        }

        let log = match determine_new_view_log(&successes, majority) {
            Some(log) => log,
            None => {
                debug!(
                    "replica {}: view change to {} failed, {} of {} votes",
                    self.me,
                    new_view,
                    successes.len(),
                    majority
                );
                return;
            }
        };

        debug!(
            "replica {}: establishing view {} with {} entries",
            self.me,
            new_view,
            log.len()
        );
        for p in 0..n {
            let end = self.peers[p].clone();
            let request = PbRequest::StartView(StartViewArgs {
                view: new_view,
                log: log.clone(),
            });
            thread::spawn(move || {
                let _ = end.call(&request);
            });
        }
    }

    /// Vote for a view change into a strictly newer view, surrendering the
    /// log for reconciliation.
    fn handle_view_change(&self, args: ViewChangeArgs) -> ViewChangeReply {
        let mut st = self.state.lock().unwrap();
        if st.current_view < args.view {
            st.status = Status::ViewChange;
            ViewChangeReply {
                last_normal_view: st.last_normal_view,
                log: st.log.clone(),
                success: true,
            }
        } else {
            ViewChangeReply {
                last_normal_view: st.last_normal_view,
                log: Vec::new(),
                success: false,
            }
        }
    }

    /// Install the new view: adopt its log wholesale and consider the whole
    /// prefix committed, per this protocol's semantics.
    fn handle_start_view(&self, args: StartViewArgs) -> StartViewReply {
        let mut st = self.state.lock().unwrap();
        if st.current_view <= args.view {
            st.current_view = args.view;
            st.log = args.log;
            st.last_normal_view = args.view;
            st.status = Status::Normal;
            st.commit_index = st.log.len() as u64 - 1;
            self.progress.notify_all();
            debug!(
                "replica {}: entered view {} with {} entries",
                self.me,
                st.current_view,
                st.log.len()
            );
        }
        StartViewReply {}
    }
}

/// Choose the log for a new view from the successful ViewChange replies:
/// the one with the largest `last_normal_view`, longest log breaking ties.
/// `None` without a strict majority of replies.
fn determine_new_view_log(
    successes: &[ViewChangeReply],
    majority: usize,
) -> Option<Vec<Vec<u8>>> {
    if successes.len() < majority {
        return None;
    }
    let mut best: Option<&ViewChangeReply> = None;
    for rep in successes {
        best = match best {
            None => Some(rep),
            Some(cur) => {
                if rep.last_normal_view > cur.last_normal_view
                    || (rep.last_normal_view == cur.last_normal_view
                        && rep.log.len() > cur.log.len())
                {
                    Some(rep)
                } else {
                    Some(cur)
                }
            }
        };
    }
    best.map(|rep| rep.log.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(last_normal_view: u64, log_len: usize) -> ViewChangeReply {
        ViewChangeReply {
            last_normal_view,
            log: (0..log_len).map(|i| vec![i as u8]).collect(),
            success: true,
        }
    }

    #[test]
    fn test_primary_rotates_with_view() {
        assert_eq!(primary_for_view(0, 3), 0);
        assert_eq!(primary_for_view(1, 3), 1);
        assert_eq!(primary_for_view(3, 3), 0);
        assert_eq!(primary_for_view(7, 5), 2);
    }

    #[test]
    fn test_new_view_log_needs_majority() {
        assert!(determine_new_view_log(&[reply(0, 1)], 2).is_none());
    }

    #[test]
    fn test_new_view_log_prefers_latest_normal_view() {
        let chosen = determine_new_view_log(&[reply(2, 2), reply(3, 1), reply(1, 5)], 2)
            .unwrap();
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn test_new_view_log_ties_break_by_length() {
        let chosen = determine_new_view_log(&[reply(2, 2), reply(2, 4), reply(2, 3)], 3)
            .unwrap();
        assert_eq!(chosen.len(), 4);
    }
}
