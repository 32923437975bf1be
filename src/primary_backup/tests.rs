//! Primary-backup cluster scenarios.

use std::thread;
use std::time::{Duration, Instant};

use crate::net::Network;

use super::message::{PbReply, PbRequest};
use super::replica::{primary_for_view, Replica};

struct PbCluster {
    net: Network<PbRequest, PbReply>,
    replicas: Vec<Replica>,
}

impl PbCluster {
    fn new(n: usize) -> PbCluster {
        let net: Network<PbRequest, PbReply> = Network::new(n);
        let replicas = (0..n)
            .map(|i| Replica::new(net.peer_ends(i), i, 0, net.service(i)))
            .collect();
        PbCluster { net, replicas }
    }

    /// Poll `pred` until it holds or the deadline passes.
    fn wait_for<F: Fn() -> bool>(&self, what: &str, pred: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for PbCluster {
    fn drop(&mut self) {
        for replica in &self.replicas {
            replica.kill();
        }
    }
}

/// The view-0 primary replicates and commits in order; backups hold the
/// same entries.
#[test]
fn test_primary_replicates_and_commits() {
    let cluster = PbCluster::new(3);
    let primary = &cluster.replicas[0];

    assert_eq!(primary.start(b"a".to_vec()), Some((1, 0)));
    assert_eq!(primary.start(b"b".to_vec()), Some((2, 0)));

    cluster.wait_for("primary commit", || primary.is_committed(2));
    for backup in &cluster.replicas[1..] {
        cluster.wait_for("backup log", || backup.log_len() == 3);
        assert_eq!(backup.entry_at(1), Some(b"a".to_vec()));
        assert_eq!(backup.entry_at(2), Some(b"b".to_vec()));
    }
}

/// Only the primary of the current view accepts commands.
#[test]
fn test_start_rejected_off_primary() {
    let cluster = PbCluster::new(3);
    assert!(cluster.replicas[1].start(b"x".to_vec()).is_none());
    assert!(cluster.replicas[2].start(b"x".to_vec()).is_none());
    assert!(cluster.replicas[0].start(b"x".to_vec()).is_some());
}

/// An externally prompted view change moves the cluster to view 1 with the
/// replicated log intact and its whole prefix committed.
#[test]
fn test_view_change_preserves_log() {
    let cluster = PbCluster::new(3);
    let primary = &cluster.replicas[0];
    primary.start(b"a".to_vec());
    primary.start(b"b".to_vec());
    cluster.wait_for("initial commit", || primary.is_committed(2));

    assert_eq!(primary_for_view(1, 3), 1);
    cluster.replicas[1].prompt_view_change(1);

    cluster.wait_for("view 1 everywhere", || {
        cluster
            .replicas
            .iter()
            .all(|r| r.view_status() == (1, true))
    });
    for replica in &cluster.replicas {
        assert_eq!(replica.log_len(), 3);
        assert_eq!(replica.entry_at(1), Some(b"a".to_vec()));
        assert_eq!(replica.entry_at(2), Some(b"b".to_vec()));
        assert!(replica.is_committed(2));
    }

    // The new primary takes over command processing.
    assert!(cluster.replicas[0].start(b"c".to_vec()).is_none());
    assert_eq!(cluster.replicas[1].start(b"c".to_vec()), Some((3, 1)));
}

/// Views never move backwards; stale prompts are ignored.
#[test]
fn test_view_monotonicity() {
    let cluster = PbCluster::new(3);
    cluster.replicas[1].prompt_view_change(1);
    cluster.wait_for("view 1", || {
        cluster
            .replicas
            .iter()
            .all(|r| r.view_status() == (1, true))
    });

    // Stale and duplicate prompts change nothing.
    cluster.replicas[0].prompt_view_change(0);
    cluster.replicas[1].prompt_view_change(1);
    thread::sleep(Duration::from_millis(200));
    for replica in &cluster.replicas {
        assert_eq!(replica.view_status(), (1, true));
    }

    // A newer view still goes through.
    assert_eq!(primary_for_view(4, 3), 1);
    cluster.replicas[1].prompt_view_change(4);
    cluster.wait_for("view 4", || {
        cluster
            .replicas
            .iter()
            .all(|r| r.view_status() == (4, true))
    });
}

/// A backup that missed a stretch of Prepares hits the gap wait, gives up,
/// and pulls the whole state from the primary.
#[test]
fn test_gap_triggers_recovery() {
    let cluster = PbCluster::new(3);
    let primary = &cluster.replicas[0];

    // Replica 2 misses the first two entries.
    cluster.net.partition(0, 2);
    primary.start(b"a".to_vec());
    primary.start(b"b".to_vec());
    cluster.wait_for("commit without replica 2", || primary.is_committed(2));
    assert_eq!(cluster.replicas[2].log_len(), 1);

    // The next entry arrives with a gap and forces replica 2 to recover.
    cluster.net.heal(0, 2);
    primary.start(b"c".to_vec());

    cluster.wait_for("replica 2 catches up", || {
        cluster.replicas[2].entry_at(3) == Some(b"c".to_vec())
    });
    assert_eq!(cluster.replicas[2].entry_at(1), Some(b"a".to_vec()));
    assert_eq!(cluster.replicas[2].entry_at(2), Some(b"b".to_vec()));

    // Once recovered, in-order acceptance resumes without recovery.
    primary.start(b"d".to_vec());
    cluster.wait_for("replica 2 gets d", || {
        cluster.replicas[2].entry_at(4) == Some(b"d".to_vec())
    });
}

/// A primary cut out of a view change keeps accepting commands, but replies
/// carrying the higher view void them; the next view change discards its
/// unreplicated tail.
#[test]
fn test_stale_primary_is_superseded() {
    let cluster = PbCluster::new(3);
    let old_primary = &cluster.replicas[0];
    old_primary.start(b"a".to_vec());
    cluster.wait_for("initial commit", || old_primary.is_committed(1));

    // View change to 1 happens without replica 0.
    cluster.net.partition(0, 1);
    cluster.net.partition(0, 2);
    cluster.replicas[1].prompt_view_change(1);
    cluster.wait_for("view 1 on the majority", || {
        cluster.replicas[1].view_status() == (1, true)
            && cluster.replicas[2].view_status() == (1, true)
    });

    cluster.net.heal_all();
    // The stale primary still believes in view 0 and accepts a command,
    // but the backups' higher view voids the replication attempt.
    assert_eq!(old_primary.start(b"x".to_vec()), Some((2, 0)));
    thread::sleep(Duration::from_millis(500));
    assert!(!old_primary.is_committed(2));

    // The next view change folds replica 0 back in; the chosen log comes
    // from the replicas that were Normal in view 1, so "x" is discarded.
    assert_eq!(primary_for_view(2, 3), 2);
    cluster.replicas[2].prompt_view_change(2);
    cluster.wait_for("view 2 everywhere", || {
        cluster
            .replicas
            .iter()
            .all(|r| r.view_status() == (2, true))
    });
    for replica in &cluster.replicas {
        assert_eq!(replica.log_len(), 2);
        assert_eq!(replica.entry_at(1), Some(b"a".to_vec()));
        assert!(replica.is_committed(1));
    }
}
