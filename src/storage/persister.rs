//! Atomic persistence store.
//!
//! Holds a peer's serialized Raft state and its snapshot blob. Writes are
//! atomic overwrites: a reader sees either the previous value or the new one,
//! never a mix. `save_state_and_snapshot` updates both records in one
//! critical section, which is what makes log compaction crash-safe.

use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Stored {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// Per-peer durable store, shared by handle.
///
/// Cloning the handle shares the store; `clone_state` deep-copies it, which
/// is how tests model a crash: the copy holds exactly what was persisted at
/// that instant and nothing the dying peer did afterwards.
#[derive(Clone)]
pub struct Persister {
    inner: Arc<Mutex<Stored>>,
}

impl Persister {
    pub fn new() -> Self {
        Persister {
            inner: Arc::new(Mutex::new(Stored::default())),
        }
    }

    /// Overwrite the Raft state record.
    pub fn save_raft_state(&self, data: Vec<u8>) {
        self.inner.lock().unwrap().raft_state = data;
    }

    pub fn read_raft_state(&self) -> Vec<u8> {
        self.inner.lock().unwrap().raft_state.clone()
    }

    /// Overwrite the snapshot record.
    pub fn save_snapshot(&self, data: Vec<u8>) {
        self.inner.lock().unwrap().snapshot = data;
    }

    pub fn read_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    /// Overwrite both records atomically.
    pub fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        let mut stored = self.inner.lock().unwrap();
        stored.raft_state = state;
        stored.snapshot = snapshot;
    }

    /// Size of the persisted Raft state, for snapshot-trigger heuristics.
    pub fn raft_state_size(&self) -> usize {
        self.inner.lock().unwrap().raft_state.len()
    }

    pub fn snapshot_size(&self) -> usize {
        self.inner.lock().unwrap().snapshot.len()
    }

    /// Deep copy of the store as persisted right now.
    pub fn clone_state(&self) -> Persister {
        let stored = self.inner.lock().unwrap();
        Persister {
            inner: Arc::new(Mutex::new(Stored {
                raft_state: stored.raft_state.clone(),
                snapshot: stored.snapshot.clone(),
            })),
        }
    }
}

impl Default for Persister {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let p = Persister::new();
        assert!(p.read_raft_state().is_empty());

        p.save_raft_state(vec![1, 2, 3]);
        p.save_snapshot(vec![9]);
        assert_eq!(p.read_raft_state(), vec![1, 2, 3]);
        assert_eq!(p.read_snapshot(), vec![9]);
        assert_eq!(p.raft_state_size(), 3);
        assert_eq!(p.snapshot_size(), 1);
    }

    #[test]
    fn test_clone_state_is_independent() {
        let p = Persister::new();
        p.save_raft_state(vec![1]);

        let copy = p.clone_state();
        p.save_raft_state(vec![2, 2]);

        assert_eq!(copy.read_raft_state(), vec![1]);
        assert_eq!(p.read_raft_state(), vec![2, 2]);
    }

    #[test]
    fn test_shared_handle_sees_writes() {
        let p = Persister::new();
        let q = p.clone();
        p.save_state_and_snapshot(vec![5], vec![6]);
        assert_eq!(q.read_raft_state(), vec![5]);
        assert_eq!(q.read_snapshot(), vec![6]);
    }
}
