use serde::{Deserialize, Serialize};

/// One log entry. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Term in which the entry was created by a leader.
    pub term: u64,
    /// Opaque command payload; carried through the protocol uninspected.
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term.
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate_id: usize,
    /// Index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Receiver's term, for the candidate to step down on.
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term.
    pub term: u64,
    pub leader_id: usize,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<Entry>,
    /// Leader's commit index, piggybacked for followers to learn from.
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Receiver's term, for the leader to step down on.
    pub term: u64,
    /// True if the follower stored everything up through the request.
    pub success: bool,
    /// On log inconsistency, the first index of the conflicting term, so the
    /// leader can skip the whole run in one backoff. 0 when unset.
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term.
    pub term: u64,
    pub leader_id: usize,
    /// The snapshot replaces all entries up through this index.
    pub last_included_index: u64,
    /// Term of the entry at `last_included_index`.
    pub last_included_term: u64,
    /// The snapshot record: header plus raw application blob.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Raft RPC requests, as shipped over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

/// Raft RPC replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
}
