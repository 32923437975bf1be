pub mod apply;
pub mod errors;
pub mod log;
pub mod message;
pub mod node;


pub use apply::{ApplyMsg, ApplyQueue};
pub use errors::LogError;
pub use log::RaftLog;
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, Entry, InstallSnapshotArgs, InstallSnapshotReply,
    RaftReply, RaftRequest, RequestVoteArgs, RequestVoteReply,
};
pub use node::{
    decode_snapshot_header, encode_snapshot_record, Raft, Role, ELECTION_TIMEOUT_BASE,
    ELECTION_TIMEOUT_SPAN_MS, HEARTBEAT_INTERVAL,
};
