use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareArgs {
    /// The primary's current view.
    pub view: u64,
    /// The primary's commit index, piggybacked.
    pub primary_commit: u64,
    /// The index at which the entry is to be replicated.
    pub index: u64,
    /// The log entry to be replicated.
    pub entry: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareReply {
    /// The backup's current view.
    pub view: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryArgs {
    /// The view the applicant wants to synchronize with.
    pub view: u64,
    /// The applicant's id.
    pub server: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReply {
    /// The responder's view.
    pub view: u64,
    /// The responder's entire log.
    pub entries: Vec<Vec<u8>>,
    /// The responder's commit index.
    pub primary_commit: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangeArgs {
    /// The view being changed into.
    pub view: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangeReply {
    /// The latest view the responder had Normal status in.
    pub last_normal_view: u64,
    /// The responder's log.
    pub log: Vec<Vec<u8>>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartViewArgs {
    /// The view that completed its view change.
    pub view: u64,
    /// The log chosen for the new view.
    pub log: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartViewReply {}

/// Primary-backup RPC requests, as shipped over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PbRequest {
    Prepare(PrepareArgs),
    Recovery(RecoveryArgs),
    ViewChange(ViewChangeArgs),
    StartView(StartViewArgs),
}

/// Primary-backup RPC replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PbReply {
    Prepare(PrepareReply),
    Recovery(RecoveryReply),
    ViewChange(ViewChangeReply),
    StartView(StartViewReply),
}
