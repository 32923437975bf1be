pub mod message;
pub mod replica;

#[cfg(test)]
mod tests;

pub use message::{
    PbReply, PbRequest, PrepareArgs, PrepareReply, RecoveryArgs, RecoveryReply, StartViewArgs,
    StartViewReply, ViewChangeArgs, ViewChangeReply,
};
pub use replica::{primary_for_view, Replica, Status, PREPARE_WAIT_LIMIT};
