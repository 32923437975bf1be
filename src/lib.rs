//! replog: a replicated log library for a fixed set of peers over an
//! unreliable message-passing network.
//!
//! Two replication engines coexist:
//!
//! - [`raft`]: leader-based consensus with randomized leader election, log
//!   replication with conflict backoff, persistent crash recovery, snapshot
//!   compaction, and in-order delivery to an application state machine.
//! - [`primary_backup`]: a simplified viewstamped primary-backup protocol
//!   with an externally-prompted view change.
//!
//! The engines are exercised against in-process collaborators: [`net`]
//! provides an RPC fabric with a lossy-network simulator (drops, latency,
//! partitions, node kill/revive), and [`storage`] provides an atomic
//! persistence store with copy-on-restart semantics for crash tests.

pub mod net;
pub mod primary_backup;
pub mod raft;
pub mod storage;

pub use net::{ClientEnd, Network, ReplyHandle, ServiceHandle};
pub use primary_backup::{Replica, Status};
pub use raft::{ApplyMsg, Raft, Role};
pub use storage::Persister;
