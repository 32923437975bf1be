pub mod network;
pub mod rpc;

pub use network::Network;
pub use rpc::{ClientEnd, ReplyHandle, ServiceHandle, RPC_TIMEOUT};
