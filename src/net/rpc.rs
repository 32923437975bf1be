//! RPC surface over the simulated fabric.
//!
//! `ClientEnd::call` has unknown-outcome semantics: `None` may mean a lost
//! request, a lost reply, a dead or partitioned server, or a server that was
//! simply too slow. Callers must treat `None` as "retry later", never as a
//! definite failure.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::network::{deliver_delayed, Fabric, RawReply, RawRpc};

/// Upper bound on one RPC round trip. A dropped leg costs the caller this
/// long before `call` reports the unknown outcome.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(300);

/// A caller's handle for issuing RPCs to one target node.
pub struct ClientEnd<Req, Rep> {
    fabric: Arc<Fabric>,
    me: usize,
    target: usize,
    _marker: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> Clone for ClientEnd<Req, Rep> {
    fn clone(&self) -> Self {
        ClientEnd {
            fabric: self.fabric.clone(),
            me: self.me,
            target: self.target,
            _marker: PhantomData,
        }
    }
}

impl<Req, Rep> ClientEnd<Req, Rep>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Rep: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(fabric: Arc<Fabric>, me: usize, target: usize) -> Self {
        ClientEnd {
            fabric,
            me,
            target,
            _marker: PhantomData,
        }
    }

    /// The node this end sends to.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Issue one RPC and wait for its reply.
    ///
    /// Returns `None` on any unknown outcome. Blocks for at most
    /// [`RPC_TIMEOUT`].
    pub fn call(&self, req: &Req) -> Option<Rep> {
        let fabric = &self.fabric;
        fabric.note_call();
        if fabric.is_killed(self.me) {
            return None;
        }
        let data = match bincode::serialize(req) {
            Ok(data) => data,
            Err(e) => {
                warn!("rpc: request encode failed: {}", e);
                return None;
            }
        };

        let (reply_tx, reply_rx) = bounded(1);
        if fabric.deliverable(self.me, self.target) && !fabric.roll_drop() {
            fabric.note_sent(self.me);
            let rpc = RawRpc {
                from: self.me,
                data,
                reply: RawReply {
                    caller: self.me,
                    server: self.target,
                    tx: reply_tx,
                    fabric: Arc::downgrade(fabric),
                },
            };
            let delay = fabric.roll_latency();
            if delay.is_zero() {
                fabric.deliver(self.target, rpc);
            } else {
                deliver_delayed(fabric.clone(), self.target, rpc, delay);
            }
        } else {
            fabric.note_dropped(self.me);
        }

        // A dropped request leg leaves nothing to wait for; the timeout is
        // what makes that indistinguishable from a slow server.
        match reply_rx.recv_timeout(RPC_TIMEOUT) {
            Ok(bytes) => bincode::deserialize(&bytes).ok(),
            Err(_) => None,
        }
    }
}

/// The reply slot of one incoming RPC.
pub struct ReplyHandle<Rep> {
    raw: RawReply,
    _marker: PhantomData<fn(Rep)>,
}

impl<Rep: Serialize> ReplyHandle<Rep> {
    /// Send the reply. Consumes the handle; each RPC gets exactly one reply.
    pub fn send(self, rep: &Rep) {
        match bincode::serialize(rep) {
            Ok(bytes) => self.raw.send_bytes(bytes),
            Err(e) => warn!("rpc: reply encode failed: {}", e),
        }
    }
}

/// The server side of a node: a stream of `(from, request, reply)` triples.
pub struct ServiceHandle<Req, Rep> {
    rx: Receiver<RawRpc>,
    _marker: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> ServiceHandle<Req, Rep>
where
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
{
    pub(crate) fn new(rx: Receiver<RawRpc>) -> Self {
        ServiceHandle {
            rx,
            _marker: PhantomData,
        }
    }

    /// Wait up to `timeout` for the next incoming request.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(usize, Req, ReplyHandle<Rep>)> {
        let rpc = self.rx.recv_timeout(timeout).ok()?;
        match bincode::deserialize(&rpc.data) {
            Ok(req) => Some((
                rpc.from,
                req,
                ReplyHandle {
                    raw: rpc.reply,
                    _marker: PhantomData,
                },
            )),
            Err(e) => {
                warn!("rpc: request decode failed: {}", e);
                None
            }
        }
    }

    /// Run a dispatch loop on a background thread, spawning a short-lived
    /// handler thread per request. Handlers may block (on locks or condition
    /// variables) without holding up later requests.
    ///
    /// The loop exits once `killed` is set.
    pub fn spawn_dispatch<F>(self, killed: Arc<AtomicBool>, handler: F) -> thread::JoinHandle<()>
    where
        F: Fn(usize, Req) -> Rep + Send + Sync + 'static,
    {
        thread::spawn(move || {
            let handler = Arc::new(handler);
            while !killed.load(Ordering::SeqCst) {
                if let Some((from, req, reply)) = self.recv_timeout(Duration::from_millis(50)) {
                    let handler = handler.clone();
                    thread::spawn(move || {
                        reply.send(&(*handler)(from, req));
                    });
                }
            }
        })
    }
}
