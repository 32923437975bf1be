//! Lossy network simulator.
//!
//! Routes RPCs between a fixed set of node endpoints and injects faults:
//! - message drop (`drop_rate`, applied independently to each leg)
//! - latency injection (`latency` range, per message)
//! - partitions (pairwise, bidirectional)
//! - node kill/revive
//!
//! A dropped request or reply is indistinguishable from a slow server: the
//! caller simply times out and gets an unknown-outcome `None`.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::rpc::{ClientEnd, ServiceHandle};

/// Fault injection settings for the fabric.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability of dropping a message leg (0.0 - 1.0).
    pub drop_rate: f64,
    /// Range of latency to inject per delivered request.
    pub latency: (Duration, Duration),
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig {
            drop_rate: 0.0,
            latency: (Duration::ZERO, Duration::ZERO),
        }
    }
}

/// A raw RPC envelope travelling through the fabric.
///
/// The payload is already encoded; the typed fronts in `rpc.rs` decode it on
/// the far side, so no references can cross the simulated wire.
pub(crate) struct RawRpc {
    pub(crate) from: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) reply: RawReply,
}

/// The reply path of one in-flight RPC.
///
/// Carries the drop/partition decision for the reply leg; the caller is
/// blocked on the other end of `tx` with a timeout.
pub(crate) struct RawReply {
    pub(crate) caller: usize,
    pub(crate) server: usize,
    pub(crate) tx: Sender<Vec<u8>>,
    pub(crate) fabric: Weak<Fabric>,
}

impl RawReply {
    /// Deliver encoded reply bytes back to the caller, subject to faults.
    pub(crate) fn send_bytes(self, data: Vec<u8>) {
        let fabric = match self.fabric.upgrade() {
            Some(f) => f,
            None => return,
        };
        if !fabric.deliverable(self.server, self.caller) || fabric.roll_drop() {
            fabric.note_dropped(self.server);
            return;
        }
        // The caller may already have timed out; a closed slot is fine.
        let _ = self.tx.send(data);
    }
}

/// Shared fabric state: inboxes, fault configuration, counters.
pub(crate) struct Fabric {
    n: usize,
    inboxes: RwLock<Vec<Sender<RawRpc>>>,
    killed: Vec<AtomicBool>,
    /// Pairs that cannot communicate. Entries are inserted in both directions.
    partitions: RwLock<HashSet<(usize, usize)>>,
    config: RwLock<FaultConfig>,
    sent: Vec<AtomicU64>,
    dropped: Vec<AtomicU64>,
    total_calls: AtomicU64,
}

impl Fabric {
    fn new(n: usize) -> (Arc<Fabric>, Vec<Receiver<RawRpc>>) {
        let mut inboxes = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = unbounded();
            inboxes.push(tx);
            receivers.push(rx);
        }
        let fabric = Arc::new(Fabric {
            n,
            inboxes: RwLock::new(inboxes),
            killed: (0..n).map(|_| AtomicBool::new(false)).collect(),
            partitions: RwLock::new(HashSet::new()),
            config: RwLock::new(FaultConfig::default()),
            sent: (0..n).map(|_| AtomicU64::new(0)).collect(),
            dropped: (0..n).map(|_| AtomicU64::new(0)).collect(),
            total_calls: AtomicU64::new(0),
        });
        (fabric, receivers)
    }

    pub(crate) fn n(&self) -> usize {
        self.n
    }

    pub(crate) fn is_killed(&self, node: usize) -> bool {
        self.killed[node].load(Ordering::SeqCst)
    }

    /// Whether a message leg from `from` to `to` can be delivered at all.
    pub(crate) fn deliverable(&self, from: usize, to: usize) -> bool {
        if self.is_killed(from) || self.is_killed(to) {
            return false;
        }
        let partitions = self.partitions.read().unwrap();
        !partitions.contains(&(from, to))
    }

    /// Roll the drop die for one message leg.
    pub(crate) fn roll_drop(&self) -> bool {
        let rate = self.config.read().unwrap().drop_rate;
        rate > 0.0 && rand::thread_rng().gen::<f64>() < rate
    }

    /// Draw a delivery latency from the configured range.
    pub(crate) fn roll_latency(&self) -> Duration {
        let (min, max) = self.config.read().unwrap().latency;
        if max.is_zero() {
            return Duration::ZERO;
        }
        if min == max {
            return min;
        }
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }

    /// Hand a request envelope to the target's inbox.
    pub(crate) fn deliver(&self, target: usize, rpc: RawRpc) {
        let inboxes = self.inboxes.read().unwrap();
        let _ = inboxes[target].send(rpc);
    }

    pub(crate) fn note_call(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_sent(&self, node: usize) {
        self.sent[node].fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_dropped(&self, node: usize) {
        self.dropped[node].fetch_add(1, Ordering::SeqCst);
    }
}

/// The network fabric handle, typed over one engine's request/reply enums.
///
/// Both `Req` and `Rep` round-trip through the crate encoder on every call,
/// so value semantics across the simulated wire are enforced.
pub struct Network<Req, Rep> {
    fabric: Arc<Fabric>,
    _marker: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> Clone for Network<Req, Rep> {
    fn clone(&self) -> Self {
        Network {
            fabric: self.fabric.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Req, Rep> Network<Req, Rep>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Rep: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a network connecting `n` nodes, all initially reachable.
    pub fn new(n: usize) -> Self {
        let (fabric, receivers) = Fabric::new(n);
        // The initial inbox receivers are parked until `service` is called;
        // `service` always installs a fresh channel, so these can be dropped.
        drop(receivers);
        Network {
            fabric,
            _marker: PhantomData,
        }
    }

    /// Number of nodes in the network.
    pub fn len(&self) -> usize {
        self.fabric.n()
    }

    pub fn is_empty(&self) -> bool {
        self.fabric.n() == 0
    }

    /// A client end from `from` to `target`.
    pub fn client(&self, from: usize, target: usize) -> ClientEnd<Req, Rep> {
        ClientEnd::new(self.fabric.clone(), from, target)
    }

    /// Client ends from `me` to every node (including itself), indexed by
    /// node id. This is the `peers` vector an engine is constructed with.
    pub fn peer_ends(&self, me: usize) -> Vec<ClientEnd<Req, Rep>> {
        (0..self.fabric.n()).map(|t| self.client(me, t)).collect()
    }

    /// Install a fresh inbox for `node` and return its service handle.
    ///
    /// Any previous handle for the node is starved from this point on; this
    /// is how a restarted node re-attaches after a crash.
    pub fn service(&self, node: usize) -> ServiceHandle<Req, Rep> {
        let (tx, rx) = unbounded();
        self.fabric.inboxes.write().unwrap()[node] = tx;
        ServiceHandle::new(rx)
    }

    /// Set the per-leg message drop probability.
    pub fn set_drop_rate(&self, rate: f64) {
        self.fabric.config.write().unwrap().drop_rate = rate;
    }

    /// Set the request delivery latency range.
    pub fn set_latency(&self, min: Duration, max: Duration) {
        self.fabric.config.write().unwrap().latency = (min, max);
    }

    /// Cut the link between two nodes, both directions.
    pub fn partition(&self, a: usize, b: usize) {
        let mut partitions = self.fabric.partitions.write().unwrap();
        partitions.insert((a, b));
        partitions.insert((b, a));
    }

    /// Restore the link between two nodes.
    pub fn heal(&self, a: usize, b: usize) {
        let mut partitions = self.fabric.partitions.write().unwrap();
        partitions.remove(&(a, b));
        partitions.remove(&(b, a));
    }

    /// Remove every partition.
    pub fn heal_all(&self) {
        self.fabric.partitions.write().unwrap().clear();
    }

    /// Isolate `node` from every other node.
    pub fn isolate(&self, node: usize) {
        let mut partitions = self.fabric.partitions.write().unwrap();
        for other in 0..self.fabric.n() {
            if other != node {
                partitions.insert((node, other));
                partitions.insert((other, node));
            }
        }
    }

    /// Kill a node: it can no longer send or receive.
    pub fn kill_node(&self, node: usize) {
        self.fabric.killed[node].store(true, Ordering::SeqCst);
    }

    /// Revive a killed node.
    pub fn revive_node(&self, node: usize) {
        self.fabric.killed[node].store(false, Ordering::SeqCst);
    }

    pub fn is_killed(&self, node: usize) -> bool {
        self.fabric.is_killed(node)
    }

    /// Requests a node has put on the wire.
    pub fn sent_count(&self, node: usize) -> u64 {
        self.fabric.sent[node].load(Ordering::SeqCst)
    }

    /// Message legs dropped on a node's behalf (requests and replies).
    pub fn dropped_count(&self, node: usize) -> u64 {
        self.fabric.dropped[node].load(Ordering::SeqCst)
    }

    /// Total `call` invocations across the cluster.
    pub fn total_calls(&self) -> u64 {
        self.fabric.total_calls.load(Ordering::SeqCst)
    }
}

/// Deliver a request after a latency delay without blocking the caller's
/// other traffic. Spawning per delayed message also lets messages overtake
/// each other, which is part of the reordering model.
pub(crate) fn deliver_delayed(fabric: Arc<Fabric>, target: usize, rpc: RawRpc, delay: Duration) {
    thread::spawn(move || {
        thread::sleep(delay);
        fabric.deliver(target, rpc);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping(u64);

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Pong(u64);

    fn echo_server(net: &Network<Ping, Pong>, node: usize) {
        let service = net.service(node);
        thread::spawn(move || {
            while let Some((_from, req, reply)) = service.recv_timeout(Duration::from_secs(5)) {
                reply.send(&Pong(req.0));
            }
        });
    }

    #[test]
    fn test_call_round_trip() {
        let net: Network<Ping, Pong> = Network::new(2);
        echo_server(&net, 1);

        let end = net.client(0, 1);
        assert_eq!(end.call(&Ping(7)), Some(Pong(7)));
        assert_eq!(net.total_calls(), 1);
        assert_eq!(net.sent_count(0), 1);
    }

    #[test]
    fn test_drop_rate_one_loses_everything() {
        let net: Network<Ping, Pong> = Network::new(2);
        echo_server(&net, 1);
        net.set_drop_rate(1.0);

        let end = net.client(0, 1);
        assert_eq!(end.call(&Ping(1)), None);
        assert!(net.dropped_count(0) >= 1);
    }

    #[test]
    fn test_partition_and_heal() {
        let net: Network<Ping, Pong> = Network::new(3);
        echo_server(&net, 2);

        net.partition(0, 2);
        let end = net.client(0, 2);
        assert_eq!(end.call(&Ping(1)), None);

        net.heal(0, 2);
        assert_eq!(end.call(&Ping(2)), Some(Pong(2)));
    }

    #[test]
    fn test_kill_and_revive() {
        let net: Network<Ping, Pong> = Network::new(2);
        echo_server(&net, 1);

        net.kill_node(1);
        let end = net.client(0, 1);
        assert_eq!(end.call(&Ping(1)), None);

        net.revive_node(1);
        // The old service loop still owns the live inbox.
        assert_eq!(end.call(&Ping(2)), Some(Pong(2)));
    }
}
