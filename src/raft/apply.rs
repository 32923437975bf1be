//! Delivery pipeline from the log to the application.
//!
//! Producers push under the peer mutex into an unbounded channel (the push
//! never blocks), which serializes events and yields the gap-free,
//! duplicate-free index order the application relies on. A dedicated
//! forwarder thread owns the blocking hand-off into the application's
//! channel, so a slow application (or one that calls back into the library
//! while consuming) can never deadlock a protocol handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::debug;

/// One delivery event.
///
/// A `Snapshot` event is a fence: it advances the application's observed
/// index to the snapshot's last-included-index, and command delivery resumes
/// from the next index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    Command { index: u64, command: Vec<u8> },
    Snapshot { data: Vec<u8> },
}

/// The producer half of the delivery pipeline.
pub struct ApplyQueue {
    tx: Sender<ApplyMsg>,
    stopped: Arc<AtomicBool>,
}

impl ApplyQueue {
    /// Start the pipeline, forwarding into the application's channel.
    pub fn new(out: Sender<ApplyMsg>) -> Self {
        let (tx, rx) = unbounded::<ApplyMsg>();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(msg) => {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    if out.send(msg).is_err() {
                        // The application went away; nothing left to deliver to.
                        debug!("apply: consumer disconnected, stopping delivery");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        ApplyQueue { tx, stopped }
    }

    /// Enqueue one event. Never blocks; safe to call under the peer mutex.
    pub fn push(&self, msg: ApplyMsg) {
        let _ = self.tx.send(msg);
    }

    /// Stop the forwarder. In-flight events may or may not be delivered.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_preserves_order_across_snapshot_fence() {
        let (out_tx, out_rx) = unbounded();
        let queue = ApplyQueue::new(out_tx);

        queue.push(ApplyMsg::Command {
            index: 1,
            command: vec![1],
        });
        queue.push(ApplyMsg::Snapshot { data: vec![0xff] });
        queue.push(ApplyMsg::Command {
            index: 9,
            command: vec![9],
        });

        let first = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let third = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            first,
            ApplyMsg::Command {
                index: 1,
                command: vec![1]
            }
        );
        assert_eq!(second, ApplyMsg::Snapshot { data: vec![0xff] });
        assert_eq!(
            third,
            ApplyMsg::Command {
                index: 9,
                command: vec![9]
            }
        );
    }

    #[test]
    fn test_shutdown_stops_forwarding() {
        let (out_tx, out_rx) = unbounded();
        let queue = ApplyQueue::new(out_tx);

        queue.shutdown();
        // Give the forwarder a moment to observe the flag.
        std::thread::sleep(Duration::from_millis(150));
        queue.push(ApplyMsg::Command {
            index: 1,
            command: vec![1],
        });
        assert!(out_rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
