//! Active retransmission of multicast messages.
//!
//! Every outbound message that needs acknowledgement is owned by the
//! retransmitter: it is sent once immediately and then re-sent on the
//! configured interval to every destination that has not been crossed
//! off. Crossing off the last destination finalizes the message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use crate::paxos::messages::Message;
use crate::paxos::network::Network;
use crate::paxos::ordering::ReplicaId;

enum Op {
    Start {
        id: u64,
        message: Box<Message>,
        targets: Vec<ReplicaId>,
    },
    StopTarget {
        id: u64,
        target: ReplicaId,
    },
    Stop {
        id: u64,
    },
    Shutdown,
}

/// A message under active retransmission.
///
/// Dropping the handle does not stop retransmission; `stop` must be
/// called from the owning protocol when the message is acknowledged or
/// abandoned.
pub struct RetransmittedMessage {
    id: u64,
    tx: Sender<Op>,
}

impl RetransmittedMessage {
    /// Crosses `target` off; the message is no longer sent to it.
    pub fn stop_target(&self, target: ReplicaId) {
        let _ = self.tx.send(Op::StopTarget {
            id: self.id,
            target,
        });
    }

    /// Cancels the message entirely.
    pub fn stop(&self) {
        let _ = self.tx.send(Op::Stop { id: self.id });
    }
}

/// Cloneable front of the retransmission worker.
#[derive(Clone)]
pub struct RetransmitterHandle {
    tx: Sender<Op>,
    next_id: Arc<AtomicU64>,
}

impl RetransmitterHandle {
    /// Starts transmitting `message` to `targets` until each is
    /// stopped. The first send happens on the worker right away.
    pub fn start_transmitting(
        &self,
        message: Message,
        targets: Vec<ReplicaId>,
    ) -> RetransmittedMessage {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Op::Start {
            id,
            message: Box::new(message),
            targets,
        });
        RetransmittedMessage { id, tx: self.tx.clone() }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Op::Shutdown);
    }
}

struct Entry {
    message: Box<Message>,
    targets: Vec<ReplicaId>,
}

/// Owns the worker thread re-sending unacknowledged messages.
pub struct ActiveRetransmitter {
    handle: RetransmitterHandle,
    join: Option<JoinHandle<()>>,
}

impl ActiveRetransmitter {
    pub fn new(name: &str, network: Arc<dyn Network>, interval: Duration) -> Self {
        let (tx, rx) = unbounded();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(network, rx, interval))
            .expect("failed to spawn retransmitter thread");

        ActiveRetransmitter {
            handle: RetransmitterHandle {
                tx,
                next_id: Arc::new(AtomicU64::new(0)),
            },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> RetransmitterHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(network: Arc<dyn Network>, rx: Receiver<Op>, interval: Duration) {
    let mut entries: HashMap<u64, Entry> = HashMap::new();
    let mut next_tick = Instant::now() + interval;

    loop {
        let now = Instant::now();
        if now >= next_tick {
            for entry in entries.values() {
                send_to_remaining(&*network, entry);
            }
            next_tick = now + interval;
        }

        let op = match rx.recv_timeout(next_tick.saturating_duration_since(now)) {
            Ok(op) => op,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match op {
            Op::Start {
                id,
                message,
                targets,
            } => {
                let entry = Entry { message, targets };
                send_to_remaining(&*network, &entry);
                if !entry.targets.is_empty() {
                    entries.insert(id, entry);
                }
            }
            Op::StopTarget { id, target } => {
                let finalized = match entries.get_mut(&id) {
                    Some(entry) => {
                        entry.targets.retain(|t| *t != target);
                        entry.targets.is_empty()
                    }
                    None => false,
                };
                if finalized {
                    trace!("message {} acknowledged by every target", id);
                    entries.remove(&id);
                }
            }
            Op::Stop { id } => {
                entries.remove(&id);
            }
            Op::Shutdown => break,
        }
    }

    debug!("retransmitter finished with {} live messages", entries.len());
}

fn send_to_remaining(network: &dyn Network, entry: &Entry) {
    for target in &entry.targets {
        if let Err(err) = network.send_message(&entry.message, *target) {
            warn!("retransmission to {} failed: {}", target, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::error::Result;
    use crate::paxos::messages::{Message, MessageKind};
    use crate::paxos::ordering::{SeqNo, View};
    use parking_lot::Mutex;

    struct CountingNetwork {
        sent: Mutex<Vec<ReplicaId>>,
    }

    impl Network for CountingNetwork {
        fn local_id(&self) -> ReplicaId {
            ReplicaId::from(0)
        }

        fn send_message(&self, _message: &Message, target: ReplicaId) -> Result<()> {
            self.sent.lock().push(target);
            Ok(())
        }
    }

    fn accept() -> Message {
        Message::new(View::from(1), MessageKind::Accept { id: SeqNo::ZERO })
    }

    #[test]
    fn retransmits_until_stopped() {
        let counting = Arc::new(CountingNetwork {
            sent: Mutex::new(Vec::new()),
        });
        let retransmitter = ActiveRetransmitter::new(
            "test-retransmit",
            counting.clone(),
            Duration::from_millis(5),
        );

        let handle = retransmitter.handle();
        let message =
            handle.start_transmitting(accept(), vec![ReplicaId::from(1), ReplicaId::from(2)]);

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let sent = counting.sent.lock();
            if sent.iter().filter(|t| **t == ReplicaId::from(1)).count() >= 3 {
                break;
            }
            drop(sent);
            thread::sleep(Duration::from_millis(2));
        }

        message.stop_target(ReplicaId::from(1));
        thread::sleep(Duration::from_millis(20));
        let count_after_stop = counting
            .sent
            .lock()
            .iter()
            .filter(|t| **t == ReplicaId::from(1))
            .count();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            counting
                .sent
                .lock()
                .iter()
                .filter(|t| **t == ReplicaId::from(1))
                .count(),
            count_after_stop,
            "target 1 still receiving after stop"
        );
        // the other destination is still served
        assert!(
            counting
                .sent
                .lock()
                .iter()
                .filter(|t| **t == ReplicaId::from(2))
                .count()
                > count_after_stop
        );

        message.stop();
        retransmitter.shutdown();
    }
}
