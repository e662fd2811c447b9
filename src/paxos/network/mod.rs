//! The seam between the consensus core and the transport.
//!
//! The wire-level socket machinery lives outside this crate; the core
//! only needs a way to send framed messages to peers and a single
//! ingress point that feeds received messages, in per-sender order,
//! into the consensus dispatcher.
//!
//! An in-process loopback fabric is provided for wiring multiple
//! replicas inside one process; it round-trips every message through
//! the codec, so tests exercise the real frames.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::paxos::error::*;
use crate::paxos::messages::serialize;
use crate::paxos::messages::Message;
use crate::paxos::ordering::ReplicaId;

/// Outbound half of the transport, shared by every component that
/// sends.
pub trait Network: Send + Sync {
    fn local_id(&self) -> ReplicaId;

    /// Hands one message to the transport. A `NetworkSend` error is
    /// transient: the caller retries, retransmits, or adjusts peer
    /// ratings; it never tears anything down.
    fn send_message(&self, message: &Message, target: ReplicaId) -> Result<()>;

    /// Best-effort fan-out; per-target failures are logged and skipped.
    fn send_to_many(&self, message: &Message, targets: &[ReplicaId]) {
        for target in targets {
            if let Err(err) = self.send_message(message, *target) {
                warn!("send to {} failed: {}", target, err);
            }
        }
    }
}

/// Inbound half: a pair of callbacks the transport invokes around
/// message traffic.
pub trait MessageHandler: Send {
    /// A message arrived from `sender`. Invocations for one sender
    /// happen in arrival order.
    fn on_receive(&mut self, message: Message, sender: ReplicaId);

    /// A message is about to leave for `targets`.
    fn on_send(&mut self, _message: &Message, _targets: &[ReplicaId]) {}
}

/// An in-process message fabric connecting a set of replicas.
pub struct LoopbackFabric {
    handlers: Mutex<HashMap<ReplicaId, Box<dyn MessageHandler>>>,
    /// Replicas currently cut off from the fabric, both directions.
    down: Mutex<HashSet<ReplicaId>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackFabric {
            handlers: Mutex::new(HashMap::new()),
            down: Mutex::new(HashSet::new()),
        })
    }

    /// Registers the ingress handler for `id`.
    pub fn register(&self, id: ReplicaId, handler: Box<dyn MessageHandler>) {
        self.handlers.lock().insert(id, handler);
    }

    /// Creates the outbound endpoint for `id`.
    pub fn node(self: &Arc<Self>, id: ReplicaId) -> Arc<LoopbackNode> {
        Arc::new(LoopbackNode {
            id,
            fabric: self.clone(),
        })
    }

    /// Simulates a partition or crash of `id`: all traffic from and to
    /// it is dropped until reconnected.
    pub fn set_down(&self, id: ReplicaId, down: bool) {
        if down {
            self.down.lock().insert(id);
        } else {
            self.down.lock().remove(&id);
        }
    }

    fn deliver(&self, from: ReplicaId, to: ReplicaId, frame: Vec<u8>) -> Result<()> {
        {
            let down = self.down.lock();
            if down.contains(&from) || down.contains(&to) {
                trace!("dropping {} -> {}, link down", from, to);
                return Ok(());
            }
        }

        let message = serialize::deserialize_message(&frame)?;
        let mut handlers = self.handlers.lock();
        match handlers.get_mut(&to) {
            Some(handler) => {
                handler.on_receive(message, from);
                Ok(())
            }
            None => Err(Error::NetworkSend {
                target: to.to_string(),
                reason: "no such replica on the fabric".to_string(),
            }),
        }
    }
}

/// One replica's endpoint on a [`LoopbackFabric`].
pub struct LoopbackNode {
    id: ReplicaId,
    fabric: Arc<LoopbackFabric>,
}

impl Network for LoopbackNode {
    fn local_id(&self) -> ReplicaId {
        self.id
    }

    fn send_message(&self, message: &Message, target: ReplicaId) -> Result<()> {
        let frame = serialize::serialize_message(message);
        self.fabric.deliver(self.id, target, frame)
    }
}
