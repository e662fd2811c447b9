//! Client request batching.
//!
//! Two layers: a per-replica worker aggregates incoming client requests
//! into batches named by [`ClientBatchId`] and propagates them to every
//! peer ahead of ordering; the proposer then packs batch ids, not
//! payloads, into consensus values. The shared [`ClientBatchStore`]
//! resolves ids back to payloads at delivery time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::paxos::config::ProcessDescriptor;
use crate::paxos::dispatcher::DispatcherHandle;
use crate::paxos::error::*;
use crate::paxos::messages::{ClientRequest, ForwardedClientBatch, Message, MessageKind};
use crate::paxos::network::Network;
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::Paxos;

/// The name of a forwarded client batch: the replica that formed it and
/// its sequence number there.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClientBatchId {
    pub replica: ReplicaId,
    pub seq: SeqNo,
}

/// Serialized size of one batch id inside a consensus value.
const BATCH_ID_SIZE: usize = 8;

/// Packs a list of batch ids into an opaque consensus value: a
/// length-prefixed sequence of `(replica:i32, seq:i32)` pairs.
pub fn pack_batch_ids(ids: &[ClientBatchId]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + ids.len() * BATCH_ID_SIZE);
    buf.put_i32(ids.len() as i32);
    for id in ids {
        buf.put_i32(u32::from(id.replica) as i32);
        buf.put_i32(id.seq.into());
    }
    buf.to_vec()
}

/// Inverse of [`pack_batch_ids`].
pub fn unpack_batch_ids(value: &[u8]) -> Result<Vec<ClientBatchId>> {
    if value.len() < 4 {
        return Err(Error::Codec("consensus value too short"));
    }
    let n = i32::from_be_bytes(value[..4].try_into().unwrap());
    if n < 0 || value.len() != 4 + n as usize * BATCH_ID_SIZE {
        return Err(Error::Codec("consensus value length mismatch"));
    }
    let mut ids = Vec::with_capacity(n as usize);
    for chunk in value[4..].chunks_exact(BATCH_ID_SIZE) {
        let replica = i32::from_be_bytes(chunk[..4].try_into().unwrap());
        let seq = i32::from_be_bytes(chunk[4..].try_into().unwrap());
        if replica < 0 {
            return Err(Error::Codec("negative replica id in value"));
        }
        ids.push(ClientBatchId {
            replica: ReplicaId::from(replica as u32),
            seq: SeqNo::from(seq),
        });
    }
    Ok(ids)
}

/// The value proposed for an instance that must decide but has nothing
/// to carry.
pub fn noop_value() -> Vec<u8> {
    pack_batch_ids(&[])
}

/// How many batch ids fit into one consensus value of at most
/// `batching_level` bytes.
pub fn max_ids_per_value(batching_level: usize) -> usize {
    batching_level.saturating_sub(4) / BATCH_ID_SIZE
}

#[derive(Default)]
struct StoreInner {
    /// Batch id -> payload, for every batch currently known.
    batches: HashMap<ClientBatchId, Vec<ClientRequest>>,
    /// Referenced by some consensus value but not yet received.
    waited_for: HashSet<ClientBatchId>,
    /// Received but not yet referenced by any instance.
    instanceless: HashSet<ClientBatchId>,
}

/// Shared between the selector threads (writers of forwarded batches)
/// and the consensus dispatcher; internally synchronized.
pub struct ClientBatchStore {
    inner: Mutex<StoreInner>,
}

impl ClientBatchStore {
    pub fn new() -> Self {
        ClientBatchStore {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn get_batch(&self, id: ClientBatchId) -> Option<Vec<ClientRequest>> {
        self.inner.lock().batches.get(&id).cloned()
    }

    /// Records that a consensus value references `id`. When the batch
    /// has not arrived yet it is marked waited-for.
    pub fn associate_with_instance(&self, id: ClientBatchId) {
        let mut inner = self.inner.lock();
        if inner.batches.contains_key(&id) {
            inner.instanceless.remove(&id);
        } else {
            inner.waited_for.insert(id);
        }
    }

    /// Stores a batch payload. Returns `true` when some instance was
    /// already waiting on it, i.e. delivery may now be able to advance.
    pub fn set_batch(&self, id: ClientBatchId, requests: Vec<ClientRequest>) -> bool {
        let mut inner = self.inner.lock();
        inner.batches.insert(id, requests);
        let was_waited_for = inner.waited_for.remove(&id);
        if !was_waited_for {
            inner.instanceless.insert(id);
        }
        was_waited_for
    }

    pub fn set_forwarded(&self, forward: ForwardedClientBatch) -> bool {
        self.set_batch(forward.batch_id, forward.requests)
    }

    pub fn is_any_instance_waiting(&self, id: ClientBatchId) -> bool {
        self.inner.lock().waited_for.contains(&id)
    }

    /// Whether every batch referenced by `ids` has arrived.
    pub fn has_all_batches(&self, ids: &[ClientBatchId]) -> bool {
        let inner = self.inner.lock();
        ids.iter().all(|id| inner.batches.contains_key(id))
    }

    /// The requests of `ids` concatenated in order, or `None` while any
    /// batch is still missing.
    pub fn collect_requests(&self, ids: &[ClientBatchId]) -> Option<Vec<ClientRequest>> {
        let inner = self.inner.lock();
        let mut requests = Vec::new();
        for id in ids {
            requests.extend(inner.batches.get(id)?.iter().cloned());
        }
        Some(requests)
    }

    /// Removes up to `limit` batches that no instance references yet,
    /// for the proposer to pack into the next value. Sorted so the same
    /// leader always packs in a stable order.
    pub fn take_instanceless(&self, limit: usize) -> Vec<ClientBatchId> {
        let mut inner = self.inner.lock();
        if inner.instanceless.is_empty() {
            return Vec::new();
        }
        let mut ids: Vec<ClientBatchId> = inner.instanceless.iter().copied().collect();
        ids.sort_unstable();
        ids.truncate(limit);
        for id in &ids {
            inner.instanceless.remove(id);
        }
        ids
    }

    pub fn has_instanceless(&self) -> bool {
        !self.inner.lock().instanceless.is_empty()
    }

    pub fn instanceless_count(&self) -> usize {
        self.inner.lock().instanceless.len()
    }

    /// Drops delivered batches.
    pub fn remove_batches(&self, ids: &[ClientBatchId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.batches.remove(id);
            inner.instanceless.remove(id);
        }
    }
}

impl Default for ClientBatchStore {
    fn default() -> Self {
        ClientBatchStore::new()
    }
}

enum BatcherOp {
    Request(ClientRequest),
    Shutdown,
}

/// Front of the forwarding batcher; requests are handed in from the
/// selector threads.
pub struct ClientRequestBatcher {
    tx: Sender<BatcherOp>,
}

impl ClientRequestBatcher {
    /// Creates the channel pair; the worker half is started separately
    /// once the consensus dispatcher exists.
    pub fn new() -> (ClientRequestBatcher, BatcherWorker) {
        let (tx, rx) = unbounded();
        (ClientRequestBatcher { tx }, BatcherWorker { rx })
    }

    pub fn enqueue_request(&self, request: ClientRequest) -> Result<()> {
        self.tx
            .send(BatcherOp::Request(request))
            .map_err(|_| Error::Disconnected("batcher"))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(BatcherOp::Shutdown);
    }
}

/// Receiving half of the batcher, aggregating requests until the size
/// or delay bound is hit, then forwarding the batch to every peer.
pub struct BatcherWorker {
    rx: Receiver<BatcherOp>,
}

impl BatcherWorker {
    pub fn start(
        self,
        descriptor: Arc<ProcessDescriptor>,
        network: Arc<dyn Network>,
        store: Arc<ClientBatchStore>,
        dispatcher: DispatcherHandle<Paxos>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name(format!("client-batcher-{}", descriptor.local_id))
            .spawn(move || {
                run_batcher(self.rx, descriptor, network, store, dispatcher);
            })
            .expect("failed to spawn batcher thread")
    }
}

fn run_batcher(
    rx: Receiver<BatcherOp>,
    descriptor: Arc<ProcessDescriptor>,
    network: Arc<dyn Network>,
    store: Arc<ClientBatchStore>,
    dispatcher: DispatcherHandle<Paxos>,
) {
    let max_size = descriptor.config.forward_batch_max_size;
    let max_delay = descriptor.config.forward_batch_max_delay;
    let others = descriptor.other_replicas();

    let mut pending: Vec<ClientRequest> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut deadline = Instant::now();
    let mut next_seq = SeqNo::ZERO;

    let flush = |pending: &mut Vec<ClientRequest>,
                     pending_bytes: &mut usize,
                     next_seq: &mut SeqNo| {
        if pending.is_empty() {
            return;
        }
        let batch_id = ClientBatchId {
            replica: descriptor.local_id,
            seq: *next_seq,
        };
        *next_seq = next_seq.next();

        let requests = std::mem::take(pending);
        *pending_bytes = 0;

        trace!(
            "{:?} // forwarding batch {:?} with {} requests",
            descriptor.local_id,
            batch_id,
            requests.len()
        );

        store.set_batch(batch_id, requests.clone());

        let message = Message::new(
            View::ZERO,
            MessageKind::ForwardClientBatch(ForwardedClientBatch { batch_id, requests }),
        );
        network.send_to_many(&message, &others);

        dispatcher.submit(move |paxos| paxos.on_client_batch_available(batch_id));
    };

    loop {
        let timeout = if pending.is_empty() {
            // nothing buffered, nothing to flush on a timer
            Duration::from_secs(3600)
        } else {
            deadline.saturating_duration_since(Instant::now())
        };

        match rx.recv_timeout(timeout) {
            Ok(BatcherOp::Request(request)) => {
                if pending.is_empty() {
                    deadline = Instant::now() + max_delay;
                }
                pending_bytes += request.byte_size();
                pending.push(request);
                if pending_bytes >= max_size {
                    flush(&mut pending, &mut pending_bytes, &mut next_seq);
                }
            }
            Ok(BatcherOp::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                flush(&mut pending, &mut pending_bytes, &mut next_seq);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("{:?} // batcher finished", descriptor.local_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::messages::RequestId;

    fn id(replica: u32, seq: i32) -> ClientBatchId {
        ClientBatchId {
            replica: ReplicaId::from(replica),
            seq: SeqNo::from(seq),
        }
    }

    fn request(client: i64, seq: i32) -> ClientRequest {
        ClientRequest::new(RequestId::new(client, seq), vec![0xAB])
    }

    #[test]
    fn pack_unpack() {
        let ids = vec![id(0, 1), id(2, 7)];
        let value = pack_batch_ids(&ids);
        assert_eq!(unpack_batch_ids(&value).unwrap(), ids);

        assert!(unpack_batch_ids(&noop_value()).unwrap().is_empty());
        assert!(unpack_batch_ids(&[1, 2]).is_err());
        assert!(unpack_batch_ids(&[0, 0, 0, 2, 0]).is_err());
    }

    #[test]
    fn store_tracks_the_three_sets() {
        let store = ClientBatchStore::new();

        // batch arrives before any instance references it
        assert!(!store.set_batch(id(0, 0), vec![request(1, 1)]));
        assert!(store.has_instanceless());
        store.associate_with_instance(id(0, 0));
        assert!(!store.has_instanceless());

        // instance references a batch that has not arrived yet
        store.associate_with_instance(id(1, 0));
        assert!(store.is_any_instance_waiting(id(1, 0)));
        assert!(!store.has_all_batches(&[id(0, 0), id(1, 0)]));
        assert!(store.collect_requests(&[id(0, 0), id(1, 0)]).is_none());

        // late arrival resolves the wait
        assert!(store.set_batch(id(1, 0), vec![request(2, 1)]));
        assert!(!store.is_any_instance_waiting(id(1, 0)));
        let requests = store.collect_requests(&[id(0, 0), id(1, 0)]).unwrap();
        assert_eq!(requests.len(), 2);

        store.remove_batches(&[id(0, 0), id(1, 0)]);
        assert!(store.get_batch(id(0, 0)).is_none());
    }

    #[test]
    fn take_instanceless_is_stable_and_bounded() {
        let store = ClientBatchStore::new();
        store.set_batch(id(0, 1), vec![]);
        store.set_batch(id(0, 0), vec![]);
        store.set_batch(id(1, 0), vec![]);

        let taken = store.take_instanceless(2);
        assert_eq!(taken, vec![id(0, 0), id(0, 1)]);
        let rest = store.take_instanceless(10);
        assert_eq!(rest, vec![id(1, 0)]);
        assert!(store.take_instanceless(10).is_empty());
    }
}
