//! The state machine seam and the replica-apply dispatcher.
//!
//! Decided values are delivered here in strict instance order with no
//! gaps; a single thread applies them to the user [`Service`] and emits
//! replies. The same thread produces and installs snapshots, so a
//! snapshot always reflects a prefix of the applied log.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use intmap::IntMap;
use log::{debug, info, trace};
use parking_lot::Mutex;

use crate::paxos::config::ProcessDescriptor;
use crate::paxos::dispatcher::DispatcherHandle;
use crate::paxos::error::*;
use crate::paxos::messages::{ClientRequest, Reply};
use crate::paxos::ordering::SeqNo;
use crate::paxos::replica::ClientRequestManager;
use crate::paxos::snapshot::Snapshot;
use crate::paxos::Paxos;

/// The replicated state machine supplied by the user of this crate.
///
/// `execute` must be deterministic: every replica applies the same
/// requests in the same order and must reach the same state.
pub trait Service: Send + 'static {
    /// Applies one command and produces the reply payload.
    fn execute(&mut self, request: &[u8]) -> Vec<u8>;

    /// Serializes the current state. Called when the snapshot
    /// maintainer asks for or forces a snapshot.
    fn take_snapshot(&mut self) -> Vec<u8>;

    /// Replaces the current state with a serialized snapshot.
    fn install_snapshot(&mut self, state: &[u8]);
}

/// The ordered requests of one decided consensus instance.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub instance_id: SeqNo,
    pub requests: Vec<ClientRequest>,
}

enum ExecutorOp {
    Batch(UpdateBatch),
    TakeSnapshot { forced: bool, above: SeqNo },
    Install(Snapshot),
    Shutdown,
}

/// Handle through which the consensus dispatcher feeds the executor.
/// Doubles as the snapshot provider of the maintainer and of catch-up.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: Sender<ExecutorOp>,
}

impl ExecutorHandle {
    /// Creates the channel pair; the worker half is started separately
    /// once the request manager exists.
    pub fn new() -> (ExecutorHandle, ExecutorQueue) {
        let (tx, rx) = unbounded();
        (ExecutorHandle { tx }, ExecutorQueue { rx })
    }

    pub fn queue_batch(&self, batch: UpdateBatch) -> Result<()> {
        self.tx
            .send(ExecutorOp::Batch(batch))
            .map_err(|_| Error::Disconnected("executor"))
    }

    pub fn ask_for_snapshot(&self, above: SeqNo) {
        let _ = self.tx.send(ExecutorOp::TakeSnapshot {
            forced: false,
            above,
        });
    }

    pub fn force_snapshot(&self, above: SeqNo) {
        let _ = self.tx.send(ExecutorOp::TakeSnapshot {
            forced: true,
            above,
        });
    }

    pub fn install_snapshot(&self, snapshot: Snapshot) {
        let _ = self.tx.send(ExecutorOp::Install(snapshot));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ExecutorOp::Shutdown);
    }
}

/// Receiving half of the executor.
pub struct ExecutorQueue {
    rx: Receiver<ExecutorOp>,
}

impl ExecutorQueue {
    pub fn start<S: Service>(
        self,
        descriptor: Arc<ProcessDescriptor>,
        service: S,
        last_replies: Arc<Mutex<IntMap<Reply>>>,
        request_manager: Arc<ClientRequestManager>,
        dispatcher: DispatcherHandle<Paxos>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name(format!("replica-apply-{}", descriptor.local_id))
            .spawn(move || {
                run_executor(
                    self.rx,
                    descriptor,
                    service,
                    last_replies,
                    request_manager,
                    dispatcher,
                );
            })
            .expect("failed to spawn executor thread")
    }
}

fn run_executor<S: Service>(
    rx: Receiver<ExecutorOp>,
    descriptor: Arc<ProcessDescriptor>,
    mut service: S,
    last_replies: Arc<Mutex<IntMap<Reply>>>,
    request_manager: Arc<ClientRequestManager>,
    dispatcher: DispatcherHandle<Paxos>,
) {
    // the instance id whose batch is applied next
    let mut next_instance = SeqNo::ZERO;

    while let Ok(op) = rx.recv() {
        match op {
            ExecutorOp::Batch(batch) => {
                assert_eq!(
                    batch.instance_id, next_instance,
                    "batch delivered out of order"
                );
                next_instance = batch.instance_id.next();

                for request in batch.requests {
                    execute_one(&mut service, &last_replies, &request_manager, request);
                }
            }
            ExecutorOp::TakeSnapshot { forced, above } => {
                debug!(
                    "{:?} // {} snapshot above {} at instance {}",
                    descriptor.local_id,
                    if forced { "forced" } else { "requested" },
                    above,
                    next_instance
                );
                let snapshot = Snapshot {
                    next_instance_id: next_instance,
                    last_replies: last_replies
                        .lock()
                        .iter()
                        .map(|(client, reply)| (*client as i64, reply.clone()))
                        .collect(),
                    value: service.take_snapshot(),
                };
                dispatcher.submit(move |paxos| paxos.on_snapshot_made(snapshot));
            }
            ExecutorOp::Install(snapshot) => {
                info!(
                    "{:?} // installing state up to instance {}",
                    descriptor.local_id, snapshot.next_instance_id
                );
                service.install_snapshot(&snapshot.value);
                {
                    let mut cache = last_replies.lock();
                    *cache = IntMap::new();
                    for (client, reply) in snapshot.last_replies {
                        cache.insert(client as u64, reply);
                    }
                }
                next_instance = snapshot.next_instance_id;
            }
            ExecutorOp::Shutdown => break,
        }
    }

    debug!("{:?} // executor finished", descriptor.local_id);
}

fn execute_one<S: Service>(
    service: &mut S,
    last_replies: &Mutex<IntMap<Reply>>,
    request_manager: &ClientRequestManager,
    request: ClientRequest,
) {
    let client_key = request.id.client_id as u64;

    // a command with a given (client, seq) is applied at most once,
    // even if it was ordered twice across view changes
    let already_executed = last_replies
        .lock()
        .get(client_key)
        .map(|cached| cached.request_id.seq >= request.id.seq)
        .unwrap_or(false);
    if already_executed {
        trace!("skipping duplicate of {}", request.id);
        return;
    }

    let payload = service.execute(&request.payload);
    let reply = Reply::new(request.id, payload);
    last_replies.lock().insert(client_key, reply.clone());

    request_manager.on_request_executed(&request, &reply);
}
