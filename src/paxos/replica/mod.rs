//! The replica shell: client request admission with at-most-once
//! semantics, flow control, and the wiring of every worker around the
//! consensus dispatcher.

use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use intmap::IntMap;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::paxos::batcher::{ClientBatchStore, ClientRequestBatcher};
use crate::paxos::config::{Configuration, CrashModel, ProcessDescriptor};
use crate::paxos::dispatcher::{self, DispatcherHandle};
use crate::paxos::error::*;
use crate::paxos::executable::{ExecutorHandle, Service};
use crate::paxos::messages::serialize::reply_to_bytes;
use crate::paxos::messages::{
    ClientCommand, ClientReply, ClientRequest, Message, Reply, RequestId,
};
use crate::paxos::network::{MessageHandler, Network};
use crate::paxos::ordering::ReplicaId;
use crate::paxos::retransmit::ActiveRetransmitter;
use crate::paxos::storage::Storage;
use crate::paxos::Paxos;

/// Bound on the number of requests admitted but not yet executed.
/// When it is reached, the selector threads block; they do not drop.
pub const MAX_PENDING_REQUESTS: usize = 1024;

/// The write half of one client connection. Implementations belong to
/// the transport layer outside this crate.
pub trait ClientProxy: Send + Sync {
    fn send(&self, reply: ClientReply);
}

/// A counting semaphore blocking the calling thread when exhausted.
/// This is the only back-pressure point in the system.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }
}

/// Handles all commands from the clients. A single instance manages
/// every client of this replica.
///
/// Accessed by the selector threads (admission) and by the replica
/// apply thread (reply delivery); both maps are internally
/// synchronized.
pub struct ClientRequestManager {
    descriptor: Arc<ProcessDescriptor>,
    /// Last reply per client; needed for retransmissions.
    last_replies: Arc<Mutex<IntMap<Reply>>>,
    /// Requests received but not yet executed, mapped to the proxy
    /// waiting for the reply.
    pending_proxies: DashMap<RequestId, Arc<dyn ClientProxy>>,
    pending_sem: Semaphore,
    batcher: ClientRequestBatcher,
}

impl ClientRequestManager {
    pub fn new(
        descriptor: Arc<ProcessDescriptor>,
        last_replies: Arc<Mutex<IntMap<Reply>>>,
        batcher: ClientRequestBatcher,
        max_pending: usize,
    ) -> Self {
        ClientRequestManager {
            descriptor,
            last_replies,
            pending_proxies: DashMap::new(),
            pending_sem: Semaphore::new(max_pending),
            batcher,
        }
    }

    /// Executes a command received directly from a client. May block on
    /// the pending-request semaphore.
    pub fn on_client_request(
        &self,
        command: ClientCommand,
        client: Arc<dyn ClientProxy>,
    ) -> Result<()> {
        match command {
            ClientCommand::Request(request) => {
                let request_id = request.id;
                let last = self
                    .last_replies
                    .lock()
                    .get(request_id.client_id as u64)
                    .cloned();

                // a request is new if the client has no cached reply,
                // or the cached reply answers an older sequence number
                let new_request = match &last {
                    None => true,
                    Some(reply) => request_id.seq > reply.request_id.seq,
                };

                if new_request {
                    trace!("{:?} // received {}", self.descriptor.local_id, request_id);

                    self.pending_sem.acquire();
                    self.pending_proxies.insert(request_id, client);
                    self.batcher.enqueue_request(request)?;
                } else {
                    let last = last.expect("cached reply checked above");
                    if last.request_id == request_id {
                        client.send(ClientReply::ok(reply_to_bytes(&last)));
                    } else {
                        let diagnostic = format!(
                            "Request too old: {}, last reply: {}",
                            request_id, last.request_id
                        );
                        warn!("{:?} // {}", self.descriptor.local_id, diagnostic);
                        client.send(ClientReply::nack(diagnostic));
                    }
                }
            }
            ClientCommand::Unknown(tag) => {
                warn!(
                    "{:?} // received invalid command type {}",
                    self.descriptor.local_id, tag
                );
                client.send(ClientReply::nack("Unknown command.".to_string()));
            }
        }
        Ok(())
    }

    /// Called on the replica apply thread once a request has executed.
    /// Only the replica that admitted the request holds its proxy; the
    /// others discard the reply.
    pub fn on_request_executed(&self, request: &ClientRequest, reply: &Reply) {
        match self.pending_proxies.remove(&reply.request_id) {
            None => {
                trace!("client proxy not found, discarding reply {}", request.id);
            }
            Some((_, client)) => {
                // release while still on the apply thread, so blocked
                // selector threads are freed without waiting on a
                // client socket
                self.pending_sem.release();
                client.send(ClientReply::ok(reply_to_bytes(reply)));
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.pending_sem.available_permits()
    }

    pub fn shutdown(&self) {
        self.batcher.shutdown();
    }
}

/// Feeds received messages, in per-sender arrival order, into the
/// consensus dispatcher.
pub struct DispatcherIngress {
    dispatcher: DispatcherHandle<Paxos>,
}

impl MessageHandler for DispatcherIngress {
    fn on_receive(&mut self, message: Message, sender: ReplicaId) {
        self.dispatcher
            .submit(move |paxos| paxos.process_message(message, sender));
    }
}

/// One replica of the replicated state machine.
pub struct Replica {
    descriptor: Arc<ProcessDescriptor>,
    dispatcher: DispatcherHandle<Paxos>,
    request_manager: Arc<ClientRequestManager>,
    executor: ExecutorHandle,
    last_replies: Arc<Mutex<IntMap<Reply>>>,
    retransmitter: Option<ActiveRetransmitter>,
    joins: Vec<JoinHandle<()>>,
}

impl Replica {
    /// Builds and starts a replica over the given transport. The
    /// transport must afterwards route incoming messages into
    /// [`Replica::message_handler`].
    pub fn new<S: Service>(
        config: Configuration,
        local_id: u32,
        service: S,
        network: Arc<dyn Network>,
    ) -> Result<Replica> {
        let descriptor = Arc::new(ProcessDescriptor::new(config, local_id)?);

        // the batching pipeline requires a crash model under which the
        // batch store exists
        if descriptor.config.crash_model == CrashModel::FullSS {
            return Err(Error::BatchingUnavailable);
        }

        let mut storage = Storage::open(descriptor.clone())?;
        let first_run = storage.view().is_initial();
        if !first_run && descriptor.is_local_process_leader(storage.view()) {
            // crashed as leader: move past the crashed view before
            // talking to anyone
            storage.set_view(storage.view().next())?;
        }

        let batch_store = Arc::new(ClientBatchStore::new());
        let last_replies = Arc::new(Mutex::new(IntMap::new()));

        let retransmitter = ActiveRetransmitter::new(
            &format!("retransmitter-{}", descriptor.local_id),
            network.clone(),
            descriptor.config.retransmit_timeout,
        );

        let (executor_handle, executor_queue) = ExecutorHandle::new();
        let (batcher, batcher_worker) = ClientRequestBatcher::new();

        let request_manager = Arc::new(ClientRequestManager::new(
            descriptor.clone(),
            last_replies.clone(),
            batcher,
            MAX_PENDING_REQUESTS,
        ));

        let (dispatcher, dispatcher_join) = {
            let descriptor = descriptor.clone();
            let network = network.clone();
            let executor_handle = executor_handle.clone();
            let batch_store = batch_store.clone();
            let retransmitter_handle = retransmitter.handle();
            dispatcher::spawn(
                &format!("paxos-dispatcher-{}", descriptor.local_id),
                move |handle| {
                    Paxos::new(
                        descriptor,
                        storage,
                        first_run,
                        network,
                        executor_handle,
                        batch_store,
                        retransmitter_handle,
                        handle.clone(),
                    )
                },
            )
        };

        let executor_join = executor_queue.start(
            descriptor.clone(),
            service,
            last_replies.clone(),
            request_manager.clone(),
            dispatcher.clone(),
        );

        let batcher_join = batcher_worker.start(
            descriptor.clone(),
            network,
            batch_store,
            dispatcher.clone(),
        );

        dispatcher.submit(|paxos| paxos.start());

        debug!("{:?} // replica started", descriptor.local_id);

        Ok(Replica {
            descriptor,
            dispatcher,
            request_manager,
            executor: executor_handle,
            last_replies,
            retransmitter: Some(retransmitter),
            joins: vec![dispatcher_join, executor_join, batcher_join],
        })
    }

    pub fn descriptor(&self) -> &Arc<ProcessDescriptor> {
        &self.descriptor
    }

    /// The ingress handler to register with the transport.
    pub fn message_handler(&self) -> Box<dyn MessageHandler> {
        Box::new(DispatcherIngress {
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// Entry point for the selector threads reading client commands.
    pub fn on_client_request(
        &self,
        command: ClientCommand,
        client: Arc<dyn ClientProxy>,
    ) -> Result<()> {
        self.request_manager.on_client_request(command, client)
    }

    pub fn request_manager(&self) -> &Arc<ClientRequestManager> {
        &self.request_manager
    }

    /// The cached reply for `client_id`, if any.
    pub fn last_reply(&self, client_id: i64) -> Option<Reply> {
        self.last_replies.lock().get(client_id as u64).cloned()
    }

    /// Runs a closure on the consensus dispatcher and waits for its
    /// result.
    pub(crate) fn with_paxos<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut Paxos) -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.dispatcher.submit(move |paxos| {
            let _ = tx.send(f(paxos));
        });
        rx.recv().expect("consensus dispatcher is gone")
    }

    /// Stops every worker and waits for them.
    pub fn shutdown(mut self) {
        self.dispatcher.submit(|paxos| paxos.stop());
        self.dispatcher.shutdown();
        self.executor.shutdown();
        self.request_manager.shutdown();
        if let Some(retransmitter) = self.retransmitter.take() {
            retransmitter.shutdown();
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::messages::ReplyStatus;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::thread;
    use std::time::Duration;

    struct ChannelProxy {
        tx: Sender<ClientReply>,
    }

    impl ClientProxy for ChannelProxy {
        fn send(&self, reply: ClientReply) {
            let _ = self.tx.send(reply);
        }
    }

    fn proxy() -> (Arc<dyn ClientProxy>, Receiver<ClientReply>) {
        let (tx, rx) = unbounded();
        (Arc::new(ChannelProxy { tx }), rx)
    }

    fn manager(
        max_pending: usize,
    ) -> (
        Arc<ClientRequestManager>,
        Arc<Mutex<IntMap<Reply>>>,
        crate::paxos::batcher::BatcherWorker,
    ) {
        let descriptor = Arc::new(
            ProcessDescriptor::new(
                Configuration {
                    crash_model: CrashModel::ViewSS,
                    ..Configuration::default()
                },
                0,
            )
            .unwrap(),
        );
        let last_replies = Arc::new(Mutex::new(IntMap::new()));
        let (batcher, worker) = ClientRequestBatcher::new();
        let manager = Arc::new(ClientRequestManager::new(
            descriptor,
            last_replies.clone(),
            batcher,
            max_pending,
        ));
        // the worker half keeps the request channel open
        (manager, last_replies, worker)
    }

    fn request(client: i64, seq: i32, payload: &[u8]) -> ClientCommand {
        ClientCommand::Request(ClientRequest::new(
            RequestId::new(client, seq),
            payload.to_vec(),
        ))
    }

    #[test]
    fn cached_reply_is_resent() {
        let (manager, last_replies, _worker) = manager(8);
        let reply = Reply::new(RequestId::new(42, 1), b"A!".to_vec());
        last_replies.lock().insert(42, reply.clone());

        let (client, rx) = proxy();
        manager
            .on_client_request(request(42, 1, b"A"), client)
            .unwrap();

        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.status, ReplyStatus::Ok);
        assert_eq!(got.payload, reply_to_bytes(&reply));
        // no permit was consumed for the cached answer
        assert_eq!(manager.available_permits(), 8);
    }

    #[test]
    fn stale_request_is_nacked() {
        let (manager, last_replies, _worker) = manager(8);
        last_replies
            .lock()
            .insert(42, Reply::new(RequestId::new(42, 5), b"E!".to_vec()));

        let (client, rx) = proxy();
        manager
            .on_client_request(request(42, 1, b"A"), client)
            .unwrap();

        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.status, ReplyStatus::Nack);
        assert!(String::from_utf8_lossy(&got.payload).contains("too old"));
    }

    #[test]
    fn unknown_command_is_nacked() {
        let (manager, _, _worker) = manager(8);
        let (client, rx) = proxy();
        manager
            .on_client_request(ClientCommand::Unknown(7), client)
            .unwrap();
        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.status, ReplyStatus::Nack);
    }

    #[test]
    fn admission_blocks_on_exhausted_permits_until_a_reply() {
        let (manager, _, _worker) = manager(4);

        for i in 0..4 {
            let (client, _rx) = proxy();
            manager
                .on_client_request(request(i, 1, b"x"), client)
                .unwrap();
        }
        assert_eq!(manager.available_permits(), 0);

        // the fifth admission must block until a permit frees up
        let blocked = {
            let manager = manager.clone();
            thread::spawn(move || {
                let (client, _rx) = proxy();
                manager
                    .on_client_request(request(99, 1, b"x"), client)
                    .unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished(), "admission did not block");

        // executing one pending request releases exactly one permit
        let executed = ClientRequest::new(RequestId::new(0, 1), b"x".to_vec());
        let reply = Reply::new(executed.id, b"x!".to_vec());
        manager.on_request_executed(&executed, &reply);

        blocked.join().unwrap();
        assert_eq!(manager.available_permits(), 0);
    }

    #[test]
    fn replies_without_proxy_do_not_release_permits() {
        let (manager, _, _worker) = manager(4);
        let executed = ClientRequest::new(RequestId::new(7, 1), b"x".to_vec());
        let reply = Reply::new(executed.id, b"x!".to_vec());
        manager.on_request_executed(&executed, &reply);
        assert_eq!(manager.available_permits(), 4);
    }
}
