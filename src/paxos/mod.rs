//! A crash-recoverable state machine replication core in the Paxos
//! family.
//!
//! A fixed set of replicas orders opaque client commands through a
//! leader-based consensus protocol; every replica applies the decided
//! commands, in instance order, to a user-supplied
//! [`executable::Service`] and answers each client at most once.
//!
//! All consensus state lives on a single-threaded dispatcher; message
//! ingress funnels through [`Paxos::process_message`], which dispatches
//! by message type and enforces the view gating rules in one place.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};

pub mod acceptor;
pub mod batcher;
pub mod catchup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executable;
pub mod messages;
pub mod network;
pub mod ordering;
pub mod proposer;
pub mod recovery;
pub mod replica;
pub mod retransmit;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
mod tests;

use self::batcher::{ClientBatchId, ClientBatchStore};
use self::catchup::CatchUp;
use self::config::ProcessDescriptor;
use self::dispatcher::{DispatcherHandle, Priority, PriorityTask};
use self::error::Error;
use self::executable::{ExecutorHandle, UpdateBatch};
use self::messages::{ForwardedClientBatch, Message, MessageKind};
use self::network::Network;
use self::ordering::{ReplicaId, SeqNo};
use self::proposer::Proposer;
use self::recovery::Recovery;
use self::retransmit::RetransmitterHandle;
use self::snapshot::SnapshotMaintainer;
use self::storage::Storage;

/// Leader liveness tracking: the leader heartbeats, the followers
/// suspect it after silence and start a view change.
pub(crate) struct FailureDetector {
    last_heard: Instant,
    alive_task: Option<PriorityTask>,
    suspect_task: Option<PriorityTask>,
}

impl FailureDetector {
    fn new() -> Self {
        FailureDetector {
            last_heard: Instant::now(),
            alive_task: None,
            suspect_task: None,
        }
    }

    fn cancel(&mut self) {
        if let Some(task) = self.alive_task.take() {
            task.cancel();
        }
        if let Some(task) = self.suspect_task.take() {
            task.cancel();
        }
    }
}

/// The consensus core of one replica. Owned by, and only ever touched
/// from, the consensus dispatcher thread.
pub struct Paxos {
    pub(crate) descriptor: Arc<ProcessDescriptor>,
    pub(crate) dispatcher: DispatcherHandle<Paxos>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) storage: Storage,
    pub(crate) proposer: Proposer,
    pub(crate) catch_up: CatchUp,
    pub(crate) snapshot_maintainer: SnapshotMaintainer,
    pub(crate) retransmitter: RetransmitterHandle,
    pub(crate) batch_store: Arc<ClientBatchStore>,
    pub(crate) executor: ExecutorHandle,
    pub(crate) fd: FailureDetector,
    pub(crate) recovery: Recovery,
    /// Delivery cursor: the next instance handed to the state machine.
    pub(crate) next_to_deliver: SeqNo,
    /// Armed while delivery waits on batches that have not arrived.
    pub(crate) batch_wait_task: Option<PriorityTask>,
    /// Batches already applied, kept in the store until a snapshot
    /// truncates their instances, so catch-up can re-forward them to
    /// replicas that missed the original propagation.
    pub(crate) delivered_batches: VecDeque<(SeqNo, Vec<ClientBatchId>)>,
    first_run: bool,
}

impl Paxos {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        descriptor: Arc<ProcessDescriptor>,
        storage: Storage,
        first_run: bool,
        network: Arc<dyn Network>,
        executor: ExecutorHandle,
        batch_store: Arc<ClientBatchStore>,
        retransmitter: RetransmitterHandle,
        dispatcher: DispatcherHandle<Paxos>,
    ) -> Paxos {
        let next_to_deliver = storage
            .last_snapshot()
            .map(|snapshot| snapshot.next_instance_id)
            .unwrap_or(SeqNo::ZERO);

        let catch_up = CatchUp::new(
            descriptor.num_replicas,
            descriptor.config.retransmit_timeout,
        );
        let snapshot_maintainer = SnapshotMaintainer::new(&descriptor);

        Paxos {
            descriptor,
            dispatcher,
            network,
            storage,
            proposer: Proposer::new(),
            catch_up,
            snapshot_maintainer,
            retransmitter,
            batch_store,
            executor,
            fd: FailureDetector::new(),
            recovery: Recovery::new(),
            next_to_deliver,
            batch_wait_task: None,
            delivered_batches: VecDeque::new(),
            first_run,
        }
    }

    /// First task on the dispatcher: prime the state machine from the
    /// durable snapshot and run the recovery protocol.
    pub(crate) fn start(&mut self) {
        debug_assert!(self.dispatcher.am_i_in_dispatcher());

        info!(
            "{:?} // starting at view {} ({})",
            self.descriptor.local_id,
            self.storage.view(),
            if self.first_run { "fresh" } else { "recovering" }
        );

        if let Some(snapshot) = self.storage.last_snapshot() {
            let snapshot = (**snapshot).clone();
            self.executor.install_snapshot(snapshot);
        }

        if self.first_run {
            self.finish_recovery();
        } else {
            self.start_recovery();
        }
    }

    /// Cancels every armed task; called on shutdown.
    pub(crate) fn stop(&mut self) {
        self.stop_proposer();
        self.catch_up.cancel_tasks();
        self.fd.cancel();
        if let Some(task) = self.batch_wait_task.take() {
            task.cancel();
        }
    }

    /// The single ingress point for replica messages. Dispatches by
    /// message type after applying the view gating rules.
    pub fn process_message(&mut self, message: Message, sender: ReplicaId) {
        debug_assert!(
            self.dispatcher.am_i_in_dispatcher(),
            "consensus state touched outside the dispatcher"
        );

        self.fd_touch(sender);

        let view = message.view();
        let sent_time = message.sent_time();

        if message.is_view_gated() {
            if view > self.storage.view() {
                info!(
                    "{:?} // {} is at view {}, following",
                    self.descriptor.local_id, sender, view
                );
                if let Err(err) = self.storage.set_view(view) {
                    self.halt_on_storage_failure(err);
                }
                self.stop_proposer();
                self.fd_reset();
                self.fd_reconfigure();
            } else if view < self.storage.view()
                && !matches!(message.kind(), MessageKind::Prepare)
            {
                trace!(
                    "{:?} // stale message at {} from {}, dropping",
                    self.descriptor.local_id,
                    view,
                    sender
                );
                return;
            }
        }

        match message.into_kind() {
            MessageKind::Prepare => self.on_prepare(sender, view),
            MessageKind::PrepareOk(records) => self.on_prepare_ok(sender, view, records),
            MessageKind::Propose { id, value } => self.on_propose(sender, view, id, value),
            MessageKind::Accept { id } => self.on_accept(sender, view, id),
            MessageKind::Alive { log_next_id } => self.on_alive(sender, log_next_id),
            MessageKind::CatchUpQuery(query) => {
                self.handle_catch_up_query(sender, sent_time, query)
            }
            MessageKind::CatchUpResponse(response) => {
                self.handle_catch_up_response(sender, response)
            }
            MessageKind::CatchUpSnapshot { snapshot, .. } => {
                self.handle_catch_up_snapshot(sender, snapshot)
            }
            MessageKind::Recovery { view_on_crash, .. } => {
                self.handle_recovery(sender, view_on_crash)
            }
            MessageKind::RecoveryAnswer { view, next_id } => {
                self.handle_recovery_answer(sender, view, next_id)
            }
            MessageKind::ForwardClientBatch(forward) => self.on_forward_client_batch(forward),
        }
    }

    /// Marks an instance final and advances everything that depends on
    /// the decided prefix.
    pub(crate) fn decide(&mut self, id: SeqNo) {
        {
            let instance = match self.storage.log_mut().get_instance_mut(id) {
                Some(instance) => instance,
                None => return,
            };
            if instance.is_decided() {
                return;
            }
            instance.set_decided();
        }
        debug!("{:?} // instance {} decided", self.descriptor.local_id, id);

        self.proposer.stop_propose(id);
        self.storage.log_mut().update_first_uncommitted();
        self.deliver_decided();
        self.check_recovery_catch_up();
        // the window may have opened
        self.try_propose_pending(true);
        self.log_size_changed();
    }

    /// Hands the contiguous decided prefix to the state machine, in
    /// instance order, resolving batch ids to their payloads. Stalls on
    /// the first instance whose batches have not all arrived.
    pub(crate) fn deliver_decided(&mut self) {
        loop {
            let value = match self.storage.log().get_instance(self.next_to_deliver) {
                Some(instance) if instance.is_decided() => instance
                    .value()
                    .expect("decided instance without a value")
                    .to_vec(),
                _ => break,
            };

            let ids = batcher::unpack_batch_ids(&value)
                .expect("decided value is not a batch id list");

            match self.batch_store.collect_requests(&ids) {
                None => {
                    for id in &ids {
                        self.batch_store.associate_with_instance(*id);
                    }
                    self.arm_batch_wait();
                    break;
                }
                Some(requests) => {
                    let batch = UpdateBatch {
                        instance_id: self.next_to_deliver,
                        requests,
                    };
                    if self.executor.queue_batch(batch).is_err() {
                        // shutting down
                        break;
                    }
                    // the payloads stay resolvable for peers that
                    // missed the forwarding
                    self.delivered_batches.push_back((self.next_to_deliver, ids));
                    self.next_to_deliver = self.next_to_deliver.next();
                }
            }
        }
    }

    /// Re-checks delivery after the batch fetching timeout, in case a
    /// forwarded batch went missing on the wire, and asks a peer to
    /// serve the stalled instance again (which re-forwards its
    /// batches).
    fn arm_batch_wait(&mut self) {
        if self.batch_wait_task.is_some() {
            return;
        }
        let delay = self.descriptor.config.max_batch_fetching_time;
        self.batch_wait_task =
            Some(
                self.dispatcher
                    .schedule(Priority::Normal, delay, |paxos: &mut Paxos| {
                        paxos.batch_wait_task = None;
                        paxos.deliver_decided();
                        if paxos.batch_wait_task.is_some() {
                            warn!(
                                "{:?} // delivery of instance {} still waiting for forwarded batches",
                                paxos.descriptor.local_id, paxos.next_to_deliver
                            );
                            paxos.request_stalled_instance();
                        }
                    }),
            );
    }

    /// Queries a peer for the instance delivery is stalled on; the
    /// answer includes a fresh forwarding of its batches.
    fn request_stalled_instance(&mut self) {
        let stalled = self.next_to_deliver;
        let target = self.best_catch_up_replica();
        if target == self.descriptor.local_id {
            return;
        }
        let query = messages::CatchUpQuery {
            periodic: false,
            snapshot_request: false,
            instance_ids: Vec::new(),
            instance_ranges: vec![(stalled, stalled)],
        };
        let message = Message::new(self.storage.view(), MessageKind::CatchUpQuery(query));
        let _ = self.network.send_message(&message, target);
    }

    /// Drops retained batches whose instances fell below the log floor.
    pub(crate) fn prune_delivered_batches(&mut self, below: SeqNo) {
        while let Some((instance, _)) = self.delivered_batches.front() {
            if *instance >= below {
                break;
            }
            let (_, ids) = self.delivered_batches.pop_front().expect("front checked");
            self.batch_store.remove_batches(&ids);
        }
    }

    /// Registers every batch id of a consensus value with the store,
    /// marking the ones whose payload has not arrived as waited-for.
    pub(crate) fn associate_value_batches(&mut self, value: &[u8]) {
        if let Ok(ids) = batcher::unpack_batch_ids(value) {
            for id in ids {
                self.batch_store.associate_with_instance(id);
            }
        }
    }

    /// A batch became available locally, either formed here or
    /// forwarded by a peer: delivery may unblock, and the proposer has
    /// new material.
    pub(crate) fn on_client_batch_available(&mut self, _batch_id: ClientBatchId) {
        self.deliver_decided();
        self.try_propose_pending(false);
    }

    fn on_forward_client_batch(&mut self, forward: ForwardedClientBatch) {
        let batch_id = forward.batch_id;
        self.batch_store.set_forwarded(forward);
        self.on_client_batch_available(batch_id);
    }

    /// Leader heartbeat: learn the leader's log extent, so catch-up can
    /// enumerate everything this replica is missing.
    fn on_alive(&mut self, _sender: ReplicaId, log_next_id: SeqNo) {
        if log_next_id > self.storage.log().next_id() {
            self.storage.log_mut().get_or_create(log_next_id.prev());
            self.run_check_catch_up();
        }
    }

    pub(crate) fn leader_id(&self) -> ReplicaId {
        self.descriptor.leader_of_view(self.storage.view())
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader_id() == self.descriptor.local_id
    }

    /// A stable storage failure must halt the replica: acknowledging an
    /// operation that did not persist would corrupt the replicated log.
    pub(crate) fn halt_on_storage_failure(&self, err: Error) -> ! {
        panic!(
            "{:?} // halting on stable storage failure: {}",
            self.descriptor.local_id, err
        );
    }

    pub(crate) fn fd_reset(&mut self) {
        self.fd.last_heard = Instant::now();
    }

    fn fd_touch(&mut self, sender: ReplicaId) {
        if sender == self.leader_id() {
            self.fd.last_heard = Instant::now();
        }
    }

    /// Leaders heartbeat, followers watch: re-armed on every view or
    /// role change.
    pub(crate) fn fd_reconfigure(&mut self) {
        if self.descriptor.is_local_process_leader(self.storage.view()) {
            if let Some(task) = self.fd.suspect_task.take() {
                task.cancel();
            }
            if self.fd.alive_task.is_none() {
                let period = self.descriptor.config.fd_send_timeout;
                self.fd.alive_task = Some(self.dispatcher.schedule_with_fixed_delay(
                    Priority::High,
                    period,
                    period,
                    |paxos: &mut Paxos| paxos.send_alive(),
                ));
            }
        } else {
            if let Some(task) = self.fd.alive_task.take() {
                task.cancel();
            }
            if self.fd.suspect_task.is_none() {
                let period = self.descriptor.config.fd_suspect_timeout;
                self.fd.suspect_task = Some(self.dispatcher.schedule_with_fixed_delay(
                    Priority::High,
                    period,
                    period,
                    |paxos: &mut Paxos| paxos.check_leader_alive(),
                ));
            }
        }
    }

    fn send_alive(&mut self) {
        if !self.proposer.is_prepared() {
            return;
        }
        let message = Message::new(
            self.storage.view(),
            MessageKind::Alive {
                log_next_id: self.storage.log().next_id(),
            },
        );
        self.network
            .send_to_many(&message, &self.descriptor.other_replicas());
    }

    fn check_leader_alive(&mut self) {
        if !self.recovery.is_done() {
            return;
        }
        if self.descriptor.is_local_process_leader(self.storage.view()) {
            return;
        }
        if self.fd.last_heard.elapsed() >= self.descriptor.config.fd_suspect_timeout {
            info!(
                "{:?} // suspecting {} as leader of view {}",
                self.descriptor.local_id,
                self.leader_id(),
                self.storage.view()
            );
            self.fd_reset();
            self.prepare_next_view();
        }
    }
}
