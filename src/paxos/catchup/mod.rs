//! Catch-up: how a lagging replica acquires decided instances, or a
//! whole snapshot, from its peers.
//!
//! Peer selection is rating-driven: ratings rise with delivered
//! instances and sink on useless or failed exchanges; a negative best
//! rating redirects catch-up to the leader. The resend timeout adapts
//! to the observed processing time as a moving average.

use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::paxos::batcher;
use crate::paxos::dispatcher::{Priority, PriorityTask};
use crate::paxos::messages::{
    CatchUpQuery, CatchUpResponse, ForwardedClientBatch, InstanceRecord, Message, MessageKind,
};
use crate::paxos::network::Network;
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::snapshot::Snapshot;
use crate::paxos::storage::LogEntryState;
use crate::paxos::Paxos;

/// How often a replica checks whether it has fallen out of the window.
pub const PERIODIC_CATCHUP_TIMEOUT: Duration = Duration::from_millis(2000);

/// Floor for the adaptive resend timeout.
pub const CATCHUP_MIN_RESEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Moving average factor for the resend timeout.
const CONVERGENCE_FACTOR: f64 = 0.2;

/// Rating penalty for a peer that answered it has nothing for us.
const EMPTY_RESPONSE_PENALTY: i64 = 5;

/// Current catch-up run mode: either requesting instances, or
/// requesting a snapshot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Normal,
    Snapshot,
}

/// Catch-up state, owned by the consensus dispatcher.
///
/// Rating rules: each replica starts at 0; sending a request costs the
/// number of instances requested; received instances pay back double;
/// a send failure turns the rating negative; an empty non-periodic
/// answer costs five, floored at zero.
pub struct CatchUp {
    mode: Mode,
    /// Conservative at start, adapted from observed round trips.
    resend_timeout: Duration,
    rating: Vec<i64>,
    /// Set when a peer answered it has nothing; the next query targets
    /// the leader.
    ask_leader: bool,
    /// A peer that declared itself snapshot-capable is used for the
    /// snapshot query.
    preferred_snapshot_replica: Option<ReplicaId>,
    check_task: Option<PriorityTask>,
    do_task: Option<PriorityTask>,
}

impl CatchUp {
    pub fn new(num_replicas: usize, retransmit_timeout: Duration) -> Self {
        CatchUp {
            mode: Mode::Normal,
            resend_timeout: retransmit_timeout,
            rating: vec![0; num_replicas],
            ask_leader: false,
            preferred_snapshot_replica: None,
            check_task: None,
            do_task: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cancel_tasks(&mut self) {
        if let Some(task) = self.check_task.take() {
            task.cancel();
        }
        if let Some(task) = self.do_task.take() {
            task.cancel();
        }
    }
}

impl Paxos {
    /// Arms the periodic out-of-window check, stopping any active
    /// catch-up exchange.
    pub(crate) fn schedule_check_catch_up(&mut self) {
        if self.catch_up.check_task.is_some() {
            return;
        }
        if let Some(task) = self.catch_up.do_task.take() {
            task.cancel();
        }
        self.catch_up.check_task = Some(self.dispatcher.schedule_with_fixed_delay(
            Priority::Normal,
            PERIODIC_CATCHUP_TIMEOUT,
            PERIODIC_CATCHUP_TIMEOUT,
            |paxos: &mut Paxos| paxos.run_check_catch_up(),
        ));
    }

    /// Arms the catch-up exchange itself. A running exchange is
    /// replaced only by a strictly higher priority request.
    pub(crate) fn schedule_catch_up_task(&mut self, priority: Priority, delay: Duration) {
        if let Some(task) = self.catch_up.check_task.take() {
            // while trying to catch up, stop checking whether to
            task.cancel();
        }

        if let Some(task) = &self.catch_up.do_task {
            // an already running exchange survives lower or equal
            // priority requests
            if priority >= task.priority() {
                return;
            }
        }
        if let Some(task) = self.catch_up.do_task.take() {
            task.cancel();
        }

        debug!(
            "{:?} // activating catch-up at {:?}",
            self.descriptor.local_id, priority
        );
        let period = self.catch_up.resend_timeout;
        self.catch_up.do_task = Some(self.dispatcher.schedule_with_fixed_delay(
            priority,
            delay,
            period,
            |paxos: &mut Paxos| paxos.run_do_catch_up(),
        ));
    }

    pub(crate) fn start_catchup(&mut self) {
        self.schedule_catch_up_task(Priority::Low, Duration::ZERO);
    }

    pub(crate) fn force_catchup(&mut self) {
        self.schedule_catch_up_task(Priority::Normal, Duration::ZERO);
    }

    pub(crate) fn run_check_catch_up(&mut self) {
        let window = self.descriptor.config.window_size;
        let first = self.storage.first_uncommitted();
        let next = self.storage.log().next_id();

        // still inside the window?
        if first.offset(window) > next {
            return;
        }
        // after a view change the leader may send itself proposals for
        // old instances; it never catches up with itself
        if self.is_leader() {
            return;
        }

        self.schedule_catch_up_task(Priority::Normal, Duration::ZERO);
    }

    /// One round of the catch-up exchange: build the list of undecided
    /// instances (or a snapshot request) and send it to the best peer.
    fn run_do_catch_up(&mut self) {
        if self.descriptor.local_id == self.leader_id() {
            warn!(
                "{:?} // leader triggered itself for catch-up",
                self.descriptor.local_id
            );
            return;
        }

        let mut target = self.best_catch_up_replica();
        let mut query = CatchUpQuery::default();
        let requested;

        match self.catch_up.mode {
            Mode::Snapshot => {
                if let Some(preferred) = self.catch_up.preferred_snapshot_replica.take() {
                    target = preferred;
                }
                query.snapshot_request = true;
                requested = self.catch_up.rating[target.as_usize()].max(1);
            }
            Mode::Normal => {
                requested = self.fill_unknown_list(&mut query);
                if self.storage.first_uncommitted() == self.storage.log().next_id() {
                    query.periodic = true;
                }
            }
        }

        if target == self.descriptor.local_id {
            return;
        }

        info!(
            "{:?} // sending catch-up query to {} ({} ids, {} ranges, snapshot: {})",
            self.descriptor.local_id,
            target,
            query.instance_ids.len(),
            query.instance_ranges.len(),
            query.snapshot_request
        );

        let message = Message::new(self.storage.view(), MessageKind::CatchUpQuery(query));
        match self.network.send_message(&message, target) {
            Ok(()) => {
                self.catch_up.rating[target.as_usize()] -= requested;
            }
            Err(err) => {
                warn!(
                    "{:?} // catch-up query to {} failed: {}",
                    self.descriptor.local_id, target, err
                );
                self.catch_up.rating[target.as_usize()] = -1;
            }
        }
    }

    /// The peer best suited for catch-up right now; may change during
    /// catching up.
    pub(crate) fn best_catch_up_replica(&mut self) -> ReplicaId {
        let leader = self.leader_id();

        if self.catch_up.ask_leader {
            self.catch_up.ask_leader = false;
            return leader;
        }

        // everyone but this replica and the leader is a candidate
        let candidates: Vec<ReplicaId> = (0..self.descriptor.num_replicas as u32)
            .map(ReplicaId::from)
            .filter(|id| *id != self.descriptor.local_id && *id != leader)
            .collect();

        let mut best = match candidates.first() {
            Some(first) => *first,
            None => return leader,
        };
        for candidate in &candidates {
            if self.catch_up.rating[candidate.as_usize()] > self.catch_up.rating[best.as_usize()]
            {
                best = *candidate;
            }
        }

        // a negative best rating means nobody was useful; go to the
        // leader and start the others from scratch
        if self.catch_up.rating[best.as_usize()] < 0 {
            best = leader;
            for (id, rating) in self.catch_up.rating.iter_mut().enumerate() {
                if id != best.as_usize() {
                    *rating = 0;
                }
            }
        }

        best
    }

    /// Ascending list of instance ids considered undecided, with the
    /// sentinel `last_key + 1` appended. Returns the count embedded.
    fn fill_unknown_list(&self, query: &mut CatchUpQuery) -> i64 {
        let log = self.storage.log();
        if log.is_empty() {
            return 0;
        }
        let last_key: i32 = log.last_key().expect("non-empty log has a last key").into();
        let first: i32 = self
            .storage
            .first_uncommitted()
            .max(log.lowest_available())
            .into();

        let mut count = 1i64;
        let mut run_start: Option<i32> = None;

        for id in first..=last_key {
            let decided = log
                .get_instance(SeqNo::from(id))
                .map(|instance| instance.is_decided())
                .unwrap_or(true);

            if !decided {
                count += 1;
                if run_start.is_none() {
                    run_start = Some(id);
                }
            } else if let Some(start) = run_start.take() {
                if start == id - 1 {
                    query.instance_ids.push(SeqNo::from(start));
                } else {
                    query
                        .instance_ranges
                        .push((SeqNo::from(start), SeqNo::from(id - 1)));
                }
            }
        }
        if let Some(start) = run_start {
            if start == last_key {
                query.instance_ids.push(SeqNo::from(start));
            } else {
                query
                    .instance_ranges
                    .push((SeqNo::from(start), SeqNo::from(last_key)));
            }
        }

        query.instance_ids.push(SeqNo::from(last_key + 1));
        count
    }

    /// Peer side: answer a query with every requested decided instance,
    /// split into transport-sized fragments, or point at a snapshot.
    pub(crate) fn handle_catch_up_query(
        &mut self,
        sender: ReplicaId,
        sent_time: i64,
        query: CatchUpQuery,
    ) {
        if query.snapshot_request {
            let message = match self.storage.last_snapshot() {
                Some(snapshot) => Message::new(
                    self.storage.view(),
                    MessageKind::CatchUpSnapshot {
                        request_time: sent_time,
                        snapshot: (**snapshot).clone(),
                    },
                ),
                None => Message::new(
                    self.storage.view(),
                    MessageKind::CatchUpResponse(CatchUpResponse {
                        periodic: false,
                        snapshot_only: false,
                        last_part: true,
                        request_time: sent_time,
                        decided: Vec::new(),
                    }),
                ),
            };
            let _ = self.network.send_message(&message, sender);
            return;
        }

        if self.storage.log().is_empty() {
            if self.storage.last_snapshot().is_some() {
                self.send_snapshot_only_response(sender, &query, sent_time);
            }
            return;
        }
        let last_key: i32 = self
            .storage
            .log()
            .last_key()
            .expect("non-empty log has a last key")
            .into();

        let mut response = ResponseSender::new(
            &query,
            sent_time,
            self.descriptor.config.max_udp_packet_size,
        );
        let mut served_batches = Vec::new();

        for (lo, hi) in &query.instance_ranges {
            let lo: i32 = (*lo).into();
            let hi: i32 = i32::from(*hi).min(last_key);
            for id in lo..=hi {
                if !self.push_decided(&mut response, &mut served_batches, sender, SeqNo::from(id))
                {
                    self.send_snapshot_only_response(sender, &query, sent_time);
                    return;
                }
            }
        }

        for id in &query.instance_ids {
            if i32::from(*id) >= last_key {
                continue;
            }
            if !self.push_decided(&mut response, &mut served_batches, sender, *id) {
                self.send_snapshot_only_response(sender, &query, sent_time);
                return;
            }
        }

        response.flush(self.network.as_ref(), self.storage.view(), sender);
        self.reforward_batches(sender, served_batches);

        trace!(
            "{:?} // answered catch-up query from {}",
            self.descriptor.local_id,
            sender
        );
    }

    /// Appends one decided instance to the response. `false` when the
    /// id was truncated away, meaning only a snapshot can serve it.
    fn push_decided(
        &self,
        response: &mut ResponseSender,
        served_batches: &mut Vec<batcher::ClientBatchId>,
        sender: ReplicaId,
        id: SeqNo,
    ) -> bool {
        match self.storage.log().get_instance(id) {
            None => false,
            Some(instance) if instance.is_decided() => {
                if let Ok(ids) =
                    batcher::unpack_batch_ids(instance.value().unwrap_or(&[]))
                {
                    served_batches.extend(ids);
                }
                response.add(
                    instance.to_record(),
                    self.network.as_ref(),
                    self.storage.view(),
                    sender,
                );
                true
            }
            Some(_) => true,
        }
    }

    /// The requester may have missed the original batch propagation
    /// while partitioned; served instances are only deliverable there
    /// with their payloads, so forward them again.
    fn reforward_batches(&self, target: ReplicaId, mut ids: Vec<batcher::ClientBatchId>) {
        ids.sort_unstable();
        ids.dedup();
        for batch_id in ids {
            if let Some(requests) = self.batch_store.get_batch(batch_id) {
                let message = Message::new(
                    self.storage.view(),
                    MessageKind::ForwardClientBatch(ForwardedClientBatch { batch_id, requests }),
                );
                let _ = self.network.send_message(&message, target);
            }
        }
    }

    fn send_snapshot_only_response(
        &self,
        sender: ReplicaId,
        query: &CatchUpQuery,
        sent_time: i64,
    ) {
        debug_assert!(self.storage.last_snapshot().is_some());
        let message = Message::new(
            self.storage.view(),
            MessageKind::CatchUpResponse(CatchUpResponse {
                periodic: query.periodic,
                snapshot_only: true,
                last_part: true,
                request_time: sent_time,
                decided: Vec::new(),
            }),
        );
        let _ = self.network.send_message(&message, sender);
        debug!(
            "{:?} // catch-up query from {} answered: snapshot only",
            self.descriptor.local_id, sender
        );
    }

    /// Requester side: fold a response fragment into the log.
    pub(crate) fn handle_catch_up_response(
        &mut self,
        sender: ReplicaId,
        response: CatchUpResponse,
    ) {
        if response.snapshot_only {
            // the peer truncated below our needs; switch to snapshot
            // mode and remember who can serve one
            self.catch_up.mode = Mode::Snapshot;
            for rating in self.catch_up.rating.iter_mut() {
                *rating = (*rating).min(0);
            }
            self.catch_up.preferred_snapshot_replica = Some(sender);

            info!(
                "{:?} // catch-up switching to snapshot mode, preferring {}",
                self.descriptor.local_id, sender
            );

            let delay = self.catch_up.resend_timeout;
            self.schedule_catch_up_task(Priority::Normal, delay);
            return;
        }

        if response.decided.is_empty() {
            if !response.periodic {
                // the peer had nothing at all for us
                let rating = &mut self.catch_up.rating[sender.as_usize()];
                *rating = (*rating - EMPTY_RESPONSE_PENALTY).max(0);
                self.catch_up.ask_leader = true;
            }
            let delay = self.catch_up.resend_timeout;
            self.schedule_catch_up_task(Priority::Normal, delay);
            return;
        }

        self.catch_up.rating[sender.as_usize()] += 2 * response.decided.len() as i64;

        let processing_time = (chrono::Utc::now().timestamp_millis() - response.request_time)
            .max(0) as f64;
        let updated = (1.0 - CONVERGENCE_FACTOR) * self.catch_up.resend_timeout.as_millis() as f64
            + CONVERGENCE_FACTOR * 3.0 * processing_time;
        self.catch_up.resend_timeout =
            Duration::from_millis(updated as u64).max(CATCHUP_MIN_RESEND_TIMEOUT);

        debug!(
            "{:?} // catch-up from {}: {} instances, resend timeout now {:?}",
            self.descriptor.local_id,
            sender,
            response.decided.len(),
            self.catch_up.resend_timeout
        );

        for record in response.decided {
            self.adopt_decided_record(record);
        }

        self.check_catch_up_succeeded();
    }

    /// Adopts one decided instance learned from a peer, unless it was
    /// decided or truncated locally in the meantime.
    fn adopt_decided_record(&mut self, record: InstanceRecord) {
        if record.state != LogEntryState::Decided {
            return;
        }
        let value = match record.value {
            Some(value) => value,
            None => return,
        };
        let batch_ids = batcher::unpack_batch_ids(&value).ok();

        let ready = {
            let instance = match self.storage.log_mut().get_or_create(record.id) {
                Some(instance) => instance,
                // a snapshot covered it already
                None => return,
            };
            if instance.is_decided() {
                false
            } else {
                instance.set_value(record.view, value);
                instance.state() == LogEntryState::Known
            }
        };

        if ready {
            for batch_id in batch_ids.into_iter().flatten() {
                self.batch_store.associate_with_instance(batch_id);
            }
            self.decide(record.id);
        }
    }

    /// A full snapshot arrived: install it in storage and in the state
    /// machine, then resume normal catch-up.
    pub(crate) fn handle_catch_up_snapshot(&mut self, sender: ReplicaId, snapshot: Snapshot) {
        self.catch_up.mode = Mode::Normal;
        let rating = &mut self.catch_up.rating[sender.as_usize()];
        *rating = (*rating).max(5);

        info!(
            "{:?} // catch-up snapshot from {} covering up to {}",
            self.descriptor.local_id, sender, snapshot.next_instance_id
        );

        if snapshot.next_instance_id > self.next_to_deliver {
            let previous = self
                .storage
                .last_snapshot()
                .map(|s| s.next_instance_id)
                .unwrap_or(SeqNo::ZERO);

            let installed = match self.storage.install_snapshot(snapshot.clone()) {
                Ok(installed) => installed,
                Err(err) => self.halt_on_storage_failure(err),
            };
            if installed {
                self.next_to_deliver = snapshot.next_instance_id;
                self.prune_delivered_batches(snapshot.next_instance_id);
                self.snapshot_maintainer.installed(
                    &self.descriptor,
                    previous,
                    snapshot.next_instance_id,
                    snapshot.value.len(),
                );
                self.executor.install_snapshot(snapshot);
                self.storage.log_mut().update_first_uncommitted();
                self.deliver_decided();
            }
        }

        self.check_catch_up_succeeded();
    }

    /// Catch-up is done once the log tail is back inside the window;
    /// the periodic check takes over again.
    pub(crate) fn check_catch_up_succeeded(&mut self) {
        let next = self.storage.log().next_id();
        let tail = if next == SeqNo::ZERO { next } else { next.prev() };
        if self.storage.is_in_window(tail) {
            if self.catch_up.do_task.is_some() {
                info!("{:?} // catch-up succeeded", self.descriptor.local_id);
            }
            self.catch_up.mode = Mode::Normal;
            self.schedule_check_catch_up();
            self.check_recovery_catch_up();
        }
    }
}

/// Accumulates decided instances for one query and flushes them in
/// fragments no larger than the transport allows.
struct ResponseSender {
    periodic: bool,
    request_time: i64,
    max_packet_size: usize,
    base_size: usize,
    current_size: usize,
    pending: Vec<InstanceRecord>,
    anything_sent: bool,
}

impl ResponseSender {
    fn new(query: &CatchUpQuery, request_time: i64, max_packet_size: usize) -> Self {
        // frame header, flags, request time, count
        let base_size = 13 + 1 + 8 + 4;
        ResponseSender {
            periodic: query.periodic,
            request_time,
            max_packet_size,
            base_size,
            current_size: base_size,
            pending: Vec::new(),
            anything_sent: false,
        }
    }

    fn add(
        &mut self,
        record: InstanceRecord,
        network: &dyn Network,
        view: View,
        target: ReplicaId,
    ) {
        let record_size = record.byte_size();
        if self.current_size + record_size > self.max_packet_size && !self.pending.is_empty() {
            self.send_part(network, view, target, false);
            self.current_size = self.base_size;
        }
        self.current_size += record_size;
        self.pending.push(record);
    }

    fn flush(mut self, network: &dyn Network, view: View, target: ReplicaId) {
        if !self.pending.is_empty() || !self.anything_sent {
            self.send_part(network, view, target, true);
        }
    }

    fn send_part(&mut self, network: &dyn Network, view: View, target: ReplicaId, last_part: bool) {
        let decided = std::mem::take(&mut self.pending);
        let message = Message::new(
            view,
            MessageKind::CatchUpResponse(CatchUpResponse {
                periodic: self.periodic,
                snapshot_only: false,
                last_part,
                request_time: self.request_time,
                decided,
            }),
        );
        if let Err(err) = network.send_message(&message, target) {
            warn!("catch-up response to {} failed: {}", target, err);
        }
        self.anything_sent = true;
    }
}
