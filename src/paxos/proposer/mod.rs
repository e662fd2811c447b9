//! The leader role: Prepare on view change, Propose for new values,
//! and the window of concurrently open instances.
//!
//! The proposer moves Inactive -> Preparing -> Prepared. A prepare
//! round collects PrepareOk answers from a majority, adopts the value
//! voted at the highest reported view for every open instance, fills
//! the gaps with no-ops, and only then starts ordering new batches.

use std::collections::{HashMap, VecDeque};

use log::{debug, info, trace, warn};

use crate::paxos::batcher::{self, ClientBatchId};
use crate::paxos::dispatcher::{Priority, PriorityTask};
use crate::paxos::messages::{InstanceRecord, Message, MessageKind};
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::retransmit::RetransmittedMessage;
use crate::paxos::storage::LogEntryState;
use crate::paxos::Paxos;

/// One-shot continuations run when the prepare round settles; exactly
/// one of the two closures is invoked.
pub struct PreparedCallback {
    pub on_prepared: Box<dyn FnOnce(&mut Paxos) + Send>,
    pub on_failed_to_prepare: Box<dyn FnOnce(&mut Paxos) + Send>,
}

/// An in-flight prepare round.
pub struct PrepareRound {
    view: View,
    /// Bitmask of replicas whose PrepareOk was merged, self included.
    received: u64,
    /// Per instance, the answer voted at the highest view seen so far.
    records: HashMap<i32, InstanceRecord>,
    /// One past the highest instance id anyone reported.
    max_reported: SeqNo,
}

pub enum ProposerState {
    Inactive,
    Preparing(PrepareRound),
    Prepared,
}

impl ProposerState {
    pub fn name(&self) -> &'static str {
        match self {
            ProposerState::Inactive => "inactive",
            ProposerState::Preparing(_) => "preparing",
            ProposerState::Prepared => "prepared",
        }
    }
}

/// Leader-side state, owned by the consensus dispatcher.
pub struct Proposer {
    pub(crate) state: ProposerState,
    prepared_callbacks: VecDeque<PreparedCallback>,
    /// Propose retransmissions keyed by instance id.
    propose_retransmits: HashMap<i32, RetransmittedMessage>,
    prepare_retransmit: Option<RetransmittedMessage>,
    /// Armed while an undersized batch waits out the batch delay.
    batch_deadline: Option<PriorityTask>,
}

impl Proposer {
    pub fn new() -> Self {
        Proposer {
            state: ProposerState::Inactive,
            prepared_callbacks: VecDeque::new(),
            propose_retransmits: HashMap::new(),
            prepare_retransmit: None,
            batch_deadline: None,
        }
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self.state, ProposerState::Prepared)
    }

    /// Stops retransmitting the Propose for `id` entirely.
    pub fn stop_propose(&mut self, id: SeqNo) {
        if let Some(retransmit) = self.propose_retransmits.remove(&i32::from(id)) {
            retransmit.stop();
        }
    }

    /// Crosses one destination off the Propose for `id`.
    pub fn stop_propose_target(&mut self, id: SeqNo, target: ReplicaId) {
        if let Some(retransmit) = self.propose_retransmits.get(&i32::from(id)) {
            retransmit.stop_target(target);
        }
    }

    fn drain_callbacks(&mut self) -> VecDeque<PreparedCallback> {
        std::mem::take(&mut self.prepared_callbacks)
    }
}

impl Default for Proposer {
    fn default() -> Self {
        Proposer::new()
    }
}

fn merge_record(records: &mut HashMap<i32, InstanceRecord>, record: InstanceRecord) {
    if record.state == LogEntryState::Unknown {
        return;
    }
    match records.get(&i32::from(record.id)) {
        Some(current) => {
            // a decided answer is authoritative; otherwise the vote at
            // the highest view wins, the classic rule
            let replace = (record.state == LogEntryState::Decided
                && current.state != LogEntryState::Decided)
                || (current.state != LogEntryState::Decided && record.view > current.view);
            if replace {
                records.insert(record.id.into(), record);
            }
        }
        None => {
            records.insert(record.id.into(), record);
        }
    }
}

impl Paxos {
    /// Moves to the smallest view above the current one that this
    /// replica leads, durably, and starts collecting promises for it.
    pub(crate) fn prepare_next_view(&mut self) {
        self.stop_proposer();

        let mut view = self.storage.view().next();
        while !self.descriptor.is_local_process_leader(view) {
            view = view.next();
        }
        if let Err(err) = self.storage.set_view(view) {
            self.halt_on_storage_failure(err);
        }

        info!("{:?} // preparing view {}", self.descriptor.local_id, view);

        let mut round = PrepareRound {
            view,
            received: self.descriptor.local_id.mask_bit(),
            records: HashMap::new(),
            max_reported: self.storage.log().next_id(),
        };
        // this replica is an acceptor of its own round
        for record in self.storage.log().voted_records() {
            merge_record(&mut round.records, record);
        }
        self.proposer.state = ProposerState::Preparing(round);

        let others = self.descriptor.other_replicas();
        if !others.is_empty() {
            let message = Message::new(view, MessageKind::Prepare);
            self.proposer.prepare_retransmit =
                Some(self.retransmitter.start_transmitting(message, others));
        }

        self.fd_reconfigure();
        self.maybe_finish_prepare();
    }

    /// Merges one PrepareOk into the running round.
    pub(crate) fn on_prepare_ok(
        &mut self,
        sender: ReplicaId,
        view: View,
        records: Vec<InstanceRecord>,
    ) {
        let local_id = self.descriptor.local_id;
        let round = match &mut self.proposer.state {
            ProposerState::Preparing(round) => round,
            other => {
                trace!(
                    "{:?} // prepare answer from {} while {}, dropping",
                    local_id,
                    sender,
                    other.name()
                );
                return;
            }
        };
        if view != round.view {
            return;
        }

        round.received |= sender.mask_bit();
        for record in records {
            if record.id.next() > round.max_reported {
                round.max_reported = record.id.next();
            }
            merge_record(&mut round.records, record);
        }

        if let Some(retransmit) = &self.proposer.prepare_retransmit {
            retransmit.stop_target(sender);
        }

        self.maybe_finish_prepare();
    }

    fn maybe_finish_prepare(&mut self) {
        let quorum = match &self.proposer.state {
            ProposerState::Preparing(round) => {
                round.received.count_ones() as usize >= self.descriptor.majority
            }
            _ => false,
        };
        if quorum {
            self.finish_prepare();
        }
    }

    /// A majority promised: adopt, fill with no-ops, become leader.
    fn finish_prepare(&mut self) {
        let round =
            match std::mem::replace(&mut self.proposer.state, ProposerState::Prepared) {
                ProposerState::Preparing(round) => round,
                _ => unreachable!("finish_prepare outside a prepare round"),
            };
        if let Some(retransmit) = self.proposer.prepare_retransmit.take() {
            retransmit.stop();
        }

        let view = round.view;
        debug_assert_eq!(view, self.storage.view());

        let first = self.storage.first_uncommitted();
        info!(
            "{:?} // view {} prepared, re-proposing instances {}..{}",
            self.descriptor.local_id, view, first, round.max_reported
        );

        let mut instance_id = first;
        while instance_id < round.max_reported {
            let record = round.records.get(&i32::from(instance_id));
            let (value, already_decided) = match record {
                Some(record) => (
                    record
                        .value
                        .clone()
                        .unwrap_or_else(batcher::noop_value),
                    record.state == LogEntryState::Decided,
                ),
                None => (batcher::noop_value(), false),
            };
            self.repropose(instance_id, view, value, already_decided);
            instance_id = instance_id.next();
        }

        let callbacks = self.proposer.drain_callbacks();
        for callback in callbacks {
            (callback.on_prepared)(self);
        }

        self.fd_reconfigure();
        self.try_propose_pending(true);
        self.log_size_changed();
    }

    fn repropose(&mut self, id: SeqNo, view: View, value: Vec<u8>, already_decided: bool) {
        if let Err(err) = self.storage.log_proposal(id, view, &value) {
            self.halt_on_storage_failure(err);
        }

        let skip = {
            let instance = match self.storage.log_mut().get_or_create(id) {
                Some(instance) => instance,
                // truncated by a snapshot meanwhile
                None => return,
            };
            if instance.is_decided() {
                true
            } else {
                instance.set_value(view, value.clone());
                false
            }
        };
        if skip {
            return;
        }

        self.associate_value_batches(&value);
        self.send_propose(id);
        if already_decided {
            // a quorum member already knew the decision; no need to
            // wait for a second round of votes on the same value
            self.decide(id);
        }
    }

    /// Allocates and proposes consensus values packed from forwarded
    /// client batches. With `force`, an undersized value is proposed
    /// immediately instead of waiting out the batch delay.
    pub(crate) fn try_propose_pending(&mut self, force: bool) {
        if !self.proposer.is_prepared() {
            return;
        }

        let max_ids = batcher::max_ids_per_value(self.descriptor.config.batching_level);

        loop {
            if !self.batch_store.has_instanceless() {
                if let Some(task) = self.proposer.batch_deadline.take() {
                    task.cancel();
                }
                return;
            }
            if self.storage.is_window_full() {
                // stalled until first_uncommitted advances
                trace!("{:?} // window full, proposer stalled", self.descriptor.local_id);
                return;
            }

            if !force && self.batch_store.instanceless_count() < max_ids {
                if self.proposer.batch_deadline.is_none() {
                    let delay = self.descriptor.config.max_batch_delay;
                    self.proposer.batch_deadline = Some(self.dispatcher.schedule(
                        Priority::High,
                        delay,
                        |paxos: &mut Paxos| {
                            paxos.proposer.batch_deadline = None;
                            paxos.try_propose_pending(true);
                        },
                    ));
                }
                return;
            }

            let ids = self.batch_store.take_instanceless(max_ids);
            if ids.is_empty() {
                return;
            }
            self.propose_value(&ids);
        }
    }

    fn propose_value(&mut self, ids: &[ClientBatchId]) {
        let value = batcher::pack_batch_ids(ids);
        let view = self.storage.view();

        if let Err(err) = self
            .storage
            .log_proposal(self.storage.log().next_id(), view, &value)
        {
            self.halt_on_storage_failure(err);
        }
        let id = self.storage.log_mut().append(view, value);

        debug!(
            "{:?} // proposing instance {} at {} with {} batches",
            self.descriptor.local_id,
            id,
            view,
            ids.len()
        );

        self.send_propose(id);
        self.log_size_changed();
    }

    /// Broadcasts the Propose for `id` under retransmission and casts
    /// the leader's own vote.
    fn send_propose(&mut self, id: SeqNo) {
        let local = self.descriptor.local_id;
        let majority = self.descriptor.majority;

        let (view, value, decided_alone) = {
            let instance = self
                .storage
                .log_mut()
                .get_instance_mut(id)
                .expect("proposing an instance outside the log");
            let view = instance.view();
            let value = instance
                .value()
                .expect("proposing an instance without a value")
                .to_vec();
            let count = instance.add_accept(local);
            (view, value, count >= majority && !instance.is_decided())
        };

        let others = self.descriptor.other_replicas();
        if !others.is_empty() {
            let message = Message::new(view, MessageKind::Propose { id, value });
            let handle = self.retransmitter.start_transmitting(message, others);
            if let Some(old) = self
                .proposer
                .propose_retransmits
                .insert(id.into(), handle)
            {
                old.stop();
            }
        }

        if decided_alone {
            // a single-replica group decides on its own vote
            self.decide(id);
        }
    }

    /// Registers continuations to run once the proposer settles. When
    /// it is already settled, the matching continuation runs at once.
    pub(crate) fn execute_on_prepared(&mut self, callback: PreparedCallback) {
        match self.proposer.state {
            ProposerState::Preparing(_) => {
                self.proposer.prepared_callbacks.push_back(callback);
            }
            ProposerState::Prepared => (callback.on_prepared)(self),
            ProposerState::Inactive => (callback.on_failed_to_prepare)(self),
        }
    }

    /// Cancels every outstanding retransmission and callback and
    /// returns to Inactive. Safe to call in any state.
    pub(crate) fn stop_proposer(&mut self) {
        if let Some(retransmit) = self.proposer.prepare_retransmit.take() {
            retransmit.stop();
        }
        for (_, retransmit) in self.proposer.propose_retransmits.drain() {
            retransmit.stop();
        }
        if let Some(task) = self.proposer.batch_deadline.take() {
            task.cancel();
        }

        let previous = std::mem::replace(&mut self.proposer.state, ProposerState::Inactive);
        if !matches!(previous, ProposerState::Inactive) {
            warn!(
                "{:?} // proposer stopped while {}",
                self.descriptor.local_id,
                previous.name()
            );
        }

        let callbacks = self.proposer.drain_callbacks();
        for callback in callbacks {
            (callback.on_failed_to_prepare)(self);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, view: i32, state: LogEntryState, value: u8) -> InstanceRecord {
        InstanceRecord {
            id: SeqNo::from(id),
            view: View::from(view),
            state,
            value: match state {
                LogEntryState::Unknown => None,
                _ => Some(vec![value]),
            },
        }
    }

    #[test]
    fn merge_keeps_highest_view_vote() {
        let mut records = HashMap::new();
        merge_record(&mut records, record(1, 1, LogEntryState::Known, 0xA));
        merge_record(&mut records, record(1, 3, LogEntryState::Known, 0xB));
        merge_record(&mut records, record(1, 2, LogEntryState::Known, 0xC));
        assert_eq!(records[&1].value, Some(vec![0xB]));
    }

    #[test]
    fn merge_prefers_decided_answers() {
        let mut records = HashMap::new();
        merge_record(&mut records, record(2, 5, LogEntryState::Known, 0xA));
        merge_record(&mut records, record(2, 1, LogEntryState::Decided, 0xB));
        // nothing beats a decided answer, not even a later view
        merge_record(&mut records, record(2, 9, LogEntryState::Known, 0xC));
        assert_eq!(records[&2].state, LogEntryState::Decided);
        assert_eq!(records[&2].value, Some(vec![0xB]));
    }

    #[test]
    fn merge_ignores_unknown_entries() {
        let mut records = HashMap::new();
        merge_record(&mut records, record(3, 1, LogEntryState::Unknown, 0));
        assert!(records.is_empty());
    }
}
