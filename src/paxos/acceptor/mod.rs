//! The follower role: answering Prepare with the local votes, recording
//! proposed values, and crediting Accept votes until a decision.
//!
//! View gating happens in the routing layer: by the time a handler here
//! runs, a gated message carries either the current view or, for
//! Prepare only, a lower one.

use log::{debug, trace};

use crate::paxos::batcher;
use crate::paxos::messages::{Message, MessageKind};
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::storage::LogEntryState;
use crate::paxos::Paxos;

impl Paxos {
    /// Handles a Prepare for `view`.
    ///
    /// An equal view is answered idempotently (the proposer
    /// retransmits). A lower view is answered with a PrepareOk bearing
    /// the promised view and no entries; the stale proposer observes
    /// the higher view and fails its round.
    pub(crate) fn on_prepare(&mut self, sender: ReplicaId, view: View) {
        let promised = self.storage.view();

        if view < promised {
            trace!(
                "{:?} // prepare for {} below promised {}, answering with promise",
                self.descriptor.local_id,
                view,
                promised
            );
            let nack = Message::new(promised, MessageKind::PrepareOk(Vec::new()));
            let _ = self.network.send_message(&nack, sender);
            return;
        }

        // the routing layer persisted any view raise before this point;
        // every vote still held is reported, decided entries included,
        // or a lagging leader could no-op over a decided instance
        let records = self.storage.log().voted_records();
        debug!(
            "{:?} // answering prepare for {} from {} with {} entries",
            self.descriptor.local_id,
            view,
            sender,
            records.len()
        );
        let message = Message::new(promised, MessageKind::PrepareOk(records));
        let _ = self.network.send_message(&message, sender);
    }

    /// Records a proposed value and votes Accept for it.
    pub(crate) fn on_propose(&mut self, sender: ReplicaId, view: View, id: SeqNo, value: Vec<u8>) {
        if id < self.storage.log().lowest_available() {
            // already covered by a snapshot
            return;
        }

        // the proposal must be durable before the Accept leaves
        if let Err(err) = self.storage.log_proposal(id, view, &value) {
            self.halt_on_storage_failure(err);
        }

        match batcher::unpack_batch_ids(&value) {
            Ok(ids) => {
                for batch_id in ids {
                    self.batch_store.associate_with_instance(batch_id);
                }
            }
            Err(err) => {
                debug!(
                    "{:?} // undecodable value proposed for {}: {}",
                    self.descriptor.local_id, id, err
                );
                return;
            }
        }

        let leader = self.descriptor.leader_of_view(view);
        let local = self.descriptor.local_id;
        let majority = self.descriptor.majority;

        let decided_now = {
            let instance = match self.storage.log_mut().get_or_create(id) {
                Some(instance) => instance,
                None => return,
            };
            instance.set_value(view, value);
            // the proposer voted by proposing; this replica votes by
            // accepting
            instance.add_accept(leader);
            let count = instance.add_accept(local);
            !instance.is_decided() && instance.state() == LogEntryState::Known && count >= majority
        };

        trace!("{:?} // accepting instance {} at {}", local, id, view);
        let accept = Message::new(view, MessageKind::Accept { id });
        self.network
            .send_to_many(&accept, &self.descriptor.other_replicas());

        self.log_size_changed();

        if decided_now {
            self.decide(id);
        } else {
            self.deliver_decided();
        }

        // a proposal past the window means earlier instances are
        // missing here
        if !self.storage.is_in_window(id) && !self.is_leader() {
            self.start_catchup();
        }
    }

    /// Credits an Accept vote; a quorum decides the instance.
    /// Re-delivery of the same Accept leaves the vote set unchanged.
    pub(crate) fn on_accept(&mut self, sender: ReplicaId, view: View, id: SeqNo) {
        if id < self.storage.log().lowest_available() {
            return;
        }

        let majority = self.descriptor.majority;
        let decided_now = {
            let instance = match self.storage.log_mut().get_or_create(id) {
                Some(instance) => instance,
                None => return,
            };
            if instance.is_decided() {
                // duplicate or late vote for a settled instance
                None
            } else {
                let count = instance.add_accept(sender);
                Some(instance.state() == LogEntryState::Known && count >= majority)
            }
        };

        // the vote doubles as an ack for the proposer's retransmission
        self.proposer.stop_propose_target(id, sender);

        match decided_now {
            Some(true) => {
                trace!(
                    "{:?} // instance {} decided at {} after vote from {}",
                    self.descriptor.local_id,
                    id,
                    view,
                    sender
                );
                self.decide(id);
            }
            _ => {}
        }
    }
}
