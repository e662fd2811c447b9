//! View-SS recovery: a restarting replica only trusts its durable view
//! number. It asks its peers for the current view and log extent,
//! catches up to what the leader reported, and only then serves
//! recovery requests itself.

use log::{debug, info, trace};

use crate::paxos::messages::{Message, MessageKind};
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::proposer::{PreparedCallback, ProposerState};
use crate::paxos::retransmit::RetransmittedMessage;
use crate::paxos::Paxos;

/// Recovery-side state, owned by the consensus dispatcher.
pub struct Recovery {
    done: bool,
    /// Bitmask of replicas whose RecoveryAnswer arrived.
    received: u64,
    answer_from_leader: Option<(View, i64)>,
    retransmit: Option<RetransmittedMessage>,
    /// The log extent the leader reported; recovery finishes once the
    /// decided prefix reaches it.
    catch_up_target: Option<SeqNo>,
}

impl Recovery {
    pub fn new() -> Self {
        Recovery {
            done: false,
            received: 0,
            answer_from_leader: None,
            retransmit: None,
            catch_up_target: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Recovery::new()
    }
}

impl Paxos {
    /// Broadcasts Recovery until a majority answers. The view was
    /// already moved past a crashed leadership at storage open.
    pub(crate) fn start_recovery(&mut self) {
        let others = self.descriptor.other_replicas();
        if others.is_empty() {
            self.finish_recovery();
            return;
        }

        info!(
            "{:?} // starting view recovery at {}",
            self.descriptor.local_id,
            self.storage.view()
        );

        let message = Message::new(
            self.storage.view(),
            MessageKind::Recovery {
                view_on_crash: self.storage.view(),
                epoch: -1,
            },
        );
        self.recovery.retransmit = Some(self.retransmitter.start_transmitting(message, others));
    }

    /// Collects one RecoveryAnswer while recovering.
    pub(crate) fn handle_recovery_answer(
        &mut self,
        sender: ReplicaId,
        view: View,
        next_id: i64,
    ) {
        if self.recovery.done || self.recovery.retransmit.is_none() {
            return;
        }
        // answers from lower views are useless
        if view < self.storage.view() {
            return;
        }

        debug!(
            "{:?} // recovery answer from {}: view {}, next id {}",
            self.descriptor.local_id, sender, view, next_id
        );

        if let Some(retransmit) = &self.recovery.retransmit {
            retransmit.stop_target(sender);
        }
        self.recovery.received |= sender.mask_bit();

        if self.storage.view() < view {
            if let Err(err) = self.storage.set_view(view) {
                self.halt_on_storage_failure(err);
            }
            // whatever we heard from the old leader is now stale
            self.recovery.answer_from_leader = None;
        }

        if self.descriptor.leader_of_view(self.storage.view()) == sender {
            self.recovery.answer_from_leader = Some((view, next_id));
        }

        if self.recovery.received.count_ones() as usize > self.descriptor.num_replicas / 2 {
            self.recovery_on_majority();
        }
    }

    fn recovery_on_majority(&mut self) {
        if let Some(retransmit) = self.recovery.retransmit.take() {
            retransmit.stop();
        }

        match self.recovery.answer_from_leader {
            None => {
                // no word from the current leader yet; ask again at the
                // view we ended up in
                debug!(
                    "{:?} // recovery majority without a leader answer, retrying at {}",
                    self.descriptor.local_id,
                    self.storage.view()
                );
                let message = Message::new(
                    self.storage.view(),
                    MessageKind::Recovery {
                        view_on_crash: self.storage.view(),
                        epoch: -1,
                    },
                );
                self.recovery.retransmit = Some(
                    self.retransmitter
                        .start_transmitting(message, self.descriptor.other_replicas()),
                );
            }
            Some((_, next_id)) => {
                let target = SeqNo::from(next_id as i32);
                if self.storage.first_uncommitted() >= target {
                    self.finish_recovery();
                } else {
                    info!(
                        "{:?} // recovery catching up to instance {}",
                        self.descriptor.local_id, target
                    );
                    self.recovery.catch_up_target = Some(target);
                    self.force_catchup();
                }
            }
        }
    }

    /// Called whenever the decided prefix advances; completes recovery
    /// once the leader-reported extent is reached.
    pub(crate) fn check_recovery_catch_up(&mut self) {
        if let Some(target) = self.recovery.catch_up_target {
            if self.storage.first_uncommitted() >= target {
                self.recovery.catch_up_target = None;
                self.finish_recovery();
            }
        }
    }

    /// Recovery is over: start the regular machinery and serve future
    /// Recovery requests.
    pub(crate) fn finish_recovery(&mut self) {
        if self.recovery.done {
            return;
        }
        self.recovery.done = true;

        info!(
            "{:?} // recovery finished at view {}",
            self.descriptor.local_id,
            self.storage.view()
        );

        self.schedule_check_catch_up();
        self.fd_reset();
        self.fd_reconfigure();

        if self.descriptor.is_local_process_leader(self.storage.view()) {
            self.prepare_next_view();
        }
    }

    /// Serves a Recovery request from a restarting peer, once this
    /// replica itself has recovered.
    pub(crate) fn handle_recovery(&mut self, sender: ReplicaId, view_on_crash: View) {
        if !self.recovery.done {
            trace!(
                "{:?} // ignoring recovery request from {} while recovering",
                self.descriptor.local_id,
                sender
            );
            return;
        }

        // if the current leader is the one recovering we cannot answer
        // for it; and a crash view at or above ours proves our view is
        // stale either way: force a view change and look again
        if self.leader_id() == sender || view_on_crash >= self.storage.view() {
            info!(
                "{:?} // delaying recovery request from {}, forcing view change",
                self.descriptor.local_id, sender
            );
            if !matches!(self.proposer.state, ProposerState::Inactive) {
                self.stop_proposer();
            }
            self.prepare_next_view();
            self.resubmit_recovery(sender, view_on_crash);
            return;
        }

        if self.is_leader() && matches!(self.proposer.state, ProposerState::Preparing(_)) {
            // answer once the view is prepared, either way
            info!(
                "{:?} // delaying recovery request from {} until prepared",
                self.descriptor.local_id, sender
            );
            let crash_view = view_on_crash;
            self.execute_on_prepared(PreparedCallback {
                on_prepared: Box::new(move |paxos| paxos.resubmit_recovery(sender, crash_view)),
                on_failed_to_prepare: Box::new(move |paxos| {
                    paxos.resubmit_recovery(sender, crash_view)
                }),
            });
            return;
        }

        let answer = Message::new(
            self.storage.view(),
            MessageKind::RecoveryAnswer {
                view: self.storage.view(),
                next_id: i32::from(self.storage.log().next_id()) as i64,
            },
        );
        debug!(
            "{:?} // answering recovery request from {}",
            self.descriptor.local_id, sender
        );
        let _ = self.network.send_message(&answer, sender);
    }

    fn resubmit_recovery(&mut self, sender: ReplicaId, view_on_crash: View) {
        let message = Message::new(
            view_on_crash,
            MessageKind::Recovery {
                view_on_crash,
                epoch: -1,
            },
        );
        self.dispatcher
            .submit(move |paxos| paxos.process_message(message, sender));
    }
}
