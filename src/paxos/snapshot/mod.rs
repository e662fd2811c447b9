//! Snapshot maintenance: deciding when the state machine should produce
//! a snapshot, and truncating the log once one is installed.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::paxos::config::ProcessDescriptor;
use crate::paxos::messages::Reply;
use crate::paxos::ordering::SeqNo;
use crate::paxos::Paxos;

/// A checkpoint of the state machine plus the at-most-once reply cache,
/// permitting log truncation below `next_instance_id`.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Snapshot {
    /// The first instance id whose effects are not in `value`.
    pub next_instance_id: SeqNo,
    /// Last reply per client at the snapshot point.
    pub last_replies: Vec<(i64, Reply)>,
    /// Opaque state machine bytes.
    pub value: Vec<u8>,
}

/// Exponential moving average of the snapshot byte size.
#[derive(Debug)]
pub struct MovingAverage {
    factor: f64,
    value: f64,
}

impl MovingAverage {
    pub fn new(factor: f64, initial: f64) -> Self {
        MovingAverage { factor, value: initial }
    }

    pub fn add(&mut self, sample: f64) {
        self.value = self.factor * self.value + (1.0 - self.factor) * sample;
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// What the maintainer wants from the state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SnapshotAction {
    Ask(SeqNo),
    Force(SeqNo),
}

/// Watches the log size and asks the state machine for snapshots when
/// the log outgrows the estimated snapshot size.
pub struct SnapshotMaintainer {
    estimate: MovingAverage,
    /// After how many new instances the ratio is recalculated.
    sampling_rate: i32,
    /// Instance at which the last ratio check ran.
    last_sampling_instance: SeqNo,
    asked: bool,
    forced: bool,
}

impl SnapshotMaintainer {
    pub fn new(descriptor: &ProcessDescriptor) -> Self {
        SnapshotMaintainer {
            estimate: MovingAverage::new(
                0.75,
                descriptor.config.first_snapshot_size_estimate as f64,
            ),
            sampling_rate: descriptor.config.min_snapshot_sampling,
            last_sampling_instance: SeqNo::ZERO,
            asked: false,
            forced: false,
        }
    }

    /// The ratio decision, taken at most once per `sampling_rate` new
    /// instances: ask once the log outweighs the snapshot estimate by
    /// the ask ratio, force at the force ratio.
    pub fn decide(
        &mut self,
        descriptor: &ProcessDescriptor,
        next_id: SeqNo,
        last_snapshot_instance: SeqNo,
        log_bytes: u64,
    ) -> Option<SnapshotAction> {
        if self.asked && self.forced {
            return None;
        }
        if next_id.distance_from(self.last_sampling_instance) < self.sampling_rate {
            return None;
        }
        self.last_sampling_instance = next_id;

        if log_bytes < descriptor.config.snapshot_min_log_size {
            return None;
        }

        let ratio = log_bytes as f64 / self.estimate.get();

        if !self.asked {
            if ratio < descriptor.config.snapshot_ask_ratio {
                return None;
            }
            self.asked = true;
            return Some(SnapshotAction::Ask(last_snapshot_instance));
        }

        if !self.forced {
            if ratio < descriptor.config.snapshot_force_ratio {
                return None;
            }
            self.forced = true;
            return Some(SnapshotAction::Force(last_snapshot_instance));
        }

        None
    }

    /// Bookkeeping after a snapshot is installed.
    pub fn installed(
        &mut self,
        descriptor: &ProcessDescriptor,
        previous_next_id: SeqNo,
        snapshot_next_id: SeqNo,
        snapshot_bytes: usize,
    ) {
        self.asked = false;
        self.forced = false;
        self.estimate.add(snapshot_bytes as f64);
        self.sampling_rate = (snapshot_next_id.distance_from(previous_next_id) / 5)
            .max(descriptor.config.min_snapshot_sampling);
    }
}

impl Paxos {
    /// Fired synchronously on the dispatcher after every log mutation.
    pub(crate) fn log_size_changed(&mut self) {
        let last_snapshot_instance = self
            .storage
            .last_snapshot()
            .map(|snapshot| snapshot.next_instance_id)
            .unwrap_or(SeqNo::ZERO);

        let log_bytes = self
            .storage
            .log()
            .byte_size_between(last_snapshot_instance, self.storage.first_uncommitted());

        let action = self.snapshot_maintainer.decide(
            &self.descriptor,
            self.storage.log().next_id(),
            last_snapshot_instance,
            log_bytes,
        );

        match action {
            Some(SnapshotAction::Ask(instance)) => {
                debug!(
                    "{:?} // asking state machine for a snapshot above {}",
                    self.descriptor.local_id, instance
                );
                self.executor.ask_for_snapshot(instance);
            }
            Some(SnapshotAction::Force(instance)) => {
                debug!(
                    "{:?} // forcing state machine snapshot above {}",
                    self.descriptor.local_id, instance
                );
                self.executor.force_snapshot(instance);
            }
            None => {}
        }
    }

    /// Receives a snapshot from the state machine, records it durably
    /// and truncates the log below the previously covered prefix.
    pub(crate) fn on_snapshot_made(&mut self, snapshot: Snapshot) {
        let previous = self
            .storage
            .last_snapshot()
            .map(|s| s.next_instance_id)
            .unwrap_or(SeqNo::ZERO);

        if snapshot.next_instance_id <= previous && previous > SeqNo::ZERO {
            warn!(
                "{:?} // snapshot for {} not newer than current {}, dropping",
                self.descriptor.local_id, snapshot.next_instance_id, previous
            );
            return;
        }

        let next = snapshot.next_instance_id;
        let bytes = snapshot.value.len();

        if let Err(err) = self.storage.set_last_snapshot(snapshot) {
            self.halt_on_storage_failure(err);
        }
        // keep the instances between the previous and the new snapshot
        // around for peers that are still catching up on them
        self.storage.log_mut().truncate_below(previous);
        self.prune_delivered_batches(previous);

        self.snapshot_maintainer
            .installed(&self.descriptor, previous, next, bytes);

        debug!(
            "{:?} // snapshot installed for {}, truncated below {}",
            self.descriptor.local_id, next, previous
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::config::Configuration;

    fn descriptor() -> ProcessDescriptor {
        let config = Configuration {
            first_snapshot_size_estimate: 100,
            snapshot_min_log_size: 200,
            snapshot_ask_ratio: 1.0,
            snapshot_force_ratio: 2.0,
            min_snapshot_sampling: 10,
            ..Configuration::default()
        };
        ProcessDescriptor::new(config, 0).unwrap()
    }

    #[test]
    fn moving_average_converges() {
        let mut avg = MovingAverage::new(0.75, 100.0);
        for _ in 0..50 {
            avg.add(200.0);
        }
        assert!((avg.get() - 200.0).abs() < 1.0);
    }

    #[test]
    fn small_logs_are_left_alone() {
        let descriptor = descriptor();
        let mut maintainer = SnapshotMaintainer::new(&descriptor);
        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(50), SeqNo::ZERO, 100),
            None
        );
    }

    #[test]
    fn sampling_rate_gates_checks() {
        let descriptor = descriptor();
        let mut maintainer = SnapshotMaintainer::new(&descriptor);
        // below the sampling distance nothing happens, however large the log
        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(5), SeqNo::ZERO, 100_000),
            None
        );
        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(10), SeqNo::ZERO, 100_000),
            Some(SnapshotAction::Ask(SeqNo::ZERO))
        );
    }

    #[test]
    fn ask_then_force() {
        let descriptor = descriptor();
        let mut maintainer = SnapshotMaintainer::new(&descriptor);

        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(10), SeqNo::ZERO, 250),
            Some(SnapshotAction::Ask(SeqNo::ZERO))
        );
        // asked already; a shrunken log stays below the minimum size
        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(20), SeqNo::ZERO, 150),
            None
        );
        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(30), SeqNo::ZERO, 250),
            Some(SnapshotAction::Force(SeqNo::ZERO))
        );
        // both flags set, maintainer stays quiet until installation
        assert_eq!(
            maintainer.decide(&descriptor, SeqNo::from(40), SeqNo::ZERO, 9_999),
            None
        );

        maintainer.installed(&descriptor, SeqNo::ZERO, SeqNo::from(100), 120);
        assert_eq!(maintainer.sampling_rate, 20);
        assert!(!maintainer.asked);
        assert!(!maintainer.forced);
    }
}
