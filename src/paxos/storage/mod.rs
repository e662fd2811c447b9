//! The in-memory log of consensus instances and the durable state
//! backing it.
//!
//! The log and all view state are dispatcher-exclusive: every mutation
//! happens inside the consensus dispatcher. Crash safety rests on two
//! rules enforced here: a view increase is durable before it becomes
//! visible to any other component, and a decided instance can never
//! change its value.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::paxos::config::ProcessDescriptor;
use crate::paxos::error::*;
use crate::paxos::messages::InstanceRecord;
use crate::paxos::ordering::{Orderable, ReplicaId, SeqNo, View};
use crate::paxos::snapshot::Snapshot;

pub mod stable;

use self::stable::StableStorage;

/// Lifecycle of a log entry.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum LogEntryState {
    /// The instance id has been seen, but no value for it.
    Unknown = 0,
    /// A value was accepted but not yet decided.
    Known = 1,
    /// The value is final.
    Decided = 2,
}

impl LogEntryState {
    pub fn from_u8(tag: u8) -> Option<LogEntryState> {
        Some(match tag {
            0 => LogEntryState::Unknown,
            1 => LogEntryState::Known,
            2 => LogEntryState::Decided,
            _ => return None,
        })
    }
}

/// One slot of the replicated log.
#[derive(Debug, Clone)]
pub struct ConsensusInstance {
    id: SeqNo,
    view: View,
    value: Option<Vec<u8>>,
    state: LogEntryState,
    /// Bitmask of replicas that voted Accept for the current `(view, value)`.
    accepts: u64,
}

impl Orderable for ConsensusInstance {
    fn sequence_number(&self) -> SeqNo {
        self.id
    }
}

impl ConsensusInstance {
    fn new(id: SeqNo) -> Self {
        ConsensusInstance {
            id,
            view: View::ZERO,
            value: None,
            state: LogEntryState::Unknown,
            accepts: 0,
        }
    }

    pub fn id(&self) -> SeqNo {
        self.id
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn state(&self) -> LogEntryState {
        self.state
    }

    pub fn is_decided(&self) -> bool {
        self.state == LogEntryState::Decided
    }

    /// Records a value voted at `view`.
    ///
    /// A decided instance can never change value; two decisions for the
    /// same instance with different values mean the protocol invariants
    /// are broken and the process must not continue.
    pub fn set_value(&mut self, view: View, value: Vec<u8>) {
        if self.state == LogEntryState::Decided {
            assert_eq!(
                self.value.as_ref(),
                Some(&value),
                "value of decided instance {} changed",
                self.id
            );
            return;
        }
        if view < self.view {
            // vote from an older ballot
            return;
        }
        if view > self.view {
            // a higher ballot overrides the vote and its accepts
            self.accepts = 0;
            self.view = view;
        }
        self.value = Some(value);
        self.state = LogEntryState::Known;
    }

    /// Credits an Accept vote. Idempotent per replica.
    pub fn add_accept(&mut self, replica: ReplicaId) -> usize {
        self.accepts |= replica.mask_bit();
        self.accepts.count_ones() as usize
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.count_ones() as usize
    }

    /// Marks the instance final.
    pub fn set_decided(&mut self) {
        debug_assert!(
            self.value.is_some(),
            "deciding instance {} without a value",
            self.id
        );
        self.state = LogEntryState::Decided;
    }

    /// Approximate serialized size, used for snapshot ratio decisions
    /// and catch-up response fragmentation.
    pub fn byte_size(&self) -> u64 {
        (4 + 4 + 1 + 4 + self.value.as_ref().map(Vec::len).unwrap_or(0)) as u64
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            view: self.view,
            state: self.state,
            value: self.value.clone(),
        }
    }
}

/// The sparse, dense-in-range mapping from instance id to instance.
///
/// Instances exist for every id in `[lowest_available, next_id)`; ids
/// below `lowest_available` have been truncated by a snapshot.
pub struct Log {
    instances: BTreeMap<i32, ConsensusInstance>,
    next_id: SeqNo,
    lowest_available: SeqNo,
    first_uncommitted: SeqNo,
}

impl Log {
    pub fn new() -> Self {
        Log {
            instances: BTreeMap::new(),
            next_id: SeqNo::ZERO,
            lowest_available: SeqNo::ZERO,
            first_uncommitted: SeqNo::ZERO,
        }
    }

    pub fn next_id(&self) -> SeqNo {
        self.next_id
    }

    /// The lowest instance id not yet decided.
    pub fn first_uncommitted(&self) -> SeqNo {
        self.first_uncommitted
    }

    pub fn lowest_available(&self) -> SeqNo {
        self.lowest_available
    }

    /// Number of instances currently held.
    pub fn size(&self) -> usize {
        self.instances.len()
    }

    pub fn get_instance(&self, id: SeqNo) -> Option<&ConsensusInstance> {
        self.instances.get(&i32::from(id))
    }

    pub fn get_instance_mut(&mut self, id: SeqNo) -> Option<&mut ConsensusInstance> {
        self.instances.get_mut(&i32::from(id))
    }

    /// Returns the instance for `id`, creating it (and any missing
    /// predecessors, to keep the range dense) when `id` has not been
    /// allocated yet. `None` when `id` was truncated away.
    pub fn get_or_create(&mut self, id: SeqNo) -> Option<&mut ConsensusInstance> {
        if id < self.lowest_available {
            return None;
        }
        if id >= self.next_id {
            let mut new_id = self.next_id;
            while new_id <= id {
                self.instances
                    .insert(new_id.into(), ConsensusInstance::new(new_id));
                new_id = new_id.next();
            }
            self.next_id = id.next();
        }
        self.instances.get_mut(&i32::from(id))
    }

    /// Allocates the next instance with a value already voted at `view`.
    pub fn append(&mut self, view: View, value: Vec<u8>) -> SeqNo {
        let id = self.next_id;
        let mut instance = ConsensusInstance::new(id);
        instance.set_value(view, value);
        self.instances.insert(id.into(), instance);
        self.next_id = id.next();
        id
    }

    /// Drops every instance below `id`. Invoked when a snapshot makes
    /// the prefix recoverable without the log.
    pub fn truncate_below(&mut self, id: SeqNo) {
        if id <= self.lowest_available {
            return;
        }
        self.instances = self.instances.split_off(&i32::from(id));
        self.lowest_available = id;
        if self.first_uncommitted < id {
            self.first_uncommitted = id;
        }
        if self.next_id < id {
            self.next_id = id;
        }
    }

    /// Byte size of the stored instances with ids in `[lo, hi)`.
    pub fn byte_size_between(&self, lo: SeqNo, hi: SeqNo) -> u64 {
        self.instances
            .range(i32::from(lo)..i32::from(hi))
            .map(|(_, instance)| instance.byte_size())
            .sum()
    }

    /// Advances `first_uncommitted` over the decided prefix.
    pub fn update_first_uncommitted(&mut self) {
        while self.first_uncommitted < self.next_id {
            match self.get_instance(self.first_uncommitted) {
                Some(instance) if instance.is_decided() => {
                    self.first_uncommitted = self.first_uncommitted.next();
                }
                _ => break,
            }
        }
    }

    /// Every held entry that carries a vote, lowest id first.
    ///
    /// Decided entries are included: a new leader whose log ends below
    /// ours must learn them, or it would propose no-ops over decided
    /// instances.
    pub fn voted_records(&self) -> Vec<InstanceRecord> {
        self.instances
            .values()
            .filter(|instance| instance.state() != LogEntryState::Unknown)
            .map(ConsensusInstance::to_record)
            .collect()
    }

    pub fn last_key(&self) -> Option<SeqNo> {
        self.instances.keys().next_back().map(|id| SeqNo::from(*id))
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for Log {
    fn default() -> Self {
        Log::new()
    }
}

/// Owns the log and the durable state; the single place the view number
/// lives.
pub struct Storage {
    descriptor: Arc<ProcessDescriptor>,
    log: Log,
    stable: StableStorage,
}

impl Storage {
    /// Opens or creates the replica's durable state and wraps a fresh
    /// log around it. When a snapshot is on disk the log floor is
    /// positioned after it.
    pub fn open(descriptor: Arc<ProcessDescriptor>) -> Result<Self> {
        let stable = StableStorage::open(&descriptor)?;
        let mut log = Log::new();

        if let Some(snapshot) = stable.last_snapshot() {
            let next = snapshot.next_instance_id;
            log.next_id = next;
            log.lowest_available = next;
            log.first_uncommitted = next;
        }

        Ok(Storage {
            descriptor,
            log,
            stable,
        })
    }

    pub fn view(&self) -> View {
        self.stable.view()
    }

    /// Durably raises the view. The write completes before the new view
    /// is visible to anything else.
    pub fn set_view(&mut self, view: View) -> Result<()> {
        assert!(
            view > self.stable.view(),
            "view may never decrease: {} -> {}",
            self.stable.view(),
            view
        );
        self.stable.set_view(view)
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut Log {
        &mut self.log
    }

    pub fn last_snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.stable.last_snapshot()
    }

    pub fn set_last_snapshot(&mut self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        self.stable.set_last_snapshot(snapshot)
    }

    /// Appends an accepted proposal to the durable proposal log, under
    /// crash models that keep one. Must complete before the matching
    /// Accept is sent.
    pub fn log_proposal(&mut self, id: SeqNo, view: View, value: &[u8]) -> Result<()> {
        self.stable.log_proposal(id, view, value)
    }

    pub fn first_uncommitted(&self) -> SeqNo {
        self.log.first_uncommitted()
    }

    /// Whether `id` lies inside the window starting at the first
    /// uncommitted instance.
    pub fn is_in_window(&self, id: SeqNo) -> bool {
        id.distance_from(self.log.first_uncommitted()) < self.descriptor.config.window_size
    }

    /// True when the proposer may not open another instance.
    pub fn is_window_full(&self) -> bool {
        self.log.next_id().distance_from(self.log.first_uncommitted())
            >= self.descriptor.config.window_size
    }

    /// Installs a snapshot received from a peer: positions the log after
    /// it and persists it. Returns `false` if the snapshot is older than
    /// what the log already covers.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool> {
        let next = snapshot.next_instance_id;
        if next <= self.log.first_uncommitted() && !self.log.is_empty() {
            warn!(
                "{:?} // ignoring snapshot for {} older than log position {}",
                self.descriptor.local_id,
                next,
                self.log.first_uncommitted()
            );
            return Ok(false);
        }

        self.stable.set_last_snapshot(snapshot)?;
        self.log.truncate_below(next);
        if self.log.next_id < next {
            self.log.next_id = next;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_transitions() {
        let mut instance = ConsensusInstance::new(SeqNo::from(3));
        assert_eq!(instance.state(), LogEntryState::Unknown);

        instance.set_value(View::from(1), vec![1]);
        assert_eq!(instance.state(), LogEntryState::Known);
        assert_eq!(instance.view(), View::from(1));

        // an older ballot cannot override
        instance.set_value(View::ZERO, vec![9]);
        assert_eq!(instance.value(), Some(&[1u8][..]));

        // a newer ballot resets the vote count
        instance.add_accept(ReplicaId::from(0));
        instance.set_value(View::from(2), vec![2]);
        assert_eq!(instance.accept_count(), 0);
        assert_eq!(instance.value(), Some(&[2u8][..]));

        instance.add_accept(ReplicaId::from(0));
        instance.add_accept(ReplicaId::from(1));
        instance.add_accept(ReplicaId::from(1));
        assert_eq!(instance.accept_count(), 2);

        instance.set_decided();
        assert!(instance.is_decided());
        // re-recording the decided value is fine
        instance.set_value(View::from(5), vec![2]);
        assert!(instance.is_decided());
    }

    #[test]
    #[should_panic]
    fn decided_value_change_aborts() {
        let mut instance = ConsensusInstance::new(SeqNo::ZERO);
        instance.set_value(View::from(1), vec![1]);
        instance.set_decided();
        instance.set_value(View::from(2), vec![2]);
    }

    #[test]
    fn log_dense_range_and_window() {
        let mut log = Log::new();
        let id = log.append(View::from(1), vec![1, 2]);
        assert_eq!(id, SeqNo::ZERO);
        assert_eq!(log.next_id(), SeqNo::from(1));

        // creating a later instance fills the gap with unknowns
        log.get_or_create(SeqNo::from(4)).unwrap();
        assert_eq!(log.next_id(), SeqNo::from(5));
        assert_eq!(log.size(), 5);
        assert_eq!(
            log.get_instance(SeqNo::from(2)).unwrap().state(),
            LogEntryState::Unknown
        );

        log.get_instance_mut(SeqNo::ZERO).unwrap().set_decided();
        log.update_first_uncommitted();
        assert_eq!(log.first_uncommitted(), SeqNo::from(1));
    }

    #[test]
    fn log_truncation() {
        let mut log = Log::new();
        for i in 0..6 {
            let id = log.append(View::from(1), vec![i as u8]);
            log.get_instance_mut(id).unwrap().set_decided();
        }
        log.update_first_uncommitted();
        assert!(log.byte_size_between(SeqNo::ZERO, SeqNo::from(6)) > 0);

        log.truncate_below(SeqNo::from(4));
        assert_eq!(log.size(), 2);
        assert!(log.get_instance(SeqNo::from(3)).is_none());
        assert!(log.get_or_create(SeqNo::from(2)).is_none());
        assert_eq!(log.lowest_available(), SeqNo::from(4));
        assert_eq!(log.first_uncommitted(), SeqNo::from(4));
    }

    #[test]
    fn voted_records_skip_unknown() {
        let mut log = Log::new();
        log.append(View::from(1), vec![1]);
        log.get_or_create(SeqNo::from(3)).unwrap();
        let records = log.voted_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, SeqNo::ZERO);
    }
}
