//! Identifiers ordering the sub-protocols: consensus instances,
//! leader views, and replica ids.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a single slot of the replicated log.
///
/// Also used for the per-replica sequence half of a client batch id.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct SeqNo(i32);

/// A monotonically non-decreasing number naming the current leader epoch.
///
/// The process never operates in a view strictly lower than the highest
/// view it wrote to stable storage.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct View(i32);

/// The id of a replica in the fixed, ordered replica set.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplicaId(u32);

impl SeqNo {
    /// The first available sequence number.
    pub const ZERO: Self = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Returns the preceding sequence number, saturating at zero.
    #[inline]
    pub fn prev(self) -> SeqNo {
        SeqNo((self.0 - 1).max(0))
    }

    /// How many instances lie between `other` and `self`.
    ///
    /// Negative when `self` is behind `other`.
    #[inline]
    pub fn distance_from(self, other: SeqNo) -> i32 {
        self.0 - other.0
    }

    #[inline]
    pub fn offset(self, n: i32) -> SeqNo {
        SeqNo(self.0 + n)
    }
}

impl From<i32> for SeqNo {
    #[inline]
    fn from(n: i32) -> SeqNo {
        SeqNo(n)
    }
}

impl From<SeqNo> for i32 {
    #[inline]
    fn from(seq: SeqNo) -> i32 {
        seq.0
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(seq: SeqNo) -> u64 {
        seq.0 as u64
    }
}

impl From<SeqNo> for usize {
    #[inline]
    fn from(seq: SeqNo) -> usize {
        seq.0 as usize
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl View {
    /// The view every fresh replica starts in.
    pub const ZERO: Self = View(0);

    #[inline]
    pub fn next(self) -> View {
        View(self.0 + 1)
    }

    #[inline]
    pub fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl From<i32> for View {
    #[inline]
    fn from(n: i32) -> View {
        View(n)
    }
}

impl From<View> for i32 {
    #[inline]
    fn from(view: View) -> i32 {
        view.0
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ReplicaId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Bit of this replica in a quorum bitmask. Replica sets are
    /// limited to 64 processes by this representation.
    #[inline]
    pub fn mask_bit(self) -> u64 {
        1u64 << self.0
    }
}

impl From<u32> for ReplicaId {
    #[inline]
    fn from(id: u32) -> ReplicaId {
        ReplicaId(id)
    }
}

impl From<ReplicaId> for u32 {
    #[inline]
    fn from(id: ReplicaId) -> u32 {
        id.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Represents any value ordered by a consensus instance number.
pub trait Orderable {
    /// Returns the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

impl PartialOrd<i32> for SeqNo {
    fn partial_cmp(&self, other: &i32) -> Option<Ordering> {
        self.0.partial_cmp(other)
    }
}

impl PartialEq<i32> for SeqNo {
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_no_ordering() {
        let a = SeqNo::ZERO;
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.distance_from(a), 1);
        assert_eq!(a.distance_from(b), -1);
        assert_eq!(SeqNo::ZERO.prev(), SeqNo::ZERO);
    }

    #[test]
    fn view_monotone() {
        let v = View::ZERO;
        assert!(v.is_initial());
        assert!(v.next() > v);
    }
}
