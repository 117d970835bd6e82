//! Compact per-replica known-counter tracking.
//!
//! The op log needs to answer "what's the highest counter we've seen from
//! replica R" and "which counters has replica R contributed" cheaply, without
//! one entry per op. [`ReplicaCounters`] stores, per replica, the set of
//! contiguous counter ranges seen so far — almost always a single range once
//! a replica's ops have been ingested in order, but able to represent gaps
//! left by out-of-order delivery.

use crate::ids::{OpId, ReplicaId};
use itertools::Itertools;
use range_collections::{AbstractRangeSet, RangeSet, RangeSet2};
use std::{
    collections::{btree_map, BTreeMap, BTreeSet},
    iter::FromIterator,
    ops::{Bound, Range},
};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplicaCounters(BTreeMap<ReplicaId, RangeSet2<u64>>);

impl FromIterator<OpId> for ReplicaCounters {
    fn from_iter<T: IntoIterator<Item = OpId>>(iter: T) -> Self {
        let elems = iter
            .into_iter()
            .filter(|op| op.counter != 0)
            .sorted_by_key(|op| op.replica)
            .group_by(|x| x.replica)
            .into_iter()
            .map(|(replica, ops)| {
                let entry: RangeSet2<u64> = ops.fold(RangeSet::empty(), |mut set, op| {
                    set |= RangeSet::from(op.counter..op.counter + 1);
                    set
                });
                (replica, entry)
            })
            .collect();
        Self(elems)
    }
}

impl ReplicaCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_set(elems: BTreeSet<OpId>) -> Self {
        elems.into_iter().collect()
    }

    /// Builds counters from the inclusive maximum counter seen per replica.
    pub fn from_max_map(x: BTreeMap<ReplicaId, u64>) -> Self {
        Self(
            x.into_iter()
                .filter(|(_, max)| *max > 0)
                .map(|(i, max)| (i, RangeSet::from(1..max + 1)))
                .collect(),
        )
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.0
            .get(&id.replica)
            .map(|range| range.contains(&id.counter))
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = OpId> + '_ {
        self.0.iter().flat_map(|(replica, ranges)| {
            ranges.iter().flat_map(move |(from, to)| {
                elems(from, to).filter(|c| *c != 0).map(move |counter| OpId {
                    replica: *replica,
                    counter,
                })
            })
        })
    }

    pub fn insert(&mut self, id: OpId) {
        if id.counter == 0 {
            return;
        }
        let range = RangeSet::from(id.counter..id.counter + 1);
        match self.0.get_mut(&id.replica) {
            Some(existing) => *existing |= range,
            None => {
                self.0.insert(id.replica, range);
            }
        }
    }

    /// Highest counter seen for `replica`, or 0 if none.
    pub fn max(&self, replica: &ReplicaId) -> u64 {
        if let Some(r) = self.0.get(replica) {
            r.boundaries()
                .last()
                .map(|x| *x - 1)
                .expect("ranges are never empty once inserted")
        } else {
            0
        }
    }

    pub fn next(&self, replica: ReplicaId) -> OpId {
        OpId {
            replica,
            counter: self.max(&replica) + 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self(
            self.0
                .iter()
                .filter_map(|(k, vl)| {
                    other.0.get(k).and_then(|vr| {
                        let r = vl & vr;
                        (!r.is_empty()).then_some((*k, r))
                    })
                })
                .collect(),
        )
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self(
            self.0
                .iter()
                .filter_map(|(k, vl)| {
                    if let Some(vr) = other.0.get(k) {
                        let r = vl - vr;
                        (!r.is_empty()).then_some((*k, r))
                    } else {
                        Some((*k, vl.clone()))
                    }
                })
                .collect(),
        )
    }

    pub fn union(&mut self, other: &Self) {
        for (k, vr) in other.0.iter() {
            match self.0.entry(*k) {
                btree_map::Entry::Occupied(e) => {
                    e.into_mut().union_with(vr);
                }
                btree_map::Entry::Vacant(e) => {
                    e.insert(vr.clone());
                }
            }
        }
    }
}

fn elems(lower: Bound<&u64>, upper: Bound<&u64>) -> Range<u64> {
    match (lower, upper) {
        (Bound::Included(lower), Bound::Excluded(upper)) => *lower..*upper,
        (Bound::Unbounded, Bound::Excluded(upper)) => 0..*upper,
        _ => panic!("range-collections always produces half-open ranges here"),
    }
}
