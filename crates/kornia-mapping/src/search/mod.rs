//! Randomized searches for landmark correspondences.
//!
//! All searches sample poses at random and stop after a number of consecutive iterations that
//! added nothing new. They only read the map; merging the found pairs is left to
//! [`crate::consolidation`].

mod cross_map;
mod intra_map;
mod loop_closure;

pub use cross_map::{find_cross_map_correspondences, CrossMapMatches, MapAlignmentParams, PosePair};
pub use intra_map::{find_duplicate_landmarks, LandmarkMergeParams};
pub use loop_closure::{find_loop_closures, LoopClosureParams};

use std::collections::BTreeSet;

use crate::types::LandmarkId;

/// An ordered set of unordered landmark pairs.
///
/// Pairs are stored as `(low, high)` so that `(a, b)` and `(b, a)` are the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrespondenceSet {
    pairs: BTreeSet<(LandmarkId, LandmarkId)>,
}

impl CorrespondenceSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pair, returns whether it was new. A landmark paired with itself is ignored.
    pub fn insert(&mut self, a: LandmarkId, b: LandmarkId) -> bool {
        if a == b {
            return false;
        }
        self.pairs.insert((a.min(b), a.max(b)))
    }

    /// Returns whether the pair is in the set, in either order.
    pub fn contains(&self, a: LandmarkId, b: LandmarkId) -> bool {
        self.pairs.contains(&(a.min(b), a.max(b)))
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterates over the pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (LandmarkId, LandmarkId)> + '_ {
        self.pairs.iter().copied()
    }
}

impl FromIterator<(LandmarkId, LandmarkId)> for CorrespondenceSet {
    fn from_iter<I: IntoIterator<Item = (LandmarkId, LandmarkId)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (a, b) in iter {
            set.insert(a, b);
        }
        set
    }
}

/// Counts consecutive iterations without progress.
#[derive(Debug, Clone, Copy)]
pub struct ImprovementBudget {
    limit: usize,
    idle: usize,
}

impl ImprovementBudget {
    /// Creates a budget that runs out after `limit` idle iterations in a row.
    pub fn new(limit: usize) -> Self {
        Self { limit, idle: 0 }
    }

    /// Returns whether the search should stop.
    pub fn is_exhausted(&self) -> bool {
        self.idle >= self.limit
    }

    /// Records the outcome of an iteration, any progress resets the count.
    pub fn record(&mut self, improved: bool) {
        if improved {
            self.idle = 0;
        } else {
            self.idle += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_canonical() {
        let mut set = CorrespondenceSet::new();
        assert!(set.insert(LandmarkId(5), LandmarkId(2)));
        assert!(!set.insert(LandmarkId(2), LandmarkId(5)));
        assert!(!set.insert(LandmarkId(3), LandmarkId(3)));
        assert!(set.contains(LandmarkId(5), LandmarkId(2)));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(LandmarkId(2), LandmarkId(5))]);
    }

    #[test]
    fn test_budget_resets_on_progress() {
        let mut budget = ImprovementBudget::new(2);
        budget.record(false);
        assert!(!budget.is_exhausted());
        budget.record(true);
        budget.record(false);
        assert!(!budget.is_exhausted());
        budget.record(false);
        assert!(budget.is_exhausted());
    }
}
