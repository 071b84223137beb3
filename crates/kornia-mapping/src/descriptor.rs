//! Binary descriptors, per-landmark descriptor sets and nearest neighbour lookup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::LandmarkId;

/// A 256 bit binary feature descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BinaryDescriptor(pub [u64; 4]);

impl BinaryDescriptor {
    /// Number of bits in the descriptor.
    pub const BITS: u32 = 256;

    /// Hamming distance between two descriptors.
    #[inline(always)]
    pub fn distance(&self, other: &Self) -> u32 {
        let d0 = (self.0[0] ^ other.0[0]).count_ones();
        let d1 = (self.0[1] ^ other.0[1]).count_ones();
        let d2 = (self.0[2] ^ other.0[2]).count_ones();
        let d3 = (self.0[3] ^ other.0[3]).count_ones();
        d0 + d1 + d2 + d3
    }
}

/// Smallest distance between any descriptor of `a` and any descriptor of `b`.
///
/// Returns `u32::MAX` if either set is empty.
pub fn set_distance(a: &[BinaryDescriptor], b: &[BinaryDescriptor]) -> u32 {
    a.iter()
        .flat_map(|da| b.iter().map(move |db| da.distance(db)))
        .min()
        .unwrap_or(u32::MAX)
}

/// The descriptors of every landmark, several per landmark when it was seen from several views.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorMap {
    descriptors: BTreeMap<LandmarkId, Vec<BinaryDescriptor>>,
}

impl DescriptorMap {
    /// Creates an empty descriptor map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a descriptor to the set of a landmark.
    pub fn insert(&mut self, id: LandmarkId, descriptor: BinaryDescriptor) {
        self.descriptors.entry(id).or_default().push(descriptor);
    }

    /// Appends several descriptors to the set of a landmark.
    pub fn extend<I: IntoIterator<Item = BinaryDescriptor>>(
        &mut self,
        id: LandmarkId,
        descriptors: I,
    ) {
        self.descriptors.entry(id).or_default().extend(descriptors);
    }

    /// The descriptors of a landmark, empty if it has none.
    pub fn get(&self, id: LandmarkId) -> &[BinaryDescriptor] {
        self.descriptors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns whether the landmark has at least one descriptor.
    pub fn contains(&self, id: LandmarkId) -> bool {
        self.descriptors.get(&id).is_some_and(|set| !set.is_empty())
    }

    /// Removes and returns the descriptors of a landmark.
    pub fn remove(&mut self, id: LandmarkId) -> Vec<BinaryDescriptor> {
        self.descriptors.remove(&id).unwrap_or_default()
    }

    /// Appends the descriptors of `removed` to `survivor` and drops the entry of `removed`.
    ///
    /// Descriptors are not deduplicated.
    pub fn merge_into(&mut self, survivor: LandmarkId, removed: LandmarkId) {
        if survivor == removed {
            return;
        }
        let moved = self.remove(removed);
        if !moved.is_empty() {
            self.extend(survivor, moved);
        }
    }

    /// Number of landmarks with descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns whether the map holds no landmark.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Iterates over all landmarks and their descriptor sets.
    pub fn iter(&self) -> impl Iterator<Item = (LandmarkId, &[BinaryDescriptor])> + '_ {
        self.descriptors.iter().map(|(id, set)| (*id, set.as_slice()))
    }
}

/// Nearest neighbour lookup over a fixed set of descriptors, each carrying a payload.
pub trait DescriptorIndex<T> {
    /// Returns the payload of the closest descriptor and its distance.
    fn nearest(&self, query: &BinaryDescriptor) -> Option<(T, u32)>;

    /// The best match of any descriptor of `queries`.
    fn nearest_of_set(&self, queries: &[BinaryDescriptor]) -> Option<(T, u32)> {
        queries
            .iter()
            .filter_map(|query| self.nearest(query))
            .min_by_key(|(_, distance)| *distance)
    }
}

/// Exhaustive search over all descriptors.
#[derive(Clone, Debug, Default)]
pub struct BruteForceIndex<T> {
    entries: Vec<(T, BinaryDescriptor)>,
}

impl<T: Copy> BruteForceIndex<T> {
    /// Creates an index over the given entries.
    pub fn new(entries: Vec<(T, BinaryDescriptor)>) -> Self {
        Self { entries }
    }

    /// Number of indexed descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Copy> DescriptorIndex<T> for BruteForceIndex<T> {
    fn nearest(&self, query: &BinaryDescriptor) -> Option<(T, u32)> {
        let mut best: Option<(T, u32)> = None;
        for (payload, descriptor) in &self.entries {
            let distance = query.distance(descriptor);
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((*payload, distance));
            }
        }
        best
    }
}
