//! Hierarchical k-means tree over binary descriptors for approximate nearest neighbour search.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::descriptor::{BinaryDescriptor, DescriptorIndex};
use crate::error::MappingError;

/// Parameters of the vocabulary tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabularyParams {
    /// Number of clusters per internal node.
    pub branching_factor: usize,
    /// Nodes with at most this many descriptors become leaves.
    pub max_leaf_size: usize,
    /// Number of k-means refinement steps per node.
    pub kmeans_iterations: usize,
}

impl Default for VocabularyParams {
    fn default() -> Self {
        Self {
            branching_factor: 8,
            max_leaf_size: 32,
            kmeans_iterations: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct VocabularyNode {
    centroid: BinaryDescriptor,
    children: Vec<u32>,
    entries: Vec<u32>,
}

/// A tree of binary descriptor clusters.
///
/// Lookups descend greedily to the closest centroid on each level and search the reached leaf
/// exhaustively, so the result is approximate. A query equal to an indexed descriptor always
/// reaches the leaf holding it.
#[derive(Debug, Clone)]
pub struct VocabularyTree<T> {
    nodes: Vec<VocabularyNode>,
    entries: Vec<(T, BinaryDescriptor)>,
}

impl<T: Copy> VocabularyTree<T> {
    /// Builds a tree over descriptors carrying a payload each.
    pub fn new<R: Rng + ?Sized>(
        entries: Vec<(T, BinaryDescriptor)>,
        params: &VocabularyParams,
        rng: &mut R,
    ) -> Result<Self, MappingError> {
        if params.branching_factor < 2 {
            return Err(MappingError::InvalidParameter("branching factor must be at least 2"));
        }
        if params.max_leaf_size == 0 {
            return Err(MappingError::InvalidParameter("leaf size must be at least 1"));
        }

        let descriptors = entries.iter().map(|(_, d)| *d).collect::<Vec<_>>();
        let mut indices = (0..entries.len() as u32).collect::<Vec<_>>();

        let mut tree = Self {
            nodes: Vec::new(),
            entries,
        };
        tree.build_node(
            &descriptors,
            &mut indices,
            BinaryDescriptor::default(),
            params,
            rng,
        );

        Ok(tree)
    }

    /// Number of indexed descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn build_node<R: Rng + ?Sized>(
        &mut self,
        descriptors: &[BinaryDescriptor],
        indices: &mut [u32],
        centroid: BinaryDescriptor,
        params: &VocabularyParams,
        rng: &mut R,
    ) -> u32 {
        let node_index = self.nodes.len() as u32;
        self.nodes.push(VocabularyNode {
            centroid,
            children: Vec::new(),
            entries: Vec::new(),
        });

        if indices.len() <= params.max_leaf_size {
            self.nodes[node_index as usize].entries = indices.to_vec();
            return node_index;
        }

        let k = params.branching_factor;

        let mut centroids = kmeans_plusplus(descriptors, indices, k, rng);
        for _ in 0..params.kmeans_iterations {
            let assignments = assign(descriptors, indices, &centroids);
            update_centroids(descriptors, indices, &assignments, &mut centroids);
        }

        // the final assignment must use the centroids stored in the children
        let assignments = assign(descriptors, indices, &centroids);

        let mut counts = vec![0usize; k];
        for &cluster in &assignments {
            counts[cluster] += 1;
        }

        if counts.iter().any(|&count| count == indices.len()) {
            // no split possible, e.g. all descriptors identical
            self.nodes[node_index as usize].entries = indices.to_vec();
            return node_index;
        }

        let mut offsets = vec![0usize; k];
        for cluster in 1..k {
            offsets[cluster] = offsets[cluster - 1] + counts[cluster - 1];
        }

        let mut partitioned = vec![0u32; indices.len()];
        for (&index, &cluster) in indices.iter().zip(assignments.iter()) {
            partitioned[offsets[cluster]] = index;
            offsets[cluster] += 1;
        }
        indices.copy_from_slice(&partitioned);

        let mut children = Vec::with_capacity(k);
        let mut remaining = indices;

        for (cluster, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let (cluster_indices, tail) = std::mem::take(&mut remaining).split_at_mut(count);
            remaining = tail;

            children.push(self.build_node(
                descriptors,
                cluster_indices,
                centroids[cluster],
                params,
                rng,
            ));
        }

        self.nodes[node_index as usize].children = children;
        node_index
    }
}

impl<T: Copy> DescriptorIndex<T> for VocabularyTree<T> {
    fn nearest(&self, query: &BinaryDescriptor) -> Option<(T, u32)> {
        let mut node = self.nodes.first()?;

        while !node.children.is_empty() {
            let mut best = node.children[0];
            let mut best_distance = u32::MAX;
            for &child in &node.children {
                let distance = query.distance(&self.nodes[child as usize].centroid);
                if distance < best_distance {
                    best_distance = distance;
                    best = child;
                }
            }
            node = &self.nodes[best as usize];
        }

        node.entries
            .iter()
            .map(|&index| {
                let (payload, descriptor) = &self.entries[index as usize];
                (*payload, query.distance(descriptor))
            })
            .min_by_key(|(_, distance)| *distance)
    }
}

/// Picks initial centroids with the KMeans++ seeding.
fn kmeans_plusplus<R: Rng + ?Sized>(
    descriptors: &[BinaryDescriptor],
    indices: &[u32],
    k: usize,
    rng: &mut R,
) -> Vec<BinaryDescriptor> {
    let mut centroids = Vec::with_capacity(k);

    let first = descriptors[indices[rng.random_range(0..indices.len())] as usize];
    centroids.push(first);

    let mut distances = indices
        .par_iter()
        .map(|&i| descriptors[i as usize].distance(&first))
        .collect::<Vec<_>>();

    for _ in 1..k {
        let total: f64 = distances.iter().map(|&d| (d as f64) * (d as f64)).sum();

        let chosen = if total == 0.0 {
            rng.random_range(0..indices.len())
        } else {
            let mut target = rng.random_range(0.0..1.0) * total;
            let mut chosen = indices.len() - 1;
            for (i, &d) in distances.iter().enumerate() {
                target -= (d as f64) * (d as f64);
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let centroid = descriptors[indices[chosen] as usize];
        centroids.push(centroid);

        distances
            .par_iter_mut()
            .zip(indices.par_iter())
            .for_each(|(min_distance, &i)| {
                let distance = descriptors[i as usize].distance(&centroid);
                if distance < *min_distance {
                    *min_distance = distance;
                }
            });
    }

    centroids
}

/// Assigns every descriptor to its closest centroid, the lowest index wins ties.
fn assign(
    descriptors: &[BinaryDescriptor],
    indices: &[u32],
    centroids: &[BinaryDescriptor],
) -> Vec<usize> {
    indices
        .par_iter()
        .map(|&i| {
            let descriptor = &descriptors[i as usize];
            let mut best = 0;
            let mut best_distance = u32::MAX;
            for (cluster, centroid) in centroids.iter().enumerate() {
                let distance = descriptor.distance(centroid);
                if distance < best_distance {
                    best_distance = distance;
                    best = cluster;
                }
            }
            best
        })
        .collect()
}

/// Sets every centroid to the bitwise majority of its members, empty clusters keep theirs.
fn update_centroids(
    descriptors: &[BinaryDescriptor],
    indices: &[u32],
    assignments: &[usize],
    centroids: &mut [BinaryDescriptor],
) {
    let mut bit_counts = vec![[0u32; 256]; centroids.len()];
    let mut members = vec![0u32; centroids.len()];

    for (&i, &cluster) in indices.iter().zip(assignments.iter()) {
        members[cluster] += 1;
        let descriptor = &descriptors[i as usize];
        for (word_index, &word) in descriptor.0.iter().enumerate() {
            for bit in 0..64 {
                if (word >> bit) & 1 == 1 {
                    bit_counts[cluster][word_index * 64 + bit] += 1;
                }
            }
        }
    }

    for (cluster, centroid) in centroids.iter_mut().enumerate() {
        if members[cluster] == 0 {
            continue;
        }
        let mut words = [0u64; 4];
        for (bit_index, &count) in bit_counts[cluster].iter().enumerate() {
            if count * 2 > members[cluster] {
                words[bit_index / 64] |= 1u64 << (bit_index % 64);
            }
        }
        *centroid = BinaryDescriptor(words);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn random_descriptors(rng: &mut StdRng, count: usize) -> Vec<BinaryDescriptor> {
        (0..count)
            .map(|_| BinaryDescriptor([rng.random(), rng.random(), rng.random(), rng.random()]))
            .collect()
    }

    #[test]
    fn test_invalid_params() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = VocabularyParams {
            branching_factor: 1,
            ..Default::default()
        };
        assert!(VocabularyTree::<u32>::new(Vec::new(), &params, &mut rng).is_err());
    }

    #[test]
    fn test_empty_tree() -> Result<(), MappingError> {
        let mut rng = StdRng::seed_from_u64(0);
        let tree = VocabularyTree::<u32>::new(Vec::new(), &VocabularyParams::default(), &mut rng)?;
        assert!(tree.is_empty());
        assert_eq!(tree.nearest(&BinaryDescriptor::default()), None);
        Ok(())
    }

    #[test]
    fn test_indexed_descriptors_find_themselves() -> Result<(), MappingError> {
        let mut rng = StdRng::seed_from_u64(42);
        let descriptors = random_descriptors(&mut rng, 1000);
        let entries = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (i as u32, *d))
            .collect::<Vec<_>>();

        let tree = VocabularyTree::new(entries, &VocabularyParams::default(), &mut rng)?;
        assert_eq!(tree.len(), 1000);

        for (i, descriptor) in descriptors.iter().enumerate() {
            assert_eq!(tree.nearest(descriptor), Some((i as u32, 0)));
        }
        Ok(())
    }

    #[test]
    fn test_identical_descriptors() -> Result<(), MappingError> {
        let mut rng = StdRng::seed_from_u64(1);
        let entries = (0..100u32)
            .map(|i| (i, BinaryDescriptor([7, 7, 7, 7])))
            .collect::<Vec<_>>();
        let tree = VocabularyTree::new(entries, &VocabularyParams::default(), &mut rng)?;
        assert_eq!(tree.nearest(&BinaryDescriptor([7, 7, 7, 7])).map(|(_, d)| d), Some(0));
        Ok(())
    }

    #[test]
    fn test_queries_reach_their_cluster() -> Result<(), MappingError> {
        let mut rng = StdRng::seed_from_u64(3);
        let centers = random_descriptors(&mut rng, 16);

        let mut entries = Vec::new();
        for (cluster, center) in centers.iter().enumerate() {
            for _ in 0..40 {
                let mut member = *center;
                for _ in 0..4 {
                    let bit = rng.random_range(0..256usize);
                    member.0[bit / 64] ^= 1u64 << (bit % 64);
                }
                entries.push((cluster, member));
            }
        }

        let tree = VocabularyTree::new(entries, &VocabularyParams::default(), &mut rng)?;

        let hits = centers
            .iter()
            .enumerate()
            .filter(|(cluster, center)| tree.nearest(center).map(|(c, _)| c) == Some(*cluster))
            .count();
        assert!(hits >= 14);
        Ok(())
    }
}
