use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::bounding_box::BoundingBox;
use crate::ray::Ray3;

/// Nodes deeper than this become leaves regardless of their size.
const MAX_DEPTH: usize = 64;

/// Error types for the octree module.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OctreeError {
    /// The leaf capacity must be at least one point.
    #[error("Invalid leaf capacity: {0}, must be at least 1")]
    InvalidLeafCapacity(usize),

    /// Point indices are stored as `u32`.
    #[error("Too many points for an octree: {0}")]
    TooManyPoints(usize),
}

/// Parameters controlling how the octree is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeParams {
    /// Maximum number of points a leaf holds before it is split.
    pub max_points_per_leaf: usize,
    /// Whether node boxes are shrunk to the points they contain.
    ///
    /// Tight boxes prune more during queries, bisected boxes are cheaper to build. In both
    /// modes a node is split at the center of its bisected cell, never at the center of its
    /// tight box, so both modes produce the same leaves.
    pub tight_bounding_boxes: bool,
}

impl Default for OctreeParams {
    fn default() -> Self {
        Self {
            max_points_per_leaf: 40,
            tight_bounding_boxes: true,
        }
    }
}

impl OctreeParams {
    fn validate(&self) -> Result<(), OctreeError> {
        if self.max_points_per_leaf == 0 {
            return Err(OctreeError::InvalidLeafCapacity(self.max_points_per_leaf));
        }
        Ok(())
    }
}

/// Scratch space reused between octree queries.
///
/// Owned by the caller so that repeated queries do not allocate. A stack must not be shared
/// between concurrent queries; each thread keeps its own.
#[derive(Debug, Default, Clone)]
pub struct QueryStack {
    nodes: Vec<u32>,
}

impl QueryStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
enum NodeContent {
    Leaf(Vec<u32>),
    Internal([u32; 8]),
}

#[derive(Debug, Clone)]
struct Node {
    bounding_box: BoundingBox,
    content: NodeContent,
}

impl Node {
    fn empty() -> Self {
        Self {
            bounding_box: BoundingBox::empty(),
            content: NodeContent::Leaf(Vec::new()),
        }
    }
}

/// An octree over a set of 3D points.
///
/// The octree stores indices into the point slice it was built from; the points themselves
/// stay owned by the caller and must be passed again to queries that need coordinates.
///
/// Every input index ends up in exactly one leaf. Empty children are kept as invalid leaves
/// and are never returned by queries.
#[derive(Debug, Clone)]
pub struct Octree {
    nodes: Vec<Node>,
}

impl Octree {
    /// Builds an octree for the given points.
    ///
    /// # Arguments
    ///
    /// * `points` - The points to index, the octree refers to them by position in this slice.
    /// * `params` - The build parameters.
    ///
    /// # Returns
    ///
    /// The octree, whose root is invalid if `points` is empty.
    pub fn new(points: &[DVec3], params: &OctreeParams) -> Result<Self, OctreeError> {
        params.validate()?;

        if points.len() > u32::MAX as usize {
            return Err(OctreeError::TooManyPoints(points.len()));
        }

        let mut octree = Self { nodes: Vec::new() };

        if points.is_empty() {
            octree.nodes.push(Node::empty());
            return Ok(octree);
        }

        // two buffers of equal length, swapped at every level
        let mut input = (0..points.len() as u32).collect::<Vec<_>>();
        let mut output = vec![0u32; points.len()];

        let cell = BoundingBox::from_points(points.iter().copied());
        octree.build_node(points, params, &mut input, &mut output, cell, 0);

        Ok(octree)
    }

    fn build_node(
        &mut self,
        points: &[DVec3],
        params: &OctreeParams,
        input: &mut [u32],
        output: &mut [u32],
        cell: BoundingBox,
        depth: usize,
    ) -> u32 {
        let node_index = self.nodes.len() as u32;

        if input.is_empty() {
            self.nodes.push(Node::empty());
            return node_index;
        }

        let tight = BoundingBox::from_points(input.iter().map(|&i| points[i as usize]));
        let bounding_box = if params.tight_bounding_boxes {
            tight
        } else {
            cell
        };

        let coincident = tight.extent() == DVec3::ZERO;

        if input.len() <= params.max_points_per_leaf || coincident || depth >= MAX_DEPTH {
            self.nodes.push(Node {
                bounding_box,
                content: NodeContent::Leaf(input.to_vec()),
            });
            return node_index;
        }

        // reserve the slot so that the parent precedes its children
        self.nodes.push(Node {
            bounding_box,
            content: NodeContent::Internal([0; 8]),
        });

        // the bisected cell, not the tight box, decides the split in both modes
        let center = cell.center();

        let mut counts = [0usize; 8];
        for &index in input.iter() {
            counts[octant_of(points[index as usize], center)] += 1;
        }

        let mut cursors = [0usize; 8];
        for octant in 1..8 {
            cursors[octant] = cursors[octant - 1] + counts[octant - 1];
        }

        for &index in input.iter() {
            let octant = octant_of(points[index as usize], center);
            output[cursors[octant]] = index;
            cursors[octant] += 1;
        }

        let mut children = [0u32; 8];

        // the children read from the sub-slices of `output` and write into `input`
        let mut remaining_sorted = output;
        let mut remaining_scratch = input;

        for (octant, &count) in counts.iter().enumerate() {
            let (child_input, rest) = std::mem::take(&mut remaining_sorted).split_at_mut(count);
            remaining_sorted = rest;

            let (child_output, rest) = std::mem::take(&mut remaining_scratch).split_at_mut(count);
            remaining_scratch = rest;

            children[octant] = self.build_node(
                points,
                params,
                child_input,
                child_output,
                cell.octant(octant, center),
                depth + 1,
            );
        }

        self.nodes[node_index as usize].content = NodeContent::Internal(children);

        node_index
    }

    /// Returns whether the octree holds at least one point.
    pub fn is_valid(&self) -> bool {
        self.root().bounding_box.is_valid()
    }

    /// The bounding box of the root node, invalid for an empty octree.
    pub fn bounding_box(&self) -> BoundingBox {
        self.root().bounding_box
    }

    /// Total number of nodes, including empty leaves.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaves holding at least one point.
    pub fn leaf_count(&self) -> usize {
        self.leaves().count()
    }

    /// Iterates over all leaves holding at least one point.
    pub fn leaves(&self) -> impl Iterator<Item = &[u32]> + '_ {
        self.nodes.iter().filter_map(|node| match &node.content {
            NodeContent::Leaf(indices) if !indices.is_empty() => Some(indices.as_slice()),
            _ => None,
        })
    }

    /// Collects the leaves whose box lies within `max_distance` of `query`.
    ///
    /// A leaf is returned if `query` is inside its box grown by `max_distance`; the result is a
    /// superset of the leaves holding points within that distance. Leaves are appended to
    /// `leaves`.
    pub fn closest_leaves<'a>(
        &'a self,
        query: DVec3,
        max_distance: f64,
        leaves: &mut Vec<&'a [u32]>,
        stack: &mut QueryStack,
    ) {
        self.visit_leaves(
            |bounding_box| bounding_box.contains_with_margin(query, max_distance),
            stack,
            |indices| leaves.push(indices),
        );
    }

    /// Collects the leaves whose box is touched by the infinite line through `ray`.
    pub fn intersecting_leaves<'a>(
        &'a self,
        ray: &Ray3,
        leaves: &mut Vec<&'a [u32]>,
        stack: &mut QueryStack,
    ) {
        self.visit_leaves(
            |bounding_box| bounding_box.intersects_ray(ray),
            stack,
            |indices| leaves.push(indices),
        );
    }

    /// Collects the leaves whose box is touched by a cone around `ray`.
    ///
    /// The cone test is conservative, it may return leaves just outside the cone but never
    /// misses one inside it.
    pub fn intersecting_leaves_in_cone<'a>(
        &'a self,
        ray: &Ray3,
        tan_half_angle: f64,
        leaves: &mut Vec<&'a [u32]>,
        stack: &mut QueryStack,
    ) {
        debug_assert!(tan_half_angle >= 0.0);

        self.visit_leaves(
            |bounding_box| bounding_box.intersects_cone(ray, tan_half_angle),
            stack,
            |indices| leaves.push(indices),
        );
    }

    /// Collects the indices of all points within `max_distance` of `query`.
    ///
    /// # Arguments
    ///
    /// * `points` - The points the octree was built from.
    /// * `query` - The query location.
    /// * `max_distance` - The search radius, inclusive.
    /// * `indices` - Receives the indices of the found points.
    /// * `found` - Optionally receives the coordinates of the found points.
    /// * `stack` - Scratch space for the traversal.
    pub fn closest_points(
        &self,
        points: &[DVec3],
        query: DVec3,
        max_distance: f64,
        indices: &mut Vec<u32>,
        mut found: Option<&mut Vec<DVec3>>,
        stack: &mut QueryStack,
    ) {
        let sqr_max_distance = max_distance * max_distance;

        self.visit_leaves(
            |bounding_box| bounding_box.contains_with_margin(query, max_distance),
            stack,
            |leaf| {
                for &index in leaf {
                    let Some(&point) = points.get(index as usize) else {
                        continue;
                    };
                    if point.distance_squared(query) <= sqr_max_distance {
                        indices.push(index);
                        if let Some(found) = found.as_deref_mut() {
                            found.push(point);
                        }
                    }
                }
            },
        );
    }

    fn root(&self) -> &Node {
        &self.nodes[0]
    }

    fn visit_leaves<'a, A, V>(&'a self, accept: A, stack: &mut QueryStack, mut visit: V)
    where
        A: Fn(&BoundingBox) -> bool,
        V: FnMut(&'a [u32]),
    {
        stack.nodes.clear();

        // early out on the root box
        if !self.is_valid() || !accept(&self.root().bounding_box) {
            return;
        }

        stack.nodes.push(0);

        while let Some(node_index) = stack.nodes.pop() {
            match &self.nodes[node_index as usize].content {
                NodeContent::Leaf(indices) => {
                    if !indices.is_empty() {
                        visit(indices.as_slice());
                    }
                }
                NodeContent::Internal(children) => {
                    for &child_index in children.iter().rev() {
                        let child = &self.nodes[child_index as usize];
                        if child.bounding_box.is_valid() && accept(&child.bounding_box) {
                            stack.nodes.push(child_index);
                        }
                    }
                }
            }
        }
    }
}

#[inline]
fn octant_of(point: DVec3, center: DVec3) -> usize {
    ((point.x >= center.x) as usize) << 2
        | ((point.y >= center.y) as usize) << 1
        | (point.z >= center.z) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<DVec3> {
        let mut points = Vec::with_capacity(n * n * n);
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    points.push(DVec3::new(x as f64, y as f64, z as f64));
                }
            }
        }
        points
    }

    #[test]
    fn test_invalid_leaf_capacity() {
        let params = OctreeParams {
            max_points_per_leaf: 0,
            ..Default::default()
        };
        let result = Octree::new(&[DVec3::ZERO], &params);
        assert_eq!(result.unwrap_err(), OctreeError::InvalidLeafCapacity(0));
    }

    #[test]
    fn test_empty_octree() -> Result<(), OctreeError> {
        let octree = Octree::new(&[], &OctreeParams::default())?;
        assert!(!octree.is_valid());
        assert_eq!(octree.leaf_count(), 0);

        let mut leaves = Vec::new();
        let mut stack = QueryStack::new();
        octree.closest_leaves(DVec3::ZERO, 100.0, &mut leaves, &mut stack);
        assert!(leaves.is_empty());

        let ray = Ray3::new(DVec3::ZERO, DVec3::Z).unwrap();
        octree.intersecting_leaves(&ray, &mut leaves, &mut stack);
        assert!(leaves.is_empty());
        Ok(())
    }

    #[test]
    fn test_single_leaf() -> Result<(), OctreeError> {
        let points = grid(2);
        let octree = Octree::new(&points, &OctreeParams::default())?;
        assert_eq!(octree.node_count(), 1);
        assert_eq!(octree.leaf_count(), 1);
        assert_eq!(octree.bounding_box().upper(), DVec3::ONE);
        Ok(())
    }

    #[test]
    fn test_coincident_points_stay_in_one_leaf() -> Result<(), OctreeError> {
        let points = vec![DVec3::new(1.0, 1.0, 1.0); 100];
        let params = OctreeParams {
            max_points_per_leaf: 4,
            ..Default::default()
        };
        let octree = Octree::new(&points, &params)?;
        assert_eq!(octree.leaf_count(), 1);
        assert_eq!(octree.leaves().next().map(|leaf| leaf.len()), Some(100));
        Ok(())
    }

    #[test]
    fn test_tight_mode_splits_at_the_cell_center() -> Result<(), OctreeError> {
        // the tight box of the first three points is centered at x = 1, their cell at x = 2.5
        let points = [0.0, 1.0, 2.0, 10.0].map(|x| DVec3::new(x, 0.0, 0.0));
        let params = OctreeParams {
            max_points_per_leaf: 2,
            tight_bounding_boxes: true,
        };
        let octree = Octree::new(&points, &params)?;

        let mut leaves = octree.leaves().map(|leaf| leaf.to_vec()).collect::<Vec<_>>();
        leaves.sort();
        assert_eq!(leaves, vec![vec![0, 1], vec![2], vec![3]]);
        Ok(())
    }

    #[test]
    fn test_split_respects_capacity() -> Result<(), OctreeError> {
        let points = grid(4);
        let params = OctreeParams {
            max_points_per_leaf: 8,
            ..Default::default()
        };
        let octree = Octree::new(&points, &params)?;

        assert!(octree.leaf_count() > 1);
        assert!(octree.leaves().all(|leaf| leaf.len() <= 8));

        let mut all = octree.leaves().flatten().copied().collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..points.len() as u32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_closest_points() -> Result<(), OctreeError> {
        let points = grid(5);
        let params = OctreeParams {
            max_points_per_leaf: 4,
            ..Default::default()
        };
        let octree = Octree::new(&points, &params)?;

        let mut indices = Vec::new();
        let mut found = Vec::new();
        let mut stack = QueryStack::new();
        let query = DVec3::new(2.0, 2.0, 2.0);
        octree.closest_points(&points, query, 1.0, &mut indices, Some(&mut found), &mut stack);

        // the center and its six direct neighbours
        assert_eq!(indices.len(), 7);
        assert_eq!(found.len(), 7);
        assert!(found.iter().all(|p| p.distance(query) <= 1.0));
        Ok(())
    }

    #[test]
    fn test_octant_order() {
        let center = DVec3::ZERO;
        assert_eq!(octant_of(DVec3::new(-1.0, -1.0, -1.0), center), 0);
        assert_eq!(octant_of(DVec3::new(-1.0, -1.0, 1.0), center), 1);
        assert_eq!(octant_of(DVec3::new(-1.0, 1.0, -1.0), center), 2);
        assert_eq!(octant_of(DVec3::new(1.0, -1.0, -1.0), center), 4);
        assert_eq!(octant_of(DVec3::new(1.0, 1.0, 1.0), center), 7);
    }
}
