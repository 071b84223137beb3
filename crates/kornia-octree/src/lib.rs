#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Kornia Octree
//!
//! A static octree over an externally owned set of 3D points, built for the spatial queries
//! of landmark maps: which points are near a location, and which points may lie along a
//! viewing ray.
//!
//! ## Example
//!
//! ```rust
//! use glam::DVec3;
//! use kornia_octree::{Octree, OctreeParams, QueryStack, Ray3};
//!
//! let points = (0..100)
//!     .map(|i| DVec3::new(i as f64, 0.0, (i % 7) as f64))
//!     .collect::<Vec<_>>();
//!
//! let octree = Octree::new(&points, &OctreeParams::default())?;
//!
//! let mut stack = QueryStack::new();
//! let mut indices = Vec::new();
//! octree.closest_points(&points, DVec3::new(10.0, 0.0, 3.0), 1.5, &mut indices, None, &mut stack);
//! assert!(indices.contains(&10));
//!
//! let ray = Ray3::through(DVec3::new(10.0, 0.0, -5.0), points[10]).unwrap();
//! let mut leaves = Vec::new();
//! octree.intersecting_leaves(&ray, &mut leaves, &mut stack);
//! assert!(leaves.iter().any(|leaf| leaf.contains(&10)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Axis-aligned bounding boxes and their intersection tests.
pub mod bounding_box;

/// The octree and its query operations.
pub mod octree;

/// Rays used by the line and cone queries.
pub mod ray;

pub use bounding_box::BoundingBox;
pub use octree::{Octree, OctreeError, OctreeParams, QueryStack};
pub use ray::Ray3;
