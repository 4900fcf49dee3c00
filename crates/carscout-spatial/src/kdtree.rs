//! Nearest-vehicle queries over a balanced 2-D kd-tree.
//!
//! The tree partitions (latitude, longitude) space with median splits on
//! alternating axes, but every distance it reports is a great-circle central
//! angle.  Subtrees are pruned with conservative great-circle lower bounds
//! for their splitting plane, so results are exact:
//!
//! - a latitude split at `s` is at least `|lat_q - s|` away;
//! - a longitude split bounds the far half-space by the angular distance to
//!   its nearest meridian edge, taking the antimeridian wrap into account.
//!
//! The index has no mutation methods.  A snapshot builds a new index, and
//! eviction ([`SpatialIndex::without`]) rebuilds one.
//!
//! # Example
//!
//! ```rust
//! use carscout_spatial::kdtree::SpatialIndex;
//! use carscout_types::VehiclePoint;
//!
//! let index = SpatialIndex::build(vec![
//!     VehiclePoint::new("v1", 52.52, 13.405),
//!     VehiclePoint::new("v2", 48.85, 2.35),
//! ]);
//!
//! let probe = VehiclePoint::new("q", 52.5, 13.4);
//! assert_eq!(index.nearest(&probe, 1)[0].id, "v1");
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use carscout_types::VehiclePoint;

use crate::distance::central_angle;

/// Slack subtracted from pruning bounds so rounding never discards a subtree
/// holding an exact tie.
const BOUND_EPSILON: f64 = 1e-12;

// ────────────────────────────────────────────────────────────────────────────
// Axis
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn for_depth(depth: usize) -> Self {
        if depth % 2 == 0 {
            Axis::Latitude
        } else {
            Axis::Longitude
        }
    }

    fn coord(self, p: &VehiclePoint) -> f64 {
        match self {
            Axis::Latitude => p.latitude,
            Axis::Longitude => p.longitude,
        }
    }

    /// Lower bound (radians) on the distance from `q` to any point on the
    /// far side of a split at `split`.
    fn far_side_bound(self, q: &VehiclePoint, split: f64, far_is_upper: bool) -> f64 {
        match self {
            Axis::Latitude => (q.latitude - split).abs().to_radians(),
            Axis::Longitude => {
                // The far half-space is the lune [split, 180] or [-180, split];
                // q can reach it directly or by wrapping across ±180.
                let gap = if far_is_upper {
                    (split - q.longitude).min(q.longitude + 180.0)
                } else {
                    (q.longitude - split).min(180.0 - q.longitude)
                };
                let gap = gap.clamp(0.0, 90.0).to_radians();
                (q.latitude.to_radians().cos() * gap.sin()).clamp(0.0, 1.0).asin()
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Candidates
// ────────────────────────────────────────────────────────────────────────────

/// A point under consideration, ordered by distance then input position.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist: f64,
    order: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.order.cmp(&other.order))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SpatialIndex
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Node {
    point: usize,
    axis: Axis,
    left: Option<usize>,
    right: Option<usize>,
}

/// Immutable snapshot of vehicle positions.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    /// Points in input order; the position doubles as the tie-breaker.
    points: Vec<VehiclePoint>,
    nodes: Vec<Node>,
    root: Option<usize>,
    by_id: HashMap<String, usize>,
}

impl SpatialIndex {
    /// Build a balanced tree over `points` in O(n log n).
    pub fn build(points: Vec<VehiclePoint>) -> Self {
        let mut order: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = build_node(&mut order, 0, &points, &mut nodes);

        let mut by_id = HashMap::with_capacity(points.len());
        for (i, p) in points.iter().enumerate() {
            by_id.entry(p.id.clone()).or_insert(i);
        }

        Self {
            points,
            nodes,
            root,
            by_id,
        }
    }

    /// An index with no points.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All points, in input order.
    pub fn points(&self) -> &[VehiclePoint] {
        &self.points
    }

    /// First point carrying `id`, if any.
    pub fn get(&self, id: &str) -> Option<&VehiclePoint> {
        self.by_id.get(id).map(|&i| &self.points[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Rebuild without the points whose id is in `ids`.
    ///
    /// Input order of the surviving points is preserved, so tie-breaking
    /// stays stable across evictions.
    pub fn without(&self, ids: &HashSet<String>) -> SpatialIndex {
        let kept = self
            .points
            .iter()
            .filter(|p| !ids.contains(&p.id))
            .cloned()
            .collect();
        SpatialIndex::build(kept)
    }

    /// Up to `k` points ranked by ascending great-circle distance from
    /// `query`; ties go to the point that came first in the input.
    pub fn nearest(&self, query: &VehiclePoint, k: usize) -> Vec<VehiclePoint> {
        if k == 0 {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.search_nearest(self.root, query, k, &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|c| self.points[c.order].clone())
            .collect()
    }

    /// Every point within `radius` radians of `query`, nearest first.
    pub fn within_radius(&self, query: &VehiclePoint, radius: f64) -> Vec<VehiclePoint> {
        let mut found = Vec::new();
        self.search_radius(self.root, query, radius, &mut found);
        found.sort();
        found
            .into_iter()
            .map(|c| self.points[c.order].clone())
            .collect()
    }

    fn search_nearest(
        &self,
        node: Option<usize>,
        query: &VehiclePoint,
        k: usize,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        let Some(i) = node else { return };
        let node = &self.nodes[i];
        let point = &self.points[node.point];

        heap.push(Candidate {
            dist: central_angle(query, point),
            order: node.point,
        });
        if heap.len() > k {
            heap.pop();
        }

        let split = node.axis.coord(point);
        let q = node.axis.coord(query);
        let (near, far, far_is_upper) = if q < split {
            (node.left, node.right, true)
        } else {
            (node.right, node.left, false)
        };

        self.search_nearest(near, query, k, heap);

        if far.is_some() {
            let bound = node.axis.far_side_bound(query, split, far_is_upper) - BOUND_EPSILON;
            let worst = heap.peek().map(|c| c.dist).unwrap_or(f64::INFINITY);
            if heap.len() < k || bound <= worst {
                self.search_nearest(far, query, k, heap);
            }
        }
    }

    fn search_radius(
        &self,
        node: Option<usize>,
        query: &VehiclePoint,
        radius: f64,
        found: &mut Vec<Candidate>,
    ) {
        let Some(i) = node else { return };
        let node = &self.nodes[i];
        let point = &self.points[node.point];

        let dist = central_angle(query, point);
        if dist <= radius {
            found.push(Candidate {
                dist,
                order: node.point,
            });
        }

        let split = node.axis.coord(point);
        let q = node.axis.coord(query);
        let (near, far, far_is_upper) = if q < split {
            (node.left, node.right, true)
        } else {
            (node.right, node.left, false)
        };

        self.search_radius(near, query, radius, found);
        if far.is_some()
            && node.axis.far_side_bound(query, split, far_is_upper) - BOUND_EPSILON <= radius
        {
            self.search_radius(far, query, radius, found);
        }
    }
}

/// Recursively place the median of `slice` (by the depth's axis) and build
/// both halves.  Returns the arena index of the subtree root.
fn build_node(
    slice: &mut [usize],
    depth: usize,
    points: &[VehiclePoint],
    nodes: &mut Vec<Node>,
) -> Option<usize> {
    if slice.is_empty() {
        return None;
    }
    let axis = Axis::for_depth(depth);
    let mid = slice.len() / 2;
    slice.select_nth_unstable_by(mid, |&a, &b| {
        axis.coord(&points[a])
            .total_cmp(&axis.coord(&points[b]))
            .then(a.cmp(&b))
    });
    let point = slice[mid];

    let (lower, rest) = slice.split_at_mut(mid);
    let upper = &mut rest[1..];
    let left = build_node(lower, depth + 1, points, nodes);
    let right = build_node(upper, depth + 1, points, nodes);

    nodes.push(Node {
        point,
        axis,
        left,
        right,
    });
    Some(nodes.len() - 1)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
