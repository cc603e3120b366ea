//! SAH-based BVH over bounding boxes.
//!
//! Used twice by the host backend: once for the static scene triangles
//! and once per frame for the beam/photon instances. Produces a flat node
//! array (index 0 = root) and a reordered primitive index list.

use crate::util::{BBox3f, Ray, Vec3};
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Maximum primitives per leaf before forcing a split.
const MAX_LEAF_SIZE: usize = 4;

/// Flat BVH node (32 bytes).
///
/// Internal node: left_or_first = left child index (right = left + 1), count = 0
/// Leaf node: left_or_first = first index into `prim_indices`, count > 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    fn leaf(bounds: &BBox3f, first: usize, count: usize) -> Self {
        Self {
            aabb_min: bounds.min.to_array(),
            left_or_first: first as u32,
            aabb_max: bounds.max.to_array(),
            count: count as u32,
        }
    }

    fn interior(bounds: &BBox3f, left: usize) -> Self {
        Self {
            aabb_min: bounds.min.to_array(),
            left_or_first: left as u32,
            aabb_max: bounds.max.to_array(),
            count: 0,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    #[inline]
    pub fn bounds(&self) -> BBox3f {
        BBox3f::new(Vec3::from(self.aabb_min), Vec3::from(self.aabb_max))
    }
}

/// Built BVH result.
#[derive(Debug, Clone, Default)]
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BvhNode>,
    /// Reordered primitive indices (leaves reference into this).
    pub prim_indices: Vec<u32>,
}

/// SAH bin for evaluating split candidates.
#[derive(Clone, Copy)]
struct Bin {
    bounds: BBox3f,
    count: usize,
}

impl Bin {
    const EMPTY: Self = Self {
        bounds: BBox3f::EMPTY,
        count: 0,
    };
}

impl Bvh {
    /// Build from primitive bounds using binned SAH.
    ///
    /// Indices in the result map into `bounds`. Empty boxes are skipped,
    /// so inactive primitives never enter the tree.
    pub fn build(bounds: &[BBox3f]) -> Self {
        let mut indices: Vec<u32> = (0..bounds.len() as u32)
            .filter(|&i| !bounds[i as usize].is_empty())
            .collect();
        let n = indices.len();
        if n == 0 {
            return Self {
                nodes: vec![BvhNode::default()],
                prim_indices: vec![],
            };
        }

        let centroids: Vec<Vec3> = bounds.iter().map(BBox3f::center).collect();

        // Worst case: 2*n - 1 for a full binary tree
        let mut nodes: Vec<BvhNode> = Vec::with_capacity(2 * n);
        nodes.push(BvhNode::default());

        struct Task {
            node_idx: usize,
            start: usize,
            end: usize, // exclusive
        }

        let mut stack = vec![Task {
            node_idx: 0,
            start: 0,
            end: n,
        }];

        while let Some(task) = stack.pop() {
            let (start, end) = (task.start, task.end);
            let count = end - start;

            let mut node_bounds = BBox3f::EMPTY;
            let mut centroid_bounds = BBox3f::EMPTY;
            for &idx in &indices[start..end] {
                node_bounds.expand_by_box(&bounds[idx as usize]);
                centroid_bounds.expand_by_point(centroids[idx as usize]);
            }

            if count <= MAX_LEAF_SIZE {
                nodes[task.node_idx] = BvhNode::leaf(&node_bounds, start, count);
                continue;
            }

            let split = find_best_split(&indices[start..end], bounds, &centroids, &centroid_bounds);
            let leaf_cost = count as f32 * INTERSECT_COST * node_bounds.area();

            let Some((axis, split_pos, cost)) = split else {
                nodes[task.node_idx] = BvhNode::leaf(&node_bounds, start, count);
                continue;
            };
            if cost >= leaf_cost {
                nodes[task.node_idx] = BvhNode::leaf(&node_bounds, start, count);
                continue;
            }

            let mid = partition(&mut indices[start..end], |&idx| {
                centroids[idx as usize][axis] < split_pos
            }) + start;
            // Degenerate partition: split in the middle
            let mid = if mid == start || mid == end {
                (start + end) / 2
            } else {
                mid
            };

            let left_idx = nodes.len();
            nodes.push(BvhNode::default());
            nodes.push(BvhNode::default());
            nodes[task.node_idx] = BvhNode::interior(&node_bounds, left_idx);

            // Right first so left is processed first
            stack.push(Task {
                node_idx: left_idx + 1,
                start: mid,
                end,
            });
            stack.push(Task {
                node_idx: left_idx,
                start,
                end: mid,
            });
        }

        Self {
            nodes,
            prim_indices: indices,
        }
    }

    /// Recompute node bounds in place for moved primitives.
    ///
    /// Topology is kept; `bounds` must have the same length and active set
    /// as the build input.
    pub fn refit(&mut self, bounds: &[BBox3f]) {
        // Children are always stored after their parent
        for i in (0..self.nodes.len()).rev() {
            let node = self.nodes[i];
            let mut b = BBox3f::EMPTY;
            if node.is_leaf() {
                let first = node.left_or_first as usize;
                for &idx in &self.prim_indices[first..first + node.count as usize] {
                    b.expand_by_box(&bounds[idx as usize]);
                }
            } else if self.prim_indices.is_empty() {
                continue;
            } else {
                let left = node.left_or_first as usize;
                b.expand_by_box(&self.nodes[left].bounds());
                b.expand_by_box(&self.nodes[left + 1].bounds());
            }
            self.nodes[i].aabb_min = b.min.to_array();
            self.nodes[i].aabb_max = b.max.to_array();
        }
    }

    /// Number of primitives referenced by leaves.
    pub fn leaf_primitives(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.count as usize).sum()
    }

    /// Longest root-to-leaf path (a single leaf has depth 1).
    pub fn depth(&self) -> u32 {
        if self.prim_indices.is_empty() {
            return 0;
        }
        let mut max_depth = 0;
        let mut stack: SmallVec<[(usize, u32); 64]> = SmallVec::new();
        stack.push((0, 1));
        while let Some((idx, d)) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf() {
                max_depth = max_depth.max(d);
            } else {
                let left = node.left_or_first as usize;
                stack.push((left, d + 1));
                stack.push((left + 1, d + 1));
            }
        }
        max_depth
    }

    /// Walk every leaf primitive whose node the ray overlaps within `[t_min, t_max]`.
    ///
    /// `visit(prim, t_max)` returns a new, closer `t_max` to shrink the
    /// search (closest hit) or `None` to keep it (any hit).
    pub fn traverse<F>(&self, ray: &Ray, t_min: f32, mut t_max: f32, mut visit: F) -> f32
    where
        F: FnMut(u32, f32) -> Option<f32>,
    {
        if self.prim_indices.is_empty() {
            return t_max;
        }
        let inv_dir = ray.inv_direction();
        let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
        stack.push(0);
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.bounds().intersect(ray, inv_dir, t_min, t_max).is_none() {
                continue;
            }
            if node.is_leaf() {
                let first = node.left_or_first as usize;
                for &prim in &self.prim_indices[first..first + node.count as usize] {
                    if let Some(t) = visit(prim, t_max) {
                        t_max = t_max.min(t);
                    }
                }
            } else {
                let left = node.left_or_first as usize;
                stack.push(left + 1);
                stack.push(left);
            }
        }
        t_max
    }
}

/// SAH binned split search across all 3 axes.
/// Returns (axis, split position, cost), or `None` if every axis is degenerate.
fn find_best_split(
    indices: &[u32],
    bounds: &[BBox3f],
    centroids: &[Vec3],
    centroid_bounds: &BBox3f,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32, f32)> = None;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue;
        }

        let mut bins = [Bin::EMPTY; NUM_BINS];
        let inv_extent = NUM_BINS as f32 / extent;
        for &idx in indices {
            let bin_id = ((centroids[idx as usize][axis] - centroid_bounds.min[axis]) * inv_extent) as usize;
            let bin = &mut bins[bin_id.min(NUM_BINS - 1)];
            bin.bounds.expand_by_box(&bounds[idx as usize]);
            bin.count += 1;
        }

        // Prefix sweep from the left
        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = BBox3f::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.expand_by_box(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        // Suffix sweep from the right, evaluating SAH
        sweep = BBox3f::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.expand_by_box(&bins[i].bounds);
            sweep_count += bins[i].count;
            let cost = TRAVERSAL_COST
                + INTERSECT_COST
                    * (left_count[i - 1] as f32 * left_area[i - 1] + sweep_count as f32 * sweep.area());

            if best.map_or(true, |(_, _, c)| cost < c) {
                let pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
                best = Some((axis, pos, cost));
            }
        }
    }

    best
}

/// Partition slice in-place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32) -> BBox3f {
        BBox3f::new(Vec3::new(x - 0.5, -0.5, -0.5), Vec3::new(x + 0.5, 0.5, 0.5))
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = Bvh::build(&[]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.prim_indices.len(), 0);
        assert_eq!(bvh.depth(), 0);
    }

    #[test]
    fn test_single_primitive() {
        let bvh = Bvh::build(&[unit_box(0.0)]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 1);
        assert_eq!(bvh.depth(), 1);
    }

    #[test]
    fn test_many_primitives_builds_tree() {
        let boxes: Vec<BBox3f> = (0..100).map(|i| unit_box(i as f32 * 2.0)).collect();
        let bvh = Bvh::build(&boxes);

        assert!(bvh.nodes.len() > 1, "BVH should have internal nodes");
        let mut sorted = bvh.prim_indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_eq!(bvh.leaf_primitives(), 100);

        let root = &bvh.nodes[0];
        assert!(root.aabb_min[0] < 0.0);
        assert!(root.aabb_max[0] > 198.0);
        assert!(bvh.depth() > 1);
    }

    #[test]
    fn test_empty_boxes_skipped() {
        let boxes = vec![unit_box(0.0), BBox3f::EMPTY, unit_box(3.0), BBox3f::EMPTY];
        let bvh = Bvh::build(&boxes);
        assert_eq!(bvh.leaf_primitives(), 2);
        assert!(!bvh.prim_indices.contains(&1));
    }

    #[test]
    fn test_refit_tracks_motion() {
        let mut boxes: Vec<BBox3f> = (0..20).map(|i| unit_box(i as f32)).collect();
        let mut bvh = Bvh::build(&boxes);
        for b in &mut boxes {
            b.min.y += 10.0;
            b.max.y += 10.0;
        }
        bvh.refit(&boxes);
        let root = bvh.nodes[0].bounds();
        assert!((root.min.y - 9.5).abs() < 1e-5);
        assert!((root.max.y - 10.5).abs() < 1e-5);
    }

    #[test]
    fn test_traverse_closest_and_all() {
        let boxes: Vec<BBox3f> = (0..50).map(|i| unit_box(i as f32 * 3.0)).collect();
        let bvh = Bvh::build(&boxes);
        let ray = Ray::new(Vec3::new(-10.0, 0.0, 0.0), Vec3::X);

        let mut visited = Vec::new();
        bvh.traverse(&ray, 0.0, f32::MAX, |prim, _| {
            visited.push(prim);
            None
        });
        visited.sort_unstable();
        assert_eq!(visited, (0..50).collect::<Vec<_>>());

        let inv = ray.inv_direction();
        let closest = bvh.traverse(&ray, 0.0, f32::MAX, |prim, t_max| {
            boxes[prim as usize].intersect(&ray, inv, 0.0, t_max)
        });
        assert!((closest - 9.5).abs() < 1e-5);
    }
}
