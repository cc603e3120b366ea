//! Math type re-exports and ray tracing helpers.
//!
//! Re-exports the `glam` types used across the crate and adds the
//! bounding box and ray types shared by the BVH builders and both
//! execution backends.

pub use glam::{Affine3A, Mat3, Mat4, Quat, UVec2, Vec2, Vec3, Vec3A, Vec4};

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// 3D bounding box with single precision.
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BBox3f {
    pub min: Vec3,
    pub max: Vec3,
}

impl BBox3f {
    /// Empty bounding box (inverted, will expand on first point).
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Create a new bounding box from min and max points.
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Check if this box is empty (has no volume).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Expand this box to include a point.
    #[inline]
    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Expand this box to include another box.
    #[inline]
    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    /// Get the center of the box.
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size (extents) of the box.
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Surface area (for SAH cost). Zero for empty boxes.
    #[inline]
    pub fn area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.size();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Longest axis (0=x, 1=y, 2=z).
    #[inline]
    pub fn longest_axis(&self) -> usize {
        let d = self.size();
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }

    /// Box enclosing all eight corners of `self` after an affine transform.
    pub fn transformed(&self, m: &Affine3A) -> Self {
        let mut out = Self::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.expand_by_point(m.transform_point3(corner));
        }
        out
    }

    /// Slab test. Returns the entry distance when the ray overlaps
    /// the box inside `[t_min, t_max]`.
    #[inline]
    pub fn intersect(&self, ray: &Ray, inv_dir: Vec3, t_min: f32, t_max: f32) -> Option<f32> {
        let t0 = (self.min - ray.origin) * inv_dir;
        let t1 = (self.max - ray.origin) * inv_dir;
        let near = t0.min(t1).max_element().max(t_min);
        let far = t0.max(t1).min_element().min(t_max);
        (near <= far).then_some(near)
    }
}

impl Default for BBox3f {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for BBox3f {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BBox3f({:?} - {:?})", self.min, self.max)
    }
}

/// Ray with origin and (normalized) direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Point along the ray at distance `t`.
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Reciprocal direction for slab tests (infinite components stay finite-safe).
    #[inline]
    pub fn inv_direction(&self) -> Vec3 {
        Vec3::ONE / self.direction
    }
}

/// Orthonormal basis with `w` as the given (normalized) axis.
///
/// Branchless construction (Duff et al. 2017), identical to the GLSL helper.
pub fn orthonormal_basis(w: Vec3) -> (Vec3, Vec3) {
    let sign = 1.0f32.copysign(w.z);
    let a = -1.0 / (sign + w.z);
    let b = w.x * w.y * a;
    let u = Vec3::new(1.0 + sign * w.x * w.x * a, sign * b, -sign * w.x);
    let v = Vec3::new(b, sign + w.y * w.y * a, -w.y);
    (u, v)
}
