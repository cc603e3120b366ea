//! Static scene tracing for the host backend.

use crate::accel::Bvh;
use crate::scene::{Material, SceneBuffers, WorldTriangle};
use crate::util::{BBox3f, Ray, Vec3};

/// Offset along the normal for rays leaving a surface.
pub const SURFACE_OFFSET: f32 = 1e-3;

/// Nearest opaque hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceHit {
    pub t: f32,
    pub position: Vec3,
    /// Shading normal, facing the incoming ray.
    pub normal: Vec3,
    pub albedo: Vec3,
}

/// World-space triangles under one BVH.
#[derive(Debug, Clone)]
pub struct SceneTracer {
    triangles: Vec<WorldTriangle>,
    materials: Vec<Material>,
    bvh: Bvh,
    bounds: BBox3f,
}

impl SceneTracer {
    pub fn new(scene: &SceneBuffers) -> Self {
        let triangles = scene.world_triangles();
        let boxes: Vec<BBox3f> = triangles.iter().map(WorldTriangle::bounds).collect();
        let bvh = Bvh::build(&boxes);
        let mut bounds = BBox3f::EMPTY;
        for b in &boxes {
            bounds.expand_by_box(b);
        }
        tracing::debug!(triangles = triangles.len(), nodes = bvh.nodes.len(), "scene BVH built");
        Self {
            triangles,
            materials: scene.materials.clone(),
            bvh,
            bounds,
        }
    }

    pub fn bounds(&self) -> BBox3f {
        self.bounds
    }

    /// Length of the scene bounds diagonal.
    pub fn diagonal(&self) -> f32 {
        if self.bounds.is_empty() {
            0.0
        } else {
            self.bounds.size().length()
        }
    }

    pub fn closest_hit(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<SurfaceHit> {
        let mut best: Option<(u32, f32, f32, f32)> = None;
        self.bvh.traverse(ray, t_min, t_max, |prim, t_far| {
            let (t, u, v) = intersect_triangle(ray, &self.triangles[prim as usize])?;
            if t < t_min || t >= t_far {
                return None;
            }
            best = Some((prim, t, u, v));
            Some(t)
        });

        let (prim, t, u, v) = best?;
        let tri = &self.triangles[prim as usize];
        let geometric = (tri.v1 - tri.v0).cross(tri.v2 - tri.v0).normalize_or_zero();
        let mut normal = (tri.n[0] * (1.0 - u - v) + tri.n[1] * u + tri.n[2] * v).normalize_or_zero();
        if normal == Vec3::ZERO {
            normal = geometric;
        }
        if normal.dot(ray.direction) > 0.0 {
            normal = -normal;
        }
        let albedo = self
            .materials
            .get(tri.material as usize)
            .map_or(Vec3::ZERO, Material::albedo);
        Some(SurfaceHit {
            t,
            position: ray.at(t),
            normal,
            albedo,
        })
    }

    /// True if anything blocks the ray within `(t_min, t_max)`.
    pub fn occluded(&self, ray: &Ray, t_min: f32, t_max: f32) -> bool {
        let mut hit = false;
        self.bvh.traverse(ray, t_min, t_max, |prim, _| {
            if hit {
                return None;
            }
            let (t, _, _) = intersect_triangle(ray, &self.triangles[prim as usize])?;
            if t > t_min && t < t_max {
                hit = true;
                // Collapse the interval so the remaining nodes are culled
                return Some(t_min);
            }
            None
        });
        hit
    }
}

/// Moller-Trumbore. Returns `(t, u, v)`; both faces count.
pub fn intersect_triangle(ray: &Ray, tri: &WorldTriangle) -> Option<(f32, f32, f32)> {
    let e1 = tri.v1 - tri.v0;
    let e2 = tri.v2 - tri.v0;
    let h = ray.direction.cross(e2);
    let a = e1.dot(h);
    if a.abs() < 1e-9 {
        return None;
    }
    let f = 1.0 / a;
    let s = ray.origin - tri.v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = f * ray.direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = f * e2.dot(q);
    (t > 0.0).then_some((t, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::cornell_box;

    #[test]
    fn test_floor_hit_from_above() {
        let tracer = SceneTracer::new(&cornell_box().unwrap());
        let ray = Ray::new(Vec3::new(-4.0, 9.0, 4.0), -Vec3::Y);
        let hit = tracer.closest_hit(&ray, 0.0, f32::INFINITY).unwrap();
        assert!((hit.t - 9.0).abs() < 1e-4);
        assert!((hit.normal - Vec3::Y).length() < 1e-4);
        assert!((hit.albedo.x - 0.73).abs() < 1e-6);
    }

    #[test]
    fn test_walls_colored() {
        let tracer = SceneTracer::new(&cornell_box().unwrap());
        let left = tracer
            .closest_hit(&Ray::new(Vec3::new(0.0, 8.0, 4.0), -Vec3::X), 0.0, 100.0)
            .unwrap();
        assert!(left.albedo.x > left.albedo.y);
        assert!((left.normal - Vec3::X).length() < 1e-4);
    }

    #[test]
    fn test_open_side_escapes() {
        let tracer = SceneTracer::new(&cornell_box().unwrap());
        let ray = Ray::new(Vec3::new(0.0, 5.0, 0.0), Vec3::Z);
        assert!(tracer.closest_hit(&ray, 0.0, 100.0).is_none());
        assert!(!tracer.occluded(&ray, 0.0, 100.0));
        assert!(tracer.occluded(&Ray::new(Vec3::new(0.0, 5.0, 0.0), -Vec3::Z), 0.0, 100.0));
    }

    #[test]
    fn test_diagonal() {
        let tracer = SceneTracer::new(&cornell_box().unwrap());
        let expected = Vec3::new(10.0, 10.0, 10.0).length();
        assert!((tracer.diagonal() - expected).abs() < 1e-3);
    }
}
