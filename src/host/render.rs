//! Render pass: camera rays against the scene and the beam/photon top level.
//!
//! Mirrors `render.rgen`, `beam.rint` and `beam.rahit`: the surface is
//! found first, then every beam/photon instance overlapping
//! `[0, t_surface]` is tested and accumulated without terminating.

use super::procedural::ProceduralTlas;
use super::scene::{SceneTracer, SurfaceHit, SURFACE_OFFSET};
use crate::beam::{owns_beam_point, sub_beam_count, BeamKind, BeamRecord, FrameArena, InstanceDescriptor};
use crate::camera::CameraUniforms;
use crate::frame::PassParams;
use crate::optics::henyey_greenstein;
use crate::output::FrameImage;
use crate::util::{Ray, Vec3};
use rayon::prelude::*;
use std::f32::consts::PI;

/// Lower bound of `sin` in the beam kernel, avoids blow-up for parallel rays.
pub const MIN_BEAM_SIN: f32 = 0.05;

/// Radiance along one camera ray, split by origin.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Shading {
    /// Direct surface light (or background), attenuated to the camera.
    pub surface: Vec3,
    /// Beam and photon accumulation.
    pub in_scatter: Vec3,
}

impl Shading {
    pub fn total(&self) -> Vec3 {
        self.surface + self.in_scatter
    }
}

/// Everything the camera pass reads.
pub struct RenderPass<'a> {
    pub scene: &'a SceneTracer,
    pub tlas: &'a ProceduralTlas,
    pub arena: &'a FrameArena,
    pub params: &'a PassParams,
    pub camera: CameraUniforms,
    pub light: Vec3,
    pub background: Vec3,
}

impl RenderPass<'_> {
    /// Shade every pixel of `image`.
    #[tracing::instrument(skip_all, fields(width = image.width, height = image.height))]
    pub fn run(&self, image: &mut FrameImage) {
        let (width, height) = (image.width, image.height);
        if width == 0 {
            return;
        }
        image
            .pixels
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, texel) in row.iter_mut().enumerate() {
                    let ray = self.camera.primary_ray(x as u32, y as u32, width, height);
                    *texel = self.shade(&ray).total().extend(1.0).to_array();
                }
            });
    }

    pub fn shade(&self, ray: &Ray) -> Shading {
        let params = self.params;
        let optics = &params.optics;
        let hit = self.scene.closest_hit(ray, 0.0, params.max_distance);

        let surface = match &hit {
            Some(hit) => self.direct_light(hit) * optics.transmittance(hit.t),
            None => self.background * optics.transmittance(params.max_distance),
        };
        if params.show_direct_color {
            return Shading {
                surface,
                in_scatter: Vec3::ZERO,
            };
        }

        let t_end = hit.map_or(params.max_distance, |h| h.t);
        let mut in_scatter = Vec3::ZERO;
        self.tlas.traverse(ray, 0.0, t_end, |slot| {
            let inst = self.arena.instance(slot);
            if !inst.is_active() {
                return;
            }
            let (kind, index) = inst.decode();
            let Some(record) = self.arena.record(index) else {
                return;
            };
            in_scatter += match kind {
                BeamKind::Beam => self.beam_contribution(ray, t_end, record, &inst),
                BeamKind::Photon => hit
                    .as_ref()
                    .map_or(Vec3::ZERO, |h| self.photon_contribution(ray, h, record)),
            };
        });

        Shading { surface, in_scatter }
    }

    /// Diffuse response to the point light with shadow and medium attenuation.
    fn direct_light(&self, hit: &SurfaceHit) -> Vec3 {
        let to_light = self.light - hit.position;
        let dist = to_light.length();
        if dist <= 0.0 {
            return Vec3::ZERO;
        }
        let dir = to_light / dist;
        let cos = hit.normal.dot(dir);
        if cos <= 0.0 {
            return Vec3::ZERO;
        }
        let shadow = Ray::new(hit.position + hit.normal * SURFACE_OFFSET, dir);
        if self.scene.occluded(&shadow, 0.0, dist) {
            return Vec3::ZERO;
        }
        let optics = &self.params.optics;
        hit.albedo / PI * optics.source_radiance * optics.transmittance(dist) * cos / (dist * dist)
    }

    /// Closest-approach blur kernel between the camera ray and a beam.
    fn beam_contribution(&self, ray: &Ray, t_end: f32, record: &BeamRecord, inst: &InstanceDescriptor) -> Vec3 {
        let params = self.params;
        let optics = &params.optics;
        let Some(approach) = closest_approach(ray, record) else {
            return Vec3::ZERO;
        };
        if approach.t_cam < 0.0 || approach.t_cam > t_end {
            return Vec3::ZERO;
        }
        // Only the sub-instance owning the closest point counts it
        let local = inst
            .affine()
            .inverse()
            .transform_point3(record.origin() + record.direction() * approach.s);
        let count = sub_beam_count(record.length, record.radius, params.max_sub_beams_per_beam);
        if !owns_beam_point(local.z, approach.s, record.length, count) {
            return Vec3::ZERO;
        }

        let cos = record.direction().dot(-ray.direction);
        let phase = henyey_greenstein(cos, params.hg_asym_factor);
        let kernel = 2.0 * record.radius * approach.sin_theta.max(MIN_BEAM_SIN);
        record.power()
            * optics.scattering
            * phase
            * optics.transmittance(approach.t_cam)
            * optics.transmittance(approach.s)
            / kernel
    }

    /// Disc kernel of a surface photon, evaluated at the camera ray's surface.
    fn photon_contribution(&self, ray: &Ray, hit: &SurfaceHit, record: &BeamRecord) -> Vec3 {
        let params = self.params;
        let normal = record.normal();
        let denom = ray.direction.dot(normal);
        if denom.abs() < 1e-6 {
            return Vec3::ZERO;
        }
        let t = (record.origin() - ray.origin).dot(normal) / denom;
        if (t - hit.t).abs() > params.photon_surface_epsilon {
            return Vec3::ZERO;
        }
        let r = record.radius;
        if (ray.at(t) - record.origin()).length_squared() > r * r {
            return Vec3::ZERO;
        }
        record.power() * hit.albedo / PI / (PI * r * r) * params.optics.transmittance(t)
    }
}

/// Closest approach between a camera ray and a beam axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Approach {
    /// Distance along the camera ray.
    pub t_cam: f32,
    /// Distance along the beam.
    pub s: f32,
    /// Sine of the angle between both directions.
    pub sin_theta: f32,
}

/// Closest points of the camera ray and the beam, if within the beam radius.
pub fn closest_approach(ray: &Ray, record: &BeamRecord) -> Option<Approach> {
    let db = record.direction();
    let w0 = ray.origin - record.origin();
    let b = ray.direction.dot(db);
    let d = ray.direction.dot(w0);
    let e = db.dot(w0);
    let denom = 1.0 - b * b;
    if denom < 1e-6 {
        return None;
    }
    let t_cam = (b * e - d) / denom;
    let s = (e - b * d) / denom;
    if s < 0.0 || s > record.length {
        return None;
    }
    let gap = ray.at(t_cam) - (record.origin() + db * s);
    if gap.length_squared() > record.radius * record.radius {
        return None;
    }
    Some(Approach {
        t_cam,
        s,
        sin_theta: denom.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{BuildRangeSource, TlasBuildMode};
    use crate::beam::beam_sub_transform;
    use crate::frame::FrameInputs;
    use crate::optics::derive_optical_state;
    use crate::scene::cornell_box;
    use crate::settings::RenderSettings;

    #[test]
    fn test_beam_end_point_counted_once() {
        let settings = RenderSettings::default();
        let frame = FrameInputs::new(&settings, 0, 0.0);
        let scene = SceneTracer::new(&cornell_box().unwrap());
        let params = PassParams::new(&settings, &frame, derive_optical_state(&frame.volume), scene.diagonal());
        let tlas = ProceduralTlas::new(TlasBuildMode::Rebuild, BuildRangeSource::DeviceIndirect);
        let arena = FrameArena::with_capacity(4, 16);

        // Two sub-beams; the camera ray's closest point is the beam's end
        let (origin, length, radius) = (Vec3::new(0.0, -2.0, -3.0), 2.0, 0.5);
        let index = arena
            .push_record(BeamRecord::beam(origin, Vec3::Y, length, radius, Vec3::ONE, 0))
            .unwrap();
        let count = sub_beam_count(length, radius, params.max_sub_beams_per_beam);
        assert_eq!(count, 2);
        let instances: Vec<InstanceDescriptor> = (0..count)
            .map(|i| {
                let m = beam_sub_transform(origin, Vec3::Y, length, radius, i, count);
                InstanceDescriptor::new(&m, BeamKind::Beam, index, 1)
            })
            .collect();

        let pass = RenderPass {
            scene: &scene,
            tlas: &tlas,
            arena: &arena,
            params: &params,
            camera: settings.camera.uniforms(8, 8),
            light: Vec3::ZERO,
            background: Vec3::ZERO,
        };
        let ray = Ray::new(Vec3::ZERO, -Vec3::Z);
        let record = arena.record(index).unwrap();
        let first = pass.beam_contribution(&ray, 10.0, record, &instances[0]);
        let last = pass.beam_contribution(&ray, 10.0, record, &instances[1]);
        assert_eq!(first, Vec3::ZERO);
        assert!(last.max_element() > 0.0, "end point dropped: {last:?}");
    }

    #[test]
    fn test_perpendicular_approach() {
        let beam = BeamRecord::beam(Vec3::new(0.0, -5.0, -3.0), Vec3::Y, 10.0, 0.5, Vec3::ONE, 0);
        let ray = Ray::new(Vec3::ZERO, -Vec3::Z);
        let a = closest_approach(&ray, &beam).unwrap();
        assert!((a.t_cam - 3.0).abs() < 1e-5);
        assert!((a.s - 5.0).abs() < 1e-5);
        assert!((a.sin_theta - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_approach_outside_radius_or_length() {
        let beam = BeamRecord::beam(Vec3::new(1.0, -5.0, -3.0), Vec3::Y, 10.0, 0.5, Vec3::ONE, 0);
        assert!(closest_approach(&Ray::new(Vec3::ZERO, -Vec3::Z), &beam).is_none());

        let short = BeamRecord::beam(Vec3::new(0.0, 1.0, -3.0), Vec3::Y, 2.0, 0.5, Vec3::ONE, 0);
        assert!(closest_approach(&Ray::new(Vec3::ZERO, -Vec3::Z), &short).is_none());
    }

    #[test]
    fn test_parallel_rejected() {
        let beam = BeamRecord::beam(Vec3::ZERO, Vec3::X, 10.0, 0.5, Vec3::ONE, 0);
        assert!(closest_approach(&Ray::new(Vec3::new(0.0, 0.1, 0.0), Vec3::X), &beam).is_none());
    }
}
