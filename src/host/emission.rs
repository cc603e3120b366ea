//! Emission pass: parallel light paths appending into the frame arena.
//!
//! Same walk as `emission.rgen`: one invocation per sample, beam samples
//! first, photon samples after. Each invocation owns its random stream,
//! so the result only depends on the frame seed, not on scheduling.

use super::scene::{SceneTracer, SURFACE_OFFSET};
use crate::beam::{beam_sub_transform, photon_transform, sub_beam_count, BeamKind, BeamRecord, FrameArena, InstanceDescriptor};
use crate::frame::PassParams;
use crate::optics::EXTINCTION_EPSILON;
use crate::sampling::{cosine_hemisphere, sample_hg, uniform_sphere, Rng};
use crate::util::{Ray, Vec3};
use rayon::prelude::*;
use std::f32::consts::PI;

/// Proxy bottom-level references written into instance descriptors.
///
/// The host backend has no device addresses; any non-zero value marks a
/// live reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRefs {
    pub beam: u64,
    pub photon: u64,
}

impl Default for ProxyRefs {
    fn default() -> Self {
        Self { beam: 1, photon: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Medium,
    Surface,
    Escape,
}

/// Launch every emission invocation of the frame.
#[tracing::instrument(skip_all, fields(samples = params.num_samples()))]
pub fn emit(arena: &FrameArena, scene: &SceneTracer, params: &PassParams, light: Vec3, proxies: ProxyRefs) {
    (0..params.num_samples())
        .into_par_iter()
        .for_each(|sample| emit_sample(arena, scene, params, light, proxies, sample));
}

/// One light path.
pub fn emit_sample(arena: &FrameArena, scene: &SceneTracer, params: &PassParams, light: Vec3, proxies: ProxyRefs, sample: u32) {
    let is_beam = sample < params.num_beam_samples;
    let mode_samples = if is_beam {
        params.num_beam_samples
    } else {
        params.num_photon_samples
    };
    if mode_samples == 0 {
        return;
    }

    let optics = &params.optics;
    let sigma_bar = optics.mean_extinction();
    let mut rng = Rng::new(sample, params.seed);
    let mut power = 4.0 * PI * optics.source_radiance / mode_samples as f32;
    let mut origin = light;
    let mut direction = uniform_sphere(rng.next_f32(), rng.next_f32());
    let mut scattered = false;

    for _ in 0..params.max_bounces {
        let ray = Ray::new(origin, direction);
        let hit = scene.closest_hit(&ray, 0.0, params.max_distance);
        let surface_t = hit.map_or(params.max_distance, |h| h.t);

        let free_flight = if sigma_bar <= EXTINCTION_EPSILON {
            f32::INFINITY
        } else {
            -(1.0 - rng.next_f32()).ln() / sigma_bar
        };
        let (event, t) = if free_flight < surface_t {
            (Event::Medium, free_flight)
        } else if hit.is_some() {
            (Event::Surface, surface_t)
        } else {
            (Event::Escape, params.max_distance)
        };

        if is_beam && !append_beam(arena, params, proxies, origin, direction, t, power, sample) {
            return;
        }

        let transmittance = optics.transmittance(t);
        match (event, hit) {
            (Event::Medium, _) => {
                let pdf = sigma_bar * (-sigma_bar * t).exp();
                power *= optics.scattering * transmittance / pdf;
                origin = ray.at(t);
                direction = sample_hg(direction, params.hg_asym_factor, rng.next_f32(), rng.next_f32());
                scattered = true;
            }
            (Event::Surface, Some(hit)) => {
                let survive = if sigma_bar <= EXTINCTION_EPSILON {
                    1.0
                } else {
                    (-sigma_bar * t).exp()
                };
                power *= transmittance / survive;

                // Unscattered first hits are the render pass's direct light
                if !is_beam && scattered {
                    let record = BeamRecord::photon(hit.position, direction, hit.normal, params.photon_radius, power, sample);
                    if let Some(index) = arena.push_record(record) {
                        let transform = photon_transform(hit.position, hit.normal, params.photon_radius);
                        arena.push_instance(InstanceDescriptor::new(&transform, BeamKind::Photon, index, proxies.photon));
                    }
                }

                let p = hit.albedo.max_element();
                if p <= 0.0 || rng.next_f32() >= p {
                    return;
                }
                power *= hit.albedo / p;
                direction = cosine_hemisphere(rng.next_f32(), rng.next_f32(), hit.normal);
                origin = hit.position + hit.normal * SURFACE_OFFSET;
                scattered = true;
            }
            _ => return,
        }
    }
}

/// Append a beam record and its sub-beam instances.
///
/// Returns false when the record itself was clamped; the path ends there.
#[allow(clippy::too_many_arguments)]
fn append_beam(
    arena: &FrameArena,
    params: &PassParams,
    proxies: ProxyRefs,
    origin: Vec3,
    direction: Vec3,
    length: f32,
    power: Vec3,
    sample: u32,
) -> bool {
    let radius = params.beam_radius;
    let record = BeamRecord::beam(origin, direction, length, radius, power, sample);
    let Some(index) = arena.push_record(record) else {
        return false;
    };
    let count = sub_beam_count(length, radius, params.max_sub_beams_per_beam);
    for i in 0..count {
        let transform = beam_sub_transform(origin, direction, length, radius, i, count);
        if arena
            .push_instance(InstanceDescriptor::new(&transform, BeamKind::Beam, index, proxies.beam))
            .is_none()
        {
            break;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::CapacityBudget;
    use crate::frame::FrameInputs;
    use crate::optics::derive_optical_state;
    use crate::scene::cornell_box;
    use crate::settings::RenderSettings;

    fn setup(beams: u32, photons: u32) -> (RenderSettings, PassParams, SceneTracer) {
        let mut settings = RenderSettings::default();
        settings.volume.num_beam_samples = beams;
        settings.volume.num_photon_samples = photons;
        // Room for every event of every path
        settings.capacity = CapacityBudget {
            max_beam_samples: beams.max(photons),
            max_photon_samples: photons,
            beams_per_sample: 8,
            sub_beams_per_beam_sample: 200,
        };
        let frame = FrameInputs::new(&settings, 0, 0.0);
        let scene = SceneTracer::new(&cornell_box().unwrap());
        let params = PassParams::new(&settings, &frame, derive_optical_state(&frame.volume), scene.diagonal());
        (settings, params, scene)
    }

    #[test]
    fn test_beam_records_and_instances_agree() {
        let (settings, params, scene) = setup(64, 0);
        let arena = FrameArena::new(&settings.capacity);
        emit(&arena, &scene, &params, Vec3::from(settings.light.position), ProxyRefs::default());

        let header = arena.header();
        assert!(header.beam_count >= 64);
        assert!(!header.overflowed());

        let expected: u32 = arena
            .records()
            .map(|r| sub_beam_count(r.length, r.radius, params.max_sub_beams_per_beam))
            .sum();
        assert_eq!(header.sub_beam_count, expected);
        for slot in 0..header.sub_beam_count {
            let inst = arena.instance(slot);
            let (kind, index) = inst.decode();
            assert_eq!(kind, BeamKind::Beam);
            assert!(arena.record(index).is_some());
        }
    }

    #[test]
    fn test_photons_lie_on_surfaces() {
        let (settings, params, scene) = setup(0, 512);
        let arena = FrameArena::new(&settings.capacity);
        emit(&arena, &scene, &params, Vec3::from(settings.light.position), ProxyRefs::default());

        let header = arena.header();
        assert_eq!(header.beam_count, header.sub_beam_count);
        for record in arena.records() {
            assert_eq!(record.kind(), Some(BeamKind::Photon));
            assert!((record.normal().length() - 1.0).abs() < 1e-3);
            assert!(record.power().is_finite());
            let p = record.origin();
            assert!(scene.bounds().min.cmple(p + Vec3::splat(1e-2)).all());
            assert!(scene.bounds().max.cmpge(p - Vec3::splat(1e-2)).all());
        }
    }

    #[test]
    fn test_emission_is_deterministic() {
        let (settings, params, scene) = setup(32, 32);
        let light = Vec3::from(settings.light.position);
        let a = FrameArena::new(&settings.capacity);
        let b = FrameArena::new(&settings.capacity);
        emit(&a, &scene, &params, light, ProxyRefs::default());
        emit(&b, &scene, &params, light, ProxyRefs::default());

        let mut ra: Vec<_> = a.records().map(|r| (r.sample_index, r.length.to_bits())).collect();
        let mut rb: Vec<_> = b.records().map(|r| (r.sample_index, r.length.to_bits())).collect();
        ra.sort_unstable();
        rb.sort_unstable();
        assert_eq!(ra, rb);
    }
}
