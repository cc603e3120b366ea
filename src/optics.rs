//! Optical coefficient derivation for the participating medium.
//!
//! Artists author fog with two colors: the color right next to the light
//! and the color one unit of distance away. [`derive_optical_state`] turns
//! them into per-channel extinction and scattering coefficients plus a
//! source radiance back-solved from a fixed reference distance, so the
//! rendered falloff reproduces the authored colors.

use crate::settings::VolumeParams;
use crate::util::Vec3;
use bytemuck::{Pod, Zeroable};
use std::f32::consts::PI;

/// Distance at which the authored near color is matched.
pub const REFERENCE_DISTANCE: f32 = 15.0;

/// Extinction below this is treated as a clear medium.
pub const EXTINCTION_EPSILON: f32 = 1e-5;

/// Derived medium constants shared by emission and rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpticalState {
    /// Per-channel extinction (natural log of the near/unit color ratio).
    pub extinction: Vec3,
    /// Per-channel scattering (`air_albedo * extinction`).
    pub scattering: Vec3,
    /// Radiance leaving the light, already scaled by intensity.
    pub source_radiance: Vec3,
    /// Unit-distance color after clamping against the near color.
    pub unit_distance_color: Vec3,
    /// Near color with alpha applied.
    pub near_color: Vec3,
}

impl OpticalState {
    /// Mean extinction used for free-flight sampling.
    #[inline]
    pub fn mean_extinction(&self) -> f32 {
        (self.extinction.x + self.extinction.y + self.extinction.z) / 3.0
    }

    /// True when the medium does not attenuate at all.
    #[inline]
    pub fn is_clear(&self) -> bool {
        self.extinction.max_element() <= EXTINCTION_EPSILON
    }

    /// Per-channel transmittance over `distance`.
    #[inline]
    pub fn transmittance(&self, distance: f32) -> Vec3 {
        if self.is_clear() {
            return Vec3::ONE;
        }
        let d = distance.max(0.0);
        Vec3::new(
            (-self.extinction.x * d).exp(),
            (-self.extinction.y * d).exp(),
            (-self.extinction.z * d).exp(),
        )
    }

    /// GPU-friendly packed form.
    pub fn to_gpu(&self) -> GpuOptics {
        GpuOptics {
            extinction: self.extinction.to_array(),
            mean_extinction: self.mean_extinction(),
            scattering: self.scattering.to_array(),
            _pad0: 0.0,
            source_radiance: self.source_radiance.to_array(),
            _pad1: 0.0,
        }
    }
}

/// Optical constants as laid out in the frame uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuOptics {
    pub extinction: [f32; 3],
    pub mean_extinction: f32,
    pub scattering: [f32; 3],
    pub _pad0: f32,
    pub source_radiance: [f32; 3],
    pub _pad1: f32,
}

/// Translate artist-facing colors into medium coefficients.
///
/// Deterministic and side-effect free. Channels with a zero near color
/// get a unit ratio (no extinction); channels with vanishing extinction
/// fall back to the near color as source radiance.
pub fn derive_optical_state(params: &VolumeParams) -> OpticalState {
    let near = Vec3::from_slice(&params.near_color[..3]) * params.near_color[3];
    let unit = Vec3::from_slice(&params.unit_distance_color[..3]) * params.unit_distance_color[3];

    let floor = near * params.min_unit_distance_albedo;
    let unit = unit.max(floor).min(near);

    let ratio = Vec3::select(near.cmpeq(Vec3::ZERO), Vec3::ONE, near / unit);
    let extinction = Vec3::new(ratio.x.ln(), ratio.y.ln(), ratio.z.ln());
    let scattering = params.air_albedo * extinction;

    let mut source = Vec3::ZERO;
    for c in 0..3 {
        source[c] = if extinction[c] <= EXTINCTION_EPSILON {
            near[c]
        } else {
            near[c] * ratio[c].powf(REFERENCE_DISTANCE) / scattering[c]
        };
    }

    OpticalState {
        extinction,
        scattering,
        source_radiance: source * params.intensity,
        unit_distance_color: unit,
        near_color: near,
    }
}

/// Caches the derived state and recomputes it only when the inputs change.
#[derive(Debug, Default)]
pub struct OpticsCache {
    key: Option<VolumeParams>,
    state: Option<OpticalState>,
}

impl OpticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for `params`, re-deriving on change.
    pub fn get(&mut self, params: &VolumeParams) -> OpticalState {
        match (&self.key, self.state) {
            (Some(key), Some(state)) if key.optically_equal(params) => state,
            _ => {
                let state = derive_optical_state(params);
                tracing::debug!(
                    extinction = ?state.extinction,
                    source = ?state.source_radiance,
                    "optical state derived"
                );
                self.key = Some(params.clone());
                self.state = Some(state);
                state
            }
        }
    }
}

/// Henyey-Greenstein phase function.
///
/// `cos_theta` is the cosine between the light's travel direction and
/// the scattered direction, so positive `g` favours forward scattering.
#[inline]
pub fn henyey_greenstein(cos_theta: f32, g: f32) -> f32 {
    let g2 = g * g;
    let denom = (1.0 + g2 - 2.0 * g * cos_theta).max(1e-6);
    (1.0 - g2) / (4.0 * PI * denom * denom.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(near: [f32; 4], unit: [f32; 4]) -> VolumeParams {
        VolumeParams {
            near_color: near,
            unit_distance_color: unit,
            ..VolumeParams::default()
        }
    }

    #[test]
    fn test_extinction_matches_color_ratio() {
        let p = params([1.0, 0.8, 0.5, 1.0], [0.816, 0.5, 0.25, 1.0]);
        let s = derive_optical_state(&p);
        let near = Vec3::new(1.0, 0.8, 0.5);
        let unit = Vec3::new(0.816, 0.5, 0.25);
        for c in 0..3 {
            let expected = unit[c] / near[c];
            assert!(((-s.extinction[c]).exp() - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_unit_color_clamped() {
        // Above near color and below the floor
        let p = params([0.5, 1.0, 1.0, 1.0], [0.9, 0.01, 0.5, 1.0]);
        let s = derive_optical_state(&p);
        assert_eq!(s.unit_distance_color.x, 0.5);
        assert!((s.unit_distance_color.y - 0.1).abs() < 1e-6);
        assert_eq!(s.unit_distance_color.z, 0.5);
        assert_eq!(s.extinction.x, 0.0);
    }

    #[test]
    fn test_alpha_scales_colors() {
        let p = params([1.0, 1.0, 1.0, 0.5], [1.0, 1.0, 1.0, 0.25]);
        let s = derive_optical_state(&p);
        assert_eq!(s.near_color, Vec3::splat(0.5));
        assert!((s.extinction.x - 2.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_zero_near_color_is_clear() {
        let p = params([0.0, 0.0, 0.0, 1.0], [0.5, 0.5, 0.5, 1.0]);
        let s = derive_optical_state(&p);
        assert_eq!(s.extinction, Vec3::ZERO);
        assert_eq!(s.source_radiance, Vec3::ZERO);
        assert!(s.source_radiance.is_finite());
        assert!(s.is_clear());
        assert_eq!(s.transmittance(100.0), Vec3::ONE);
    }

    #[test]
    fn test_clear_medium_uses_near_color() {
        let mut p = params([0.7, 0.7, 0.7, 1.0], [0.7, 0.7, 0.7, 1.0]);
        p.intensity = 2.0;
        let s = derive_optical_state(&p);
        assert!((s.source_radiance - Vec3::splat(1.4)).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_source_radiance_back_solve() {
        let p = params([1.0, 1.0, 1.0, 1.0], [0.5, 0.5, 0.5, 1.0]);
        let s = derive_optical_state(&p);
        let expected = 2.0f32.powf(REFERENCE_DISTANCE) / (p.air_albedo * 2.0f32.ln()) * p.intensity;
        assert!((s.source_radiance.x - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn test_hg_normalized() {
        for g in [-0.7f32, 0.0, 0.3, 0.9] {
            let n = 20000;
            let mut sum = 0.0f64;
            for i in 0..n {
                let mu = -1.0 + 2.0 * (i as f32 + 0.5) / n as f32;
                sum += henyey_greenstein(mu, g) as f64 * (2.0 / n as f64);
            }
            let integral = sum * 2.0 * std::f64::consts::PI;
            assert!((integral - 1.0).abs() < 1e-2, "g={g} integral={integral}");
        }
    }

    #[test]
    fn test_cache_recomputes_on_change() {
        let mut cache = OpticsCache::new();
        let mut p = VolumeParams::default();
        let a = cache.get(&p);
        assert_eq!(cache.get(&p), a);
        p.intensity *= 2.0;
        let b = cache.get(&p);
        assert!((b.source_radiance.x - 2.0 * a.source_radiance.x).abs() < 1e-2 * b.source_radiance.x);
    }
}
