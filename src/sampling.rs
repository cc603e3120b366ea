//! Random numbers and direction sampling.
//!
//! The generator is the TEA-seeded LCG used by the ray tracing shaders
//! (`shaders/common/random.glsl`), so a host emission run with the same
//! frame seed walks the same paths as the device.

use crate::util::{orthonormal_basis, Vec3};
use std::f32::consts::PI;

/// Tiny Encryption Algorithm, used to decorrelate per-invocation seeds.
pub fn tea(val0: u32, val1: u32) -> u32 {
    let mut v0 = val0;
    let mut v1 = val1;
    let mut s0 = 0u32;
    for _ in 0..16 {
        s0 = s0.wrapping_add(0x9e37_79b9);
        v0 = v0.wrapping_add(
            (v1 << 4).wrapping_add(0xa341_316c)
                ^ v1.wrapping_add(s0)
                ^ (v1 >> 5).wrapping_add(0xc801_3ea4),
        );
        v1 = v1.wrapping_add(
            (v0 << 4).wrapping_add(0xad90_777d)
                ^ v0.wrapping_add(s0)
                ^ (v0 >> 5).wrapping_add(0x7e95_761e),
        );
    }
    v0
}

/// Per-invocation random stream.
#[derive(Debug, Clone, Copy)]
pub struct Rng {
    state: u32,
}

impl Rng {
    /// Seed from an invocation index and the frame seed.
    pub fn new(index: u32, frame_seed: u32) -> Self {
        Self {
            state: tea(index, frame_seed),
        }
    }

    #[inline]
    fn lcg(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.state & 0x00ff_ffff
    }

    /// Uniform float in `[0, 1)`.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        self.lcg() as f32 / 0x0100_0000 as f32
    }
}

/// Uniform direction on the unit sphere.
pub fn uniform_sphere(u1: f32, u2: f32) -> Vec3 {
    let z = 1.0 - 2.0 * u1;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * PI * u2;
    Vec3::new(r * phi.cos(), r * phi.sin(), z)
}

/// Cosine-weighted direction in the hemisphere around `normal`.
pub fn cosine_hemisphere(u1: f32, u2: f32, normal: Vec3) -> Vec3 {
    let r = u1.sqrt();
    let phi = 2.0 * PI * u2;
    let (t, b) = orthonormal_basis(normal);
    let z = (1.0 - u1).max(0.0).sqrt();
    (t * (r * phi.cos()) + b * (r * phi.sin()) + normal * z).normalize()
}

/// Sample the cosine of the Henyey-Greenstein scattering angle.
pub fn sample_hg_cos(g: f32, u: f32) -> f32 {
    if g.abs() < 1e-3 {
        return 1.0 - 2.0 * u;
    }
    let g2 = g * g;
    let s = (1.0 - g2) / (1.0 - g + 2.0 * g * u);
    ((1.0 + g2 - s * s) / (2.0 * g)).clamp(-1.0, 1.0)
}

/// Scatter `direction` by a Henyey-Greenstein lobe.
pub fn sample_hg(direction: Vec3, g: f32, u1: f32, u2: f32) -> Vec3 {
    let cos_theta = sample_hg_cos(g, u1);
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let phi = 2.0 * PI * u2;
    let (t, b) = orthonormal_basis(direction);
    (t * (sin_theta * phi.cos()) + b * (sin_theta * phi.sin()) + direction * cos_theta).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_range_and_determinism() {
        let mut a = Rng::new(7, 42);
        let mut b = Rng::new(7, 42);
        for _ in 0..1000 {
            let x = a.next_f32();
            assert!((0.0..1.0).contains(&x));
            assert_eq!(x, b.next_f32());
        }
        let mut c = Rng::new(8, 42);
        assert_ne!(Rng::new(7, 42).next_f32(), c.next_f32());
    }

    #[test]
    fn test_sphere_directions_unit() {
        let mut rng = Rng::new(1, 1);
        let mut mean = Vec3::ZERO;
        let n = 4000;
        for _ in 0..n {
            let d = uniform_sphere(rng.next_f32(), rng.next_f32());
            assert!((d.length() - 1.0).abs() < 1e-4);
            mean += d;
        }
        assert!((mean / n as f32).length() < 0.06);
    }

    #[test]
    fn test_cosine_hemisphere_above_surface() {
        let mut rng = Rng::new(3, 9);
        let n = Vec3::new(0.0, 1.0, 0.0);
        for _ in 0..1000 {
            let d = cosine_hemisphere(rng.next_f32(), rng.next_f32(), n);
            assert!(d.dot(n) >= -1e-5);
        }
    }

    #[test]
    fn test_hg_sample_mean_cosine() {
        // E[cos] of Henyey-Greenstein equals g
        let mut rng = Rng::new(5, 11);
        for g in [-0.5f32, 0.0, 0.6] {
            let n = 20000;
            let mean: f32 = (0..n).map(|_| sample_hg_cos(g, rng.next_f32())).sum::<f32>() / n as f32;
            assert!((mean - g).abs() < 0.03, "g={g} mean={mean}");
        }
    }
}
