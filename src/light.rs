//! Point light placement and animation.
//!
//! The light can orbit around its rest position and slowly cycle its
//! near color. Both are driven purely by elapsed time, so a frame is
//! reproducible from `(settings, elapsed, frame index)`.

use crate::sampling::tea;
use crate::util::Vec3;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightSettings {
    /// Rest position of the point light.
    pub position: [f32; 3],
    /// Orbit around the rest position in the horizontal plane.
    pub motion: bool,
    pub orbit_radius: f32,
    /// Radians per second.
    pub orbit_speed: f32,
    /// Cycle the near color hue.
    pub variation: bool,
    /// Seconds per full color cycle.
    pub variation_interval: f32,
}

impl Default for LightSettings {
    fn default() -> Self {
        Self {
            position: [0.0, 8.5, 0.0],
            motion: false,
            orbit_radius: 2.0,
            orbit_speed: 0.5,
            variation: false,
            variation_interval: 30.0,
        }
    }
}

/// Light state for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightState {
    pub position: Vec3,
    /// Near color (rgb + alpha) after variation.
    pub near_color: [f32; 4],
}

/// Evaluate the animated light at `elapsed` seconds.
pub fn animate(settings: &LightSettings, near_color: [f32; 4], elapsed: f32) -> LightState {
    let mut position = Vec3::from(settings.position);
    if settings.motion {
        let angle = elapsed * settings.orbit_speed;
        position.x += settings.orbit_radius * angle.cos();
        position.z += settings.orbit_radius * angle.sin();
    }

    let mut color = near_color;
    if settings.variation && settings.variation_interval > 0.0 {
        let phase = (elapsed / settings.variation_interval).fract() * TAU;
        let tint = Vec3::new(
            0.5 + 0.5 * phase.cos(),
            0.5 + 0.5 * (phase - TAU / 3.0).cos(),
            0.5 + 0.5 * (phase + TAU / 3.0).cos(),
        );
        // Blend toward the tint so the authored color still dominates
        let base = Vec3::new(color[0], color[1], color[2]);
        let mixed = base * (0.5 + 0.5 * tint);
        color = [mixed.x, mixed.y, mixed.z, color[3]];
    }

    LightState {
        position,
        near_color: color,
    }
}

/// Seed for the emission pass of frame `frame_index`.
pub fn frame_seed(frame_index: u32, base_seed: u32) -> u32 {
    tea(frame_index, base_seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_light() {
        let s = LightSettings::default();
        let state = animate(&s, [1.0; 4], 12.5);
        assert_eq!(state.position, Vec3::from(s.position));
        assert_eq!(state.near_color, [1.0; 4]);
    }

    #[test]
    fn test_orbit_keeps_radius() {
        let s = LightSettings {
            motion: true,
            ..Default::default()
        };
        for t in [0.0f32, 1.0, 7.3] {
            let p = animate(&s, [1.0; 4], t).position;
            let offset = p - Vec3::from(s.position);
            assert!((offset.length() - s.orbit_radius).abs() < 1e-4);
            assert_eq!(offset.y, 0.0);
        }
    }

    #[test]
    fn test_variation_is_periodic() {
        let s = LightSettings {
            variation: true,
            ..Default::default()
        };
        let a = animate(&s, [0.8, 0.8, 0.8, 1.0], 3.0).near_color;
        let b = animate(&s, [0.8, 0.8, 0.8, 1.0], 3.0 + s.variation_interval).near_color;
        for c in 0..4 {
            assert!((a[c] - b[c]).abs() < 1e-3);
        }
        assert!(a[..3].iter().all(|c| *c <= 0.8 + 1e-6));
    }

    #[test]
    fn test_frame_seed_changes() {
        assert_ne!(frame_seed(0, 1), frame_seed(1, 1));
    }
}
