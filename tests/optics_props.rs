//! Sweeps over the color-to-coefficient derivation and the instance tag.

use photon_beam::beam::{BeamKind, InstanceDescriptor, RECORD_INDEX_MASK};
use photon_beam::optics::{derive_optical_state, henyey_greenstein};
use photon_beam::settings::VolumeParams;
use photon_beam::util::Affine3A;

fn volume(near: f32, unit: f32, floor: f32) -> VolumeParams {
    VolumeParams {
        near_color: [near, near * 0.9, near * 0.8, 1.0],
        unit_distance_color: [unit, unit * 0.9, unit * 0.8, 1.0],
        min_unit_distance_albedo: floor,
        ..VolumeParams::default()
    }
}

const STEPS: [f32; 7] = [0.05, 0.1, 0.25, 0.4, 0.6, 0.8, 1.0];

#[test]
fn test_transmittance_at_unit_distance_is_color_ratio() {
    for &near in &STEPS {
        for &unit in &STEPS {
            let p = volume(near, unit, 0.1);
            let s = derive_optical_state(&p);
            for c in 0..3 {
                let n = p.near_color[c];
                let u = p.unit_distance_color[c];
                // Only inside the clamp range: floor * near <= unit <= near
                if u > n || u < 0.1 * n {
                    continue;
                }
                let ratio = u / n;
                assert!(
                    ((-s.extinction[c]).exp() - ratio).abs() < 1e-5,
                    "near {n} unit {u}: exp(-k) = {}",
                    (-s.extinction[c]).exp()
                );
                assert!((s.transmittance(1.0)[c] - ratio).abs() < 1e-5);
            }
        }
    }
}

#[test]
fn test_clamping_law() {
    for &floor in &[0.0, 0.1, 0.5] {
        for &near in &STEPS {
            for &unit in &[0.0, 0.01, 0.3, 0.9, 1.5] {
                let p = volume(near, unit, floor);
                let s = derive_optical_state(&p);
                for c in 0..3 {
                    let n = s.near_color[c];
                    let clamped = s.unit_distance_color[c];
                    assert!(clamped <= n + 1e-6, "unit {clamped} above near {n}");
                    assert!(clamped >= floor * n - 1e-6, "unit {clamped} below floor {}", floor * n);
                    assert!(s.extinction[c] >= 0.0);
                }
            }
        }
    }
}

#[test]
fn test_derived_state_finite() {
    for &floor in &[0.0, 0.1] {
        for &near in &[0.0, 0.3, 1.0] {
            for &unit in &[0.0, 0.3, 1.0] {
                let s = derive_optical_state(&volume(near, unit, floor));
                assert!(s.transmittance(10.0).is_finite());
                // A zero floor with a black unit color means infinite extinction
                if floor > 0.0 || unit > 0.0 || near == 0.0 {
                    assert!(s.extinction.is_finite());
                    assert!(s.scattering.is_finite());
                    assert!(s.source_radiance.is_finite());
                }
            }
        }
    }
}

#[test]
fn test_hg_symmetric_under_sign_flip() {
    for &g in &[-0.8, -0.3, 0.0, 0.3, 0.8] {
        for i in 0..=10 {
            let c = -1.0 + 0.2 * i as f32;
            let a = henyey_greenstein(c, g);
            let b = henyey_greenstein(-c, -g);
            assert!((a - b).abs() <= 1e-5 * a.max(1.0));
        }
    }
}

#[test]
fn test_tag_lossless_across_index_range() {
    let transform = Affine3A::IDENTITY;
    for index in [0, 1, 4095, 1 << 20, RECORD_INDEX_MASK - 1, RECORD_INDEX_MASK] {
        for kind in [BeamKind::Beam, BeamKind::Photon] {
            let inst = InstanceDescriptor::new(&transform, kind, index, 7);
            assert_eq!(inst.decode(), (kind, index));
            assert!(inst.is_active());
        }
    }
}
