//! Top-level instance descriptors and the two proxy boxes.
//!
//! Every sub-beam and photon is one instance of a unit proxy box. The
//! 24-bit custom index carries a kind tag in bit 23 and the record index
//! in the low 23 bits; intersection and any-hit stages dispatch on it.

use super::record::BeamKind;
use crate::util::{orthonormal_basis, Affine3A, BBox3f, Mat3, Vec3};
use bytemuck::{Pod, Zeroable};

/// Bit 23 of the custom index selects the photon proxy.
pub const KIND_BIT: u32 = 1 << 23;

/// Low 23 bits of the custom index hold the record index.
pub const RECORD_INDEX_MASK: u32 = KIND_BIT - 1;

/// Hit mask written for every live instance.
pub const INSTANCE_MASK: u32 = 0xFF;

/// `VK_GEOMETRY_INSTANCE_FORCE_NO_OPAQUE_BIT_KHR`
pub const FORCE_NO_OPAQUE: u32 = 0x8;

/// `VK_GEOMETRY_INSTANCE_FORCE_OPAQUE_BIT_KHR`
pub const FORCE_OPAQUE: u32 = 0x4;

/// `VK_GEOMETRY_INSTANCE_TRIANGLE_FACING_CULL_DISABLE_BIT_KHR`
pub const CULL_DISABLE: u32 = 0x1;

/// Beam proxy: radius-scaled in x/y, one sub-segment spans z in [0, 2].
pub const BEAM_PROXY: BBox3f = BBox3f::new(Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, 1.0, 2.0));

/// Photon proxy: thin slab with y along the surface normal.
///
/// Not zero height so photons on curved surfaces stay bounded.
pub const PHOTON_PROXY: BBox3f = BBox3f::new(Vec3::new(-1.0, -0.1, -1.0), Vec3::new(1.0, 0.1, 1.0));

/// Proxy box for a record kind.
pub fn proxy_box(kind: BeamKind) -> BBox3f {
    match kind {
        BeamKind::Beam => BEAM_PROXY,
        BeamKind::Photon => PHOTON_PROXY,
    }
}

/// Pack `(kind, record_index)` into a 24-bit custom index.
#[inline]
pub fn encode_custom_index(kind: BeamKind, record_index: u32) -> u32 {
    debug_assert!(record_index <= RECORD_INDEX_MASK);
    let tag = match kind {
        BeamKind::Beam => 0,
        BeamKind::Photon => KIND_BIT,
    };
    tag | (record_index & RECORD_INDEX_MASK)
}

/// Inverse of [`encode_custom_index`]. Ignores the mask byte.
#[inline]
pub fn decode_custom_index(custom_index: u32) -> (BeamKind, u32) {
    let kind = if custom_index & KIND_BIT != 0 {
        BeamKind::Photon
    } else {
        BeamKind::Beam
    };
    (kind, custom_index & RECORD_INDEX_MASK)
}

/// Instance descriptor, byte-compatible with `VkAccelerationStructureInstanceKHR`.
///
/// A zero-filled descriptor has mask 0 and a null BLAS reference: it is
/// never hit, which is what keeps a capacity-padded build correct.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Custom index (low 24 bits) and mask (high 8 bits).
    pub custom_index_and_mask: u32,
    /// SBT record offset (low 24 bits) and instance flags (high 8 bits).
    pub sbt_offset_and_flags: u32,
    /// Device address of the proxy BLAS.
    pub blas_reference: u64,
}

impl InstanceDescriptor {
    pub fn new(transform: &Affine3A, kind: BeamKind, record_index: u32, blas_reference: u64) -> Self {
        Self {
            transform: affine_to_rows(transform),
            custom_index_and_mask: encode_custom_index(kind, record_index) | (INSTANCE_MASK << 24),
            sbt_offset_and_flags: FORCE_NO_OPAQUE << 24,
            blas_reference,
        }
    }

    /// Opaque, double-sided scene mesh instance; `custom_index` is the mesh index.
    pub fn scene(transform: &Affine3A, custom_index: u32, blas_reference: u64) -> Self {
        Self {
            transform: affine_to_rows(transform),
            custom_index_and_mask: (custom_index & 0x00FF_FFFF) | (INSTANCE_MASK << 24),
            sbt_offset_and_flags: (FORCE_OPAQUE | CULL_DISABLE) << 24,
            blas_reference,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00FF_FFFF
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.custom_index_and_mask >> 24
    }

    /// Live instances have a non-zero mask.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.mask() != 0
    }

    #[inline]
    pub fn decode(&self) -> (BeamKind, u32) {
        decode_custom_index(self.custom_index())
    }

    /// Object-to-world transform.
    pub fn affine(&self) -> Affine3A {
        let t = &self.transform;
        Affine3A::from_mat3_translation(
            Mat3::from_cols(
                Vec3::new(t[0], t[4], t[8]),
                Vec3::new(t[1], t[5], t[9]),
                Vec3::new(t[2], t[6], t[10]),
            ),
            Vec3::new(t[3], t[7], t[11]),
        )
    }

    /// World bounds of the instanced proxy.
    pub fn world_bounds(&self) -> BBox3f {
        let (kind, _) = self.decode();
        proxy_box(kind).transformed(&self.affine())
    }
}

fn affine_to_rows(m: &Affine3A) -> [f32; 12] {
    let x = m.matrix3.x_axis;
    let y = m.matrix3.y_axis;
    let z = m.matrix3.z_axis;
    let t = m.translation;
    [
        x.x, y.x, z.x, t.x, //
        x.y, y.y, z.y, t.y, //
        x.z, y.z, z.z, t.z,
    ]
}

/// Transform placing the beam proxy around sub-segment `index` of `count`.
///
/// Object z in [0, 2] maps to `[index, index + 1] * length / count` along
/// the beam; [`owns_beam_point`] assigns shared end points to one of them.
pub fn beam_sub_transform(origin: Vec3, direction: Vec3, length: f32, radius: f32, index: u32, count: u32) -> Affine3A {
    let (u, v) = orthonormal_basis(direction);
    let sub_len = length / count as f32;
    Affine3A::from_mat3_translation(
        Mat3::from_cols(u * radius, v * radius, direction * (sub_len * 0.5)),
        origin + direction * (sub_len * index as f32),
    )
}

/// Transform placing the photon proxy on a surface with normal `normal`.
pub fn photon_transform(position: Vec3, normal: Vec3, radius: f32) -> Affine3A {
    let (t, b) = orthonormal_basis(normal);
    Affine3A::from_mat3_translation(Mat3::from_cols(t * radius, normal * radius, b * radius), position)
}

/// Number of sub-beams for a segment: ceil(len / 2r) in `[1, max_per_beam]`.
pub fn sub_beam_count(length: f32, radius: f32, max_per_beam: u32) -> u32 {
    let n = (length / (2.0 * radius)).ceil();
    if n.is_finite() {
        (n as u32).clamp(1, max_per_beam.max(1))
    } else {
        max_per_beam.max(1)
    }
}

const OWNER_SLACK: f32 = 1e-3;

/// Whether the sub-instance seeing beam distance `s` at object `local_z`
/// owns that point. Sub-segment `i` owns `[i, i + 1)` in units of the
/// sub-length, and the last one also owns the beam's end point.
pub fn owns_beam_point(local_z: f32, s: f32, length: f32, count: u32) -> bool {
    // Slack for the transform round trip; the index decides ownership
    if !(-OWNER_SLACK..=2.0 + OWNER_SLACK).contains(&local_z) {
        return false;
    }
    let count = count.max(1);
    let sub_len = length / count as f32;
    if count == 1 || sub_len.is_nan() || sub_len <= 0.0 {
        return true;
    }
    let owner = ((s / sub_len).floor().max(0.0) as u32).min(count - 1);
    let index = (s / sub_len - local_z * 0.5).round();
    index >= 0.0 && index as u32 == owner
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_descriptor_matches_vk_layout() {
        assert_eq!(size_of::<InstanceDescriptor>(), 64);
        assert_eq!(offset_of!(InstanceDescriptor, custom_index_and_mask), 48);
        assert_eq!(offset_of!(InstanceDescriptor, sbt_offset_and_flags), 52);
        assert_eq!(offset_of!(InstanceDescriptor, blas_reference), 56);
    }

    #[test]
    fn test_custom_index_roundtrip() {
        for kind in [BeamKind::Beam, BeamKind::Photon] {
            for idx in [0u32, 1, 4095, RECORD_INDEX_MASK] {
                let code = encode_custom_index(kind, idx);
                assert!(code < (1 << 24));
                assert_eq!(decode_custom_index(code), (kind, idx));
            }
        }
    }

    #[test]
    fn test_zeroed_descriptor_inactive() {
        let d = InstanceDescriptor::zeroed();
        assert!(!d.is_active());
        assert_eq!(d.blas_reference, 0);

        let live = InstanceDescriptor::new(&Affine3A::IDENTITY, BeamKind::Photon, 9, 0xABC0);
        assert!(live.is_active());
        assert_eq!(live.mask(), 0xFF);
        assert_eq!(live.decode(), (BeamKind::Photon, 9));
    }

    #[test]
    fn test_scene_instance_flags() {
        let d = InstanceDescriptor::scene(&Affine3A::IDENTITY, 3, 0x1000);
        assert_eq!(d.custom_index(), 3);
        assert_eq!(d.sbt_offset_and_flags >> 24, FORCE_OPAQUE | CULL_DISABLE);
        assert_eq!(d.sbt_offset_and_flags & 0x00FF_FFFF, 0);
    }

    #[test]
    fn test_transform_rows_roundtrip() {
        let m = beam_sub_transform(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.0, 0.6, 0.8), 10.0, 0.5, 2, 5);
        let d = InstanceDescriptor::new(&m, BeamKind::Beam, 0, 0);
        let back = d.affine();
        let p = Vec3::new(0.3, -0.2, 1.7);
        assert!((back.transform_point3(p) - m.transform_point3(p)).length() < 1e-5);
        // Row-major: translation in the last column
        assert_eq!(d.transform[3], m.translation.x);
    }

    #[test]
    fn test_sub_segments_tile_beam() {
        let origin = Vec3::ZERO;
        let dir = Vec3::X;
        let count = 4;
        for i in 0..count {
            let m = beam_sub_transform(origin, dir, 8.0, 0.5, i, count);
            let start = m.transform_point3(Vec3::ZERO);
            let end = m.transform_point3(Vec3::new(0.0, 0.0, 2.0));
            assert!((start.x - 2.0 * i as f32).abs() < 1e-5);
            assert!((end.x - 2.0 * (i + 1) as f32).abs() < 1e-5);
        }
    }

    #[test]
    fn test_every_beam_point_has_one_owner() {
        let (origin, dir, length, count) = (Vec3::new(1.0, 0.0, -2.0), Vec3::Y, 8.0, 4);
        for step in 0..=32 {
            let s = length * step as f32 / 32.0;
            let point = origin + dir * s;
            let owners = (0..count)
                .filter(|&i| {
                    let local = beam_sub_transform(origin, dir, length, 0.5, i, count)
                        .inverse()
                        .transform_point3(point);
                    owns_beam_point(local.z, s, length, count)
                })
                .count();
            assert_eq!(owners, 1, "s = {s}");
        }
    }

    #[test]
    fn test_beam_end_owned_by_last_sub_instance() {
        assert!(owns_beam_point(2.0, 8.0, 8.0, 4));
        assert!(!owns_beam_point(2.0, 6.0, 8.0, 4));
        assert!(owns_beam_point(0.0, 6.0, 8.0, 4));
        assert!(owns_beam_point(0.0, 0.0, 0.0, 1));
    }

    #[test]
    fn test_sub_beam_count_clamped() {
        assert_eq!(sub_beam_count(0.0, 0.5, 48), 1);
        assert_eq!(sub_beam_count(3.0, 0.5, 48), 3);
        assert_eq!(sub_beam_count(1000.0, 0.5, 48), 48);
        assert_eq!(sub_beam_count(f32::INFINITY, 0.5, 48), 48);
    }

    #[test]
    fn test_photon_bounds_follow_normal() {
        let m = photon_transform(Vec3::new(0.0, 1.0, 0.0), Vec3::Y, 2.0);
        let d = InstanceDescriptor::new(&m, BeamKind::Photon, 0, 0);
        let b = d.world_bounds();
        assert!((b.size().y - 0.4).abs() < 1e-5);
        assert!((b.size().x - 4.0).abs() < 1e-5);
    }
}
