//! Beam/photon records and the counter header.

use crate::util::Vec3;
use bytemuck::{Pod, Zeroable};

/// Record kind stored in [`BeamRecord::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BeamKind {
    /// Finite segment through the medium.
    Beam = 0,
    /// Point photon deposited on a surface.
    Photon = 1,
}

impl BeamKind {
    #[inline]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Beam),
            1 => Some(Self::Photon),
            _ => None,
        }
    }
}

/// One emitted light-path segment or surface photon (64 bytes, std430).
///
/// Immutable once written. Photons have zero length and carry the surface
/// normal; beams have a zero normal.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BeamRecord {
    pub origin: [f32; 3],
    pub length: f32,
    pub direction: [f32; 3],
    pub radius: f32,
    /// Radiant power at the origin.
    pub power: [f32; 3],
    pub kind: u32,
    pub normal: [f32; 3],
    /// Emission sample that produced this record.
    pub sample_index: u32,
}

impl BeamRecord {
    pub fn beam(origin: Vec3, direction: Vec3, length: f32, radius: f32, power: Vec3, sample_index: u32) -> Self {
        Self {
            origin: origin.to_array(),
            length,
            direction: direction.to_array(),
            radius,
            power: power.to_array(),
            kind: BeamKind::Beam as u32,
            normal: [0.0; 3],
            sample_index,
        }
    }

    pub fn photon(position: Vec3, incident: Vec3, normal: Vec3, radius: f32, power: Vec3, sample_index: u32) -> Self {
        Self {
            origin: position.to_array(),
            length: 0.0,
            direction: incident.to_array(),
            radius,
            power: power.to_array(),
            kind: BeamKind::Photon as u32,
            normal: normal.to_array(),
            sample_index,
        }
    }

    #[inline]
    pub fn kind(&self) -> Option<BeamKind> {
        BeamKind::from_u32(self.kind)
    }

    #[inline]
    pub fn origin(&self) -> Vec3 {
        Vec3::from(self.origin)
    }

    #[inline]
    pub fn direction(&self) -> Vec3 {
        Vec3::from(self.direction)
    }

    #[inline]
    pub fn power(&self) -> Vec3 {
        Vec3::from(self.power)
    }

    #[inline]
    pub fn normal(&self) -> Vec3 {
        Vec3::from(self.normal)
    }
}

/// Counter header at offset 0 of the record buffer (32 bytes).
///
/// The first 16 bytes are a `VkAccelerationStructureBuildRangeInfoKHR`
/// whose `primitiveCount` is the sub-beam counter, so the indirect top
/// level build consumes the header directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CounterHeader {
    pub sub_beam_count: u32,
    pub primitive_offset: u32,
    pub first_vertex: u32,
    pub transform_offset: u32,
    pub beam_count: u32,
    pub dropped_sub_beams: u32,
    pub dropped_beams: u32,
    pub _pad: u32,
}

/// Header size in bytes; records start here.
pub const HEADER_SIZE: u64 = std::mem::size_of::<CounterHeader>() as u64;

/// Offset of `beam_count` within the header.
pub const BEAM_COUNT_OFFSET: u64 = 16;

impl CounterHeader {
    /// Anything dropped by the overflow clamp this frame.
    pub fn overflowed(&self) -> bool {
        self.dropped_sub_beams > 0 || self.dropped_beams > 0
    }
}
