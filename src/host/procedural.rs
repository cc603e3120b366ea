//! Per-frame top level over the beam/photon instances.
//!
//! The primitive count is read from the arena header, the host stand-in
//! for the device-side build range. Nothing on the calling side knows how
//! many instances emission produced.

use crate::accel::{BuildRangeSource, BuildStats, Bvh, TlasBuildMode};
use crate::beam::{FrameArena, InstanceDescriptor};
use crate::util::{BBox3f, Ray};

/// Host top level structure, rebuilt or refitted every frame.
#[derive(Debug)]
pub struct ProceduralTlas {
    mode: TlasBuildMode,
    range: BuildRangeSource,
    bvh: Bvh,
    /// Active instance count of the last full build.
    built_count: Option<u32>,
}

impl ProceduralTlas {
    pub fn new(mode: TlasBuildMode, range: BuildRangeSource) -> Self {
        // The host always has the count at hand, so Auto means indirect
        let range = match range {
            BuildRangeSource::Auto => BuildRangeSource::DeviceIndirect,
            other => other,
        };
        Self {
            mode,
            range,
            bvh: Bvh::default(),
            built_count: None,
        }
    }

    pub fn range_source(&self) -> BuildRangeSource {
        self.range
    }

    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    /// Build (or refit) over the instances emission wrote this frame.
    #[tracing::instrument(skip_all, fields(range = ?self.range))]
    pub fn build(&mut self, arena: &FrameArena) -> BuildStats {
        let count = arena.header().sub_beam_count;
        let primitives = match self.range {
            BuildRangeSource::CapacityPadded => arena.max_sub_beams(),
            _ => count,
        };

        // Inactive (zero-filled) instances get an empty box and never enter the tree
        let bounds: Vec<BBox3f> = (0..primitives)
            .map(|slot| {
                let inst: InstanceDescriptor = arena.instance(slot);
                if inst.is_active() {
                    inst.world_bounds()
                } else {
                    BBox3f::EMPTY
                }
            })
            .collect();

        // Slots fill densely from zero, so an equal count means an equal active set.
        // An indirect range can change size, so only the padded range refits.
        let refit = self.mode == TlasBuildMode::Update
            && self.range == BuildRangeSource::CapacityPadded
            && self.built_count == Some(count);
        if refit {
            self.bvh.refit(&bounds);
        } else {
            self.bvh = Bvh::build(&bounds);
            self.built_count = Some(count);
        }

        let stats = BuildStats::of(&self.bvh, refit);
        tracing::debug!(
            leaves = stats.leaf_instances,
            nodes = stats.nodes,
            depth = stats.depth,
            refit,
            "top level built"
        );
        stats
    }

    /// Visit every instance slot whose bounds the ray overlaps.
    pub fn traverse<F>(&self, ray: &Ray, t_min: f32, t_max: f32, mut visit: F)
    where
        F: FnMut(u32),
    {
        self.bvh.traverse(ray, t_min, t_max, |slot, _| {
            visit(slot);
            None
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::{beam_sub_transform, BeamKind, BeamRecord};
    use crate::util::Vec3;

    fn fill(arena: &FrameArena, beams: u32) {
        for b in 0..beams {
            let origin = Vec3::new(b as f32 * 3.0, 0.0, 0.0);
            let index = arena
                .push_record(BeamRecord::beam(origin, Vec3::Y, 4.0, 0.5, Vec3::ONE, b))
                .unwrap();
            for i in 0..4 {
                let m = beam_sub_transform(origin, Vec3::Y, 4.0, 0.5, i, 4);
                arena.push_instance(InstanceDescriptor::new(&m, BeamKind::Beam, index, 1));
            }
        }
    }

    #[test]
    fn test_leaf_count_matches_header() {
        for range in [BuildRangeSource::DeviceIndirect, BuildRangeSource::CapacityPadded] {
            let arena = FrameArena::with_capacity(64, 256);
            fill(&arena, 10);
            let mut tlas = ProceduralTlas::new(TlasBuildMode::Rebuild, range);
            let stats = tlas.build(&arena);
            assert_eq!(stats.leaf_instances, arena.header().sub_beam_count);
            assert_eq!(stats.leaf_instances, 40);
            assert!(!stats.refit);
        }
    }

    #[test]
    fn test_empty_frame_builds_empty_tree() {
        let arena = FrameArena::with_capacity(4, 4);
        let mut tlas = ProceduralTlas::new(TlasBuildMode::Rebuild, BuildRangeSource::Auto);
        assert_eq!(tlas.range_source(), BuildRangeSource::DeviceIndirect);
        let stats = tlas.build(&arena);
        assert_eq!(stats.leaf_instances, 0);
        let mut visited = 0;
        tlas.traverse(&Ray::new(Vec3::ZERO, Vec3::X), 0.0, 100.0, |_| visited += 1);
        assert_eq!(visited, 0);
    }

    #[test]
    fn test_update_refits_only_on_equal_count() {
        let mut arena = FrameArena::with_capacity(64, 256);
        let mut tlas = ProceduralTlas::new(TlasBuildMode::Update, BuildRangeSource::CapacityPadded);
        fill(&arena, 5);
        assert!(!tlas.build(&arena).refit);

        arena.reset();
        fill(&arena, 5);
        let stats = tlas.build(&arena);
        assert!(stats.refit);
        assert_eq!(stats.leaf_instances, 20);

        arena.reset();
        fill(&arena, 6);
        assert!(!tlas.build(&arena).refit);
    }

    #[test]
    fn test_indirect_range_never_refits() {
        let mut arena = FrameArena::with_capacity(64, 256);
        let mut tlas = ProceduralTlas::new(TlasBuildMode::Update, BuildRangeSource::DeviceIndirect);
        for _ in 0..3 {
            arena.reset();
            fill(&arena, 5);
            let stats = tlas.build(&arena);
            assert!(!stats.refit);
            assert_eq!(stats.leaf_instances, 20);
        }
    }

    #[test]
    fn test_traverse_finds_sub_beams() {
        let arena = FrameArena::with_capacity(64, 256);
        fill(&arena, 3);
        let mut tlas = ProceduralTlas::new(TlasBuildMode::Rebuild, BuildRangeSource::DeviceIndirect);
        tlas.build(&arena);

        // Horizontal ray at y = 1.5 crosses the second sub-beam of every beam
        let mut slots = Vec::new();
        tlas.traverse(&Ray::new(Vec3::new(-5.0, 1.5, 0.0), Vec3::X), 0.0, 100.0, |s| slots.push(s));
        slots.sort_unstable();
        assert!(slots.contains(&1));
        assert!(slots.contains(&5));
        assert!(slots.contains(&9));
    }
}
