//! Lowering of schedule barriers to Vulkan pipeline barriers.

use crate::beam::HEADER_SIZE;
use crate::frame::{Barrier, Region, Stage};
use ash::vk;
use smallvec::SmallVec;

/// Stage mask and access mask that make `stage`'s writes available.
pub fn src_scope(stage: Stage) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match stage {
        Stage::Transfer => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        Stage::Emission => (vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR, vk::AccessFlags::SHADER_WRITE),
        Stage::AccelBuild => (
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
        // Read-only stage: execution dependency only
        Stage::Render => (vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR, vk::AccessFlags::empty()),
    }
}

/// Stage mask and access mask through which `stage` reads and writes.
pub fn dst_scope(stage: Stage) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match stage {
        Stage::Transfer => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        Stage::Emission => (
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ),
        // Instance data is read as shader input, the build range as an indirect command
        Stage::AccelBuild => (
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                | vk::AccessFlags::INDIRECT_COMMAND_READ
                | vk::AccessFlags::SHADER_READ,
        ),
        Stage::Render => (
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ,
        ),
    }
}

/// Buffers backing the tracked regions.
#[derive(Debug, Clone, Copy)]
pub struct RegionBuffers {
    /// Counter header followed by the records.
    pub records: vk::Buffer,
    pub instances: vk::Buffer,
}

/// A barrier ready for `cmd_pipeline_barrier`.
#[derive(Debug, Clone, Default)]
pub struct LoweredBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub memory: SmallVec<[vk::MemoryBarrier<'static>; 1]>,
    pub buffers: SmallVec<[vk::BufferMemoryBarrier<'static>; 3]>,
}

/// Byte range of a buffer-backed region, `None` for the top level.
pub fn region_range(region: Region) -> Option<(vk::DeviceSize, vk::DeviceSize)> {
    match region {
        Region::Counters => Some((0, HEADER_SIZE)),
        Region::Records => Some((HEADER_SIZE, vk::WHOLE_SIZE)),
        Region::Instances => Some((0, vk::WHOLE_SIZE)),
        Region::TopLevel => None,
    }
}

pub fn lower(barrier: &Barrier, buffers: &RegionBuffers) -> LoweredBarrier {
    let (src_stage, src_access) = src_scope(barrier.src);
    let (dst_stage, dst_access) = dst_scope(barrier.dst);
    let mut out = LoweredBarrier {
        src_stage,
        dst_stage,
        ..Default::default()
    };

    for &region in &barrier.regions {
        match region_range(region) {
            Some((offset, size)) => {
                let buffer = match region {
                    Region::Instances => buffers.instances,
                    _ => buffers.records,
                };
                out.buffers.push(
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer)
                        .offset(offset)
                        .size(size),
                );
            }
            None => {
                if out.memory.is_empty() {
                    out.memory.push(
                        vk::MemoryBarrier::default()
                            .src_access_mask(src_access)
                            .dst_access_mask(dst_access),
                    );
                }
            }
        }
    }
    out
}

/// Record a lowered barrier.
pub fn record(device: &ash::Device, cmd: vk::CommandBuffer, barrier: &LoweredBarrier) {
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &barrier.memory,
            &barrier.buffers,
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameCommand, FrameSchedule};
    use ash::vk::Handle;

    fn buffers() -> RegionBuffers {
        RegionBuffers {
            records: vk::Buffer::from_raw(1),
            instances: vk::Buffer::from_raw(2),
        }
    }

    #[test]
    fn test_emission_to_build_covers_indirect_read() {
        let schedule = FrameSchedule::standard();
        let barrier = schedule
            .barriers()
            .find(|b| b.src == Stage::Emission && b.dst == Stage::AccelBuild)
            .unwrap();
        let lowered = lower(barrier, &buffers());
        assert_eq!(lowered.src_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(lowered.dst_stage, vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR);
        assert_eq!(lowered.buffers.len(), 3);
        assert!(lowered.memory.is_empty());

        let header = lowered
            .buffers
            .iter()
            .find(|b| b.buffer == buffers().records && b.offset == 0)
            .unwrap();
        assert_eq!(header.size, HEADER_SIZE);
        assert!(header.dst_access_mask.contains(vk::AccessFlags::INDIRECT_COMMAND_READ));
        assert!(header.src_access_mask.contains(vk::AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_top_level_uses_memory_barrier() {
        let schedule = FrameSchedule::standard();
        let barrier = schedule
            .barriers()
            .find(|b| b.src == Stage::AccelBuild && b.dst == Stage::Render)
            .unwrap();
        let lowered = lower(barrier, &buffers());
        assert_eq!(lowered.memory.len(), 1);
        assert!(lowered.memory[0]
            .src_access_mask
            .contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
        assert!(lowered.memory[0]
            .dst_access_mask
            .contains(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR));
    }

    #[test]
    fn test_every_schedule_barrier_lowers_to_something() {
        for command in &FrameSchedule::standard().commands {
            if let FrameCommand::Barrier(b) = command {
                let lowered = lower(b, &buffers());
                assert!(!lowered.memory.is_empty() || !lowered.buffers.is_empty());
                assert!(!lowered.src_stage.is_empty());
                assert!(!lowered.dst_stage.is_empty());
            }
        }
    }

    #[test]
    fn test_war_barrier_has_no_src_access() {
        let (_, access) = src_scope(Stage::Render);
        assert!(access.is_empty());
    }
}
