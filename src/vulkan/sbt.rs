//! Shader binding tables.
//!
//! ```text
//! |[ raygen ]|[ miss 0 .. miss n ]|[ hit 0 .. hit m ]|
//! ```
//!
//! Each region starts at a multiple of the base alignment; entries within
//! a region are spaced by the aligned handle size.

use super::buffer::{aligned_size, GpuBuffer, HOST_MEMORY};
use super::context::{RtProperties, VulkanContext};
use crate::util::Result;
use ash::vk;

/// Byte layout of a table with one raygen, `miss` miss and `hit` hit groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    /// Spacing of entries within a region.
    pub stride: u32,
    pub raygen_offset: u32,
    pub raygen_size: u32,
    pub miss_offset: u32,
    pub miss_size: u32,
    pub hit_offset: u32,
    pub hit_size: u32,
    pub total_size: u32,
    pub miss_count: u32,
    pub hit_count: u32,
}

impl SbtLayout {
    pub fn new(props: &RtProperties, miss_count: u32, hit_count: u32) -> Self {
        let base = props.shader_group_base_alignment.max(1);
        let stride = aligned_size(props.shader_group_handle_size, props.shader_group_handle_alignment.max(1));
        // Raygen stride must equal its size
        let raygen_size = aligned_size(stride, base);
        let miss_size = aligned_size(stride * miss_count, base);
        let hit_size = aligned_size(stride * hit_count, base);
        Self {
            handle_size: props.shader_group_handle_size,
            stride,
            raygen_offset: 0,
            raygen_size,
            miss_offset: raygen_size,
            miss_size,
            hit_offset: raygen_size + miss_size,
            hit_size,
            total_size: raygen_size + miss_size + hit_size,
            miss_count,
            hit_count,
        }
    }

    pub fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Byte offset of group `group` (pipeline group order).
    pub fn group_offset(&self, group: u32) -> u32 {
        if group == 0 {
            self.raygen_offset
        } else if group <= self.miss_count {
            self.miss_offset + (group - 1) * self.stride
        } else {
            self.hit_offset + (group - 1 - self.miss_count) * self.stride
        }
    }

    /// Scatter tightly packed group handles into table order.
    pub fn pack(&self, handles: &[u8]) -> Vec<u8> {
        let size = self.handle_size as usize;
        let mut table = vec![0u8; self.total_size as usize];
        for (group, handle) in handles.chunks_exact(size).enumerate() {
            let offset = self.group_offset(group as u32) as usize;
            table[offset..offset + size].copy_from_slice(handle);
        }
        table
    }
}

/// Table buffer and the regions passed to `cmd_trace_rays`.
#[derive(Debug)]
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    pub fn new(ctx: &VulkanContext, pipeline: vk::Pipeline, miss_count: u32, hit_count: u32) -> Result<Self> {
        let layout = SbtLayout::new(&ctx.rt_properties, miss_count, hit_count);
        let handles = unsafe {
            ctx.rt.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count(),
                (layout.group_count() * layout.handle_size) as usize,
            )?
        };
        let table = layout.pack(&handles);

        // Over-allocate so the table start can be moved onto the base alignment
        let base = ctx.rt_properties.shader_group_base_alignment.max(1) as u64;
        let buffer = GpuBuffer::new(
            ctx,
            table.len() as u64 + base,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
            "shader binding table",
        )?;
        let start = buffer.address.div_ceil(base) * base;
        buffer.write(start - buffer.address, &table[..])?;

        let region = |offset: u32, stride: u32, size: u32| {
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(start + offset as u64)
                .stride(stride as u64)
                .size(size as u64)
        };
        Ok(Self {
            raygen: region(layout.raygen_offset, layout.raygen_size, layout.raygen_size),
            miss: region(layout.miss_offset, layout.stride, layout.miss_size),
            hit: region(layout.hit_offset, layout.stride, layout.hit_size),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
            buffer,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.buffer.destroy(device);
    }
}
