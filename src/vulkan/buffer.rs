//! Device buffers with optional persistent host mapping.

use super::context::VulkanContext;
use crate::util::{Error, Result};
use ash::vk;
use bytemuck::Pod;

/// Buffer, its memory and device address.
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Zero unless created with `SHADER_DEVICE_ADDRESS`.
    pub address: vk::DeviceAddress,
    mapped: Option<*mut u8>,
    label: &'static str,
}

/// Host-visible, coherent memory for uploads and readback.
pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

impl GpuBuffer {
    pub fn new(
        ctx: &VulkanContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        label: &'static str,
    ) -> Result<Self> {
        let device = &ctx.device;
        let info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None)? };

        let req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let Some(memory_type) = ctx.memory_type(req.memory_type_bits, properties) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(Error::OutOfDeviceMemory(label));
        };

        let mut flags_info = vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(memory_type);
        let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        if device_address {
            alloc = alloc.push_next(&mut flags_info);
        }
        let memory = match unsafe { device.allocate_memory(&alloc, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(match e {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        Error::OutOfDeviceMemory(label)
                    }
                    other => Error::Vulkan(other),
                });
            }
        };
        unsafe { device.bind_buffer_memory(buffer, memory, 0)? };

        let mapped = if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let ptr = unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())? };
            Some(ptr.cast::<u8>())
        } else {
            None
        };

        let address = if device_address {
            unsafe { device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer)) }
        } else {
            0
        };

        tracing::trace!(label, size, "buffer allocated");
        Ok(Self {
            buffer,
            memory,
            size,
            address,
            mapped,
            label,
        })
    }

    /// Host-visible buffer filled with `data`.
    pub fn with_data<T: Pod>(
        ctx: &VulkanContext,
        data: &[T],
        usage: vk::BufferUsageFlags,
        label: &'static str,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(ctx, bytes.len() as u64, usage, HOST_MEMORY, label)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Copy `data` into the mapped memory at byte `offset`.
    pub fn write<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let ptr = self.mapped_range(offset, bytes.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    /// Read `count` elements starting at byte `offset`.
    pub fn read<T: Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let len = (count * std::mem::size_of::<T>()) as u64;
        let ptr = self.mapped_range(offset, len)?;
        let mut out = vec![T::zeroed(); count];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        unsafe { std::ptr::copy_nonoverlapping(ptr.cast_const(), dst.as_mut_ptr(), dst.len()) };
        Ok(out)
    }

    fn mapped_range(&self, offset: u64, len: u64) -> Result<*mut u8> {
        let base = self
            .mapped
            .ok_or_else(|| Error::other(format!("buffer '{}' is not host visible", self.label)))?;
        if offset + len > self.size {
            return Err(Error::other(format!(
                "access of {len} bytes at {offset} overruns buffer '{}' ({} bytes)",
                self.label, self.size
            )));
        }
        Ok(unsafe { base.add(offset as usize) })
    }

    /// Descriptor covering the whole buffer.
    pub fn descriptor(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.mapped.take().is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub fn aligned_size(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(32, 64), 64);
        assert_eq!(aligned_size(64, 64), 64);
        assert_eq!(aligned_size(65, 32), 96);
    }

    #[test]
    fn test_host_memory_flags() {
        assert!(HOST_MEMORY.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert!(HOST_MEMORY.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }
}
