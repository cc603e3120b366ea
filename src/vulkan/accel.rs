//! Acceleration structures: proxy boxes, scene meshes and the per-frame
//! beam/photon top level.

use super::buffer::{GpuBuffer, HOST_MEMORY};
use super::context::VulkanContext;
use crate::accel::{BuildRangeSource, TlasBuildMode};
use crate::beam::{InstanceDescriptor, BEAM_PROXY, PHOTON_PROXY};
use crate::scene::{SceneBuffers, Vertex};
use crate::util::{BBox3f, Error, Result};
use ash::vk;
use std::mem::size_of;

/// Usage of buffers read by acceleration structure builds.
pub const BUILD_INPUT: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// One acceleration structure and its backing storage.
#[derive(Debug)]
pub struct AccelStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    storage: GpuBuffer,
}

impl AccelStructure {
    fn new(ctx: &VulkanContext, ty: vk::AccelerationStructureTypeKHR, size: u64, label: &'static str) -> Result<Self> {
        let storage = GpuBuffer::new(
            ctx,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            label,
        )?;
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .ty(ty)
            .buffer(storage.buffer)
            .size(size);
        let handle = unsafe { ctx.accel.create_acceleration_structure(&info, None)? };
        let address = unsafe {
            ctx.accel.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle),
            )
        };
        Ok(Self {
            handle,
            address,
            storage,
        })
    }

    pub fn destroy(&mut self, ctx: &VulkanContext) {
        unsafe { ctx.accel.destroy_acceleration_structure(self.handle, None) };
        self.storage.destroy(&ctx.device);
    }
}

/// Build sizes for `geometry` with `max_primitives`.
fn build_sizes(
    ctx: &VulkanContext,
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
    max_primitives: &[u32],
) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
    let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries);
    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        ctx.accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &info,
            max_primitives,
            &mut sizes,
        )
    };
    sizes
}

/// Scratch buffer large enough for `size` after alignment.
fn scratch_buffer(ctx: &VulkanContext, size: u64, label: &'static str) -> Result<GpuBuffer> {
    let pad = ctx.rt_properties.min_scratch_offset_alignment as u64;
    GpuBuffer::new(
        ctx,
        size + pad,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        label,
    )
}

/// Build a single-geometry structure synchronously.
fn build_now(
    ctx: &VulkanContext,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: vk::AccelerationStructureGeometryKHR<'_>,
    range: vk::AccelerationStructureBuildRangeInfoKHR,
    label: &'static str,
) -> Result<AccelStructure> {
    let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    let geometries = [geometry];
    let sizes = build_sizes(ctx, ty, flags, &geometries, &[range.primitive_count]);
    let accel = AccelStructure::new(ctx, ty, sizes.acceleration_structure_size, label)?;
    let mut scratch = scratch_buffer(ctx, sizes.build_scratch_size, "build scratch")?;

    let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .dst_acceleration_structure(accel.handle)
        .geometries(&geometries)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: ctx.align_scratch(scratch.address),
        });
    let result = ctx.one_time_submit(|cmd| unsafe {
        ctx.accel
            .cmd_build_acceleration_structures(cmd, std::slice::from_ref(&info), &[std::slice::from_ref(&range)]);
    });
    scratch.destroy(&ctx.device);
    result?;
    tracing::debug!(label, size = sizes.acceleration_structure_size, "acceleration structure built");
    Ok(accel)
}

fn aabb_of(b: &BBox3f) -> [f32; 6] {
    [b.min.x, b.min.y, b.min.z, b.max.x, b.max.y, b.max.z]
}

/// Not opaque so any-hit sees every overlap. Any-hit adds each kernel into
/// the payload, so it may run only once per sub-beam or photon.
pub const PROXY_GEOMETRY_FLAGS: vk::GeometryFlagsKHR = vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;

/// Bottom level with one procedural box.
pub fn build_proxy_blas(ctx: &VulkanContext, proxy: &BBox3f, label: &'static str) -> Result<AccelStructure> {
    let mut aabbs = GpuBuffer::with_data(ctx, &aabb_of(proxy)[..], BUILD_INPUT, "proxy aabb")?;
    let geometry = vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::AABBS)
        .flags(PROXY_GEOMETRY_FLAGS)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: aabbs.address,
                })
                .stride(size_of::<[f32; 6]>() as u64),
        });
    let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(1);
    let built = build_now(ctx, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, geometry, range, label);
    aabbs.destroy(&ctx.device);
    built
}

/// Beam and photon proxy bottom levels.
#[derive(Debug)]
pub struct ProxyBlases {
    pub beam: AccelStructure,
    pub photon: AccelStructure,
}

impl ProxyBlases {
    pub fn new(ctx: &VulkanContext) -> Result<Self> {
        Ok(Self {
            beam: build_proxy_blas(ctx, &BEAM_PROXY, "beam proxy blas")?,
            photon: build_proxy_blas(ctx, &PHOTON_PROXY, "photon proxy blas")?,
        })
    }

    pub fn destroy(&mut self, ctx: &VulkanContext) {
        self.beam.destroy(ctx);
        self.photon.destroy(ctx);
    }
}

/// Static scene: one bottom level per mesh plus the scene top level.
#[derive(Debug)]
pub struct SceneAccel {
    pub blases: Vec<AccelStructure>,
    pub tlas: AccelStructure,
}

impl SceneAccel {
    /// Build over already uploaded vertex and index buffers.
    #[tracing::instrument(skip_all, fields(meshes = scene.meshes.len(), instances = scene.instances.len()))]
    pub fn new(ctx: &VulkanContext, scene: &SceneBuffers, vertices: &GpuBuffer, indices: &GpuBuffer) -> Result<Self> {
        let mut blases = Vec::with_capacity(scene.meshes.len());
        for mesh in &scene.meshes {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertices.address,
                })
                .vertex_stride(size_of::<Vertex>() as u64)
                .max_vertex(scene.vertices.len().saturating_sub(1) as u32)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: indices.address,
                });
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });
            let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(mesh.triangle_count())
                .primitive_offset(mesh.index_offset * size_of::<u32>() as u32)
                .first_vertex(mesh.vertex_offset);
            blases.push(build_now(ctx, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, geometry, range, "mesh blas")?);
        }

        let instances: Vec<InstanceDescriptor> = scene
            .instances
            .iter()
            .enumerate()
            .map(|(i, inst)| InstanceDescriptor::scene(&inst.transform, i as u32, blases[inst.mesh as usize].address))
            .collect();
        let mut instance_buffer = GpuBuffer::with_data(ctx, &instances, BUILD_INPUT, "scene instances")?;
        let tlas = build_now(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            instance_geometry(instance_buffer.address),
            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instances.len() as u32),
            "scene tlas",
        );
        instance_buffer.destroy(&ctx.device);
        Ok(Self { blases, tlas: tlas? })
    }

    pub fn destroy(&mut self, ctx: &VulkanContext) {
        self.tlas.destroy(ctx);
        for blas in &mut self.blases {
            blas.destroy(ctx);
        }
    }
}

fn instance_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: address }),
        })
}

/// Resolve `Auto` against device support.
pub fn resolve_range_source(requested: BuildRangeSource, indirect_supported: bool) -> Result<BuildRangeSource> {
    match (requested, indirect_supported) {
        (BuildRangeSource::Auto, true) => Ok(BuildRangeSource::DeviceIndirect),
        (BuildRangeSource::Auto, false) => Ok(BuildRangeSource::CapacityPadded),
        (BuildRangeSource::DeviceIndirect, false) => Err(Error::parameter(
            "build_range",
            "device does not support accelerationStructureIndirectBuild",
        )),
        (other, _) => Ok(other),
    }
}

/// Build flags of the per-frame top level.
///
/// In-place updates need an identical primitive count, which only the
/// capacity-padded range guarantees.
pub fn frame_tlas_flags(mode: TlasBuildMode, range: BuildRangeSource) -> vk::BuildAccelerationStructureFlagsKHR {
    if mode == TlasBuildMode::Update && range == BuildRangeSource::CapacityPadded {
        vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
    } else {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
    }
}

/// Per-frame top level over the beam/photon instance buffer.
///
/// Sized once for the instance capacity. The build is recorded into the
/// frame command buffer; its primitive count comes from the counter
/// header (indirect) or is the whole capacity (padded).
#[derive(Debug)]
pub struct FrameTlas {
    pub accel: AccelStructure,
    scratch: GpuBuffer,
    range: BuildRangeSource,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    max_instances: u32,
    built: bool,
}

impl FrameTlas {
    pub fn new(
        ctx: &VulkanContext,
        max_instances: u32,
        mode: TlasBuildMode,
        requested: BuildRangeSource,
        instance_address: vk::DeviceAddress,
    ) -> Result<Self> {
        let range = resolve_range_source(requested, ctx.rt_properties.indirect_build)?;
        let flags = frame_tlas_flags(mode, range);
        let geometries = [instance_geometry(instance_address)];
        let sizes = build_sizes(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            flags,
            &geometries,
            &[max_instances],
        );
        let accel = AccelStructure::new(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
            "beam tlas",
        )?;
        let scratch = scratch_buffer(
            ctx,
            sizes.build_scratch_size.max(sizes.update_scratch_size),
            "beam tlas scratch",
        )?;
        tracing::info!(
            ?range,
            ?mode,
            max_instances,
            size = sizes.acceleration_structure_size,
            "beam top level allocated"
        );
        Ok(Self {
            accel,
            scratch,
            range,
            flags,
            max_instances,
            built: false,
        })
    }

    pub fn range_source(&self) -> BuildRangeSource {
        self.range
    }

    /// Record this frame's build. Returns true when recorded as an update.
    pub fn record_build(
        &mut self,
        ctx: &VulkanContext,
        cmd: vk::CommandBuffer,
        instance_address: vk::DeviceAddress,
        header_address: vk::DeviceAddress,
    ) -> bool {
        let update = self.built && self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);
        let geometries = [instance_geometry(instance_address)];
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.flags)
            .dst_acceleration_structure(self.accel.handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: ctx.align_scratch(self.scratch.address),
            });
        info = if update {
            info.mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(self.accel.handle)
        } else {
            info.mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        };

        unsafe {
            match self.range {
                BuildRangeSource::DeviceIndirect => {
                    // The header's first 16 bytes are the build range
                    let stride = size_of::<vk::AccelerationStructureBuildRangeInfoKHR>() as u32;
                    let max_counts = [self.max_instances];
                    ctx.accel.cmd_build_acceleration_structures_indirect(
                        cmd,
                        std::slice::from_ref(&info),
                        &[header_address],
                        &[stride],
                        &[&max_counts[..]],
                    );
                }
                _ => {
                    let range =
                        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.max_instances);
                    ctx.accel
                        .cmd_build_acceleration_structures(cmd, std::slice::from_ref(&info), &[std::slice::from_ref(&range)]);
                }
            }
        }
        self.built = true;
        update
    }

    pub fn destroy(&mut self, ctx: &VulkanContext) {
        self.accel.destroy(ctx);
        self.scratch.destroy(&ctx.device);
    }
}

/// Host-visible readback buffer for the counter header.
pub fn header_readback(ctx: &VulkanContext) -> Result<GpuBuffer> {
    GpuBuffer::new(
        ctx,
        crate::beam::HEADER_SIZE,
        vk::BufferUsageFlags::TRANSFER_DST,
        HOST_MEMORY,
        "header readback",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_source_resolution() {
        assert_eq!(
            resolve_range_source(BuildRangeSource::Auto, true).unwrap(),
            BuildRangeSource::DeviceIndirect
        );
        assert_eq!(
            resolve_range_source(BuildRangeSource::Auto, false).unwrap(),
            BuildRangeSource::CapacityPadded
        );
        assert!(resolve_range_source(BuildRangeSource::DeviceIndirect, false).is_err());
        assert_eq!(
            resolve_range_source(BuildRangeSource::CapacityPadded, true).unwrap(),
            BuildRangeSource::CapacityPadded
        );
    }

    #[test]
    fn test_update_only_with_padded_range() {
        let allow = vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        assert!(frame_tlas_flags(TlasBuildMode::Update, BuildRangeSource::CapacityPadded).contains(allow));
        assert!(!frame_tlas_flags(TlasBuildMode::Update, BuildRangeSource::DeviceIndirect).contains(allow));
        assert!(!frame_tlas_flags(TlasBuildMode::Rebuild, BuildRangeSource::CapacityPadded).contains(allow));
    }

    #[test]
    fn test_proxy_any_hit_runs_once_per_primitive() {
        assert!(PROXY_GEOMETRY_FLAGS.contains(vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION));
        assert!(!PROXY_GEOMETRY_FLAGS.contains(vk::GeometryFlagsKHR::OPAQUE));
    }

    #[test]
    fn test_build_range_stride_matches_header_prefix() {
        assert_eq!(size_of::<vk::AccelerationStructureBuildRangeInfoKHR>(), 16);
    }
}
