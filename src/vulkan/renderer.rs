//! Vulkan implementation of [`FrameRenderer`].
//!
//! One command buffer per frame walks the frame schedule: barriers are
//! lowered, the zero-fill becomes `vkCmdFillBuffer`, emission and render
//! are ray dispatches and the top level build reads its primitive count
//! from the counter header on the device. The host never sees the count
//! before the build; it reads the header back afterwards for diagnostics.

use super::accel::{header_readback, FrameTlas, ProxyBlases, SceneAccel, BUILD_INPUT};
use super::barrier::{self, RegionBuffers};
use super::buffer::{GpuBuffer, HOST_MEMORY};
use super::context::VulkanContext;
use super::pipeline::{self, Pipelines};
use crate::beam::{CounterHeader, HEADER_SIZE};
use crate::frame::{FrameCommand, FrameInputs, FrameOutput, FrameRenderer, FrameSchedule, FrameStats, PassParams, Region};
use crate::optics::OpticsCache;
use crate::output::FrameImage;
use crate::scene::SceneBuffers;
use crate::settings::RenderSettings;
use crate::util::{Error, Result, Vec4};
use ash::vk;
use std::mem::size_of;

/// Static scene data the closest-hit shader reads.
#[derive(Debug)]
struct SceneGpu {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    materials: GpuBuffer,
    meshes: GpuBuffer,
}

impl SceneGpu {
    fn new(ctx: &VulkanContext, scene: &SceneBuffers) -> Result<Self> {
        let geometry = BUILD_INPUT | vk::BufferUsageFlags::STORAGE_BUFFER;
        // Indexed by the scene instance's custom index
        let meshes: Vec<crate::scene::PrimMeshInfo> = scene
            .instances
            .iter()
            .map(|inst| scene.meshes[inst.mesh as usize])
            .collect();
        Ok(Self {
            vertices: GpuBuffer::with_data(ctx, &scene.vertices, geometry, "vertices")?,
            indices: GpuBuffer::with_data(ctx, &scene.indices, geometry, "indices")?,
            materials: GpuBuffer::with_data(ctx, &scene.materials, vk::BufferUsageFlags::STORAGE_BUFFER, "materials")?,
            meshes: GpuBuffer::with_data(ctx, &meshes, vk::BufferUsageFlags::STORAGE_BUFFER, "mesh infos")?,
        })
    }

    fn destroy(&mut self, device: &ash::Device) {
        self.vertices.destroy(device);
        self.indices.destroy(device);
        self.materials.destroy(device);
        self.meshes.destroy(device);
    }
}

/// GPU renderer on the ray tracing pipeline extensions.
pub struct VulkanRenderer {
    settings: RenderSettings,
    scene_diagonal: f32,
    schedule: FrameSchedule,
    optics: OpticsCache,
    scene: SceneGpu,
    scene_accel: SceneAccel,
    proxies: ProxyBlases,
    records: GpuBuffer,
    instances: GpuBuffer,
    constants: GpuBuffer,
    output: GpuBuffer,
    readback: GpuBuffer,
    tlas: FrameTlas,
    pipelines: Pipelines,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    ctx: VulkanContext,
}

fn output_size(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * size_of::<Vec4>() as u64
}

impl VulkanRenderer {
    #[tracing::instrument(skip_all, fields(width = settings.width, height = settings.height))]
    pub fn new(settings: &RenderSettings, scene: &SceneBuffers) -> Result<Self> {
        settings.validate()?;
        let schedule = FrameSchedule::standard();
        schedule.validate()?;
        let dir = pipeline::shader_dir(settings.shader_dir.as_deref())?;

        let ctx = VulkanContext::new(settings.validation)?;
        let scene_gpu = SceneGpu::new(&ctx, scene)?;
        let scene_accel = SceneAccel::new(&ctx, scene, &scene_gpu.vertices, &scene_gpu.indices)?;
        let proxies = ProxyBlases::new(&ctx)?;

        let budget = &settings.capacity;
        let sizes = budget.sizes();
        let records = GpuBuffer::new(
            &ctx,
            sizes.record_buffer,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "record buffer",
        )?;
        let instances = GpuBuffer::new(
            &ctx,
            sizes.instance_buffer,
            BUILD_INPUT | vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "instance buffer",
        )?;
        tracing::info!(
            record_bytes = sizes.record_buffer,
            instance_bytes = sizes.instance_buffer,
            max_beams = budget.max_num_beams(),
            max_sub_beams = budget.max_num_sub_beams(),
            "frame buffers allocated"
        );

        let constants = GpuBuffer::new(
            &ctx,
            size_of::<crate::frame::FrameConstants>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            HOST_MEMORY,
            "frame constants",
        )?;
        let output = GpuBuffer::new(
            &ctx,
            output_size(settings.width, settings.height),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            HOST_MEMORY,
            "output texels",
        )?;
        let readback = header_readback(&ctx)?;
        let tlas = FrameTlas::new(
            &ctx,
            budget.max_num_sub_beams(),
            settings.tlas_build_mode,
            settings.build_range,
            instances.address,
        )?;
        let pipelines = Pipelines::new(&ctx, &dir)?;

        let device = &ctx.device;
        pipelines.write_accel(device, pipeline::BINDING_SCENE_TLAS, scene_accel.tlas.handle);
        pipelines.write_accel(device, pipeline::BINDING_BEAM_TLAS, tlas.accel.handle);
        pipelines.write_buffer(device, pipeline::BINDING_CONSTANTS, constants.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_RECORDS, records.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_INSTANCES, instances.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_VERTICES, scene_gpu.vertices.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_INDICES, scene_gpu.indices.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_MATERIALS, scene_gpu.materials.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_MESHES, scene_gpu.meshes.descriptor());
        pipelines.write_buffer(device, pipeline::BINDING_OUTPUT, output.descriptor());

        let cmd = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(ctx.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?
        }[0];
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };

        Ok(Self {
            settings: settings.clone(),
            scene_diagonal: scene.diagonal(),
            schedule,
            optics: OpticsCache::new(),
            scene: scene_gpu,
            scene_accel,
            proxies,
            records,
            instances,
            constants,
            output,
            readback,
            tlas,
            pipelines,
            cmd,
            fence,
            ctx,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.ctx.device_name
    }

    fn region_buffers(&self) -> RegionBuffers {
        RegionBuffers {
            records: self.records.buffer,
            instances: self.instances.buffer,
        }
    }

    fn zero_fill(&self, regions: &[Region]) {
        let device = &self.ctx.device;
        for region in regions {
            let (buffer, offset, size) = match region {
                Region::Counters => (self.records.buffer, 0, HEADER_SIZE),
                Region::Records => (self.records.buffer, HEADER_SIZE, vk::WHOLE_SIZE),
                Region::Instances => (self.instances.buffer, 0, vk::WHOLE_SIZE),
                Region::TopLevel => continue,
            };
            unsafe { device.cmd_fill_buffer(self.cmd, buffer, offset, size, 0) };
        }
    }

    fn trace(&self, pipeline: &pipeline::RtPipeline, width: u32, height: u32) {
        let sbt = &pipeline.sbt;
        unsafe {
            self.ctx
                .device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
            self.ctx
                .rt
                .cmd_trace_rays(self.cmd, &sbt.raygen, &sbt.miss, &sbt.hit, &sbt.callable, width, height, 1);
        }
    }

    /// Record the whole frame. Returns whether the top level was updated in place.
    fn record(&mut self, params: &PassParams) -> Result<bool> {
        let device = &self.ctx.device;
        let cmd = self.cmd;
        let regions = self.region_buffers();
        let mut refit = false;

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipelines.layout,
                0,
                &[self.pipelines.set],
                &[],
            );
        }

        for command in &self.schedule.commands {
            match command {
                FrameCommand::Barrier(b) => barrier::record(device, cmd, &barrier::lower(b, &regions)),
                FrameCommand::ZeroFill(r) => self.zero_fill(r),
                FrameCommand::Emit => {
                    // Zero samples: nothing to dispatch, the barriers still apply
                    if params.num_samples() > 0 {
                        self.trace(&self.pipelines.emission, params.num_samples(), 1);
                    }
                }
                FrameCommand::BuildTopLevel => {
                    refit = self
                        .tlas
                        .record_build(&self.ctx, cmd, self.instances.address, self.records.address);
                }
                FrameCommand::Render => self.trace(&self.pipelines.render, self.settings.width, self.settings.height),
            }
        }

        // Epilogue: header copy for diagnostics, output made visible to the host
        unsafe {
            let header_barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(self.records.buffer)
                .offset(0)
                .size(HEADER_SIZE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                std::slice::from_ref(&header_barrier),
                &[],
            );
            let copy = vk::BufferCopy::default().size(HEADER_SIZE);
            device.cmd_copy_buffer(cmd, self.records.buffer, self.readback.buffer, std::slice::from_ref(&copy));

            let host = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&host),
                &[],
                &[],
            );
            device.end_command_buffer(cmd)?;
        }
        Ok(refit)
    }

    fn submit_and_wait(&self) -> Result<()> {
        let device = &self.ctx.device;
        let cmds = [self.cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        unsafe {
            device.queue_submit(self.ctx.queue, std::slice::from_ref(&submit), self.fence)?;
            device.wait_for_fences(&[self.fence], true, u64::MAX)?;
            device.reset_fences(&[self.fence])?;
        }
        Ok(())
    }
}

impl FrameRenderer for VulkanRenderer {
    #[tracing::instrument(skip_all, fields(frame = frame.frame_index))]
    fn render_frame(&mut self, frame: &FrameInputs) -> Result<FrameOutput> {
        let optics = self.optics.get(&frame.volume);
        let params = PassParams::new(&self.settings, frame, optics, self.scene_diagonal);
        let budget = &self.settings.capacity;
        let constants = params.to_constants(
            self.settings.camera.uniforms(self.settings.width, self.settings.height),
            frame.light.position.to_array(),
            self.settings.background_color,
            budget.max_num_beams(),
            budget.max_num_sub_beams(),
            self.proxies.beam.address,
            self.proxies.photon.address,
        );
        self.constants.write(0, std::slice::from_ref(&constants))?;

        let refit = self.record(&params)?;
        self.submit_and_wait()?;

        let header = self
            .readback
            .read::<CounterHeader>(0, 1)?
            .first()
            .copied()
            .unwrap_or_default();
        tracing::debug!(
            beams = header.beam_count,
            sub_beams = header.sub_beam_count,
            range = ?self.tlas.range_source(),
            refit,
            "frame finished"
        );
        if header.overflowed() {
            tracing::warn!(
                dropped_beams = header.dropped_beams,
                dropped_sub_beams = header.dropped_sub_beams,
                "beam buffer capacity exceeded, records clamped"
            );
        }
        for message in super::context::take_validation_messages() {
            tracing::debug!(%message, "validation message during frame");
        }

        let (width, height) = (self.settings.width, self.settings.height);
        let texels = self.output.read::<Vec4>(0, (width * height) as usize)?;
        let image = FrameImage::from_texels(width, height, &texels)?;
        let stats = self.settings.collect_stats.then_some(FrameStats { header, build: None });
        Ok(FrameOutput { image, stats })
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::parameter("width", "output size must be non-zero"));
        }
        unsafe { self.ctx.device.device_wait_idle()? };
        let output = GpuBuffer::new(
            &self.ctx,
            output_size(width, height),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            HOST_MEMORY,
            "output texels",
        )?;
        let mut old = std::mem::replace(&mut self.output, output);
        old.destroy(&self.ctx.device);
        self.pipelines
            .write_buffer(&self.ctx.device, pipeline::BINDING_OUTPUT, self.output.descriptor());
        self.settings.width = width;
        self.settings.height = height;
        tracing::debug!(width, height, "output buffer rebuilt");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "vulkan"
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        let ctx = &self.ctx;
        unsafe {
            let _ = ctx.device.device_wait_idle();
            ctx.device.destroy_fence(self.fence, None);
            ctx.device.free_command_buffers(ctx.command_pool, &[self.cmd]);
        }
        self.pipelines.destroy(ctx);
        self.tlas.destroy(ctx);
        self.readback.destroy(&ctx.device);
        self.output.destroy(&ctx.device);
        self.constants.destroy(&ctx.device);
        self.instances.destroy(&ctx.device);
        self.records.destroy(&ctx.device);
        self.proxies.destroy(ctx);
        self.scene_accel.destroy(ctx);
        self.scene.destroy(&ctx.device);
    }
}
