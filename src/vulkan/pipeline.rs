//! Descriptor set, pipeline layout and the two ray tracing pipelines.
//!
//! Both pipelines share one descriptor set layout so a single set serves
//! the whole frame:
//!
//! | binding | resource                      |
//! |---------|-------------------------------|
//! | 0       | scene top level               |
//! | 1       | beam/photon top level         |
//! | 2       | frame constants (uniform)     |
//! | 3       | counter header + records      |
//! | 4       | instance descriptors          |
//! | 5       | vertices                      |
//! | 6       | indices                       |
//! | 7       | materials                     |
//! | 8       | mesh infos                    |
//! | 9       | output texels                 |

use super::context::VulkanContext;
use super::sbt::ShaderBindingTable;
use crate::util::{Error, Result};
use ash::vk;
use std::path::{Path, PathBuf};

pub const BINDING_SCENE_TLAS: u32 = 0;
pub const BINDING_BEAM_TLAS: u32 = 1;
pub const BINDING_CONSTANTS: u32 = 2;
pub const BINDING_RECORDS: u32 = 3;
pub const BINDING_INSTANCES: u32 = 4;
pub const BINDING_VERTICES: u32 = 5;
pub const BINDING_INDICES: u32 = 6;
pub const BINDING_MATERIALS: u32 = 7;
pub const BINDING_MESHES: u32 = 8;
pub const BINDING_OUTPUT: u32 = 9;

/// Descriptor type of every binding, in binding order.
pub const BINDINGS: [vk::DescriptorType; 10] = [
    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
];

fn rt_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::ANY_HIT_KHR
        | vk::ShaderStageFlags::INTERSECTION_KHR
}

/// Pool sizes covering one set of [`BINDINGS`].
pub fn pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for ty in BINDINGS {
        match sizes.iter_mut().find(|s| s.ty == ty) {
            Some(s) => s.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: 1,
            }),
        }
    }
    sizes
}

/// Where compiled SPIR-V lives: the configured directory, else the one
/// the build script compiled into.
pub fn shader_dir(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    option_env!("PHOTON_BEAM_SPV_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| Error::ShaderNotFound(PathBuf::from("<no shader directory configured>")))
}

fn load_shader(ctx: &VulkanContext, dir: &Path, name: &str) -> Result<vk::ShaderModule> {
    let path = dir.join(format!("{name}.spv"));
    let bytes = std::fs::read(&path).map_err(|_| Error::ShaderNotFound(path.clone()))?;
    let code = ash::util::read_spv(&mut std::io::Cursor::new(&bytes))?;
    let info = vk::ShaderModuleCreateInfo::default().code(&code);
    let module = unsafe { ctx.device.create_shader_module(&info, None)? };
    tracing::trace!(path = %path.display(), "shader module loaded");
    Ok(module)
}

/// Hit group of a pipeline, by stage index.
#[derive(Debug, Clone, Copy)]
enum HitGroup {
    Triangles { closest_hit: u32 },
    Procedural { intersection: u32, any_hit: u32 },
}

/// Shader file names making up one pipeline.
struct PipelineShaders<'a> {
    raygen: &'a str,
    miss: &'a [&'a str],
    /// `(closest hit)` or `(intersection, any hit)` per hit group.
    hits: &'a [&'a [&'a str]],
}

const EMISSION_SHADERS: PipelineShaders<'static> = PipelineShaders {
    raygen: "emission.rgen",
    miss: &["surface.rmiss"],
    hits: &[&["surface.rchit"]],
};

/// Miss 0 surface, 1 shadow, 2 beam; hit 0 scene triangles, hit 1 proxies.
const RENDER_SHADERS: PipelineShaders<'static> = PipelineShaders {
    raygen: "render.rgen",
    miss: &["surface.rmiss", "shadow.rmiss", "beam.rmiss"],
    hits: &[&["surface.rchit"], &["beam.rint", "beam.rahit"]],
};

/// Ray tracing pipeline and its binding table.
#[derive(Debug)]
pub struct RtPipeline {
    pub pipeline: vk::Pipeline,
    pub sbt: ShaderBindingTable,
}

impl RtPipeline {
    fn new(ctx: &VulkanContext, layout: vk::PipelineLayout, dir: &Path, shaders: &PipelineShaders<'_>) -> Result<Self> {
        let mut names: Vec<(&str, vk::ShaderStageFlags)> = vec![(shaders.raygen, vk::ShaderStageFlags::RAYGEN_KHR)];
        names.extend(shaders.miss.iter().map(|m| (*m, vk::ShaderStageFlags::MISS_KHR)));

        let mut groups = vec![general_group(0)];
        for i in 0..shaders.miss.len() {
            groups.push(general_group(1 + i as u32));
        }
        for hit in shaders.hits {
            let first = names.len() as u32;
            let group = match hit {
                [closest] => {
                    names.push((*closest, vk::ShaderStageFlags::CLOSEST_HIT_KHR));
                    HitGroup::Triangles { closest_hit: first }
                }
                [intersection, any_hit] => {
                    names.push((*intersection, vk::ShaderStageFlags::INTERSECTION_KHR));
                    names.push((*any_hit, vk::ShaderStageFlags::ANY_HIT_KHR));
                    HitGroup::Procedural {
                        intersection: first,
                        any_hit: first + 1,
                    }
                }
                _ => return Err(Error::other("hit group needs one or two shaders")),
            };
            groups.push(hit_group(group));
        }

        let mut modules = Vec::with_capacity(names.len());
        for (name, _) in &names {
            match load_shader(ctx, dir, name) {
                Ok(m) => modules.push(m),
                Err(e) => {
                    destroy_modules(ctx, &modules);
                    return Err(e);
                }
            }
        }
        let stages: Vec<vk::PipelineShaderStageCreateInfo<'_>> = names
            .iter()
            .zip(&modules)
            .map(|((_, stage), module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(*module)
                    .name(c"main")
            })
            .collect();

        let info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout);
        let created = unsafe {
            ctx.rt.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
        };
        destroy_modules(ctx, &modules);
        let pipeline = created.map_err(|(_, e)| Error::Vulkan(e))?[0];

        let sbt = match ShaderBindingTable::new(ctx, pipeline, shaders.miss.len() as u32, shaders.hits.len() as u32) {
            Ok(sbt) => sbt,
            Err(e) => {
                unsafe { ctx.device.destroy_pipeline(pipeline, None) };
                return Err(e);
            }
        };
        tracing::debug!(raygen = shaders.raygen, groups = groups.len(), "ray tracing pipeline created");
        Ok(Self { pipeline, sbt })
    }

    pub fn destroy(&mut self, ctx: &VulkanContext) {
        self.sbt.destroy(&ctx.device);
        unsafe { ctx.device.destroy_pipeline(self.pipeline, None) };
    }
}

fn destroy_modules(ctx: &VulkanContext, modules: &[vk::ShaderModule]) {
    for m in modules {
        unsafe { ctx.device.destroy_shader_module(*m, None) };
    }
}

fn general_group(shader: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(shader)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

fn hit_group(group: HitGroup) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let info = vk::RayTracingShaderGroupCreateInfoKHR::default().general_shader(vk::SHADER_UNUSED_KHR);
    match group {
        HitGroup::Triangles { closest_hit } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .closest_hit_shader(closest_hit)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR),
        HitGroup::Procedural { intersection, any_hit } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(any_hit)
            .intersection_shader(intersection),
    }
}

/// Shared layout objects, the frame descriptor set and both pipelines.
#[derive(Debug)]
pub struct Pipelines {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub emission: RtPipeline,
    pub render: RtPipeline,
}

impl Pipelines {
    #[tracing::instrument(skip_all, fields(dir = %dir.display()))]
    pub fn new(ctx: &VulkanContext, dir: &Path) -> Result<Self> {
        let device = &ctx.device;
        let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = BINDINGS
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(*ty)
                    .descriptor_count(1)
                    .stage_flags(rt_stages())
            })
            .collect();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )?
        };
        let set_layouts = [set_layout];
        let layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
                None,
            )?
        };

        let sizes = pool_sizes();
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .pool_sizes(&sizes)
                    .max_sets(1),
                None,
            )?
        };
        let set = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&set_layouts),
            )?
        }[0];

        let emission = RtPipeline::new(ctx, layout, dir, &EMISSION_SHADERS)?;
        let render = match RtPipeline::new(ctx, layout, dir, &RENDER_SHADERS) {
            Ok(p) => p,
            Err(e) => {
                let mut emission = emission;
                emission.destroy(ctx);
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            set_layout,
            layout,
            pool,
            set,
            emission,
            render,
        })
    }

    /// Point binding `binding` at an acceleration structure.
    pub fn write_accel(&self, device: &ash::Device, binding: u32, accel: vk::AccelerationStructureKHR) {
        let handles = [accel];
        let mut as_info = vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&handles);
        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut as_info);
        // Count is not derived from the chained struct
        write.descriptor_count = 1;
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    /// Point binding `binding` at a whole buffer.
    pub fn write_buffer(&self, device: &ash::Device, binding: u32, info: vk::DescriptorBufferInfo) {
        let infos = [info];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(BINDINGS[binding as usize])
            .buffer_info(&infos);
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    pub fn destroy(&mut self, ctx: &VulkanContext) {
        self.emission.destroy(ctx);
        self.render.destroy(ctx);
        unsafe {
            ctx.device.destroy_descriptor_pool(self.pool, None);
            ctx.device.destroy_pipeline_layout(self.layout, None);
            ctx.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_cover_bindings() {
        let sizes = pool_sizes();
        let total: u32 = sizes.iter().map(|s| s.descriptor_count).sum();
        assert_eq!(total as usize, BINDINGS.len());
        let tlas = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .unwrap();
        assert_eq!(tlas.descriptor_count, 2);
    }

    #[test]
    fn test_binding_table_order() {
        assert_eq!(BINDINGS[BINDING_CONSTANTS as usize], vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(BINDINGS[BINDING_BEAM_TLAS as usize], vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        assert_eq!(BINDING_OUTPUT as usize, BINDINGS.len() - 1);
    }

    #[test]
    fn test_configured_shader_dir_wins() {
        let dir = shader_dir(Some(Path::new("/tmp/spv"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn test_render_pipeline_groups() {
        assert_eq!(RENDER_SHADERS.miss.len(), 3);
        assert_eq!(RENDER_SHADERS.hits.len(), 2);
        assert_eq!(EMISSION_SHADERS.hits.len(), 1);
    }
}
