//! Instance, device and ray tracing extension loaders.

use crate::util::{Error, Result};
use ash::{ext, khr, vk};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Messages kept in the validation log.
const VALIDATION_LOG_LIMIT: usize = 256;

static VALIDATION_LOG: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

/// Take all captured validation messages.
pub fn take_validation_messages() -> Vec<String> {
    std::mem::take(&mut *VALIDATION_LOG.lock())
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() {
        String::new()
    } else {
        (*data)
            .message_as_c_str()
            .map(|m| m.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => tracing::error!(?types, "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => tracing::warn!(?types, "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => tracing::debug!(?types, "{message}"),
        _ => tracing::trace!(?types, "{message}"),
    }
    if severity.intersects(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        let mut log = VALIDATION_LOG.lock();
        if log.len() >= VALIDATION_LOG_LIMIT {
            log.remove(0);
        }
        log.push(message);
    }
    vk::FALSE
}

/// Ray tracing limits the pipeline depends on.
#[derive(Debug, Clone, Copy)]
pub struct RtProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub min_scratch_offset_alignment: u32,
    /// `accelerationStructureIndirectBuild` is available.
    pub indirect_build: bool,
}

/// Everything needed to record and submit ray tracing work.
pub struct VulkanContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub command_pool: vk::CommandPool,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub accel: khr::acceleration_structure::Device,
    pub rt: khr::ray_tracing_pipeline::Device,
    pub rt_properties: RtProperties,
    pub device_name: String,
}

fn required_device_extensions() -> [&'static CStr; 3] {
    [
        khr::acceleration_structure::NAME,
        khr::ray_tracing_pipeline::NAME,
        khr::deferred_host_operations::NAME,
    ]
}

impl VulkanContext {
    /// Open the first device with ray tracing support.
    #[tracing::instrument(skip_all, fields(validation))]
    pub fn new(validation: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let layers_available = unsafe { entry.enumerate_instance_layer_properties()? };
        let has_validation = layers_available
            .iter()
            .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
        let validation = if validation && !has_validation {
            tracing::warn!("validation requested but the Khronos layer is not installed");
            false
        } else {
            validation
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"photon-beam")
            .engine_name(c"photon-beam")
            .api_version(vk::API_VERSION_1_2);
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };
        let extensions: Vec<*const c_char> = if validation {
            vec![ext::debug_utils::NAME.as_ptr()]
        } else {
            vec![]
        };
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let debug = if validation {
            let loader = ext::debug_utils::Instance::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe { loader.create_debug_utils_messenger(&info, None)? };
            Some((loader, messenger))
        } else {
            None
        };

        let (physical_device, queue_family) = match pick_device(&instance) {
            Ok(found) => found,
            Err(e) => {
                unsafe {
                    if let Some((loader, messenger)) = &debug {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut accel_features);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }
        let indirect_build = accel_features.acceleration_structure_indirect_build == vk::TRUE;

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let device_name = {
            let mut props2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut rt_props)
                .push_next(&mut as_props);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
            props2
                .properties
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let rt_properties = RtProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
            indirect_build,
        };

        let mut enabled_accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .acceleration_structure_indirect_build(indirect_build);
        let mut enabled_rt = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut enabled_v12 = vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let mut enabled = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut enabled_accel)
            .push_next(&mut enabled_rt)
            .push_next(&mut enabled_v12);

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];
        let extension_ptrs: Vec<*const c_char> = required_device_extensions().iter().map(|e| e.as_ptr()).collect();
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut enabled);
        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let accel = khr::acceleration_structure::Device::new(&instance, &device);
        let rt = khr::ray_tracing_pipeline::Device::new(&instance, &device);

        tracing::info!(device = %device_name, indirect_build, "ray tracing device opened");
        Ok(Self {
            entry,
            instance,
            debug,
            physical_device,
            device,
            queue,
            queue_family,
            command_pool,
            memory_properties,
            accel,
            rt,
            rt_properties,
            device_name,
        })
    }

    /// Memory type index with `properties` among `type_bits`.
    pub fn memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Record `f` into a one-shot command buffer, submit and wait.
    pub fn one_time_submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc)? }[0];
        let result = (|| -> Result<()> {
            unsafe {
                let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                self.device.begin_command_buffer(cmd, &begin)?;
                f(cmd);
                self.device.end_command_buffer(cmd)?;
                let cmds = [cmd];
                let submit = vk::SubmitInfo::default().command_buffers(&cmds);
                self.device.queue_submit(self.queue, &[submit], vk::Fence::null())?;
                self.device.queue_wait_idle(self.queue)?;
            }
            Ok(())
        })();
        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }

    pub fn align_scratch(&self, address: u64) -> u64 {
        let a = self.rt_properties.min_scratch_offset_alignment.max(1) as u64;
        address.div_ceil(a) * a
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = &self.debug {
                loader.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// First physical device exposing the ray tracing extensions, with a
/// compute-capable queue family.
fn pick_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    let mut missing = None;
    for pd in devices {
        let available = unsafe { instance.enumerate_device_extension_properties(pd)? };
        let lacking = required_device_extensions().into_iter().find(|req| {
            !available
                .iter()
                .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == *req))
        });
        if let Some(ext) = lacking {
            missing = Some(ext.to_string_lossy().into_owned());
            continue;
        }
        let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
        if let Some(family) = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        {
            return Ok((pd, family as u32));
        }
    }
    Err(match missing {
        Some(ext) => Error::MissingExtension(ext),
        None => Error::NoSuitableDevice,
    })
}
