//! Vulkan ray tracing backend.
//!
//! Built on `ash` with `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`. The shaders live in `shaders/` and are
//! compiled to SPIR-V by the build script when `glslangValidator` is on
//! the path; otherwise point `shader_dir` in the settings at a directory
//! of prebuilt `.spv` files.

mod accel;
mod barrier;
mod buffer;
mod context;
mod pipeline;
mod renderer;
mod sbt;

pub use accel::{frame_tlas_flags, resolve_range_source};
pub use barrier::{dst_scope, lower, src_scope, LoweredBarrier, RegionBuffers};
pub use context::{take_validation_messages, VulkanContext};
pub use pipeline::shader_dir;
pub use renderer::VulkanRenderer;
pub use sbt::SbtLayout;
