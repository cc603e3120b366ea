//! # photon-beam
//!
//! Photon beams and photon mapping for homogeneous participating media on
//! a two-pass ray tracing pipeline.
//!
//! Each frame runs the same schedule: the record buffer counters are
//! zeroed, an emission pass traces light paths and appends beam and photon
//! records (with one acceleration structure instance per sub-beam), a top
//! level acceleration structure is built over those instances using the
//! instance count the emission pass wrote, and a render pass traces camera
//! rays through both the scene and the beam top level.
//!
//! ## Modules
//!
//! - [`beam`] - Record/instance layouts, capacity budget, frame arena
//! - [`frame`] - Frame inputs/outputs, schedule and the [`FrameRenderer`] trait
//! - [`optics`] - Coefficients derived from artist color parameters
//! - [`host`] - Data-parallel CPU backend
//! - [`vulkan`] - `VK_KHR_ray_tracing_pipeline` backend (feature `vulkan`)
//!
//! ## Example
//!
//! ```ignore
//! use photon_beam::{create_renderer, scene::cornell_box, FrameInputs, RenderSettings};
//!
//! let settings = RenderSettings::load(None)?;
//! let mut renderer = create_renderer(&settings, &cornell_box()?)?;
//! let out = renderer.render_frame(&FrameInputs::new(&settings, 0, 0.0))?;
//! out.image.save("frame.hdr".as_ref())?;
//! ```

pub mod util;
pub mod optics;
pub mod sampling;
pub mod settings;
pub mod camera;
pub mod light;
pub mod beam;
pub mod accel;
pub mod scene;
pub mod frame;
pub mod output;
pub mod host;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use frame::{FrameInputs, FrameOutput, FrameRenderer, FrameStats};
pub use output::FrameImage;
pub use settings::{Backend, RenderSettings, VolumeParams};
pub use util::{Error, Result};

use scene::SceneBuffers;

/// Create the renderer selected by `settings.backend`.
pub fn create_renderer(settings: &RenderSettings, scene: &SceneBuffers) -> Result<Box<dyn FrameRenderer>> {
    match settings.backend {
        Backend::Host => Ok(Box::new(host::HostRenderer::new(settings, scene)?)),
        #[cfg(feature = "vulkan")]
        Backend::Vulkan => {
            let renderer = vulkan::VulkanRenderer::new(settings, scene)?;
            tracing::info!(device = renderer.device_name(), "vulkan renderer ready");
            Ok(Box::new(renderer))
        }
        #[cfg(not(feature = "vulkan"))]
        Backend::Vulkan => Err(Error::parameter("backend", "built without the `vulkan` feature")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_host_renderer() {
        let mut settings = RenderSettings::default();
        settings.backend = Backend::Host;
        settings.width = 8;
        settings.height = 8;
        settings.volume.num_beam_samples = 16;
        settings.volume.num_photon_samples = 16;
        settings.capacity = beam::CapacityBudget::with_samples(16, 16);
        let renderer = create_renderer(&settings, &scene::cornell_box().unwrap()).unwrap();
        assert_eq!(renderer.name(), "host");
    }
}
