//! Per-frame inputs, outputs and the renderer interface.

mod schedule;

pub use schedule::{Access, Barrier, FrameCommand, FrameSchedule, Region, Regions, Stage};

use crate::accel::BuildStats;
use crate::beam::CounterHeader;
use crate::camera::CameraUniforms;
use crate::light::{animate, frame_seed, LightState};
use crate::optics::{GpuOptics, OpticalState};
use crate::output::FrameImage;
use crate::settings::{RenderSettings, VolumeParams};
use crate::util::Result;
use bytemuck::{Pod, Zeroable};

/// Everything that may change from one frame to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInputs {
    pub frame_index: u32,
    /// Seconds since the first frame; drives light animation.
    pub elapsed: f32,
    /// Random seed of the emission pass.
    pub seed: u32,
    pub light: LightState,
    /// Volume parameters with the animated near color applied.
    pub volume: VolumeParams,
}

impl FrameInputs {
    /// Inputs for frame `frame_index` at `elapsed` seconds.
    pub fn new(settings: &RenderSettings, frame_index: u32, elapsed: f32) -> Self {
        let light = animate(&settings.light, settings.volume.near_color, elapsed);
        let mut volume = settings.volume.clone();
        volume.near_color = light.near_color;
        Self {
            frame_index,
            elapsed,
            seed: frame_seed(frame_index, 0x5eed),
            light,
            volume,
        }
    }
}

/// Diagnostics of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    /// Counter header after emission.
    pub header: CounterHeader,
    /// Top level build statistics, when the backend can report them.
    pub build: Option<BuildStats>,
}

/// Result of one frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub image: FrameImage,
    pub stats: Option<FrameStats>,
}

/// A complete frame pipeline: zero-fill, emission, build, render.
pub trait FrameRenderer {
    /// Run every stage of one frame and hand back the image.
    fn render_frame(&mut self, frame: &FrameInputs) -> Result<FrameOutput>;

    /// Rebuild the output image for a new size.
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Frame constants, std140 layout of `FrameConstants` in `host_device.glsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameConstants {
    pub camera: CameraUniforms,
    pub optics: GpuOptics,
    pub light_position: [f32; 3],
    pub beam_radius: f32,
    pub background: [f32; 3],
    pub max_distance: f32,
    pub hg_asym_factor: f32,
    pub photon_radius: f32,
    pub photon_surface_epsilon: f32,
    pub frame_seed: u32,
    pub num_beam_samples: u32,
    pub num_photon_samples: u32,
    pub max_num_beams: u32,
    pub max_num_sub_beams: u32,
    pub max_bounces: u32,
    pub max_sub_beams_per_beam: u32,
    pub show_direct_color: u32,
    pub _pad: u32,
    pub beam_blas_address: u64,
    pub photon_blas_address: u64,
}

/// Scalar parameters shared by both backends' passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassParams {
    pub optics: OpticalState,
    pub hg_asym_factor: f32,
    pub beam_radius: f32,
    pub photon_radius: f32,
    pub num_beam_samples: u32,
    pub num_photon_samples: u32,
    pub max_bounces: u32,
    pub max_sub_beams_per_beam: u32,
    pub max_distance: f32,
    pub photon_surface_epsilon: f32,
    pub show_direct_color: bool,
    pub seed: u32,
}

impl PassParams {
    pub fn new(settings: &RenderSettings, frame: &FrameInputs, optics: OpticalState, scene_diagonal: f32) -> Self {
        Self {
            optics,
            hg_asym_factor: frame.volume.hg_asym_factor,
            beam_radius: frame.volume.beam_radius,
            photon_radius: frame.volume.photon_radius,
            num_beam_samples: frame.volume.active_beam_samples(),
            num_photon_samples: frame.volume.active_photon_samples(),
            max_bounces: settings.max_bounces,
            max_sub_beams_per_beam: settings.max_sub_beams_per_beam,
            max_distance: (scene_diagonal * 2.0).max(1.0),
            photon_surface_epsilon: settings.photon_surface_epsilon,
            show_direct_color: frame.volume.show_direct_color,
            seed: frame.seed,
        }
    }

    /// Total emission invocations.
    pub fn num_samples(&self) -> u32 {
        self.num_beam_samples + self.num_photon_samples
    }

    #[allow(clippy::too_many_arguments)]
    pub fn to_constants(
        &self,
        camera: CameraUniforms,
        light_position: [f32; 3],
        background: [f32; 3],
        max_num_beams: u32,
        max_num_sub_beams: u32,
        beam_blas_address: u64,
        photon_blas_address: u64,
    ) -> FrameConstants {
        FrameConstants {
            camera,
            optics: self.optics.to_gpu(),
            light_position,
            beam_radius: self.beam_radius,
            background,
            max_distance: self.max_distance,
            hg_asym_factor: self.hg_asym_factor,
            photon_radius: self.photon_radius,
            photon_surface_epsilon: self.photon_surface_epsilon,
            frame_seed: self.seed,
            num_beam_samples: self.num_beam_samples,
            num_photon_samples: self.num_photon_samples,
            max_num_beams,
            max_num_sub_beams,
            max_bounces: self.max_bounces,
            max_sub_beams_per_beam: self.max_sub_beams_per_beam,
            show_direct_color: self.show_direct_color as u32,
            _pad: 0,
            beam_blas_address,
            photon_blas_address,
        }
    }
}
