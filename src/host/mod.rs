//! Host reference backend.
//!
//! Runs the frame schedule on the CPU with `rayon`. Every stage is a full
//! join, so a barrier needs no work here beyond a trace event; what the
//! backend does preserve is the data flow. Emission only appends through
//! the arena counters, and the top level build reads its primitive count
//! back from the arena header.

mod emission;
mod procedural;
mod render;
mod scene;

pub use emission::{emit, emit_sample, ProxyRefs};
pub use procedural::ProceduralTlas;
pub use render::{closest_approach, Approach, RenderPass, Shading, MIN_BEAM_SIN};
pub use scene::{intersect_triangle, SceneTracer, SurfaceHit, SURFACE_OFFSET};

use crate::accel::BuildStats;
use crate::beam::FrameArena;
use crate::frame::{FrameCommand, FrameInputs, FrameOutput, FrameRenderer, FrameSchedule, FrameStats, PassParams};
use crate::optics::OpticsCache;
use crate::output::FrameImage;
use crate::scene::SceneBuffers;
use crate::settings::RenderSettings;
use crate::util::{Error, Result, Vec3};

/// CPU implementation of [`FrameRenderer`].
#[derive(Debug)]
pub struct HostRenderer {
    settings: RenderSettings,
    scene: SceneTracer,
    arena: FrameArena,
    tlas: ProceduralTlas,
    schedule: FrameSchedule,
    optics: OpticsCache,
    image: FrameImage,
}

impl HostRenderer {
    pub fn new(settings: &RenderSettings, scene: &SceneBuffers) -> Result<Self> {
        settings.validate()?;
        let schedule = FrameSchedule::standard();
        schedule.validate()?;

        let arena = FrameArena::new(&settings.capacity);
        tracing::info!(
            max_beams = arena.max_beams(),
            max_sub_beams = arena.max_sub_beams(),
            "host frame arena allocated"
        );
        Ok(Self {
            settings: settings.clone(),
            scene: SceneTracer::new(scene),
            arena,
            tlas: ProceduralTlas::new(settings.tlas_build_mode, settings.build_range),
            schedule,
            optics: OpticsCache::new(),
            image: FrameImage::new(settings.width, settings.height),
        })
    }

    /// Arena of the last frame, for inspection.
    pub fn arena(&self) -> &FrameArena {
        &self.arena
    }

    pub fn tlas(&self) -> &ProceduralTlas {
        &self.tlas
    }

    pub fn scene(&self) -> &SceneTracer {
        &self.scene
    }

    /// Per-pass parameters for `frame`.
    pub fn pass_params(&mut self, frame: &FrameInputs) -> PassParams {
        let optics = self.optics.get(&frame.volume);
        PassParams::new(&self.settings, frame, optics, self.scene.diagonal())
    }

    /// Camera pass set up over the current arena and top level.
    pub fn render_pass<'a>(&'a self, frame: &FrameInputs, params: &'a PassParams) -> RenderPass<'a> {
        RenderPass {
            scene: &self.scene,
            tlas: &self.tlas,
            arena: &self.arena,
            params,
            camera: self.settings.camera.uniforms(self.settings.width, self.settings.height),
            light: frame.light.position,
            background: Vec3::from(self.settings.background_color),
        }
    }
}

impl FrameRenderer for HostRenderer {
    #[tracing::instrument(skip_all, fields(frame = frame.frame_index))]
    fn render_frame(&mut self, frame: &FrameInputs) -> Result<FrameOutput> {
        let params = self.pass_params(frame);
        let mut build: Option<BuildStats> = None;

        for command in self.schedule.commands.clone() {
            match command {
                FrameCommand::ZeroFill(_) => self.arena.reset(),
                FrameCommand::Barrier(b) => {
                    tracing::trace!(src = ?b.src, dst = ?b.dst, regions = ?b.regions, "barrier");
                }
                FrameCommand::Emit => {
                    emit(&self.arena, &self.scene, &params, frame.light.position, ProxyRefs::default());
                    let header = self.arena.header();
                    tracing::debug!(
                        beams = header.beam_count,
                        sub_beams = header.sub_beam_count,
                        "emission finished"
                    );
                    if header.overflowed() {
                        tracing::warn!(
                            dropped_beams = header.dropped_beams,
                            dropped_sub_beams = header.dropped_sub_beams,
                            "beam buffer capacity exceeded, records clamped"
                        );
                    }
                }
                FrameCommand::BuildTopLevel => build = Some(self.tlas.build(&self.arena)),
                FrameCommand::Render => {
                    let mut image = std::mem::replace(&mut self.image, FrameImage::new(0, 0));
                    self.render_pass(frame, &params).run(&mut image);
                    self.image = image;
                }
            }
        }

        let stats = self.settings.collect_stats.then(|| FrameStats {
            header: self.arena.header(),
            build,
        });
        Ok(FrameOutput {
            image: self.image.clone(),
            stats,
        })
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::parameter("width", "output size must be non-zero"));
        }
        self.settings.width = width;
        self.settings.height = height;
        self.image = FrameImage::new(width, height);
        tracing::debug!(width, height, "output image rebuilt");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "host"
    }
}
