//! Render settings, persisted as JSON.

use crate::accel::{BuildRangeSource, TlasBuildMode};
use crate::beam::CapacityBudget;
use crate::camera::CameraSettings;
use crate::light::LightSettings;
use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which frame pipeline executes the passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Data-parallel CPU reference.
    Host,
    /// Vulkan ray tracing pipeline.
    #[default]
    Vulkan,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" | "cpu" => Ok(Self::Host),
            "vulkan" | "vk" | "gpu" => Ok(Self::Vulkan),
            _ => Err(Error::parameter("backend", format!("unknown backend '{s}'"))),
        }
    }
}

/// Artist-facing medium and emission parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    /// Fog color right next to the light (rgb + alpha).
    pub near_color: [f32; 4],
    /// Fog color one unit away from the light (rgb + alpha).
    pub unit_distance_color: [f32; 4],
    pub intensity: f32,
    pub air_albedo: f32,
    /// Lower clamp of the unit-distance color, as a fraction of the near color.
    pub min_unit_distance_albedo: f32,
    /// Phase function anisotropy in [-1, 1].
    pub hg_asym_factor: f32,
    pub beam_radius: f32,
    pub photon_radius: f32,
    pub num_beam_samples: u32,
    pub num_photon_samples: u32,
    pub use_photon_beam: bool,
    pub use_photon_mapping: bool,
    /// Debug view: surface shading only, no in-scattering.
    pub show_direct_color: bool,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            near_color: [1.0, 1.0, 1.0, 1.0],
            unit_distance_color: [0.816, 0.906, 0.906, 1.0],
            intensity: 15.0,
            air_albedo: 0.06,
            min_unit_distance_albedo: 0.1,
            hg_asym_factor: 0.0,
            beam_radius: 0.6,
            photon_radius: 1.0,
            num_beam_samples: 1024,
            num_photon_samples: 4 * 4 * 2048,
            use_photon_beam: true,
            use_photon_mapping: true,
            show_direct_color: false,
        }
    }
}

impl VolumeParams {
    /// Same inputs to the optical derivation.
    pub fn optically_equal(&self, other: &Self) -> bool {
        self.near_color == other.near_color
            && self.unit_distance_color == other.unit_distance_color
            && self.intensity == other.intensity
            && self.air_albedo == other.air_albedo
            && self.min_unit_distance_albedo == other.min_unit_distance_albedo
    }

    /// Beam samples actually launched this frame.
    pub fn active_beam_samples(&self) -> u32 {
        if self.use_photon_beam {
            self.num_beam_samples
        } else {
            0
        }
    }

    /// Photon samples actually launched this frame.
    pub fn active_photon_samples(&self) -> u32 {
        if self.use_photon_mapping {
            self.num_photon_samples
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.hg_asym_factor) {
            return Err(Error::parameter("hg_asym_factor", "must lie in [-1, 1]"));
        }
        if self.beam_radius <= 0.0 || !self.beam_radius.is_finite() {
            return Err(Error::parameter("beam_radius", "must be positive"));
        }
        if self.photon_radius <= 0.0 || !self.photon_radius.is_finite() {
            return Err(Error::parameter("photon_radius", "must be positive"));
        }
        if !(self.min_unit_distance_albedo > 0.0 && self.min_unit_distance_albedo <= 1.0) {
            return Err(Error::parameter("min_unit_distance_albedo", "must lie in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.air_albedo) {
            return Err(Error::parameter("air_albedo", "must lie in [0, 1]"));
        }
        if self.intensity < 0.0 {
            return Err(Error::parameter("intensity", "must not be negative"));
        }
        let colors = self.near_color.iter().chain(self.unit_distance_color.iter());
        if colors.clone().any(|c| *c < 0.0 || !c.is_finite()) {
            return Err(Error::parameter("near_color", "colors must be finite and non-negative"));
        }
        Ok(())
    }
}

/// Complete renderer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub backend: Backend,
    pub volume: VolumeParams,
    pub capacity: CapacityBudget,
    pub light: LightSettings,
    pub camera: CameraSettings,

    // Emission walk
    pub max_bounces: u32,
    pub max_sub_beams_per_beam: u32,
    /// Photon disc hits count only this close to the visible surface.
    pub photon_surface_epsilon: f32,
    pub background_color: [f32; 3],

    // Procedural build
    pub tlas_build_mode: TlasBuildMode,
    pub build_range: BuildRangeSource,

    // Device
    /// Directory with compiled `.spv` files when they are not embedded.
    pub shader_dir: Option<PathBuf>,
    pub validation: bool,
    /// Read the counter header back after each frame (debug only).
    pub collect_stats: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            backend: Backend::default(),
            volume: VolumeParams::default(),
            capacity: CapacityBudget::default(),
            light: LightSettings::default(),
            camera: CameraSettings::default(),
            max_bounces: 4,
            max_sub_beams_per_beam: 48,
            photon_surface_epsilon: 0.05,
            background_color: [0.0, 0.0, 0.0],
            tlas_build_mode: TlasBuildMode::Rebuild,
            build_range: BuildRangeSource::Auto,
            shader_dir: None,
            validation: cfg!(debug_assertions),
            collect_stats: false,
        }
    }
}

impl RenderSettings {
    /// Per-user settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("photon-beam");
            p.push("settings.json");
            p
        })
    }

    /// Load from `path`, or from the per-user file, or fall back to defaults.
    ///
    /// An explicit path must exist and parse; the per-user file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(p) => Self::read(p)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => Self::read(&p)?,
                None => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| Error::InvalidSettings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::parameter("width", "output size must be non-zero"));
        }
        if self.max_sub_beams_per_beam == 0 {
            return Err(Error::parameter("max_sub_beams_per_beam", "must be at least 1"));
        }
        if self.photon_surface_epsilon <= 0.0 {
            return Err(Error::parameter("photon_surface_epsilon", "must be positive"));
        }
        self.volume.validate()?;
        self.capacity.validate()?;
        self.capacity.check_samples(&self.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut s = RenderSettings::default();
        s.width = 320;
        s.backend = Backend::Host;
        s.volume.hg_asym_factor = 0.4;
        s.volume.use_photon_mapping = false;
        s.save(&path).unwrap();

        let loaded = RenderSettings::load(Some(&path)).unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, r#"{ "width": 64, "volume": { "beam_radius": 0.25 } }"#).unwrap();

        let s = RenderSettings::load(Some(&path)).unwrap();
        assert_eq!(s.width, 64);
        assert_eq!(s.height, RenderSettings::default().height);
        assert_eq!(s.volume.beam_radius, 0.25);
        assert_eq!(s.volume.photon_radius, 1.0);
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ width: ").unwrap();
        let err = RenderSettings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::InvalidSettings { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_anisotropy() {
        let mut s = RenderSettings::default();
        s.volume.hg_asym_factor = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_disabled_modes_launch_nothing() {
        let mut v = VolumeParams::default();
        v.use_photon_beam = false;
        v.use_photon_mapping = false;
        assert_eq!(v.active_beam_samples(), 0);
        assert_eq!(v.active_photon_samples(), 0);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("host".parse::<Backend>().unwrap(), Backend::Host);
        assert_eq!("vulkan".parse::<Backend>().unwrap(), Backend::Vulkan);
        assert!("metal".parse::<Backend>().is_err());
    }
}
