//! Error types for the photon beam renderer.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for renderer setup and frame execution.
///
/// Frame-loop conditions that the pipeline handles locally (capacity
/// overflow, degenerate optical parameters) never surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// Settings file could not be parsed
    #[error("Invalid settings in {path}: {reason}")]
    InvalidSettings { path: PathBuf, reason: String },

    /// A parameter is outside its accepted range
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Buffer capacities cannot be represented by the instance encoding
    #[error("Capacity budget rejected: {0}")]
    CapacityBudget(String),

    /// Scene data is inconsistent (dangling indices, missing materials)
    #[error("Invalid scene: {0}")]
    InvalidScene(String),

    /// Frame command list misses a barrier
    #[error("Frame schedule hazard: {0}")]
    Schedule(String),

    /// No physical device exposes the required ray tracing support
    #[error("No suitable ray tracing device found")]
    NoSuitableDevice,

    /// A required device extension is missing
    #[error("Missing device extension: {0}")]
    MissingExtension(String),

    /// Compiled shader binary not found
    #[error("Shader not found: {0}")]
    ShaderNotFound(PathBuf),

    /// Device allocation failed
    #[error("Out of device memory while allocating {0}")]
    OutOfDeviceMemory(&'static str),

    /// Raw Vulkan error
    #[cfg(feature = "vulkan")]
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Vulkan loader could not be opened
    #[cfg(feature = "vulkan")]
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Image encoding failed
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid parameter error.
    pub fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::parameter("beam_radius", "must be positive");
        assert!(e.to_string().contains("beam_radius"));
        assert!(e.to_string().contains("positive"));

        let e = Error::OutOfDeviceMemory("beam records");
        assert!(e.to_string().contains("beam records"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
