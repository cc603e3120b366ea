//! Fixed look-at camera and its ray tracing uniforms.

use crate::util::{Mat4, Ray, Vec2, Vec3, Vec4};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Camera pose; the pipeline does not animate it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub eye: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
    /// Vertical FOV in degrees
    pub fov_y: f32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        // Looks into the built-in Cornell box through its open side
        Self {
            eye: [0.0, 5.0, 21.0],
            target: [0.0, 5.0, 0.0],
            up: [0.0, 1.0, 0.0],
            fov_y: 40.0,
        }
    }
}

/// Camera uniform matching `CameraUniforms` in `host_device.glsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniforms {
    /// Inverse view matrix (world from view).
    pub view_inverse: Mat4,
    /// Inverse projection matrix (view from clip).
    pub proj_inverse: Mat4,
}

impl CameraSettings {
    pub fn eye(&self) -> Vec3 {
        Vec3::from(self.eye)
    }

    /// Inverse matrices for an output of `width` x `height`.
    pub fn uniforms(&self, width: u32, height: u32) -> CameraUniforms {
        let view = Mat4::look_at_rh(self.eye(), Vec3::from(self.target), Vec3::from(self.up));
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(self.fov_y.to_radians(), aspect, 0.01, 1000.0);
        // Vulkan clip space has y pointing down
        proj.y_axis.y *= -1.0;
        CameraUniforms {
            view_inverse: view.inverse(),
            proj_inverse: proj.inverse(),
        }
    }
}

impl CameraUniforms {
    /// Primary ray through the center of pixel `(x, y)`, row 0 at the top.
    ///
    /// Same construction as `render.rgen`.
    pub fn primary_ray(&self, x: u32, y: u32, width: u32, height: u32) -> Ray {
        let pixel_center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
        let d = pixel_center / Vec2::new(width as f32, height as f32) * 2.0 - Vec2::ONE;

        let origin = self.view_inverse * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let target = self.proj_inverse * Vec4::new(d.x, d.y, 1.0, 1.0);
        let dir = self.view_inverse * target.truncate().normalize().extend(0.0);
        Ray::new(origin.truncate(), dir.truncate().normalize())
    }
}
