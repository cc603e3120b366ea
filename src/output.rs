//! Presentation hand-off: the linear frame image.

use crate::util::{Error, Result, Vec3, Vec4};
use image::{DynamicImage, ImageBuffer, Rgb, Rgba};
use std::path::Path;

/// Linear RGBA32F image, row 0 at the top.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
}

impl FrameImage {
    /// Black, fully opaque image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0.0, 0.0, 0.0, 1.0]; (width as usize) * (height as usize)],
        }
    }

    /// Wrap texels read back from a device buffer.
    pub fn from_texels(width: u32, height: u32, texels: &[Vec4]) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if texels.len() != expected {
            return Err(Error::other(format!(
                "image readback has {} texels, expected {expected}",
                texels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels: texels.iter().map(|t| t.to_array()).collect(),
        })
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Vec4 {
        Vec4::from(self.pixels[(y * self.width + x) as usize])
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, rgb: Vec3) {
        self.pixels[(y * self.width + x) as usize] = rgb.extend(1.0).to_array();
    }

    /// Mean RGB over all pixels.
    pub fn mean(&self) -> Vec3 {
        if self.pixels.is_empty() {
            return Vec3::ZERO;
        }
        let sum = self
            .pixels
            .iter()
            .fold(Vec3::ZERO, |acc, p| acc + Vec3::new(p[0], p[1], p[2]));
        sum / self.pixels.len() as f32
    }

    /// Write `.hdr` (Radiance RGBE) or `.exr`, picked by extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let image = match ext.as_str() {
            "hdr" => {
                let rgb: Vec<f32> = self.pixels.iter().flat_map(|p| [p[0], p[1], p[2]]).collect();
                let buf = ImageBuffer::<Rgb<f32>, _>::from_raw(self.width, self.height, rgb)
                    .ok_or_else(|| Error::other("image buffer size mismatch"))?;
                DynamicImage::ImageRgb32F(buf)
            }
            "exr" => {
                let rgba: Vec<f32> = self.pixels.iter().flatten().copied().collect();
                let buf = ImageBuffer::<Rgba<f32>, _>::from_raw(self.width, self.height, rgba)
                    .ok_or_else(|| Error::other("image buffer size mismatch"))?;
                DynamicImage::ImageRgba32F(buf)
            }
            _ => {
                return Err(Error::parameter(
                    "output",
                    format!("unsupported extension '{ext}', use .hdr or .exr"),
                ))
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        image.save(path)?;
        tracing::info!(path = %path.display(), width = self.width, height = self.height, "image written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_black() {
        let img = FrameImage::new(4, 3);
        assert_eq!(img.pixels.len(), 12);
        assert_eq!(img.mean(), Vec3::ZERO);
        assert_eq!(img.get(3, 2).w, 1.0);
    }

    #[test]
    fn test_from_texels_checks_size() {
        assert!(FrameImage::from_texels(2, 2, &[Vec4::ONE; 3]).is_err());
        let img = FrameImage::from_texels(2, 2, &[Vec4::new(0.5, 0.5, 0.5, 1.0); 4]).unwrap();
        assert_eq!(img.mean(), Vec3::splat(0.5));
    }

    #[test]
    fn test_save_hdr_and_exr() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = FrameImage::new(8, 4);
        img.set(1, 1, Vec3::new(2.0, 0.5, 0.25));
        for name in ["a.hdr", "b.exr"] {
            let path = dir.path().join(name);
            img.save(&path).unwrap();
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
        }
        assert!(img.save(&dir.path().join("c.png")).is_err());
    }
}
