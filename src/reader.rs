//! Slide reader collaborator
//!
//! Format decoding is out of scope: the pipeline consumes any reader that
//! reports dimensions and native resolution and serves pixel regions at the
//! inference resolution. [`MemorySlideReader`] backs plain raster images and
//! the test suite.

use crate::error::{PipelineError, Result};
use crate::types::{SlideMetadata, SlideProperties};
use image::RgbImage;

/// Magnification the pipeline derives its working resolution for
pub const TARGET_MAGNIFICATION: f32 = 40.0;

/// Format-agnostic access to one whole-slide image.
pub trait SlideReader: Send {
    /// Slide dimensions at base (level 0) resolution
    fn dimensions(&self) -> (u32, u32);

    /// Native microns-per-pixel, if the file records it
    fn mpp(&self) -> Option<f32>;

    /// Native objective magnification, if the file records it
    fn magnification(&self) -> Option<f32>;

    /// Prepare the reader for reads at the given target resolution.
    ///
    /// Readers that rescale internally select the matching pyramid level
    /// here. The default accepts any resolution unchanged.
    fn set_resolution(&mut self, _target_mpp: f32) -> Result<()> {
        Ok(())
    }

    /// Read a region in target-resolution pixel space.
    ///
    /// Regions extending past the slide bounds are zero-padded by the
    /// reader; the planner never requests such regions except for slides
    /// smaller than one patch.
    fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage>;
}

/// Resolve a slide's metadata and working resolution.
///
/// Explicit `properties` overrides replace the reader's native values; the
/// target resolution is the 40x-equivalent of the (possibly overridden)
/// native properties. Missing mpp or magnification after overrides is a
/// slide-level error.
pub fn resolve_metadata(
    name: &str,
    reader: &dyn SlideReader,
    properties: &SlideProperties,
) -> Result<SlideMetadata> {
    let mpp = properties.mpp.or_else(|| reader.mpp()).ok_or_else(|| {
        PipelineError::slide(name, "microns-per-pixel neither recorded in the file nor overridden")
    })?;
    let magnification = properties
        .magnification
        .or_else(|| reader.magnification())
        .ok_or_else(|| {
            PipelineError::slide(name, "magnification neither recorded in the file nor overridden")
        })?;
    if mpp <= 0.0 || magnification <= 0.0 {
        return Err(PipelineError::slide(
            name,
            format!(
                "invalid resolution properties (mpp {}, magnification {})",
                mpp, magnification
            ),
        ));
    }

    let target_mpp = mpp * magnification / TARGET_MAGNIFICATION;
    let (base_width, base_height) = reader.dimensions();

    Ok(SlideMetadata {
        name: name.to_string(),
        base_width,
        base_height,
        mpp,
        magnification,
        target_mpp,
    })
}

/// In-memory slide backed by a decoded raster image.
///
/// Serves images that are already at the working resolution; it cannot
/// rescale, so `set_resolution` rejects any other target.
pub struct MemorySlideReader {
    image: RgbImage,
    mpp: f32,
    magnification: f32,
}

impl MemorySlideReader {
    pub fn new(image: RgbImage, mpp: f32, magnification: f32) -> Self {
        Self {
            image,
            mpp,
            magnification,
        }
    }
}

impl SlideReader for MemorySlideReader {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn mpp(&self) -> Option<f32> {
        Some(self.mpp)
    }

    fn magnification(&self) -> Option<f32> {
        Some(self.magnification)
    }

    fn set_resolution(&mut self, target_mpp: f32) -> Result<()> {
        if (target_mpp - self.mpp).abs() > 1e-4 {
            return Err(PipelineError::slide(
                "memory slide",
                format!(
                    "cannot rescale from {} to {} mpp; provide pixels at the target resolution",
                    self.mpp, target_mpp
                ),
            ));
        }
        Ok(())
    }

    fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage> {
        let (slide_w, slide_h) = self.image.dimensions();
        let mut region = RgbImage::new(width, height);

        let copy_w = width.min(slide_w.saturating_sub(x));
        let copy_h = height.min(slide_h.saturating_sub(y));
        for dy in 0..copy_h {
            for dx in 0..copy_w {
                region.put_pixel(dx, dy, *self.image.get_pixel(x + dx, y + dy));
            }
        }
        Ok(region)
    }
}
