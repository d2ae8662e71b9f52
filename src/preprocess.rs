//! Tile pre-processing: pixel buffers to model input tensors

use crate::error::{PipelineError, Result};
use image::RgbImage;
use ndarray::{Array4, Axis};

/// Converts RGB tiles into the normalized NCHW tensors the segmentation
/// model expects.
#[derive(Debug, Clone)]
pub struct TensorBuilder {
    input_size: u32,
    /// Mean values for normalization (RGB)
    mean: [f32; 3],
    /// Standard deviation values for normalization (RGB)
    std: [f32; 3],
}

impl TensorBuilder {
    pub fn new(input_size: u32) -> Self {
        Self {
            input_size,
            // ImageNet statistics, matching the pretrained backbones
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    /// Set normalization parameters
    pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Convert one tile to a `1 x 3 x H x W` tensor
    pub fn build(&self, tile: &RgbImage) -> Result<Array4<f32>> {
        let (width, height) = tile.dimensions();
        if width != self.input_size || height != self.input_size {
            return Err(PipelineError::inference(format!(
                "tile size {}x{} does not match model input size {}",
                width, height, self.input_size
            )));
        }

        let size = self.input_size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in tile.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] =
                    (value - self.mean[c]) / self.std[c];
            }
        }

        Ok(tensor)
    }

    /// Stack per-tile tensors into one batch along the first axis
    pub fn stack(tensors: &[Array4<f32>]) -> Result<Array4<f32>> {
        if tensors.is_empty() {
            return Err(PipelineError::inference("empty tensor batch"));
        }
        let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
        ndarray::concatenate(Axis(0), &views)
            .map_err(|e| PipelineError::inference(format!("failed to stack batch: {}", e)))
    }
}
