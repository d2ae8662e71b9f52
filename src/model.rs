//! Model collaborator traits
//!
//! The segmentation network and the optional linear classifier are opaque
//! collaborators: normalized image tensors go in, per-pixel maps or logits
//! come out. Loading weights and the network architectures themselves live
//! behind these traits.

use crate::error::Result;
use ndarray::{Array2, Array3, Array4, ArrayView1};

/// Raw per-patch output of the segmentation model.
pub struct SegmentationOutput {
    /// Per-pixel nucleus probability in [0, 1], shape H x W
    pub foreground: Array2<f32>,
    /// Optional per-pixel class scores, shape C x H x W. Channel 0 is
    /// background; channel i > 0 maps to taxonomy class id i.
    pub class_scores: Option<Array3<f32>>,
    /// Optional embedding planes for the classifier head, shape D x H x W
    pub embeddings: Option<Array3<f32>>,
}

/// Common interface for segmentation backbones
///
/// Implementations must accept NCHW batches of the advertised input size and
/// return exactly one output per batch item.
pub trait SegmentationModel: Send {
    /// Run a forward pass over a batch of normalized image tensors
    fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<SegmentationOutput>>;

    /// Model name (for logging/diagnostics)
    fn name(&self) -> &str;

    /// Square input size expected by the model, in pixels
    fn input_size(&self) -> u32;

    /// Release accelerator state held by the model.
    ///
    /// Called between slides in dataset runs so device memory does not
    /// accumulate across hundreds of slides. Default is a no-op for models
    /// without device state.
    fn release(&mut self) {}
}

/// Linear classifier head mapping pooled instance embeddings to class logits
pub trait CellClassifier: Send {
    /// Logits over the taxonomy's typed classes; index i maps to class id
    /// i + 1 (id 0 is reserved for unclassified).
    fn forward(&mut self, embedding: ArrayView1<'_, f32>) -> Result<Vec<f32>>;

    /// Number of typed classes the head was trained for
    fn num_classes(&self) -> usize;
}

/// Supported segmentation backbones.
///
/// A closed set resolved once at pipeline construction; the concrete
/// [`SegmentationModel`] instance is produced by the caller's model loader
/// and validated against this kind's input contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SegmentationModelKind {
    /// ViT backbone pretrained with HIPT
    Hipt,
    /// ViT backbone from Segment Anything
    Sam,
}

impl SegmentationModelKind {
    /// Patch size the backbone was trained on
    pub fn input_size(&self) -> u32 {
        match self {
            Self::Hipt => 1024,
            Self::Sam => 1024,
        }
    }

    /// Resolution the backbone expects, in microns per pixel
    pub fn inference_mpp(&self) -> f32 {
        0.25
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hipt => "HIPT",
            Self::Sam => "SAM",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hipt" => Some(Self::Hipt),
            "sam" => Some(Self::Sam),
            _ => None,
        }
    }
}

impl Default for SegmentationModelKind {
    fn default() -> Self {
        Self::Hipt
    }
}

impl std::fmt::Display for SegmentationModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_parsing() {
        assert_eq!(
            SegmentationModelKind::from_str("hipt"),
            Some(SegmentationModelKind::Hipt)
        );
        assert_eq!(
            SegmentationModelKind::from_str("SAM"),
            Some(SegmentationModelKind::Sam)
        );
        assert_eq!(SegmentationModelKind::from_str("resnet"), None);
        assert_eq!(SegmentationModelKind::Hipt.input_size(), 1024);
    }
}
