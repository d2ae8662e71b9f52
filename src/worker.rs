//! Patch inference worker
//!
//! Owns the per-tile pipeline around the opaque model collaborators:
//! pre-process pixels into the model's tensor layout, post-process the raw
//! maps into discrete instances, and classify each surviving instance.

use crate::config::InferenceConfig;
use crate::error::{PipelineError, Result};
use crate::model::{CellClassifier, SegmentationModel, SegmentationOutput};
use crate::postprocess::{argmax, pool_planes, softmax, Instance, InstanceExtractor};
use crate::preprocess::TensorBuilder;
use crate::types::{RawDetection, UNCLASSIFIED};
use image::RgbImage;
use ndarray::ArrayView1;
use std::sync::Mutex;

/// Per-tile inference worker.
///
/// Stateless apart from its configuration; one instance is shared across the
/// pool's worker threads.
pub struct PatchWorker {
    tensor_builder: TensorBuilder,
    extractor: InstanceExtractor,
    type_confidence_threshold: f32,
}

impl PatchWorker {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            tensor_builder: TensorBuilder::new(config.patch_size),
            extractor: InstanceExtractor::new(config.prob_threshold, config.min_instance_area),
            type_confidence_threshold: config.type_confidence_threshold,
        }
    }

    /// Pre-process tile pixels into a single-item model batch
    pub fn prepare(&self, pixels: &RgbImage) -> Result<ndarray::Array4<f32>> {
        self.tensor_builder.build(pixels)
    }

    /// Turn one model output into detections, classifying each instance
    pub fn detections_from_output(
        &self,
        output: &SegmentationOutput,
        classifier: Option<&Mutex<Box<dyn CellClassifier>>>,
    ) -> Result<Vec<RawDetection>> {
        let instances = self.extractor.extract(&output.foreground);

        let mut detections = Vec::with_capacity(instances.len());
        for instance in instances {
            let (cell_type, type_confidence) = self.classify(&instance, output, classifier)?;
            detections.push(RawDetection {
                contour: instance.contour,
                centroid: instance.centroid,
                bbox: instance.bbox,
                area: instance.area,
                cell_type,
                type_confidence,
            });
        }
        Ok(detections)
    }

    /// Run the full per-tile contract directly against a model.
    ///
    /// The worker pool splits this into `prepare` + executor forward +
    /// `detections_from_output` so forward passes can be batched; this
    /// entry point serves single-threaded use and tests.
    pub fn infer(
        &self,
        pixels: &RgbImage,
        model: &mut dyn SegmentationModel,
        classifier: Option<&Mutex<Box<dyn CellClassifier>>>,
    ) -> Result<Vec<RawDetection>> {
        let tensor = self.prepare(pixels)?;
        let mut outputs = model.forward(&tensor)?;
        let output = outputs
            .pop()
            .ok_or_else(|| PipelineError::inference("model returned an empty batch"))?;
        self.detections_from_output(&output, classifier)
    }

    /// Resolve an instance's class label.
    ///
    /// Preference order: classifier over pooled embeddings, then the model's
    /// own per-pixel class scores, else unclassified. Low-confidence labels
    /// degrade to unclassified rather than guessing.
    fn classify(
        &self,
        instance: &Instance,
        output: &SegmentationOutput,
        classifier: Option<&Mutex<Box<dyn CellClassifier>>>,
    ) -> Result<(u8, f32)> {
        let probs = match (classifier, &output.embeddings) {
            (Some(classifier), Some(embeddings)) => {
                let pooled = pool_planes(embeddings, &instance.pixels);
                let mut classifier = classifier
                    .lock()
                    .map_err(|_| PipelineError::inference("classifier mutex poisoned"))?;
                let logits = classifier.forward(ArrayView1::from(&pooled))?;
                Some((softmax(&logits), false))
            }
            _ => output
                .class_scores
                .as_ref()
                .map(|scores| (softmax(&pool_planes(scores, &instance.pixels)), true)),
        };

        let (probs, has_background_channel) = match probs {
            Some(p) => p,
            None => return Ok((UNCLASSIFIED, 0.0)),
        };

        let best = match argmax(&probs) {
            Some(best) => best,
            None => return Ok((UNCLASSIFIED, 0.0)),
        };
        let confidence = probs[best];

        // classifier logits index i maps to class id i + 1; per-pixel score
        // maps carry background in channel 0
        let cell_type = if has_background_channel {
            best as u8
        } else {
            (best + 1) as u8
        };

        if cell_type == UNCLASSIFIED || confidence < self.type_confidence_threshold {
            Ok((UNCLASSIFIED, confidence))
        } else {
            Ok((cell_type, confidence))
        }
    }
}
