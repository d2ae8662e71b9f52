//! Pipeline configuration
//!
//! All tunable thresholds live here with documented defaults; the exact
//! values are tuning artifacts, not contracts, and tests pass explicit
//! settings instead of relying on them.

use crate::error::{PipelineError, Result};
use crate::model::SegmentationModelKind;
use crate::types::{SlideProperties, Taxonomy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default inference batch size
pub const DEFAULT_BATCH_SIZE: usize = 8;
/// Default model patch size in pixels
pub const DEFAULT_PATCH_SIZE: u32 = 1024;
/// Default overlap between neighboring tiles, per side
pub const DEFAULT_OVERLAP: u32 = 64;
/// Instances smaller than this many pixels are dropped
pub const DEFAULT_MIN_INSTANCE_AREA: u32 = 10;
/// Foreground probability threshold for instance extraction
pub const DEFAULT_PROB_THRESHOLD: f32 = 0.5;
/// Classifier confidence below this yields an unclassified label
pub const DEFAULT_TYPE_CONFIDENCE_THRESHOLD: f32 = 0.5;
/// Centroids closer than this (pixels at target resolution) are duplicate
/// candidates; derived from a typical nucleus diameter
pub const DEFAULT_CENTROID_DISTANCE_PX: f32 = 15.0;
/// Bounding-box IoU above which duplicate candidates are merged
pub const DEFAULT_DEDUP_IOU: f32 = 0.25;
/// Wall-clock budget per tile, in seconds
pub const DEFAULT_TILE_TIMEOUT_SECS: u64 = 120;
/// Upper bound on in-flight and completed-but-unconsumed tile results
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    /// CUDA device index
    Gpu(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Gpu(0)
    }
}

/// Duplicate-suppression thresholds for the stitcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DedupSettings {
    pub centroid_distance_px: f32,
    pub iou_threshold: f32,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            centroid_distance_px: DEFAULT_CENTROID_DISTANCE_PX,
            iou_threshold: DEFAULT_DEDUP_IOU,
        }
    }
}

/// One entry of an explicit dataset file list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub properties: SlideProperties,
}

/// What to process: a single slide or a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SlideSource {
    Single {
        path: PathBuf,
        #[serde(default)]
        properties: SlideProperties,
    },
    /// Either a folder scanned for `extension` files or an explicit file
    /// list. Supplying both (or neither) is a configuration error.
    Dataset {
        folder: Option<PathBuf>,
        filelist: Option<Vec<DatasetEntry>>,
        extension: String,
    },
}

impl Default for SlideSource {
    fn default() -> Self {
        Self::Single {
            path: PathBuf::new(),
            properties: SlideProperties::default(),
        }
    }
}

/// Configuration for the cell detection pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Segmentation backbone
    pub model: SegmentationModelKind,
    /// Classification scheme; `Binary` disables typing
    pub taxonomy: Taxonomy,
    /// Tiles per model forward pass
    pub batch_size: usize,
    /// Square tile size in pixels
    pub patch_size: u32,
    /// Overlap shared with each neighboring tile, per side
    pub overlap: u32,
    /// Output directory for results and the processed-files manifest
    pub outdir: PathBuf,
    /// Export GeoJSON overlays (consumed by the exporter collaborator)
    pub geojson: bool,
    /// Export cell graphs with embeddings
    pub graph: bool,
    /// Snappy-compress exported files
    pub compression: bool,
    pub device: Device,
    pub source: SlideSource,
    /// Explicit model-weight cache location handed to model loaders
    pub cache_dir: Option<PathBuf>,
    pub min_instance_area: u32,
    pub prob_threshold: f32,
    pub type_confidence_threshold: f32,
    pub dedup: DedupSettings,
    /// Assign final instance ids by descending size instead of scan order
    pub order_by_size: bool,
    pub tile_timeout_secs: u64,
    pub max_in_flight: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: SegmentationModelKind::default(),
            taxonomy: Taxonomy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            patch_size: DEFAULT_PATCH_SIZE,
            overlap: DEFAULT_OVERLAP,
            outdir: PathBuf::new(),
            geojson: false,
            graph: false,
            compression: false,
            device: Device::default(),
            source: SlideSource::default(),
            cache_dir: None,
            min_instance_area: DEFAULT_MIN_INSTANCE_AREA,
            prob_threshold: DEFAULT_PROB_THRESHOLD,
            type_confidence_threshold: DEFAULT_TYPE_CONFIDENCE_THRESHOLD,
            dedup: DedupSettings::default(),
            order_by_size: false,
            tile_timeout_secs: DEFAULT_TILE_TIMEOUT_SECS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl InferenceConfig {
    /// Validate the configuration before any inference starts.
    ///
    /// Errors name the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.outdir.as_os_str().is_empty() {
            return Err(PipelineError::config("outdir: output directory must be set"));
        }
        if self.batch_size == 0 || self.batch_size > 64 {
            return Err(PipelineError::config(format!(
                "batch_size: must be in 1..=64, got {}",
                self.batch_size
            )));
        }
        if self.patch_size == 0 {
            return Err(PipelineError::config("patch_size: must be positive"));
        }
        if self.patch_size <= 2 * self.overlap {
            return Err(PipelineError::config(format!(
                "overlap: patch_size ({}) must exceed twice the overlap ({})",
                self.patch_size, self.overlap
            )));
        }
        if self.min_instance_area == 0 {
            return Err(PipelineError::config("min_instance_area: must be positive"));
        }
        if !(self.prob_threshold > 0.0 && self.prob_threshold < 1.0) {
            return Err(PipelineError::config(format!(
                "prob_threshold: must be in (0, 1), got {}",
                self.prob_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.type_confidence_threshold) {
            return Err(PipelineError::config(format!(
                "type_confidence_threshold: must be in [0, 1), got {}",
                self.type_confidence_threshold
            )));
        }
        if !(self.dedup.centroid_distance_px > 0.0) {
            return Err(PipelineError::config(
                "dedup.centroid_distance_px: must be positive",
            ));
        }
        if !(self.dedup.iou_threshold > 0.0 && self.dedup.iou_threshold < 1.0) {
            return Err(PipelineError::config(format!(
                "dedup.iou_threshold: must be in (0, 1), got {}",
                self.dedup.iou_threshold
            )));
        }
        if self.tile_timeout_secs == 0 {
            return Err(PipelineError::config("tile_timeout_secs: must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(PipelineError::config("max_in_flight: must be positive"));
        }
        self.validate_source()
    }

    fn validate_source(&self) -> Result<()> {
        match &self.source {
            SlideSource::Single { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err(PipelineError::config("source.path: slide path must be set"));
                }
            }
            SlideSource::Dataset {
                folder,
                filelist,
                extension,
            } => {
                match (folder, filelist) {
                    (Some(_), Some(_)) => {
                        return Err(PipelineError::config(
                            "source.folder / source.filelist: provide a slide folder or an \
                             explicit file list, not both",
                        ));
                    }
                    (None, None) => {
                        return Err(PipelineError::config(
                            "source: provide either a slide folder or a file list",
                        ));
                    }
                    _ => {}
                }
                if folder.is_some() && extension.is_empty() {
                    return Err(PipelineError::config(
                        "source.extension: extension filter must be set for folder datasets",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> InferenceConfig {
        InferenceConfig {
            outdir: PathBuf::from("/tmp/out"),
            source: SlideSource::Single {
                path: PathBuf::from("slide.svs"),
                properties: SlideProperties::default(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_outdir_rejected() {
        let config = InferenceConfig {
            outdir: PathBuf::new(),
            ..valid_config()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("outdir"));
    }

    #[test]
    fn test_overlap_larger_than_patch_rejected() {
        let config = InferenceConfig {
            patch_size: 128,
            overlap: 64,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dataset_source_precedence() {
        // both folder and filelist is an error
        let config = InferenceConfig {
            source: SlideSource::Dataset {
                folder: Some(PathBuf::from("/data")),
                filelist: Some(vec![]),
                extension: "svs".into(),
            },
            ..valid_config()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("not both"));

        // neither is also an error
        let config = InferenceConfig {
            source: SlideSource::Dataset {
                folder: None,
                filelist: None,
                extension: "svs".into(),
            },
            ..valid_config()
        };
        assert!(config.validate().is_err());

        // folder alone is fine
        let config = InferenceConfig {
            source: SlideSource::Dataset {
                folder: Some(PathBuf::from("/data")),
                filelist: None,
                extension: "svs".into(),
            },
            ..valid_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_bounds() {
        let config = InferenceConfig {
            prob_threshold: 1.5,
            ..valid_config()
        };
        assert!(config.validate().is_err());

        let config = InferenceConfig {
            batch_size: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }
}
