//! Nuclei Detection for Whole-Slide Images
//!
//! Tiled inference orchestration for gigapixel histology slides: plans an
//! overlapping tile grid, fans tiles out to a bounded worker pool around
//! pretrained segmentation/classification models, merges the per-tile
//! predictions into one deduplicated whole-slide instance map, and assembles
//! the final per-cell results. Runtime resources (CPU, memory, GPU, worker
//! count) are detected adaptively across bare servers, containers,
//! Kubernetes and Slurm.
//!
//! Model architectures, slide codecs and export formats stay behind
//! collaborator traits ([`SegmentationModel`], [`CellClassifier`],
//! [`SlideReader`], [`ResultExporter`]).

pub mod assemble;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grid;
pub mod manifest;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod reader;
pub mod resources;
pub mod stitch;
pub mod types;
pub mod worker;

pub use config::{Device, InferenceConfig, SlideSource};
pub use dispatch::CancelFlag;
pub use error::{PipelineError, Result};
pub use model::{CellClassifier, SegmentationModel, SegmentationModelKind, SegmentationOutput};
pub use pipeline::{CellDetectionPipeline, DatasetSummary, ResultExporter};
pub use reader::{MemorySlideReader, SlideReader};
pub use resources::{SystemProfile, SystemProbe};
pub use types::{
    GlobalDetection, ProcessingLog, RawDetection, SlideMetadata, SlideProperties, SlideResult,
    Taxonomy, Tile,
};

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
