//! Error types for the cell segmentation pipeline

use thiserror::Error;

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur during slide processing
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource detection failed: {0}")]
    Resource(String),

    #[error("slide '{slide}': {reason}")]
    Slide { slide: String, reason: String },

    #[error("tile {index} at ({x}, {y}): {reason}")]
    TileInference {
        index: usize,
        x: u32,
        y: u32,
        reason: String,
    },

    #[error("model inference failed: {0}")]
    Inference(String),

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("processing cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Self::Resource(msg.into())
    }

    pub fn slide<S: Into<String>, R: Into<String>>(slide: S, reason: R) -> Self {
        Self::Slide {
            slide: slide.into(),
            reason: reason.into(),
        }
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub fn pool<S: Into<String>>(msg: S) -> Self {
        Self::Pool(msg.into())
    }

    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::Invariant(msg.into())
    }
}
