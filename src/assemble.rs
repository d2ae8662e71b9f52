//! Final result assembly
//!
//! Pure data transformation: validates the stitcher's output invariants and
//! freezes it into a [`SlideResult`]. Violations here are internal defects,
//! surfaced with full diagnostic context rather than papered over.

use crate::error::{PipelineError, Result};
use crate::types::{GlobalDetection, ProcessingLog, SlideMetadata, SlideResult};

pub struct ResultAssembler;

impl ResultAssembler {
    /// Validate invariants and build the immutable per-slide result.
    ///
    /// Checks that instance ids form a contiguous sequence starting at 1 and
    /// that every coordinate lies within the slide bounds at the working
    /// resolution.
    pub fn assemble(
        metadata: SlideMetadata,
        cells: Vec<GlobalDetection>,
        log: ProcessingLog,
    ) -> Result<SlideResult> {
        let (width, height) = metadata.target_dimensions();
        let slide = &metadata.name;

        for (position, cell) in cells.iter().enumerate() {
            let expected = (position + 1) as u64;
            if cell.id != expected {
                return Err(PipelineError::invariant(format!(
                    "slide '{}': instance id {} at position {} (expected {}); duplicate or \
                     non-contiguous ids from tile {}",
                    slide, cell.id, position, expected, cell.tile_index
                )));
            }

            let bbox = &cell.bbox;
            if bbox.xmin < 0.0
                || bbox.ymin < 0.0
                || bbox.xmax > width as f32
                || bbox.ymax > height as f32
            {
                return Err(PipelineError::invariant(format!(
                    "slide '{}': instance {} from tile {} outside slide bounds \
                     ({}x{}): bbox ({}, {}, {}, {})",
                    slide,
                    cell.id,
                    cell.tile_index,
                    width,
                    height,
                    bbox.xmin,
                    bbox.ymin,
                    bbox.xmax,
                    bbox.ymax
                )));
            }
        }

        log::info!(
            "slide '{}': assembled {} cells ({} of {} tiles failed)",
            slide,
            cells.len(),
            log.tiles_failed,
            log.tiles_total
        );

        Ok(SlideResult {
            metadata,
            cells,
            log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bbox;

    fn metadata() -> SlideMetadata {
        SlideMetadata {
            name: "slide".into(),
            base_width: 2000,
            base_height: 2000,
            mpp: 0.25,
            magnification: 40.0,
            target_mpp: 0.25,
        }
    }

    fn cell(id: u64, x: f32, y: f32) -> GlobalDetection {
        GlobalDetection {
            id,
            contour: vec![[x, y]],
            centroid: [x, y],
            bbox: Bbox::new(x - 4.0, y - 4.0, x + 4.0, y + 4.0),
            area: 64,
            cell_type: 1,
            type_confidence: 0.9,
            tile_index: 0,
        }
    }

    #[test]
    fn test_valid_result_assembles() {
        let result = ResultAssembler::assemble(
            metadata(),
            vec![cell(1, 100.0, 100.0), cell(2, 500.0, 500.0)],
            ProcessingLog::new(9),
        )
        .unwrap();
        assert_eq!(result.cell_count(), 2);
        assert_eq!(result.log.tiles_total, 9);
    }

    #[test]
    fn test_empty_result_is_valid() {
        let result =
            ResultAssembler::assemble(metadata(), Vec::new(), ProcessingLog::new(9)).unwrap();
        assert_eq!(result.cell_count(), 0);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = ResultAssembler::assemble(
            metadata(),
            vec![cell(1, 100.0, 100.0), cell(1, 500.0, 500.0)],
            ProcessingLog::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Invariant(_)));
        assert!(err.to_string().contains("position 1"));
    }

    #[test]
    fn test_ids_must_start_at_one() {
        let err = ResultAssembler::assemble(
            metadata(),
            vec![cell(0, 100.0, 100.0)],
            ProcessingLog::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Invariant(_)));
    }

    #[test]
    fn test_out_of_bounds_coordinates_rejected() {
        let err = ResultAssembler::assemble(
            metadata(),
            vec![cell(1, 2100.0, 100.0)],
            ProcessingLog::default(),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("outside slide bounds"));
        assert!(message.contains("instance 1"));
    }
}
