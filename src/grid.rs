//! Tile grid planning
//!
//! Partitions a slide into overlapping fixed-size tiles covering every pixel.
//! The planner holds no iteration state: `plan` re-derives the same sequence
//! deterministically from its inputs on every call.

use crate::error::{PipelineError, Result};
use crate::types::Tile;

/// Computes the ordered tile grid for a slide.
///
/// Tiles are produced in row-major order with stride
/// `patch_size - 2 * overlap`, so every interior pixel lies in the overlap
/// band of at least two tiles. Edge tiles whose nominal placement would
/// exceed the slide bounds are shifted inward, keeping the tile size constant
/// for the model's fixed input contract.
#[derive(Debug, Clone, Copy)]
pub struct TileGridPlanner {
    patch_size: u32,
    overlap: u32,
}

impl TileGridPlanner {
    pub fn new(patch_size: u32, overlap: u32) -> Result<Self> {
        if patch_size == 0 {
            return Err(PipelineError::config("patch_size: must be positive"));
        }
        if patch_size <= 2 * overlap {
            return Err(PipelineError::config(format!(
                "overlap: patch_size ({}) must exceed twice the overlap ({})",
                patch_size, overlap
            )));
        }
        Ok(Self {
            patch_size,
            overlap,
        })
    }

    /// Distance between the origins of neighboring tiles
    pub fn stride(&self) -> u32 {
        self.patch_size - 2 * self.overlap
    }

    /// Tile origins along one axis.
    ///
    /// The last origin is shifted inward to `dim - patch_size`; a shift that
    /// collides with the previous origin is deduplicated.
    fn axis_origins(&self, dim: u32) -> Vec<u32> {
        if dim <= self.patch_size {
            return vec![0];
        }

        let stride = self.stride();
        let last = dim - self.patch_size;
        let additional = (last + stride - 1) / stride;

        let mut origins = Vec::with_capacity(additional as usize + 1);
        for i in 0..=additional {
            origins.push((i * stride).min(last));
        }
        origins.dedup();
        origins
    }

    /// Compute the ordered tile grid covering a slide
    pub fn plan(&self, slide_width: u32, slide_height: u32) -> Vec<Tile> {
        let xs = self.axis_origins(slide_width);
        let ys = self.axis_origins(slide_height);

        let mut tiles = Vec::with_capacity(xs.len() * ys.len());
        for &y in &ys {
            for &x in &xs {
                tiles.push(Tile {
                    index: tiles.len(),
                    x,
                    y,
                    size: self.patch_size,
                    overlap: self.overlap,
                });
            }
        }
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_grid() {
        // 2000x2000 slide, patch 1024, overlap 64 -> stride 896, 3x3 grid
        let planner = TileGridPlanner::new(1024, 64).unwrap();
        assert_eq!(planner.stride(), 896);

        let tiles = planner.plan(2000, 2000);
        assert_eq!(tiles.len(), 9);

        let xs: Vec<u32> = tiles.iter().take(3).map(|t| t.x).collect();
        assert_eq!(xs, vec![0, 896, 976]);
        // last column shifted inward, not past the slide edge
        assert_eq!(tiles[2].right(), 2000);
    }

    #[test]
    fn test_row_major_order_and_indices() {
        let planner = TileGridPlanner::new(1024, 64).unwrap();
        let tiles = planner.plan(2000, 2000);

        for (i, tile) in tiles.iter().enumerate() {
            assert_eq!(tile.index, i);
        }
        // top-to-bottom, left-to-right
        for pair in tiles.windows(2) {
            assert!(pair[1].y > pair[0].y || (pair[1].y == pair[0].y && pair[1].x > pair[0].x));
        }
    }

    #[test]
    fn test_full_coverage_no_gaps() {
        let planner_cases = [
            (2000, 2000, 1024, 64),
            (4096, 2048, 512, 32),
            (1025, 1025, 1024, 64),
            (3000, 1000, 1024, 64),
            (10000, 10000, 256, 16),
        ];

        for (w, h, patch, overlap) in planner_cases {
            let planner = TileGridPlanner::new(patch, overlap).unwrap();
            let tiles = planner.plan(w, h);
            let stride = planner.stride();

            let mut xs: Vec<u32> = tiles.iter().map(|t| t.x).collect();
            xs.sort_unstable();
            xs.dedup();
            let mut ys: Vec<u32> = tiles.iter().map(|t| t.y).collect();
            ys.sort_unstable();
            ys.dedup();

            for origins in [(&xs, w), (&ys, h)] {
                let (origins, dim) = origins;
                assert_eq!(origins[0], 0, "{}x{} patch {}", w, h, patch);
                if dim <= patch {
                    assert_eq!(origins.len(), 1);
                    continue;
                }
                // every tile in bounds, last tile reaching the far edge
                assert_eq!(*origins.last().unwrap() + patch, dim);
                // consecutive origins never further apart than the stride,
                // so consecutive tiles always overlap
                for pair in origins.windows(2) {
                    assert!(pair[1] - pair[0] <= stride);
                }
            }
        }
    }

    #[test]
    fn test_degenerate_slide_yields_single_tile() {
        let planner = TileGridPlanner::new(1024, 64).unwrap();
        let tiles = planner.plan(500, 300);
        assert_eq!(tiles.len(), 1);
        assert_eq!((tiles[0].x, tiles[0].y), (0, 0));
        // tile size stays constant; the reader clips/pads the actual read
        assert_eq!(tiles[0].size, 1024);
        assert_eq!(tiles[0].clipped_extent(500, 300), (500, 300));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let planner = TileGridPlanner::new(512, 32).unwrap();
        assert_eq!(planner.plan(3333, 2222), planner.plan(3333, 2222));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(TileGridPlanner::new(0, 0).is_err());
        assert!(TileGridPlanner::new(128, 64).is_err());
        assert!(TileGridPlanner::new(128, 200).is_err());
        assert!(TileGridPlanner::new(1024, 64).is_ok());
    }
}
