//! Global stitching and duplicate suppression
//!
//! Adjacent tiles share an overlap band, so one physical cell can be
//! predicted by two (or, at corners, four) tiles. This module translates
//! per-tile detections into slide coordinates, suppresses duplicates, and
//! assigns the final sequential instance ids.
//!
//! The merge runs as one whole-slide pass after all tiles have reported,
//! which makes it indifferent to the completion order of parallel workers.

use crate::config::{DedupSettings, InferenceConfig};
use crate::types::{GlobalDetection, RawDetection, Tile};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Stitcher thresholds and relabeling policy
#[derive(Debug, Clone, Copy)]
pub struct StitchSettings {
    pub dedup: DedupSettings,
    /// Assign ids by descending instance area instead of scan order
    pub order_by_size: bool,
}

impl From<&InferenceConfig> for StitchSettings {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            dedup: config.dedup,
            order_by_size: config.order_by_size,
        }
    }
}

/// A detection translated to slide coordinates, not yet deduplicated
struct Candidate {
    contour: Vec<[f32; 2]>,
    centroid: [f32; 2],
    bbox: crate::types::Bbox,
    area: u32,
    cell_type: u8,
    type_confidence: f32,
    tile_index: usize,
    /// Distance of the centroid to the source tile's nearest edge; larger
    /// means less likely truncated
    border_distance: f32,
}

/// Merges per-tile detections into one whole-slide instance collection.
pub struct GlobalStitcher {
    settings: StitchSettings,
}

impl GlobalStitcher {
    pub fn new(settings: StitchSettings) -> Self {
        Self { settings }
    }

    /// Merge all per-tile results into deduplicated global detections.
    ///
    /// Guarantees: the output never exceeds the input count, every survivor
    /// originates from one input detection, and ids are a contiguous
    /// sequence starting at 1.
    pub fn stitch(&self, per_tile: Vec<(Tile, Vec<RawDetection>)>) -> Vec<GlobalDetection> {
        let mut candidates: Vec<Candidate> = per_tile
            .into_par_iter()
            .flat_map(|(tile, detections)| {
                detections
                    .into_iter()
                    .map(|det| translate(&tile, det))
                    .collect::<Vec<_>>()
            })
            .collect();
        let total = candidates.len();

        // preference order: most interior prediction first, then higher
        // classifier confidence, then earliest tile for determinism
        candidates.sort_by(|a, b| {
            b.border_distance
                .partial_cmp(&a.border_distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.type_confidence
                        .partial_cmp(&a.type_confidence)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.tile_index.cmp(&b.tile_index))
        });

        let kept = self.suppress_duplicates(candidates);
        log::debug!(
            "stitched {} raw detections into {} cells ({} duplicates removed)",
            total,
            kept.len(),
            total - kept.len()
        );

        self.relabel(kept)
    }

    /// Greedy duplicate suppression over a spatial hash of kept centroids.
    ///
    /// Candidates arrive in preference order, so the first member of each
    /// duplicate group seen here is its representative.
    fn suppress_duplicates(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let distance = self.settings.dedup.centroid_distance_px.max(1.0);
        let iou_threshold = self.settings.dedup.iou_threshold;

        let cell_key = |centroid: [f32; 2]| -> (i64, i64) {
            (
                (centroid[0] / distance).floor() as i64,
                (centroid[1] / distance).floor() as i64,
            )
        };

        let mut kept: Vec<Candidate> = Vec::new();
        let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();

        for candidate in candidates {
            let key = cell_key(candidate.centroid);
            let mut duplicate = false;

            'search: for dx in -1..=1 {
                for dy in -1..=1 {
                    if let Some(indices) = grid.get(&(key.0 + dx, key.1 + dy)) {
                        for &i in indices {
                            let keeper = &kept[i];
                            let ddx = keeper.centroid[0] - candidate.centroid[0];
                            let ddy = keeper.centroid[1] - candidate.centroid[1];
                            let close = (ddx * ddx + ddy * ddy).sqrt() < distance;
                            if close && keeper.bbox.iou(&candidate.bbox) > iou_threshold {
                                duplicate = true;
                                break 'search;
                            }
                        }
                    }
                }
            }

            if !duplicate {
                grid.entry(key).or_default().push(kept.len());
                kept.push(candidate);
            }
        }

        kept
    }

    /// Assign the final sequential instance ids, starting at 1
    fn relabel(&self, mut kept: Vec<Candidate>) -> Vec<GlobalDetection> {
        let scan_order = |a: &Candidate, b: &Candidate| {
            a.centroid[1]
                .partial_cmp(&b.centroid[1])
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.centroid[0]
                        .partial_cmp(&b.centroid[0])
                        .unwrap_or(Ordering::Equal)
                })
        };

        if self.settings.order_by_size {
            kept.sort_by(|a, b| b.area.cmp(&a.area).then_with(|| scan_order(a, b)));
        } else {
            kept.sort_by(scan_order);
        }

        kept.into_iter()
            .enumerate()
            .map(|(i, c)| GlobalDetection {
                id: (i + 1) as u64,
                contour: c.contour,
                centroid: c.centroid,
                bbox: c.bbox,
                area: c.area,
                cell_type: c.cell_type,
                type_confidence: c.type_confidence,
                tile_index: c.tile_index,
            })
            .collect()
    }
}

/// Translate one detection from tile-local to slide coordinates
fn translate(tile: &Tile, det: RawDetection) -> Candidate {
    let dx = tile.x as f32;
    let dy = tile.y as f32;

    let contour = det
        .contour
        .into_iter()
        .map(|[x, y]| [x + dx, y + dy])
        .collect();
    let centroid = [det.centroid[0] + dx, det.centroid[1] + dy];
    let border_distance = tile.border_distance(centroid[0], centroid[1]);

    Candidate {
        contour,
        centroid,
        bbox: det.bbox.translate(dx, dy),
        area: det.area,
        cell_type: det.cell_type,
        type_confidence: det.type_confidence,
        tile_index: tile.index,
        border_distance,
    }
}
