//! Type definitions for whole-slide nuclei detection

use serde::{Deserialize, Serialize};

/// Class label for detections the classifier could not (or did not) type.
pub const UNCLASSIFIED: u8 = 0;

/// Nuclei classification taxonomy.
///
/// A closed set of supported class schemes; the classifier head loaded for a
/// run must match the taxonomy's class count. Class id 0 is reserved for
/// unclassified detections in every taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Taxonomy {
    /// Cell-only detection without typing.
    Binary,
    /// PanNuke 5-class scheme (default).
    PanNuke,
    /// CoNSeP 7-class scheme.
    Consep,
    /// Lizard 6-class scheme.
    Lizard,
}

impl Taxonomy {
    const PANNUKE_CLASSES: &'static [&'static str] = &[
        "Neoplastic",
        "Inflammatory",
        "Connective",
        "Dead",
        "Epithelial",
    ];

    const CONSEP_CLASSES: &'static [&'static str] = &[
        "Other",
        "Inflammatory",
        "Healthy Epithelial",
        "Dysplastic/Malignant Epithelial",
        "Fibroblast",
        "Muscle",
        "Endothelial",
    ];

    const LIZARD_CLASSES: &'static [&'static str] = &[
        "Neutrophil",
        "Epithelial",
        "Lymphocyte",
        "Plasma",
        "Eosinophil",
        "Connective",
    ];

    /// Number of typed classes (class id 0 excluded).
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Binary => 1,
            Self::PanNuke => Self::PANNUKE_CLASSES.len(),
            Self::Consep => Self::CONSEP_CLASSES.len(),
            Self::Lizard => Self::LIZARD_CLASSES.len(),
        }
    }

    /// Display name for a class id. Id 0 and out-of-range ids map to
    /// "Unclassified".
    pub fn class_name(&self, id: u8) -> &'static str {
        if id == UNCLASSIFIED {
            return "Unclassified";
        }
        let idx = (id - 1) as usize;
        let table: &[&'static str] = match self {
            Self::Binary => &["Nucleus"],
            Self::PanNuke => Self::PANNUKE_CLASSES,
            Self::Consep => Self::CONSEP_CLASSES,
            Self::Lizard => Self::LIZARD_CLASSES,
        };
        table.get(idx).copied().unwrap_or("Unclassified")
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "binary" => Some(Self::Binary),
            "pannuke" => Some(Self::PanNuke),
            "consep" => Some(Self::Consep),
            "lizard" => Some(Self::Lizard),
            _ => None,
        }
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::PanNuke
    }
}

impl std::fmt::Display for Taxonomy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::PanNuke => write!(f, "pannuke"),
            Self::Consep => write!(f, "consep"),
            Self::Lizard => write!(f, "lizard"),
        }
    }
}

/// Explicit per-slide resolution overrides, replacing the reader's native
/// properties before the target resolution is derived.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SlideProperties {
    pub mpp: Option<f32>,
    pub magnification: Option<f32>,
}

/// Resolved metadata for one slide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideMetadata {
    pub name: String,
    /// Slide dimensions at base (level 0) resolution
    pub base_width: u32,
    pub base_height: u32,
    /// Native microns-per-pixel
    pub mpp: f32,
    /// Native objective magnification
    pub magnification: f32,
    /// Microns-per-pixel the pipeline runs inference at
    pub target_mpp: f32,
}

impl SlideMetadata {
    /// Slide dimensions in the inference (target) resolution space.
    pub fn target_dimensions(&self) -> (u32, u32) {
        let scale = self.mpp as f64 / self.target_mpp as f64;
        let w = (self.base_width as f64 * scale).round() as u32;
        let h = (self.base_height as f64 * scale).round() as u32;
        (w.max(1), h.max(1))
    }
}

/// Bounding box in slide or tile pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersects(&self, other: &Bbox) -> bool {
        self.xmin < other.xmax
            && self.xmax > other.xmin
            && self.ymin < other.ymax
            && self.ymax > other.ymin
    }

    /// Intersection over union with another box
    pub fn iou(&self, other: &Bbox) -> f32 {
        if !self.intersects(other) {
            return 0.0;
        }

        let x_left = self.xmin.max(other.xmin);
        let y_top = self.ymin.max(other.ymin);
        let x_right = self.xmax.min(other.xmax);
        let y_bottom = self.ymax.min(other.ymax);

        let intersection = (x_right - x_left) * (y_bottom - y_top);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }

    /// Shift the box by an offset
    pub fn translate(&self, dx: f32, dy: f32) -> Bbox {
        Bbox::new(self.xmin + dx, self.ymin + dy, self.xmax + dx, self.ymax + dy)
    }
}

/// One tile of the inference grid.
///
/// Coordinates are in target-resolution pixel space. Tiles have constant
/// size; edge tiles are shifted inward rather than shrunk, so the extent may
/// need clipping against the slide bounds only in the degenerate
/// slide-smaller-than-patch case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    /// Row-major processing order index
    pub index: usize,
    pub x: u32,
    pub y: u32,
    pub size: u32,
    pub overlap: u32,
}

impl Tile {
    pub fn right(&self) -> u32 {
        self.x + self.size
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.size
    }

    /// Tile extent clipped against the slide bounds
    pub fn clipped_extent(&self, slide_width: u32, slide_height: u32) -> (u32, u32) {
        let w = self.size.min(slide_width.saturating_sub(self.x));
        let h = self.size.min(slide_height.saturating_sub(self.y));
        (w, h)
    }

    /// Distance from a slide-space point to the nearest tile edge.
    ///
    /// Used by the deduplicator to prefer the most interior prediction of a
    /// cell seen by several overlapping tiles.
    pub fn border_distance(&self, cx: f32, cy: f32) -> f32 {
        let left = cx - self.x as f32;
        let right = self.right() as f32 - cx;
        let top = cy - self.y as f32;
        let bottom = self.bottom() as f32 - cy;
        left.min(right).min(top).min(bottom)
    }
}

/// One instance predicted within a single tile, in tile-local coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Boundary polygon, tile-local pixel coordinates
    pub contour: Vec<[f32; 2]>,
    pub centroid: [f32; 2],
    pub bbox: Bbox,
    /// Instance size in pixels
    pub area: u32,
    /// Class id within the run's taxonomy; 0 = unclassified
    pub cell_type: u8,
    pub type_confidence: f32,
}

/// A detection translated into slide coordinates with a unique id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDetection {
    /// Sequential instance id, starting at 1
    pub id: u64,
    pub contour: Vec<[f32; 2]>,
    pub centroid: [f32; 2],
    pub bbox: Bbox,
    pub area: u32,
    pub cell_type: u8,
    pub type_confidence: f32,
    /// Processing-order index of the tile that produced the kept prediction
    pub tile_index: usize,
}

/// A recorded per-tile failure (degraded to zero detections, not fatal)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileFailure {
    pub tile_index: usize,
    pub x: u32,
    pub y: u32,
    pub reason: String,
}

/// Slide-level processing log collected by the worker pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub tiles_total: usize,
    pub tiles_failed: usize,
    pub retries: usize,
    pub failures: Vec<TileFailure>,
}

impl ProcessingLog {
    pub fn new(tiles_total: usize) -> Self {
        Self {
            tiles_total,
            ..Default::default()
        }
    }

    pub fn record_failure(&mut self, tile: &Tile, reason: String) {
        self.tiles_failed += 1;
        self.failures.push(TileFailure {
            tile_index: tile.index,
            x: tile.x,
            y: tile.y,
            reason,
        });
    }
}

/// Final per-slide result handed to the exporters.
///
/// Immutable after assembly; `cells` are ordered by instance id.
#[derive(Debug, Clone, Serialize)]
pub struct SlideResult {
    pub metadata: SlideMetadata,
    pub cells: Vec<GlobalDetection>,
    pub log: ProcessingLog,
}

impl SlideResult {
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Detection counts keyed by class id
    pub fn counts_per_type(&self) -> std::collections::HashMap<u8, usize> {
        let mut counts = std::collections::HashMap::new();
        for cell in &self.cells {
            *counts.entry(cell.cell_type).or_insert(0) += 1;
        }
        counts
    }
}

/// Per-slide processing stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideStage {
    Planned,
    Dispatching,
    Stitching,
    Assembled,
    Exported,
    Failed,
}

impl std::fmt::Display for SlideStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Planned => "planned",
            Self::Dispatching => "dispatching",
            Self::Stitching => "stitching",
            Self::Assembled => "assembled",
            Self::Exported => "exported",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_iou() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::new(5.0, 5.0, 15.0, 15.0);
        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);

        let c = Bbox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&c), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tile_border_distance() {
        let tile = Tile {
            index: 0,
            x: 100,
            y: 100,
            size: 1024,
            overlap: 64,
        };
        // 20 px from the left edge is the closest boundary
        assert_eq!(tile.border_distance(120.0, 500.0), 20.0);
        // center of the tile
        assert_eq!(tile.border_distance(612.0, 612.0), 512.0);
    }

    #[test]
    fn test_target_dimensions() {
        // 20x slide upsampled to the 40x-equivalent working resolution
        let meta = SlideMetadata {
            name: "slide".into(),
            base_width: 1000,
            base_height: 500,
            mpp: 0.5,
            magnification: 20.0,
            target_mpp: 0.25,
        };
        assert_eq!(meta.target_dimensions(), (2000, 1000));

        // native 40x runs at native resolution
        let meta = SlideMetadata {
            target_mpp: 0.5,
            ..meta
        };
        assert_eq!(meta.target_dimensions(), (1000, 500));
    }

    #[test]
    fn test_taxonomy_classes() {
        assert_eq!(Taxonomy::PanNuke.num_classes(), 5);
        assert_eq!(Taxonomy::PanNuke.class_name(0), "Unclassified");
        assert_eq!(Taxonomy::PanNuke.class_name(1), "Neoplastic");
        assert_eq!(Taxonomy::PanNuke.class_name(5), "Epithelial");
        assert_eq!(Taxonomy::PanNuke.class_name(6), "Unclassified");
        assert_eq!(Taxonomy::from_str("PanNuke"), Some(Taxonomy::PanNuke));
        assert_eq!(Taxonomy::from_str("unknown"), None);
    }

    #[test]
    fn test_counts_per_type() {
        let meta = SlideMetadata {
            name: "s".into(),
            base_width: 100,
            base_height: 100,
            mpp: 0.25,
            magnification: 40.0,
            target_mpp: 0.25,
        };
        let det = |id: u64, cell_type: u8| GlobalDetection {
            id,
            contour: vec![[0.0, 0.0]],
            centroid: [0.0, 0.0],
            bbox: Bbox::new(0.0, 0.0, 1.0, 1.0),
            area: 1,
            cell_type,
            type_confidence: 1.0,
            tile_index: 0,
        };
        let result = SlideResult {
            metadata: meta,
            cells: vec![det(1, 2), det(2, 2), det(3, 5)],
            log: ProcessingLog::default(),
        };
        let counts = result.counts_per_type();
        assert_eq!(counts[&2], 2);
        assert_eq!(counts[&5], 1);
    }
}
