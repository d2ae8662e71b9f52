//! Post-processing of raw model output into discrete instances
//!
//! The segmentation model emits per-pixel maps; this module turns them into
//! individual nuclei: thresholding, connected-component labeling,
//! small-object removal, and per-instance contour/centroid/bbox measurement.

use crate::types::Bbox;
use ndarray::{Array2, Array3};
use rayon::prelude::*;

/// Neighbor offsets, clockwise starting East. Used for both flood fill and
/// boundary tracing.
const NEIGHBORS_8: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// One extracted instance with its pixel support
#[derive(Debug, Clone)]
pub struct Instance {
    /// All (x, y) pixels belonging to the instance
    pub pixels: Vec<(u32, u32)>,
    /// Boundary polygon in tracing order
    pub contour: Vec<[f32; 2]>,
    pub centroid: [f32; 2],
    pub bbox: Bbox,
    pub area: u32,
}

/// Extracts discrete instances from a per-pixel probability map.
#[derive(Debug, Clone, Copy)]
pub struct InstanceExtractor {
    prob_threshold: f32,
    min_area: u32,
}

impl InstanceExtractor {
    pub fn new(prob_threshold: f32, min_area: u32) -> Self {
        Self {
            prob_threshold,
            min_area,
        }
    }

    /// Extract instances from a foreground probability map.
    ///
    /// Instances are returned in scan order of their first pixel, which
    /// makes extraction deterministic for identical input.
    pub fn extract(&self, foreground: &Array2<f32>) -> Vec<Instance> {
        let (height, width) = foreground.dim();
        let mut labels = Array2::<u32>::zeros((height, width));
        let mut components: Vec<Vec<(u32, u32)>> = Vec::new();

        for y in 0..height {
            for x in 0..width {
                if foreground[[y, x]] < self.prob_threshold || labels[[y, x]] != 0 {
                    continue;
                }
                let label = components.len() as u32 + 1;
                components.push(self.flood_fill(foreground, &mut labels, label, x, y));
            }
        }

        let min_area = self.min_area;
        components
            .into_par_iter()
            .filter(|pixels| pixels.len() as u32 >= min_area)
            .map(|pixels| measure_instance(&labels, pixels))
            .collect()
    }

    /// 8-connectivity region growing from a seed pixel
    fn flood_fill(
        &self,
        foreground: &Array2<f32>,
        labels: &mut Array2<u32>,
        label: u32,
        seed_x: usize,
        seed_y: usize,
    ) -> Vec<(u32, u32)> {
        let (height, width) = foreground.dim();
        let mut pixels = Vec::new();
        let mut stack = vec![(seed_x, seed_y)];
        labels[[seed_y, seed_x]] = label;

        while let Some((x, y)) = stack.pop() {
            pixels.push((x as u32, y as u32));
            for (dx, dy) in NEIGHBORS_8 {
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if nx < 0 || ny < 0 || nx as usize >= width || ny as usize >= height {
                    continue;
                }
                let (nx, ny) = (nx as usize, ny as usize);
                if labels[[ny, nx]] == 0 && foreground[[ny, nx]] >= self.prob_threshold {
                    labels[[ny, nx]] = label;
                    stack.push((nx, ny));
                }
            }
        }
        pixels
    }
}

fn measure_instance(labels: &Array2<u32>, pixels: Vec<(u32, u32)>) -> Instance {
    let area = pixels.len() as u32;

    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    for &(x, y) in &pixels {
        sum_x += x as f64;
        sum_y += y as f64;
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    let centroid = [
        (sum_x / pixels.len() as f64) as f32,
        (sum_y / pixels.len() as f64) as f32,
    ];
    let bbox = Bbox::new(
        min_x as f32,
        min_y as f32,
        max_x as f32 + 1.0,
        max_y as f32 + 1.0,
    );

    // seed pixel is topmost-leftmost by scan order: a valid Moore start
    let label = labels[[pixels[0].1 as usize, pixels[0].0 as usize]];
    let contour = trace_contour(labels, label, pixels[0], area);

    Instance {
        pixels,
        contour,
        centroid,
        bbox,
        area,
    }
}

/// Moore-neighbor boundary tracing.
///
/// Starts at the instance's topmost-leftmost pixel and walks the boundary
/// clockwise until it returns to the start; iteration is capped so malformed
/// masks cannot loop forever.
fn trace_contour(
    labels: &Array2<u32>,
    label: u32,
    start: (u32, u32),
    area: u32,
) -> Vec<[f32; 2]> {
    let (height, width) = labels.dim();
    let inside = |x: i64, y: i64| {
        x >= 0
            && y >= 0
            && (x as usize) < width
            && (y as usize) < height
            && labels[[y as usize, x as usize]] == label
    };

    let start = (start.0 as i64, start.1 as i64);
    let mut contour = vec![[start.0 as f32, start.1 as f32]];
    let mut current = start;
    // fictitious backtrack: the start's west neighbor is always background
    let mut backtrack_dir = 4usize;
    let max_steps = 4 * (area as usize + 2);

    for _ in 0..max_steps {
        let mut moved = false;
        for i in 1..=8 {
            let dir = (backtrack_dir + i) % 8;
            let nx = current.0 + NEIGHBORS_8[dir].0;
            let ny = current.1 + NEIGHBORS_8[dir].1;
            if inside(nx, ny) {
                current = (nx, ny);
                backtrack_dir = (dir + 4) % 8;
                moved = true;
                break;
            }
        }
        if !moved || current == start {
            break;
        }
        contour.push([current.0 as f32, current.1 as f32]);
    }

    contour
}

/// Mean of per-pixel planes over an instance's pixel support.
///
/// Used both for pooling class-score maps and embedding planes.
pub fn pool_planes(planes: &Array3<f32>, pixels: &[(u32, u32)]) -> Vec<f32> {
    let (channels, _, _) = planes.dim();
    let mut pooled = vec![0.0f32; channels];
    if pixels.is_empty() {
        return pooled;
    }
    for &(x, y) in pixels {
        for (c, value) in pooled.iter_mut().enumerate() {
            *value += planes[[c, y as usize, x as usize]];
        }
    }
    let n = pixels.len() as f32;
    for value in &mut pooled {
        *value /= n;
    }
    pooled
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Index of the largest value, if any
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn map_with_square(size: usize, x0: usize, y0: usize, side: usize) -> Array2<f32> {
        let mut map = Array2::<f32>::zeros((size, size));
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                map[[y, x]] = 1.0;
            }
        }
        map
    }

    #[test]
    fn test_single_square_instance() {
        let map = map_with_square(16, 4, 6, 3);
        let extractor = InstanceExtractor::new(0.5, 1);

        let instances = extractor.extract(&map);
        assert_eq!(instances.len(), 1);

        let inst = &instances[0];
        assert_eq!(inst.area, 9);
        assert_eq!(inst.centroid, [5.0, 7.0]);
        assert_eq!(inst.bbox, Bbox::new(4.0, 6.0, 7.0, 9.0));
        // 3x3 square has 8 boundary pixels
        assert_eq!(inst.contour.len(), 8);
    }

    #[test]
    fn test_separate_blobs_are_separate_instances() {
        let mut map = map_with_square(32, 2, 2, 4);
        for y in 20..24 {
            for x in 20..24 {
                map[[y, x]] = 0.9;
            }
        }
        let extractor = InstanceExtractor::new(0.5, 1);
        let instances = extractor.extract(&map);
        assert_eq!(instances.len(), 2);
        // scan order: top-left blob first
        assert!(instances[0].centroid[1] < instances[1].centroid[1]);
    }

    #[test]
    fn test_small_objects_removed() {
        let mut map = map_with_square(16, 2, 2, 4);
        map[[12, 12]] = 1.0; // single stray pixel
        let extractor = InstanceExtractor::new(0.5, 10);
        let instances = extractor.extract(&map);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].area, 16);
    }

    #[test]
    fn test_threshold_respected() {
        let mut map = Array2::<f32>::zeros((8, 8));
        map[[4, 4]] = 0.4;
        let extractor = InstanceExtractor::new(0.5, 1);
        assert!(extractor.extract(&map).is_empty());
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        let mut map = Array2::<f32>::zeros((8, 8));
        map[[2, 2]] = 1.0;
        map[[3, 3]] = 1.0;
        let extractor = InstanceExtractor::new(0.5, 1);
        assert_eq!(extractor.extract(&map).len(), 1);
    }

    #[test]
    fn test_pool_and_softmax() {
        let mut planes = Array3::<f32>::zeros((2, 4, 4));
        planes[[0, 1, 1]] = 1.0;
        planes[[1, 1, 1]] = 3.0;
        planes[[1, 2, 1]] = 1.0;

        let pooled = pool_planes(&planes, &[(1, 1), (1, 2)]);
        assert_eq!(pooled, vec![0.5, 2.0]);

        let probs = softmax(&pooled);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(argmax(&probs), Some(1));
    }
}
