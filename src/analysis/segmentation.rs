//! Sign-reversal boundaries and cortical area segmentation.
//!
//! Visual areas alternate field sign, so area borders appear as
//! sign-reversal contours in the VFS map. Detection works on the
//! thresholded sign image:
//!
//! 1. boundary pixels are those whose 4-neighborhood contains the opposite
//!    nonzero sign; connected boundary pixels are chained into polylines
//! 2. the remaining signed pixels are grouped by 4-connected
//!    same-sign components; components below the minimum area are dropped
//!
//! Labels are assigned in discovery order starting at 1; 0 means
//! unlabeled.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// One sign-reversal contour as an ordered pixel chain `(row, col)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Boundary {
    /// Chained boundary pixels.
    pub points: Vec<(usize, usize)>,
}

/// One labeled cortical area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// Label in the segmentation image (>= 1).
    pub label: u32,
    /// Field sign of the region: +1 (non-mirror) or -1 (mirror).
    pub sign: i8,
    /// Pixel count.
    pub area: usize,
    /// Area centroid `(row, col)`.
    pub centroid: (f32, f32),
    /// Border pixels of the region (adjacent to non-region pixels).
    pub outline: Vec<(usize, usize)>,
}

/// Segmentation result: a label image plus per-region summaries.
#[derive(Debug, Clone)]
pub struct AreaSegmentation {
    /// Per-pixel labels; 0 is background.
    pub labels: Array2<u32>,
    /// Region summaries in label order.
    pub regions: Vec<Region>,
}

const NEIGHBORS_4: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const NEIGHBORS_8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

fn sign_image(vfs: &Array2<f32>, threshold: f32) -> Array2<i8> {
    vfs.mapv(|v| {
        if v >= threshold {
            1
        } else if v <= -threshold {
            -1
        } else {
            0
        }
    })
}

fn neighbors<'a>(
    (rows, cols): (usize, usize),
    (y, x): (usize, usize),
    offsets: &'a [(isize, isize)],
) -> impl Iterator<Item = (usize, usize)> + 'a {
    offsets.iter().filter_map(move |&(dy, dx)| {
        let ny = y as isize + dy;
        let nx = x as isize + dx;
        (ny >= 0 && nx >= 0 && (ny as usize) < rows && (nx as usize) < cols)
            .then(|| (ny as usize, nx as usize))
    })
}

/// Locate sign-reversal contours in the VFS map.
pub fn detect_boundaries(vfs: &Array2<f32>, threshold: f32) -> Vec<Boundary> {
    let signs = sign_image(vfs, threshold);
    let dim = signs.dim();

    // A boundary pixel touches the opposite nonzero sign.
    let mut is_boundary = Array2::from_elem(dim, false);
    for ((y, x), &s) in signs.indexed_iter() {
        if s == 0 {
            continue;
        }
        let reversal = neighbors(dim, (y, x), &NEIGHBORS_4)
            .any(|(ny, nx)| signs[(ny, nx)] == -s);
        if reversal {
            is_boundary[(y, x)] = true;
        }
    }

    // Chain connected boundary pixels into polylines.
    let mut visited = Array2::from_elem(dim, false);
    let mut boundaries = Vec::new();
    for ((y, x), &b) in is_boundary.indexed_iter() {
        if !b || visited[(y, x)] {
            continue;
        }
        let mut points = Vec::new();
        let mut queue = VecDeque::from([(y, x)]);
        visited[(y, x)] = true;
        while let Some(p) = queue.pop_front() {
            points.push(p);
            for n in neighbors(dim, p, &NEIGHBORS_8) {
                if is_boundary[n] && !visited[n] {
                    visited[n] = true;
                    queue.push_back(n);
                }
            }
        }
        boundaries.push(Boundary { points });
    }

    debug!(count = boundaries.len(), "sign-reversal boundaries detected");
    boundaries
}

/// Label connected same-sign components between boundaries.
///
/// `min_area` drops speckle regions; dropped pixels return to background.
pub fn segment_areas(
    vfs: &Array2<f32>,
    boundaries: &[Boundary],
    threshold: f32,
    min_area: usize,
) -> AreaSegmentation {
    let signs = sign_image(vfs, threshold);
    let dim = signs.dim();

    let mut excluded = Array2::from_elem(dim, false);
    for boundary in boundaries {
        for &p in &boundary.points {
            excluded[p] = true;
        }
    }

    let mut labels = Array2::<u32>::zeros(dim);
    let mut regions = Vec::new();
    let mut next_label = 1u32;

    for ((y, x), &s) in signs.indexed_iter() {
        if s == 0 || excluded[(y, x)] || labels[(y, x)] != 0 {
            continue;
        }

        // Flood-fill one same-sign component.
        let mut pixels = Vec::new();
        let mut queue = VecDeque::from([(y, x)]);
        labels[(y, x)] = next_label;
        while let Some(p) = queue.pop_front() {
            pixels.push(p);
            for n in neighbors(dim, p, &NEIGHBORS_4) {
                if signs[n] == s && !excluded[n] && labels[n] == 0 {
                    labels[n] = next_label;
                    queue.push_back(n);
                }
            }
        }

        if pixels.len() < min_area {
            for p in pixels {
                labels[p] = 0;
            }
            continue;
        }

        let area = pixels.len();
        let (sum_y, sum_x) = pixels
            .iter()
            .fold((0usize, 0usize), |(sy, sx), &(py, px)| (sy + py, sx + px));
        let outline = pixels
            .iter()
            .copied()
            .filter(|&p| {
                neighbors(dim, p, &NEIGHBORS_4).count() < 4
                    || neighbors(dim, p, &NEIGHBORS_4).any(|n| labels[n] != next_label)
            })
            .collect();

        regions.push(Region {
            label: next_label,
            sign: s,
            area,
            centroid: (sum_y as f32 / area as f32, sum_x as f32 / area as f32),
            outline,
        });
        next_label += 1;
    }

    debug!(regions = regions.len(), "areas segmented");
    AreaSegmentation { labels, regions }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sign map with one vertical reversal down the middle.
    fn single_reversal(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(_, x)| {
            if x < cols / 2 {
                1.0
            } else {
                -1.0
            }
        })
    }

    #[test]
    fn single_reversal_yields_one_boundary() {
        let vfs = single_reversal(16, 16);
        let boundaries = detect_boundaries(&vfs, 0.5);
        assert_eq!(boundaries.len(), 1);
        // The contour hugs the central columns.
        assert!(boundaries[0]
            .points
            .iter()
            .all(|&(_, x)| x == 7 || x == 8));
        assert_eq!(boundaries[0].points.len(), 32);
    }

    #[test]
    fn segmentation_labels_both_sides_of_the_reversal() {
        let vfs = single_reversal(16, 16);
        let boundaries = detect_boundaries(&vfs, 0.5);
        let segmentation = segment_areas(&vfs, &boundaries, 0.5, 10);

        assert_eq!(segmentation.regions.len(), 2);
        let signs: Vec<i8> = segmentation.regions.iter().map(|r| r.sign).collect();
        assert!(signs.contains(&1) && signs.contains(&-1));
        for region in &segmentation.regions {
            assert!(region.area >= 10);
            assert!(!region.outline.is_empty());
        }
    }

    #[test]
    fn speckle_below_min_area_is_dropped() {
        let mut vfs = Array2::from_elem((12, 12), 0.0f32);
        // A 2x2 islet of positive sign in a sea of nothing.
        for y in 4..6 {
            for x in 4..6 {
                vfs[(y, x)] = 1.0;
            }
        }
        let segmentation = segment_areas(&vfs, &[], 0.5, 8);
        assert!(segmentation.regions.is_empty());
        assert!(segmentation.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn subthreshold_pixels_stay_background() {
        let vfs = Array2::from_elem((8, 8), 0.1f32);
        let boundaries = detect_boundaries(&vfs, 0.5);
        assert!(boundaries.is_empty());
        let segmentation = segment_areas(&vfs, &boundaries, 0.5, 1);
        assert!(segmentation.regions.is_empty());
    }
}
