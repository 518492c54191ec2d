//! Thin visualization renderer.
//!
//! Maps the pipeline outputs onto fixed-layout byte planes and publishes
//! them as one frame on the analysis shared-memory channel. Layout, top to
//! bottom: azimuth, elevation, visual field sign, area labels, each plane
//! min/max normalized to `0..=255`. Color mapping is the display client's
//! concern, not ours.

use ndarray::Array2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::analysis::AnalysisProducts;
use crate::core::{now_us, Frame};
use crate::error::{IsiError, IsiResult};
use crate::transport::shm::FrameChannel;

/// Publishes visualization layers on the analysis frame channel.
pub struct AnalysisRenderer {
    channel: Arc<FrameChannel>,
    sequence: AtomicU64,
}

impl AnalysisRenderer {
    /// Create a renderer publishing to `channel`.
    pub fn new(channel: Arc<FrameChannel>) -> Self {
        Self {
            channel,
            sequence: AtomicU64::new(0),
        }
    }

    /// Render the pipeline products into one stacked layer frame.
    pub fn publish(&self, products: &AnalysisProducts) -> IsiResult<()> {
        let (rows, cols) = products.vfs.dim();
        let (width, height, depth) = self.channel.geometry();
        if cols != width as usize || rows * 4 != height as usize || depth != 1 {
            return Err(IsiError::Configuration(format!(
                "analysis channel geometry {}x{}x{} cannot hold 4 planes of {}x{}",
                width, height, depth, cols, rows
            )));
        }

        let labels_f32 = products.segmentation.labels.mapv(|l| l as f32);
        let mut pixels = Vec::with_capacity(cols * rows * 4);
        for plane in [
            &products.retinotopy.azimuth,
            &products.retinotopy.elevation,
            &products.vfs,
            &labels_f32,
        ] {
            pixels.extend(normalize_plane(plane));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let frame = Frame::new(
            sequence,
            now_us(),
            width,
            height,
            1,
            Arc::from(pixels),
        )?;
        self.channel.publish(&frame)?;
        Ok(())
    }
}

/// Min/max normalize one plane to bytes; a flat plane renders as zeros.
fn normalize_plane(plane: &Array2<f32>) -> Vec<u8> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in plane.iter() {
        if v.is_finite() {
            min = min.min(v);
            max = max.max(v);
        }
    }
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f32::EPSILON {
        return vec![0u8; plane.len()];
    }
    plane
        .iter()
        .map(|&v| {
            if v.is_finite() {
                (((v - min) / (max - min)) * 255.0) as u8
            } else {
                0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fourier::PhaseAmplitude;
    use crate::analysis::retinotopy::RetinotopicMap;
    use crate::analysis::segmentation::AreaSegmentation;
    use std::collections::HashMap;

    fn products(rows: usize, cols: usize) -> AnalysisProducts {
        let dim = (rows, cols);
        AnalysisProducts {
            per_direction: HashMap::<_, PhaseAmplitude>::new(),
            retinotopy: RetinotopicMap {
                azimuth: Array2::from_shape_fn(dim, |(_, x)| x as f32),
                elevation: Array2::from_shape_fn(dim, |(y, _)| y as f32),
                mask: Array2::from_elem(dim, true),
            },
            vfs: Array2::from_elem(dim, 1.0),
            boundaries: Vec::new(),
            segmentation: AreaSegmentation {
                labels: Array2::zeros(dim),
                regions: Vec::new(),
            },
        }
    }

    #[test]
    fn normalization_spans_full_byte_range() {
        let plane = Array2::from_shape_fn((2, 4), |(_, x)| x as f32);
        let bytes = normalize_plane(&plane);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[3], 255);
    }

    #[test]
    fn flat_plane_renders_as_zeros() {
        let plane = Array2::from_elem((3, 3), 7.5f32);
        assert!(normalize_plane(&plane).iter().all(|&b| b == 0));
    }

    #[test]
    fn publishes_four_stacked_planes() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(
            FrameChannel::create(&dir.path().join("analysis.ring"), 2, 8, 24, 1).unwrap(),
        );
        let renderer = AnalysisRenderer::new(Arc::clone(&channel));

        renderer.publish(&products(6, 8)).unwrap();
        let frame = channel.read_latest().unwrap().unwrap();
        assert_eq!(frame.byte_len(), 8 * 24);
        assert_eq!(frame.width, 8);

        // Geometry mismatch is a reported configuration error.
        assert!(renderer.publish(&products(4, 4)).is_err());
    }
}
