//! Fourier analysis pipeline.
//!
//! Runs once per completed acquisition session:
//!
//! 1. per-direction phase/amplitude extraction ([`fourier`])
//! 2. bidirectional combination into azimuth/elevation ([`retinotopy`])
//! 3. spatial gradients and the visual-field-sign map ([`vfs`])
//! 4. sign-reversal boundaries and area segmentation ([`segmentation`])
//! 5. visualization layers on the analysis channel ([`renderer`])
//!
//! [`run_pipeline`] composes the stages; the [`worker`] wraps it in an
//! offloaded job with a status surface.

use ndarray::Array2;
use std::collections::HashMap;
use tracing::info;

use crate::acquisition::session::DirectionDataset;
use crate::config::AnalysisSettings;
use crate::core::Direction;
use crate::error::IsiResult;

pub mod backend;
pub mod fourier;
pub mod renderer;
pub mod retinotopy;
pub mod segmentation;
pub mod vfs;
pub mod worker;

pub use backend::{ComputeBackend, IntensityStack};
pub use fourier::{compute_phase_amplitude, PhaseAmplitude};
pub use renderer::AnalysisRenderer;
pub use retinotopy::{bidirectional_combine, retinotopic_map, wrap_phase, RetinotopicMap};
pub use segmentation::{detect_boundaries, segment_areas, AreaSegmentation, Boundary, Region};
pub use vfs::{compute_gradients, compute_vfs, GradientField};
pub use worker::{AnalysisStatus, AnalysisWorker};

/// Everything one pipeline run produces.
#[derive(Debug, Clone)]
pub struct AnalysisProducts {
    /// Phase/amplitude maps per direction.
    pub per_direction: HashMap<Direction, PhaseAmplitude>,
    /// Combined azimuth/elevation maps.
    pub retinotopy: RetinotopicMap,
    /// Visual-field-sign map, values in `[-1, 1]`.
    pub vfs: Array2<f32>,
    /// Sign-reversal contours.
    pub boundaries: Vec<Boundary>,
    /// Labeled cortical areas.
    pub segmentation: AreaSegmentation,
}

/// Run the full pipeline over the per-direction datasets of one session.
///
/// `progress` is invoked with a short stage name as each stage begins.
pub fn run_pipeline(
    datasets: &[DirectionDataset],
    stimulus_frequency_hz: f64,
    sample_rate_hz: f64,
    settings: &AnalysisSettings,
    backend: &dyn ComputeBackend,
    progress: &mut dyn FnMut(&str),
) -> IsiResult<AnalysisProducts> {
    progress("fourier");
    let mut per_direction = HashMap::new();
    for dataset in datasets {
        let maps = compute_phase_amplitude(
            dataset,
            stimulus_frequency_hz,
            sample_rate_hz,
            backend,
        )?;
        per_direction.insert(dataset.direction, maps);
    }

    progress("combine");
    let retinotopy = retinotopic_map(&per_direction)?;

    progress("gradients");
    let azimuth_gradients = compute_gradients(&retinotopy.azimuth);
    let elevation_gradients = compute_gradients(&retinotopy.elevation);

    progress("sign_map");
    let vfs_map = compute_vfs(
        &azimuth_gradients,
        &elevation_gradients,
        settings.vfs_threshold,
    );

    progress("boundaries");
    let boundaries = detect_boundaries(&vfs_map, settings.vfs_threshold);

    progress("segmentation");
    let segmentation = segment_areas(
        &vfs_map,
        &boundaries,
        settings.vfs_threshold,
        settings.min_area_px,
    );

    info!(
        directions = per_direction.len(),
        boundaries = boundaries.len(),
        regions = segmentation.regions.len(),
        "analysis pipeline complete"
    );

    Ok(AnalysisProducts {
        per_direction,
        retinotopy,
        vfs: vfs_map,
        boundaries,
        segmentation,
    })
}
