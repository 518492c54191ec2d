//! Temporal Fourier extraction of phase and amplitude maps.
//!
//! For each pixel, the frame sequence of one direction is treated as a time
//! series and its forward FFT evaluated at the bin nearest the stimulus
//! temporal frequency. With an integer number of sweep cycles in the record
//! this equals the single-frequency DFT; phase is `atan2(imag, real)` in
//! `[-pi, pi]` and amplitude is the bin modulus normalized to cosine
//! amplitude. Zero-amplitude pixels are masked instead of propagating NaN
//! downstream.

use ndarray::Array2;
use tracing::debug;

use crate::acquisition::session::DirectionDataset;
use crate::analysis::backend::{ComputeBackend, IntensityStack};
use crate::error::{IsiError, IsiResult};

/// Phase and amplitude maps for one direction, with a validity mask.
#[derive(Debug, Clone)]
pub struct PhaseAmplitude {
    /// Per-pixel response phase, `[-pi, pi]`; masked pixels are 0.
    pub phase: Array2<f32>,
    /// Per-pixel response amplitude, `>= 0`.
    pub amplitude: Array2<f32>,
    /// True where the pixel carries a usable response.
    pub mask: Array2<bool>,
}

/// Extract phase/amplitude maps from one direction dataset.
///
/// `stimulus_frequency_hz` is the temporal frequency of the sweep;
/// `sample_rate_hz` is the camera frame rate the series was recorded at.
pub fn compute_phase_amplitude(
    dataset: &DirectionDataset,
    stimulus_frequency_hz: f64,
    sample_rate_hz: f64,
    backend: &dyn ComputeBackend,
) -> IsiResult<PhaseAmplitude> {
    let stack = intensity_stack(dataset)?;
    let n = stack.len();

    let bin = (stimulus_frequency_hz * n as f64 / sample_rate_hz).round() as usize;
    if bin == 0 || bin > n / 2 {
        return Err(IsiError::Configuration(format!(
            "record of {n} frames at {sample_rate_hz} fps cannot resolve a {stimulus_frequency_hz} Hz stimulus"
        )));
    }
    debug!(
        direction = %dataset.direction,
        frames = n,
        bin,
        backend = backend.name(),
        "computing phase/amplitude maps"
    );

    let (phase_raw, amplitude_raw) = backend.phase_amplitude(&stack, bin);

    let mut phase = Vec::with_capacity(phase_raw.len());
    let mut amplitude = Vec::with_capacity(amplitude_raw.len());
    let mut mask = Vec::with_capacity(phase_raw.len());
    for (p, a) in phase_raw.into_iter().zip(amplitude_raw) {
        // Mask instead of propagating NaN from zero-amplitude pixels.
        if a.is_finite() && p.is_finite() && a > 0.0 {
            phase.push(p);
            amplitude.push(a);
            mask.push(true);
        } else {
            phase.push(0.0);
            amplitude.push(0.0);
            mask.push(false);
        }
    }

    let shape = (stack.height, stack.width);
    Ok(PhaseAmplitude {
        phase: Array2::from_shape_vec(shape, phase)
            .map_err(|e| IsiError::Configuration(e.to_string()))?,
        amplitude: Array2::from_shape_vec(shape, amplitude)
            .map_err(|e| IsiError::Configuration(e.to_string()))?,
        mask: Array2::from_shape_vec(shape, mask)
            .map_err(|e| IsiError::Configuration(e.to_string()))?,
    })
}

/// Convert a direction's frames to a time-major intensity stack, validating
/// geometry consistency.
fn intensity_stack(dataset: &DirectionDataset) -> IsiResult<IntensityStack> {
    let mut frames_iter = dataset.all_frames();
    let Some(first) = frames_iter.next() else {
        return Err(IsiError::Configuration(format!(
            "direction {} has no frames",
            dataset.direction
        )));
    };
    let (width, height) = (first.width as usize, first.height as usize);

    let mut frames = vec![first.intensity()];
    for frame in frames_iter {
        if frame.width as usize != width || frame.height as usize != height {
            return Err(IsiError::Configuration(format!(
                "direction {} mixes frame geometries ({}x{} vs {}x{})",
                dataset.direction, frame.width, frame.height, width, height
            )));
        }
        frames.push(frame.intensity());
    }
    if frames.len() < 4 {
        return Err(IsiError::Configuration(format!(
            "direction {} has only {} frames, too short for Fourier analysis",
            dataset.direction,
            frames.len()
        )));
    }

    Ok(IntensityStack {
        frames,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::backend::ScalarBackend;
    use crate::acquisition::session::CycleData;
    use crate::core::{Direction, Frame};
    use std::sync::Arc;

    /// Build a dataset whose pixel (x, y) responds at `cycles_in_record`
    /// cycles with phase `phase_of(x, y)`.
    pub(crate) fn synthetic_dataset(
        direction: Direction,
        width: u32,
        height: u32,
        frames_total: usize,
        cycles_in_record: usize,
        phase_of: impl Fn(u32, u32) -> f32,
    ) -> DirectionDataset {
        let mut frames = Vec::with_capacity(frames_total);
        for t in 0..frames_total {
            let omega =
                2.0 * std::f32::consts::PI * cycles_in_record as f32 * t as f32 / frames_total as f32;
            let mut pixels = Vec::with_capacity((width * height) as usize);
            for y in 0..height {
                for x in 0..width {
                    let value = 128.0 + 64.0 * (omega + phase_of(x, y)).cos();
                    pixels.push(value.clamp(0.0, 255.0) as u8);
                }
            }
            let buffer: Arc<[u8]> = pixels.into();
            frames.push(
                Frame::new(t as u64, t as i64 * 33_333, width, height, 1, buffer)
                    .expect("valid synthetic frame"),
            );
        }
        DirectionDataset {
            direction,
            cycles: vec![CycleData {
                frames,
                sync_records: Vec::new(),
            }],
        }
    }

    #[test]
    fn phase_in_principal_range_and_amplitude_nonnegative() {
        let dataset = synthetic_dataset(Direction::LR, 8, 6, 60, 2, |x, _| {
            (x as f32 / 8.0 - 0.5) * 3.0
        });
        // 60 frames at 30 fps holding 2 cycles -> stimulus at 1 Hz.
        let maps =
            compute_phase_amplitude(&dataset, 1.0, 30.0, &ScalarBackend).expect("pipeline ok");

        for &p in maps.phase.iter() {
            assert!((-std::f32::consts::PI..=std::f32::consts::PI).contains(&p));
        }
        for &a in maps.amplitude.iter() {
            assert!(a >= 0.0);
        }
        assert!(maps.mask.iter().all(|&m| m));
    }

    #[test]
    fn recovers_spatial_phase_ramp() {
        let phase_of = |x: u32, _| (x as f32 / 16.0 - 0.5) * 2.0;
        let dataset = synthetic_dataset(Direction::LR, 16, 4, 64, 4, phase_of);
        let maps =
            compute_phase_amplitude(&dataset, 2.0, 32.0, &ScalarBackend).expect("pipeline ok");

        for x in 0..16u32 {
            let measured = maps.phase[(1, x as usize)];
            assert!(
                (measured - phase_of(x, 1)).abs() < 0.05,
                "x={x}: {measured} vs {}",
                phase_of(x, 1)
            );
        }
    }

    #[test]
    fn empty_direction_is_a_config_error() {
        let dataset = DirectionDataset {
            direction: Direction::TB,
            cycles: Vec::new(),
        };
        let err = compute_phase_amplitude(&dataset, 1.0, 30.0, &ScalarBackend);
        assert!(matches!(err, Err(IsiError::Configuration(_))));
    }

    #[test]
    fn unresolvable_frequency_is_a_config_error() {
        let dataset = synthetic_dataset(Direction::LR, 4, 4, 8, 1, |_, _| 0.0);
        // 8 frames at 30 fps cannot resolve a 0.01 Hz stimulus (bin 0).
        let err = compute_phase_amplitude(&dataset, 0.01, 30.0, &ScalarBackend);
        assert!(matches!(err, Err(IsiError::Configuration(_))));
    }
}
