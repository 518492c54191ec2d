//! Bidirectional combination of opposing sweep phases.
//!
//! Sweeping the same axis in both directions encodes visual-field position
//! with opposite sign while the hemodynamic delay enters both phases with
//! the same sign. Averaging the unwrapped difference therefore cancels the
//! delay term:
//!
//! ```text
//! position = wrap(phase_forward - phase_reverse) / 2
//! ```
//!
//! The combination requires exactly one LR+RL pair and one TB+BT pair;
//! anything less is a reported configuration error, never a partial result.

use ndarray::Array2;
use std::collections::HashMap;
use std::f32::consts::PI;

use crate::analysis::fourier::PhaseAmplitude;
use crate::core::Direction;
use crate::error::{IsiError, IsiResult};

/// Combined azimuth/elevation position maps.
#[derive(Debug, Clone)]
pub struct RetinotopicMap {
    /// Horizontal visual-field position per pixel, radians.
    pub azimuth: Array2<f32>,
    /// Vertical visual-field position per pixel, radians.
    pub elevation: Array2<f32>,
    /// True where both contributing directions carried a usable response.
    pub mask: Array2<bool>,
}

/// Wrap an angle into the principal range `(-pi, pi]`.
pub fn wrap_phase(angle: f32) -> f32 {
    let mut wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    }
    wrapped
}

/// Combine one opposing-direction phase pair into a position map.
///
/// The per-pixel difference is unwrapped into the principal range before
/// halving, so a shared delay of any magnitude cancels exactly. Feeding the
/// same map as both arguments yields an all-zero result.
pub fn bidirectional_combine(
    forward: &PhaseAmplitude,
    reverse: &PhaseAmplitude,
) -> IsiResult<Array2<f32>> {
    if forward.phase.dim() != reverse.phase.dim() {
        return Err(IsiError::Configuration(format!(
            "opposing phase maps disagree on geometry: {:?} vs {:?}",
            forward.phase.dim(),
            reverse.phase.dim()
        )));
    }

    let mut combined = forward.phase.clone();
    ndarray::Zip::from(&mut combined)
        .and(&reverse.phase)
        .for_each(|c, &pr| *c = wrap_phase(*c - pr) / 2.0);
    Ok(combined)
}

/// Build the full retinotopic map from the four per-direction results.
///
/// Exactly one LR+RL pair and one TB+BT pair are required; a missing
/// direction aborts the operation with a configuration error.
pub fn retinotopic_map(
    maps: &HashMap<Direction, PhaseAmplitude>,
) -> IsiResult<RetinotopicMap> {
    let missing: Vec<&str> = Direction::ALL
        .iter()
        .filter(|d| !maps.contains_key(d))
        .map(Direction::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(IsiError::Configuration(format!(
            "bidirectional combination needs all four directions; missing: {}",
            missing.join(", ")
        )));
    }

    // Presence checked above.
    let lr = &maps[&Direction::LR];
    let rl = &maps[&Direction::RL];
    let tb = &maps[&Direction::TB];
    let bt = &maps[&Direction::BT];

    let azimuth = bidirectional_combine(lr, rl)?;
    let elevation = bidirectional_combine(tb, bt)?;
    if azimuth.dim() != elevation.dim() {
        return Err(IsiError::Configuration(
            "azimuth and elevation maps disagree on geometry".into(),
        ));
    }

    let mut mask = Array2::from_elem(azimuth.dim(), true);
    for (out, (((&a, &b), &c), &d)) in mask.iter_mut().zip(
        lr.mask
            .iter()
            .zip(rl.mask.iter())
            .zip(tb.mask.iter())
            .zip(bt.mask.iter()),
    ) {
        *out = a && b && c && d;
    }

    Ok(RetinotopicMap {
        azimuth,
        elevation,
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn maps_from(phase: Array2<f32>) -> PhaseAmplitude {
        let dim = phase.dim();
        PhaseAmplitude {
            phase,
            amplitude: Array2::from_elem(dim, 1.0),
            mask: Array2::from_elem(dim, true),
        }
    }

    #[test]
    fn wrap_phase_stays_in_principal_range() {
        for angle in [-10.0f32, -PI, -0.1, 0.0, 0.1, PI, 10.0, 100.0] {
            let w = wrap_phase(angle);
            assert!(w > -PI - 1e-6 && w <= PI + 1e-6, "{angle} -> {w}");
            // Wrapping preserves the angle modulo 2*pi.
            assert!(((angle - w).rem_euclid(2.0 * PI)).abs() < 1e-4 ||
                    ((angle - w).rem_euclid(2.0 * PI) - 2.0 * PI).abs() < 1e-4);
        }
    }

    #[test]
    fn identical_inputs_combine_to_zero() {
        // Symmetric input must yield an all-zero map after unwrapping.
        let phase = Array2::from_shape_fn((6, 8), |(y, x)| (x as f32 - y as f32) * 0.3);
        let forward = maps_from(phase.clone());
        let reverse = maps_from(phase);

        let combined = bidirectional_combine(&forward, &reverse).unwrap();
        assert!(combined.iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn shared_delay_cancels() {
        let position = Array2::from_shape_fn((4, 10), |(_, x)| (x as f32 / 10.0 - 0.5) * 2.0);
        let delay = 0.9f32;

        let forward = maps_from(position.mapv(|p| wrap_phase(p + delay)));
        let reverse = maps_from(position.mapv(|p| wrap_phase(-p + delay)));

        let combined = bidirectional_combine(&forward, &reverse).unwrap();
        for (c, &p) in combined.iter().zip(position.iter()) {
            assert!((c - p).abs() < 1e-5, "{c} vs {p}");
        }
    }

    #[test]
    fn missing_direction_reports_configuration_error() {
        let phase = Array2::zeros((4, 4));
        let mut maps = HashMap::new();
        maps.insert(Direction::LR, maps_from(phase.clone()));
        maps.insert(Direction::RL, maps_from(phase.clone()));
        maps.insert(Direction::TB, maps_from(phase));
        // BT missing: 3 of 4 directions present.
        let err = retinotopic_map(&maps);
        match err {
            Err(IsiError::Configuration(message)) => assert!(message.contains("bt")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn geometry_mismatch_is_rejected() {
        let forward = maps_from(Array2::zeros((4, 4)));
        let reverse = maps_from(Array2::zeros((4, 5)));
        assert!(bidirectional_combine(&forward, &reverse).is_err());
    }
}
