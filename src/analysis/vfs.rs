//! Spatial gradients and the visual-field-sign map.
//!
//! The sign map distinguishes mirror from non-mirror cortical
//! representations: at each pixel it is the sine of the angle between the
//! azimuth and elevation gradient vectors, i.e. the normalized cross
//! product
//!
//! ```text
//! vfs = (d_az/dx * d_el/dy - d_az/dy * d_el/dx) / (|grad az| * |grad el|)
//! ```
//!
//! with values in `[-1, 1]`. Pixels whose gradient-magnitude product falls
//! below a configurable threshold carry no reliable orientation and are
//! zeroed to suppress noise.

use ndarray::Array2;

/// Discrete spatial gradient of one map.
#[derive(Debug, Clone)]
pub struct GradientField {
    /// Partial derivative along x (columns).
    pub dx: Array2<f32>,
    /// Partial derivative along y (rows).
    pub dy: Array2<f32>,
}

/// Finite-difference gradient: central differences in the interior,
/// one-sided at the edges.
pub fn compute_gradients(map: &Array2<f32>) -> GradientField {
    let (rows, cols) = map.dim();
    let mut dx = Array2::<f32>::zeros((rows, cols));
    let mut dy = Array2::<f32>::zeros((rows, cols));

    for y in 0..rows {
        for x in 0..cols {
            dx[(y, x)] = if cols == 1 {
                0.0
            } else if x == 0 {
                map[(y, 1)] - map[(y, 0)]
            } else if x == cols - 1 {
                map[(y, x)] - map[(y, x - 1)]
            } else {
                (map[(y, x + 1)] - map[(y, x - 1)]) / 2.0
            };

            dy[(y, x)] = if rows == 1 {
                0.0
            } else if y == 0 {
                map[(1, x)] - map[(0, x)]
            } else if y == rows - 1 {
                map[(y, x)] - map[(y - 1, x)]
            } else {
                (map[(y + 1, x)] - map[(y - 1, x)]) / 2.0
            };
        }
    }

    GradientField { dx, dy }
}

/// Compute the visual-field-sign map from the two gradient fields.
///
/// `threshold` is the minimum gradient-magnitude product below which a
/// pixel is considered noise and set to 0.
pub fn compute_vfs(
    azimuth: &GradientField,
    elevation: &GradientField,
    threshold: f32,
) -> Array2<f32> {
    let dim = azimuth.dx.dim();
    debug_assert_eq!(dim, elevation.dx.dim());

    let mut vfs = Array2::<f32>::zeros(dim);
    for y in 0..dim.0 {
        for x in 0..dim.1 {
            let (ax, ay) = (azimuth.dx[(y, x)], azimuth.dy[(y, x)]);
            let (ex, ey) = (elevation.dx[(y, x)], elevation.dy[(y, x)]);
            let cross = ax * ey - ay * ex;
            let norm = (ax * ax + ay * ay).sqrt() * (ex * ex + ey * ey).sqrt();
            vfs[(y, x)] = if norm >= threshold && norm > 0.0 {
                (cross / norm).clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }
    }
    vfs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_of_linear_ramp_is_constant() {
        let map = Array2::from_shape_fn((5, 7), |(y, x)| 2.0 * x as f32 + 3.0 * y as f32);
        let grad = compute_gradients(&map);
        assert!(grad.dx.iter().all(|&v| (v - 2.0).abs() < 1e-6));
        assert!(grad.dy.iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn orthogonal_ramps_give_unit_sign() {
        // Azimuth grows along x, elevation along y: right-handed frame,
        // vfs = +1 everywhere above threshold.
        let azimuth = compute_gradients(&Array2::from_shape_fn((6, 6), |(_, x)| x as f32));
        let elevation = compute_gradients(&Array2::from_shape_fn((6, 6), |(y, _)| y as f32));
        let vfs = compute_vfs(&azimuth, &elevation, 1e-3);
        assert!(vfs.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn mirrored_azimuth_flips_the_sign() {
        let azimuth = compute_gradients(&Array2::from_shape_fn((6, 6), |(_, x)| -(x as f32)));
        let elevation = compute_gradients(&Array2::from_shape_fn((6, 6), |(y, _)| y as f32));
        let vfs = compute_vfs(&azimuth, &elevation, 1e-3);
        assert!(vfs.iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn values_stay_in_unit_range_and_noise_is_zeroed() {
        let azimuth = compute_gradients(&Array2::from_shape_fn((8, 8), |(y, x)| {
            (x as f32 * 0.7).sin() + y as f32 * 0.1
        }));
        let flat = compute_gradients(&Array2::from_elem((8, 8), 1.0));
        let vfs = compute_vfs(&azimuth, &flat, 1e-3);
        // A flat elevation map has no gradient: everything below threshold.
        assert!(vfs.iter().all(|&v| v == 0.0));

        let elevation = compute_gradients(&Array2::from_shape_fn((8, 8), |(y, _)| y as f32));
        let vfs = compute_vfs(&azimuth, &elevation, 1e-3);
        assert!(vfs.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }
}
