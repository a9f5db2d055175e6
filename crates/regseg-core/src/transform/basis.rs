use nalgebra::Vector3;

/// Radius of the basis support in normalized units.
pub const SUPPORT: f64 = 2.0;

/// Radial cubic B-spline kernel evaluated on the normalized distance `w`.
#[inline]
pub fn cubic_weight(w: f64) -> f64 {
    let w = w.abs();
    if w < 1.0 {
        (4.0 - 6.0 * w * w + 3.0 * w * w * w) / 6.0
    } else if w < SUPPORT {
        let r = SUPPORT - w;
        r * r * r / 6.0
    } else {
        0.0
    }
}

/// Distance between a sample and a control point normalized by half the grid spacing.
#[inline]
pub fn normalized_distance(offset: &Vector3<f64>, spacing: &Vector3<f64>) -> f64 {
    offset.component_div(&(spacing * 0.5)).norm()
}

/// Weight of the control point at `offset` from a sample, for a grid with `spacing`.
#[inline]
pub fn weight(offset: &Vector3<f64>, spacing: &Vector3<f64>) -> f64 {
    cubic_weight(normalized_distance(offset, spacing))
}
