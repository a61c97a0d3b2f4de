//! Dimensionless vector helpers shared by planning and step generation.

/// Euclidean length of `v`.
pub fn magnitude(v: &[f64]) -> f64 {
    v.iter().map(|c| c * c).sum::<f64>().sqrt()
}

/// Scale `v` to unit length and return its original magnitude.
///
/// A zero vector is left untouched and `0.0` is returned, so callers can
/// detect moves with no direction.
pub fn normalise(v: &mut [f64]) -> f64 {
    let m = magnitude(v);
    if m <= 0.0 {
        return 0.0;
    }
    for c in v.iter_mut() {
        *c /= m;
    }
    m
}

/// Fold `v` into the positive hyperquadrant.
pub fn absolute(v: &mut [f64]) {
    for c in v.iter_mut() {
        *c = c.abs();
    }
}

/// Given a unit vector in the positive hyperquadrant, return the factor
/// it must be scaled by to touch the axis-aligned box `limits`.
///
/// This is how a per-axis limit (speed, acceleration) turns into a limit
/// along the direction of travel: the tightest axis wins.
pub fn box_intersection(v: &[f64], limits: &[f64]) -> f64 {
    debug_assert_eq!(v.len(), limits.len());

    // Anything longer than the box diagonal is guaranteed to leave the box
    let bigger_than_diagonal = 2.0 * magnitude(limits);
    let mut scale = bigger_than_diagonal;
    for (&component, &limit) in v.iter().zip(limits) {
        if bigger_than_diagonal * component > limit {
            let a = limit / component;
            if a < scale {
                scale = a;
            }
        }
    }
    scale
}
