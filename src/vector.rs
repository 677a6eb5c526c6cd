//! Vector utilities over 32-bit float embeddings.
//!
//! Embedding backends do not always return unit vectors, and the similarity
//! search contract assumes cosine distance over unit-L2 vectors, so every
//! vector is checked (and normalized if needed) before it reaches storage.
//! Magnitudes are accumulated in `f64` to keep the 1e-6 tolerance meaningful
//! for high-dimensional vectors.

use thiserror::Error;

/// Tolerance for the unit-length check: `| ‖v‖₂ − 1 | < 1e-6`.
const NORMALIZED_TOLERANCE: f64 = 1e-6;

/// Returned by [`dot`] when the operands have different lengths.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("vectors must have the same length")]
pub struct LengthMismatch;

/// Dot product of two vectors. Fails if lengths differ.
pub fn dot(a: &[f32], b: &[f32]) -> Result<f32, LengthMismatch> {
    if a.len() != b.len() {
        return Err(LengthMismatch);
    }

    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Returns `true` iff the L2 norm of `v` is 1 within [`NORMALIZED_TOLERANCE`].
pub fn is_normalized(v: &[f32]) -> bool {
    let sq_sum: f64 = v.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
    (sq_sum.sqrt() - 1.0).abs() < NORMALIZED_TOLERANCE
}

/// Divides every element by the L2 norm, in place.
///
/// The zero vector has no direction; it is returned untouched.
pub fn normalize_in_place(v: &mut [f32]) {
    let sq_sum: f32 = v.iter().map(|&x| x * x).sum();
    let norm = sq_sum.sqrt();
    if norm == 0.0 {
        return;
    }

    for x in v.iter_mut() {
        *x /= norm;
    }
}
