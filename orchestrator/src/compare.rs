use ndarray::{Array3, ArrayView3};

use crate::error::OrchestratorError;

/// How far apart two values may be: `|got - expected| <= atol + rtol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            atol: 1e-4,
            rtol: 1e-4,
        }
    }
}

impl Tolerance {
    /// Whether `got` is close enough to `expected`. `NaN` is never close.
    pub fn is_close(&self, got: f32, expected: f32) -> bool {
        (got - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Checks one iteration's output against the reference, element by element.
///
/// # Returns
/// The largest absolute difference, or the first element that is too far off.
pub fn assert_near(
    iteration: usize,
    got: ArrayView3<f32>,
    expected: ArrayView3<f32>,
    tolerance: Tolerance,
) -> Result<f32, OrchestratorError> {
    if got.len() != expected.len() {
        return Err(OrchestratorError::ShapeMismatch {
            iteration,
            got: got.shape().to_vec(),
            expected: expected.shape().to_vec(),
        });
    }

    let mut max_diff = 0f32;
    for (index, (&g, &e)) in got.iter().zip(expected.iter()).enumerate() {
        if !tolerance.is_close(g, e) {
            return Err(OrchestratorError::NumericMismatch {
                iteration,
                index,
                got: g,
                expected: e,
                atol: tolerance.atol,
                rtol: tolerance.rtol,
            });
        }
        max_diff = max_diff.max((g - e).abs());
    }

    Ok(max_diff)
}

/// Checks a whole distributed run against the reference run.
///
/// # Arguments
/// * `distributed` - The global output of every iteration.
/// * `reference` - The reference output of every iteration.
/// * `iterations` - The amount of iterations of the run.
/// * `tolerance` - How close every element must be.
///
/// # Returns
/// The largest absolute difference of every iteration.
pub fn compare_runs(
    distributed: &[Array3<f32>],
    reference: &[Array3<f32>],
    iterations: usize,
    tolerance: Tolerance,
) -> Result<Vec<f32>, OrchestratorError> {
    for (what, outputs) in [("distributed output", distributed), ("reference output", reference)] {
        if outputs.len() != iterations {
            return Err(OrchestratorError::LengthMismatch {
                what: what.to_string(),
                expected: iterations,
                got: outputs.len(),
            });
        }
    }

    distributed
        .iter()
        .zip(reference)
        .enumerate()
        .map(|(i, (got, expected))| assert_near(i, got.view(), expected.view(), tolerance))
        .collect()
}
