use std::{borrow::Cow, collections::HashMap};

use super::{AdamConfig, EmbeddingOptimizer};
use crate::{
    MlErr, Result,
    arch::{EmbeddingVariable, SparseGrad},
};

/// Merges the contributions of a step into one gradient.
///
/// # Arguments
/// * `aggregate` - Whether `grads` are raw contributions to coalesce, or a single gradient
///   the caller already coalesced.
/// * `grads` - The contributions.
fn merged(aggregate: bool, grads: &[SparseGrad]) -> Result<Cow<'_, SparseGrad>> {
    if aggregate {
        return SparseGrad::coalesce(grads).map(Cow::Owned);
    }

    match grads {
        [grad] => Ok(Cow::Borrowed(grad)),
        _ => Err(MlErr::SizeMismatch {
            what: "coalesced embedding gradients",
            got: grads.len(),
            expected: 1,
        }),
    }
}

/// Gradient descent over the touched rows of an embedding variable.
#[derive(Debug, Clone, Copy)]
pub struct SparseGradientDescent {
    learning_rate: f32,
}

impl SparseGradientDescent {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl EmbeddingOptimizer for SparseGradientDescent {
    fn aggregates_gradients(&self) -> bool {
        false
    }

    fn apply(&mut self, variable: &mut EmbeddingVariable, grads: &[SparseGrad]) -> Result<()> {
        let grad = merged(false, grads)?;
        let lr = self.learning_rate;

        for (key, row) in grad.rows() {
            if !variable.owns(key) {
                continue;
            }

            let mut param = variable.row_mut(key)?;
            param.iter_mut().zip(row).for_each(|(p, g)| *p -= lr * g);
        }

        Ok(())
    }
}

/// Lazy Adam: only the rows touched by a step get their moments and values updated, the
/// bias correction follows the global step count.
#[derive(Debug)]
pub struct SparseAdam {
    config: AdamConfig,
    aggregate: bool,
    beta1_t: f32,
    beta2_t: f32,
    moments: HashMap<i64, (Vec<f32>, Vec<f32>)>,
}

impl SparseAdam {
    /// Creates a new `SparseAdam`.
    ///
    /// # Arguments
    /// * `config` - The hyperparameters.
    /// * `aggregate` - Whether `apply` receives raw contributions and coalesces them itself.
    pub fn new(config: AdamConfig, aggregate: bool) -> Self {
        Self {
            config,
            aggregate,
            beta1_t: 1.,
            beta2_t: 1.,
            moments: HashMap::new(),
        }
    }
}

impl EmbeddingOptimizer for SparseAdam {
    fn aggregates_gradients(&self) -> bool {
        self.aggregate
    }

    fn apply(&mut self, variable: &mut EmbeddingVariable, grads: &[SparseGrad]) -> Result<()> {
        let grad = merged(self.aggregate, grads)?;
        let dim = variable.dim();

        self.beta1_t *= self.config.beta1;
        self.beta2_t *= self.config.beta2;
        let step_size = self.config.step_size(self.beta1_t, self.beta2_t);
        let config = self.config;

        for (key, row) in grad.rows() {
            if !variable.owns(key) {
                continue;
            }

            let (m, v) = self
                .moments
                .entry(key)
                .or_insert_with(|| (vec![0.; dim], vec![0.; dim]));

            let mut param = variable.row_mut(key)?;
            for (((p, &g), m), v) in param.iter_mut().zip(row).zip(m).zip(v) {
                config.update(step_size, p, g, m, v);
            }
        }

        Ok(())
    }
}
