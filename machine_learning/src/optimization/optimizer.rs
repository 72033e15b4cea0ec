use crate::{
    Result,
    arch::{EmbeddingVariable, SparseGrad},
};

/// Updates a dense parameter tensor in place.
pub trait Optimizer: Send {
    /// Makes one update step.
    ///
    /// # Arguments
    /// * `params` - The parameters that are going to be modified.
    /// * `grad` - The gradient of the loss with respect to `params`.
    ///
    /// # Returns
    /// An error if both slices differ in length.
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;
}

/// Updates the owned rows of an embedding variable.
pub trait EmbeddingOptimizer: Send {
    /// Whether `apply` takes every worker's raw contribution and merges them itself. When
    /// `false` the caller coalesces the contributions and passes a single gradient.
    fn aggregates_gradients(&self) -> bool;

    /// Makes one update step. Rows of keys the variable doesn't own are ignored.
    ///
    /// # Arguments
    /// * `variable` - The embedding shard to update.
    /// * `grads` - The gradient contributions of this step.
    fn apply(&mut self, variable: &mut EmbeddingVariable, grads: &[SparseGrad]) -> Result<()>;
}
