mod adam;
mod gradient_descent;
mod optimizer;
mod sparse;

use comms::specs::OptimizerKind;

pub use adam::{Adam, AdamConfig};
pub use gradient_descent::GradientDescent;
pub use optimizer::{EmbeddingOptimizer, Optimizer};
pub use sparse::{SparseAdam, SparseGradientDescent};

use crate::arch::DenseVariable;

/// Builds one dense optimizer per variable, in the same order.
///
/// # Arguments
/// * `kind` - The optimizer choice of the run.
/// * `learning_rate` - The learning rate.
/// * `variables` - The dense variables to optimize.
pub fn dense_optimizers(
    kind: OptimizerKind,
    learning_rate: f32,
    variables: &[DenseVariable],
) -> Vec<Box<dyn Optimizer>> {
    variables
        .iter()
        .map(|variable| -> Box<dyn Optimizer> {
            match kind {
                OptimizerKind::Sgd => Box::new(GradientDescent::new(learning_rate)),
                OptimizerKind::Adam | OptimizerKind::PluginAdam => Box::new(Adam::new(
                    variable.len(),
                    AdamConfig::with_learning_rate(learning_rate),
                )),
            }
        })
        .collect()
}

/// Builds the optimizer of the embedding variable.
pub fn embedding_optimizer(kind: OptimizerKind, learning_rate: f32) -> Box<dyn EmbeddingOptimizer> {
    let config = AdamConfig::with_learning_rate(learning_rate);

    match kind {
        OptimizerKind::Sgd => Box::new(SparseGradientDescent::new(learning_rate)),
        OptimizerKind::Adam | OptimizerKind::PluginAdam => Box::new(SparseAdam::new(
            config,
            kind.aggregates_embedding_gradients(),
        )),
    }
}
