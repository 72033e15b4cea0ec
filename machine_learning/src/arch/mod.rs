pub mod activations;
pub mod embedding;
pub mod layers;
pub mod loss;
mod model;
mod variables;

pub use embedding::{EmbeddingVariable, LookupTable, ShardLayout, SparseGrad};
pub use model::{DemoModel, ReplicaPass};
pub use variables::{DenseVariable, Trainable, VariablePartition, partition};
