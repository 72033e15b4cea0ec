pub mod cluster;
pub mod training;
pub mod worker;

pub use cluster::{ClusterSpec, TaskSpec};
pub use training::{Combiner, EmbeddingInit, OptimizerKind, TrainingSpec};
pub use worker::WorkerSpec;
