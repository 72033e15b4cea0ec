//! One synchronous data parallel training step.
//!
//! Every rank runs the same sequence of collectives per step:
//!
//! 1. gather the keys each rank needs, owners serve the rows, gather the rows;
//! 2. run every local replica's forward and backward pass;
//! 3. gather and sum the dense gradients, in rank order, and apply them;
//! 4. gather the sparse gradients and apply the rows this rank owns;
//! 5. gather the replica losses.
//!
//! The single process reference run is the same driver over a one rank group.

use comms::{Collective, all_gather, specs::TrainingSpec};
use log::{debug, warn};
use machine_learning::{
    MlErr,
    arch::{DemoModel, LookupTable, ReplicaPass, ShardLayout, SparseGrad, partition},
    dataset::SparseSamples,
    optimization::{self, EmbeddingOptimizer, Optimizer},
};
use ndarray::{Array2, Array3, Axis, concatenate};
use rayon::prelude::*;

use crate::{Result, WorkerErr};

/// What a step returns to the caller.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The `[local_batch, slots, dim]` embedding vector of this rank's replicas.
    pub embedding_vector: Array3<f32>,
    /// The `[local_batch, 1]` logits of this rank's replicas.
    pub logits: Array2<f32>,
    /// The loss of the whole step, summed over every rank.
    pub loss: f32,
}

/// Runs training steps over a collective group.
pub struct StepDriver<C: Collective> {
    collective: C,
    model: DemoModel,
    dense_optimizers: Vec<Box<dyn Optimizer>>,
    embedding_optimizer: Box<dyn EmbeddingOptimizer>,
    replicas: usize,
    iteration: usize,
}

impl<C: Collective> StepDriver<C> {
    /// Creates a new `StepDriver`.
    ///
    /// # Arguments
    /// * `collective` - The group of ranks taking part in every step.
    /// * `training` - The run's training spec.
    /// * `layout` - The vocabulary shard of this rank.
    /// * `replicas` - The amount of local devices, each running a slice of the local batch.
    pub fn new(
        collective: C,
        training: &TrainingSpec,
        layout: ShardLayout,
        replicas: usize,
    ) -> Result<Self> {
        let model = DemoModel::new(training, layout)?;
        let dense_optimizers = optimization::dense_optimizers(
            training.optimizer,
            training.learning_rate,
            model.dense_variables(),
        );
        let embedding_optimizer =
            optimization::embedding_optimizer(training.optimizer, training.learning_rate);

        Ok(Self {
            collective,
            model,
            dense_optimizers,
            embedding_optimizer,
            replicas: replicas.max(1),
            iteration: 0,
        })
    }

    pub fn model(&self) -> &DemoModel {
        &self.model
    }

    pub fn collective_mut(&mut self) -> &mut C {
        &mut self.collective
    }

    /// Runs one training step over this rank's part of the global batch.
    ///
    /// # Arguments
    /// * `batch` - The local batch, split evenly among the replicas.
    ///
    /// # Returns
    /// The embedding vector and logits of the local batch and the global loss.
    pub async fn step(&mut self, batch: &SparseSamples) -> Result<StepOutput> {
        let iteration = self.iteration;
        let rank = self.collective.rank();
        let dim = self.model.embedding().dim();

        let lookup = self.lookup(batch).await?;

        let model = &self.model;
        let passes = batch
            .as_batch()
            .split(self.replicas)?
            .into_par_iter()
            .map(|replica| model.forward_backward(&lookup, replica))
            .collect::<std::result::Result<Vec<ReplicaPass>, MlErr>>()?;

        let dense_grad = self.reduce_dense_grads(&passes).await?;

        let mut sparse = SparseGrad::new(dim);
        passes.iter().for_each(|p| sparse.extend(&p.sparse_grad));
        let contributions = self.gather_sparse_grads(&sparse).await?;

        self.apply(&dense_grad, &contributions)?;

        let local_loss: f32 = passes.iter().map(|p| p.loss).sum();
        let loss: f32 = all_gather(&mut self.collective, &[local_loss])
            .await?
            .iter()
            .flatten()
            .sum();

        let embedding_vector = concatenate(
            Axis(0),
            &passes
                .iter()
                .map(|p| p.embedding_vector.view())
                .collect::<Vec<_>>(),
        )
        .map_err(MlErr::from)?;
        let logits = concatenate(
            Axis(0),
            &passes.iter().map(|p| p.logits.view()).collect::<Vec<_>>(),
        )
        .map_err(MlErr::from)?;

        debug!(rank = rank, iteration = iteration, loss = loss; "step done");
        self.iteration += 1;

        Ok(StepOutput {
            embedding_vector,
            logits,
            loss,
        })
    }

    /// Collects the rows of every key `batch` references from the ranks owning them.
    async fn lookup(&mut self, batch: &SparseSamples) -> Result<LookupTable> {
        let requested = batch.as_batch().unique_keys();
        let mut wanted: Vec<i64> = all_gather(&mut self.collective, &requested)
            .await?
            .into_iter()
            .flatten()
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let embedding = self.model.embedding();
        let (keys, rows) = embedding.serve(&wanted)?;

        let served_keys = all_gather(&mut self.collective, &keys).await?;
        let served_rows = all_gather(&mut self.collective, &rows).await?;

        let mut lookup = LookupTable::new(embedding.dim());
        for (keys, rows) in served_keys.iter().zip(&served_rows) {
            lookup.insert(keys, rows)?;
        }

        Ok(lookup)
    }

    /// Sums the replica gradients, then the rank gradients in rank order.
    ///
    /// # Returns
    /// The flattened gradient of every dense variable, in model order.
    async fn reduce_dense_grads(&mut self, passes: &[ReplicaPass]) -> Result<Vec<f32>> {
        let len: usize = self.model.dense_variables().iter().map(|v| v.len()).sum();

        let mut local = vec![0.; len];
        for pass in passes {
            let flat = pass.dense_grads.iter().flatten();
            local.iter_mut().zip(flat).for_each(|(acc, g)| *acc += g);
        }

        let mut summed = vec![0.; len];
        for grad in all_gather(&mut self.collective, &local).await? {
            if grad.len() != len {
                return Err(WorkerErr::GradientLengthMismatch {
                    iteration: self.iteration,
                    got: grad.len(),
                    expected: len,
                });
            }
            summed.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
        }

        Ok(summed)
    }

    /// Shares every rank's raw sparse gradient.
    ///
    /// # Returns
    /// One contribution per rank when the embedding optimizer merges them itself, else
    /// the single coalesced gradient.
    async fn gather_sparse_grads(&mut self, local: &SparseGrad) -> Result<Vec<SparseGrad>> {
        let keys = all_gather(&mut self.collective, local.keys()).await?;
        let values = all_gather(&mut self.collective, local.values()).await?;

        let contributions = keys
            .into_iter()
            .zip(values)
            .map(|(keys, values)| SparseGrad::from_parts(local.dim(), keys, values))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if self.embedding_optimizer.aggregates_gradients() {
            return Ok(contributions);
        }

        Ok(vec![SparseGrad::coalesce(&contributions)?])
    }

    /// Routes the gradients to the optimizer of each variable kind.
    fn apply(&mut self, dense_grad: &[f32], contributions: &[SparseGrad]) -> Result<()> {
        let variables = partition(self.model.trainable_variables());

        for variable in variables.embedding {
            self.embedding_optimizer.apply(variable, contributions)?;
        }

        let mut offset = 0;
        for (variable, optimizer) in variables.dense.into_iter().zip(&mut self.dense_optimizers) {
            let grad = dense_grad
                .get(offset..offset + variable.len())
                .ok_or(WorkerErr::GradientLengthMismatch {
                    iteration: self.iteration,
                    got: dense_grad.len(),
                    expected: offset + variable.len(),
                })?;
            optimizer.update_params(variable.values_mut(), grad)?;
            offset += variable.len();
        }

        Ok(())
    }

    /// Tells the rest of the group this rank failed.
    pub async fn abort(&mut self, err: &WorkerErr) {
        warn!(rank = self.collective.rank(), error:% = err; "aborting the step driver");
        self.collective.abort(&err.to_string()).await;
    }

    /// Leaves the group.
    pub async fn shutdown(mut self) -> Result<()> {
        self.collective.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use comms::{
        LocalCollective,
        specs::{Combiner, OptimizerKind},
    };
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn training(optimizer: OptimizerKind) -> TrainingSpec {
        TrainingSpec {
            global_batch_size: 8,
            iterations: 3,
            slot_num: 2,
            max_nnz: 3,
            embedding_vec_size: 4,
            vocabulary_size_per_device: 16,
            combiner: Combiner::Sum,
            optimizer,
            hidden_units: vec![6],
            ..Default::default()
        }
    }

    fn batch() -> SparseSamples {
        let mut rng = StdRng::seed_from_u64(5);
        SparseSamples::generate(&mut rng, 8, 2, 3, 16).unwrap()
    }

    #[tokio::test]
    async fn replicas_do_not_change_the_result() {
        let training = training(OptimizerKind::Sgd);
        let batch = batch();

        let layout = ShardLayout::single(16);
        let mut one = StepDriver::new(LocalCollective, &training, layout, 1).unwrap();
        let mut four = StepDriver::new(LocalCollective, &training, layout, 4).unwrap();

        for _ in 0..3 {
            let a = one.step(&batch).await.unwrap();
            let b = four.step(&batch).await.unwrap();

            assert_eq!(a.embedding_vector.dim(), (8, 2, 4));
            assert!((a.loss - b.loss).abs() < 1e-5);
            for (x, y) in a.embedding_vector.iter().zip(&b.embedding_vector) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }

    #[tokio::test]
    async fn training_lowers_the_loss() {
        let training = TrainingSpec {
            learning_rate: 0.05,
            ..training(OptimizerKind::PluginAdam)
        };
        let batch = batch();
        let mut driver =
            StepDriver::new(LocalCollective, &training, ShardLayout::single(16), 1).unwrap();

        let first = driver.step(&batch).await.unwrap().loss;
        let mut last = first;
        for _ in 0..20 {
            last = driver.step(&batch).await.unwrap().loss;
        }

        assert!(last < first, "{last} >= {first}");
    }

    #[tokio::test]
    async fn uneven_replica_split_is_an_error() {
        let training = training(OptimizerKind::Adam);
        let batch = batch();
        let mut driver =
            StepDriver::new(LocalCollective, &training, ShardLayout::single(16), 3).unwrap();

        assert!(matches!(
            driver.step(&batch).await,
            Err(WorkerErr::Ml(MlErr::InvalidShape(_)))
        ));
    }
}
