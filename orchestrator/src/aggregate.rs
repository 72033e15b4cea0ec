//! Rebuilds the global dataset and output out of the worker shards and checks the
//! distributed run against a single process run over the same data.

use comms::specs::TrainingSpec;
use log::info;
use machine_learning::{MlErr, dataset::SparseSamples};
use ndarray::{Array3, Axis, concatenate};
use serde::{Deserialize, Serialize};
use worker::{ShardStore, WorkerErr};

use crate::{
    compare::{self, Tolerance},
    error::OrchestratorError,
};

/// The outcome of a cross validated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub worker_count: usize,
    pub iterations: usize,
    /// The largest absolute difference to the reference, per iteration.
    pub max_abs_diff: Vec<f32>,
}

impl RunReport {
    /// The largest absolute difference over the whole run.
    pub fn max_abs_diff(&self) -> f32 {
        self.max_abs_diff.iter().copied().fold(0., f32::max)
    }
}

/// Reads the shards every worker left behind.
#[derive(Debug, Clone)]
pub struct Aggregator {
    store: ShardStore,
    training: TrainingSpec,
    worker_count: usize,
    total_devices: usize,
    tolerance: Tolerance,
}

impl Aggregator {
    /// Creates a new `Aggregator`.
    ///
    /// # Arguments
    /// * `store` - Where the shards live.
    /// * `training` - The training spec the workers ran.
    /// * `worker_count` - The amount of workers, hence of shards.
    /// * `total_devices` - The amount of devices across every worker.
    pub fn new(
        store: ShardStore,
        training: TrainingSpec,
        worker_count: usize,
        total_devices: usize,
    ) -> Self {
        Self {
            store,
            training,
            worker_count,
            total_devices,
            tolerance: Tolerance::default(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn local_batch_size(&self) -> usize {
        self.training.local_batch_size(self.worker_count)
    }

    /// Concatenates the dataset shards, iteration by iteration, in task id order.
    pub fn global_dataset(&self) -> Result<SparseSamples, OrchestratorError> {
        let shards = (0..self.worker_count)
            .map(|task_id| self.store.load_dataset(task_id))
            .collect::<Result<Vec<_>, _>>()?;

        interleave_samples(&shards, self.training.iterations, self.local_batch_size())
    }

    /// Concatenates the output shards, iteration by iteration, in task id order.
    pub fn global_outputs(&self) -> Result<Vec<Array3<f32>>, OrchestratorError> {
        let shards = (0..self.worker_count)
            .map(|task_id| self.store.load_outputs(task_id))
            .collect::<Result<Vec<_>, _>>()?;

        interleave_outputs(&shards, self.training.iterations)
    }

    /// Runs the reference over the global dataset and compares it with the global output.
    ///
    /// Only reads the shards, so it can run any number of times over the same files.
    pub async fn cross_validate(&self) -> Result<RunReport, OrchestratorError> {
        let distributed = self.global_outputs()?;
        let dataset = self.global_dataset()?;

        info!(
            samples = dataset.len(),
            iterations = self.training.iterations;
            "running the reference"
        );
        let reference =
            worker::run_reference(&self.training, self.total_devices, dataset).await?;

        let max_abs_diff = compare::compare_runs(
            &distributed,
            &reference,
            self.training.iterations,
            self.tolerance,
        )?;

        for (iteration, diff) in max_abs_diff.iter().enumerate() {
            info!(iteration = iteration, max_abs_diff = diff; "iteration matches the reference");
        }

        Ok(RunReport {
            worker_count: self.worker_count,
            iterations: self.training.iterations,
            max_abs_diff,
        })
    }
}

/// Builds the global batches out of the worker shards.
///
/// # Arguments
/// * `shards` - One dataset shard per worker, in task id order.
/// * `iterations` - The amount of batches in every shard.
/// * `local_batch_size` - The amount of samples per batch of a shard.
///
/// # Returns
/// `iterations` global batches, back to back, batch `i` being every shard's batch `i`.
pub fn interleave_samples(
    shards: &[SparseSamples],
    iterations: usize,
    local_batch_size: usize,
) -> Result<SparseSamples, OrchestratorError> {
    let expected = iterations * local_batch_size;
    for (task_id, shard) in shards.iter().enumerate() {
        if shard.len() != expected {
            return Err(OrchestratorError::LengthMismatch {
                what: format!("dataset shard of worker {task_id}"),
                expected,
                got: shard.len(),
            });
        }
    }

    let mut batches = Vec::with_capacity(iterations * shards.len());
    for i in 0..iterations {
        for shard in shards {
            batches.push(shard.batch(i, local_batch_size).map_err(WorkerErr::from)?);
        }
    }

    SparseSamples::concat(&batches).map_err(|e| WorkerErr::from(e).into())
}

/// Builds the global output of every iteration out of the worker output shards.
///
/// # Arguments
/// * `shards` - The per-iteration outputs of every worker, in task id order.
/// * `iterations` - The amount of iterations every shard must hold.
pub fn interleave_outputs(
    shards: &[Vec<Array3<f32>>],
    iterations: usize,
) -> Result<Vec<Array3<f32>>, OrchestratorError> {
    for (task_id, shard) in shards.iter().enumerate() {
        if shard.len() != iterations {
            return Err(OrchestratorError::LengthMismatch {
                what: format!("output shard of worker {task_id}"),
                expected: iterations,
                got: shard.len(),
            });
        }
    }

    (0..iterations)
        .map(|i| {
            let views: Vec<_> = shards.iter().map(|shard| shard[i].view()).collect();

            if let Some(first) = views.first() {
                let rows = &first.shape()[1..];
                if let Some(other) = views.iter().find(|v| &v.shape()[1..] != rows) {
                    return Err(OrchestratorError::ShapeMismatch {
                        iteration: i,
                        got: other.shape().to_vec(),
                        expected: first.shape().to_vec(),
                    });
                }
            }

            concatenate(Axis(0), &views)
                .map_err(|e| WorkerErr::from(MlErr::from(e)).into())
        })
        .collect()
}
