use std::time::Duration;

use comms::{
    Collective, LocalCollective, TcpCollective, barrier,
    specs::{TrainingSpec, WorkerSpec},
};
use log::{debug, info, warn};
use machine_learning::{arch::ShardLayout, dataset::SparseSamples};
use ndarray::Array3;

use crate::{
    Result, WorkerErr,
    data::{self, DataLoader},
    driver::{StepDriver, StepOutput},
    result::{ShardHandle, WorkerResult},
    store::ShardStore,
};

/// One worker of a distributed run.
pub struct Worker {
    spec: WorkerSpec,
    store: ShardStore,
}

impl Worker {
    /// Creates a new `Worker`.
    ///
    /// # Arguments
    /// * `spec` - Everything the worker needs: cluster, training and device assignment.
    pub fn new(spec: WorkerSpec) -> Self {
        let store = ShardStore::new(&spec.data_dir);
        Self { spec, store }
    }

    /// Runs the worker to completion and reports how it went.
    ///
    /// # Returns
    /// A `WorkerResult` for the launcher; failures are folded into its status.
    pub async fn run(self) -> WorkerResult {
        let task_id = self.spec.task_id();

        match self.try_run().await {
            Ok(handle) => WorkerResult::succeeded(task_id, handle),
            Err(e) => {
                warn!(task_id = task_id, error:% = e; "worker failed");
                WorkerResult::failed(task_id, e.to_string())
            }
        }
    }

    /// Generates or restores the dataset shard, trains over the collective group and
    /// persists the output shard.
    ///
    /// # Returns
    /// Where the shards were left.
    pub async fn try_run(&self) -> Result<ShardHandle> {
        let spec = &self.spec;
        let training = &spec.training;
        let task_id = spec.task_id();
        let worker_count = spec.worker_count();

        info!(
            task_id = task_id,
            worker_count = worker_count,
            devices:% = spec.visible_devices_env();
            "worker starting"
        );
        debug!(task_id = task_id, cluster:% = spec.cluster.to_tf_config(); "cluster spec");

        let samples = data::generate_or_restore(spec, &self.store)?;

        let timeout = Duration::from_millis(spec.connect_timeout_ms);
        let collective = TcpCollective::connect(&spec.cluster, timeout).await?;

        let layout = ShardLayout::new(
            training.vocabulary_size_per_device,
            worker_count,
            spec.local_device_count,
            task_id,
        );
        let mut driver = StepDriver::new(collective, training, layout, spec.local_device_count)?;

        let batch_size = training.local_batch_size(worker_count);
        let outputs = match train(&mut driver, training, samples, batch_size).await {
            Ok(outputs) => outputs,
            Err(e) => {
                driver.abort(&e).await;
                return Err(e);
            }
        };

        let views: Vec<_> = outputs.iter().map(|o| o.embedding_vector.view()).collect();
        let output_path = self.store.save_outputs(task_id, &views)?;

        // No rank reads the shards of the others before every shard is on disk.
        barrier(driver.collective_mut()).await?;
        driver.shutdown().await?;

        info!(task_id = task_id, path:% = output_path.display(); "worker done");

        Ok(ShardHandle {
            dataset: self.store.dataset_path(task_id),
            outputs: output_path,
            iterations: outputs.len(),
        })
    }
}

/// Runs `training.iterations` steps over the batches of `samples`.
///
/// # Arguments
/// * `driver` - The step driver.
/// * `training` - The run's training spec.
/// * `samples` - Every sample this rank trains on, in iteration order.
/// * `batch_size` - The amount of samples this rank feeds per step.
///
/// # Returns
/// The output of every step.
pub async fn train<C: Collective>(
    driver: &mut StepDriver<C>,
    training: &TrainingSpec,
    samples: SparseSamples,
    batch_size: usize,
) -> Result<Vec<StepOutput>> {
    let mut loader = DataLoader::spawn(samples, batch_size, training.prefetch);
    let mut outputs = Vec::with_capacity(training.iterations);

    for iteration in 0..training.iterations {
        let batch = loader
            .next_batch()
            .await
            .ok_or(WorkerErr::LoaderStopped { iteration })?;

        let output = driver.step(&batch).await?;
        info!(
            rank = driver.collective_mut().rank(),
            iteration = iteration,
            loss = output.loss;
            "iteration done"
        );
        outputs.push(output);
    }

    Ok(outputs)
}

/// Runs the same training single-process, over the whole global batch on one device.
///
/// # Arguments
/// * `training` - The run's training spec.
/// * `total_devices` - The amount of devices of the distributed run, which sizes the
///   vocabulary.
/// * `samples` - The global dataset, `iterations * global_batch_size` samples.
///
/// # Returns
/// The `[global_batch, slots, dim]` embedding vector of every iteration.
pub async fn run_reference(
    training: &TrainingSpec,
    total_devices: usize,
    samples: SparseSamples,
) -> Result<Vec<Array3<f32>>> {
    let layout = ShardLayout::single(training.vocabulary_size(total_devices));
    let mut driver = StepDriver::new(LocalCollective, training, layout, 1)?;

    let outputs = train(&mut driver, training, samples, training.global_batch_size).await?;
    Ok(outputs.into_iter().map(|o| o.embedding_vector).collect())
}
