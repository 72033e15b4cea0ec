pub mod aggregate;
pub mod compare;
pub mod configs;
pub mod error;
pub mod launcher;
pub mod topology;

use std::io;

use log::info;
use worker::{HostAddress, ShardStore, SystemHost, Worker};

pub use aggregate::{Aggregator, RunReport};
pub use configs::{Adapter, RunConfig};
pub use error::{OrchestratorError, WorkerFailure};
pub use launcher::{InProcessSpawner, ProcessSpawner, Spawner};
pub use topology::{DeviceInventory, FixedDevices, SystemDevices, Topology};

/// The machine a run is launched from.
pub struct Environment {
    pub host: Box<dyn HostAddress>,
    pub devices: Box<dyn DeviceInventory>,
    pub spawner: Box<dyn Spawner>,
}

impl Environment {
    /// This machine, with one process per local worker.
    pub fn system() -> io::Result<Self> {
        Ok(Self {
            host: Box::new(SystemHost),
            devices: Box::new(SystemDevices),
            spawner: Box::new(ProcessSpawner::current_exe()?),
        })
    }
}

/// Runs the distributed training and checks it against the single process reference.
///
/// When every worker is local, they are all launched from here and joined before the
/// shards are read. Otherwise this process is the worker its host address names in the
/// ip list, and every host checks the shards once the whole group is done.
///
/// # Arguments
/// * `config` - The run's config.
/// * `env` - The machine the run is launched from.
///
/// # Errors
/// Returns an `OrchestratorError` on an invalid config, a failed worker or a distributed
/// output that doesn't match the reference.
pub async fn run(config: &RunConfig, env: &Environment) -> Result<RunReport, OrchestratorError> {
    let adapter = Adapter::new();
    adapter.validate(config)?;

    let topology = topology::resolve(config, env.host.as_ref(), env.devices.as_ref())?;
    adapter.validate_devices(config, topology.devices_per_worker)?;

    let worker_count = config.worker_count();
    if topology.all_local {
        let specs = adapter.worker_specs(config, topology.devices_per_worker)?;
        launcher::launch(env.spawner.as_ref(), specs).await?;
    } else {
        adapter.validate_distinct_hosts(config)?;
        let task_id = worker::assign_task_id(&config.ips, env.host.as_ref())?;
        info!(task_id = task_id; "this host is a worker");

        let spec = adapter.worker_spec(config, task_id, topology.devices_per_worker)?;
        launcher::check_results(vec![Worker::new(spec).run().await])?;
    }

    let aggregator = Aggregator::new(
        ShardStore::new(&config.data_dir),
        config.training.clone(),
        worker_count,
        topology.total_devices(worker_count),
    );
    let report = aggregator.cross_validate().await?;

    info!(
        workers = report.worker_count,
        iterations = report.iterations,
        max_abs_diff = report.max_abs_diff();
        "distributed run matches the reference"
    );
    Ok(report)
}
