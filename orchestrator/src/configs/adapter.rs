use std::{collections::HashSet, ops::Range};

use comms::specs::{ClusterSpec, WorkerSpec};

use super::RunConfig;
use crate::error::OrchestratorError;

/// Validates a `RunConfig` and turns it into one `WorkerSpec` per worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct Adapter;

impl Adapter {
    pub fn new() -> Self {
        Self
    }

    /// Checks everything that doesn't depend on the devices of the hosts.
    pub fn validate(&self, config: &RunConfig) -> Result<(), OrchestratorError> {
        let worker_count = config.worker_count();
        let training = &config.training;

        if worker_count == 0 {
            return Err(OrchestratorError::Configuration(
                "at least one worker address is required".into(),
            ));
        }

        if training.global_batch_size % worker_count != 0 {
            return Err(OrchestratorError::Configuration(format!(
                "global_batch_size ({}) must be a multiple of the worker count ({worker_count})",
                training.global_batch_size
            )));
        }

        let positive = [
            ("global_batch_size", training.global_batch_size),
            ("iterations", training.iterations),
            ("slot_num", training.slot_num),
            ("max_nnz", training.max_nnz),
            ("embedding_vec_size", training.embedding_vec_size),
            ("vocabulary_size_per_device", training.vocabulary_size_per_device),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(OrchestratorError::Configuration(format!(
                "{name} must be greater than 0"
            )));
        }

        if training.hidden_units.contains(&0) {
            return Err(OrchestratorError::Configuration(
                "hidden_units must all be greater than 0".into(),
            ));
        }

        if !(training.learning_rate.is_finite() && training.learning_rate > 0.) {
            return Err(OrchestratorError::Configuration(format!(
                "learning_rate ({}) must be a positive number",
                training.learning_rate
            )));
        }

        if usize::from(u16::MAX - config.base_port) < worker_count - 1 {
            return Err(OrchestratorError::Configuration(format!(
                "base_port ({}) leaves no room for {worker_count} workers",
                config.base_port
            )));
        }

        Ok(())
    }

    /// Checks the batch against the devices each worker drives.
    ///
    /// # Arguments
    /// * `config` - The run's config.
    /// * `devices_per_worker` - The amount of devices each worker drives.
    pub fn validate_devices(
        &self,
        config: &RunConfig,
        devices_per_worker: usize,
    ) -> Result<(), OrchestratorError> {
        if devices_per_worker == 0 {
            return Err(OrchestratorError::Configuration(
                "every worker needs at least one device".into(),
            ));
        }

        let total = devices_per_worker * config.worker_count();
        if config.training.global_batch_size % total != 0 {
            return Err(OrchestratorError::Configuration(format!(
                "global_batch_size ({}) must be a multiple of the total device count ({total})",
                config.training.global_batch_size
            )));
        }

        Ok(())
    }

    /// Rejects ip lists naming a host twice, which only the all local path supports.
    pub fn validate_distinct_hosts(&self, config: &RunConfig) -> Result<(), OrchestratorError> {
        let mut seen = HashSet::new();

        match config.ips.iter().find(|ip| !seen.insert(ip.as_str())) {
            Some(ip) => Err(OrchestratorError::Configuration(format!(
                "{ip} appears more than once in the ip list, workers on separate hosts \
                 can't share one"
            ))),
            None => Ok(()),
        }
    }

    /// Builds the spec of worker `task_id`.
    ///
    /// # Arguments
    /// * `config` - The run's config.
    /// * `task_id` - The index of the worker in the ip list.
    /// * `devices_per_worker` - The amount of devices each worker drives.
    pub fn worker_spec(
        &self,
        config: &RunConfig,
        task_id: usize,
        devices_per_worker: usize,
    ) -> Result<WorkerSpec, OrchestratorError> {
        let cluster = ClusterSpec::build(&config.ips, task_id, config.base_port)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;

        Ok(WorkerSpec {
            cluster,
            training: config.training.clone(),
            local_device_count: devices_per_worker,
            visible_devices: device_range(task_id, devices_per_worker),
            data_dir: config.data_dir.clone(),
            regenerate: config.regenerate,
            connect_timeout_ms: config.connect_timeout_ms,
        })
    }

    /// Builds the spec of every worker, in task id order.
    pub fn worker_specs(
        &self,
        config: &RunConfig,
        devices_per_worker: usize,
    ) -> Result<Vec<WorkerSpec>, OrchestratorError> {
        (0..config.worker_count())
            .map(|task_id| self.worker_spec(config, task_id, devices_per_worker))
            .collect()
    }
}

/// The disjoint slice of the device inventory worker `task_id` is pinned to.
fn device_range(task_id: usize, devices_per_worker: usize) -> Range<usize> {
    task_id * devices_per_worker..(task_id + 1) * devices_per_worker
}

#[cfg(test)]
mod tests {
    use comms::specs::TrainingSpec;

    use super::*;

    fn config(ips: &[&str], global_batch_size: usize) -> RunConfig {
        RunConfig {
            ips: ips.iter().map(|s| s.to_string()).collect(),
            training: TrainingSpec {
                global_batch_size,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn batch_must_split_across_workers() {
        let adapter = Adapter::new();

        assert!(adapter.validate(&config(&["a", "b"], 16)).is_ok());
        assert!(matches!(
            adapter.validate(&config(&["a", "b", "c"], 17)),
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[test]
    fn batch_must_split_across_devices() {
        let adapter = Adapter::new();
        let config = config(&["a", "b"], 16);

        assert!(adapter.validate_devices(&config, 4).is_ok());
        assert!(matches!(
            adapter.validate_devices(&config, 3),
            Err(OrchestratorError::Configuration(_))
        ));
        assert!(adapter.validate_devices(&config, 0).is_err());
    }

    #[test]
    fn empty_ip_list_is_rejected() {
        assert!(Adapter::new().validate(&config(&[], 16)).is_err());
    }

    #[test]
    fn duplicate_hosts_are_rejected() {
        let adapter = Adapter::new();

        assert!(adapter.validate_distinct_hosts(&config(&["a", "b"], 16)).is_ok());
        assert!(adapter.validate_distinct_hosts(&config(&["a", "b", "a"], 16)).is_err());
    }

    #[test]
    fn device_ranges_are_disjoint_and_contiguous() {
        let adapter = Adapter::new();
        let specs = adapter.worker_specs(&config(&["a", "b", "c"], 12), 2).unwrap();

        let ranges: Vec<_> = specs.iter().map(|s| s.visible_devices.clone()).collect();
        assert_eq!(ranges, [0..2, 2..4, 4..6]);

        for (task_id, spec) in specs.iter().enumerate() {
            assert_eq!(spec.task_id(), task_id);
            assert_eq!(spec.worker_count(), 3);
            assert_eq!(spec.cluster.workers()[1], "b:12346");
        }
        assert_eq!(specs[1].visible_devices_env(), "2,3");
    }
}
