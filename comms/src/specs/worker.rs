use std::{ops::Range, path::PathBuf};

use serde::{Deserialize, Serialize};

use super::{ClusterSpec, TrainingSpec};

/// Full bootstrap specification for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub cluster: ClusterSpec,
    pub training: TrainingSpec,
    /// The amount of accelerator devices this worker drives.
    pub local_device_count: usize,
    /// Global indices of the devices assigned to this worker.
    pub visible_devices: Range<usize>,
    pub data_dir: PathBuf,
    /// Synthesize a fresh dataset shard instead of restoring the persisted one.
    pub regenerate: bool,
    pub connect_timeout_ms: u64,
}

impl WorkerSpec {
    /// The task id of this worker.
    pub fn task_id(&self) -> usize {
        self.cluster.rank()
    }

    /// The amount of workers in the run.
    pub fn worker_count(&self) -> usize {
        self.cluster.world_size()
    }

    /// The amount of devices across every worker.
    pub fn total_devices(&self) -> usize {
        self.local_device_count * self.worker_count()
    }

    /// The `CUDA_VISIBLE_DEVICES` value for this worker.
    pub fn visible_devices_env(&self) -> String {
        self.visible_devices
            .clone()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
