use std::path::PathBuf;

use comms::specs::TrainingSpec;
use serde::{Deserialize, Serialize};

/// Everything a run is launched with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// One address per worker. The order defines the task ids.
    pub ips: Vec<String>,
    /// The port of worker 0, worker `i` uses `base_port + i`.
    pub base_port: u16,
    /// Where the dataset and output shards live.
    pub data_dir: PathBuf,
    /// Synthesize fresh dataset shards instead of restoring the persisted ones.
    pub regenerate: bool,
    /// Devices per worker when the workers run on separate hosts.
    pub local_device_count: usize,
    pub connect_timeout_ms: u64,
    pub training: TrainingSpec,
}

impl RunConfig {
    pub fn worker_count(&self) -> usize {
        self.ips.len()
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ips: vec!["0.0.0.0".to_string()],
            base_port: 12345,
            data_dir: PathBuf::from("."),
            regenerate: true,
            local_device_count: 1,
            connect_timeout_ms: 30_000,
            training: TrainingSpec::default(),
        }
    }
}
