use serde::{Deserialize, Serialize};

/// Reduction applied to the embedding rows looked up within one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combiner {
    #[default]
    Mean,
    Sum,
}

/// The optimizer pair used for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// The embedding-specialised Adam, which aggregates the raw sparse gradients itself.
    #[default]
    PluginAdam,
    Adam,
    Sgd,
}

impl OptimizerKind {
    /// Whether the embedding optimizer expects every worker's raw gradient contribution
    /// instead of an already coalesced gradient.
    pub fn aggregates_embedding_gradients(self) -> bool {
        matches!(self, OptimizerKind::PluginAdam)
    }
}

/// How the initial embedding table snapshot is filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingInit {
    Ones,
    Uniform { seed: u64, limit: f32 },
}

impl Default for EmbeddingInit {
    fn default() -> Self {
        Self::Uniform {
            seed: 0,
            limit: 0.05,
        }
    }
}

/// Everything that determines the math of a run. Identical on every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    pub global_batch_size: usize,
    pub iterations: usize,
    pub slot_num: usize,
    pub max_nnz: usize,
    pub embedding_vec_size: usize,
    pub vocabulary_size_per_device: usize,
    pub combiner: Combiner,
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    pub hidden_units: Vec<usize>,
    pub embedding_init: EmbeddingInit,
    pub dense_seed: u64,
    /// Base seed for the synthetic samples, offset by task id. `None` draws from the OS.
    pub data_seed: Option<u64>,
    /// Capacity of the bounded queue between the data loader and the step driver.
    pub prefetch: usize,
}

impl Default for TrainingSpec {
    fn default() -> Self {
        Self {
            global_batch_size: 16,
            iterations: 100,
            slot_num: 1,
            max_nnz: 1,
            embedding_vec_size: 1,
            vocabulary_size_per_device: 128,
            combiner: Combiner::Mean,
            optimizer: OptimizerKind::PluginAdam,
            learning_rate: 0.1,
            hidden_units: Vec::new(),
            embedding_init: EmbeddingInit::default(),
            dense_seed: 0,
            data_seed: None,
            prefetch: 2,
        }
    }
}

impl TrainingSpec {
    /// The per-worker batch size.
    pub fn local_batch_size(&self, worker_count: usize) -> usize {
        self.global_batch_size / worker_count.max(1)
    }

    /// The size of the global vocabulary given the total amount of devices.
    pub fn vocabulary_size(&self, total_devices: usize) -> usize {
        self.vocabulary_size_per_device * total_devices
    }
}
