use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use comms::specs::{Combiner, EmbeddingInit, OptimizerKind, TrainingSpec};
use orchestrator::RunConfig;

#[derive(Parser)]
#[command(name = "crossval")]
#[command(about = "Cross validates sharded sparse embedding training against a single process run")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch the workers, then compare their outputs with the reference
    Run(RunArgs),
    /// Run a single worker from a JSON spec and print its result on stdout
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
pub struct WorkerArgs {
    /// The worker spec, as JSON
    #[arg(long)]
    pub spec: String,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CombinerArg {
    Mean,
    Sum,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OptimizerArg {
    #[value(name = "plugin_adam")]
    PluginAdam,
    Adam,
    Sgd,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum EmbeddingInitArg {
    Ones,
    Uniform,
}

#[derive(Args)]
pub struct RunArgs {
    /// The ip address of each worker, in task id order
    #[arg(long, num_args = 1.., value_delimiter = ',', default_value = "0.0.0.0")]
    pub ips: Vec<String>,

    /// Devices per worker when the workers run on separate hosts. Detected when every worker is local
    #[arg(long, alias = "local-gpu-num", default_value_t = 8)]
    pub local_device_count: usize,

    /// The number of training iterations
    #[arg(long, alias = "iter-num", default_value_t = 100)]
    pub iterations: usize,

    #[arg(long, alias = "max-vocabulary-size-per-gpu", default_value_t = 128)]
    pub vocabulary_size_per_device: usize,

    /// The number of feature fields
    #[arg(long, default_value_t = 1)]
    pub slot_num: usize,

    /// The maximum number of keys in one slot
    #[arg(long, default_value_t = 1)]
    pub max_nnz: usize,

    #[arg(long, default_value_t = 1)]
    pub embedding_vec_size: usize,

    #[arg(long, value_enum, default_value_t = CombinerArg::Mean)]
    pub combiner: CombinerArg,

    #[arg(long, default_value_t = 16)]
    pub global_batch_size: usize,

    #[arg(long, value_enum, default_value_t = OptimizerArg::PluginAdam)]
    pub optimizer: OptimizerArg,

    #[arg(long, default_value_t = 0.1)]
    pub learning_rate: f32,

    /// Units of the hidden layers between the embedding and the logit
    #[arg(long, value_delimiter = ',')]
    pub hidden_units: Vec<usize>,

    /// Synthesize new random samples instead of restoring the previous run's
    #[arg(
        long,
        alias = "generate-new-datas",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub regenerate: bool,

    /// Where the dataset and output shards are written
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// The port of worker 0, worker i listens on base_port + i
    #[arg(long, default_value_t = 12345)]
    pub base_port: u16,

    /// Base seed of the random samples, drawn from the OS when missing
    #[arg(long)]
    pub data_seed: Option<u64>,

    #[arg(long, default_value_t = 0)]
    pub dense_seed: u64,

    #[arg(long, value_enum, default_value_t = EmbeddingInitArg::Uniform)]
    pub embedding_init: EmbeddingInitArg,

    #[arg(long, default_value_t = 0)]
    pub embedding_seed: u64,

    /// Batches loaded ahead of the training step
    #[arg(long, default_value_t = 2)]
    pub prefetch: usize,

    #[arg(long, default_value_t = 30_000)]
    pub connect_timeout_ms: u64,
}

impl From<CombinerArg> for Combiner {
    fn from(arg: CombinerArg) -> Self {
        match arg {
            CombinerArg::Mean => Combiner::Mean,
            CombinerArg::Sum => Combiner::Sum,
        }
    }
}

impl From<OptimizerArg> for OptimizerKind {
    fn from(arg: OptimizerArg) -> Self {
        match arg {
            OptimizerArg::PluginAdam => OptimizerKind::PluginAdam,
            OptimizerArg::Adam => OptimizerKind::Adam,
            OptimizerArg::Sgd => OptimizerKind::Sgd,
        }
    }
}

impl RunArgs {
    fn embedding_init(&self) -> EmbeddingInit {
        match self.embedding_init {
            EmbeddingInitArg::Ones => EmbeddingInit::Ones,
            EmbeddingInitArg::Uniform => EmbeddingInit::Uniform {
                seed: self.embedding_seed,
                limit: 0.05,
            },
        }
    }

    pub fn into_config(self) -> RunConfig {
        let training = TrainingSpec {
            global_batch_size: self.global_batch_size,
            iterations: self.iterations,
            slot_num: self.slot_num,
            max_nnz: self.max_nnz,
            embedding_vec_size: self.embedding_vec_size,
            vocabulary_size_per_device: self.vocabulary_size_per_device,
            combiner: self.combiner.into(),
            optimizer: self.optimizer.into(),
            learning_rate: self.learning_rate,
            hidden_units: self.hidden_units.clone(),
            embedding_init: self.embedding_init(),
            dense_seed: self.dense_seed,
            data_seed: self.data_seed,
            prefetch: self.prefetch,
        };

        RunConfig {
            ips: self.ips,
            base_port: self.base_port,
            data_dir: self.data_dir,
            regenerate: self.regenerate,
            local_device_count: self.local_device_count,
            connect_timeout_ms: self.connect_timeout_ms,
            training,
        }
    }
}
