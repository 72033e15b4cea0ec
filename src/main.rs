mod cli;

use anyhow::Context;
use clap::Parser;
use comms::specs::WorkerSpec;
use log::info;
use orchestrator::Environment;
use worker::Worker;

use crate::cli::{Cli, Commands};

/// The `RUST_LOG` driven logger, printing the key-value fields of every record.
fn logger() -> env_logger::Builder {
    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_millis();
    builder
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger().init();

    match Cli::parse().command {
        Commands::Run(args) => {
            let config = args.into_config();
            let env = Environment::system().context("failed to inspect this machine")?;

            let report = orchestrator::run(&config, &env).await?;
            info!(
                iterations = report.iterations,
                max_abs_diff = report.max_abs_diff();
                "cross validation passed"
            );
        }
        Commands::Worker(args) => {
            let spec: WorkerSpec =
                serde_json::from_str(&args.spec).context("failed to parse the worker spec")?;

            let result = Worker::new(spec).run().await;
            println!("{}", serde_json::to_string(&result)?);

            if !result.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
