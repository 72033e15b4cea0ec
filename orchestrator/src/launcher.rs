//! Starts the workers of an all local run and waits for every one of them.

use std::{
    env, io,
    path::PathBuf,
    process::{Output, Stdio},
};

use comms::specs::WorkerSpec;
use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, error, info};
use tokio::process::Command;
use worker::{Worker, WorkerResult};

use crate::error::{OrchestratorError, WorkerFailure};

/// Starts one worker and resolves to its result once it is done.
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: WorkerSpec) -> BoxFuture<'static, WorkerResult>;
}

/// Runs every worker in its own OS process, pinned to its devices through
/// `CUDA_VISIBLE_DEVICES`.
///
/// The child gets its spec as a JSON argument and prints its `WorkerResult` as the last
/// line of its stdout.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    /// Creates a new `ProcessSpawner`.
    ///
    /// # Arguments
    /// * `program` - The worker executable.
    /// * `args` - Arguments placed before `--spec <json>`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Spawns workers by re-running this executable with the `worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?, vec!["worker".to_string()]))
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, spec: WorkerSpec) -> BoxFuture<'static, WorkerResult> {
        let task_id = spec.task_id();

        let json = match serde_json::to_string(&spec) {
            Ok(json) => json,
            Err(e) => {
                let result = WorkerResult::failed(task_id, format!("invalid worker spec: {e}"));
                return future::ready(result).boxed();
            }
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--spec")
            .arg(json)
            .env("CUDA_VISIBLE_DEVICES", spec.visible_devices_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        async move {
            match command.output().await {
                Ok(output) => parse_output(task_id, &output),
                Err(e) => WorkerResult::failed(task_id, format!("could not start: {e}")),
            }
        }
        .boxed()
    }
}

/// Reads a child's `WorkerResult` out of its output.
fn parse_output(task_id: usize, output: &Output) -> WorkerResult {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let reported = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<WorkerResult>(line.trim()).ok());

    match reported {
        Some(result) if result.shard_id != task_id => WorkerResult::failed(
            task_id,
            format!("reported the result of worker {}", result.shard_id),
        ),
        Some(result) if output.status.success() => result,
        Some(result) => {
            let reason = result.failure().unwrap_or("no reason given");
            WorkerResult::failed(task_id, format!("exited with {}: {reason}", output.status))
        }
        None => WorkerResult::failed(
            task_id,
            format!("exited with {} without reporting a result", output.status),
        ),
    }
}

/// Runs every worker as a task of this process's runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessSpawner;

impl Spawner for InProcessSpawner {
    fn spawn(&self, spec: WorkerSpec) -> BoxFuture<'static, WorkerResult> {
        let task_id = spec.task_id();
        let handle = tokio::spawn(Worker::new(spec).run());

        async move {
            handle
                .await
                .unwrap_or_else(|e| WorkerResult::failed(task_id, format!("worker task died: {e}")))
        }
        .boxed()
    }
}

/// Starts every worker and waits until all of them are done.
///
/// # Arguments
/// * `spawner` - How workers are started.
/// * `specs` - One spec per worker, in task id order.
///
/// # Returns
/// Every worker's result in task id order, or the list of workers that failed.
pub async fn launch(
    spawner: &dyn Spawner,
    specs: Vec<WorkerSpec>,
) -> Result<Vec<WorkerResult>, OrchestratorError> {
    let running: Vec<_> = specs
        .into_iter()
        .map(|spec| {
            info!(
                task_id = spec.task_id(),
                devices:% = spec.visible_devices_env();
                "launching worker"
            );
            spawner.spawn(spec)
        })
        .collect();

    let results = future::join_all(running).await;
    debug!(workers = results.len(); "every worker is done");

    check_results(results)
}

/// Fails with every failed worker, if there is any.
pub fn check_results(results: Vec<WorkerResult>) -> Result<Vec<WorkerResult>, OrchestratorError> {
    let failures: Vec<_> = results
        .iter()
        .filter_map(|r| {
            r.failure().map(|reason| WorkerFailure {
                task_id: r.shard_id,
                reason: reason.to_string(),
            })
        })
        .collect();

    if failures.is_empty() {
        return Ok(results);
    }

    for failure in &failures {
        error!(task_id = failure.task_id, reason = failure.reason.as_str(); "worker failed");
    }
    Err(OrchestratorError::WorkerFailed(failures))
}
