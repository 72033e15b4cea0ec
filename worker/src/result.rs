use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkerStatus {
    Succeeded,
    Failed { reason: String },
}

/// Where a finished worker left its shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHandle {
    pub dataset: PathBuf,
    pub outputs: PathBuf,
    pub iterations: usize,
}

/// What every worker reports back to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// The task id of the worker, which is also the id of its shards.
    pub shard_id: usize,
    pub status: WorkerStatus,
    /// Present when the worker succeeded.
    pub data_handle: Option<ShardHandle>,
}

impl WorkerResult {
    pub fn succeeded(shard_id: usize, data_handle: ShardHandle) -> Self {
        Self {
            shard_id,
            status: WorkerStatus::Succeeded,
            data_handle: Some(data_handle),
        }
    }

    pub fn failed(shard_id: usize, reason: impl Into<String>) -> Self {
        Self {
            shard_id,
            status: WorkerStatus::Failed {
                reason: reason.into(),
            },
            data_handle: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Succeeded
    }

    /// The failure reason, if any.
    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            WorkerStatus::Succeeded => None,
            WorkerStatus::Failed { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_line_round_trip() {
        let result = WorkerResult::succeeded(
            1,
            ShardHandle {
                dataset: "random_samples_1.safetensors".into(),
                outputs: "embedding_vectors_1.safetensors".into(),
                iterations: 5,
            },
        );

        let line = serde_json::to_string(&result).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(serde_json::from_str::<WorkerResult>(&line).unwrap(), result);
    }

    #[test]
    fn failure_carries_the_reason() {
        let result = WorkerResult::failed(2, "rank 0 aborted: boom");

        assert!(!result.is_success());
        assert_eq!(result.failure(), Some("rank 0 aborted: boom"));
        assert!(result.data_handle.is_none());
    }
}
