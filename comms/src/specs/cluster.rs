use std::{collections::BTreeMap, io};

use serde::{Deserialize, Serialize};

/// The role of a process inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Worker,
}

/// The role descriptor of this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub kind: TaskType,
    pub index: usize,
}

/// Cluster membership handed explicitly to the collective at construction.
///
/// Serializes to the same JSON layout as `TF_CONFIG`:
/// `{"cluster": {"worker": ["ip:port", ...]}, "task": {"type": "worker", "index": i}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub cluster: BTreeMap<String, Vec<String>>,
    pub task: TaskSpec,
}

impl ClusterSpec {
    /// Builds the cluster specification for worker `task_id`.
    ///
    /// Worker `i` listens on `ips[i]:(base_port + i)` so several workers can share a host.
    ///
    /// # Arguments
    /// * `ips` - One address per worker, in task id order.
    /// * `task_id` - The index of this process in `ips`.
    /// * `base_port` - The port of worker 0.
    ///
    /// # Returns
    /// The cluster spec, or an error if `task_id` is out of range or a port overflows.
    pub fn build<S: AsRef<str>>(ips: &[S], task_id: usize, base_port: u16) -> io::Result<Self> {
        if task_id >= ips.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("task id {task_id} is out of range for {} workers", ips.len()),
            ));
        }

        let workers = ips
            .iter()
            .enumerate()
            .map(|(i, ip)| {
                let port = u16::try_from(i)
                    .ok()
                    .and_then(|i| base_port.checked_add(i))
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("port {base_port} + {i} does not fit in 16 bits"),
                        )
                    })?;
                Ok(format!("{}:{port}", ip.as_ref()))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            cluster: BTreeMap::from([("worker".to_string(), workers)]),
            task: TaskSpec {
                kind: TaskType::Worker,
                index: task_id,
            },
        })
    }

    /// The worker addresses, in task id order.
    pub fn workers(&self) -> &[String] {
        self.cluster.get("worker").map(Vec::as_slice).unwrap_or_default()
    }

    /// The amount of workers in the cluster.
    pub fn world_size(&self) -> usize {
        self.workers().len()
    }

    /// The task id of this process.
    pub fn rank(&self) -> usize {
        self.task.index
    }

    /// Encodes this spec as a `TF_CONFIG` compatible JSON string.
    pub fn to_tf_config(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_offset_by_worker_index() {
        let spec = ClusterSpec::build(&["10.0.0.1", "10.0.0.2", "10.0.0.1"], 1, 12345).unwrap();

        assert_eq!(
            spec.workers(),
            ["10.0.0.1:12345", "10.0.0.2:12346", "10.0.0.1:12347"]
        );
        assert_eq!(spec.rank(), 1);
        assert_eq!(spec.world_size(), 3);
    }

    #[test]
    fn matches_tf_config_layout() {
        let spec = ClusterSpec::build(&["127.0.0.1"], 0, 2000).unwrap();
        let json: serde_json::Value = serde_json::from_str(&spec.to_tf_config()).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "cluster": { "worker": ["127.0.0.1:2000"] },
                "task": { "type": "worker", "index": 0 }
            })
        );
        assert_eq!(serde_json::from_str::<ClusterSpec>(&spec.to_tf_config()).unwrap(), spec);
    }

    #[test]
    fn out_of_range_task_is_rejected() {
        assert!(ClusterSpec::build(&["127.0.0.1"], 1, 2000).is_err());
    }

    #[test]
    fn port_overflow_is_rejected() {
        assert!(ClusterSpec::build(&["a", "b"], 0, u16::MAX).is_err());
    }
}
