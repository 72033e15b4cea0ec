//! Persistence of dataset and output shards, one safetensors file per shard.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use machine_learning::dataset::SparseSamples;
use ndarray::{Array2, Array3, ArrayView3};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{Result, WorkerErr};

const KEYS: &str = "keys";
const LABELS: &str = "labels";
const KIND: &str = "kind";
const TASK_ID: &str = "task_id";
const ITERATIONS: &str = "iterations";
const OUTPUT_PREFIX: &str = "embedding_vector.";

/// Where the shards of a run live, addressed by task id.
#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
}

impl ShardStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The dataset shard file of `task_id`.
    pub fn dataset_path(&self, task_id: usize) -> PathBuf {
        self.dir.join(format!("random_samples_{task_id}.safetensors"))
    }

    /// The output shard file of `task_id`.
    pub fn output_path(&self, task_id: usize) -> PathBuf {
        self.dir.join(format!("embedding_vectors_{task_id}.safetensors"))
    }

    /// Persists a worker's dataset shard.
    ///
    /// # Arguments
    /// * `task_id` - The worker owning the shard.
    /// * `samples` - Every sample of the shard, in iteration order.
    /// * `iterations` - The amount of batches in the shard.
    pub fn save_dataset(
        &self,
        task_id: usize,
        samples: &SparseSamples,
        iterations: usize,
    ) -> Result<PathBuf> {
        let path = self.dataset_path(task_id);

        let keys = samples.keys();
        let keys = keys.as_standard_layout();
        let labels = samples.labels();
        let labels = labels.as_standard_layout();

        let tensors = vec![
            (
                KEYS.to_string(),
                view(&path, Dtype::I64, keys.shape(), cast(&path, keys.as_slice())?)?,
            ),
            (
                LABELS.to_string(),
                view(&path, Dtype::F32, labels.shape(), cast(&path, labels.as_slice())?)?,
            ),
        ];

        write(&path, tensors, metadata("dataset", task_id, iterations))?;
        Ok(path)
    }

    /// Restores a worker's dataset shard.
    pub fn load_dataset(&self, task_id: usize) -> Result<SparseSamples> {
        let path = self.dataset_path(task_id);
        let buf = fs::read(&path)?;
        let tensors = SafeTensors::deserialize(&buf).map_err(|e| shard_err(&path, e))?;

        let (shape, keys) = read::<i64>(&path, &tensors, KEYS, Dtype::I64)?;
        let keys = Array3::from_shape_vec(dims::<3>(&path, KEYS, &shape)?, keys)
            .map_err(|e| shard_err(&path, e))?;

        let (shape, labels) = read::<f32>(&path, &tensors, LABELS, Dtype::F32)?;
        let labels = Array2::from_shape_vec(dims::<2>(&path, LABELS, &shape)?, labels)
            .map_err(|e| shard_err(&path, e))?;

        SparseSamples::new(keys, labels).map_err(|e| shard_err(&path, e))
    }

    /// Persists a worker's per-iteration embedding vectors.
    pub fn save_outputs(&self, task_id: usize, outputs: &[ArrayView3<f32>]) -> Result<PathBuf> {
        let path = self.output_path(task_id);

        let owned: Vec<_> = outputs.iter().map(|o| o.as_standard_layout()).collect();

        let mut tensors = Vec::with_capacity(owned.len());
        for (i, output) in owned.iter().enumerate() {
            let data = cast(&path, output.as_slice())?;
            tensors.push((output_name(i), view(&path, Dtype::F32, output.shape(), data)?));
        }

        write(&path, tensors, metadata("embedding_vectors", task_id, outputs.len()))?;
        Ok(path)
    }

    /// Restores a worker's per-iteration embedding vectors, in iteration order.
    ///
    /// The amount of entries is whatever the file holds; checking it against the run is
    /// up to the caller.
    pub fn load_outputs(&self, task_id: usize) -> Result<Vec<Array3<f32>>> {
        let path = self.output_path(task_id);
        let buf = fs::read(&path)?;
        let tensors = SafeTensors::deserialize(&buf).map_err(|e| shard_err(&path, e))?;

        let mut names = tensors
            .names()
            .into_iter()
            .map(|name| Ok((output_index(&path, name)?, name)))
            .collect::<Result<Vec<_>>>()?;
        names.sort_unstable_by_key(|(i, _)| *i);

        names
            .into_iter()
            .enumerate()
            .map(|(expected, (i, name))| {
                if i != expected {
                    return Err(shard_err(
                        &path,
                        format!("missing tensor {}", output_name(expected)),
                    ));
                }

                let (shape, values) = read::<f32>(&path, &tensors, name, Dtype::F32)?;
                Array3::from_shape_vec(dims::<3>(&path, name, &shape)?, values)
                    .map_err(|e| shard_err(&path, e))
            })
            .collect()
    }
}

fn output_name(iteration: usize) -> String {
    format!("{OUTPUT_PREFIX}{iteration}")
}

/// The iteration an output tensor name stands for.
fn output_index(path: &Path, name: &str) -> Result<usize> {
    name.strip_prefix(OUTPUT_PREFIX)
        .and_then(|i| i.parse().ok())
        .ok_or_else(|| shard_err(path, format!("unexpected tensor {name}")))
}

fn metadata(kind: &str, task_id: usize, iterations: usize) -> HashMap<String, String> {
    HashMap::from([
        (KIND.to_string(), kind.to_string()),
        (TASK_ID.to_string(), task_id.to_string()),
        (ITERATIONS.to_string(), iterations.to_string()),
    ])
}

fn shard_err(path: &Path, detail: impl ToString) -> WorkerErr {
    WorkerErr::Shard {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn cast<'a, T: bytemuck::Pod>(path: &Path, data: Option<&'a [T]>) -> Result<&'a [u8]> {
    data.map(bytemuck::cast_slice)
        .ok_or_else(|| shard_err(path, "tensor is not contiguous"))
}

fn view<'a>(
    path: &Path,
    dtype: Dtype,
    shape: &[usize],
    data: &'a [u8],
) -> Result<TensorView<'a>> {
    TensorView::new(dtype, shape.to_vec(), data).map_err(|e| shard_err(path, e))
}

fn write(
    path: &Path,
    tensors: Vec<(String, TensorView<'_>)>,
    meta: HashMap<String, String>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    safetensors::serialize_to_file(tensors, &Some(meta), path).map_err(|e| shard_err(path, e))?;
    debug!(path:% = path.display(); "shard written");
    Ok(())
}

fn read<T: bytemuck::Pod>(
    path: &Path,
    tensors: &SafeTensors<'_>,
    name: &str,
    dtype: Dtype,
) -> Result<(Vec<usize>, Vec<T>)> {
    let tensor = tensors.tensor(name).map_err(|e| shard_err(path, e))?;

    if tensor.dtype() != dtype {
        return Err(shard_err(
            path,
            format!("tensor {name} is {:?}, expected {dtype:?}", tensor.dtype()),
        ));
    }

    let values = bytemuck::pod_collect_to_vec::<u8, T>(tensor.data());
    Ok((tensor.shape().to_vec(), values))
}

fn dims<const N: usize>(path: &Path, name: &str, shape: &[usize]) -> Result<[usize; N]> {
    shape.try_into().map_err(|_| {
        shard_err(
            path,
            format!("tensor {name} has shape {shape:?}, expected {N} dimensions"),
        )
    })
}

#[cfg(test)]
mod tests {
    use machine_learning::dataset::SparseSamples;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn dataset_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let mut rng = StdRng::seed_from_u64(11);
        let samples = SparseSamples::generate(&mut rng, 20, 3, 4, 1000).unwrap();

        let path = store.save_dataset(1, &samples, 5).unwrap();
        assert_eq!(path, dir.path().join("random_samples_1.safetensors"));

        let restored = store.load_dataset(1).unwrap();
        assert_eq!(restored, samples);

        for i in 0..5 {
            assert_eq!(
                restored.batch(i, 4).unwrap().to_owned(),
                samples.batch(i, 4).unwrap().to_owned()
            );
        }
    }

    #[test]
    fn outputs_round_trip_in_iteration_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let outputs: Vec<_> = (0..12)
            .map(|i| Array3::from_elem((2, 1, 3), i as f32))
            .collect();
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();

        store.save_outputs(0, &views).unwrap();
        assert_eq!(store.load_outputs(0).unwrap(), outputs);
    }

    #[test]
    fn iteration_order_is_numeric() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let outputs: Vec<_> = (0..101)
            .map(|i| Array3::from_elem((1, 1, 1), i as f32))
            .collect();
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();

        store.save_outputs(2, &views).unwrap();
        let restored = store.load_outputs(2).unwrap();

        let order: Vec<f32> = restored.iter().map(|o| o[[0, 0, 0]]).collect();
        assert_eq!(order, (0..101).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn gap_in_iterations_is_a_shard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let row = Array3::<f32>::zeros((1, 1, 1));
        let data = bytemuck::cast_slice(row.as_slice().unwrap());
        let tensors = [0, 2].map(|i| {
            (
                output_name(i),
                TensorView::new(Dtype::F32, vec![1, 1, 1], data).unwrap(),
            )
        });

        safetensors::serialize_to_file(tensors, &None, &store.output_path(0)).unwrap();

        match store.load_outputs(0) {
            Err(WorkerErr::Shard { detail, .. }) => assert!(detail.contains("embedding_vector.1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_shard_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());

        assert!(matches!(store.load_outputs(3), Err(WorkerErr::Io(_))));
    }

    #[test]
    fn foreign_file_is_a_shard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let outputs = [Array3::<f32>::zeros((1, 1, 1))];
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();

        // An output file has no `keys` tensor.
        store.save_outputs(0, &views).unwrap();
        fs::rename(store.output_path(0), store.dataset_path(0)).unwrap();

        assert!(matches!(store.load_dataset(0), Err(WorkerErr::Shard { .. })));
    }
}
