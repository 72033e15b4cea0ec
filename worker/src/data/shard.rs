use comms::specs::WorkerSpec;
use log::info;
use machine_learning::dataset::SparseSamples;
use rand::{SeedableRng, rngs::StdRng};

use crate::{Result, WorkerErr, store::ShardStore};

/// Produces this worker's dataset shard.
///
/// With `regenerate` the shard is synthesized, `iterations * local_batch_size` samples with
/// keys spanning the whole global vocabulary, and persisted. Otherwise the shard persisted by
/// a previous run is restored and checked against the spec.
///
/// # Arguments
/// * `spec` - This worker's spec.
/// * `store` - Where shards are persisted.
pub fn generate_or_restore(spec: &WorkerSpec, store: &ShardStore) -> Result<SparseSamples> {
    let training = &spec.training;
    let task_id = spec.task_id();
    let local_batch_size = training.local_batch_size(spec.worker_count());
    let len = training.iterations * local_batch_size;

    if !spec.regenerate {
        let samples = store.load_dataset(task_id)?;
        check_restored(spec, store, &samples, len)?;
        info!(task_id = task_id, samples = samples.len(); "restored dataset shard");
        return Ok(samples);
    }

    let mut rng = match training.data_seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(task_id as u64)),
        None => StdRng::from_os_rng(),
    };

    let samples = SparseSamples::generate(
        &mut rng,
        len,
        training.slot_num,
        training.max_nnz,
        training.vocabulary_size(spec.total_devices()),
    )?;

    let path = store.save_dataset(task_id, &samples, training.iterations)?;
    info!(task_id = task_id, samples = len, path:% = path.display(); "generated dataset shard");

    Ok(samples)
}

fn check_restored(
    spec: &WorkerSpec,
    store: &ShardStore,
    samples: &SparseSamples,
    len: usize,
) -> Result<()> {
    let training = &spec.training;
    let vocabulary_size = training.vocabulary_size(spec.total_devices()) as i64;

    let detail = if samples.len() != len {
        Some(format!("holds {} samples, the run needs {len}", samples.len()))
    } else if samples.slot_num() != training.slot_num || samples.max_nnz() != training.max_nnz {
        Some(format!(
            "has {} slots of {} keys, the run uses {} slots of {} keys",
            samples.slot_num(),
            samples.max_nnz(),
            training.slot_num,
            training.max_nnz
        ))
    } else if samples.keys().iter().any(|&k| k >= vocabulary_size) {
        Some(format!(
            "references keys outside of the vocabulary of {vocabulary_size}"
        ))
    } else {
        None
    };

    match detail {
        Some(detail) => Err(WorkerErr::Shard {
            path: store.dataset_path(spec.task_id()),
            detail,
        }),
        None => Ok(()),
    }
}
