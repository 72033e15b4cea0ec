//! The sharded embedding table and the lookup that feeds the dense layers.
//!
//! The global vocabulary is spread round robin over every device of the run:
//! key `k` lives on global device `k % total_devices`, at row
//! `k / total_devices` of that device's slice. A worker stores the slices of
//! the devices it drives, one after the other.

use std::collections::{BTreeMap, HashMap, btree_map::Entry};

use comms::specs::{Combiner, EmbeddingInit};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut1, s};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Uniform};

use crate::{MlErr, Result, dataset::PADDING_KEY};

/// Which part of the global vocabulary a worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    rows_per_device: usize,
    total_devices: usize,
    first_device: usize,
    local_devices: usize,
}

impl ShardLayout {
    /// Creates a new `ShardLayout`.
    ///
    /// # Arguments
    /// * `rows_per_device` - The vocabulary size per device.
    /// * `worker_count` - The amount of workers in the run.
    /// * `local_devices` - The amount of devices each worker drives.
    /// * `task_id` - The worker this layout belongs to.
    pub fn new(
        rows_per_device: usize,
        worker_count: usize,
        local_devices: usize,
        task_id: usize,
    ) -> Self {
        Self {
            rows_per_device,
            total_devices: worker_count * local_devices,
            first_device: task_id * local_devices,
            local_devices,
        }
    }

    /// The layout of a single process owning the whole vocabulary on one device.
    pub fn single(vocabulary_size: usize) -> Self {
        Self::new(vocabulary_size, 1, 1, 0)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.rows_per_device * self.total_devices
    }

    /// The amount of rows stored by the owning worker.
    pub fn local_rows(&self) -> usize {
        self.rows_per_device * self.local_devices
    }

    /// The global device holding `key`.
    ///
    /// # Returns
    /// An error if the key is outside of the vocabulary.
    pub fn device_of(&self, key: i64) -> Result<usize> {
        let vocabulary_size = self.vocabulary_size();

        match usize::try_from(key) {
            Ok(k) if k < vocabulary_size => Ok(k % self.total_devices),
            _ => Err(MlErr::KeyOutOfRange {
                key,
                vocabulary_size,
            }),
        }
    }

    /// Whether `key` is stored by this worker.
    pub fn owns(&self, key: i64) -> bool {
        self.device_of(key)
            .is_ok_and(|d| (self.first_device..self.first_device + self.local_devices).contains(&d))
    }

    /// The local row of an owned `key`.
    fn local_row(&self, key: i64) -> Result<usize> {
        let device = self.device_of(key)?;
        if !self.owns(key) {
            return Err(MlErr::MissingRow { key });
        }

        let slice = device - self.first_device;
        Ok(slice * self.rows_per_device + key as usize / self.total_devices)
    }
}

/// Builds the initial embedding table, one row per key of the global vocabulary.
///
/// The snapshot only depends on its arguments, so every worker builds the same one.
pub fn initial_snapshot(
    init: EmbeddingInit,
    vocabulary_size: usize,
    dim: usize,
) -> Result<Array2<f32>> {
    match init {
        EmbeddingInit::Ones => Ok(Array2::ones((vocabulary_size, dim))),
        EmbeddingInit::Uniform { seed, limit } => {
            let dist = Uniform::new_inclusive(-limit, limit)
                .map_err(|e| MlErr::InvalidDistribution(e.to_string()))?;
            let mut rng = StdRng::seed_from_u64(seed);

            Ok(Array2::from_shape_fn((vocabulary_size, dim), |_| {
                dist.sample(&mut rng)
            }))
        }
    }
}

/// The rows of the embedding table a worker owns.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVariable {
    layout: ShardLayout,
    table: Array2<f32>,
}

impl EmbeddingVariable {
    /// Keeps the rows of `snapshot` owned by `layout`.
    ///
    /// # Arguments
    /// * `snapshot` - The `[vocabulary_size, dim]` initial table.
    /// * `layout` - The vocabulary shard of this worker.
    pub fn from_snapshot(snapshot: ArrayView2<f32>, layout: ShardLayout) -> Result<Self> {
        if snapshot.nrows() != layout.vocabulary_size() {
            return Err(MlErr::SizeMismatch {
                what: "embedding snapshot rows",
                got: snapshot.nrows(),
                expected: layout.vocabulary_size(),
            });
        }

        let mut table = Array2::zeros((layout.local_rows(), snapshot.ncols()));
        for (key, row) in snapshot.outer_iter().enumerate() {
            let key = key as i64;
            if layout.owns(key) {
                table.row_mut(layout.local_row(key)?).assign(&row);
            }
        }

        Ok(Self { layout, table })
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    pub fn owns(&self, key: i64) -> bool {
        self.layout.owns(key)
    }

    /// The stored row of an owned key.
    pub fn row_mut(&mut self, key: i64) -> Result<ArrayViewMut1<'_, f32>> {
        let row = self.layout.local_row(key)?;
        Ok(self.table.row_mut(row))
    }

    /// Answers a lookup request with the owned subset of `keys`.
    ///
    /// # Returns
    /// The owned keys, in request order, and their rows flattened.
    pub fn serve(&self, keys: &[i64]) -> Result<(Vec<i64>, Vec<f32>)> {
        let mut served = Vec::new();
        let mut rows = Vec::new();

        for &key in keys {
            self.layout.device_of(key)?;
            if self.owns(key) {
                served.push(key);
                rows.extend(self.table.row(self.layout.local_row(key)?).iter());
            }
        }

        Ok((served, rows))
    }
}

/// The rows needed by one step, gathered from their owners.
#[derive(Debug, Default)]
pub struct LookupTable {
    dim: usize,
    index: HashMap<i64, usize>,
    rows: Vec<f32>,
}

impl LookupTable {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    /// Adds the rows one owner served.
    ///
    /// # Arguments
    /// * `keys` - The served keys.
    /// * `rows` - Their rows, flattened in the same order.
    pub fn insert(&mut self, keys: &[i64], rows: &[f32]) -> Result<()> {
        if rows.len() != keys.len() * self.dim {
            return Err(MlErr::SizeMismatch {
                what: "served embedding rows",
                got: rows.len(),
                expected: keys.len() * self.dim,
            });
        }

        for (&key, row) in keys.iter().zip(rows.chunks_exact(self.dim.max(1))) {
            if self.index.insert(key, self.rows.len()).is_some() {
                return Err(MlErr::DuplicateRow { key });
            }
            self.rows.extend_from_slice(row);
        }

        Ok(())
    }

    pub fn get(&self, key: i64) -> Result<&[f32]> {
        let start = *self.index.get(&key).ok_or(MlErr::MissingRow { key })?;
        Ok(&self.rows[start..start + self.dim])
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Reduces the rows of every slot.
///
/// # Arguments
/// * `lookup` - The rows of every key in `keys`.
/// * `keys` - The `[batch, slots, max_nnz]` keys.
/// * `combiner` - The reduction within a slot.
///
/// # Returns
/// The `[batch, slots, dim]` embedding vector. Slots without keys are zero.
pub fn combine(
    lookup: &LookupTable,
    keys: ArrayView3<i64>,
    combiner: Combiner,
) -> Result<Array3<f32>> {
    let (batch, slots, _) = keys.dim();
    let mut out = Array3::zeros((batch, slots, lookup.dim));

    for (sample, mut acc) in keys.outer_iter().zip(out.outer_iter_mut()) {
        for (slot, mut acc) in sample.outer_iter().zip(acc.outer_iter_mut()) {
            let mut nnz = 0;
            for &key in slot.iter().filter(|&&k| k != PADDING_KEY) {
                nnz += 1;
                acc.iter_mut()
                    .zip(lookup.get(key)?)
                    .for_each(|(a, v)| *a += v);
            }

            if combiner == Combiner::Mean && nnz > 0 {
                acc.mapv_inplace(|a| a / nnz as f32);
            }
        }
    }

    Ok(out)
}

/// Distributes the gradient of `combine` back to the keys of every slot.
///
/// # Arguments
/// * `keys` - The `[batch, slots, max_nnz]` keys the forward pass used.
/// * `grad` - The `[batch, slots, dim]` gradient of the embedding vector.
/// * `combiner` - The reduction the forward pass used.
///
/// # Returns
/// One uncoalesced gradient row per looked up key.
pub fn combine_backward(
    keys: ArrayView3<i64>,
    grad: ArrayView3<f32>,
    combiner: Combiner,
) -> Result<SparseGrad> {
    let (batch, slots, _) = keys.dim();
    if grad.dim().0 != batch || grad.dim().1 != slots {
        return Err(MlErr::InvalidShape(format!(
            "embedding gradient {:?} doesn't match keys {:?}",
            grad.shape(),
            keys.shape()
        )));
    }

    let mut sparse = SparseGrad::new(grad.dim().2);
    for b in 0..batch {
        for s in 0..slots {
            let slot = keys.slice(s![b, s, ..]);
            let present = slot.iter().filter(|&&k| k != PADDING_KEY);
            let scale = match combiner {
                Combiner::Sum => 1.0,
                Combiner::Mean => 1.0 / present.clone().count().max(1) as f32,
            };

            let row = grad.slice(s![b, s, ..]);
            for &key in present {
                sparse.keys.push(key);
                sparse.values.extend(row.iter().map(|g| g * scale));
            }
        }
    }

    Ok(sparse)
}

/// A gradient over some rows of the embedding table. Keys may repeat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseGrad {
    dim: usize,
    keys: Vec<i64>,
    values: Vec<f32>,
}

impl SparseGrad {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    /// Rebuilds a gradient received from another worker.
    pub fn from_parts(dim: usize, keys: Vec<i64>, values: Vec<f32>) -> Result<Self> {
        if values.len() != keys.len() * dim {
            return Err(MlErr::SizeMismatch {
                what: "sparse gradient values",
                got: values.len(),
                expected: keys.len() * dim,
            });
        }

        Ok(Self { dim, keys, values })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn keys(&self) -> &[i64] {
        &self.keys
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates over the `(key, row)` pairs.
    pub fn rows(&self) -> impl Iterator<Item = (i64, &[f32])> {
        self.keys
            .iter()
            .copied()
            .zip(self.values.chunks_exact(self.dim.max(1)))
    }

    /// Appends the rows of `other`.
    pub fn extend(&mut self, other: &SparseGrad) {
        self.keys.extend_from_slice(&other.keys);
        self.values.extend_from_slice(&other.values);
    }

    /// Sums the rows of every repeated key.
    ///
    /// # Arguments
    /// * `grads` - The contributions to merge, summed in the given order.
    ///
    /// # Returns
    /// One row per distinct key, sorted by key.
    pub fn coalesce(grads: &[SparseGrad]) -> Result<SparseGrad> {
        let dim = grads.first().map(|g| g.dim).unwrap_or_default();
        let mut merged: BTreeMap<i64, Vec<f32>> = BTreeMap::new();

        for grad in grads {
            if grad.dim != dim {
                return Err(MlErr::SizeMismatch {
                    what: "sparse gradient dim",
                    got: grad.dim,
                    expected: dim,
                });
            }

            for (key, row) in grad.rows() {
                match merged.entry(key) {
                    Entry::Vacant(e) => {
                        e.insert(row.to_vec());
                    }
                    Entry::Occupied(mut e) => {
                        e.get_mut().iter_mut().zip(row).for_each(|(a, g)| *a += g);
                    }
                }
            }
        }

        let mut coalesced = SparseGrad::new(dim);
        for (key, row) in merged {
            coalesced.keys.push(key);
            coalesced.values.extend(row);
        }

        Ok(coalesced)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, array};

    use super::*;

    #[test]
    fn layout_is_round_robin_over_devices() {
        // 2 workers with 2 devices each, 3 rows per device.
        let layouts: Vec<_> = (0..2).map(|t| ShardLayout::new(3, 2, 2, t)).collect();
        assert_eq!(layouts[0].vocabulary_size(), 12);

        for key in 0..12 {
            let owners: Vec<_> = layouts.iter().filter(|l| l.owns(key)).collect();
            assert_eq!(owners.len(), 1, "key {key}");
        }

        assert!(layouts[0].owns(0) && layouts[0].owns(1) && layouts[0].owns(5));
        assert!(layouts[1].owns(2) && layouts[1].owns(3) && layouts[1].owns(11));
        assert!(layouts[0].device_of(12).is_err());
        assert!(layouts[0].device_of(-1).is_err());
    }

    #[test]
    fn shards_reassemble_the_snapshot() {
        let snapshot = Array2::from_shape_fn((8, 2), |(r, c)| (r * 10 + c) as f32);
        let shards: Vec<_> = (0..2)
            .map(|t| EmbeddingVariable::from_snapshot(snapshot.view(), ShardLayout::new(2, 2, 2, t)))
            .collect::<Result<_>>()
            .unwrap();

        let mut lookup = LookupTable::new(2);
        for shard in &shards {
            let (keys, rows) = shard.serve(&[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
            assert_eq!(keys.len(), 4);
            lookup.insert(&keys, &rows).unwrap();
        }

        for key in 0..8 {
            assert_eq!(lookup.get(key).unwrap(), snapshot.row(key as usize).as_slice().unwrap());
        }
    }

    #[test]
    fn uniform_snapshot_is_deterministic_and_bounded() {
        let init = EmbeddingInit::Uniform {
            seed: 3,
            limit: 0.05,
        };
        let a = initial_snapshot(init, 16, 4).unwrap();
        let b = initial_snapshot(init, 16, 4).unwrap();

        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.abs() <= 0.05));
    }

    #[test]
    fn duplicate_served_rows_are_rejected() {
        let mut lookup = LookupTable::new(1);
        lookup.insert(&[3], &[1.0]).unwrap();

        assert_eq!(lookup.insert(&[3], &[2.0]), Err(MlErr::DuplicateRow { key: 3 }));
        assert_eq!(lookup.get(4), Err(MlErr::MissingRow { key: 4 }));
    }

    #[test]
    fn mean_and_sum_combiners() {
        let mut lookup = LookupTable::new(2);
        lookup.insert(&[0, 1], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let keys = Array3::from_shape_vec((1, 2, 2), vec![0, 1, 1, PADDING_KEY]).unwrap();

        let mean = combine(&lookup, keys.view(), Combiner::Mean).unwrap();
        assert_eq!(mean, array![[[2.0, 3.0], [3.0, 4.0]]]);

        let sum = combine(&lookup, keys.view(), Combiner::Sum).unwrap();
        assert_eq!(sum, array![[[4.0, 6.0], [3.0, 4.0]]]);
    }

    #[test]
    fn backward_scales_by_slot_size_and_coalesces() {
        let keys = Array3::from_shape_vec((2, 1, 2), vec![5, 7, 5, PADDING_KEY]).unwrap();
        let grad = array![[[2.0]], [[1.0]]];

        let sparse = combine_backward(keys.view(), grad.view(), Combiner::Mean).unwrap();
        assert_eq!(sparse.keys(), &[5, 7, 5]);
        assert_eq!(sparse.values(), &[1.0, 1.0, 1.0]);

        let coalesced = SparseGrad::coalesce(&[sparse.clone(), sparse]).unwrap();
        assert_eq!(coalesced.keys(), &[5, 7]);
        assert_eq!(coalesced.values(), &[4.0, 2.0]);
    }
}
