use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, concatenate, s};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution, Uniform};

use crate::{MlErr, Result};

/// Fills the unused positions of a slot.
pub const PADDING_KEY: i64 = -1;

/// A sequence of sparse samples: `keys` is `[samples, slots, max_nnz]` padded with
/// `PADDING_KEY`, `labels` is `[samples, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseSamples {
    keys: Array3<i64>,
    labels: Array2<f32>,
}

impl SparseSamples {
    /// Creates a new `SparseSamples`.
    ///
    /// # Arguments
    /// * `keys` - The `[samples, slots, max_nnz]` key tensor.
    /// * `labels` - The `[samples, 1]` label tensor.
    ///
    /// # Returns
    /// An error if both tensors don't agree on the amount of samples.
    pub fn new(keys: Array3<i64>, labels: Array2<f32>) -> Result<Self> {
        if labels.ncols() != 1 {
            return Err(MlErr::InvalidShape(format!(
                "labels must have a single column, got {:?}",
                labels.shape()
            )));
        }

        if keys.len_of(Axis(0)) != labels.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "labels",
                got: labels.nrows(),
                expected: keys.len_of(Axis(0)),
            });
        }

        Ok(Self { keys, labels })
    }

    /// Synthesizes random samples.
    ///
    /// Every slot holds between 1 and `max_nnz` keys drawn uniformly from
    /// `[0, vocabulary_size)`, the rest of the slot is padding. Labels are 0 or 1.
    ///
    /// # Arguments
    /// * `rng` - The source of randomness.
    /// * `len` - The amount of samples.
    /// * `slot_num` - The amount of feature slots per sample.
    /// * `max_nnz` - The maximum amount of keys per slot.
    /// * `vocabulary_size` - The exclusive upper bound of the keys.
    pub fn generate<R: Rng + ?Sized>(
        rng: &mut R,
        len: usize,
        slot_num: usize,
        max_nnz: usize,
        vocabulary_size: usize,
    ) -> Result<Self> {
        let invalid = |e: &dyn std::fmt::Display| MlErr::InvalidDistribution(e.to_string());

        let key_dist = Uniform::new(0, vocabulary_size as i64).map_err(|e| invalid(&e))?;
        let nnz_dist = Uniform::new_inclusive(1, max_nnz).map_err(|e| invalid(&e))?;
        let label_dist = Bernoulli::new(0.5).map_err(|e| invalid(&e))?;

        let mut keys = Array3::from_elem((len, slot_num, max_nnz), PADDING_KEY);
        for mut slot in keys.lanes_mut(Axis(2)) {
            let nnz = nnz_dist.sample(rng);
            for key in slot.iter_mut().take(nnz) {
                *key = key_dist.sample(rng);
            }
        }

        let labels = Array2::from_shape_fn((len, 1), |_| label_dist.sample(rng) as u8 as f32);

        Ok(Self { keys, labels })
    }

    /// Concatenates batches along the sample axis, in the given order.
    pub fn concat(batches: &[SampleBatch<'_>]) -> Result<Self> {
        let keys: Vec<_> = batches.iter().map(|b| b.keys).collect();
        let labels: Vec<_> = batches.iter().map(|b| b.labels).collect();

        let keys = concatenate(Axis(0), &keys)?;
        let labels = concatenate(Axis(0), &labels)?;

        Self::new(keys, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot_num(&self) -> usize {
        self.keys.len_of(Axis(1))
    }

    pub fn max_nnz(&self) -> usize {
        self.keys.len_of(Axis(2))
    }

    pub fn keys(&self) -> ArrayView3<'_, i64> {
        self.keys.view()
    }

    pub fn labels(&self) -> ArrayView2<'_, f32> {
        self.labels.view()
    }

    /// A view over every sample.
    pub fn as_batch(&self) -> SampleBatch<'_> {
        SampleBatch {
            keys: self.keys.view(),
            labels: self.labels.view(),
        }
    }

    /// Gives the `index`-th batch of `batch_size` consecutive samples.
    ///
    /// # Returns
    /// An error if the batch runs past the end of the samples.
    pub fn batch(&self, index: usize, batch_size: usize) -> Result<SampleBatch<'_>> {
        let start = index * batch_size;
        let end = start + batch_size;

        if end > self.len() {
            return Err(MlErr::SizeMismatch {
                what: "batch end",
                got: end,
                expected: self.len(),
            });
        }

        Ok(SampleBatch {
            keys: self.keys.slice(s![start..end, .., ..]),
            labels: self.labels.slice(s![start..end, ..]),
        })
    }

    /// The amount of complete batches of `batch_size` samples.
    pub fn batch_count(&self, batch_size: usize) -> usize {
        self.len().checked_div(batch_size).unwrap_or(0)
    }
}

/// A borrowed, contiguous range of samples.
#[derive(Debug, Clone, Copy)]
pub struct SampleBatch<'a> {
    keys: ArrayView3<'a, i64>,
    labels: ArrayView2<'a, f32>,
}

impl<'a> SampleBatch<'a> {
    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> ArrayView3<'a, i64> {
        self.keys
    }

    pub fn labels(&self) -> ArrayView2<'a, f32> {
        self.labels
    }

    /// The sorted, deduplicated non-padding keys of this batch.
    pub fn unique_keys(&self) -> Vec<i64> {
        let mut keys: Vec<_> = self
            .keys
            .iter()
            .copied()
            .filter(|&k| k != PADDING_KEY)
            .collect();

        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Splits this batch into `parts` contiguous batches of the same size.
    ///
    /// # Returns
    /// An error if the batch is not evenly divisible.
    pub fn split(&self, parts: usize) -> Result<Vec<SampleBatch<'a>>> {
        if parts == 0 || self.len() % parts != 0 {
            return Err(MlErr::InvalidShape(format!(
                "a batch of {} samples can't be split in {parts} equal parts",
                self.len()
            )));
        }

        let size = self.len() / parts;
        let parts = (0..parts)
            .map(|i| {
                let rows = i * size..(i + 1) * size;
                SampleBatch {
                    keys: self.keys.slice_move(s![rows.clone(), .., ..]),
                    labels: self.labels.slice_move(s![rows, ..]),
                }
            })
            .collect();

        Ok(parts)
    }

    pub fn to_owned(&self) -> SparseSamples {
        SparseSamples {
            keys: self.keys.to_owned(),
            labels: self.labels.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn samples(seed: u64) -> SparseSamples {
        let mut rng = StdRng::seed_from_u64(seed);
        SparseSamples::generate(&mut rng, 12, 3, 4, 50).unwrap()
    }

    #[test]
    fn generated_keys_respect_bounds_and_padding() {
        let samples = samples(7);
        assert_eq!(samples.keys().shape(), &[12, 3, 4]);

        for slot in samples.keys().lanes(Axis(2)) {
            let nnz = slot.iter().take_while(|&&k| k != PADDING_KEY).count();
            assert!((1..=4).contains(&nnz));
            assert!(slot.iter().skip(nnz).all(|&k| k == PADDING_KEY));
            assert!(slot.iter().take(nnz).all(|&k| (0..50).contains(&k)));
        }

        assert!(samples.labels().iter().all(|&y| y == 0.0 || y == 1.0));
    }

    #[test]
    fn same_seed_same_samples() {
        assert_eq!(samples(3), samples(3));
        assert_ne!(samples(3), samples(4));
    }

    #[test]
    fn batches_concat_back_to_the_whole() {
        let samples = samples(1);
        let batches: Vec<_> = (0..3).map(|i| samples.batch(i, 4).unwrap()).collect();

        assert_eq!(SparseSamples::concat(&batches).unwrap(), samples);
        assert!(samples.batch(3, 4).is_err());
        assert_eq!(samples.batch_count(5), 2);
    }

    #[test]
    fn split_is_contiguous() {
        let samples = samples(2);
        let parts = samples.as_batch().split(3).unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].to_owned(), samples.batch(1, 4).unwrap().to_owned());
        assert!(samples.as_batch().split(5).is_err());
    }

    #[test]
    fn unique_keys_drop_padding() {
        let keys = Array3::from_shape_vec((2, 1, 3), vec![4, 2, -1, 2, 9, 4]).unwrap();
        let labels = Array2::zeros((2, 1));
        let samples = SparseSamples::new(keys, labels).unwrap();

        assert_eq!(samples.as_batch().unique_keys(), vec![2, 4, 9]);
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let keys = Array3::from_elem((2, 1, 1), 0);
        let labels = Array2::zeros((3, 1));

        assert!(matches!(
            SparseSamples::new(keys, labels),
            Err(MlErr::SizeMismatch { what: "labels", .. })
        ));
    }
}
