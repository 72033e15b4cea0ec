use std::iter;

use comms::specs::{Combiner, TrainingSpec};
use ndarray::{Array2, Array3};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Uniform};

use super::{
    activations::ActFn,
    embedding::{self, EmbeddingVariable, LookupTable, ShardLayout, SparseGrad},
    layers::{Dense, DenseCache},
    loss::{BinaryCrossEntropy, LossFn},
    variables::{DenseVariable, Trainable},
};
use crate::{MlErr, Result, dataset::SampleBatch};

/// Everything one replica computes for its slice of a step.
#[derive(Debug, Clone)]
pub struct ReplicaPass {
    /// The `[batch, slots, dim]` combined embeddings.
    pub embedding_vector: Array3<f32>,
    /// The `[batch, 1]` logits.
    pub logits: Array2<f32>,
    pub loss: f32,
    /// One gradient per dense variable, in `DemoModel::dense_variables` order.
    pub dense_grads: Vec<Vec<f32>>,
    /// The uncoalesced gradient of the embedding rows this replica looked up.
    pub sparse_grad: SparseGrad,
}

/// Sparse embedding lookup followed by a small MLP producing one logit per sample.
#[derive(Debug, Clone)]
pub struct DemoModel {
    combiner: Combiner,
    embedding: EmbeddingVariable,
    layers: Vec<Dense>,
    /// `[kernel_0, bias_0, kernel_1, bias_1, ...]`, one pair per layer.
    dense: Vec<DenseVariable>,
    loss_fn: BinaryCrossEntropy,
}

impl DemoModel {
    /// Creates a new `DemoModel`.
    ///
    /// The embedding shard is filtered out of the shared initial snapshot and the dense
    /// weights are drawn from `dense_seed`, so every worker starts from the same model.
    ///
    /// # Arguments
    /// * `training` - The run's training spec.
    /// * `layout` - The part of the vocabulary this model stores.
    pub fn new(training: &TrainingSpec, layout: ShardLayout) -> Result<Self> {
        let dim = training.embedding_vec_size;
        let snapshot =
            embedding::initial_snapshot(training.embedding_init, layout.vocabulary_size(), dim)?;
        let embedding = EmbeddingVariable::from_snapshot(snapshot.view(), layout)?;

        let mut rng = StdRng::seed_from_u64(training.dense_seed);
        let hidden = training.hidden_units.len();
        let mut fan_in = training.slot_num * dim;
        let mut layers = Vec::with_capacity(hidden + 1);
        let mut dense = Vec::with_capacity(2 * (hidden + 1));

        for (i, &units) in training.hidden_units.iter().chain(iter::once(&1)).enumerate() {
            let act_fn = (i < hidden).then(ActFn::relu);
            layers.push(Dense::new((fan_in, units), act_fn));

            // Glorot uniform.
            let limit = (6. / (fan_in + units).max(1) as f32).sqrt();
            let dist = Uniform::new_inclusive(-limit, limit)
                .map_err(|e| MlErr::InvalidDistribution(e.to_string()))?;
            let kernel = (0..fan_in * units).map(|_| dist.sample(&mut rng)).collect();

            dense.push(DenseVariable::new(
                format!("dense_{i}/kernel"),
                vec![fan_in, units],
                kernel,
            ));
            dense.push(DenseVariable::new(
                format!("dense_{i}/bias"),
                vec![units],
                vec![0.; units],
            ));
            fan_in = units;
        }

        Ok(Self {
            combiner: training.combiner,
            embedding,
            layers,
            dense,
            loss_fn: BinaryCrossEntropy::new(training.global_batch_size),
        })
    }

    pub fn embedding(&self) -> &EmbeddingVariable {
        &self.embedding
    }

    pub fn dense_variables(&self) -> &[DenseVariable] {
        &self.dense
    }

    /// Every trainable variable, the embedding first.
    pub fn trainable_variables(&mut self) -> Vec<Trainable<'_>> {
        let Self {
            embedding, dense, ..
        } = self;

        iter::once(Trainable::Embedding(embedding))
            .chain(dense.iter_mut().map(Trainable::Dense))
            .collect()
    }

    /// Runs the forward and backward pass of one replica.
    ///
    /// The parameters are only read, so replicas can run concurrently.
    ///
    /// # Arguments
    /// * `lookup` - The embedding rows of every key in `batch`.
    /// * `batch` - This replica's samples.
    pub fn forward_backward(
        &self,
        lookup: &LookupTable,
        batch: SampleBatch<'_>,
    ) -> Result<ReplicaPass> {
        let keys = batch.keys();
        let embedding_vector = embedding::combine(lookup, keys, self.combiner)?;

        let (rows, slots, dim) = embedding_vector.dim();
        let x = embedding_vector.to_shape((rows, slots * dim))?.into_owned();

        let mut inputs = vec![x];
        let mut caches: Vec<DenseCache> = Vec::with_capacity(self.layers.len());
        for (layer, params) in self.layers.iter().zip(self.dense.chunks_exact(2)) {
            let x = &inputs[inputs.len() - 1];
            let cache = layer.forward(params[0].values(), params[1].values(), x.view())?;
            inputs.push(cache.output().to_owned());
            caches.push(cache);
        }

        let logits = inputs
            .pop()
            .ok_or_else(|| MlErr::InvalidShape("the model has no layers".to_string()))?;
        let labels = batch.labels();
        let loss = self.loss_fn.loss(logits.view(), labels);
        let mut d = self.loss_fn.loss_prime(logits.view(), labels);

        let mut dense_grads: Vec<Vec<f32>> =
            self.dense.iter().map(|v| vec![0.; v.len()]).collect();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let (kernel_grad, bias_grad) = dense_grads[2 * i..2 * i + 2].split_at_mut(1);

            d = layer.backward(
                self.dense[2 * i].values(),
                inputs[i].view(),
                &caches[i],
                d,
                &mut kernel_grad[0],
                &mut bias_grad[0],
            )?;
        }

        let d = d.into_shape_with_order((rows, slots, dim))?;
        let sparse_grad = embedding::combine_backward(keys, d.view(), self.combiner)?;

        Ok(ReplicaPass {
            embedding_vector,
            logits,
            loss,
            dense_grads,
            sparse_grad,
        })
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::EmbeddingInit;
    use ndarray::{Array2, Array3};

    use super::*;
    use crate::dataset::SparseSamples;

    fn spec() -> TrainingSpec {
        TrainingSpec {
            global_batch_size: 4,
            slot_num: 2,
            max_nnz: 2,
            embedding_vec_size: 3,
            vocabulary_size_per_device: 8,
            hidden_units: vec![4],
            ..Default::default()
        }
    }

    fn full_lookup(model: &DemoModel) -> LookupTable {
        let keys: Vec<i64> = (0..8).collect();
        let (served, rows) = model.embedding().serve(&keys).unwrap();
        let mut lookup = LookupTable::new(3);
        lookup.insert(&served, &rows).unwrap();
        lookup
    }

    fn samples() -> SparseSamples {
        let keys = Array3::from_shape_vec(
            (4, 2, 2),
            vec![0, 1, 2, -1, 3, 3, 4, 5, 6, -1, 7, -1, 1, 2, 0, -1],
        )
        .unwrap();
        let labels = Array2::from_shape_vec((4, 1), vec![1., 0., 1., 0.]).unwrap();
        SparseSamples::new(keys, labels).unwrap()
    }

    #[test]
    fn same_spec_same_weights() {
        let a = DemoModel::new(&spec(), ShardLayout::single(8)).unwrap();
        let b = DemoModel::new(&spec(), ShardLayout::single(8)).unwrap();

        assert_eq!(a.dense_variables(), b.dense_variables());
        assert_eq!(a.embedding(), b.embedding());
        let shapes: Vec<_> = a.dense_variables().iter().map(|v| v.shape().to_vec()).collect();
        assert_eq!(shapes, [vec![6, 4], vec![4], vec![4, 1], vec![1]]);
    }

    #[test]
    fn replica_passes_add_up_to_the_whole_batch() {
        let model = DemoModel::new(&spec(), ShardLayout::single(8)).unwrap();
        let lookup = full_lookup(&model);
        let samples = samples();

        let whole = model.forward_backward(&lookup, samples.as_batch()).unwrap();
        let halves: Vec<_> = samples
            .as_batch()
            .split(2)
            .unwrap()
            .into_iter()
            .map(|b| model.forward_backward(&lookup, b).unwrap())
            .collect();

        assert_eq!(whole.embedding_vector.dim(), (4, 2, 3));
        assert!((whole.loss - halves[0].loss - halves[1].loss).abs() < 1e-6);

        for (v, g) in whole.dense_grads.iter().enumerate() {
            for (i, g) in g.iter().enumerate() {
                let summed = halves[0].dense_grads[v][i] + halves[1].dense_grads[v][i];
                assert!((g - summed).abs() < 1e-6);
            }
        }

        let mut parts = halves[0].sparse_grad.clone();
        parts.extend(&halves[1].sparse_grad);
        let a = SparseGrad::coalesce(&[whole.sparse_grad]).unwrap();
        let b = SparseGrad::coalesce(&[parts]).unwrap();
        assert_eq!(a.keys(), b.keys());
        for (x, y) in a.values().iter().zip(b.values()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn embedding_gradient_matches_finite_differences() {
        let spec = TrainingSpec {
            embedding_init: EmbeddingInit::Ones,
            hidden_units: vec![],
            ..spec()
        };
        let model = DemoModel::new(&spec, ShardLayout::single(8)).unwrap();
        let samples = samples();
        let lookup = full_lookup(&model);
        let pass = model.forward_backward(&lookup, samples.as_batch()).unwrap();
        let grad = SparseGrad::coalesce(&[pass.sparse_grad]).unwrap();

        let eps = 1e-2;
        let (key, row) = grad.rows().find(|(k, _)| *k == 3).unwrap();
        let mut shifted = LookupTable::new(3);
        for k in 0..8i64 {
            let mut r = lookup.get(k).unwrap().to_vec();
            if k == key {
                r[0] += eps;
            }
            shifted.insert(&[k], &r).unwrap();
        }

        let up = model.forward_backward(&shifted, samples.as_batch()).unwrap().loss;
        let numeric = (up - pass.loss) / eps;
        assert!((numeric - row[0]).abs() < 1e-2, "{numeric} vs {}", row[0]);
    }

    #[test]
    fn trainable_variables_are_tagged() {
        let mut model = DemoModel::new(&spec(), ShardLayout::single(8)).unwrap();
        let variables = model.trainable_variables();

        assert_eq!(variables.len(), 5);
        assert!(matches!(variables[0], Trainable::Embedding(_)));
        assert!(variables[1..].iter().all(|v| matches!(v, Trainable::Dense(_))));
    }
}
