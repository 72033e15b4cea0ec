use ndarray::{Array2, ArrayView2, Zip};

use super::LossFn;
use crate::arch::activations::Sigmoid;

/// Binary cross entropy computed from logits, summed and scaled by the global batch size.
///
/// Dividing by the global batch instead of the replica batch makes the losses of every
/// replica add up to the mean loss of the whole step, whatever the amount of replicas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryCrossEntropy {
    global_batch_size: usize,
}

impl BinaryCrossEntropy {
    /// Returns a new `BinaryCrossEntropy`.
    ///
    /// # Arguments
    /// * `global_batch_size` - The amount of samples of a step across every replica.
    pub fn new(global_batch_size: usize) -> Self {
        Self { global_batch_size }
    }

    fn scale(&self) -> f32 {
        1. / self.global_batch_size.max(1) as f32
    }
}

impl LossFn for BinaryCrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        // max(z, 0) - z * y + ln(1 + e^-|z|)
        let sum = Zip::from(&y_pred)
            .and(&y)
            .fold(0., |acc, &z, &y| acc + z.max(0.) - z * y + (-z.abs()).exp().ln_1p());

        sum * self.scale()
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let scale = self.scale();
        Zip::from(&y_pred)
            .and(&y)
            .map_collect(|&z, &y| (Sigmoid.f(z) - y) * scale)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn zero_logit_costs_ln2_per_sample() {
        let bce = BinaryCrossEntropy::new(4);
        let z = array![[0.0], [0.0]];
        let y = array![[1.0], [0.0]];

        let loss = bce.loss(z.view(), y.view());
        assert!((loss - 2. * 2f32.ln() / 4.).abs() < 1e-6);
        assert_eq!(bce.loss_prime(z.view(), y.view()), array![[-0.125], [0.125]]);
    }

    #[test]
    fn replica_losses_add_up() {
        let bce = BinaryCrossEntropy::new(4);
        let z = array![[1.5], [-0.3], [2.0], [-4.0]];
        let y = array![[1.0], [0.0], [0.0], [1.0]];

        let whole = bce.loss(z.view(), y.view());
        let halves = bce.loss(z.slice(ndarray::s![..2, ..]), y.slice(ndarray::s![..2, ..]))
            + bce.loss(z.slice(ndarray::s![2.., ..]), y.slice(ndarray::s![2.., ..]));

        assert!((whole - halves).abs() < 1e-6);
    }

    #[test]
    fn large_logits_stay_finite() {
        let bce = BinaryCrossEntropy::new(1);
        let loss = bce.loss(array![[-100.0]].view(), array![[1.0]].view());
        assert!((loss - 100.0).abs() < 1e-3);
    }
}
