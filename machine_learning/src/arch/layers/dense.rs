use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};

use crate::{MlErr, Result, arch::activations::ActFn};

/// What `Dense::forward` keeps around for `Dense::backward`.
#[derive(Debug, Clone)]
pub struct DenseCache {
    /// The pre-activation output.
    pub z: Array2<f32>,
    /// The activated output, `None` when the layer has no activation.
    pub a: Option<Array2<f32>>,
}

impl DenseCache {
    /// The output of the layer.
    pub fn output(&self) -> ArrayView2<'_, f32> {
        self.a.as_ref().unwrap_or(&self.z).view()
    }
}

/// A fully connected layer. The layer holds no parameters, they are passed in on every call
/// so several replicas can share them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The amount of inputs and outputs.
    /// * `act_fn` - An optional activation.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self { dim, act_fn }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Computes `act_fn(x * w + b)`.
    ///
    /// # Arguments
    /// * `kernel` - The row major `[inputs, outputs]` weights.
    /// * `bias` - The `[outputs]` biases.
    /// * `x` - The `[batch, inputs]` input.
    pub fn forward(&self, kernel: &[f32], bias: &[f32], x: ArrayView2<f32>) -> Result<DenseCache> {
        let (w, b) = self.view_params(kernel, bias)?;
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "dense input",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        let a = self.act_fn.map(|act_fn| z.mapv(|z| act_fn.f(z)));
        Ok(DenseCache { z, a })
    }

    /// Backpropagates `d` through this layer.
    ///
    /// # Arguments
    /// * `kernel` - The weights used in the forward pass.
    /// * `x` - The input of the forward pass.
    /// * `cache` - The output of the forward pass.
    /// * `d` - The gradient of the loss with respect to this layer's output.
    /// * `kernel_grad` - Overwritten with the gradient of the weights.
    /// * `bias_grad` - Overwritten with the gradient of the biases.
    ///
    /// # Returns
    /// The gradient of the loss with respect to `x`.
    pub fn backward(
        &self,
        kernel: &[f32],
        x: ArrayView2<f32>,
        cache: &DenseCache,
        mut d: Array2<f32>,
        kernel_grad: &mut [f32],
        bias_grad: &mut [f32],
    ) -> Result<Array2<f32>> {
        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&cache.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(kernel_grad, bias_grad)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let w = ArrayView2::from_shape(self.dim, kernel)?;
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        Ok(dx)
    }

    /// Gives a view of the raw parameter slices as the weights and biases of this layer.
    ///
    /// # Returns
    /// An error if the slices don't fit the layer.
    fn view_params<'a>(
        &self,
        kernel: &'a [f32],
        bias: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let weights = ArrayView2::from_shape(self.dim, kernel)?;
        let biases = ArrayView1::from_shape(self.dim.1, bias)?;
        Ok((weights, biases))
    }

    /// Gives a view of the raw gradient slices as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        kernel_grad: &'a mut [f32],
        bias_grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let dw = ArrayViewMut2::from_shape(self.dim, kernel_grad)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, bias_grad)?;
        Ok((dw, db))
    }
}
