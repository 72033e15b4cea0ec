use super::Optimizer;
use crate::{MlErr, Result};

/// The hyperparameters of Adam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl AdamConfig {
    /// Adam with the usual betas and the given learning rate.
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }

    /// The bias corrected step size of step `t`, counted from 1.
    pub(super) fn step_size(&self, beta1_t: f32, beta2_t: f32) -> f32 {
        let bc1 = 1. - beta1_t;
        let bc2 = 1. - beta2_t;
        self.learning_rate * (bc2.sqrt() / bc1)
    }

    /// Updates one parameter and its moments.
    pub(super) fn update(&self, step_size: f32, p: &mut f32, g: f32, m: &mut f32, v: &mut f32) {
        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        *m = b1 * *m + (1. - b1) * g;
        *v = b2 * *v + (1. - b2) * g.powi(2);
        *p -= step_size * *m / (v.sqrt() + eps);
    }
}

#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `config` - The hyperparameters.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, config: AdamConfig) -> Self {
        Self {
            config,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        if grad.len() != params.len() || params.len() != self.m.len() {
            return Err(MlErr::SizeMismatch {
                what: "adam parameters",
                got: grad.len(),
                expected: self.m.len(),
            });
        }

        self.beta1_t *= self.config.beta1;
        self.beta2_t *= self.config.beta2;
        let step_size = self.config.step_size(self.beta1_t, self.beta2_t);
        let config = self.config;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
            .for_each(|(((p, &g), m), v)| config.update(step_size, p, g, m, v));

        Ok(())
    }
}
