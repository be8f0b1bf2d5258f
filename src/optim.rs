//! Optimizer(s)

use ndarray::ArrayD;

use crate::params::ParamViewMut;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
///
/// Parameters are passed in on every step rather than held, since each one is owned
/// by its layer. They must arrive in the same order on every call.
pub trait Optim {
    /// Performs a single optimization step with freshly computed gradients
    fn step(&mut self, params: Vec<ParamViewMut<'_>>);
}

/// Stochastic gradient descent with optional momentum
pub struct SGD {
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter, only allocated when momentum is used
    velocity: Vec<ArrayD<f32>>,
}

impl SGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    #[cfg(test)]
    fn velocities(&self) -> &[ArrayD<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self, params: Vec<ParamViewMut<'_>>) {
        if self.momentum == 0.0 {
            // plain SGD: param <- param - lr * grad
            for mut param in params {
                param.value.scaled_add(-self.lr, &param.grad);
            }
            return;
        }

        let shapes_match = self.velocity.len() == params.len()
            && self
                .velocity
                .iter()
                .zip(params.iter())
                .all(|(v, p)| v.shape() == p.value.shape());
        if !shapes_match {
            self.velocity = params
                .iter()
                .map(|p| ArrayD::zeros(p.value.raw_dim()))
                .collect();
        }

        for (mut param, velocity) in params.into_iter().zip(self.velocity.iter_mut()) {
            // v <- momentum * v - lr * grad; param <- param + v
            velocity.mapv_inplace(|v| v * self.momentum);
            velocity.scaled_add(-self.lr, &param.grad);
            param.value += &*velocity;
        }
    }
}
