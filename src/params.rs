//! Trainable tensors, each paired with the gradient of the loss with respect to it

use ndarray::{Array, ArrayViewMutD, Dimension};

/// A named tensor owned by exactly one layer
///
/// The gradient has the same shape as the value and is only ever written by the
/// owning layer's backward pass. It accumulates, so it must be zeroed before each
/// backward pass (see [`crate::trainer::Trainer::step`]).
#[derive(Debug, Clone)]
pub struct Parameter<D: Dimension> {
    name: String,
    value: Array<f32, D>,
    grad: Array<f32, D>,
}

impl<D: Dimension> Parameter<D> {
    /// Creates a parameter with a zeroed gradient
    pub fn new(name: impl Into<String>, value: Array<f32, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Array<f32, D> {
        &self.value
    }

    pub fn grad(&self) -> &Array<f32, D> {
        &self.grad
    }

    pub(crate) fn grad_mut(&mut self) -> &mut Array<f32, D> {
        &mut self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Number of scalars in the tensor
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Borrows the value mutably and the gradient alongside it, erasing the dimension
    /// so optimizers can treat every parameter uniformly
    pub fn view_mut(&mut self) -> ParamViewMut<'_> {
        ParamViewMut {
            name: &self.name,
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.view_mut().into_dyn(),
        }
    }
}

/// Mutable, dimension-erased view of a [`Parameter`]
#[derive(Debug)]
pub struct ParamViewMut<'a> {
    pub name: &'a str,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewMutD<'a, f32>,
}

impl ParamViewMut<'_> {
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}
