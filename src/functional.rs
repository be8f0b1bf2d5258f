//! Pointwise and row-wise activation kernels with their local derivative rules
//!
//! Each `*_backward` takes the gradient of the loss with respect to the kernel's
//! output (`upstream`) and returns the gradient with respect to its input.

use ndarray::{Array2, Axis, Zip};

/// `σ(z) = 1 / (1 + e^-z)`
pub fn sigmoid(z: &Array2<f32>) -> Array2<f32> {
    // e^-z overflows to inf for very negative z, which still yields 0
    z.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// `∂z = upstream ⊙ σ(z) ⊙ (1 - σ(z))`, using the recorded output `σ(z)`
pub fn sigmoid_backward(output: &Array2<f32>, upstream: &Array2<f32>) -> Array2<f32> {
    let mut grad = upstream.clone();
    Zip::from(&mut grad)
        .and(output)
        .for_each(|g, &s| *g *= s * (1.0 - s));
    grad
}

/// `max(0, z)`
pub fn relu(z: &Array2<f32>) -> Array2<f32> {
    z.mapv(|v| v.max(0.0))
}

/// Passes `upstream` through where the input was positive, zero elsewhere
pub fn relu_backward(input: &Array2<f32>, upstream: &Array2<f32>) -> Array2<f32> {
    let mut grad = upstream.clone();
    Zip::from(&mut grad).and(input).for_each(|g, &z| {
        if z <= 0.0 {
            *g = 0.0;
        }
    });
    grad
}

/// Row-wise `z_i - log Σ_k e^{z_k}`
///
/// The row maximum is subtracted before exponentiating so that large logits
/// cannot overflow, and probabilities near 0 or 1 are never materialised.
pub fn log_softmax(z: &Array2<f32>) -> Array2<f32> {
    let mut out = z.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum_exp = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        row.mapv_inplace(|v| v - log_sum_exp);
    }
    out
}

/// Row-wise softmax, computed through [`log_softmax`]
pub fn softmax(z: &Array2<f32>) -> Array2<f32> {
    log_softmax(z).mapv(f32::exp)
}

/// Standalone log-softmax derivative: `∂z = upstream - softmax(z) ⊙ Σ_k upstream_k`
///
/// Training never takes this path; the negative log-likelihood loss folds the
/// log-softmax into its own gradient (see [`crate::loss::NLLLoss::grad_logits`]).
pub fn log_softmax_backward(output: &Array2<f32>, upstream: &Array2<f32>) -> Array2<f32> {
    let row_sums = upstream.sum_axis(Axis(1)).insert_axis(Axis(1));
    let probs = output.mapv(f32::exp);
    upstream - &(&probs * &row_sums)
}
