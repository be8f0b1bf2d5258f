//! Loss function(s)

use std::cmp::Ordering;

use ndarray::Array2;

use crate::nn::NNError;

/// Mean negative log-likelihood of the true classes, given log-probabilities
///
/// Always paired with a log-softmax output layer; feeding it plain probabilities
/// would lose precision for values near 0 or 1.
pub struct NLLLoss;

impl NLLLoss {
    /// `-(1/n) Σ_i log_probs[i, labels[i]]`
    pub fn call(log_probs: &Array2<f32>, labels: &[usize]) -> Result<f32, NNError> {
        check_targets(log_probs, labels)?;
        let total = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| log_probs[[i, label]])
            .sum::<f32>();
        Ok(-total / labels.len() as f32)
    }

    /// Gradient with respect to the log-probabilities: `-1/n` at each true class
    pub fn grad_log_probs(log_probs: &Array2<f32>, labels: &[usize]) -> Result<Array2<f32>, NNError> {
        check_targets(log_probs, labels)?;
        let n = labels.len() as f32;
        let mut grad = Array2::zeros(log_probs.raw_dim());
        for (i, &label) in labels.iter().enumerate() {
            grad[[i, label]] = -1.0 / n;
        }
        Ok(grad)
    }

    /// Gradient with respect to the raw scores feeding the log-softmax:
    /// `(softmax(z)_i - 1{i = label}) / n`
    ///
    /// `softmax(z)` is recovered as `exp(log_probs)`, so the two operations are
    /// differentiated together without going through the log-softmax Jacobian.
    pub fn grad_logits(log_probs: &Array2<f32>, labels: &[usize]) -> Result<Array2<f32>, NNError> {
        check_targets(log_probs, labels)?;
        let n = labels.len() as f32;
        let mut grad = log_probs.mapv(f32::exp);
        for (mut row, &label) in grad.rows_mut().into_iter().zip(labels.iter()) {
            row[label] -= 1.0;
        }
        grad.mapv_inplace(|g| g / n);
        Ok(grad)
    }
}

fn check_targets(log_probs: &Array2<f32>, labels: &[usize]) -> Result<(), NNError> {
    if labels.is_empty() {
        return Err(NNError::EmptyBatch);
    }
    if log_probs.nrows() != labels.len() {
        return Err(NNError::BatchSizeMismatch {
            inputs: log_probs.nrows(),
            labels: labels.len(),
        });
    }
    let n_classes = log_probs.ncols();
    if let Some(&label) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(NNError::LabelOutOfRange { label, n_classes });
    }
    Ok(())
}

/// Index of the largest entry in each row
pub fn argmax_rows(scores: &Array2<f32>) -> Vec<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .collect()
}

/// Number of rows whose most likely class matches the label
pub fn n_correct(scores: &Array2<f32>, labels: &[usize]) -> usize {
    argmax_rows(scores)
        .into_iter()
        .zip(labels.iter())
        .filter(|(pred, label)| pred == *label)
        .count()
}

/// Fraction of rows whose most likely class matches the label
pub fn accuracy(scores: &Array2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    n_correct(scores, labels) as f32 / labels.len() as f32
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{assert_eq_float, functional::log_softmax};

    #[test]
    fn test_nll_loss() {
        let log_probs = array![[0.25f32.ln(), 0.75f32.ln()], [0.5f32.ln(), 0.5f32.ln()]];
        let loss = NLLLoss::call(&log_probs, &[1, 0]).unwrap();
        assert_eq_float!(loss, -(0.75f32.ln() + 0.5f32.ln()) / 2.0);
    }

    #[test]
    fn test_nll_loss_of_uniform_prediction() {
        let log_probs = log_softmax(&Array2::zeros((3, 4)));
        let loss = NLLLoss::call(&log_probs, &[0, 1, 3]).unwrap();
        assert_eq_float!(loss, 4.0f32.ln());
    }

    #[test]
    fn test_grad_logits() {
        let logits = array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]];
        let log_probs = log_softmax(&logits);
        let grad = NLLLoss::grad_logits(&log_probs, &[2, 0]).unwrap();
        let probs = log_probs.mapv(f32::exp);
        assert_eq_float!(grad[[0, 0]], probs[[0, 0]] / 2.0);
        assert_eq_float!(grad[[0, 2]], (probs[[0, 2]] - 1.0) / 2.0);
        assert_eq_float!(grad[[1, 0]], (1.0 / 3.0 - 1.0) / 2.0);
        // each row of softmax - one_hot sums to zero
        for row in grad.rows() {
            assert_eq_float!(row.sum(), 0.0);
        }
    }

    #[test]
    fn test_grad_log_probs() {
        let log_probs = log_softmax(&Array2::zeros((2, 3)));
        let grad = NLLLoss::grad_log_probs(&log_probs, &[1, 2]).unwrap();
        assert_eq!(grad, array![[0.0, -0.5, 0.0], [0.0, 0.0, -0.5]]);
    }

    #[test]
    fn test_target_errors() {
        let log_probs = log_softmax(&Array2::zeros((2, 3)));
        assert_eq!(
            NLLLoss::call(&log_probs, &[0, 3]),
            Err(NNError::LabelOutOfRange {
                label: 3,
                n_classes: 3
            })
        );
        assert_eq!(
            NLLLoss::call(&log_probs, &[0]),
            Err(NNError::BatchSizeMismatch {
                inputs: 2,
                labels: 1
            })
        );
        assert_eq!(
            NLLLoss::grad_logits(&Array2::zeros((0, 3)), &[]),
            Err(NNError::EmptyBatch)
        );
    }

    #[test]
    fn test_accuracy() {
        let scores = array![[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]];
        assert_eq!(argmax_rows(&scores), vec![1, 0, 1]);
        assert_eq!(n_correct(&scores, &[1, 1, 1]), 2);
        assert_eq_float!(accuracy(&scores, &[1, 0, 1]), 1.0);
        assert_eq_float!(accuracy(&scores, &[]), 0.0);
    }
}
