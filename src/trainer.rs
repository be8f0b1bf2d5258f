//! Training loop: zero gradients, forward, loss, backward, update

use ndarray::Array2;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    dataloader::{Batch, DataLoader, DataLoaderError},
    datasets::DatasetError,
    loss::{self, NLLLoss},
    nn::{NNError, Network},
    optim::Optim,
};

/// Errors surfaced while training
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Hyperparameters of a training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f32,
    pub momentum: f32,
    /// Log metrics every `print_every` epochs (the last epoch is always logged)
    pub print_every: usize,
    /// Seeds batch shuffling
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 64,
            lr: 0.01,
            momentum: 0.0,
            print_every: 1,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Batches `inputs` and `labels` with this run's batch size
    pub fn loader(
        &self,
        inputs: Array2<f32>,
        labels: Vec<usize>,
        shuffle: bool,
    ) -> Result<DataLoader, DataLoaderError> {
        DataLoader::new(inputs, labels, self.batch_size, shuffle)
    }
}

/// Mean loss and accuracy over a set of samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// Summary of one epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// 1-based epoch number
    pub epoch: usize,
    pub n_batches: usize,
    /// Averaged over the steps of the epoch, i.e. while the parameters were changing
    pub train: Metrics,
    pub test: Option<Metrics>,
}

// running sums, weighted by batch size
#[derive(Default)]
struct MetricsAccumulator {
    loss_sum: f32,
    n_correct: usize,
    n_samples: usize,
}

impl MetricsAccumulator {
    fn add(&mut self, loss: f32, n_correct: usize, n_samples: usize) {
        self.loss_sum += loss * n_samples as f32;
        self.n_correct += n_correct;
        self.n_samples += n_samples;
    }

    fn finish(&self) -> Metrics {
        let n = self.n_samples.max(1) as f32;
        Metrics {
            loss: self.loss_sum / n,
            accuracy: self.n_correct as f32 / n,
        }
    }
}

/// Owns a network and its optimizer and runs the per-batch training step
pub struct Trainer<O: Optim> {
    network: Network,
    optim: O,
    config: TrainConfig,
    rng: Pcg64Mcg,
    epoch: usize,
}

impl<O: Optim> Trainer<O> {
    pub fn new(network: Network, optim: O, config: TrainConfig) -> Self {
        let rng = Pcg64Mcg::seed_from_u64(config.seed);
        Self {
            network,
            optim,
            config,
            rng,
            epoch: 0,
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Epochs completed so far
    pub fn epochs_completed(&self) -> usize {
        self.epoch
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    /// Runs one training step on `batch` and returns its loss
    ///
    /// Gradients are always zeroed first, so every update uses gradients computed
    /// from this batch alone.
    pub fn step(&mut self, batch: &Batch) -> Result<f32, NNError> {
        self.step_inner(batch).map(|(loss, _)| loss)
    }

    fn step_inner(&mut self, batch: &Batch) -> Result<(f32, usize), NNError> {
        self.network.zero_grad();
        let pass = self.network.forward(&batch.inputs)?;
        let loss = NLLLoss::call(pass.log_probs(), &batch.labels)?;
        self.network.backward(&pass, &batch.labels)?;
        self.optim.step(self.network.parameters_mut());

        if !loss.is_finite() {
            log::warn!("non-finite loss {} in epoch {}", loss, self.epoch + 1);
        }
        let n_correct = loss::n_correct(pass.log_probs(), &batch.labels);
        Ok((loss, n_correct))
    }

    /// One pass over every batch of `loader`, reshuffled if the loader shuffles
    pub fn train_epoch(&mut self, loader: &DataLoader) -> Result<EpochStats, TrainError> {
        let mut metrics = MetricsAccumulator::default();
        let mut n_batches = 0;
        let mut total_n_dead_neurons = 0;
        for batch in loader.iter_with(&mut self.rng) {
            let (loss, n_correct) = self.step_inner(&batch)?;
            metrics.add(loss, n_correct, batch.len());
            total_n_dead_neurons += self.network.n_dead_neurons();
            n_batches += 1;
        }
        self.epoch += 1;
        log::debug!(
            "Average n_dead_neurons in epoch {}: {}",
            self.epoch,
            total_n_dead_neurons / n_batches.max(1)
        );
        Ok(EpochStats {
            epoch: self.epoch,
            n_batches,
            train: metrics.finish(),
            test: None,
        })
    }

    /// Loss and accuracy over `loader` without touching the parameters
    pub fn evaluate(&self, loader: &DataLoader) -> Result<Metrics, NNError> {
        let mut metrics = MetricsAccumulator::default();
        for batch in loader.iter_ordered() {
            let pass = self.network.forward(&batch.inputs)?;
            let loss = NLLLoss::call(pass.log_probs(), &batch.labels)?;
            let n_correct = loss::n_correct(pass.log_probs(), &batch.labels);
            metrics.add(loss, n_correct, batch.len());
        }
        Ok(metrics.finish())
    }

    /// Trains for `config.epochs` epochs, evaluating on `test` after each one
    pub fn fit(
        &mut self,
        train: &DataLoader,
        test: Option<&DataLoader>,
    ) -> Result<Vec<EpochStats>, TrainError> {
        let epochs = self.config.epochs;
        let print_every = self.config.print_every.max(1);
        if train.batch_size() != self.config.batch_size {
            log::warn!(
                "train loader batch size {} differs from the configured {}",
                train.batch_size(),
                self.config.batch_size
            );
        }
        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let mut stats = self.train_epoch(train)?;
            if let Some(test) = test {
                stats.test = Some(self.evaluate(test)?);
            }
            if epoch % print_every == 0 || epoch == epochs - 1 {
                match stats.test {
                    Some(test) => log::info!(
                        "epoch: {}, train_loss: {:.4}, train_acc: {:.3}, test_loss: {:.4}, test_acc: {:.3}",
                        stats.epoch,
                        stats.train.loss,
                        stats.train.accuracy,
                        test.loss,
                        test.accuracy
                    ),
                    None => log::info!(
                        "epoch: {}, train_loss: {:.4}, train_acc: {:.3}",
                        stats.epoch,
                        stats.train.loss,
                        stats.train.accuracy
                    ),
                }
            }
            history.push(stats);
        }
        Ok(history)
    }
}
