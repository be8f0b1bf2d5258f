//! Trains a multilayer perceptron for multiclass classification
//! using the library provided by `mlp_rs`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run
//! RUST_LOG=info cargo run -- --dataset mnist --data-dir data/fashion
//! ```
//!
//! Supports synthetic datasets out of the box and locally downloaded MNIST-format files,
//! and allows custom layer sizes, learning rate, momentum, batch size, etc.

use std::{error::Error, path::PathBuf};

use mlp_rs::{
    datasets::{Dataset, Split, load_split},
    nn::{Activation, Network},
    optim::SGD,
    trainer::{EpochStats, TrainConfig, TrainError, Trainer},
};

use clap::Parser;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Digits)]
    dataset: Dataset,
    /// Directory holding `train-*` and `t10k-*` IDX files for `--dataset mnist`
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    /// Samples per class for synthetic datasets
    #[clap(short, long, default_value_t = 200)]
    class_size: usize,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 10)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.01)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.0)]
    momentum: f32,
    #[clap(short, long, default_value_t = 1)]
    print_epochs: usize,
    // Note that when increasing the hidden size, activation values may explode if
    // the weights are not initialized properly
    #[clap(long, value_delimiter = ',', default_values_t = vec![128, 64])]
    hidden_units: Vec<usize>,
    #[clap(long, default_value_t = Activation::ReLU)]
    activation: Activation,
    #[clap(long, default_value_t = 42)]
    seed: u64,
}

impl Args {
    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            lr: self.lr,
            momentum: self.momentum,
            print_every: self.print_epochs,
            seed: self.seed,
        }
    }

    fn layer_sizes(&self) -> Vec<usize> {
        std::iter::once(self.dataset.input_dim())
            .chain(self.hidden_units.iter().copied())
            .chain(std::iter::once(self.dataset.n_classes()))
            .collect()
    }
}

fn run(args: &Args) -> Result<Vec<EpochStats>, TrainError> {
    let config = args.train_config();
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);

    let (train_data, train_labels) = load_split(
        args.dataset,
        Split::Train,
        args.class_size,
        &args.data_dir,
        &mut rng,
    )?;
    let (test_data, test_labels) = load_split(
        args.dataset,
        Split::Test,
        args.class_size,
        &args.data_dir,
        &mut rng,
    )?;
    let train_loader = config.loader(train_data, train_labels, true)?;
    let test_loader = config.loader(test_data, test_labels, false)?;

    let sizes = args.layer_sizes();
    let network = Network::mlp(&sizes, args.activation, &mut rng)?;
    log::info!(
        "dataset: {}, train samples: {}, test samples: {}, layers: {:?} ({}), parameters: {}",
        args.dataset,
        train_loader.len(),
        test_loader.len(),
        sizes,
        args.activation,
        network.n_parameters()
    );

    let optim = SGD::new(config.lr, config.momentum);
    let mut trainer = Trainer::new(network, optim, config);
    trainer.fit(&train_loader, Some(&test_loader))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let history = run(&args)?;
    if let Some(last) = history.last() {
        let test_accuracy = last.test.map(|m| m.accuracy).unwrap_or(f32::NAN);
        println!(
            "{} epochs, final train loss {:.4}, test accuracy {:.2}%",
            last.epoch,
            last.train.loss,
            100.0 * test_accuracy
        );
    }
    Ok(())
}
