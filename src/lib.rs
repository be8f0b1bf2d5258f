//! A small library for training feed-forward classifiers on flattened images
//! with an explicit forward pass, a hand-written backward pass and plain SGD.

pub mod dataloader;
pub mod datasets;
pub mod functional;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod params;
pub mod trainer;
