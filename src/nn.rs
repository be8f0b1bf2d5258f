//! Components to build a neural network

use std::{
    fmt::{self, Display},
    sync::atomic::{self, AtomicUsize},
};

use clap::ValueEnum;
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::{
    functional,
    loss::NLLLoss,
    params::{ParamViewMut, Parameter},
};

/// Errors for the neural network
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Bias has {bias} entries but the weight matrix has {outputs} outputs")]
    BiasSizeMismatch { outputs: usize, bias: usize },
    #[error("Batch has {inputs} samples but {labels} labels")]
    BatchSizeMismatch { inputs: usize, labels: usize },
    #[error("Label {label} is out of range for {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("Cannot compute a loss over an empty batch")]
    EmptyBatch,
    #[error("A network needs at least an input and an output size, got {0} sizes")]
    TooFewLayers(usize),
    #[error("Forward pass recorded {got} activations but the network expects {expected}")]
    ForwardPassMismatch { expected: usize, got: usize },
    #[error("Forward pass activations around layer {layer} ({name}) do not match its shape")]
    ForwardPassShapeMismatch { layer: usize, name: &'static str },
}

/// A differentiable stage of a network
///
/// `backward` receives the same `input` and `output` that `forward` saw, together with
/// the gradient of the loss with respect to `output`. It accumulates gradients into the
/// layer's own parameters and returns the gradient with respect to `input`.
pub trait Layer {
    fn name(&self) -> &'static str;

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError>;

    fn backward(
        &mut self,
        input: &Array2<f32>,
        output: &Array2<f32>,
        upstream: &Array2<f32>,
    ) -> Array2<f32>;

    /// Whether `input` and `output` have the shapes this layer's `forward` reads and writes
    fn accepts_activations(&self, input: &Array2<f32>, output: &Array2<f32>) -> bool {
        input.dim() == output.dim()
    }

    fn parameters_mut(&mut self) -> Vec<ParamViewMut<'_>> {
        Vec::new()
    }

    fn zero_grad(&mut self) {
        for mut p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Number of trainable scalars
    fn n_parameters(&self) -> usize {
        0
    }

    /// Units that did not activate during the last forward pass (used for debugging)
    fn n_dead_neurons(&self) -> Option<usize> {
        None
    }
}

/// Fully connected layer computing `y = xW + b`
pub struct Linear {
    /// `[n_inputs, n_outputs]`
    weight: Parameter<Ix2>,
    /// `[n_outputs]`
    bias: Parameter<Ix1>,
    n_output_nans: AtomicUsize,
    n_parameters_nans: AtomicUsize,
}

impl Linear {
    /// Creates a layer with He-initialised weights and zero biases
    pub fn new<R: Rng + ?Sized>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        // He initialization to ensure the variance of the output is the same as the input
        // and keep weights relatively small to avoid exploding or vanishing gradients
        let std = (2.0 / n_inputs.max(1) as f32).sqrt();
        let weight = Array2::from_shape_simple_fn((n_inputs, n_outputs), || {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        });
        Self::from_parameters(weight, Array1::zeros(n_outputs))
    }

    /// Creates a layer with every weight and bias set to zero
    pub fn zeros(n_inputs: usize, n_outputs: usize) -> Self {
        Self::from_parameters(
            Array2::zeros((n_inputs, n_outputs)),
            Array1::zeros(n_outputs),
        )
    }

    /// Creates a layer from explicit weights `[n_inputs, n_outputs]` and biases `[n_outputs]`
    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, NNError> {
        if bias.len() != weight.ncols() {
            return Err(NNError::BiasSizeMismatch {
                outputs: weight.ncols(),
                bias: bias.len(),
            });
        }
        Ok(Self::from_parameters(weight, bias))
    }

    fn from_parameters(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self {
            weight: Parameter::new("weight", weight),
            bias: Parameter::new("bias", bias),
            n_output_nans: AtomicUsize::new(0),
            n_parameters_nans: AtomicUsize::new(0),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.weight.value().nrows()
    }

    pub fn n_outputs(&self) -> usize {
        self.weight.value().ncols()
    }

    pub fn weight(&self) -> &Parameter<Ix2> {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter<Ix1> {
        &self.bias
    }

    /// NaNs seen in the outputs of the last forward pass
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }

    /// NaNs seen in the parameters during the last forward pass
    pub fn n_parameters_nans(&self) -> usize {
        self.n_parameters_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Layer for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        if input.ncols() != self.n_inputs() {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs(),
                got: input.ncols(),
            });
        }
        let output = input.dot(self.weight.value()) + self.bias.value();

        let n_output_nans = output.iter().filter(|v| v.is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        let n_parameters_nans = self
            .weight
            .value()
            .iter()
            .chain(self.bias.value().iter())
            .filter(|v| v.is_nan())
            .count();
        self.n_parameters_nans
            .store(n_parameters_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 || n_parameters_nans > 0 {
            log::debug!(
                "n_output_nans: {}, n_parameters_nans: {}",
                n_output_nans,
                n_parameters_nans
            );
        }
        Ok(output)
    }

    fn backward(
        &mut self,
        input: &Array2<f32>,
        _output: &Array2<f32>,
        upstream: &Array2<f32>,
    ) -> Array2<f32> {
        // dW = x^T g, db = column sums of g, dx = g W^T
        *self.weight.grad_mut() += &input.t().dot(upstream);
        *self.bias.grad_mut() += &upstream.sum_axis(Axis(0));
        upstream.dot(&self.weight.value().t())
    }

    fn accepts_activations(&self, input: &Array2<f32>, output: &Array2<f32>) -> bool {
        input.ncols() == self.n_inputs() && output.dim() == (input.nrows(), self.n_outputs())
    }

    fn parameters_mut(&mut self) -> Vec<ParamViewMut<'_>> {
        vec![self.weight.view_mut(), self.bias.view_mut()]
    }

    fn n_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Applies the logistic sigmoid element-wise
#[derive(Default)]
pub struct Sigmoid {}

impl Sigmoid {
    pub fn new() -> Self {
        Self {}
    }
}

impl Layer for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        Ok(functional::sigmoid(input))
    }

    fn backward(
        &mut self,
        _input: &Array2<f32>,
        output: &Array2<f32>,
        upstream: &Array2<f32>,
    ) -> Array2<f32> {
        functional::sigmoid_backward(output, upstream)
    }
}

/// Applies ReLU element-wise, works for arbitrary widths
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }
}

impl Layer for ReLU {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        // a unit is dead for the batch if no sample activates it
        let n_dead_neurons = input
            .columns()
            .into_iter()
            .filter(|col| col.iter().all(|v| *v <= 0.0))
            .count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(functional::relu(input))
    }

    fn backward(
        &mut self,
        input: &Array2<f32>,
        _output: &Array2<f32>,
        upstream: &Array2<f32>,
    ) -> Array2<f32> {
        functional::relu_backward(input, upstream)
    }

    fn n_dead_neurons(&self) -> Option<usize> {
        Some(self.n_dead_neurons.load(atomic::Ordering::Relaxed))
    }
}

const LOG_SOFTMAX_NAME: &str = "log_softmax";

/// Applies log-softmax to each row, producing per-class log-probabilities
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }
}

impl Layer for LogSoftmax {
    fn name(&self) -> &'static str {
        LOG_SOFTMAX_NAME
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        Ok(functional::log_softmax(input))
    }

    fn backward(
        &mut self,
        _input: &Array2<f32>,
        output: &Array2<f32>,
        upstream: &Array2<f32>,
    ) -> Array2<f32> {
        functional::log_softmax_backward(output, upstream)
    }
}

/// Hidden-layer nonlinearity for [`Network::mlp`]
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Sigmoid,
    #[value(name = "relu")]
    ReLU,
}

impl Activation {
    pub fn layer(self) -> Box<dyn Layer> {
        match self {
            Activation::Sigmoid => Box::new(Sigmoid::new()),
            Activation::ReLU => Box::new(ReLU::new()),
        }
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Sigmoid => write!(f, "sigmoid"),
            Activation::ReLU => write!(f, "relu"),
        }
    }
}

/// Activations recorded by [`Network::forward`] for use by [`Network::backward`]
///
/// `activations[0]` is the input batch and `activations[i + 1]` is the output of layer `i`,
/// so the last entry holds the log-probabilities.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    activations: Vec<Array2<f32>>,
}

impl ForwardPass {
    pub fn activations(&self) -> &[Array2<f32>] {
        &self.activations
    }

    /// Per-class log-probabilities, `[batch, n_classes]`
    pub fn log_probs(&self) -> &Array2<f32> {
        // a pass always holds at least the input
        &self.activations[self.activations.len() - 1]
    }

    pub fn into_log_probs(mut self) -> Array2<f32> {
        self.activations.swap_remove(self.activations.len() - 1)
    }
}

/// An ordered sequence of layers ending in [`LogSoftmax`]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
}

impl Network {
    /// Wraps layers producing raw class scores and ends them with a single [`LogSoftmax`] head
    ///
    /// A trailing [`LogSoftmax`] in `layers` is kept as the head instead of adding a second one.
    pub fn new(mut layers: Vec<Box<dyn Layer>>) -> Self {
        let has_head = layers
            .last()
            .is_some_and(|layer| layer.name() == LOG_SOFTMAX_NAME);
        if !has_head {
            layers.push(Box::new(LogSoftmax::new()));
        }
        Self { layers }
    }

    /// Builds `Linear -> activation -> ... -> Linear -> LogSoftmax` for the given widths,
    /// e.g. `[784, 128, 64, 10]`
    pub fn mlp<R: Rng + ?Sized>(
        sizes: &[usize],
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if sizes.len() < 2 {
            return Err(NNError::TooFewLayers(sizes.len()));
        }
        let n_linear = sizes.len() - 1;
        let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(2 * n_linear);
        for (idx, pair) in sizes.windows(2).enumerate() {
            layers.push(Box::new(Linear::new(pair[0], pair[1], rng)));
            if idx + 1 < n_linear {
                layers.push(activation.layer());
            }
        }
        Ok(Self::new(layers))
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    /// Applies every layer in order, recording each intermediate activation
    pub fn forward(&self, input: &Array2<f32>) -> Result<ForwardPass, NNError> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        let mut current = input.clone();
        for layer in self.layers.iter() {
            let next = layer.forward(&current)?;
            activations.push(std::mem::replace(&mut current, next));
        }
        activations.push(current);
        Ok(ForwardPass { activations })
    }

    /// Accumulates the gradient of the mean negative log-likelihood of `labels`
    /// into every parameter
    ///
    /// The [`LogSoftmax`] head is not differentiated on its own: propagation starts
    /// from the fused gradient with respect to the raw scores. Gradients add onto
    /// whatever is already stored, so call [`Network::zero_grad`] first.
    ///
    /// `pass` must come from this network; it is validated before any gradient is touched.
    pub fn backward(&mut self, pass: &ForwardPass, labels: &[usize]) -> Result<(), NNError> {
        let n_layers = self.layers.len();
        if pass.activations.len() != n_layers + 1 {
            return Err(NNError::ForwardPassMismatch {
                expected: n_layers + 1,
                got: pass.activations.len(),
            });
        }
        for (idx, (layer, io)) in self
            .layers
            .iter()
            .zip(pass.activations.windows(2))
            .enumerate()
        {
            if !layer.accepts_activations(&io[0], &io[1]) {
                return Err(NNError::ForwardPassShapeMismatch {
                    layer: idx,
                    name: layer.name(),
                });
            }
        }
        let mut upstream = NLLLoss::grad_logits(pass.log_probs(), labels)?;
        for (idx, layer) in self.layers[..n_layers - 1].iter_mut().enumerate().rev() {
            upstream = layer.backward(
                &pass.activations[idx],
                &pass.activations[idx + 1],
                &upstream,
            );
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.zero_grad();
        }
    }

    /// All parameters in layer order
    pub fn parameters_mut(&mut self) -> Vec<ParamViewMut<'_>> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }

    pub fn n_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.n_parameters()).sum()
    }

    /// Total dead units across every ReLU layer in the last forward pass
    pub fn n_dead_neurons(&self) -> usize {
        self.layers.iter().filter_map(|l| l.n_dead_neurons()).sum()
    }

    /// Per-class probabilities; each row sums to 1
    pub fn predict_proba(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        Ok(self.forward(input)?.into_log_probs().mapv(f32::exp))
    }

    /// Most likely class for each row
    pub fn predict(&self, input: &Array2<f32>) -> Result<Vec<usize>, NNError> {
        let log_probs = self.forward(input)?.into_log_probs();
        Ok(crate::loss::argmax_rows(&log_probs))
    }
}
