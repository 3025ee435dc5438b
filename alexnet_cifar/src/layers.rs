use std::cell::RefCell;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::{Precision, Tensor};

/// Whether a forward pass is part of training or evaluation. Batch
/// normalisation and dropout read it; every other layer ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

fn mismatch(stage: &str, expected: String, actual: &[usize]) -> Error {
    Error::ShapeMismatch {
        stage: stage.into(),
        expected,
        actual: actual.to_vec(),
    }
}

/// Output extent of a sliding window that must tile the input exactly.
fn window_extent(size: usize, kernel_size: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    if stride == 0 || padded < kernel_size || (padded - kernel_size) % stride != 0 {
        return None;
    }
    Some((padded - kernel_size) / stride + 1)
}

pub struct Linear {
    pub weights: Parameter,
    pub biases: Option<Parameter>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let weights = Tensor::kaiming_he_init(vec![in_features, out_features], in_features, rng);
        let biases = bias.then(|| Parameter::new("bias", Tensor::zeros(vec![out_features])));

        Linear {
            weights: Parameter::new("weight", weights),
            biases,
            in_features,
            out_features,
        }
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        match input {
            [n, f] if *f == self.in_features => Ok(vec![*n, self.out_features]),
            _ => Err(mismatch("linear", format!("(N, {})", self.in_features), input)),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.output_shape(&input.shape())?;
        input.linear(self.weights.tensor(), self.biases.as_ref().map(Parameter::tensor))
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.weights.clone()];
        params.extend(self.biases.clone());
        params
    }
}

pub struct Conv2d {
    pub weights: Parameter,
    pub biases: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let weights = Tensor::kaiming_he_init(vec![out_channels, in_channels, kernel_size, kernel_size], fan_in, rng);
        let biases = bias.then(|| Parameter::new("bias", Tensor::zeros(vec![out_channels])));

        Conv2d {
            weights: Parameter::new("weight", weights),
            biases,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        }
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let expected = || {
            format!(
                "(N, {}, H, W) tiled exactly by k={} s={} p={}",
                self.in_channels, self.kernel_size, self.stride, self.padding
            )
        };
        let [n, c, h, w] = input else {
            return Err(mismatch("conv2d", expected(), input));
        };
        if *c != self.in_channels {
            return Err(mismatch("conv2d", expected(), input));
        }
        match (
            window_extent(*h, self.kernel_size, self.stride, self.padding),
            window_extent(*w, self.kernel_size, self.stride, self.padding),
        ) {
            (Some(oh), Some(ow)) => Ok(vec![*n, self.out_channels, oh, ow]),
            _ => Err(mismatch("conv2d", expected(), input)),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.output_shape(&input.shape())?;
        input.conv2d(
            self.weights.tensor(),
            self.stride,
            self.padding,
            self.biases.as_ref().map(Parameter::tensor),
        )
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.weights.clone()];
        params.extend(self.biases.clone());
        params
    }
}

/// Per-channel batch normalisation with learnable scale and shift. Running
/// statistics follow `r ← (1 − momentum)·r + momentum·batch`, the variance
/// estimate being the unbiased one.
pub struct BatchNorm2d {
    pub gamma: Parameter,
    pub beta: Parameter,
    features: usize,
    momentum: Precision,
    epsilon: Precision,
    running_mean: RefCell<Vec<Precision>>,
    running_var: RefCell<Vec<Precision>>,
}

impl BatchNorm2d {
    pub const DEFAULT_MOMENTUM: Precision = 0.1;
    pub const DEFAULT_EPSILON: Precision = 1e-5;

    pub fn new(features: usize) -> Self {
        BatchNorm2d {
            gamma: Parameter::new("gamma", Tensor::ones(vec![features])),
            beta: Parameter::new("beta", Tensor::zeros(vec![features])),
            features,
            momentum: Self::DEFAULT_MOMENTUM,
            epsilon: Self::DEFAULT_EPSILON,
            running_mean: RefCell::new(vec![0.0; features]),
            running_var: RefCell::new(vec![1.0; features]),
        }
    }

    pub fn running_mean(&self) -> Vec<Precision> {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Vec<Precision> {
        self.running_var.borrow().clone()
    }

    /// Replaces the population estimates used in evaluation mode.
    pub fn set_running_statistics(&self, mean: Vec<Precision>, var: Vec<Precision>) -> Result<()> {
        if mean.len() != self.features || var.len() != self.features {
            return Err(mismatch(
                "batch_norm_2d",
                format!("{} statistics per channel", self.features),
                &[mean.len(), var.len()],
            ));
        }
        *self.running_mean.borrow_mut() = mean;
        *self.running_var.borrow_mut() = var;
        Ok(())
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        match input {
            [_, c, _, _] if *c == self.features => Ok(input.to_vec()),
            _ => Err(mismatch("batch_norm_2d", format!("(N, {}, H, W)", self.features), input)),
        }
    }

    pub fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor> {
        self.output_shape(&input.shape())?;
        match mode {
            Mode::Train => {
                let (output, stats) =
                    input.batch_norm_2d_train(self.gamma.tensor(), self.beta.tensor(), self.epsilon)?;
                let correction = if stats.count > 1 {
                    stats.count as Precision / (stats.count - 1) as Precision
                } else {
                    1.0
                };
                let m = self.momentum;
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for c in 0..self.features {
                    running_mean[c] = (1.0 - m) * running_mean[c] + m * stats.mean[c];
                    running_var[c] = (1.0 - m) * running_var[c] + m * stats.var[c] * correction;
                }
                Ok(output)
            }
            Mode::Eval => input.batch_norm_2d_eval(
                self.gamma.tensor(),
                self.beta.tensor(),
                &self.running_mean.borrow(),
                &self.running_var.borrow(),
                self.epsilon,
            ),
        }
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    pub kernel_size: usize,
    pub stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        MaxPool2d { kernel_size, stride }
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let expected = || format!("(N, C, H, W) tiled exactly by k={} s={}", self.kernel_size, self.stride);
        let [n, c, h, w] = input else {
            return Err(mismatch("maxpool_2d", expected(), input));
        };
        match (
            window_extent(*h, self.kernel_size, self.stride, 0),
            window_extent(*w, self.kernel_size, self.stride, 0),
        ) {
            (Some(oh), Some(ow)) => Ok(vec![*n, *c, oh, ow]),
            _ => Err(mismatch("maxpool_2d", expected(), input)),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.output_shape(&input.shape())?;
        input.maxpool_2d(self.kernel_size, self.stride)
    }
}

/// Stochastic zeroing, active in training mode only.
pub struct Dropout {
    probability: Precision,
    rng: RefCell<StdRng>,
}

impl Dropout {
    pub fn new(probability: Precision, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Config(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Dropout {
            probability,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn probability(&self) -> Precision {
        self.probability
    }

    pub fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor> {
        match mode {
            Mode::Train => input.dropout(self.probability, &mut *self.rng.borrow_mut()),
            Mode::Eval => Ok(input.clone()),
        }
    }
}

/// One step of a feed-forward network.
pub enum Layer {
    Conv2d(Conv2d),
    BatchNorm2d(BatchNorm2d),
    ReLU,
    MaxPool2d(MaxPool2d),
    Flatten,
    Dropout(Dropout),
    Linear(Linear),
}

impl Layer {
    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        match self {
            Layer::Conv2d(conv) => conv.output_shape(input),
            Layer::BatchNorm2d(norm) => norm.output_shape(input),
            Layer::MaxPool2d(pool) => pool.output_shape(input),
            Layer::Linear(linear) => linear.output_shape(input),
            Layer::Flatten => match input {
                [n, rest @ ..] if !rest.is_empty() => Ok(vec![*n, rest.iter().product()]),
                _ => Err(mismatch("flatten", "(N, ...)".into(), input)),
            },
            Layer::ReLU | Layer::Dropout(_) => Ok(input.to_vec()),
        }
    }

    pub fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor> {
        match self {
            Layer::Conv2d(conv) => conv.forward(input),
            Layer::BatchNorm2d(norm) => norm.forward(input, mode),
            Layer::ReLU => Ok(input.relu()),
            Layer::MaxPool2d(pool) => pool.forward(input),
            Layer::Flatten => {
                let shape = self.output_shape(&input.shape())?;
                input.reshape(shape)
            }
            Layer::Dropout(dropout) => dropout.forward(input, mode),
            Layer::Linear(linear) => linear.forward(input),
        }
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        match self {
            Layer::Conv2d(conv) => conv.parameters(),
            Layer::BatchNorm2d(norm) => norm.parameters(),
            Layer::Linear(linear) => linear.parameters(),
            Layer::ReLU | Layer::MaxPool2d(_) | Layer::Flatten | Layer::Dropout(_) => Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => "conv",
            Layer::BatchNorm2d(_) => "norm",
            Layer::ReLU => "relu",
            Layer::MaxPool2d(_) => "pool",
            Layer::Flatten => "flatten",
            Layer::Dropout(_) => "dropout",
            Layer::Linear(_) => "linear",
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Conv2d(c) => write!(
                f,
                "Conv2d({}→{}, k={}, s={}, p={})",
                c.in_channels, c.out_channels, c.kernel_size, c.stride, c.padding
            ),
            Layer::BatchNorm2d(n) => write!(f, "BatchNorm2d({})", n.features),
            Layer::ReLU => write!(f, "ReLU"),
            Layer::MaxPool2d(p) => write!(f, "MaxPool2d(k={}, s={})", p.kernel_size, p.stride),
            Layer::Flatten => write!(f, "Flatten"),
            Layer::Dropout(d) => write!(f, "Dropout({})", d.probability),
            Layer::Linear(l) => write!(f, "Linear({}→{})", l.in_features, l.out_features),
        }
    }
}
