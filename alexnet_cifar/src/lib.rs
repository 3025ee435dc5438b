// AlexNet on CIFAR-10 over a small tensor autodiff engine
pub mod tensor;
pub use tensor::{no_grad, Precision, Tensor};
pub mod kernels;
pub mod functional;
pub use functional::ChannelStats;
pub mod error;
pub use error::{Error, Result};
pub mod parameter;
pub use parameter::Parameter;
pub mod layers;
pub use layers::{BatchNorm2d, Conv2d, Dropout, Layer, Linear, MaxPool2d, Mode};
pub mod model;
pub use model::{Model, Sequential};
pub mod alexnet;
pub use alexnet::{AlexNet, AlexNetConfig};
pub mod loss;
pub use loss::{argmax, count_correct, cross_entropy_loss};
pub mod optimizer;
pub use optimizer::Sgd;
pub mod gradcheck;
pub use gradcheck::{GradientMismatch, GradientValidator};
pub mod dataset;
pub use dataset::{split_indices, Cifar10, Dataset, InMemoryDataset};
pub mod data_loader;
pub use data_loader::{Batch, BatchSource, DataLoader};
pub mod config;
pub use config::TrainConfig;
pub mod trainer;
pub use trainer::{AccuracyReport, EpochReport, EpochSummary, Phase, Report, Split, Trainer};

#[cfg(test)]
mod tensor_tests;
