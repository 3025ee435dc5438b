use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::Result;
use crate::layers::{BatchNorm2d, Conv2d, Dropout, Layer, Linear, MaxPool2d, Mode};
use crate::model::{Model, Sequential};
use crate::parameter::Parameter;
use crate::tensor::{Precision, Tensor};

/// Per-sample input shape the network is built for.
pub const INPUT_SHAPE: [usize; 3] = [3, 227, 227];
/// Width of the flattened stage-5 output, `256 · 6 · 6`.
pub const FEATURES: usize = 9216;

#[derive(Debug, Clone, PartialEq)]
pub struct AlexNetConfig {
    pub num_classes: usize,
    pub dropout: Precision,
    pub seed: u64,
}

impl Default for AlexNetConfig {
    fn default() -> Self {
        AlexNetConfig {
            num_classes: 10,
            dropout: 0.5,
            seed: 42,
        }
    }
}

/// Five convolutional stages with batch normalisation followed by three fully
/// connected layers.
#[derive(Debug)]
pub struct AlexNet {
    layers: Sequential,
    num_classes: usize,
}

// (out_channels, kernel, stride, padding, pooled)
const CONV_STAGES: [(usize, usize, usize, usize, bool); 5] = [
    (96, 11, 4, 0, true),
    (256, 5, 1, 2, true),
    (384, 3, 1, 1, false),
    (384, 3, 1, 1, false),
    (256, 3, 1, 1, true),
];

impl AlexNet {
    pub fn new(config: &AlexNetConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut layers = Sequential::new();

        let mut in_channels = INPUT_SHAPE[0];
        for (i, &(out_channels, kernel_size, stride, padding, pooled)) in CONV_STAGES.iter().enumerate() {
            let stage = format!("stage{}", i + 1);
            let conv = Conv2d::new(in_channels, out_channels, kernel_size, stride, padding, true, &mut rng);
            layers.push(format!("{stage}.conv"), Layer::Conv2d(conv));
            layers.push(format!("{stage}.norm"), Layer::BatchNorm2d(BatchNorm2d::new(out_channels)));
            layers.push(format!("{stage}.relu"), Layer::ReLU);
            if pooled {
                layers.push(format!("{stage}.pool"), Layer::MaxPool2d(MaxPool2d::new(3, 2)));
            }
            in_channels = out_channels;
        }
        layers.push("flatten", Layer::Flatten);

        let hidden = [("fc_a", FEATURES, 4096), ("fc_b", 4096, 4096)];
        for (offset, (stage, in_features, out_features)) in hidden.into_iter().enumerate() {
            let dropout = Dropout::new(config.dropout, config.seed.wrapping_add(offset as u64 + 1))?;
            layers.push(format!("{stage}.dropout"), Layer::Dropout(dropout));
            layers.push(
                format!("{stage}.linear"),
                Layer::Linear(Linear::new(in_features, out_features, true, &mut rng)),
            );
            layers.push(format!("{stage}.relu"), Layer::ReLU);
        }
        layers.push(
            "fc_c.linear",
            Layer::Linear(Linear::new(4096, config.num_classes, true, &mut rng)),
        );

        Ok(AlexNet {
            layers,
            num_classes: config.num_classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn layers(&self) -> &Sequential {
        &self.layers
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(Parameter::numel).sum()
    }
}

impl Model for AlexNet {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor> {
        self.layers.forward(input, mode)
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.layers.parameters()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.layers.output_shape(input_shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn stage_geometry_reaches_nine_thousand_features() {
        let net = AlexNet::new(&AlexNetConfig::default()).unwrap();
        let mut shape = vec![1, 3, 227, 227];
        for (name, layer) in net.layers().stages() {
            shape = layer.output_shape(&shape).unwrap();
            match name {
                "stage1.conv" => assert_eq!(shape, vec![1, 96, 55, 55]),
                "stage1.pool" => assert_eq!(shape, vec![1, 96, 27, 27]),
                "stage2.pool" => assert_eq!(shape, vec![1, 256, 13, 13]),
                "stage5.pool" => assert_eq!(shape, vec![1, 256, 6, 6]),
                "flatten" => assert_eq!(shape, vec![1, FEATURES]),
                _ => {}
            }
        }
        assert_eq!(shape, vec![1, 10]);
    }

    #[test]
    fn wrong_resolution_is_rejected_at_first_stage() {
        let net = AlexNet::new(&AlexNetConfig::default()).unwrap();
        match net.output_shape(&[1, 3, 32, 32]) {
            Err(Error::ShapeMismatch { stage, .. }) => assert_eq!(stage, "stage1.conv"),
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn invalid_dropout_is_a_config_error() {
        let config = AlexNetConfig {
            dropout: 1.0,
            ..AlexNetConfig::default()
        };
        assert!(matches!(AlexNet::new(&config), Err(Error::Config(_))));
    }
}
