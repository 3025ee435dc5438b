#![allow(dead_code)]

use alexnet_cifar::{
    BatchNorm2d, Conv2d, Dropout, InMemoryDataset, Layer, Linear, MaxPool2d, Precision, Sequential,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SIDE: usize = 4;

/// Images whose class is the quadrant (of `classes` stripes) holding a
/// bright block, plus uniform noise. Linearly separable.
pub fn striped_dataset(samples: usize, classes: usize, seed: u64) -> InMemoryDataset {
    let width = SIDE * classes;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut images = Vec::with_capacity(samples * SIDE * width);
    let mut labels = Vec::with_capacity(samples);
    for i in 0..samples {
        let label = i % classes;
        for _row in 0..SIDE {
            for col in 0..width {
                let signal = if col / SIDE == label { 2.0 } else { -1.0 };
                images.push(signal + rng.gen_range(-0.3..0.3) as Precision);
            }
        }
        labels.push(label);
    }
    InMemoryDataset::new(images, labels, [1, SIDE, width]).unwrap()
}

/// conv → batch norm → ReLU → pool → flatten → dropout → linear, sized for
/// `striped_dataset`.
pub fn small_net(classes: usize, dropout: Precision, seed: u64) -> Sequential {
    let mut rng = StdRng::seed_from_u64(seed);
    let width = SIDE * classes;
    let features = 4 * (SIDE / 2) * (width / 2);
    Sequential::new()
        .with("block.conv", Layer::Conv2d(Conv2d::new(1, 4, 3, 1, 1, true, &mut rng)))
        .with("block.norm", Layer::BatchNorm2d(BatchNorm2d::new(4)))
        .with("block.relu", Layer::ReLU)
        .with("block.pool", Layer::MaxPool2d(MaxPool2d::new(2, 2)))
        .with("flatten", Layer::Flatten)
        .with("head.dropout", Layer::Dropout(Dropout::new(dropout, seed).unwrap()))
        .with("head.linear", Layer::Linear(Linear::new(features, classes, true, &mut rng)))
}
