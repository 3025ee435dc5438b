use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Precision;

/// Stochastic gradient descent with momentum and L2 weight decay:
/// `v ← momentum·v + (g + weight_decay·p)`, `p ← p − learning_rate·v`.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: Precision,
    momentum: Precision,
    weight_decay: Precision,
    velocities: HashMap<usize, Vec<Precision>>,
}

impl Sgd {
    pub fn new(learning_rate: Precision, momentum: Precision, weight_decay: Precision) -> Result<Self> {
        if !(learning_rate > 0.0) || !(momentum >= 0.0) || !(weight_decay >= 0.0) {
            return Err(Error::Config(format!(
                "sgd needs learning_rate > 0, momentum >= 0 and weight_decay >= 0 \
                 (got {learning_rate}, {momentum}, {weight_decay})"
            )));
        }
        Ok(Sgd {
            learning_rate,
            momentum,
            weight_decay,
            velocities: HashMap::new(),
        })
    }

    pub fn learning_rate(&self) -> Precision {
        self.learning_rate
    }

    pub fn update_params(&mut self, parameters: &[Parameter]) {
        let (lr, momentum, weight_decay) = (self.learning_rate, self.momentum, self.weight_decay);
        for parameter in parameters {
            let velocity = self
                .velocities
                .entry(parameter.id())
                .or_insert_with(|| vec![0.0; parameter.numel()]);
            parameter.tensor().update_data(|data, grad| {
                for ((p, g), v) in data.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                    *v = momentum * *v + (*g + weight_decay * *p);
                    *p -= lr * *v;
                }
            });
        }
    }

    pub fn zero_grad(&self, parameters: &[Parameter]) {
        for parameter in parameters {
            parameter.tensor().zero_grad();
        }
    }

    /// Velocity of one parameter, if it has been stepped at least once.
    pub fn velocity(&self, parameter: &Parameter) -> Option<&[Precision]> {
        self.velocities.get(&parameter.id()).map(Vec::as_slice)
    }
}
