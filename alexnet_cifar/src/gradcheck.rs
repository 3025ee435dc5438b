//! Finite-difference validation of the analytic gradients.

use tracing::debug;

use crate::error::Result;
use crate::layers::Mode;
use crate::loss::cross_entropy_loss;
use crate::model::Model;
use crate::tensor::{no_grad, Precision, Tensor};

/// One parameter entry whose analytic and numerical gradients disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientMismatch {
    pub parameter: String,
    pub index: usize,
    pub analytic: Precision,
    pub numerical: Precision,
}

pub struct GradientValidator {
    step: Precision,
    tolerance: Precision,
}

impl GradientValidator {
    pub fn new(step: Precision, tolerance: Precision) -> Self {
        Self { step, tolerance }
    }

    /// Settings that hold in single precision for small networks.
    pub fn minimal_new() -> Self {
        Self::new(1e-2, 1e-3)
    }

    fn loss(&self, model: &impl Model, input: &Tensor, labels: &[usize], mode: Mode) -> Result<Precision> {
        no_grad(|| cross_entropy_loss(&model.forward(input, mode)?, labels)?.item())
    }

    /// Compares the gradient of the cross-entropy loss with respect to every
    /// parameter entry against a central difference. The model must be
    /// deterministic in `mode`. Returns the entries outside tolerance, scaled
    /// by `max(1, |analytic| + |numerical|)`.
    pub fn check(
        &self,
        model: &impl Model,
        input: &Tensor,
        labels: &[usize],
        mode: Mode,
    ) -> Result<Vec<GradientMismatch>> {
        let parameters = model.parameters();
        for p in &parameters {
            p.tensor().zero_grad();
        }
        let loss = cross_entropy_loss(&model.forward(input, mode)?, labels)?;
        loss.backward();

        let mut mismatches = Vec::new();
        for parameter in &parameters {
            let analytic = parameter.tensor().grad();
            for (index, &analytic) in analytic.iter().enumerate() {
                let h = self.step;
                parameter.tensor().update_data(|data, _| data[index] += h);
                let plus = self.loss(model, input, labels, mode);
                parameter.tensor().update_data(|data, _| data[index] -= 2.0 * h);
                let minus = self.loss(model, input, labels, mode);
                parameter.tensor().update_data(|data, _| data[index] += h);

                let numerical = (plus? - minus?) / (2.0 * h);
                let scale = (analytic.abs() + numerical.abs()).max(1.0);
                if (analytic - numerical).abs() > self.tolerance * scale {
                    mismatches.push(GradientMismatch {
                        parameter: parameter.name().to_string(),
                        index,
                        analytic,
                        numerical,
                    });
                }
            }
            debug!(parameter = parameter.name(), entries = parameter.numel(), "gradient checked");
        }
        Ok(mismatches)
    }
}
