use crate::error::{Error, Result};
use crate::layers::{Layer, Mode};
use crate::parameter::Parameter;
use crate::tensor::Tensor;

pub trait Model {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor>;
    fn parameters(&self) -> Vec<Parameter>;
    /// Shape the forward pass would produce, without computing it.
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>>;
}

/// Layers applied in order, each under a dotted stage name.
#[derive(Debug, Default)]
pub struct Sequential {
    stages: Vec<(String, Layer)>,
}

fn rename_stage(err: Error, name: &str) -> Error {
    match err {
        Error::ShapeMismatch { expected, actual, .. } => Error::ShapeMismatch {
            stage: name.to_string(),
            expected,
            actual,
        },
        Error::NumericalInstability { quantity, .. } => Error::NumericalInstability {
            stage: name.to_string(),
            quantity,
        },
        other => other,
    }
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, layer: Layer) {
        self.stages.push((name.into(), layer));
    }

    pub fn with(mut self, name: impl Into<String>, layer: Layer) -> Self {
        self.push(name, layer);
        self
    }

    pub fn stages(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.stages.iter().map(|(name, layer)| (name.as_str(), layer))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Model for Sequential {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor> {
        // whole-chain validation first so nothing runs on a bad geometry
        self.output_shape(&input.shape())?;

        let mut x = input.clone();
        for (name, layer) in &self.stages {
            x = layer.forward(&x, mode).map_err(|e| rename_stage(e, name))?;
        }
        Ok(x)
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.stages
            .iter()
            .flat_map(|(name, layer)| layer.parameters().into_iter().map(move |p| p.prefixed(name)))
            .collect()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let first = self.stages.first().map_or("input", |(name, _)| name.as_str());
        if input_shape.first().map_or(true, |n| *n == 0) {
            return Err(Error::ShapeMismatch {
                stage: first.to_string(),
                expected: "a non-empty batch".into(),
                actual: input_shape.to_vec(),
            });
        }

        let mut shape = input_shape.to_vec();
        for (name, layer) in &self.stages {
            shape = layer.output_shape(&shape).map_err(|e| rename_stage(e, name))?;
        }
        Ok(shape)
    }
}
