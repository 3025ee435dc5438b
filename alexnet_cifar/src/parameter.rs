use crate::tensor::Tensor;

/// A trainable tensor together with the dotted path of the layer that owns it
/// (`stage1.conv.weight`). The name shows up in error reports; the optimizer
/// keys its state by the tensor's identity.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    tensor: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        tensor.set_requires_grad(true);
        Self {
            name: name.into(),
            tensor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn id(&self) -> usize {
        self.tensor.id()
    }

    pub fn numel(&self) -> usize {
        self.tensor.numel()
    }

    pub(crate) fn prefixed(mut self, prefix: &str) -> Self {
        self.name = format!("{prefix}.{}", self.name);
        self
    }
}
