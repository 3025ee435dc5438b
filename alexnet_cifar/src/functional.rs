//! Spatial and stochastic operations on `(N, C, H, W)` tensors.

use rand::Rng;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::kernels::{self, ConvGeometry};
use crate::tensor::{accumulate, Precision, Tensor, TensorOp};

/// Per-channel mean and biased variance of a `(N, C, H, W)` tensor, plus the
/// number of values each statistic was taken over.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub mean: Vec<Precision>,
    pub var: Vec<Precision>,
    pub count: usize,
}

fn dims4(tensor: &Tensor, stage: &str) -> Result<(usize, usize, usize, usize)> {
    match tensor.shape()[..] {
        [n, c, h, w] => Ok((n, c, h, w)),
        ref other => Err(Error::ShapeMismatch {
            stage: stage.into(),
            expected: "(N, C, H, W)".into(),
            actual: other.to_vec(),
        }),
    }
}

impl Tensor {
    /// Cross-correlation of `(N, C, H, W)` with `weights (O, C, k, k)` plus an
    /// optional per-output-channel bias.
    pub fn conv2d(&self, weights: &Tensor, stride: usize, padding: usize, bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch, channels, height, width) = dims4(self, "conv2d")?;
        let (out_channels, kernel_size) = match weights.shape()[..] {
            [o, c, kh, kw] if c == channels && kh == kw => (o, kh),
            ref other => {
                return Err(Error::ShapeMismatch {
                    stage: "conv2d weights".into(),
                    expected: format!("(O, {channels}, k, k)"),
                    actual: other.to_vec(),
                })
            }
        };
        if stride == 0 || height + 2 * padding < kernel_size || width + 2 * padding < kernel_size {
            return Err(Error::ShapeMismatch {
                stage: "conv2d".into(),
                expected: format!("spatial size of at least {kernel_size} after padding {padding}"),
                actual: self.shape(),
            });
        }
        if let Some(bias) = bias {
            if bias.numel() != out_channels {
                return Err(Error::ShapeMismatch {
                    stage: "conv2d bias".into(),
                    expected: format!("({out_channels})"),
                    actual: bias.shape(),
                });
            }
        }

        let geometry = ConvGeometry {
            channels,
            height,
            width,
            kernel_size,
            stride,
            padding,
            out_height: (height + 2 * padding - kernel_size) / stride + 1,
            out_width: (width + 2 * padding - kernel_size) / stride + 1,
        };
        let in_len = channels * height * width;
        let positions = geometry.positions();
        let out_len = out_channels * positions;
        let patch_len = geometry.patch_len();

        let mut result_data = vec![0.0; batch * out_len];
        {
            let x = self.0.borrow();
            let w = weights.0.borrow();
            let b = bias.map(|b| b.0.borrow());
            let b_data = b.as_ref().map(|b| b.data());
            let x_data = x.data();
            let w_data = w.data();
            result_data
                .par_chunks_mut(out_len.max(1))
                .zip(x_data.par_chunks(in_len.max(1)))
                .for_each(|(out, sample)| {
                    let cols = kernels::im2col(sample, &geometry);
                    let product = kernels::gemm(w_data, &cols, out_channels, patch_len, positions);
                    out.copy_from_slice(&product);
                    if let Some(b_data) = b_data {
                        for (plane, bias) in out.chunks_mut(positions.max(1)).zip(b_data) {
                            plane.iter_mut().for_each(|y| *y += *bias);
                        }
                    }
                });
        }

        let mut parents = vec![self, weights];
        parents.extend(bias);
        let input = self.0.clone();
        let weight = weights.0.clone();
        let bias = bias.map(|b| b.0.clone());
        Ok(Tensor::from_op(
            result_data,
            vec![batch, out_channels, geometry.out_height, geometry.out_width],
            &parents,
            TensorOp::Conv2d,
            move || {
                Box::new(move |grad: &[Precision]| {
                    let (grad_input, grad_weight) = {
                        let x = input.borrow();
                        let w = weight.borrow();
                        let x_data = x.data();
                        let w_data = w.data();
                        // Image batches entering the first stage need no input gradient.
                        let input_grad_needed = x.requires_grad();
                        let mut grad_input = vec![0.0; x_data.len()];
                        let grad_weight = grad_input
                            .par_chunks_mut(in_len.max(1))
                            .zip(x_data.par_chunks(in_len.max(1)))
                            .zip(grad.par_chunks(out_len.max(1)))
                            .map(|((dx, sample), dy)| {
                                if input_grad_needed {
                                    let dcols = kernels::gemm_at_b(w_data, dy, out_channels, patch_len, positions);
                                    kernels::col2im(&dcols, &geometry, dx);
                                }
                                let cols = kernels::im2col(sample, &geometry);
                                kernels::gemm_a_bt(dy, &cols, out_channels, positions, patch_len)
                            })
                            .reduce(
                                || vec![0.0; out_channels * patch_len],
                                |mut acc, part| {
                                    acc.iter_mut().zip(&part).for_each(|(a, p)| *a += *p);
                                    acc
                                },
                            );
                        (grad_input, grad_weight)
                    };
                    accumulate(&input, &grad_input);
                    accumulate(&weight, &grad_weight);
                    if let Some(ref bias) = bias {
                        let mut delta = vec![0.0; out_channels];
                        for sample in grad.chunks(out_len.max(1)) {
                            for (d, plane) in delta.iter_mut().zip(sample.chunks(positions.max(1))) {
                                *d += plane.iter().sum::<Precision>();
                            }
                        }
                        accumulate(bias, &delta);
                    }
                })
            },
        ))
    }

    /// Max over `kernel_size × kernel_size` windows moved by `stride`; windows
    /// never hang over the edge.
    pub fn maxpool_2d(&self, kernel_size: usize, stride: usize) -> Result<Tensor> {
        let (batch, channels, height, width) = dims4(self, "maxpool_2d")?;
        if kernel_size == 0 || stride == 0 || kernel_size > height || kernel_size > width {
            return Err(Error::ShapeMismatch {
                stage: "maxpool_2d".into(),
                expected: format!("spatial size of at least {kernel_size}"),
                actual: self.shape(),
            });
        }

        let out_height = (height - kernel_size) / stride + 1;
        let out_width = (width - kernel_size) / stride + 1;

        let mut result_data = Vec::with_capacity(batch * channels * out_height * out_width);
        let mut max_indices = Vec::with_capacity(batch * channels * out_height * out_width);
        {
            let core = self.0.borrow();
            let data = core.data();
            for plane in 0..batch * channels {
                let base = plane * height * width;
                for oy in 0..out_height {
                    for ox in 0..out_width {
                        let (y, x) = (oy * stride, ox * stride);
                        let mut max_val = Precision::NEG_INFINITY;
                        let mut max_idx = base + y * width + x;
                        for ky in 0..kernel_size {
                            let row = base + (y + ky) * width + x;
                            for kx in 0..kernel_size {
                                let value = data[row + kx];
                                // NaN propagates
                                if value.is_nan() || value > max_val {
                                    max_val = value;
                                    max_idx = row + kx;
                                }
                            }
                        }
                        result_data.push(max_val);
                        max_indices.push(max_idx);
                    }
                }
            }
        }

        let input = self.0.clone();
        let input_len = self.numel();
        Ok(Tensor::from_op(
            result_data,
            vec![batch, channels, out_height, out_width],
            &[self],
            TensorOp::MaxPool2d,
            move || {
                Box::new(move |grad: &[Precision]| {
                    let mut delta = vec![0.0; input_len];
                    for (idx, g) in max_indices.iter().zip(grad) {
                        delta[*idx] += *g;
                    }
                    accumulate(&input, &delta);
                })
            },
        ))
    }

    pub fn channel_statistics(&self) -> Result<ChannelStats> {
        let (batch, channels, height, width) = dims4(self, "channel_statistics")?;
        let plane = height * width;
        let count = batch * plane;
        let core = self.0.borrow();
        let data = core.data();

        let mut mean = vec![0.0; channels];
        let mut var = vec![0.0; channels];
        if count == 0 {
            return Ok(ChannelStats { mean, var, count });
        }
        for c in 0..channels {
            let values = (0..batch).flat_map(|n| {
                let start = (n * channels + c) * plane;
                data[start..start + plane].iter()
            });
            let sum: Precision = values.clone().sum();
            let m = sum / count as Precision;
            let sq: Precision = values.map(|v| (v - m) * (v - m)).sum();
            mean[c] = m;
            var[c] = sq / count as Precision;
        }
        Ok(ChannelStats { mean, var, count })
    }

    /// Batch normalisation with the statistics of this batch. Returns the
    /// output together with the statistics used, so the caller can fold them
    /// into its running estimates.
    pub fn batch_norm_2d_train(&self, gamma: &Tensor, beta: &Tensor, epsilon: Precision) -> Result<(Tensor, ChannelStats)> {
        let (batch, channels, height, width) = dims4(self, "batch_norm_2d")?;
        check_affine(gamma, beta, channels)?;
        let stats = self.channel_statistics()?;
        let plane = height * width;
        let count = stats.count as Precision;
        let inv_std: Vec<Precision> = stats.var.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect();

        let (normalized, result_data) = {
            let core = self.0.borrow();
            let g = gamma.0.borrow();
            let b = beta.0.borrow();
            let (g, b) = (g.data(), b.data());
            let mut normalized = core.data().to_vec();
            let mut result = vec![0.0; normalized.len()];
            for n in 0..batch {
                for c in 0..channels {
                    let start = (n * channels + c) * plane;
                    for i in start..start + plane {
                        normalized[i] = (normalized[i] - stats.mean[c]) * inv_std[c];
                        result[i] = g[c] * normalized[i] + b[c];
                    }
                }
            }
            (normalized, result)
        };

        let input = self.0.clone();
        let gamma_node = gamma.0.clone();
        let beta_node = beta.0.clone();
        let output = Tensor::from_op(
            result_data,
            vec![batch, channels, height, width],
            &[self, gamma, beta],
            TensorOp::BatchNorm2d,
            move || {
                Box::new(move |grad: &[Precision]| {
                    let g = gamma_node.borrow().data().to_vec();
                    let mut grad_gamma = vec![0.0; channels];
                    let mut grad_beta = vec![0.0; channels];
                    for n in 0..batch {
                        for c in 0..channels {
                            let start = (n * channels + c) * plane;
                            for i in start..start + plane {
                                grad_beta[c] += grad[i];
                                grad_gamma[c] += grad[i] * normalized[i];
                            }
                        }
                    }
                    // dx = γ·σ⁻¹/M · (M·dy − Σdy − x̂·Σ(dy·x̂))
                    let mut grad_input = vec![0.0; grad.len()];
                    for n in 0..batch {
                        for c in 0..channels {
                            let start = (n * channels + c) * plane;
                            let scale = g[c] * inv_std[c] / count;
                            for i in start..start + plane {
                                grad_input[i] = scale
                                    * (count * grad[i] - grad_beta[c] - normalized[i] * grad_gamma[c]);
                            }
                        }
                    }
                    accumulate(&input, &grad_input);
                    accumulate(&gamma_node, &grad_gamma);
                    accumulate(&beta_node, &grad_beta);
                })
            },
        );
        Ok((output, stats))
    }

    /// Batch normalisation with fixed statistics, as used for evaluation.
    pub fn batch_norm_2d_eval(
        &self,
        gamma: &Tensor,
        beta: &Tensor,
        mean: &[Precision],
        var: &[Precision],
        epsilon: Precision,
    ) -> Result<Tensor> {
        let (batch, channels, height, width) = dims4(self, "batch_norm_2d")?;
        check_affine(gamma, beta, channels)?;
        if mean.len() != channels || var.len() != channels {
            return Err(Error::ShapeMismatch {
                stage: "batch_norm_2d statistics".into(),
                expected: format!("({channels})"),
                actual: vec![mean.len(), var.len()],
            });
        }
        let plane = height * width;
        let inv_std: Vec<Precision> = var.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect();
        let mean = mean.to_vec();

        let result_data = {
            let core = self.0.borrow();
            let g = gamma.0.borrow();
            let b = beta.0.borrow();
            let (g, b) = (g.data(), b.data());
            let data = core.data();
            let mut result = vec![0.0; data.len()];
            for n in 0..batch {
                for c in 0..channels {
                    let start = (n * channels + c) * plane;
                    for i in start..start + plane {
                        result[i] = g[c] * (data[i] - mean[c]) * inv_std[c] + b[c];
                    }
                }
            }
            result
        };

        let input = self.0.clone();
        let gamma_node = gamma.0.clone();
        let beta_node = beta.0.clone();
        Ok(Tensor::from_op(
            result_data,
            vec![batch, channels, height, width],
            &[self, gamma, beta],
            TensorOp::BatchNorm2d,
            move || {
                Box::new(move |grad: &[Precision]| {
                    let x = input.borrow().data().to_vec();
                    let g = gamma_node.borrow().data().to_vec();
                    let mut grad_input = vec![0.0; grad.len()];
                    let mut grad_gamma = vec![0.0; channels];
                    let mut grad_beta = vec![0.0; channels];
                    for n in 0..batch {
                        for c in 0..channels {
                            let start = (n * channels + c) * plane;
                            for i in start..start + plane {
                                grad_input[i] = grad[i] * g[c] * inv_std[c];
                                grad_gamma[c] += grad[i] * (x[i] - mean[c]) * inv_std[c];
                                grad_beta[c] += grad[i];
                            }
                        }
                    }
                    accumulate(&input, &grad_input);
                    accumulate(&gamma_node, &grad_gamma);
                    accumulate(&beta_node, &grad_beta);
                })
            },
        ))
    }

    /// Inverted dropout: each value is zeroed with `probability`, survivors are
    /// scaled by `1 / (1 - probability)`. A zero probability returns `self`.
    pub fn dropout<R: Rng + ?Sized>(&self, probability: Precision, rng: &mut R) -> Result<Tensor> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Config(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        if probability == 0.0 {
            return Ok(self.clone());
        }
        let keep_scale = 1.0 / (1.0 - probability);
        let mask: Vec<Precision> = (0..self.numel())
            .map(|_| if rng.gen::<Precision>() < probability { 0.0 } else { keep_scale })
            .collect();
        let result_data = self.with_data(|data| data.iter().zip(&mask).map(|(x, m)| x * m).collect());

        let input = self.0.clone();
        Ok(Tensor::from_op(result_data, self.shape(), &[self], TensorOp::Dropout, move || {
            Box::new(move |grad: &[Precision]| {
                let delta: Vec<Precision> = grad.iter().zip(&mask).map(|(g, m)| g * m).collect();
                accumulate(&input, &delta);
            })
        }))
    }
}

fn check_affine(gamma: &Tensor, beta: &Tensor, channels: usize) -> Result<()> {
    if gamma.numel() != channels || beta.numel() != channels {
        return Err(Error::ShapeMismatch {
            stage: "batch_norm_2d affine".into(),
            expected: format!("({channels})"),
            actual: gamma.shape(),
        });
    }
    Ok(())
}
