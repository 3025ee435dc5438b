#[cfg(test)]
mod tests {
    use crate::tensor::{is_grad_enabled, no_grad, Precision};
    use crate::Tensor;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn trainable(data: Vec<Precision>, shape: Vec<usize>) -> Tensor {
        let t = Tensor::new_data(data, shape).unwrap();
        t.set_requires_grad(true);
        t
    }

    /// Sum of all entries as a differentiable scalar, via a ones-vector product.
    fn sum(t: &Tensor) -> Tensor {
        let n = t.numel();
        let flat = t.reshape(vec![1, n]).unwrap();
        flat.linear(&Tensor::ones(vec![n, 1]), None).unwrap()
    }

    #[test]
    fn test_new_data_rejects_wrong_length() {
        assert!(Tensor::new_data(vec![1.0; 5], vec![2, 3]).is_err());
        let t = Tensor::new_data(vec![1.0; 6], vec![2, 3]).unwrap();
        assert_eq!(t.shape(), vec![2, 3]);
        assert!(!t.requires_grad());
    }

    #[test]
    fn test_kaiming_init_is_scaled_by_fan_in() {
        let mut rng = StdRng::seed_from_u64(0);
        let t = Tensor::kaiming_he_init(vec![200, 50], 200, &mut rng);
        let data = t.to_vec();
        let mean = data.iter().sum::<Precision>() / data.len() as Precision;
        let var = data.iter().map(|x| (x - mean).powi(2)).sum::<Precision>() / data.len() as Precision;
        assert!(mean.abs() < 0.01);
        assert_relative_eq!(var, 2.0 / 200.0, max_relative = 0.1);
        assert!(t.requires_grad());
    }

    #[test]
    fn test_reshape_passes_gradient_through() {
        let x = trainable(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let y = x.reshape(vec![4]).unwrap();
        assert_eq!(y.shape(), vec![4]);
        assert!(x.reshape(vec![3]).is_err());

        sum(&y).backward();
        assert_eq!(x.grad(), vec![1.0; 4]);
    }

    #[test]
    fn test_relu_masks_negative_gradient() {
        let x = trainable(vec![-1.0, 0.5, 0.0, 2.0], vec![1, 4]);
        let y = x.relu();
        assert_eq!(y.to_vec(), vec![0.0, 0.5, 0.0, 2.0]);
        sum(&y).backward();
        assert_eq!(x.grad(), vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_relu_keeps_nan() {
        let x = Tensor::new_data(vec![Precision::NAN, -1.0], vec![1, 2]).unwrap();
        let y = x.relu().to_vec();
        assert!(y[0].is_nan());
        assert_eq!(y[1], 0.0);
        assert!(!x.relu().data_is_finite());
    }

    #[test]
    fn test_linear_forward_and_backward() {
        let x = trainable(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let w = trainable(vec![1.0, 0.0, -1.0, 0.5, 1.0, 2.0], vec![2, 3]);
        let b = trainable(vec![0.1, 0.2, 0.3], vec![3]);
        let y = x.linear(&w, Some(&b)).unwrap();
        assert_eq!(y.shape(), vec![2, 3]);
        let out = y.to_vec();
        let expected = [2.1, 2.2, 3.3, 5.1, 4.2, 5.3];
        for (o, e) in out.iter().zip(expected) {
            assert_relative_eq!(*o, e, epsilon = 1e-5);
        }

        sum(&y).backward();
        // dL/dx = row sums of W, dL/dW = column sums of x, dL/db = batch size
        assert_eq!(x.grad(), vec![0.0, 3.5, 0.0, 3.5]);
        assert_eq!(w.grad(), vec![4.0, 4.0, 4.0, 6.0, 6.0, 6.0]);
        assert_eq!(b.grad(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_linear_rejects_feature_mismatch() {
        let x = Tensor::zeros(vec![2, 3]);
        let w = Tensor::zeros(vec![4, 1]);
        assert!(x.linear(&w, None).is_err());
    }

    #[test]
    fn test_shared_node_accumulates_both_paths() {
        let x = trainable(vec![3.0], vec![1, 1]);
        let y = x.relu();
        // y feeds both the left and right factor
        let z = y.linear(&y.reshape(vec![1, 1]).unwrap(), None).unwrap();
        z.backward();
        assert_eq!(z.to_vec(), vec![9.0]);
        assert_eq!(x.grad(), vec![6.0]);
    }

    #[test]
    fn test_no_grad_builds_no_tape() {
        let x = trainable(vec![1.0, -2.0], vec![1, 2]);
        let y = no_grad(|| {
            assert!(!is_grad_enabled());
            x.relu()
        });
        assert!(is_grad_enabled());
        assert!(!y.requires_grad());
        assert_eq!(y.build_topological_graph().len(), 1);
    }

    #[test]
    fn test_zero_grad_resets_accumulation() {
        let x = trainable(vec![1.0, 2.0], vec![1, 2]);
        sum(&x).backward();
        sum(&x).backward();
        assert_eq!(x.grad(), vec![2.0, 2.0]);
        x.zero_grad();
        assert_eq!(x.grad(), vec![0.0, 0.0]);
        assert!(x.grad_is_finite());
    }

    #[test]
    fn test_conv2d_matches_direct_sum() {
        let mut rng = StdRng::seed_from_u64(5);
        let input = Tensor::kaiming_he_init(vec![2, 2, 5, 5], 1, &mut rng);
        let weights = Tensor::kaiming_he_init(vec![3, 2, 3, 3], 1, &mut rng);
        let bias = Tensor::new_data(vec![0.5, -0.5, 0.0], vec![3]).unwrap();
        let (stride, padding) = (2, 1);
        let out = input.conv2d(&weights, stride, padding, Some(&bias)).unwrap();
        assert_eq!(out.shape(), vec![2, 3, 3, 3]);

        let (x, w, y) = (input.to_vec(), weights.to_vec(), out.to_vec());
        let b = bias.to_vec();
        for n in 0..2 {
            for o in 0..3 {
                for i in 0..3 {
                    for j in 0..3 {
                        let mut acc = b[o];
                        for c in 0..2 {
                            for ki in 0..3 {
                                for kj in 0..3 {
                                    let (r, s) = ((i * stride + ki) as isize - 1, (j * stride + kj) as isize - 1);
                                    if r < 0 || s < 0 || r >= 5 || s >= 5 {
                                        continue;
                                    }
                                    acc += x[((n * 2 + c) * 5 + r as usize) * 5 + s as usize]
                                        * w[((o * 2 + c) * 3 + ki) * 3 + kj];
                                }
                            }
                        }
                        assert_relative_eq!(y[((n * 3 + o) * 3 + i) * 3 + j], acc, epsilon = 1e-4);
                    }
                }
            }
        }
    }

    #[test]
    fn test_conv2d_bias_gradient_counts_positions() {
        let input = Tensor::ones(vec![2, 1, 4, 4]);
        let weights = trainable(vec![1.0; 4], vec![1, 1, 2, 2]);
        let bias = trainable(vec![0.0], vec![1]);
        let out = input.conv2d(&weights, 1, 0, Some(&bias)).unwrap();
        sum(&out).backward();
        // 2 samples · 3·3 positions
        assert_eq!(bias.grad(), vec![18.0]);
        assert_eq!(weights.grad(), vec![18.0; 4]);
    }

    #[test]
    fn test_batch_norm_gradient_sums_to_zero_per_channel() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = Tensor::kaiming_he_init(vec![3, 2, 2, 2], 1, &mut rng);
        let gamma = trainable(vec![1.5, 0.5], vec![2]);
        let beta = trainable(vec![0.0, 1.0], vec![2]);
        let (y, stats) = x.batch_norm_2d_train(&gamma, &beta, 1e-5).unwrap();
        assert_eq!(stats.count, 12);

        // weight the outputs unevenly so the gradient is not trivially zero
        let n = y.numel();
        let weights: Vec<Precision> = (0..n).map(|i| i as Precision / n as Precision).collect();
        let loss = y
            .reshape(vec![1, n])
            .unwrap()
            .linear(&Tensor::new_data(weights, vec![n, 1]).unwrap(), None)
            .unwrap();
        loss.backward();

        let grad = x.grad();
        for c in 0..2 {
            let channel_sum: Precision = (0..3)
                .flat_map(|s| grad[(s * 2 + c) * 4..(s * 2 + c) * 4 + 4].to_vec())
                .sum();
            assert!(channel_sum.abs() < 1e-4, "channel {c} gradient sum {channel_sum}");
        }
        assert_relative_eq!(beta.grad()[0] + beta.grad()[1], (0..n).map(|i| i as Precision / n as Precision).sum(), epsilon = 1e-4);
    }

    #[test]
    fn test_dropout_zero_probability_is_identity() {
        let x = trainable(vec![1.0, 2.0], vec![1, 2]);
        let mut rng = StdRng::seed_from_u64(0);
        let y = x.dropout(0.0, &mut rng).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_item_requires_single_element() {
        assert!(Tensor::zeros(vec![2]).item().is_err());
        assert_eq!(Tensor::full(vec![1], 3.0).item().unwrap(), 3.0);
    }
}
