//! Classification objective and prediction helpers.

use crate::error::{Error, Result};
use crate::tensor::{accumulate, Precision, Tensor, TensorOp};

/// Mean over the batch of `-log softmax(logits)[label]`.
///
/// `logits` is `(N, classes)` raw scores; the number of classes is taken from
/// its second dimension. The softmax is evaluated with a max shift so large
/// logits do not overflow.
pub fn cross_entropy_loss(logits: &Tensor, labels: &[usize]) -> Result<Tensor> {
    let (batch, num_classes) = match logits.shape()[..] {
        [n, c] if n == labels.len() && n > 0 && c > 0 => (n, c),
        ref other => {
            return Err(Error::ShapeMismatch {
                stage: "cross_entropy_loss".into(),
                expected: format!("({}, classes) logits", labels.len()),
                actual: other.to_vec(),
            })
        }
    };
    if let Some((index, &label)) = labels.iter().enumerate().find(|(_, l)| **l >= num_classes) {
        return Err(Error::InvalidLabel {
            label,
            index,
            num_classes,
        });
    }

    let (probabilities, loss) = logits.with_data(|data| {
        let total: Precision = data
            .chunks(num_classes)
            .zip(labels)
            .map(|(row, &label)| log_sum_exp(row) - row[label])
            .sum();
        (softmax_rows(data, num_classes), total / batch as Precision)
    });
    if !loss.is_finite() {
        return Err(Error::NumericalInstability {
            stage: "cross_entropy_loss".into(),
            quantity: "loss",
        });
    }

    let input = logits.0.clone();
    let labels = labels.to_vec();
    Ok(Tensor::from_op(vec![loss], vec![1], &[logits], TensorOp::CrossEntropy, move || {
        Box::new(move |grad: &[Precision]| {
            // d/dz = (softmax - onehot) / N
            let scale = grad[0] / batch as Precision;
            let mut delta: Vec<Precision> = probabilities.iter().map(|p| p * scale).collect();
            for (n, &label) in labels.iter().enumerate() {
                delta[n * num_classes + label] -= scale;
            }
            accumulate(&input, &delta);
        })
    }))
}

fn row_max(row: &[Precision]) -> Precision {
    row.iter().copied().fold(Precision::NEG_INFINITY, Precision::max)
}

fn log_sum_exp(row: &[Precision]) -> Precision {
    let max = row_max(row);
    row.iter().map(|z| (z - max).exp()).sum::<Precision>().ln() + max
}

fn softmax_rows(data: &[Precision], width: usize) -> Vec<Precision> {
    let mut out = Vec::with_capacity(data.len());
    for row in data.chunks(width) {
        let max = row_max(row);
        let exps: Vec<Precision> = row.iter().map(|z| (z - max).exp()).collect();
        let sum: Precision = exps.iter().sum();
        out.extend(exps.iter().map(|e| e / sum));
    }
    out
}

/// Index of the largest score in each row of an `(N, classes)` tensor. Ties go
/// to the lowest index.
pub fn argmax(logits: &Tensor) -> Result<Vec<usize>> {
    let num_classes = match logits.shape()[..] {
        [_, c] if c > 0 => c,
        ref other => {
            return Err(Error::ShapeMismatch {
                stage: "argmax".into(),
                expected: "(N, classes)".into(),
                actual: other.to_vec(),
            })
        }
    };
    Ok(logits.with_data(|data| {
        data.chunks(num_classes)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, Precision::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                    .0
            })
            .collect()
    }))
}

/// Number of rows whose argmax equals the label.
pub fn count_correct(logits: &Tensor, labels: &[usize]) -> Result<usize> {
    let predictions = argmax(logits)?;
    if predictions.len() != labels.len() {
        return Err(Error::ShapeMismatch {
            stage: "count_correct".into(),
            expected: format!("{} predictions", labels.len()),
            actual: vec![predictions.len()],
        });
    }
    Ok(predictions.iter().zip(labels).filter(|(p, l)| p == l).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn logits(data: Vec<Precision>, rows: usize, cols: usize) -> Tensor {
        let t = Tensor::new_data(data, vec![rows, cols]).unwrap();
        t.set_requires_grad(true);
        t
    }

    #[test]
    fn uniform_logits_give_log_num_classes() {
        let z = logits(vec![0.0; 20], 2, 10);
        let loss = cross_entropy_loss(&z, &[3, 7]).unwrap();
        assert_relative_eq!(loss.item().unwrap(), (10.0 as Precision).ln(), epsilon = 1e-6);
    }

    #[test]
    fn gradient_is_softmax_minus_onehot_over_batch() {
        let z = logits(vec![1.0, 2.0, 3.0, 0.5, 0.5, 0.5], 2, 3);
        let loss = cross_entropy_loss(&z, &[2, 0]).unwrap();
        loss.backward();

        let probs = softmax_rows(&z.to_vec(), 3);
        let grad = z.grad();
        for (i, (g, p)) in grad.iter().zip(&probs).enumerate() {
            let onehot = if i == 2 || i == 3 { 1.0 } else { 0.0 };
            assert_relative_eq!(*g, (p - onehot) / 2.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn large_logits_stay_finite() {
        let z = logits(vec![1000.0, -1000.0, 0.0], 1, 3);
        let loss = cross_entropy_loss(&z, &[0]).unwrap();
        assert!(loss.item().unwrap().abs() < 1e-3);
    }

    #[test]
    fn out_of_range_label_is_rejected() {
        let z = logits(vec![0.0; 20], 2, 10);
        match cross_entropy_loss(&z, &[1, 10]) {
            Err(Error::InvalidLabel { label, index, num_classes }) => {
                assert_eq!((label, index, num_classes), (10, 1, 10));
            }
            other => panic!("expected InvalidLabel, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_logits_are_reported() {
        let z = logits(vec![Precision::NAN, 0.0], 1, 2);
        assert!(matches!(
            cross_entropy_loss(&z, &[0]),
            Err(Error::NumericalInstability { .. })
        ));
    }

    #[test]
    fn label_count_must_match_batch() {
        let z = logits(vec![0.0; 6], 2, 3);
        assert!(matches!(
            cross_entropy_loss(&z, &[0]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        let z = logits(vec![1.0, 3.0, 3.0, -1.0, -2.0, -0.5], 2, 3);
        assert_eq!(argmax(&z).unwrap(), vec![1, 2]);
        assert_eq!(count_correct(&z, &[1, 0]).unwrap(), 1);
    }
}
