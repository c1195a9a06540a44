//! Loss functions for regression and classification.
//!
//! A loss supplies three things: the batch loss (mean of per-sample losses),
//! an accuracy metric, and the per-output error vector that seeds
//! backpropagation. Cross-entropy variants clip predictions away from 0 and 1
//! so logarithms and divisions stay finite.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{Error, Result};
use crate::kernels;

/// Clipping bound for predicted probabilities.
pub const PROBABILITY_EPSILON: f64 = 1e-7;

/// Default regression accuracy window, in standard deviations of the targets.
pub const DEFAULT_TOLERANCE: f64 = 0.5;

/// Supported loss functions
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "camelCase"))]
pub enum Loss {
    /// Mean squared error; accuracy counts values within `tolerance` std of the target
    #[cfg_attr(feature = "serde", serde(rename = "mse"))]
    MeanSquaredError { tolerance: f64 },
    /// Mean absolute error; same accuracy rule as MSE
    #[cfg_attr(feature = "serde", serde(rename = "mae"))]
    MeanAbsoluteError { tolerance: f64 },
    /// Multi-class cross-entropy over a softmax output
    CategoricalCrossEntropy,
    /// Element-wise binary cross-entropy
    BinaryCrossEntropy,
}

impl Default for Loss {
    fn default() -> Self {
        Loss::mse()
    }
}

impl Loss {
    pub fn mse() -> Self {
        Loss::MeanSquaredError {
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn mae() -> Self {
        Loss::MeanAbsoluteError {
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::MeanSquaredError { .. } => "mse",
            Loss::MeanAbsoluteError { .. } => "mae",
            Loss::CategoricalCrossEntropy => "categoricalCrossEntropy",
            Loss::BinaryCrossEntropy => "binaryCrossEntropy",
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, Loss::CategoricalCrossEntropy)
    }

    /// Check the softmax / categorical cross-entropy pairing against the
    /// activation of the output layer.
    pub fn validate_output(&self, output: Activation) -> Result<()> {
        match (self.is_categorical(), output.is_softmax()) {
            (true, false) => Err(Error::InvalidArchitecture(format!(
                "categorical cross-entropy requires a softmax output layer, found {}",
                output
            ))),
            (false, true) => Err(Error::InvalidArchitecture(format!(
                "softmax output must be paired with categorical cross-entropy, found {}",
                self.name()
            ))),
            _ => Ok(()),
        }
    }

    /// Loss of a single sample.
    pub fn sample_loss(&self, predicted: &[f64], expected: &[f64]) -> Result<f64> {
        Error::check_len("loss", expected.len(), predicted.len())?;
        if predicted.is_empty() {
            return Ok(0.0);
        }
        let n = predicted.len() as f64;
        let pairs = predicted.iter().zip(expected);
        let value = match self {
            Loss::MeanSquaredError { .. } => {
                pairs.map(|(&p, &e)| (p - e) * (p - e)).sum::<f64>() / n
            }
            Loss::MeanAbsoluteError { .. } => pairs.map(|(&p, &e)| (p - e).abs()).sum::<f64>() / n,
            Loss::CategoricalCrossEntropy => -pairs.map(|(&p, &e)| e * clip(p).ln()).sum::<f64>(),
            Loss::BinaryCrossEntropy => {
                -pairs
                    .map(|(&p, &e)| {
                        let p = clip(p);
                        e * p.ln() + (1.0 - e) * (1.0 - p).ln()
                    })
                    .sum::<f64>()
                    / n
            }
        };
        Ok(value)
    }

    /// Mean per-sample loss over a batch.
    pub fn loss<P, E>(&self, predicted: &[P], expected: &[E]) -> Result<f64>
    where
        P: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        Error::check_len("loss batch", expected.len(), predicted.len())?;
        if predicted.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let mut total = kernels::KahanSum::new();
        for (p, e) in predicted.iter().zip(expected) {
            total.add(self.sample_loss(p.as_ref(), e.as_ref())?);
        }
        Ok(total.value() / predicted.len() as f64)
    }

    /// Fraction of correct predictions in `[0, 1]`.
    ///
    /// Regression losses count output values within `tolerance` standard
    /// deviations (of all expected values) of their target; with zero spread
    /// only exact matches count. Categorical accuracy compares argmax indices;
    /// binary accuracy thresholds each output at 0.5.
    pub fn accuracy<P, E>(&self, predicted: &[P], expected: &[E]) -> Result<f64>
    where
        P: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        Error::check_len("accuracy batch", expected.len(), predicted.len())?;
        for (p, e) in predicted.iter().zip(expected) {
            Error::check_len("accuracy", e.as_ref().len(), p.as_ref().len())?;
        }
        if predicted.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let (hits, total) = match self {
            Loss::MeanSquaredError { tolerance } | Loss::MeanAbsoluteError { tolerance } => {
                let (_, std) = kernels::mean_std(expected);
                let window = tolerance * std;
                count_elements(predicted, expected, |p, e| (p - e).abs() <= window)
            }
            Loss::BinaryCrossEntropy => {
                count_elements(predicted, expected, |p, e| (p >= 0.5) == (e >= 0.5))
            }
            Loss::CategoricalCrossEntropy => {
                let hits = predicted
                    .iter()
                    .zip(expected)
                    .filter(|(p, e)| kernels::argmax(p.as_ref()) == kernels::argmax(e.as_ref()))
                    .count();
                (hits, predicted.len())
            }
        };
        Ok(if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        })
    }

    /// Write the error vector `dL/dp` for one sample into `output`.
    pub fn calculate_error_into(
        &self,
        predicted: &[f64],
        expected: &[f64],
        output: &mut [f64],
    ) -> Result<()> {
        Error::check_len("loss error", expected.len(), predicted.len())?;
        Error::check_len("loss error output", predicted.len(), output.len())?;
        let n = predicted.len() as f64;
        let pairs = predicted.iter().zip(expected);
        match self {
            Loss::MeanSquaredError { .. } => {
                for (o, (&p, &e)) in output.iter_mut().zip(pairs) {
                    *o = 2.0 * (p - e) / n;
                }
            }
            Loss::MeanAbsoluteError { .. } => {
                for (o, (&p, &e)) in output.iter_mut().zip(pairs) {
                    *o = sign(p - e) / n;
                }
            }
            Loss::CategoricalCrossEntropy => {
                for (o, (&p, &e)) in output.iter_mut().zip(pairs) {
                    *o = p - e;
                }
            }
            Loss::BinaryCrossEntropy => {
                for (o, (&p, &e)) in output.iter_mut().zip(pairs) {
                    let p = clip(p);
                    *o = (p - e) / (p * (1.0 - p)) / n;
                }
            }
        }
        Ok(())
    }

    pub fn calculate_error(&self, predicted: &[f64], expected: &[f64]) -> Result<Vec<f64>> {
        let mut output = vec![0.0; predicted.len()];
        self.calculate_error_into(predicted, expected, &mut output)?;
        Ok(output)
    }
}

fn count_elements<P, E, F>(predicted: &[P], expected: &[E], hit: F) -> (usize, usize)
where
    P: AsRef<[f64]>,
    E: AsRef<[f64]>,
    F: Fn(f64, f64) -> bool,
{
    predicted
        .iter()
        .zip(expected)
        .flat_map(|(p, e)| p.as_ref().iter().zip(e.as_ref()))
        .fold((0, 0), |(hits, total), (&p, &e)| {
            (hits + usize::from(hit(p, e)), total + 1)
        })
}

#[inline]
fn clip(p: f64) -> f64 {
    p.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
}

/// Sign with `sign(0) == 0`.
#[inline]
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl fmt::Display for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Loss {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        match key {
            "mse" => Ok(Loss::mse()),
            "mae" => Ok(Loss::mae()),
            "categoricalCrossEntropy" => Ok(Loss::CategoricalCrossEntropy),
            "binaryCrossEntropy" => Ok(Loss::BinaryCrossEntropy),
            other => Err(Error::UnknownType {
                kind: "loss",
                key: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mse_loss_and_error() {
        let loss = Loss::mse();
        assert_relative_eq!(loss.sample_loss(&[1.0, 2.0], &[0.0, 4.0]).unwrap(), 2.5);
        let err = loss.calculate_error(&[1.0, 2.0], &[0.0, 4.0]).unwrap();
        assert_eq!(err, vec![1.0, -2.0]);
    }

    #[test]
    fn test_mae_error_uses_sign() {
        let loss = Loss::mae();
        let err = loss.calculate_error(&[1.0, 2.0, 3.0, 4.0], &[0.0, 2.0, 5.0, 4.0]).unwrap();
        assert_eq!(err, vec![0.25, 0.0, -0.25, 0.0]);
        assert_relative_eq!(loss.sample_loss(&[1.0, 3.0], &[0.0, 5.0]).unwrap(), 1.5);
    }

    #[test]
    fn test_batch_loss_is_sample_mean() {
        let loss = Loss::mse();
        let value = loss
            .loss(&[vec![1.0], vec![3.0]], &[vec![0.0], vec![0.0]])
            .unwrap();
        assert_relative_eq!(value, 5.0);
        assert!(matches!(
            loss.loss::<Vec<f64>, Vec<f64>>(&[], &[]),
            Err(Error::EmptyBatch)
        ));
    }

    #[test]
    fn test_cross_entropy_is_finite_at_extremes() {
        let cce = Loss::CategoricalCrossEntropy;
        let value = cce.sample_loss(&[0.0, 1.0], &[1.0, 0.0]).unwrap();
        assert!(value.is_finite() && value > 10.0);
        assert_eq!(cce.calculate_error(&[0.2, 0.8], &[0.0, 1.0]).unwrap()[0], 0.2);

        let bce = Loss::BinaryCrossEntropy;
        let value = bce.sample_loss(&[1.0], &[0.0]).unwrap();
        assert!(value.is_finite());
        let err = bce.calculate_error(&[0.0, 1.0], &[0.0, 1.0]).unwrap();
        assert!(err.iter().all(|e| e.is_finite()));
    }

    #[test]
    fn test_bce_error_times_sigmoid_moment_is_residual() {
        let p = 0.7;
        let err = Loss::BinaryCrossEntropy.calculate_error(&[p], &[1.0]).unwrap()[0];
        assert_relative_eq!(err * p * (1.0 - p), p - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_regression_accuracy_window() {
        let loss = Loss::mse();
        // expected values 0 and 2: std = 1, window = 0.5
        let expected = vec![vec![0.0], vec![2.0]];
        let acc = loss.accuracy(&[vec![0.4], vec![2.6]], &expected).unwrap();
        assert_relative_eq!(acc, 0.5);

        let flat = vec![vec![1.0], vec![1.0]];
        let acc = loss.accuracy(&[vec![1.0], vec![1.0001]], &flat).unwrap();
        assert_relative_eq!(acc, 0.5);
    }

    #[test]
    fn test_classification_accuracy() {
        let cce = Loss::CategoricalCrossEntropy;
        let acc = cce
            .accuracy(
                &[vec![0.1, 0.9], vec![0.8, 0.2], vec![0.3, 0.7]],
                &[vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 1.0]],
            )
            .unwrap();
        assert_relative_eq!(acc, 2.0 / 3.0);

        let bce = Loss::BinaryCrossEntropy;
        let acc = bce
            .accuracy(&[vec![0.6, 0.4], vec![0.2, 0.9]], &[vec![1.0, 0.0], vec![1.0, 1.0]])
            .unwrap();
        assert_relative_eq!(acc, 0.75);
    }

    #[test]
    fn test_softmax_pairing() {
        assert!(Loss::CategoricalCrossEntropy.validate_output(Activation::Softmax).is_ok());
        assert!(Loss::mse().validate_output(Activation::Sigmoid).is_ok());
        assert!(Loss::mse().validate_output(Activation::Softmax).is_err());
        assert!(Loss::CategoricalCrossEntropy.validate_output(Activation::Tanh).is_err());
    }

    #[test]
    fn test_registry_keys() {
        for key in ["mse", "mae", "categoricalCrossEntropy", "binaryCrossEntropy"] {
            assert_eq!(key.parse::<Loss>().unwrap().name(), key);
        }
        assert!(matches!(
            "hinge".parse::<Loss>(),
            Err(Error::UnknownType { kind: "loss", .. })
        ));
    }
}
