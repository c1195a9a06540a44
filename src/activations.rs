/**
 * @file src/activations.rs
 * @brief Activation functions and their derivatives ("moments")
 *
 * Each activation provides two vector operations over a layer's
 * pre-activation output:
 *
 * - **value**: the activation itself, written into a destination buffer
 * - **moment**: the derivative evaluated at the same pre-activation input
 *
 * Softmax is special-cased: its moment is the constant 1 because it is only
 * ever paired with categorical cross-entropy, whose error (`p - e`) already
 * is the gradient with respect to the logits.
 */

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default negative slope for `leakyRelu` when parsed from a bare name.
pub const DEFAULT_LEAKY_SLOPE: f64 = 0.01;

/// Supported activation functions
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "camelCase"))]
pub enum Activation {
    /// Logistic function `1 / (1 + e^-x)`
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
    /// Identity
    Linear,
    /// `x` for positive inputs, `slope * x` otherwise (ReLU when slope is 0)
    LeakyRelu { slope: f64 },
    /// Normalized exponential; output layer only
    Softmax,
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Sigmoid
    }
}

impl Activation {
    /// Plain ReLU.
    pub fn relu() -> Self {
        Activation::LeakyRelu { slope: 0.0 }
    }

    pub fn leaky_relu(slope: f64) -> Self {
        Activation::LeakyRelu { slope }
    }

    pub fn is_softmax(&self) -> bool {
        matches!(self, Activation::Softmax)
    }

    /// Registry key
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Linear => "linear",
            Activation::LeakyRelu { slope } if *slope == 0.0 => "relu",
            Activation::LeakyRelu { .. } => "leakyRelu",
            Activation::Softmax => "softmax",
        }
    }

    /// Write the activation of `input` into `output`.
    pub fn value_into(&self, input: &[f64], output: &mut [f64]) -> Result<()> {
        Error::check_len("activation value", output.len(), input.len())?;
        match self {
            Activation::Softmax => softmax_into(input, output),
            _ => {
                for (o, &x) in output.iter_mut().zip(input) {
                    *o = self.scalar(x);
                }
            }
        }
        Ok(())
    }

    /// Write the derivative at `input` into `output`.
    pub fn moment_into(&self, input: &[f64], output: &mut [f64]) -> Result<()> {
        Error::check_len("activation moment", output.len(), input.len())?;
        output.copy_from_slice(input);
        self.moment_in_place(output);
        Ok(())
    }

    /// Derivative at `input`, read off `value` (the activation of `input`)
    /// for sigmoid and tanh instead of evaluating them again.
    pub fn moment_from_value_into(&self, input: &[f64], value: &[f64], output: &mut [f64]) -> Result<()> {
        Error::check_len("activation moment", output.len(), input.len())?;
        Error::check_len("activation moment value", output.len(), value.len())?;
        for ((o, &x), &y) in output.iter_mut().zip(input).zip(value) {
            *o = self.derivative(x, y);
        }
        Ok(())
    }

    /// Replace each pre-activation value in `values` by the derivative at it.
    pub fn moment_in_place(&self, values: &mut [f64]) {
        for x in values.iter_mut() {
            *x = self.derivative(*x, self.scalar(*x));
        }
    }

    /// Convenience wrapper returning a fresh vector.
    pub fn value(&self, input: &[f64]) -> Vec<f64> {
        match self {
            Activation::Softmax => {
                let mut output = vec![0.0; input.len()];
                softmax_into(input, &mut output);
                output
            }
            _ => input.iter().map(|&x| self.scalar(x)).collect(),
        }
    }

    pub fn moment(&self, input: &[f64]) -> Vec<f64> {
        let mut output = input.to_vec();
        self.moment_in_place(&mut output);
        output
    }
}

impl Activation {
    /// Element-wise value; softmax passes `x` through since it is never
    /// read there.
    #[inline]
    fn scalar(&self, x: f64) -> f64 {
        match *self {
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::LeakyRelu { slope } if x <= 0.0 => slope * x,
            Activation::LeakyRelu { .. } | Activation::Linear | Activation::Softmax => x,
        }
    }

    /// Derivative at pre-activation `x` whose activation is `y`.
    #[inline]
    fn derivative(&self, x: f64, y: f64) -> f64 {
        match *self {
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Linear | Activation::Softmax => 1.0,
            Activation::LeakyRelu { slope } => {
                if x > 0.0 {
                    1.0
                } else {
                    slope
                }
            }
        }
    }
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax_into(input: &[f64], output: &mut [f64]) {
    let max = input.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0.0;
    for (o, &x) in output.iter_mut().zip(input) {
        *o = (x - max).exp();
        total += *o;
    }
    if total > 0.0 {
        output.iter_mut().for_each(|o| *o /= total);
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::LeakyRelu { slope } if *slope != 0.0 => write!(f, "leakyRelu({})", slope),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        match key {
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::relu()),
            "leakyRelu" => Ok(Activation::leaky_relu(DEFAULT_LEAKY_SLOPE)),
            "softmax" => Ok(Activation::Softmax),
            other => Err(Error::UnknownType {
                kind: "activation",
                key: other.to_string(),
            }),
        }
    }
}
