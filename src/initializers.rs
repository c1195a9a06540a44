//! Parameter initialization strategies for weights and biases.

use std::str::FromStr;

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Weight initialization strategies
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "camelCase"))]
pub enum Initializer {
    /// All zeros
    Zeros,
    /// Every element set to `value`
    Constant { value: f64 },
    /// Uniform in `[min, max)`
    Uniform { min: f64, max: f64 },
    /// Gaussian with the given mean and standard deviation
    Normal { mean: f64, std: f64 },
    /// Glorot: `N(0, sqrt(2 / (fan_in + fan_out)))`, good for tanh/sigmoid
    Xavier,
    /// He: `N(0, sqrt(2 / fan_in))`, good for ReLU
    He,
    /// LeCun: `N(0, sqrt(1 / fan_in))`
    LeCun,
}

impl Initializer {
    pub fn name(&self) -> &'static str {
        match self {
            Initializer::Zeros => "zeros",
            Initializer::Constant { .. } => "constant",
            Initializer::Uniform { .. } => "uniform",
            Initializer::Normal { .. } => "normal",
            Initializer::Xavier => "xavier",
            Initializer::He => "he",
            Initializer::LeCun => "lecun",
        }
    }

    /// Fill `values` for a parameter block with the given fan-in and fan-out.
    pub fn fill<R: Rng + ?Sized>(
        &self,
        values: &mut [f64],
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<()> {
        match *self {
            Initializer::Zeros => values.fill(0.0),
            Initializer::Constant { value } => values.fill(value),
            Initializer::Uniform { min, max } => {
                if !(min < max) {
                    return Err(Error::InvalidConfiguration(format!(
                        "uniform initializer needs min < max, got [{}, {})",
                        min, max
                    )));
                }
                let dist = Uniform::new(min, max);
                values.iter_mut().for_each(|v| *v = dist.sample(rng));
            }
            Initializer::Normal { mean, std } => sample_normal(values, mean, std, rng)?,
            Initializer::Xavier => {
                let std = (2.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                sample_normal(values, 0.0, std, rng)?;
            }
            Initializer::He => {
                let std = (2.0 / fan_in.max(1) as f64).sqrt();
                sample_normal(values, 0.0, std, rng)?;
            }
            Initializer::LeCun => {
                let std = (1.0 / fan_in.max(1) as f64).sqrt();
                sample_normal(values, 0.0, std, rng)?;
            }
        }
        Ok(())
    }
}

fn sample_normal<R: Rng + ?Sized>(values: &mut [f64], mean: f64, std: f64, rng: &mut R) -> Result<()> {
    if !std.is_finite() || std < 0.0 {
        return Err(Error::InvalidConfiguration(format!(
            "normal initializer needs a finite std >= 0, got {}",
            std
        )));
    }
    let normal = Normal::new(mean, std).map_err(|e| {
        Error::InvalidConfiguration(format!("normal initializer (mean {}, std {}): {}", mean, std, e))
    })?;
    values.iter_mut().for_each(|v| *v = normal.sample(rng));
    Ok(())
}

impl FromStr for Initializer {
    type Err = Error;

    /// Parameterized strategies parse to their conventional defaults.
    fn from_str(key: &str) -> Result<Self> {
        match key {
            "zeros" => Ok(Initializer::Zeros),
            "constant" => Ok(Initializer::Constant { value: 0.0 }),
            "uniform" => Ok(Initializer::Uniform { min: -0.05, max: 0.05 }),
            "normal" => Ok(Initializer::Normal { mean: 0.0, std: 0.05 }),
            "xavier" => Ok(Initializer::Xavier),
            "he" => Ok(Initializer::He),
            "lecun" => Ok(Initializer::LeCun),
            other => Err(Error::UnknownType {
                kind: "initializer",
                key: other.to_string(),
            }),
        }
    }
}
