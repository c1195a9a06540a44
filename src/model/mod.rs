/**
 * @file src/model/mod.rs
 * @brief Model topologies and the shared training vocabulary
 *
 * Three topologies share one training engine (`engine`):
 *
 * - [`Sequential`]: an ordered stack of dense layers
 * - [`ChainModel`]: sub-models concatenated end to end, each with a
 *   trainable flag that suppresses weight updates for its layers
 * - [`GenerativeAdversarialModel`]: a generator/discriminator pair trained by
 *   adversarial alternation on top of a chain with a frozen discriminator
 *
 * All of them follow the same lifecycle: describe, `compile()` once, then
 * `compute()` / `train()` / `evaluate()` repeatedly and take `snapshot()`s
 * that never alias live training buffers.
 */

use std::time::Duration;

use ndarray::{Array1, Array2};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::layers::Dense;
use crate::memory::ArenaConfig;

pub mod chain;
pub(crate) mod engine;
pub mod gan;
pub mod sequential;

pub use chain::ChainModel;
pub use engine::{BatchDeltas, DeltaBlock, LayerParameters};
pub use gan::{GanPassReport, GanReport, GenerativeAdversarialModel};
pub use sequential::{Sequential, SequentialBuilder};

/// Default seed for weight initialization, dropout masks and shuffling.
pub const DEFAULT_SEED: u64 = 42;

// === CONFIGURATION ===

/// Per-model configuration
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ModelConfig {
    /// Seed of the model's random stream (initializers, dropout, noise)
    pub seed: u64,
    /// Arena chunk sizing
    pub arena: ArenaConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            arena: ArenaConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_arena(mut self, arena: ArenaConfig) -> Self {
        self.arena = arena;
        self
    }
}

/// Options for a training call
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TrainOptions {
    /// Full passes over the data
    pub epochs: usize,
    /// Samples per weight update
    pub batch_size: usize,
    /// Reshuffle sample order before every pass
    pub shuffle: bool,
    /// Seed of the shuffle stream; each training call starts it afresh
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 1,
            shuffle: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl TrainOptions {
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            ..Self::default()
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

// === RESULTS ===

/// Statistics of one pass over the training data
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PassReport {
    pub pass: usize,
    /// Mean per-sample training loss
    pub loss: f64,
    /// Learning rate in effect during the pass
    pub learning_rate: f64,
    pub elapsed: Duration,
}

/// Result of a training call
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TrainReport {
    pub passes: Vec<PassReport>,
    /// Weight updates applied
    pub steps: u64,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.passes.last().map(|p| p.loss)
    }
}

/// Loss and accuracy over a data set
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

/// Deep copy of all weights and biases, one entry per layer.
///
/// The input layer contributes a `0 × 0` weight matrix and an empty bias.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    pub weights: Vec<Array2<f64>>,
    pub biases: Vec<Array1<f64>>,
}

impl Snapshot {
    pub(crate) fn from_layers<'a>(layers: impl Iterator<Item = &'a Dense>) -> Self {
        let (weights, biases) = layers
            .map(|layer| {
                let rows = layer.weights().len();
                let cols = if rows == 0 { 0 } else { layer.prev_size() };
                let weights = Array2::from_shape_fn((rows, cols), |(j, k)| layer.weights()[j][k]);
                (weights, Array1::from(layer.biases().to_vec()))
            })
            .unzip();
        Self { weights, biases }
    }

    pub fn layer_count(&self) -> usize {
        self.weights.len()
    }
}

// === LAYER ACCESS ===

/// Ordered view over the layers a training core drives.
///
/// Index 0 is the input layer.
pub trait LayerStack {
    fn layer_count(&self) -> usize;
    fn layer(&self, index: usize) -> &Dense;
    fn layer_mut(&mut self, index: usize) -> &mut Dense;

    /// Whether weight updates apply to the layer at `index`.
    fn is_trainable(&self, _index: usize) -> bool {
        true
    }

    /// Whether the layer at `index` may drop activations while training.
    /// Only hidden layers do.
    fn allows_dropout(&self, index: usize) -> bool {
        index > 0 && index + 1 < self.layer_count()
    }
}

impl LayerStack for Vec<Dense> {
    fn layer_count(&self) -> usize {
        self.len()
    }

    fn layer(&self, index: usize) -> &Dense {
        &self[index]
    }

    fn layer_mut(&mut self, index: usize) -> &mut Dense {
        &mut self[index]
    }
}
