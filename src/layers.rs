/**
 * @file src/layers.rs
 * @brief Fully connected (dense) layer
 *
 * A `Dense` layer is described first (size, activation, initializers,
 * dropout, regularization) and built later, when a model compiles it and
 * knows the size of the preceding layer. Building allocates from the model's
 * arena:
 *
 * - one weight row of `prev_size` elements per neuron
 * - a bias vector of `size` elements
 * - an output ("prime", pre-activation) scratch buffer of `size` elements
 * - an error scratch buffer of `prev_size` elements for backpropagation
 *
 * The input layer (index 0) owns no parameters: its step is a passthrough.
 *
 * A layer is built at most once. Sharing an already built layer with another
 * model requires the explicit reuse flag, which keeps its parameters.
 */

use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::kernels;
use crate::memory::{Arena, Slice};

/// L1 / L2 penalty coefficients, applied separately to weights and biases.
///
/// A coefficient of zero disables its term entirely.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct Regularization {
    pub l1_weights: f64,
    pub l2_weights: f64,
    pub l1_biases: f64,
    pub l2_biases: f64,
}

impl Regularization {
    /// Same L1 / L2 coefficients for weights and biases.
    pub fn new(l1: f64, l2: f64) -> Self {
        Self {
            l1_weights: l1,
            l2_weights: l2,
            l1_biases: l1,
            l2_biases: l2,
        }
    }

    pub fn is_active(&self) -> bool {
        self.l1_weights > 0.0 || self.l2_weights > 0.0 || self.l1_biases > 0.0 || self.l2_biases > 0.0
    }

    fn validate(&self) -> Result<()> {
        let coefficients = [self.l1_weights, self.l2_weights, self.l1_biases, self.l2_biases];
        if coefficients.iter().all(|c| c.is_finite() && *c >= 0.0) {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration(format!(
                "regularization coefficients must be finite and non-negative: {:?}",
                self
            )))
        }
    }
}

/// Arena-backed buffers of a built, non-input layer.
struct DenseBuffers {
    weights: Vec<Slice>,
    biases: Slice,
    output: Slice,
    error: Slice,
}

/// Parameters supplied up front, used instead of the initializers.
#[derive(Debug, Clone)]
struct PresetParameters {
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

/// Fully connected layer
pub struct Dense {
    size: usize,
    activation: Activation,
    weight_init: Initializer,
    bias_init: Initializer,
    dropout: f64,
    regularization: Regularization,

    index: Option<usize>,
    prev_size: usize,
    buffers: Option<DenseBuffers>,
    preset: Option<PresetParameters>,
}

impl Dense {
    /// New unbuilt layer with sigmoid activation and Xavier weights.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            activation: Activation::default(),
            weight_init: Initializer::Xavier,
            bias_init: Initializer::Zeros,
            dropout: 0.0,
            regularization: Regularization::default(),
            index: None,
            prev_size: 0,
            buffers: None,
            preset: None,
        }
    }

    /// Input layer of the given width.
    pub fn input(size: usize) -> Self {
        Self::new(size).with_activation(Activation::Linear)
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_weight_init(mut self, init: Initializer) -> Self {
        self.weight_init = init;
        self
    }

    pub fn with_bias_init(mut self, init: Initializer) -> Self {
        self.bias_init = init;
        self
    }

    /// Inverted dropout probability applied to this layer's activations
    /// during training (hidden layers only).
    pub fn with_dropout(mut self, probability: f64) -> Self {
        self.dropout = probability;
        self
    }

    pub fn with_regularization(mut self, regularization: Regularization) -> Self {
        self.regularization = regularization;
        self
    }

    /// Use these parameters instead of running the initializers at build time.
    ///
    /// `weights` holds one row of `prev_size` values per neuron.
    pub fn with_parameters(mut self, weights: Vec<Vec<f64>>, biases: Vec<f64>) -> Self {
        self.preset = Some(PresetParameters { weights, biases });
        self
    }

    // === ACCESSORS ===

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn prev_size(&self) -> usize {
        self.prev_size
    }

    /// Position in the owning model, once built.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_built(&self) -> bool {
        self.index.is_some()
    }

    pub fn is_input(&self) -> bool {
        self.index == Some(0)
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn weight_init(&self) -> Initializer {
        self.weight_init
    }

    pub fn bias_init(&self) -> Initializer {
        self.bias_init
    }

    pub fn dropout(&self) -> f64 {
        self.dropout
    }

    pub fn regularization(&self) -> &Regularization {
        &self.regularization
    }

    /// True while preset parameters are waiting to be installed by `build`.
    pub fn skip_weights_initialization(&self) -> bool {
        self.preset.is_some()
    }

    /// Weight rows; empty for the input layer or before build.
    pub fn weights(&self) -> &[Slice] {
        self.buffers.as_ref().map(|b| b.weights.as_slice()).unwrap_or(&[])
    }

    pub fn biases(&self) -> &[f64] {
        self.buffers.as_ref().map(|b| b.biases.as_slice()).unwrap_or(&[])
    }

    /// Weight rows and biases, mutably and at the same time.
    pub fn parameters_mut(&mut self) -> Option<(&mut [Slice], &mut [f64])> {
        self.buffers
            .as_mut()
            .map(|b| (b.weights.as_mut_slice(), b.biases.as_mut_slice()))
    }

    /// Pre-activation output of the last `step`.
    pub fn output(&self) -> &[f64] {
        self.buffers.as_ref().map(|b| b.output.as_slice()).unwrap_or(&[])
    }

    /// Number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        if self.is_input() {
            0
        } else {
            self.size * self.prev_size + self.size
        }
    }

    /// Weight rows copied out.
    pub fn weight_rows(&self) -> Vec<Vec<f64>> {
        self.weights().iter().map(|row| row.to_vec()).collect()
    }

    /// Weights flattened row-major.
    pub fn flat_weights(&self) -> Vec<f64> {
        self.weights().iter().flat_map(|row| row.iter().copied()).collect()
    }

    // === LIFECYCLE ===

    /// Build the layer at position `index`, following a layer of `prev_size`.
    pub fn build<R: Rng + ?Sized>(
        &mut self,
        index: usize,
        prev_size: usize,
        arena: &mut Arena,
        rng: &mut R,
        allow_reuse: bool,
    ) -> Result<()> {
        if let Some(built_at) = self.index {
            if !allow_reuse {
                return Err(Error::AlreadyBuilt { index: built_at });
            }
            if index > 0 && self.buffers.is_some() {
                Error::check_len("reused layer input", self.prev_size, prev_size)?;
            }
            self.index = Some(index);
            return Ok(());
        }

        if self.size == 0 {
            return Err(Error::InvalidArchitecture(format!(
                "layer {} must have at least one neuron",
                index
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfiguration(format!(
                "dropout of layer {} must be in [0, 1), got {}",
                index, self.dropout
            )));
        }
        self.regularization.validate()?;

        if index == 0 {
            self.index = Some(0);
            self.prev_size = 0;
            self.preset = None;
            return Ok(());
        }

        if let Some(preset) = &self.preset {
            Error::check_len("preset weight rows", self.size, preset.weights.len())?;
            for row in &preset.weights {
                Error::check_len("preset weight columns", prev_size, row.len())?;
            }
            Error::check_len("preset biases", self.size, preset.biases.len())?;
        }

        let mut weights = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            weights.push(arena.alloc(prev_size));
        }
        let mut biases = arena.alloc(self.size);

        match self.preset.take() {
            Some(preset) => {
                for (row, values) in weights.iter_mut().zip(&preset.weights) {
                    row.copy_from_slice(values);
                }
                biases.copy_from_slice(&preset.biases);
            }
            None => {
                for row in weights.iter_mut() {
                    self.weight_init.fill(row, prev_size, self.size, rng)?;
                }
                self.bias_init.fill(&mut biases, prev_size, self.size, rng)?;
            }
        }

        self.buffers = Some(DenseBuffers {
            weights,
            biases,
            output: arena.alloc(self.size),
            error: arena.alloc(prev_size),
        });
        self.prev_size = prev_size;
        self.index = Some(index);
        Ok(())
    }

    // === FORWARD / BACKWARD ===

    /// Compute `W · input + b` and return it (the input itself for layer 0).
    pub fn step<'a>(&'a mut self, input: &'a [f64]) -> Result<&'a [f64]> {
        if self.index.is_none() {
            return Err(Error::NotCompiled("Dense::step"));
        }
        let Some(buffers) = self.buffers.as_mut() else {
            Error::check_len("input layer step", self.size, input.len())?;
            return Ok(input);
        };
        Error::check_len("dense step", self.prev_size, input.len())?;
        kernels::mat_vec_into(&mut buffers.output, &buffers.weights, input)?;
        kernels::add_into(&mut buffers.output, &buffers.biases)?;
        Ok(buffers.output.as_slice())
    }

    /// Accumulate this sample's parameter gradients into the delta buffers.
    ///
    /// `delta_weights` is row-major with `size * prev_size` elements.
    pub fn accumulate(
        &self,
        gradient: &[f64],
        previous_activation: &[f64],
        delta_weights: &mut [f64],
        delta_biases: &mut [f64],
    ) -> Result<()> {
        if self.buffers.is_none() {
            return Ok(());
        }
        Error::check_len("dense gradient", self.size, gradient.len())?;
        Error::check_len("dense previous activation", self.prev_size, previous_activation.len())?;
        Error::check_len("dense weight deltas", self.size * self.prev_size, delta_weights.len())?;
        Error::check_len("dense bias deltas", self.size, delta_biases.len())?;

        if self.prev_size > 0 {
            for (row, &g) in delta_weights.chunks_exact_mut(self.prev_size).zip(gradient) {
                kernels::add_scaled_into(row, previous_activation, g)?;
            }
        }
        kernels::add_into(delta_biases, gradient)
    }

    /// Error propagated to the previous layer: `Wᵀ · gradient`.
    ///
    /// The input layer has nothing to propagate and returns an empty slice.
    pub fn propagate(&mut self, gradient: &[f64]) -> Result<&[f64]> {
        let Some(buffers) = self.buffers.as_mut() else {
            return Ok(&[]);
        };
        kernels::mat_t_vec_into(&mut buffers.error, &buffers.weights, gradient)?;
        Ok(buffers.error.as_slice())
    }

    /// [`accumulate`](Self::accumulate) followed by [`propagate`](Self::propagate).
    pub fn backward(
        &mut self,
        gradient: &[f64],
        previous_activation: &[f64],
        delta_weights: &mut [f64],
        delta_biases: &mut [f64],
    ) -> Result<&[f64]> {
        self.accumulate(gradient, previous_activation, delta_weights, delta_biases)?;
        self.propagate(gradient)
    }

    /// Overwrite parameters from a row-major weight vector and biases.
    pub fn load_parameters(&mut self, weights: &[f64], biases: &[f64]) -> Result<()> {
        let expected = self.size * self.prev_size;
        let Some(buffers) = self.buffers.as_mut() else {
            Error::check_len("input layer weights", 0, weights.len())?;
            return Error::check_len("input layer biases", 0, biases.len());
        };
        Error::check_len("loaded weights", expected, weights.len())?;
        Error::check_len("loaded biases", self.size, biases.len())?;
        if self.prev_size > 0 {
            for (row, values) in buffers.weights.iter_mut().zip(weights.chunks_exact(self.prev_size)) {
                row.copy_from_slice(values);
            }
        }
        buffers.biases.copy_from_slice(biases);
        Ok(())
    }
}

impl std::fmt::Debug for Dense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dense")
            .field("size", &self.size)
            .field("prev_size", &self.prev_size)
            .field("index", &self.index)
            .field("activation", &self.activation)
            .field("dropout", &self.dropout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn built(layer: Dense, index: usize, prev: usize, arena: &mut Arena) -> Dense {
        let mut layer = layer;
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        layer.build(index, prev, arena, &mut rng, false).unwrap();
        layer
    }

    #[test]
    fn test_input_layer_owns_nothing() {
        let mut arena = Arena::default();
        let mut layer = built(Dense::input(3), 0, 0, &mut arena);
        assert!(layer.is_input());
        assert_eq!(arena.stats().entries, 0);
        assert_eq!(layer.parameter_count(), 0);
        let input = [1.0, 2.0, 3.0];
        assert_eq!(layer.step(&input).unwrap(), &input);
        assert!(layer.propagate(&[1.0, 1.0, 1.0]).unwrap().is_empty());
    }

    #[test]
    fn test_step_computes_affine_map() {
        let mut arena = Arena::default();
        let layer = Dense::new(2)
            .with_activation(Activation::Linear)
            .with_parameters(vec![vec![0.4, 0.1], vec![-0.1, 0.2]], vec![-0.1, 0.5]);
        assert!(layer.skip_weights_initialization());
        let mut layer = built(layer, 1, 2, &mut arena);
        assert!(!layer.skip_weights_initialization());

        let prime = layer.step(&[1.0, 2.0]).unwrap().to_vec();
        assert_relative_eq!(prime[0], 0.4 + 0.2 - 0.1);
        assert_relative_eq!(prime[1], -0.1 + 0.4 + 0.5);
        assert_eq!(layer.output(), prime.as_slice());
        assert!(layer.step(&[1.0]).is_err());
    }

    #[test]
    fn test_backward_accumulates_outer_product() {
        let mut arena = Arena::default();
        let layer = Dense::new(2).with_parameters(vec![vec![1.0, 2.0], vec![3.0, 4.0]], vec![0.0, 0.0]);
        let mut layer = built(layer, 1, 2, &mut arena);

        let mut dw = vec![0.0; 4];
        let mut db = vec![0.0; 2];
        let propagated = layer
            .backward(&[1.0, -1.0], &[0.5, 2.0], &mut dw, &mut db)
            .unwrap()
            .to_vec();
        assert_eq!(dw, vec![0.5, 2.0, -0.5, -2.0]);
        assert_eq!(db, vec![1.0, -1.0]);
        assert_eq!(propagated, vec![1.0 - 3.0, 2.0 - 4.0]);

        // accumulation adds on top
        layer.accumulate(&[1.0, -1.0], &[0.5, 2.0], &mut dw, &mut db).unwrap();
        assert_eq!(dw, vec![1.0, 4.0, -1.0, -4.0]);
    }

    #[test]
    fn test_build_once() {
        let mut arena = Arena::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut layer = built(Dense::new(3), 1, 2, &mut arena);
        let before = layer.flat_weights();

        assert!(matches!(
            layer.build(1, 2, &mut arena, &mut rng, false),
            Err(Error::AlreadyBuilt { index: 1 })
        ));
        layer.build(2, 2, &mut arena, &mut rng, true).unwrap();
        assert_eq!(layer.index(), Some(2));
        assert_eq!(layer.flat_weights(), before);

        assert!(layer.build(1, 5, &mut arena, &mut rng, true).is_err());
    }

    #[test]
    fn test_invalid_configuration() {
        let mut arena = Arena::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(Dense::new(0).build(1, 2, &mut arena, &mut rng, false).is_err());
        assert!(Dense::new(2)
            .with_dropout(1.0)
            .build(1, 2, &mut arena, &mut rng, false)
            .is_err());
        assert!(Dense::new(2)
            .with_parameters(vec![vec![0.0; 3]; 2], vec![0.0; 2])
            .build(1, 2, &mut arena, &mut rng, false)
            .is_err());
        assert!(Dense::new(2)
            .with_regularization(Regularization::new(-1.0, 0.0))
            .build(1, 2, &mut arena, &mut rng, false)
            .is_err());
    }

    #[test]
    fn test_load_parameters() {
        let mut arena = Arena::default();
        let mut layer = built(Dense::new(2), 1, 3, &mut arena);
        layer
            .load_parameters(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[0.5, -0.5])
            .unwrap();
        assert_eq!(layer.weight_rows(), vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        assert_eq!(layer.biases(), &[0.5, -0.5]);
        assert!(layer.load_parameters(&[1.0], &[0.0, 0.0]).is_err());
    }

    #[test]
    fn test_step_before_build_fails() {
        let mut layer = Dense::new(2);
        assert!(matches!(layer.step(&[1.0, 2.0]), Err(Error::NotCompiled(_))));
    }
}
