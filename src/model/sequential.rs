//! Plain stack of dense layers.

use log::debug;

use super::engine::{BatchDeltas, LayerParameters, ModelCore};
use super::{Evaluation, LayerStack, ModelConfig, Snapshot, TrainOptions, TrainReport};
use crate::activations::Activation;
use crate::error::{Error, Result};
use crate::layers::Dense;
use crate::losses::Loss;
use crate::optimizers::Optimizer;

/// Ordered stack of dense layers with one optimizer and one loss.
///
/// ```
/// use zen_dense::{Activation, Loss, Optimizer, Sequential, TrainOptions};
///
/// let mut model = Sequential::builder()
///     .input(2)
///     .dense(3, Activation::Tanh)
///     .dense(1, Activation::Sigmoid)
///     .optimizer(Optimizer::adam(0.05))
///     .loss(Loss::BinaryCrossEntropy)
///     .build()?;
///
/// let inputs = vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]];
/// let expected = vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]];
/// model.train(&inputs, &expected, &TrainOptions::new(10, 4))?;
/// assert_eq!(model.compute(&[1.0, 0.0])?.len(), 1);
/// # Ok::<(), zen_dense::Error>(())
/// ```
pub struct Sequential {
    pub(crate) layers: Vec<Dense>,
    pub(crate) core: ModelCore,
}

impl Sequential {
    /// Empty, uncompiled model.
    pub fn new(optimizer: Optimizer, loss: Loss, config: ModelConfig) -> Result<Self> {
        Ok(Self {
            layers: Vec::new(),
            core: ModelCore::new(optimizer, loss, config)?,
        })
    }

    pub fn builder() -> SequentialBuilder {
        SequentialBuilder::default()
    }

    /// Append an unbuilt layer.
    pub fn add(&mut self, layer: Dense) -> Result<()> {
        if let Some(index) = layer.index() {
            return Err(Error::AlreadyBuilt { index });
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Append a layer that may already be built elsewhere; its parameters
    /// are kept as they are.
    pub fn add_reused(&mut self, layer: Dense) {
        self.layers.push(layer);
    }

    /// Build all layers and allocate training state.
    ///
    /// Calling it again is a no-op unless layers were added in between.
    pub fn compile(&mut self) -> Result<()> {
        if self.core.is_compiled() && self.core.cached_layers() == self.layers.len() {
            return Ok(());
        }
        super::engine::validate_architecture(&self.layers, &self.core.loss)?;

        let mut prev_size = 0;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let reuse = layer.is_built();
            layer.build(i, prev_size, &mut self.core.arena, &mut self.core.rng, reuse)?;
            prev_size = layer.size();
        }
        self.core.compile(&self.layers)?;
        debug!(
            "sequential model compiled: {:?}",
            self.layers.iter().map(Dense::size).collect::<Vec<_>>()
        );
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.core.is_compiled()
    }

    // === INFERENCE / TRAINING ===

    pub fn compute(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.core.compute(&mut self.layers, input)
    }

    pub fn train<I, E>(&mut self, inputs: &[I], expecteds: &[E], options: &TrainOptions) -> Result<TrainReport>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.train(&mut self.layers, inputs, expecteds, options)
    }

    /// Train on one mini-batch with a single weight update; returns the
    /// summed sample loss.
    pub fn train_batch<I, E>(&mut self, inputs: &[I], expecteds: &[E]) -> Result<f64>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.train_batch(&mut self.layers, inputs, expecteds)
    }

    pub fn evaluate<I, E>(&mut self, inputs: &[I], expecteds: &[E]) -> Result<Evaluation>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.evaluate(&mut self.layers, inputs, expecteds)
    }

    /// Accumulate deltas for a batch without touching the weights.
    pub fn accumulate<I, E>(&mut self, inputs: &[I], expecteds: &[E]) -> Result<BatchDeltas>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.accumulate_from(0, inputs, expecteds)
    }

    /// Accumulate deltas for the part of a larger batch that starts at
    /// sample `offset`.
    pub fn accumulate_from<I, E>(&mut self, offset: usize, inputs: &[I], expecteds: &[E]) -> Result<BatchDeltas>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.accumulate_blocks(&mut self.layers, offset, inputs, expecteds)
    }

    /// Merge deltas accumulated elsewhere, given in sample order, and update
    /// once.
    pub fn apply_deltas(&mut self, deltas: &[BatchDeltas]) -> Result<()> {
        self.core.apply_deltas(&mut self.layers, deltas)
    }

    pub fn before_pass(&mut self) {
        self.core.optimizer.before_pass();
    }

    pub fn after_pass(&mut self) {
        self.core.optimizer.after_pass();
    }

    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot(&self.layers)
    }

    /// Copy of every layer's weights and biases.
    pub fn parameters(&self) -> Vec<LayerParameters> {
        self.core.parameters(&self.layers)
    }

    pub fn load_parameters(&mut self, parameters: &[LayerParameters]) -> Result<()> {
        self.core.load_parameters(&mut self.layers, parameters)
    }

    // === ACCESSORS ===

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Dense> {
        self.layers.get(index)
    }

    /// Hand the layers over, e.g. to share them with another model.
    pub fn into_layers(self) -> Vec<Dense> {
        self.layers
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, Dense::size)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, Dense::size)
    }

    pub fn output_activation(&self) -> Option<Activation> {
        self.layers.last().map(Dense::activation)
    }

    pub fn epoch(&self) -> u64 {
        self.core.epoch
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.core.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.core.optimizer
    }

    pub fn loss(&self) -> Loss {
        self.core.loss
    }

    pub fn config(&self) -> &ModelConfig {
        &self.core.config
    }
}

impl LayerStack for Sequential {
    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn layer(&self, index: usize) -> &Dense {
        &self.layers[index]
    }

    fn layer_mut(&mut self, index: usize) -> &mut Dense {
        &mut self.layers[index]
    }
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequential")
            .field("layers", &self.layers)
            .field("optimizer", &self.core.optimizer)
            .field("loss", &self.core.loss)
            .field("epoch", &self.core.epoch)
            .finish()
    }
}

/// Fluent builder producing a compiled [`Sequential`].
#[derive(Debug, Default)]
pub struct SequentialBuilder {
    layers: Vec<Dense>,
    optimizer: Option<Optimizer>,
    loss: Loss,
    config: ModelConfig,
}

impl SequentialBuilder {
    pub fn input(mut self, size: usize) -> Self {
        self.layers.push(Dense::input(size));
        self
    }

    pub fn dense(mut self, size: usize, activation: Activation) -> Self {
        self.layers.push(Dense::new(size).with_activation(activation));
        self
    }

    pub fn layer(mut self, layer: Dense) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Assemble and compile. Defaults to SGD with learning rate 0.1.
    pub fn build(self) -> Result<Sequential> {
        let optimizer = self.optimizer.unwrap_or_else(|| Optimizer::sgd(0.1));
        let mut model = Sequential::new(optimizer, self.loss, self.config)?;
        for layer in self.layers {
            model.add(layer)?;
        }
        model.compile()?;
        Ok(model)
    }
}
