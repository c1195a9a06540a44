//! Sub-models concatenated end to end.
//!
//! A chain owns its sub-models and trains through all of them with its own
//! optimizer, loss and caches. Every layer keeps belonging to its sub-model:
//! training the sub-model directly and training the chain update the very
//! same weights. Layer 0 of the chain is the first sub-model's input layer;
//! the input layers of later sub-models are skipped because the previous
//! sub-model's output feeds them directly.
//!
//! Each sub-model carries a trainable flag. Layers of frozen sub-models still
//! propagate errors backwards but receive no weight updates.

use log::debug;

use super::engine::{BatchDeltas, LayerParameters, ModelCore};
use super::{Evaluation, LayerStack, ModelConfig, Sequential, Snapshot, TrainOptions, TrainReport};
use crate::error::{Error, Result};
use crate::layers::Dense;
use crate::losses::Loss;
use crate::optimizers::Optimizer;

/// Owning sub-model and local index of one chain layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    model: usize,
    layer: usize,
}

pub(crate) struct ChainStack {
    pub(crate) models: Vec<Sequential>,
    pub(crate) trainable: Vec<bool>,
    routes: Vec<Route>,
}

impl ChainStack {
    fn new(models: Vec<Sequential>) -> Result<Self> {
        if models.is_empty() {
            return Err(Error::InvalidArchitecture("a chain needs at least one sub-model".to_string()));
        }
        for (k, pair) in models.windows(2).enumerate() {
            if pair[0].output_size() != pair[1].input_size() {
                return Err(Error::InvalidArchitecture(format!(
                    "sub-model {} outputs {} values but sub-model {} expects {}",
                    k,
                    pair[0].output_size(),
                    k + 1,
                    pair[1].input_size()
                )));
            }
        }

        let mut routes = Vec::new();
        for (model, sub) in models.iter().enumerate() {
            let first = if model == 0 { 0 } else { 1 };
            routes.extend((first..sub.layers.len()).map(|layer| Route { model, layer }));
        }
        Ok(Self {
            trainable: vec![true; models.len()],
            models,
            routes,
        })
    }
}

impl LayerStack for ChainStack {
    fn layer_count(&self) -> usize {
        self.routes.len()
    }

    fn layer(&self, index: usize) -> &Dense {
        let route = self.routes[index];
        &self.models[route.model].layers[route.layer]
    }

    fn layer_mut(&mut self, index: usize) -> &mut Dense {
        let route = self.routes[index];
        &mut self.models[route.model].layers[route.layer]
    }

    fn is_trainable(&self, index: usize) -> bool {
        self.trainable[self.routes[index].model]
    }

    /// Dropout follows the layer's place in its own sub-model, so a
    /// sub-model's output layer stays unmasked inside the chain.
    fn allows_dropout(&self, index: usize) -> bool {
        let route = self.routes[index];
        route.layer > 0 && route.layer + 1 < self.models[route.model].layers.len()
    }
}

/// Composite model training through a sequence of sub-models.
pub struct ChainModel {
    pub(crate) stack: ChainStack,
    pub(crate) core: ModelCore,
}

impl ChainModel {
    /// Chain compiled sub-models (uncompiled ones are compiled first).
    pub fn new(models: Vec<Sequential>, optimizer: Optimizer, loss: Loss, config: ModelConfig) -> Result<Self> {
        let mut models = models;
        for model in models.iter_mut() {
            model.compile()?;
        }
        let mut chain = Self {
            stack: ChainStack::new(models)?,
            core: ModelCore::new(optimizer, loss, config)?,
        };
        chain.compile()?;
        Ok(chain)
    }

    /// Allocate chain caches and optimizer slots. Idempotent.
    pub fn compile(&mut self) -> Result<()> {
        if self.core.is_compiled() && self.core.cached_layers() == self.stack.layer_count() {
            return Ok(());
        }
        self.core.compile(&self.stack)?;
        debug!(
            "chain compiled: {} sub-models, {} layers",
            self.stack.models.len(),
            self.stack.layer_count()
        );
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.core.is_compiled()
    }

    /// Freeze or unfreeze the weights of sub-model `model`.
    pub fn set_trainable(&mut self, model: usize, trainable: bool) -> Result<()> {
        let count = self.stack.models.len();
        let flag = self.stack.trainable.get_mut(model).ok_or(Error::DimensionMismatch {
            context: "chain sub-model",
            expected: count,
            actual: model + 1,
        })?;
        *flag = trainable;
        Ok(())
    }

    pub fn is_trainable(&self, model: usize) -> bool {
        self.stack.trainable.get(model).copied().unwrap_or(false)
    }

    // === INFERENCE / TRAINING ===

    pub fn compute(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.core.compute(&mut self.stack, input)
    }

    pub fn train<I, E>(&mut self, inputs: &[I], expecteds: &[E], options: &TrainOptions) -> Result<TrainReport>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.train(&mut self.stack, inputs, expecteds, options)
    }

    pub fn train_batch<I, E>(&mut self, inputs: &[I], expecteds: &[E]) -> Result<f64>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.train_batch(&mut self.stack, inputs, expecteds)
    }

    pub fn evaluate<I, E>(&mut self, inputs: &[I], expecteds: &[E]) -> Result<Evaluation>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.core.evaluate(&mut self.stack, inputs, expecteds)
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
        self.core.accumulate_blocks(&mut self.stack, offset, inputs, expecteds)
    }

    pub fn apply_deltas(&mut self, deltas: &[BatchDeltas]) -> Result<()> {
        self.core.apply_deltas(&mut self.stack, deltas)
    }

    pub fn before_pass(&mut self) {
        self.core.optimizer.before_pass();
    }

    pub fn after_pass(&mut self) {
        self.core.optimizer.after_pass();
    }

    /// Weights and biases of every chain layer, in chain order.
    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot(&self.stack)
    }

    pub fn parameters(&self) -> Vec<LayerParameters> {
        self.core.parameters(&self.stack)
    }

    pub fn load_parameters(&mut self, parameters: &[LayerParameters]) -> Result<()> {
        self.core.load_parameters(&mut self.stack, parameters)
    }

    // === ACCESSORS ===

    pub fn models(&self) -> &[Sequential] {
        &self.stack.models
    }

    pub fn model(&self, index: usize) -> Option<&Sequential> {
        self.stack.models.get(index)
    }

    /// Direct access to a sub-model, e.g. to train it on its own.
    pub fn model_mut(&mut self, index: usize) -> Option<&mut Sequential> {
        self.stack.models.get_mut(index)
    }

    pub fn into_models(self) -> Vec<Sequential> {
        self.stack.models
    }

    pub fn layer_count(&self) -> usize {
        self.stack.layer_count()
    }

    pub fn layer(&self, index: usize) -> Option<&Dense> {
        (index < self.stack.layer_count()).then(|| self.stack.layer(index))
    }

    pub fn input_size(&self) -> usize {
        self.stack.layer(0).size()
    }

    pub fn output_size(&self) -> usize {
        self.stack.layer(self.stack.layer_count() - 1).size()
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

impl std::fmt::Debug for ChainModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainModel")
            .field("models", &self.stack.models)
            .field("trainable", &self.stack.trainable)
            .field("optimizer", &self.core.optimizer)
            .field("loss", &self.core.loss)
            .finish()
    }
}
