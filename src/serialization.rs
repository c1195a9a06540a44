/**
 * @file src/serialization.rs
 * @brief Model descriptors and JSON persistence
 *
 * Every model can be described as a plain, owned value tree:
 *
 * - [`LayerDescriptor`]: size, activation, initializer tags, dropout,
 *   regularization, weight rows and biases
 * - [`OptimizerDescriptor`]: variant with hyperparameters, learning rate
 *   state, decay and per-layer moment buffers
 * - [`ModelDescriptor`], [`ChainDescriptor`], [`GanDescriptor`]: one per
 *   topology, including the loss, configuration and epoch counter
 *
 * Descriptors are `Send` and independent of any arena, so they also carry
 * models across threads (see `parallel`). With the `serde` feature they
 * serialize to JSON; string tags for activations, losses, optimizers and
 * initializers only appear at this boundary.
 *
 * Restoring a model builds its layers from the stored parameters instead of
 * the initializers, compiles it, then restores optimizer moments, the
 * learning rate and the epoch. The random stream restarts from the
 * configured seed.
 */

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::layers::{Dense, Regularization};
use crate::losses::Loss;
use crate::model::engine::ModelCore;
use crate::model::{ChainModel, GenerativeAdversarialModel, LayerStack, ModelConfig, Sequential};
use crate::optimizers::{MomentSnapshot, Optimizer, OptimizerKind};

// === DESCRIPTORS ===

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct LayerDescriptor {
    pub size: usize,
    pub activation: Activation,
    pub weight_init: Initializer,
    pub bias_init: Initializer,
    #[cfg_attr(feature = "serde", serde(default))]
    pub dropout: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub regularization: Regularization,
    /// One row of `prev_size` values per neuron; empty for the input layer
    #[cfg_attr(feature = "serde", serde(default))]
    pub weights: Vec<Vec<f64>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub biases: Vec<f64>,
}

impl LayerDescriptor {
    pub fn of(layer: &Dense) -> Self {
        Self {
            size: layer.size(),
            activation: layer.activation(),
            weight_init: layer.weight_init(),
            bias_init: layer.bias_init(),
            dropout: layer.dropout(),
            regularization: *layer.regularization(),
            weights: layer.weight_rows(),
            biases: layer.biases().to_vec(),
        }
    }

    /// Unbuilt layer that will take the stored parameters when built.
    pub fn to_layer(&self) -> Dense {
        let layer = Dense::new(self.size)
            .with_activation(self.activation)
            .with_weight_init(self.weight_init)
            .with_bias_init(self.bias_init)
            .with_dropout(self.dropout)
            .with_regularization(self.regularization);
        if self.weights.is_empty() {
            layer
        } else {
            layer.with_parameters(self.weights.clone(), self.biases.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct OptimizerDescriptor {
    pub kind: OptimizerKind,
    /// Current (possibly decayed) learning rate
    pub learning_rate: f64,
    pub initial_learning_rate: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub decay: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub moments: Vec<MomentSnapshot>,
}

impl OptimizerDescriptor {
    pub fn of(optimizer: &Optimizer) -> Self {
        Self {
            kind: optimizer.kind(),
            learning_rate: optimizer.learning_rate(),
            initial_learning_rate: optimizer.initial_learning_rate(),
            decay: optimizer.decay(),
            moments: optimizer.moments(),
        }
    }

    /// Optimizer with the stored hyperparameters and no moment state.
    pub fn to_optimizer(&self) -> Optimizer {
        let mut optimizer = Optimizer::new(self.kind, self.initial_learning_rate).with_decay(self.decay);
        optimizer.set_learning_rate(self.learning_rate);
        optimizer
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ModelDescriptor {
    pub optimizer: OptimizerDescriptor,
    pub loss: Loss,
    pub config: ModelConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub epoch: u64,
    pub layers: Vec<LayerDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ChainDescriptor {
    pub models: Vec<ModelDescriptor>,
    /// One flag per sub-model
    pub trainable: Vec<bool>,
    pub optimizer: OptimizerDescriptor,
    pub loss: Loss,
    pub config: ModelConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub epoch: u64,
}

impl ModelDescriptor {
    /// Same model with the optimizer moments dropped.
    pub fn without_moments(mut self) -> Self {
        self.optimizer.moments.clear();
        self
    }
}

impl ChainDescriptor {
    /// Same chain with the moments of every optimizer dropped.
    pub fn without_moments(mut self) -> Self {
        self.optimizer.moments.clear();
        self.models = self.models.into_iter().map(ModelDescriptor::without_moments).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct GanDescriptor {
    pub generator: ModelDescriptor,
    pub discriminator: ModelDescriptor,
    /// Optimizer of the generator-through-discriminator chain
    pub optimizer: OptimizerDescriptor,
    pub config: ModelConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub epoch: u64,
}

/// Restore optimizer moments, learning rate and epoch onto a compiled core.
fn restore_training_state<S: LayerStack + ?Sized>(
    core: &mut ModelCore,
    stack: &S,
    optimizer: &OptimizerDescriptor,
    epoch: u64,
) -> Result<()> {
    for moment in &optimizer.moments {
        if moment.layer == 0 || moment.layer >= stack.layer_count() {
            return Err(Error::DimensionMismatch {
                context: "moment layer",
                expected: stack.layer_count(),
                actual: moment.layer,
            });
        }
        core.optimizer
            .restore_moment(moment, stack.layer(moment.layer), &mut core.arena)?;
    }
    core.optimizer.set_learning_rate(optimizer.learning_rate);
    core.epoch = epoch;
    Ok(())
}

// === SEQUENTIAL ===

impl Sequential {
    pub fn describe(&self) -> ModelDescriptor {
        ModelDescriptor {
            optimizer: OptimizerDescriptor::of(&self.core.optimizer),
            loss: self.core.loss,
            config: self.core.config,
            epoch: self.core.epoch,
            layers: self.layers.iter().map(LayerDescriptor::of).collect(),
        }
    }

    /// Rebuild and compile a model from its descriptor.
    pub fn from_descriptor(descriptor: &ModelDescriptor) -> Result<Self> {
        let mut model = Sequential::new(
            descriptor.optimizer.to_optimizer(),
            descriptor.loss,
            descriptor.config,
        )?;
        for layer in &descriptor.layers {
            model.add(layer.to_layer())?;
        }
        model.compile()?;
        restore_training_state(&mut model.core, &model.layers, &descriptor.optimizer, descriptor.epoch)?;
        Ok(model)
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.describe())?)
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_descriptor(&serde_json::from_str(json)?)
    }
}

// === CHAIN ===

impl ChainModel {
    pub fn describe(&self) -> ChainDescriptor {
        ChainDescriptor {
            models: self.stack.models.iter().map(Sequential::describe).collect(),
            trainable: self.stack.trainable.clone(),
            optimizer: OptimizerDescriptor::of(&self.core.optimizer),
            loss: self.core.loss,
            config: self.core.config,
            epoch: self.core.epoch,
        }
    }

    pub fn from_descriptor(descriptor: &ChainDescriptor) -> Result<Self> {
        Error::check_len("chain trainable flags", descriptor.models.len(), descriptor.trainable.len())?;
        let models = descriptor
            .models
            .iter()
            .map(Sequential::from_descriptor)
            .collect::<Result<Vec<_>>>()?;
        let mut chain = ChainModel::new(
            models,
            descriptor.optimizer.to_optimizer(),
            descriptor.loss,
            descriptor.config,
        )?;
        for (k, &trainable) in descriptor.trainable.iter().enumerate() {
            chain.set_trainable(k, trainable)?;
        }
        restore_training_state(&mut chain.core, &chain.stack, &descriptor.optimizer, descriptor.epoch)?;
        Ok(chain)
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.describe())?)
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_descriptor(&serde_json::from_str(json)?)
    }
}

// === GAN ===

impl GenerativeAdversarialModel {
    pub fn describe(&self) -> GanDescriptor {
        let chain = &self.chain;
        GanDescriptor {
            generator: self.generator().describe(),
            discriminator: self.discriminator().describe(),
            optimizer: OptimizerDescriptor::of(&chain.core.optimizer),
            config: chain.core.config,
            epoch: chain.core.epoch,
        }
    }

    pub fn from_descriptor(descriptor: &GanDescriptor) -> Result<Self> {
        let mut gan = GenerativeAdversarialModel::new(
            Sequential::from_descriptor(&descriptor.generator)?,
            Sequential::from_descriptor(&descriptor.discriminator)?,
            descriptor.optimizer.to_optimizer(),
            descriptor.config,
        )?;
        let chain = &mut gan.chain;
        restore_training_state(&mut chain.core, &chain.stack, &descriptor.optimizer, descriptor.epoch)?;
        Ok(gan)
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.describe())?)
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_descriptor(&serde_json::from_str(json)?)
    }
}
