//! Gradient-descent optimizers with per-layer persistent moment state.
//!
//! One [`Optimizer`] serves a whole model. Its moment buffers live in the
//! model's arena and are addressed by layer index: slot `i` belongs to the
//! layer at position `i` of the model (or of the chain, for composites).
//! Slots are allocated when the model compiles and lazily on first use
//! otherwise; they persist for the optimizer's lifetime and are cleared only
//! by [`Optimizer::reset`] or overwritten when restoring a snapshot.
//!
//! Every update runs the same pipeline:
//!
//! 1. divide the accumulated deltas by the batch size (skipped for 1)
//! 2. add L1 (`sign(p) * λ1`) and L2 (`2 * p * λ2`) terms where enabled
//! 3. apply the variant's moment update to obtain the adjusted delta
//! 4. `p -= lr * adjusted`

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{Error, Result};
use crate::kernels;
use crate::layers::Dense;
use crate::losses::sign;
use crate::memory::{Arena, Slice};

pub const DEFAULT_MOMENTUM: f64 = 0.9;
pub const DEFAULT_RMS_DECAY: f64 = 0.9;
pub const DEFAULT_EPSILON: f64 = 1e-8;
pub const DEFAULT_BETA1: f64 = 0.9;
pub const DEFAULT_BETA2: f64 = 0.999;

/// Optimizer variants and their hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "camelCase"))]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent
    Sgd,
    /// Exponential moving average of the deltas
    Momentum { beta: f64 },
    /// Look-ahead gradient evaluated at `prime + momentum`
    Nesterov { beta: f64 },
    /// Deltas scaled by a running RMS of their magnitude
    RmsProp { beta: f64, epsilon: f64 },
    /// Bias-corrected first and second moment estimates
    Adam { beta1: f64, beta2: f64, epsilon: f64 },
}

impl OptimizerKind {
    pub fn momentum() -> Self {
        OptimizerKind::Momentum {
            beta: DEFAULT_MOMENTUM,
        }
    }

    pub fn nesterov() -> Self {
        OptimizerKind::Nesterov {
            beta: DEFAULT_MOMENTUM,
        }
    }

    pub fn rms_prop() -> Self {
        OptimizerKind::RmsProp {
            beta: DEFAULT_RMS_DECAY,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn adam() -> Self {
        OptimizerKind::Adam {
            beta1: DEFAULT_BETA1,
            beta2: DEFAULT_BETA2,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Momentum { .. } => "momentum",
            OptimizerKind::Nesterov { .. } => "nesterov",
            OptimizerKind::RmsProp { .. } => "rmsProp",
            OptimizerKind::Adam { .. } => "adam",
        }
    }

    /// Number of moment buffers kept per layer.
    pub fn buffer_count(&self) -> usize {
        match self {
            OptimizerKind::Sgd => 0,
            OptimizerKind::Nesterov { .. } => 1,
            OptimizerKind::Momentum { .. } | OptimizerKind::RmsProp { .. } => 2,
            OptimizerKind::Adam { .. } => 4,
        }
    }

    fn validate(&self) -> Result<()> {
        let in_unit = |name: &str, v: f64| {
            if (0.0..1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::InvalidConfiguration(format!(
                    "{} {} must be in [0, 1), got {}",
                    self.name(),
                    name,
                    v
                )))
            }
        };
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(Error::InvalidConfiguration(format!(
                    "{} {} must be positive, got {}",
                    self.name(),
                    name,
                    v
                )))
            }
        };
        match *self {
            OptimizerKind::Sgd => Ok(()),
            OptimizerKind::Momentum { beta } | OptimizerKind::Nesterov { beta } => in_unit("beta", beta),
            OptimizerKind::RmsProp { beta, epsilon } => {
                in_unit("beta", beta)?;
                positive("epsilon", epsilon)
            }
            OptimizerKind::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                in_unit("beta1", beta1)?;
                in_unit("beta2", beta2)?;
                positive("epsilon", epsilon)
            }
        }
    }
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Sgd
    }
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        match key {
            "sgd" => Ok(OptimizerKind::Sgd),
            "momentum" => Ok(OptimizerKind::momentum()),
            "nesterov" => Ok(OptimizerKind::nesterov()),
            "rmsProp" => Ok(OptimizerKind::rms_prop()),
            "adam" => Ok(OptimizerKind::adam()),
            other => Err(Error::UnknownType {
                kind: "optimizer",
                key: other.to_string(),
            }),
        }
    }
}

// === MOMENT STATE ===

enum MomentBuffers {
    Momentum { weights: Slice, biases: Slice },
    Nesterov { output: Slice },
    RmsProp { weights: Slice, biases: Slice },
    Adam {
        m_weights: Slice,
        m_biases: Slice,
        v_weights: Slice,
        v_biases: Slice,
    },
}

impl MomentBuffers {
    fn allocate(kind: OptimizerKind, size: usize, prev_size: usize, arena: &mut Arena) -> Option<Self> {
        let params = size * prev_size;
        match kind {
            OptimizerKind::Sgd => None,
            OptimizerKind::Momentum { .. } => Some(MomentBuffers::Momentum {
                weights: arena.alloc(params),
                biases: arena.alloc(size),
            }),
            OptimizerKind::Nesterov { .. } => Some(MomentBuffers::Nesterov {
                output: arena.alloc(size),
            }),
            OptimizerKind::RmsProp { .. } => Some(MomentBuffers::RmsProp {
                weights: arena.alloc(params),
                biases: arena.alloc(size),
            }),
            OptimizerKind::Adam { .. } => Some(MomentBuffers::Adam {
                m_weights: arena.alloc(params),
                m_biases: arena.alloc(size),
                v_weights: arena.alloc(params),
                v_biases: arena.alloc(size),
            }),
        }
    }

    fn slices(&self) -> Vec<&Slice> {
        match self {
            MomentBuffers::Momentum { weights, biases } | MomentBuffers::RmsProp { weights, biases } => {
                vec![weights, biases]
            }
            MomentBuffers::Nesterov { output } => vec![output],
            MomentBuffers::Adam {
                m_weights,
                m_biases,
                v_weights,
                v_biases,
            } => vec![m_weights, m_biases, v_weights, v_biases],
        }
    }

    fn slices_mut(&mut self) -> Vec<&mut Slice> {
        match self {
            MomentBuffers::Momentum { weights, biases } | MomentBuffers::RmsProp { weights, biases } => {
                vec![weights, biases]
            }
            MomentBuffers::Nesterov { output } => vec![output],
            MomentBuffers::Adam {
                m_weights,
                m_biases,
                v_weights,
                v_biases,
            } => vec![m_weights, m_biases, v_weights, v_biases],
        }
    }
}

struct LayerMoments {
    calls: u64,
    buffers: MomentBuffers,
}

/// Copied-out moment state of one layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct MomentSnapshot {
    /// Layer position the state belongs to
    pub layer: usize,
    /// Number of weight updates applied so far
    pub calls: u64,
    /// Moment buffers in variant order (momentum: weights, biases;
    /// nesterov: output; rmsProp: weights, biases; adam: m and v pairs)
    pub buffers: Vec<Vec<f64>>,
}

// === OPTIMIZER ===

/// Optimizer shared by all layers of a model
pub struct Optimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    initial_learning_rate: f64,
    decay: f64,
    states: Vec<Option<LayerMoments>>,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: f64) -> Self {
        Self {
            kind,
            learning_rate,
            initial_learning_rate: learning_rate,
            decay: 0.0,
            states: Vec::new(),
        }
    }

    pub fn sgd(learning_rate: f64) -> Self {
        Self::new(OptimizerKind::Sgd, learning_rate)
    }

    pub fn momentum(learning_rate: f64) -> Self {
        Self::new(OptimizerKind::momentum(), learning_rate)
    }

    pub fn nesterov(learning_rate: f64) -> Self {
        Self::new(OptimizerKind::nesterov(), learning_rate)
    }

    pub fn rms_prop(learning_rate: f64) -> Self {
        Self::new(OptimizerKind::rms_prop(), learning_rate)
    }

    pub fn adam(learning_rate: f64) -> Self {
        Self::new(OptimizerKind::adam(), learning_rate)
    }

    /// Inverse-time learning rate decay applied after every pass.
    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    /// Same hyperparameters and current learning rate, no moment state.
    pub fn fresh(&self) -> Self {
        Self {
            kind: self.kind,
            learning_rate: self.learning_rate,
            initial_learning_rate: self.initial_learning_rate,
            decay: self.decay,
            states: Vec::new(),
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn initial_learning_rate(&self) -> f64 {
        self.initial_learning_rate
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Restore a decayed learning rate, e.g. from a snapshot.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// True when `step` keeps no state of its own between samples.
    pub fn has_stateless_step(&self) -> bool {
        !matches!(self.kind, OptimizerKind::Nesterov { .. })
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::InvalidConfiguration(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.decay >= 0.0 && self.decay.is_finite()) {
            return Err(Error::InvalidConfiguration(format!(
                "decay must be non-negative, got {}",
                self.decay
            )));
        }
        self.kind.validate()
    }

    pub fn description(&self) -> String {
        let mut text = format!("{} (lr={}, decay={}", self.kind.name(), self.learning_rate, self.decay);
        match self.kind {
            OptimizerKind::Sgd => {}
            OptimizerKind::Momentum { beta } | OptimizerKind::Nesterov { beta } => {
                text.push_str(&format!(", beta={}", beta));
            }
            OptimizerKind::RmsProp { beta, epsilon } => {
                text.push_str(&format!(", beta={}, epsilon={}", beta, epsilon));
            }
            OptimizerKind::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                text.push_str(&format!(", beta1={}, beta2={}, epsilon={}", beta1, beta2, epsilon));
            }
        }
        text.push(')');
        text
    }

    /// Allocate the moment slot for the layer at `index` if it is missing.
    pub fn prepare(&mut self, index: usize, layer: &Dense, arena: &mut Arena) {
        if !layer.is_input() {
            self.ensure_state(index, layer.size(), layer.prev_size(), arena);
        }
    }

    fn ensure_state(&mut self, index: usize, size: usize, prev_size: usize, arena: &mut Arena) {
        if self.states.len() <= index {
            self.states.resize_with(index + 1, || None);
        }
        if self.states[index].is_none() {
            self.states[index] = MomentBuffers::allocate(self.kind, size, prev_size, arena)
                .map(|buffers| LayerMoments { calls: 0, buffers });
        }
    }

    // === PER-SAMPLE STEP ===

    /// Gradient with respect to the layer's pre-activation output:
    /// `moment(prime) ⊙ error`, with the moment taken from `value`, the
    /// activation of `prime`.
    ///
    /// Nesterov evaluates the derivative at `prime + momentum` and then folds
    /// the resulting gradient into its momentum.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        index: usize,
        activation: Activation,
        prime: &[f64],
        value: &[f64],
        error: &[f64],
        gradient: &mut [f64],
        arena: &mut Arena,
    ) -> Result<()> {
        Error::check_len("optimizer step error", prime.len(), error.len())?;
        Error::check_len("optimizer step gradient", prime.len(), gradient.len())?;

        match self.kind {
            OptimizerKind::Nesterov { beta } => {
                self.ensure_state(index, prime.len(), 0, arena);
                let Some(LayerMoments {
                    buffers: MomentBuffers::Nesterov { output: momentum },
                    ..
                }) = self.states[index].as_mut()
                else {
                    return Err(Error::InvalidConfiguration(format!(
                        "missing nesterov momentum for layer {}",
                        index
                    )));
                };
                Error::check_len("nesterov momentum", prime.len(), momentum.len())?;
                kernels::zip_map_into(gradient, prime, momentum, |p, m| p + m)?;
                activation.moment_in_place(gradient);
                kernels::mul_into(gradient, error)?;
                kernels::zip_apply(momentum, gradient, |m, g| beta * m + (1.0 - beta) * g)?;
            }
            _ => {
                activation.moment_from_value_into(prime, value, gradient)?;
                kernels::mul_into(gradient, error)?;
            }
        }
        Ok(())
    }

    // === WEIGHT UPDATE ===

    /// Apply accumulated deltas to the layer at `index`.
    ///
    /// The delta buffers are consumed as scratch: on return they hold the
    /// adjusted deltas that were applied.
    #[allow(clippy::too_many_arguments)]
    pub fn update_weights(
        &mut self,
        index: usize,
        layer: &mut Dense,
        delta_weights: &mut [f64],
        delta_biases: &mut [f64],
        epoch: u64,
        batch_size: usize,
        arena: &mut Arena,
    ) -> Result<()> {
        if layer.is_input() {
            return Ok(());
        }
        if batch_size == 0 {
            return Err(Error::EmptyBatch);
        }
        let size = layer.size();
        let prev_size = layer.prev_size();
        Error::check_len("weight deltas", size * prev_size, delta_weights.len())?;
        Error::check_len("bias deltas", size, delta_biases.len())?;
        let regularization = *layer.regularization();

        self.ensure_state(index, size, prev_size, arena);
        let kind = self.kind;
        let learning_rate = self.learning_rate;
        let (weights, biases) = layer
            .parameters_mut()
            .ok_or(Error::NotCompiled("Optimizer::update_weights"))?;

        if batch_size > 1 {
            let n = batch_size as f64;
            delta_weights.iter_mut().for_each(|d| *d /= n);
            delta_biases.iter_mut().for_each(|d| *d /= n);
        }

        if prev_size > 0 {
            for (row, deltas) in weights.iter().zip(delta_weights.chunks_exact_mut(prev_size)) {
                regularize(row, deltas, regularization.l1_weights, regularization.l2_weights);
            }
        }
        regularize(biases, delta_biases, regularization.l1_biases, regularization.l2_biases);

        if let Some(state) = self.states[index].as_mut() {
            let seed = state.calls == 0;
            match (kind, &mut state.buffers) {
                (OptimizerKind::Momentum { beta }, MomentBuffers::Momentum { weights: mw, biases: mb }) => {
                    momentum_adjust(delta_weights, mw, beta, seed)?;
                    momentum_adjust(delta_biases, mb, beta, seed)?;
                }
                (
                    OptimizerKind::RmsProp { beta, epsilon },
                    MomentBuffers::RmsProp { weights: vw, biases: vb },
                ) => {
                    rms_adjust(delta_weights, vw, beta, epsilon)?;
                    rms_adjust(delta_biases, vb, beta, epsilon)?;
                }
                (
                    OptimizerKind::Adam {
                        beta1,
                        beta2,
                        epsilon,
                    },
                    MomentBuffers::Adam {
                        m_weights,
                        m_biases,
                        v_weights,
                        v_biases,
                    },
                ) => {
                    let exponent = i32::try_from(epoch.saturating_add(1)).unwrap_or(i32::MAX);
                    let adam = AdamStep {
                        beta1,
                        beta2,
                        epsilon,
                        correction1: 1.0 - beta1.powi(exponent),
                        correction2: 1.0 - beta2.powi(exponent),
                    };
                    adam.adjust(delta_weights, m_weights, v_weights)?;
                    adam.adjust(delta_biases, m_biases, v_biases)?;
                }
                // Nesterov updates with the plain SGD rule.
                (OptimizerKind::Nesterov { .. }, MomentBuffers::Nesterov { .. }) => {}
                _ => {
                    return Err(Error::InvalidConfiguration(format!(
                        "moment state of layer {} does not match {}",
                        index,
                        kind.name()
                    )))
                }
            }
            state.calls += 1;
        }

        if prev_size > 0 {
            for (row, deltas) in weights.iter_mut().zip(delta_weights.chunks_exact(prev_size)) {
                kernels::add_scaled_into(row, deltas, -learning_rate)?;
            }
        }
        kernels::add_scaled_into(biases, delta_biases, -learning_rate)
    }

    // === PASS HOOKS ===

    pub fn before_pass(&mut self) {}

    /// Inverse-time decay: `lr = (lr0 * lr) / (lr0 + decay * lr)`.
    pub fn after_pass(&mut self) {
        if self.decay > 0.0 {
            self.learning_rate = (self.initial_learning_rate * self.learning_rate)
                / (self.initial_learning_rate + self.decay * self.learning_rate);
        }
    }

    /// Drop all moment state.
    pub fn reset(&mut self) {
        self.states.clear();
    }

    // === SNAPSHOTS ===

    /// Copy out the moment state of every layer that has one.
    pub fn moments(&self) -> Vec<MomentSnapshot> {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(layer, state)| {
                state.as_ref().map(|state| MomentSnapshot {
                    layer,
                    calls: state.calls,
                    buffers: state.buffers.slices().into_iter().map(|s| s.to_vec()).collect(),
                })
            })
            .collect()
    }

    /// Overwrite the moment state of `layer` (at `snapshot.layer`) from a snapshot.
    pub fn restore_moment(&mut self, snapshot: &MomentSnapshot, layer: &Dense, arena: &mut Arena) -> Result<()> {
        Error::check_len("moment buffers", self.kind.buffer_count(), snapshot.buffers.len())?;
        let size = layer.size();
        let params = size * layer.prev_size();
        let expected: Vec<usize> = match self.kind {
            OptimizerKind::Sgd => Vec::new(),
            OptimizerKind::Nesterov { .. } => vec![size],
            OptimizerKind::Momentum { .. } | OptimizerKind::RmsProp { .. } => vec![params, size],
            OptimizerKind::Adam { .. } => vec![params, size, params, size],
        };
        for (values, len) in snapshot.buffers.iter().zip(&expected) {
            Error::check_len("moment buffer", *len, values.len())?;
        }

        self.ensure_state(snapshot.layer, size, layer.prev_size(), arena);
        if let Some(state) = self.states[snapshot.layer].as_mut() {
            state.calls = snapshot.calls;
            for (slice, values) in state.buffers.slices_mut().into_iter().zip(&snapshot.buffers) {
                slice.copy_from_slice(values);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Optimizer")
            .field("kind", &self.kind)
            .field("learning_rate", &self.learning_rate)
            .field("decay", &self.decay)
            .field("layers_with_state", &self.states.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

fn regularize(params: &[f64], deltas: &mut [f64], l1: f64, l2: f64) {
    if l1 > 0.0 {
        for (d, &p) in deltas.iter_mut().zip(params) {
            *d += sign(p) * l1;
        }
    }
    if l2 > 0.0 {
        for (d, &p) in deltas.iter_mut().zip(params) {
            *d += 2.0 * p * l2;
        }
    }
}

/// `m = d + β(m - d)`, seeded with `d` on the first call.
fn momentum_adjust(deltas: &mut [f64], moment: &mut [f64], beta: f64, seed: bool) -> Result<()> {
    Error::check_len("momentum buffer", deltas.len(), moment.len())?;
    for (d, m) in deltas.iter_mut().zip(moment.iter_mut()) {
        *m = if seed { *d } else { (*m - *d).mul_add(beta, *d) };
        *d = *m;
    }
    Ok(())
}

fn rms_adjust(deltas: &mut [f64], cache: &mut [f64], beta: f64, epsilon: f64) -> Result<()> {
    Error::check_len("rms buffer", deltas.len(), cache.len())?;
    for (d, v) in deltas.iter_mut().zip(cache.iter_mut()) {
        *v = beta * *v + (1.0 - beta) * *d * *d;
        *d /= v.sqrt() + epsilon;
    }
    Ok(())
}

struct AdamStep {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    correction1: f64,
    correction2: f64,
}

impl AdamStep {
    fn adjust(&self, deltas: &mut [f64], m: &mut [f64], v: &mut [f64]) -> Result<()> {
        Error::check_len("adam first moment", deltas.len(), m.len())?;
        Error::check_len("adam second moment", deltas.len(), v.len())?;
        for ((d, m), v) in deltas.iter_mut().zip(m.iter_mut()).zip(v.iter_mut()) {
            *m = self.beta1 * *m + (1.0 - self.beta1) * *d;
            *v = self.beta2 * *v + (1.0 - self.beta2) * *d * *d;
            *d = (*m / self.correction1) / ((*v / self.correction2).sqrt() + self.epsilon);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Regularization;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const W0: [[f64; 2]; 2] = [[0.4, 0.1], [-0.1, 0.2]];
    const B0: [f64; 2] = [-0.1, 0.5];

    fn fixture_layer(arena: &mut Arena, regularization: Regularization) -> Dense {
        let mut layer = Dense::new(2)
            .with_regularization(regularization)
            .with_parameters(W0.iter().map(|r| r.to_vec()).collect(), B0.to_vec());
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        layer.build(1, 2, arena, &mut rng, false).unwrap();
        layer
    }

    fn fixture_deltas() -> (Vec<f64>, Vec<f64>) {
        let mut dw = Vec::new();
        for i in 0..2 {
            for j in 0..2 {
                dw.push(i as f64 / 2.0 + j as f64 / 4.0);
            }
        }
        let db = (0..2).map(|i| i as f64 / 2.0).collect();
        (dw, db)
    }

    /// Three updates at epochs 0, 1, 2 with fresh fixture deltas each time.
    fn run_three(optimizer: &mut Optimizer, regularization: Regularization) -> (Vec<f64>, Vec<f64>) {
        let mut arena = Arena::default();
        let mut layer = fixture_layer(&mut arena, regularization);
        optimizer.prepare(1, &layer, &mut arena);
        for epoch in 0..3 {
            let (mut dw, mut db) = fixture_deltas();
            optimizer
                .update_weights(1, &mut layer, &mut dw, &mut db, epoch, 1, &mut arena)
                .unwrap();
        }
        (layer.flat_weights(), layer.biases().to_vec())
    }

    fn initial_params() -> Vec<f64> {
        W0.iter().flatten().copied().chain(B0.iter().copied()).collect()
    }

    fn assert_params(actual: (Vec<f64>, Vec<f64>), expected: &[f64]) {
        let all: Vec<f64> = actual.0.into_iter().chain(actual.1).collect();
        assert_eq!(all.len(), expected.len());
        for (a, e) in all.iter().zip(expected) {
            assert_relative_eq!(*a, *e, epsilon = 1e-12);
        }
    }

    fn fixture_delta_vector() -> Vec<f64> {
        let (dw, db) = fixture_deltas();
        dw.into_iter().chain(db).collect()
    }

    #[test]
    fn test_sgd_closed_form() {
        let result = run_three(&mut Optimizer::sgd(1.0), Regularization::default());
        assert_params(result, &[0.4, -0.65, -1.6, -2.05, -0.1, -1.0]);
    }

    #[test]
    fn test_momentum_with_constant_delta_matches_sgd() {
        let result = run_three(&mut Optimizer::momentum(1.0), Regularization::default());
        assert_params(result, &[0.4, -0.65, -1.6, -2.05, -0.1, -1.0]);
    }

    #[test]
    fn test_momentum_recurrence_with_varying_delta() {
        let mut arena = Arena::default();
        let mut layer = fixture_layer(&mut arena, Regularization::default());
        let mut optimizer = Optimizer::momentum(1.0);
        let beta = DEFAULT_MOMENTUM;

        let mut reference = initial_params();
        let mut moment = vec![0.0; 6];
        for (call, scale) in [1.0, 2.0, -1.0].iter().enumerate() {
            let (mut dw, mut db) = fixture_deltas();
            dw.iter_mut().chain(db.iter_mut()).for_each(|d| *d *= scale);
            let deltas: Vec<f64> = dw.iter().chain(db.iter()).copied().collect();
            optimizer
                .update_weights(1, &mut layer, &mut dw, &mut db, call as u64, 1, &mut arena)
                .unwrap();
            for k in 0..6 {
                moment[k] = if call == 0 {
                    deltas[k]
                } else {
                    beta * moment[k] + (1.0 - beta) * deltas[k]
                };
                reference[k] -= moment[k];
            }
        }
        assert_params((layer.flat_weights(), layer.biases().to_vec()), &reference);
    }

    #[test]
    fn test_nesterov_update_is_plain_sgd() {
        let result = run_three(&mut Optimizer::nesterov(1.0), Regularization::default());
        assert_params(result, &[0.4, -0.65, -1.6, -2.05, -0.1, -1.0]);
    }

    #[test]
    fn test_rms_prop_closed_form() {
        let (beta, eps) = (DEFAULT_RMS_DECAY, DEFAULT_EPSILON);
        let mut expected = initial_params();
        let deltas = fixture_delta_vector();
        let mut cache = vec![0.0; 6];
        for _ in 0..3 {
            for k in 0..6 {
                cache[k] = beta * cache[k] + (1.0 - beta) * deltas[k] * deltas[k];
                expected[k] -= deltas[k] / (cache[k].sqrt() + eps);
            }
        }
        let result = run_three(&mut Optimizer::rms_prop(1.0), Regularization::default());
        assert_params(result, &expected);
    }

    #[test]
    fn test_adam_closed_form() {
        let (b1, b2, eps) = (DEFAULT_BETA1, DEFAULT_BETA2, DEFAULT_EPSILON);
        let mut expected = initial_params();
        let deltas = fixture_delta_vector();
        let (mut m, mut v) = (vec![0.0; 6], vec![0.0; 6]);
        for epoch in 0..3 {
            let c1 = 1.0 - b1.powi(epoch + 1);
            let c2 = 1.0 - b2.powi(epoch + 1);
            for k in 0..6 {
                m[k] = b1 * m[k] + (1.0 - b1) * deltas[k];
                v[k] = b2 * v[k] + (1.0 - b2) * deltas[k] * deltas[k];
                expected[k] -= (m[k] / c1) / ((v[k] / c2).sqrt() + eps);
            }
        }
        let result = run_three(&mut Optimizer::adam(1.0), Regularization::default());
        assert_params(result, &expected);
        // zero deltas stay (almost) put, others move by about lr per call
        assert_relative_eq!(expected[0], 0.4, epsilon = 1e-6);
        assert_relative_eq!(expected[1], 0.1 - 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_batch_size_normalizes_deltas() {
        let mut arena = Arena::default();
        let mut layer = fixture_layer(&mut arena, Regularization::default());
        let mut optimizer = Optimizer::sgd(1.0);
        let (dw, db) = fixture_deltas();
        let mut dw4: Vec<f64> = dw.iter().map(|d| d * 4.0).collect();
        let mut db4: Vec<f64> = db.iter().map(|d| d * 4.0).collect();
        optimizer
            .update_weights(1, &mut layer, &mut dw4, &mut db4, 0, 4, &mut arena)
            .unwrap();
        assert_params(
            (layer.flat_weights(), layer.biases().to_vec()),
            &[0.4, -0.15, -0.6, -0.55, -0.1, 0.0],
        );
    }

    #[test]
    fn test_zero_regularization_matches_baseline() {
        let baseline = run_three(&mut Optimizer::adam(0.1), Regularization::default());
        let zero = run_three(&mut Optimizer::adam(0.1), Regularization::new(0.0, 0.0));
        assert_eq!(baseline, zero);
    }

    #[test]
    fn test_regularization_shrinks_weights() {
        let norm = |(w, _): &(Vec<f64>, Vec<f64>)| w.iter().map(|x| x.abs()).sum::<f64>();
        let mut arena = Arena::default();
        let mut previous = f64::INFINITY;
        for strength in [0.0, 0.05, 0.2] {
            let mut layer = fixture_layer(&mut arena, Regularization::new(strength, strength));
            let mut optimizer = Optimizer::sgd(0.1);
            for epoch in 0..3 {
                let mut dw = vec![0.0; 4];
                let mut db = vec![0.0; 2];
                optimizer
                    .update_weights(1, &mut layer, &mut dw, &mut db, epoch, 1, &mut arena)
                    .unwrap();
            }
            let current = norm(&(layer.flat_weights(), layer.biases().to_vec()));
            assert!(current < previous || strength == 0.0);
            previous = current;
        }
    }

    #[test]
    fn test_l1_and_l2_terms() {
        let mut arena = Arena::default();
        let regularization = Regularization {
            l1_weights: 0.1,
            l2_weights: 0.5,
            l1_biases: 0.0,
            l2_biases: 0.0,
        };
        let mut layer = fixture_layer(&mut arena, regularization);
        let mut optimizer = Optimizer::sgd(1.0);
        let mut dw = vec![0.0; 4];
        let mut db = vec![0.0; 2];
        optimizer
            .update_weights(1, &mut layer, &mut dw, &mut db, 0, 1, &mut arena)
            .unwrap();
        // p - (sign(p) * 0.1 + 2 * p * 0.5) = -sign(p) * 0.1
        assert_params(
            (layer.flat_weights(), layer.biases().to_vec()),
            &[-0.1, -0.1, 0.1, -0.1, -0.1, 0.5],
        );
    }

    #[test]
    fn test_decay_recurrence() {
        for (decay, expected) in [(0.1, 0.5), (0.01, 1.0 / 1.1)] {
            let mut optimizer = Optimizer::sgd(1.0).with_decay(decay);
            for _ in 0..10 {
                optimizer.before_pass();
                optimizer.after_pass();
            }
            assert_relative_eq!(optimizer.learning_rate(), expected, epsilon = 1e-12);
        }
        assert_relative_eq!(1.0 / 1.1, 0.90909, epsilon = 1e-5);

        let mut constant = Optimizer::sgd(0.3);
        constant.after_pass();
        assert_eq!(constant.learning_rate(), 0.3);
    }

    #[test]
    fn test_step_gradient() {
        let mut arena = Arena::default();
        let mut optimizer = Optimizer::sgd(1.0);
        let mut gradient = [0.0; 2];
        optimizer
            .step(1, Activation::Sigmoid, &[0.0, 0.0], &[0.5, 0.5], &[2.0, -4.0], &mut gradient, &mut arena)
            .unwrap();
        assert_eq!(gradient, [0.5, -1.0]);
    }

    #[test]
    fn test_nesterov_step_looks_ahead() {
        let mut arena = Arena::default();
        let mut optimizer = Optimizer::nesterov(1.0);
        let relu = Activation::relu();
        let mut gradient = [0.0; 1];

        optimizer
            .step(1, relu, &[1.0], &[1.0], &[1.0], &mut gradient, &mut arena)
            .unwrap();
        assert_eq!(gradient, [1.0]);
        // momentum is now 0.1; a prime of -0.05 looks ahead to 0.05 > 0
        optimizer
            .step(1, relu, &[-0.05], &[0.0], &[1.0], &mut gradient, &mut arena)
            .unwrap();
        assert_eq!(gradient, [1.0]);
        assert!(!optimizer.has_stateless_step());

        let moments = optimizer.moments();
        assert_eq!(moments.len(), 1);
        assert_relative_eq!(moments[0].buffers[0][0], 0.9 * 0.1 + 0.1);
    }

    #[test]
    fn test_moment_snapshot_restore() {
        let mut optimizer = Optimizer::adam(0.1);
        let _ = run_three(&mut optimizer, Regularization::default());
        let snapshots = optimizer.moments();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].calls, 3);
        assert_eq!(snapshots[0].buffers.len(), 4);

        let mut arena = Arena::default();
        let layer = fixture_layer(&mut arena, Regularization::default());
        let mut restored = optimizer.fresh();
        restored.restore_moment(&snapshots[0], &layer, &mut arena).unwrap();
        assert_eq!(restored.moments(), snapshots);

        let mut truncated = snapshots[0].clone();
        truncated.buffers[0].pop();
        assert!(restored.restore_moment(&truncated, &layer, &mut arena).is_err());
    }

    #[test]
    fn test_validation_and_registry() {
        assert!(Optimizer::sgd(0.0).validate().is_err());
        assert!(Optimizer::sgd(0.1).with_decay(-1.0).validate().is_err());
        assert!(Optimizer::new(OptimizerKind::Momentum { beta: 1.5 }, 0.1).validate().is_err());
        assert!(Optimizer::adam(0.01).validate().is_ok());

        for key in ["sgd", "momentum", "nesterov", "rmsProp", "adam"] {
            assert_eq!(key.parse::<OptimizerKind>().unwrap().name(), key);
        }
        assert!("adagrad".parse::<OptimizerKind>().is_err());
        assert!(Optimizer::adam(0.01).description().starts_with("adam (lr=0.01"));
    }
}
