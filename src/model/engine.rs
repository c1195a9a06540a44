//! Training engine shared by every model topology.
//!
//! The engine owns everything a model needs besides its layers: the arena,
//! the optimizer, the loss, the epoch counter, the random stream and the
//! per-layer scratch caches. Topologies hand it their layers through
//! [`LayerStack`].
//!
//! Per-sample deltas are reduced pairwise: each sample gets its own zeroed
//! [`DeltaFrame`] tagged with its position in the batch, and two frames are
//! merged only when they are the two aligned halves of a power-of-two block
//! (a binary counter over positions). The summation tree therefore depends
//! only on sample positions. A batch split into contiguous parts of any size,
//! each reduced from its starting position and handed over as unfolded
//! blocks, adds up bit for bit like the whole batch once the blocks are
//! pushed through one reducer in order.

use std::time::Instant;

use log::{debug, info};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Evaluation, LayerStack, ModelConfig, PassReport, Snapshot, TrainOptions, TrainReport};
use crate::error::{Error, Result};
use crate::kernels;
use crate::layers::Dense;
use crate::losses::Loss;
use crate::memory::{Arena, Slice};
use crate::optimizers::Optimizer;

// === WIRE TYPES ===

/// Owned copy of one layer's weights (row-major) and biases, or of their deltas.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerParameters {
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl LayerParameters {
    pub(crate) fn of(layer: &Dense) -> Self {
        Self {
            weights: layer.flat_weights(),
            biases: layer.biases().to_vec(),
        }
    }
}

/// Summed deltas of an aligned power-of-two run of samples.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeltaBlock {
    /// Batch position of the first sample
    pub start: usize,
    pub samples: usize,
    /// One entry per layer; the input layer's entry is empty
    pub layers: Vec<LayerParameters>,
}

/// Partially reduced deltas of a contiguous run of samples.
///
/// `blocks` are the pending blocks of the run, oldest first. They are left
/// unfolded so a receiver can continue the reduction across runs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchDeltas {
    pub samples: usize,
    /// Sum of per-sample losses
    pub loss: f64,
    pub blocks: Vec<DeltaBlock>,
}

// === DELTA FRAMES ===

pub(crate) struct LayerDelta {
    pub(crate) weights: Slice,
    pub(crate) biases: Slice,
}

/// Arena-backed delta accumulators for every layer.
pub(crate) struct DeltaFrame {
    start: usize,
    samples: usize,
    layers: Vec<Option<LayerDelta>>,
}

impl DeltaFrame {
    /// Zeroed frame for the sample at `position`.
    pub(crate) fn zeroed<S: LayerStack + ?Sized>(arena: &mut Arena, stack: &S, position: usize) -> Self {
        let layers = (0..stack.layer_count())
            .map(|i| {
                let layer = stack.layer(i);
                (i > 0).then(|| LayerDelta {
                    weights: arena.alloc(layer.size() * layer.prev_size()),
                    biases: arena.alloc(layer.size()),
                })
            })
            .collect();
        Self {
            start: position,
            samples: 1,
            layers,
        }
    }

    pub(crate) fn from_wire<S: LayerStack + ?Sized>(
        arena: &mut Arena,
        stack: &S,
        block: &DeltaBlock,
    ) -> Result<Self> {
        if !block.samples.is_power_of_two() || block.start % block.samples != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "delta block of {} samples at {} is not an aligned power-of-two block",
                block.samples, block.start
            )));
        }
        Error::check_len("delta layers", stack.layer_count(), block.layers.len())?;
        for (i, data) in block.layers.iter().enumerate().skip(1) {
            let layer = stack.layer(i);
            Error::check_len("delta weights", layer.size() * layer.prev_size(), data.weights.len())?;
            Error::check_len("delta biases", layer.size(), data.biases.len())?;
        }
        let layers = block
            .layers
            .iter()
            .enumerate()
            .map(|(i, data)| {
                (i > 0).then(|| LayerDelta {
                    weights: arena.alloc_from(&data.weights),
                    biases: arena.alloc_from(&data.biases),
                })
            })
            .collect();
        Ok(Self {
            start: block.start,
            samples: block.samples,
            layers,
        })
    }

    pub(crate) fn to_wire(&self) -> DeltaBlock {
        DeltaBlock {
            start: self.start,
            samples: self.samples,
            layers: self
                .layers
                .iter()
                .map(|delta| {
                    delta
                        .as_ref()
                        .map(|d| LayerParameters {
                            weights: d.weights.to_vec(),
                            biases: d.biases.to_vec(),
                        })
                        .unwrap_or_default()
                })
                .collect(),
        }
    }

    fn layer_mut(&mut self, index: usize) -> Result<&mut LayerDelta> {
        let len = self.layers.len();
        self.layers
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::DimensionMismatch {
                context: "delta frame layer",
                expected: index + 1,
                actual: len,
            })
    }

    /// Whether `next` is the right half of the aligned block whose left half
    /// is `self`.
    fn pairs_with(&self, next: &DeltaFrame) -> bool {
        self.samples == next.samples
            && self.start + self.samples == next.start
            && self.start % (2 * self.samples) == 0
    }

    /// `self += other`, covering the union of both sample runs.
    fn merge(&mut self, other: &DeltaFrame) -> Result<()> {
        Error::check_len("delta frame merge", self.layers.len(), other.layers.len())?;
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            if let (Some(mine), Some(theirs)) = (mine.as_mut(), theirs.as_ref()) {
                kernels::add_into(&mut mine.weights, &theirs.weights)?;
                kernels::add_into(&mut mine.biases, &theirs.biases)?;
            }
        }
        self.samples += other.samples;
        Ok(())
    }

    /// Return the buffers to the arena, newest first.
    pub(crate) fn release(self, arena: &mut Arena) -> Result<()> {
        for delta in self.layers.into_iter().rev().flatten() {
            arena.free(delta.biases)?;
            arena.free(delta.weights)?;
        }
        Ok(())
    }
}

/// Binary-counter reduction of delta frames over batch positions.
#[derive(Default)]
pub(crate) struct DeltaReducer {
    pending: Vec<DeltaFrame>,
    samples: usize,
}

impl DeltaReducer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Samples pushed so far.
    pub(crate) fn samples(&self) -> usize {
        self.samples
    }

    /// Push the frame of the next sample run, merging it with its aligned
    /// left sibling as long as one is pending.
    pub(crate) fn push(&mut self, mut frame: DeltaFrame, arena: &mut Arena) -> Result<()> {
        self.samples += frame.samples;
        loop {
            match self.pending.pop() {
                Some(mut top) if top.pairs_with(&frame) => {
                    top.merge(&frame)?;
                    frame.release(arena)?;
                    frame = top;
                }
                Some(top) => {
                    self.pending.push(top);
                    break;
                }
                None => break,
            }
        }
        self.pending.push(frame);
        Ok(())
    }

    /// Fold the remaining frames, oldest on the left.
    pub(crate) fn finish(mut self, arena: &mut Arena) -> Result<Option<DeltaFrame>> {
        let Some(mut total) = self.pending.pop() else {
            return Ok(None);
        };
        while let Some(mut below) = self.pending.pop() {
            below.merge(&total)?;
            total.release(arena)?;
            total = below;
        }
        Ok(Some(total))
    }

    /// Copy the pending blocks out, oldest first, and release them.
    pub(crate) fn into_wire(self, arena: &mut Arena) -> Result<Vec<DeltaBlock>> {
        let blocks = self.pending.iter().map(DeltaFrame::to_wire).collect();
        self.release(arena)?;
        Ok(blocks)
    }

    pub(crate) fn release(mut self, arena: &mut Arena) -> Result<()> {
        while let Some(frame) = self.pending.pop() {
            frame.release(arena)?;
        }
        Ok(())
    }
}

// === SHUFFLING ===

/// Per-call sample order, reshuffled before each pass when enabled.
pub(crate) struct BatchPlan {
    order: Vec<usize>,
    rng: ChaCha8Rng,
    shuffle: bool,
    batch_size: usize,
}

impl BatchPlan {
    pub(crate) fn new(samples: usize, options: &TrainOptions) -> Result<Self> {
        if samples == 0 {
            return Err(Error::EmptyBatch);
        }
        if options.batch_size == 0 {
            return Err(Error::InvalidConfiguration("batch_size must be at least 1".to_string()));
        }
        Ok(Self {
            order: (0..samples).collect(),
            rng: ChaCha8Rng::seed_from_u64(options.seed),
            shuffle: options.shuffle,
            batch_size: options.batch_size,
        })
    }

    /// Sample indices of the next pass, chunked into mini-batches.
    pub(crate) fn next_pass(&mut self) -> std::slice::Chunks<'_, usize> {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.order.chunks(self.batch_size)
    }
}

/// Check sample counts and widths against the stack's input and output sizes.
pub(crate) fn validate_samples<S, I, E>(stack: &S, inputs: &[I], expecteds: &[E]) -> Result<()>
where
    S: LayerStack + ?Sized,
    I: AsRef<[f64]>,
    E: AsRef<[f64]>,
{
    Error::check_len("expected samples", inputs.len(), expecteds.len())?;
    if inputs.is_empty() {
        return Err(Error::EmptyBatch);
    }
    let input_size = stack.layer(0).size();
    let output_size = stack.layer(stack.layer_count() - 1).size();
    for (input, expected) in inputs.iter().zip(expecteds) {
        Error::check_len("input sample", input_size, input.as_ref().len())?;
        Error::check_len("expected sample", output_size, expected.as_ref().len())?;
    }
    Ok(())
}

/// Enforce softmax placement and its pairing with the loss.
pub(crate) fn validate_architecture<S: LayerStack + ?Sized>(stack: &S, loss: &Loss) -> Result<()> {
    let count = stack.layer_count();
    if count < 2 {
        return Err(Error::InvalidArchitecture(format!(
            "a model needs an input layer and at least one more layer, found {}",
            count
        )));
    }
    for i in 0..count - 1 {
        if stack.layer(i).activation().is_softmax() {
            return Err(Error::InvalidArchitecture(format!(
                "softmax is only allowed on the last layer, found it on layer {} of {}",
                i, count
            )));
        }
    }
    loss.validate_output(stack.layer(count - 1).activation())
}

// === ENGINE ===

struct LayerCache {
    activation: Slice,
    error: Slice,
    gradient: Slice,
    mask: Option<Slice>,
    /// Activation before masking, kept for the derivative
    unmasked: Option<Slice>,
}

pub(crate) struct ModelCore {
    pub(crate) config: ModelConfig,
    pub(crate) arena: Arena,
    pub(crate) optimizer: Optimizer,
    pub(crate) loss: Loss,
    pub(crate) epoch: u64,
    pub(crate) rng: ChaCha8Rng,
    caches: Vec<LayerCache>,
}

impl ModelCore {
    pub(crate) fn new(optimizer: Optimizer, loss: Loss, config: ModelConfig) -> Result<Self> {
        Ok(Self {
            arena: Arena::new(config.arena)?,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            optimizer,
            loss,
            epoch: 0,
            caches: Vec::new(),
        })
    }

    pub(crate) fn is_compiled(&self) -> bool {
        !self.caches.is_empty()
    }

    pub(crate) fn cached_layers(&self) -> usize {
        self.caches.len()
    }

    fn require_compiled(&self, operation: &'static str) -> Result<usize> {
        if self.caches.is_empty() {
            Err(Error::NotCompiled(operation))
        } else {
            Ok(self.caches.len())
        }
    }

    /// Validate the architecture, allocate per-layer caches and optimizer
    /// slots. Layers must already be built.
    pub(crate) fn compile<S: LayerStack + ?Sized>(&mut self, stack: &S) -> Result<()> {
        validate_architecture(stack, &self.loss)?;
        self.optimizer.validate()?;
        if let Some(unbuilt) = (0..stack.layer_count()).find(|&i| !stack.layer(i).is_built()) {
            return Err(Error::InvalidArchitecture(format!("layer {} is not built", unbuilt)));
        }

        self.release_caches()?;
        let count = stack.layer_count();
        let mut caches = Vec::with_capacity(count);
        for i in 0..count {
            let layer = stack.layer(i);
            let masked = stack.allows_dropout(i) && layer.dropout() > 0.0;
            caches.push(LayerCache {
                activation: self.arena.alloc(layer.size()),
                error: self.arena.alloc(layer.size()),
                gradient: self.arena.alloc(layer.size()),
                mask: masked.then(|| self.arena.alloc(layer.size())),
                unmasked: masked.then(|| self.arena.alloc(layer.size())),
            });
        }
        self.caches = caches;
        for i in 1..count {
            self.optimizer.prepare(i, stack.layer(i), &mut self.arena);
        }
        debug!(
            "compiled {} layers, optimizer {}, loss {}",
            count,
            self.optimizer.description(),
            self.loss
        );
        Ok(())
    }

    fn release_caches(&mut self) -> Result<()> {
        while let Some(cache) = self.caches.pop() {
            if let Some(unmasked) = cache.unmasked {
                self.arena.free(unmasked)?;
            }
            if let Some(mask) = cache.mask {
                self.arena.free(mask)?;
            }
            self.arena.free(cache.gradient)?;
            self.arena.free(cache.error)?;
            self.arena.free(cache.activation)?;
        }
        Ok(())
    }

    // === FORWARD ===

    pub(crate) fn forward<S: LayerStack + ?Sized>(
        &mut self,
        stack: &mut S,
        input: &[f64],
        training: bool,
    ) -> Result<()> {
        let count = self.require_compiled("compute")?;
        Error::check_len("model input", stack.layer(0).size(), input.len())?;
        self.caches[0].activation.copy_from_slice(input);

        for i in 1..count {
            let (head, tail) = self.caches.split_at_mut(i);
            let previous = &head[i - 1];
            let current = &mut tail[0];

            let layer = stack.layer_mut(i);
            let activation = layer.activation();
            let dropout = layer.dropout();
            let prime = layer.step(&previous.activation)?;
            activation.value_into(prime, &mut current.activation)?;

            if let (true, Some(mask), Some(unmasked)) = (training, current.mask.as_mut(), current.unmasked.as_mut()) {
                unmasked.copy_from_slice(&current.activation);
                let keep = 1.0 / (1.0 - dropout);
                for m in mask.iter_mut() {
                    *m = if self.rng.gen::<f64>() < dropout { 0.0 } else { keep };
                }
                kernels::mul_into(&mut current.activation, mask)?;
            }
        }
        Ok(())
    }

    /// Activation of the last layer after the most recent forward pass.
    pub(crate) fn output(&self) -> &[f64] {
        self.caches.last().map(|c| c.activation.as_slice()).unwrap_or(&[])
    }

    pub(crate) fn compute<S: LayerStack + ?Sized>(&mut self, stack: &mut S, input: &[f64]) -> Result<Vec<f64>> {
        self.forward(stack, input, false)?;
        Ok(self.output().to_vec())
    }

    // === BACKWARD ===

    /// Backpropagate the last training forward pass into `frame`; returns
    /// the sample loss.
    fn backward<S: LayerStack + ?Sized>(
        &mut self,
        stack: &mut S,
        expected: &[f64],
        frame: &mut DeltaFrame,
    ) -> Result<f64> {
        let count = self.caches.len();
        let last = count - 1;
        let sample_loss = {
            let cache = &mut self.caches[last];
            self.loss
                .calculate_error_into(&cache.activation, expected, &mut cache.error)?;
            self.loss.sample_loss(&cache.activation, expected)?
        };

        for i in (1..count).rev() {
            let (head, tail) = self.caches.split_at_mut(i);
            let previous = &mut head[i - 1];
            let current = &mut tail[0];

            if let Some(mask) = &current.mask {
                kernels::mul_into(&mut current.error, mask)?;
            }
            let layer = stack.layer(i);
            let value = current.unmasked.as_ref().unwrap_or(&current.activation);
            self.optimizer.step(
                i,
                layer.activation(),
                layer.output(),
                value,
                &current.error,
                &mut current.gradient,
                &mut self.arena,
            )?;
            if stack.is_trainable(i) {
                let delta = frame.layer_mut(i)?;
                layer.accumulate(
                    &current.gradient,
                    &previous.activation,
                    &mut delta.weights,
                    &mut delta.biases,
                )?;
            }
            if i > 1 {
                let propagated = stack.layer_mut(i).propagate(&current.gradient)?;
                previous.error.copy_from_slice(propagated);
            }
        }
        Ok(sample_loss)
    }

    /// Forward and backward every sample, numbering them from `offset`.
    /// Returns the reducer holding the pending blocks and the summed sample
    /// loss.
    fn reduce<S, I, E>(
        &mut self,
        stack: &mut S,
        offset: usize,
        inputs: &[I],
        expecteds: &[E],
    ) -> Result<(DeltaReducer, f64)>
    where
        S: LayerStack + ?Sized,
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.require_compiled("train")?;
        validate_samples(stack, inputs, expecteds)?;

        let mut reducer = DeltaReducer::new();
        let mut loss = 0.0;
        for (position, (input, expected)) in (offset..).zip(inputs.iter().zip(expecteds)) {
            let mut frame = DeltaFrame::zeroed(&mut self.arena, stack, position);
            let sample = self
                .forward(stack, input.as_ref(), true)
                .and_then(|_| self.backward(stack, expected.as_ref(), &mut frame));
            match sample {
                Ok(sample_loss) => {
                    loss += sample_loss;
                    reducer.push(frame, &mut self.arena)?;
                }
                Err(err) => {
                    frame.release(&mut self.arena)?;
                    reducer.release(&mut self.arena)?;
                    return Err(err);
                }
            }
        }
        Ok((reducer, loss))
    }

    /// Reduce every sample into a single frame; returns it with the summed
    /// sample loss.
    pub(crate) fn accumulate<S, I, E>(
        &mut self,
        stack: &mut S,
        inputs: &[I],
        expecteds: &[E],
    ) -> Result<(DeltaFrame, f64)>
    where
        S: LayerStack + ?Sized,
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        let (reducer, loss) = self.reduce(stack, 0, inputs, expecteds)?;
        let frame = reducer.finish(&mut self.arena)?.ok_or(Error::EmptyBatch)?;
        Ok((frame, loss))
    }

    /// Reduce samples numbered from `offset` and hand out the pending blocks
    /// unfolded, for [`ModelCore::apply_deltas`] to finish.
    pub(crate) fn accumulate_blocks<S, I, E>(
        &mut self,
        stack: &mut S,
        offset: usize,
        inputs: &[I],
        expecteds: &[E],
    ) -> Result<BatchDeltas>
    where
        S: LayerStack + ?Sized,
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        let (reducer, loss) = self.reduce(stack, offset, inputs, expecteds)?;
        let samples = reducer.samples();
        Ok(BatchDeltas {
            samples,
            loss,
            blocks: reducer.into_wire(&mut self.arena)?,
        })
    }

    /// Apply reduced deltas to every trainable layer and advance the epoch.
    pub(crate) fn apply<S: LayerStack + ?Sized>(
        &mut self,
        stack: &mut S,
        mut frame: DeltaFrame,
        batch_size: usize,
    ) -> Result<()> {
        let mut result = Ok(());
        for i in 1..stack.layer_count() {
            if !stack.is_trainable(i) {
                continue;
            }
            result = frame.layer_mut(i).and_then(|delta| {
                self.optimizer.update_weights(
                    i,
                    stack.layer_mut(i),
                    &mut delta.weights,
                    &mut delta.biases,
                    self.epoch,
                    batch_size,
                    &mut self.arena,
                )
            });
            if result.is_err() {
                break;
            }
        }
        frame.release(&mut self.arena)?;
        result?;
        self.epoch += 1;
        Ok(())
    }

    /// One mini-batch: accumulate, then update once. Returns the summed loss.
    pub(crate) fn train_batch<S, I, E>(&mut self, stack: &mut S, inputs: &[I], expecteds: &[E]) -> Result<f64>
    where
        S: LayerStack + ?Sized,
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        let (frame, loss) = self.accumulate(stack, inputs, expecteds)?;
        self.apply(stack, frame, inputs.len())?;
        Ok(loss)
    }

    /// Push the blocks of every part, in sample order, through one reducer
    /// and update once.
    pub(crate) fn apply_deltas<S: LayerStack + ?Sized>(
        &mut self,
        stack: &mut S,
        deltas: &[BatchDeltas],
    ) -> Result<()> {
        self.require_compiled("train")?;
        let mut reducer = DeltaReducer::new();
        for block in deltas.iter().flat_map(|part| &part.blocks) {
            let frame = match DeltaFrame::from_wire(&mut self.arena, stack, block) {
                Ok(frame) => frame,
                Err(err) => {
                    reducer.release(&mut self.arena)?;
                    return Err(err);
                }
            };
            reducer.push(frame, &mut self.arena)?;
        }
        let samples = reducer.samples();
        let frame = reducer.finish(&mut self.arena)?.ok_or(Error::EmptyBatch)?;
        self.apply(stack, frame, samples)
    }

    pub(crate) fn train<S, I, E>(
        &mut self,
        stack: &mut S,
        inputs: &[I],
        expecteds: &[E],
        options: &TrainOptions,
    ) -> Result<TrainReport>
    where
        S: LayerStack + ?Sized,
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.require_compiled("train")?;
        validate_samples(stack, inputs, expecteds)?;
        let mut plan = BatchPlan::new(inputs.len(), options)?;
        info!(
            "training on {} samples: {} passes, batch size {}, {}",
            inputs.len(),
            options.epochs,
            options.batch_size,
            self.optimizer.description()
        );

        let mut report = TrainReport::default();
        for pass in 0..options.epochs {
            let started = Instant::now();
            let learning_rate = self.optimizer.learning_rate();
            self.optimizer.before_pass();

            let mut loss = 0.0;
            for batch in plan.next_pass() {
                let batch_inputs: Vec<&[f64]> = batch.iter().map(|&i| inputs[i].as_ref()).collect();
                let batch_expected: Vec<&[f64]> = batch.iter().map(|&i| expecteds[i].as_ref()).collect();
                loss += self.train_batch(stack, &batch_inputs, &batch_expected)?;
                report.steps += 1;
            }

            self.optimizer.after_pass();
            let pass_report = PassReport {
                pass,
                loss: loss / inputs.len() as f64,
                learning_rate,
                elapsed: started.elapsed(),
            };
            debug!(
                "pass {}: loss {:.6}, lr {}, {:?}",
                pass, pass_report.loss, learning_rate, pass_report.elapsed
            );
            report.passes.push(pass_report);
        }
        Ok(report)
    }

    pub(crate) fn evaluate<S, I, E>(&mut self, stack: &mut S, inputs: &[I], expecteds: &[E]) -> Result<Evaluation>
    where
        S: LayerStack + ?Sized,
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.require_compiled("evaluate")?;
        validate_samples(stack, inputs, expecteds)?;
        let predictions = inputs
            .iter()
            .map(|input| self.compute(stack, input.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Evaluation {
            loss: self.loss.loss(&predictions, expecteds)?,
            accuracy: self.loss.accuracy(&predictions, expecteds)?,
        })
    }

    pub(crate) fn snapshot<S: LayerStack + ?Sized>(&self, stack: &S) -> Snapshot {
        Snapshot::from_layers((0..stack.layer_count()).map(|i| stack.layer(i)))
    }

    pub(crate) fn parameters<S: LayerStack + ?Sized>(&self, stack: &S) -> Vec<LayerParameters> {
        (0..stack.layer_count())
            .map(|i| LayerParameters::of(stack.layer(i)))
            .collect()
    }

    pub(crate) fn load_parameters<S: LayerStack + ?Sized>(
        &mut self,
        stack: &mut S,
        parameters: &[LayerParameters],
    ) -> Result<()> {
        Error::check_len("parameter layers", stack.layer_count(), parameters.len())?;
        for (i, params) in parameters.iter().enumerate() {
            let layer = stack.layer(i);
            Error::check_len("parameter weights", layer.size() * layer.prev_size(), params.weights.len())?;
            if i > 0 {
                Error::check_len("parameter biases", layer.size(), params.biases.len())?;
            }
        }
        for (i, params) in parameters.iter().enumerate() {
            stack.layer_mut(i).load_parameters(&params.weights, &params.biases)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::Activation;

    fn stack(arena: &mut Arena) -> Vec<Dense> {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut layers = vec![Dense::input(2), Dense::new(3), Dense::new(1)];
        let mut prev = 0;
        for (i, layer) in layers.iter_mut().enumerate() {
            layer.build(i, prev, arena, &mut rng, false).unwrap();
            prev = layer.size();
        }
        layers
    }

    fn frame_with(arena: &mut Arena, layers: &Vec<Dense>, position: usize, value: f64) -> DeltaFrame {
        let mut frame = DeltaFrame::zeroed(arena, layers, position);
        for delta in frame.layers.iter_mut().flatten() {
            delta.weights.fill(value);
            delta.biases.fill(value);
        }
        frame
    }

    fn pending(reducer: &DeltaReducer) -> Vec<(usize, usize)> {
        reducer.pending.iter().map(|f| (f.start, f.samples)).collect()
    }

    #[test]
    fn test_reducer_merges_like_binary_counter() {
        let mut arena = Arena::default();
        let layers = stack(&mut arena);
        let baseline = arena.stats().entries;

        let mut reducer = DeltaReducer::new();
        for (position, value) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            let frame = frame_with(&mut arena, &layers, position, value);
            reducer.push(frame, &mut arena).unwrap();
        }
        assert_eq!(pending(&reducer), vec![(0, 2), (2, 1)]);

        let total = reducer.finish(&mut arena).unwrap().unwrap();
        assert_eq!(total.samples, 3);
        assert_eq!(total.to_wire().layers[1].weights, vec![6.0; 6]);
        total.release(&mut arena).unwrap();
        assert_eq!(arena.stats().entries, baseline);
    }

    #[test]
    fn test_reducer_only_merges_aligned_siblings() {
        let mut arena = Arena::default();
        let layers = stack(&mut arena);

        let mut reducer = DeltaReducer::new();
        for position in 3..9 {
            let frame = frame_with(&mut arena, &layers, position, 1.0);
            reducer.push(frame, &mut arena).unwrap();
        }
        // 3 has no left sibling in the run, 4..8 closes a block of four
        assert_eq!(pending(&reducer), vec![(3, 1), (4, 4), (8, 1)]);
        assert_eq!(reducer.samples(), 6);
        reducer.release(&mut arena).unwrap();
    }

    #[test]
    fn test_split_reduction_matches_whole_batch() {
        let mut arena = Arena::default();
        let layers = stack(&mut arena);
        let values: Vec<f64> = (0..24).map(|i| 0.1 * (i + 1) as f64).collect();

        let mut whole = DeltaReducer::new();
        for (position, &value) in values.iter().enumerate() {
            let frame = frame_with(&mut arena, &layers, position, value);
            whole.push(frame, &mut arena).unwrap();
        }
        let expected = whole.finish(&mut arena).unwrap().unwrap();

        let mut master = DeltaReducer::new();
        for part in 0..4 {
            let mut worker = DeltaReducer::new();
            for position in part * 6..(part + 1) * 6 {
                let frame = frame_with(&mut arena, &layers, position, values[position]);
                worker.push(frame, &mut arena).unwrap();
            }
            for block in worker.into_wire(&mut arena).unwrap() {
                let frame = DeltaFrame::from_wire(&mut arena, &layers, &block).unwrap();
                master.push(frame, &mut arena).unwrap();
            }
        }
        let total = master.finish(&mut arena).unwrap().unwrap();

        assert_eq!(total.samples, 24);
        assert_eq!(total.to_wire(), expected.to_wire());
    }

    #[test]
    fn test_wire_round_trip_and_validation() {
        let mut arena = Arena::default();
        let layers = stack(&mut arena);
        let frame = frame_with(&mut arena, &layers, 5, 0.5);
        let wire = frame.to_wire();
        assert_eq!(wire.layers.len(), 3);
        assert!(wire.layers[0].weights.is_empty());
        assert_eq!((wire.start, wire.samples), (5, 1));

        let copy = DeltaFrame::from_wire(&mut arena, &layers, &wire).unwrap();
        assert_eq!(copy.to_wire(), wire);

        let mut broken = wire.clone();
        broken.layers[2].biases.push(0.0);
        assert!(DeltaFrame::from_wire(&mut arena, &layers, &broken).is_err());

        let misaligned = DeltaBlock {
            start: 2,
            samples: 4,
            ..wire
        };
        assert!(DeltaFrame::from_wire(&mut arena, &layers, &misaligned).is_err());
    }

    #[test]
    fn test_missing_frame_layer_is_reported() {
        let mut arena = Arena::default();
        let layers = stack(&mut arena);
        let mut frame = DeltaFrame::zeroed(&mut arena, &layers, 0);
        assert!(frame.layer_mut(1).is_ok());
        assert!(matches!(
            frame.layer_mut(0),
            Err(Error::DimensionMismatch { actual: 3, .. })
        ));
        assert!(matches!(
            frame.layer_mut(7),
            Err(Error::DimensionMismatch { expected: 8, actual: 3, .. })
        ));
    }

    #[test]
    fn test_architecture_validation() {
        let mut arena = Arena::default();
        let mut layers = stack(&mut arena);
        assert!(validate_architecture(&layers, &Loss::mse()).is_ok());
        assert!(validate_architecture(&layers, &Loss::CategoricalCrossEntropy).is_err());

        layers.truncate(1);
        assert!(validate_architecture(&layers, &Loss::mse()).is_err());

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut middle = Dense::new(2).with_activation(Activation::Softmax);
        middle.build(1, 2, &mut arena, &mut rng, false).unwrap();
        let mut last = Dense::new(2).with_activation(Activation::Softmax);
        last.build(2, 2, &mut arena, &mut rng, false).unwrap();
        layers.push(middle);
        layers.push(last);
        let err = validate_architecture(&layers, &Loss::CategoricalCrossEntropy).unwrap_err();
        assert!(err.to_string().contains("only allowed on the last layer"));
    }

    #[test]
    fn test_batch_plan_is_seeded() {
        let options = TrainOptions::new(1, 2).with_seed(9);
        let mut a = BatchPlan::new(10, &options).unwrap();
        let mut b = BatchPlan::new(10, &options).unwrap();
        let first: Vec<Vec<usize>> = a.next_pass().map(|c| c.to_vec()).collect();
        let second: Vec<Vec<usize>> = b.next_pass().map(|c| c.to_vec()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);

        let mut ordered = BatchPlan::new(3, &options.with_shuffle(false)).unwrap();
        let batches: Vec<Vec<usize>> = ordered.next_pass().map(|c| c.to_vec()).collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2]]);

        assert!(BatchPlan::new(0, &options).is_err());
        assert!(BatchPlan::new(3, &TrainOptions::new(1, 0)).is_err());
    }
}
