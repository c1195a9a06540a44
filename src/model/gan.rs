//! Generator/discriminator pair trained by adversarial alternation.
//!
//! The model is a [`ChainModel`] of `(generator, discriminator)` whose
//! discriminator is frozen. Every mini-batch runs three updates:
//!
//! 1. the discriminator on real samples labeled `1`
//! 2. the discriminator on generated samples labeled `0`
//! 3. the chain on fresh noise labeled `1`; the error flows through the
//!    frozen discriminator into the generator, whose weights are updated
//!
//! The discriminator trains with its own optimizer and loss, the generator
//! with the chain's optimizer and binary cross-entropy.

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;
use rand_distr::StandardNormal;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::engine::BatchPlan;
use super::{ChainModel, ModelConfig, Sequential, Snapshot, TrainOptions};
use crate::error::{Error, Result};
use crate::losses::Loss;
use crate::optimizers::Optimizer;

const GENERATOR: usize = 0;
const DISCRIMINATOR: usize = 1;

/// Losses of one adversarial pass, averaged per sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct GanPassReport {
    pub pass: usize,
    /// Mean over real and generated samples
    pub discriminator_loss: f64,
    pub generator_loss: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GanReport {
    pub passes: Vec<GanPassReport>,
    /// Mini-batches processed
    pub steps: u64,
}

pub struct GenerativeAdversarialModel {
    pub(crate) chain: ChainModel,
}

impl GenerativeAdversarialModel {
    /// Pair a generator with a discriminator producing a single score.
    ///
    /// `optimizer` drives generator updates through the chain; the
    /// discriminator keeps its own.
    pub fn new(
        generator: Sequential,
        discriminator: Sequential,
        optimizer: Optimizer,
        config: ModelConfig,
    ) -> Result<Self> {
        if discriminator.output_size() != 1 {
            return Err(Error::InvalidArchitecture(format!(
                "the discriminator must output a single score, found {} outputs",
                discriminator.output_size()
            )));
        }
        let mut chain = ChainModel::new(
            vec![generator, discriminator],
            optimizer,
            Loss::BinaryCrossEntropy,
            config,
        )?;
        chain.set_trainable(DISCRIMINATOR, false)?;
        Ok(Self { chain })
    }

    /// Noise vector matching the generator input, drawn from `N(0, 1)`.
    pub fn noise(&mut self) -> Vec<f64> {
        let size = self.noise_size();
        let rng = &mut self.chain.core.rng;
        (0..size).map(|_| rng.sample(StandardNormal)).collect()
    }

    fn noise_batch(&mut self, count: usize) -> Vec<Vec<f64>> {
        (0..count).map(|_| self.noise()).collect()
    }

    /// One generated sample from fresh noise.
    pub fn generate(&mut self) -> Result<Vec<f64>> {
        let noise = self.noise();
        self.generate_from(&noise)
    }

    pub fn generate_from(&mut self, noise: &[f64]) -> Result<Vec<f64>> {
        self.generator_mut().compute(noise)
    }

    /// Discriminator score of `sample`.
    pub fn discriminate(&mut self, sample: &[f64]) -> Result<f64> {
        let score = self.discriminator_mut().compute(sample)?;
        Ok(score[0])
    }

    // === TRAINING ===

    /// Steps 1 and 2: the discriminator on `real` (labeled 1), then on as
    /// many generated samples (labeled 0). Returns the summed loss.
    pub fn train_discriminator_batch<R: AsRef<[f64]>>(&mut self, real: &[R]) -> Result<f64> {
        let fakes = self
            .noise_batch(real.len())
            .iter()
            .map(|noise| self.generate_from(noise))
            .collect::<Result<Vec<_>>>()?;

        let discriminator = self.discriminator_mut();
        let real_loss = discriminator.train_batch(real, &vec![[1.0]; real.len()])?;
        let fake_loss = discriminator.train_batch(&fakes, &vec![[0.0]; fakes.len()])?;
        Ok(real_loss + fake_loss)
    }

    /// Step 3: the chain on `count` noise samples labeled 1. Returns the
    /// summed loss.
    pub fn train_generator_batch(&mut self, count: usize) -> Result<f64> {
        let noise = self.noise_batch(count);
        self.chain.train_batch(&noise, &vec![[1.0]; count])
    }

    /// Adversarial training over `real`, mini-batch by mini-batch.
    pub fn train<R: AsRef<[f64]>>(&mut self, real: &[R], options: &TrainOptions) -> Result<GanReport> {
        let sample_size = self.sample_size();
        for sample in real {
            Error::check_len("real sample", sample_size, sample.as_ref().len())?;
        }
        let mut plan = BatchPlan::new(real.len(), options)?;
        info!(
            "adversarial training on {} samples: {} passes, batch size {}",
            real.len(),
            options.epochs,
            options.batch_size
        );

        let mut report = GanReport::default();
        for pass in 0..options.epochs {
            let started = Instant::now();
            self.discriminator_mut().before_pass();
            self.chain.before_pass();

            let mut discriminator_loss = 0.0;
            let mut generator_loss = 0.0;
            for batch in plan.next_pass() {
                let samples: Vec<&[f64]> = batch.iter().map(|&i| real[i].as_ref()).collect();
                discriminator_loss += self.train_discriminator_batch(&samples)?;
                generator_loss += self.train_generator_batch(samples.len())?;
                report.steps += 1;
            }

            self.discriminator_mut().after_pass();
            self.chain.after_pass();
            let pass_report = GanPassReport {
                pass,
                discriminator_loss: discriminator_loss / (2 * real.len()) as f64,
                generator_loss: generator_loss / real.len() as f64,
                elapsed: started.elapsed(),
            };
            debug!(
                "pass {}: discriminator {:.6}, generator {:.6}, {:?}",
                pass, pass_report.discriminator_loss, pass_report.generator_loss, pass_report.elapsed
            );
            report.passes.push(pass_report);
        }
        Ok(report)
    }

    // === ACCESSORS ===

    pub fn generator(&self) -> &Sequential {
        &self.chain.models()[GENERATOR]
    }

    pub fn discriminator(&self) -> &Sequential {
        &self.chain.models()[DISCRIMINATOR]
    }

    pub fn generator_mut(&mut self) -> &mut Sequential {
        &mut self.chain.stack.models[GENERATOR]
    }

    pub fn discriminator_mut(&mut self) -> &mut Sequential {
        &mut self.chain.stack.models[DISCRIMINATOR]
    }

    /// The generator-then-discriminator chain used for generator updates.
    pub fn chain(&self) -> &ChainModel {
        &self.chain
    }

    pub fn noise_size(&self) -> usize {
        self.generator().input_size()
    }

    pub fn sample_size(&self) -> usize {
        self.generator().output_size()
    }

    /// Snapshots of generator and discriminator.
    pub fn snapshot(&self) -> (Snapshot, Snapshot) {
        (self.generator().snapshot(), self.discriminator().snapshot())
    }
}

impl std::fmt::Debug for GenerativeAdversarialModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerativeAdversarialModel")
            .field("generator", self.generator())
            .field("discriminator", self.discriminator())
            .field("optimizer", self.chain.optimizer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::Activation;

    fn generator() -> Sequential {
        Sequential::builder()
            .input(2)
            .dense(4, Activation::Tanh)
            .dense(3, Activation::Linear)
            .optimizer(Optimizer::sgd(0.05))
            .loss(Loss::mse())
            .seed(1)
            .build()
            .unwrap()
    }

    fn discriminator(outputs: usize) -> Sequential {
        Sequential::builder()
            .input(3)
            .dense(4, Activation::Tanh)
            .dense(outputs, Activation::Sigmoid)
            .optimizer(Optimizer::sgd(0.05))
            .loss(Loss::BinaryCrossEntropy)
            .seed(2)
            .build()
            .unwrap()
    }

    fn gan() -> GenerativeAdversarialModel {
        GenerativeAdversarialModel::new(
            generator(),
            discriminator(1),
            Optimizer::sgd(0.05),
            ModelConfig::default().with_seed(7),
        )
        .unwrap()
    }

    #[test]
    fn test_discriminator_must_output_one_score() {
        let result = GenerativeAdversarialModel::new(
            generator(),
            discriminator(2),
            Optimizer::sgd(0.05),
            ModelConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArchitecture(_))));
    }

    #[test]
    fn test_generator_step_leaves_discriminator_untouched() {
        let mut gan = gan();
        let (generator_before, discriminator_before) = gan.snapshot();
        gan.train_generator_batch(4).unwrap();
        let (generator_after, discriminator_after) = gan.snapshot();

        assert_eq!(discriminator_after, discriminator_before);
        assert_ne!(generator_after.weights[2], generator_before.weights[2]);
    }

    #[test]
    fn test_discriminator_step_leaves_generator_untouched() {
        let mut gan = gan();
        let (generator_before, discriminator_before) = gan.snapshot();
        let real = vec![vec![0.5, 0.5, 0.5], vec![0.4, 0.6, 0.5]];
        let loss = gan.train_discriminator_batch(&real).unwrap();
        let (generator_after, discriminator_after) = gan.snapshot();

        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(generator_after, generator_before);
        assert_ne!(discriminator_after.weights[2], discriminator_before.weights[2]);
        assert_eq!(gan.discriminator().epoch(), 2);
    }

    #[test]
    fn test_training_reports_every_pass() {
        let mut gan = gan();
        let real: Vec<Vec<f64>> = (0..8).map(|i| vec![1.0, 0.1 * i as f64, -1.0]).collect();
        let report = gan.train(&real, &TrainOptions::new(3, 4)).unwrap();
        assert_eq!(report.passes.len(), 3);
        assert_eq!(report.steps, 6);
        assert!(report
            .passes
            .iter()
            .all(|p| p.discriminator_loss.is_finite() && p.generator_loss.is_finite()));
        assert_eq!(gan.chain().epoch(), 6);
        assert_eq!(gan.discriminator().epoch(), 12);

        assert_eq!(gan.generate().unwrap().len(), 3);
        let score = gan.discriminate(&real[0]).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_real_samples_are_validated() {
        let mut gan = gan();
        assert!(gan.train(&[vec![1.0, 2.0]], &TrainOptions::default()).is_err());
    }
}
