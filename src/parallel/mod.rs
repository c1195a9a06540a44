/**
 * @file src/parallel/mod.rs
 * @brief Data-parallel training over worker replicas
 *
 * [`ParallelTrainer`] keeps a master model and a fixed pool of P worker
 * threads, each owning a private replica. Per mini-batch of `B` samples:
 *
 * 1. the batch is split into contiguous sub-batches of `ceil(B / P)` samples
 * 2. every worker reduces the deltas of its sub-batch from the sub-batch's
 *    starting position and returns the pending blocks (`trainBatch`)
 * 3. the coordinator awaits all replies (sync barrier)
 * 4. the master pushes every block, in sample order, through one reducer
 *    and applies one update normalized by `B`
 * 5. the updated weights are broadcast to all workers (`syncWeights`)
 *
 * Blocks only merge with their aligned sibling, so the master builds the
 * same summation tree as serial training whatever `B` and P are. With no
 * dropout and an optimizer whose per-sample step is stateless (everything
 * but Nesterov), parallel and serial training produce bit-identical weights.
 *
 * Failures are not retried: an error in any worker fails the group before
 * the master is updated, leaving the weights of the last completed group.
 */

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::{debug, info, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::engine::{validate_samples, BatchPlan};
use crate::model::{BatchDeltas, ChainModel, LayerParameters, PassReport, Sequential, TrainOptions, TrainReport};
use crate::serialization::{ChainDescriptor, ModelDescriptor};

pub(crate) mod worker;

use worker::{Reply, Request, WorkerHandle};

// === CONFIGURATION ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParallelConfig {
    /// Number of worker replicas
    pub parallelism: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
        }
    }
}

impl ParallelConfig {
    pub fn new(parallelism: usize) -> Self {
        Self { parallelism }
    }
}

/// Requested parallelism against the cores of this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Capability {
    pub requested: usize,
    pub available: usize,
    /// More workers than cores: still correct, but slower than serial
    pub oversubscribed: bool,
}

impl Capability {
    fn detect(requested: usize) -> Self {
        let available = num_cpus::get();
        Self {
            requested,
            available,
            oversubscribed: requested > available,
        }
    }
}

// === REPLICAS ===

/// A model that can be replicated onto worker threads.
///
/// Replicas are rebuilt on their thread from a `Send` descriptor; only
/// parameters and deltas travel afterwards.
pub trait Replica: Sized {
    type Descriptor: Clone + Send + 'static;

    fn describe(&self) -> Self::Descriptor;
    /// Descriptor shipped to workers: replicas never update weights, so
    /// optimizer moments are left out.
    fn describe_replica(&self) -> Self::Descriptor;
    fn restore(descriptor: &Self::Descriptor) -> Result<Self>;
    fn compile(&mut self) -> Result<()>;

    fn check_samples<I, E>(&self, inputs: &[I], expecteds: &[E]) -> Result<()>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>;

    fn parameters(&self) -> Vec<LayerParameters>;
    fn load_parameters(&mut self, parameters: &[LayerParameters]) -> Result<()>;
    /// Deltas of the sub-batch starting at batch position `offset`.
    fn accumulate(&mut self, offset: usize, inputs: &[Vec<f64>], expecteds: &[Vec<f64>]) -> Result<BatchDeltas>;
    fn apply_deltas(&mut self, deltas: &[BatchDeltas]) -> Result<()>;
    fn compute(&mut self, input: &[f64]) -> Result<Vec<f64>>;
    fn learning_rate(&self) -> f64;
    fn before_pass(&mut self);
    fn after_pass(&mut self);
}

impl Replica for Sequential {
    type Descriptor = ModelDescriptor;

    fn describe(&self) -> ModelDescriptor {
        Sequential::describe(self)
    }

    fn describe_replica(&self) -> ModelDescriptor {
        Sequential::describe(self).without_moments()
    }

    fn restore(descriptor: &ModelDescriptor) -> Result<Self> {
        Sequential::from_descriptor(descriptor)
    }

    fn compile(&mut self) -> Result<()> {
        Sequential::compile(self)
    }

    fn check_samples<I, E>(&self, inputs: &[I], expecteds: &[E]) -> Result<()>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        validate_samples(&self.layers, inputs, expecteds)
    }

    fn parameters(&self) -> Vec<LayerParameters> {
        Sequential::parameters(self)
    }

    fn load_parameters(&mut self, parameters: &[LayerParameters]) -> Result<()> {
        Sequential::load_parameters(self, parameters)
    }

    fn accumulate(&mut self, offset: usize, inputs: &[Vec<f64>], expecteds: &[Vec<f64>]) -> Result<BatchDeltas> {
        Sequential::accumulate_from(self, offset, inputs, expecteds)
    }

    fn apply_deltas(&mut self, deltas: &[BatchDeltas]) -> Result<()> {
        Sequential::apply_deltas(self, deltas)
    }

    fn compute(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        Sequential::compute(self, input)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer().learning_rate()
    }

    fn before_pass(&mut self) {
        Sequential::before_pass(self)
    }

    fn after_pass(&mut self) {
        Sequential::after_pass(self)
    }
}

impl Replica for ChainModel {
    type Descriptor = ChainDescriptor;

    fn describe(&self) -> ChainDescriptor {
        ChainModel::describe(self)
    }

    fn describe_replica(&self) -> ChainDescriptor {
        ChainModel::describe(self).without_moments()
    }

    fn restore(descriptor: &ChainDescriptor) -> Result<Self> {
        ChainModel::from_descriptor(descriptor)
    }

    fn compile(&mut self) -> Result<()> {
        ChainModel::compile(self)
    }

    fn check_samples<I, E>(&self, inputs: &[I], expecteds: &[E]) -> Result<()>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        validate_samples(&self.stack, inputs, expecteds)
    }

    fn parameters(&self) -> Vec<LayerParameters> {
        ChainModel::parameters(self)
    }

    fn load_parameters(&mut self, parameters: &[LayerParameters]) -> Result<()> {
        ChainModel::load_parameters(self, parameters)
    }

    fn accumulate(&mut self, offset: usize, inputs: &[Vec<f64>], expecteds: &[Vec<f64>]) -> Result<BatchDeltas> {
        ChainModel::accumulate_from(self, offset, inputs, expecteds)
    }

    fn apply_deltas(&mut self, deltas: &[BatchDeltas]) -> Result<()> {
        ChainModel::apply_deltas(self, deltas)
    }

    fn compute(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        ChainModel::compute(self, input)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer().learning_rate()
    }

    fn before_pass(&mut self) {
        ChainModel::before_pass(self)
    }

    fn after_pass(&mut self) {
        ChainModel::after_pass(self)
    }
}

// === COORDINATOR ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrainerState {
    Created,
    Ready,
    Terminated,
}

/// Scatter-gather trainer over a pool of worker replicas.
pub struct ParallelTrainer<M: Replica + 'static> {
    master: M,
    config: ParallelConfig,
    capability: Capability,
    workers: Vec<WorkerHandle<M::Descriptor>>,
    state: TrainerState,
    next_worker: usize,
}

impl<M: Replica + 'static> ParallelTrainer<M> {
    /// Wrap `master`, compiling it if needed. Workers start in [`init`](Self::init).
    pub fn new(master: M, config: ParallelConfig) -> Result<Self> {
        if config.parallelism == 0 {
            return Err(Error::InvalidConfiguration("parallelism must be at least 1".to_string()));
        }
        let mut master = master;
        master.compile()?;

        let capability = Capability::detect(config.parallelism);
        if capability.oversubscribed {
            warn!(
                "parallelism {} exceeds the {} available cores",
                capability.requested, capability.available
            );
        }
        Ok(Self {
            master,
            config,
            capability,
            workers: Vec::new(),
            state: TrainerState::Created,
            next_worker: 0,
        })
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn parallelism(&self) -> usize {
        self.config.parallelism
    }

    pub fn master(&self) -> &M {
        &self.master
    }

    /// Stop the workers (if running) and hand back the trained master.
    pub async fn into_master(mut self) -> M {
        if self.state == TrainerState::Ready {
            if let Err(err) = self.terminate().await {
                warn!("terminating workers failed: {}", err);
            }
        }
        self.master
    }

    fn require_ready(&self) -> Result<()> {
        match self.state {
            TrainerState::Ready => Ok(()),
            TrainerState::Created => Err(Error::NotInitialized),
            TrainerState::Terminated => Err(Error::Terminated),
        }
    }

    /// Start the workers and give each a replica of the master.
    pub async fn init(&mut self) -> Result<()> {
        match self.state {
            TrainerState::Ready => return Ok(()),
            TrainerState::Terminated => return Err(Error::Terminated),
            TrainerState::Created => {}
        }
        let started = Instant::now();
        let mut workers = Vec::with_capacity(self.config.parallelism);
        for id in 0..self.config.parallelism {
            workers.push(WorkerHandle::spawn::<M>(id)?);
        }

        let descriptor = self.master.describe_replica();
        let replies = join_all(
            workers
                .iter()
                .map(|worker| worker.request(Request::InitModel(descriptor.clone()))),
        )
        .await;
        if let Err(err) = replies.into_iter().collect::<Result<Vec<_>>>() {
            let _ = shutdown(&mut workers).await;
            return Err(err);
        }

        self.workers = workers;
        self.state = TrainerState::Ready;
        info!(
            "parallel trainer ready: {} workers in {:?}",
            self.workers.len(),
            started.elapsed()
        );
        Ok(())
    }

    /// Send the same request to every worker and wait for all replies.
    async fn broadcast<F>(&self, make: F) -> Result<Vec<Reply>>
    where
        F: Fn() -> Request<M::Descriptor>,
    {
        join_all(self.workers.iter().map(|worker| worker.request(make())))
            .await
            .into_iter()
            .collect()
    }

    /// Train the master for `options.epochs` passes, splitting every
    /// mini-batch across the workers.
    pub async fn train<I, E>(&mut self, inputs: &[I], expecteds: &[E], options: &TrainOptions) -> Result<TrainReport>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        self.require_ready()?;
        self.master.check_samples(inputs, expecteds)?;
        let mut plan = BatchPlan::new(inputs.len(), options)?;
        info!(
            "parallel training on {} samples: {} passes, batch size {}, {} workers",
            inputs.len(),
            options.epochs,
            options.batch_size,
            self.workers.len()
        );

        let mut report = TrainReport::default();
        for pass in 0..options.epochs {
            let started = Instant::now();
            let learning_rate = self.master.learning_rate();
            self.broadcast(|| Request::BeforeTrain).await?;
            self.master.before_pass();

            let mut loss = 0.0;
            for batch in plan.next_pass() {
                loss += self.train_group(batch, inputs, expecteds).await?;
                report.steps += 1;
            }

            self.broadcast(|| Request::AfterTrain).await?;
            self.master.after_pass();
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

    /// One mini-batch: scatter, gather, update the master, sync the workers.
    /// Returns the summed sample loss.
    async fn train_group<I, E>(&mut self, batch: &[usize], inputs: &[I], expecteds: &[E]) -> Result<f64>
    where
        I: AsRef<[f64]>,
        E: AsRef<[f64]>,
    {
        let part_size = batch.len().div_ceil(self.workers.len());
        let requests = batch.chunks(part_size).zip(&self.workers).enumerate().map(|(k, (part, worker))| {
            worker.request(Request::TrainBatch {
                offset: k * part_size,
                inputs: part.iter().map(|&i| inputs[i].as_ref().to_vec()).collect(),
                expecteds: part.iter().map(|&i| expecteds[i].as_ref().to_vec()).collect(),
            })
        });

        let mut deltas = Vec::with_capacity(self.workers.len());
        for (reply, worker) in join_all(requests).await.into_iter().zip(&self.workers) {
            match reply? {
                Reply::Deltas(part) => deltas.push(part),
                other => return Err(unexpected(worker.id(), &other)),
            }
        }
        let loss = deltas.iter().map(|d| d.loss).sum();

        self.master.apply_deltas(&deltas)?;
        let parameters = Arc::new(self.master.parameters());
        self.broadcast(|| Request::SyncWeights(Arc::clone(&parameters)))
            .await?;
        Ok(loss)
    }

    /// Run one input through a worker replica, round robin.
    pub async fn compute(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.require_ready()?;
        let index = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        match self.workers[index].request(Request::Compute(vec![input.to_vec()])).await? {
            Reply::Outputs(mut outputs) if outputs.len() == 1 => Ok(outputs.remove(0)),
            other => Err(unexpected(index, &other)),
        }
    }

    /// Run many inputs, split across all workers; outputs keep input order.
    pub async fn compute_batch<I: AsRef<[f64]>>(&mut self, inputs: &[I]) -> Result<Vec<Vec<f64>>> {
        self.require_ready()?;
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let part_size = inputs.len().div_ceil(self.workers.len());
        let requests = inputs.chunks(part_size).zip(&self.workers).map(|(part, worker)| {
            worker.request(Request::Compute(part.iter().map(|i| i.as_ref().to_vec()).collect()))
        });

        let mut outputs = Vec::with_capacity(inputs.len());
        for (reply, worker) in join_all(requests).await.into_iter().zip(&self.workers) {
            match reply? {
                Reply::Outputs(part) => outputs.extend(part),
                other => return Err(unexpected(worker.id(), &other)),
            }
        }
        Ok(outputs)
    }

    /// Stop all workers. The master stays usable through [`master`](Self::master).
    pub async fn terminate(&mut self) -> Result<()> {
        if self.state == TrainerState::Terminated {
            return Ok(());
        }
        self.state = TrainerState::Terminated;
        let result = shutdown(&mut self.workers).await;
        info!("parallel trainer terminated");
        result
    }
}

/// Tell every worker to terminate, then join all threads.
async fn shutdown<D: Send + 'static>(workers: &mut Vec<WorkerHandle<D>>) -> Result<()> {
    let replies = join_all(workers.iter().map(|worker| worker.request(Request::Terminate))).await;
    for mut worker in workers.drain(..) {
        worker.join();
        debug!("worker {} joined", worker.id());
    }
    replies.into_iter().try_for_each(|reply| reply.map(|_| ()))
}

fn unexpected(worker: usize, reply: &Reply) -> Error {
    Error::WorkerFailed {
        worker,
        message: format!("unexpected reply {:?}", reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::Activation;
    use crate::losses::Loss;
    use crate::optimizers::Optimizer;

    fn model() -> Sequential {
        model_with_input(2)
    }

    fn model_with_input(inputs: usize) -> Sequential {
        Sequential::builder()
            .input(inputs)
            .dense(4, Activation::Tanh)
            .dense(1, Activation::Linear)
            .optimizer(Optimizer::sgd(0.05))
            .loss(Loss::mse())
            .build()
            .unwrap()
    }

    #[test]
    fn test_capability_is_detected_once() {
        let trainer = ParallelTrainer::new(model(), ParallelConfig::new(1024)).unwrap();
        let capability = trainer.capability();
        assert_eq!(capability.requested, 1024);
        assert_eq!(capability.available, num_cpus::get());
        assert_eq!(capability.oversubscribed, num_cpus::get() < 1024);
        assert_eq!(ParallelConfig::default().parallelism, num_cpus::get());
        assert!(ParallelTrainer::new(model(), ParallelConfig::new(0)).is_err());
    }

    #[test]
    fn test_replica_descriptor_has_no_moments() {
        let mut master = Sequential::builder()
            .input(2)
            .dense(3, Activation::Tanh)
            .dense(1, Activation::Linear)
            .optimizer(Optimizer::adam(0.01))
            .loss(Loss::mse())
            .build()
            .unwrap();
        master.train_batch(&[vec![0.5, -0.5]], &[vec![1.0]]).unwrap();
        assert!(!Replica::describe(&master).optimizer.moments.is_empty());

        let replica = master.describe_replica();
        assert!(replica.optimizer.moments.is_empty());
        assert_eq!(replica.layers, Replica::describe(&master).layers);
        assert_eq!(Sequential::restore(&replica).unwrap().snapshot(), master.snapshot());

        let mut chain = ChainModel::new(
            vec![model(), model_with_input(1)],
            Optimizer::adam(0.01),
            Loss::mse(),
            Default::default(),
        )
        .unwrap();
        chain.train_batch(&[vec![0.5, -0.5]], &[vec![1.0]]).unwrap();
        let replica = chain.describe_replica();
        assert!(replica.optimizer.moments.is_empty());
        assert!(replica.models.iter().all(|m| m.optimizer.moments.is_empty()));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut trainer = ParallelTrainer::new(model(), ParallelConfig::new(2)).unwrap();
        let inputs = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let expected = vec![vec![1.0], vec![-1.0]];

        assert!(matches!(trainer.compute(&[0.0, 0.0]).await, Err(Error::NotInitialized)));
        assert!(matches!(
            trainer.train(&inputs, &expected, &TrainOptions::default()).await,
            Err(Error::NotInitialized)
        ));

        trainer.init().await.unwrap();
        trainer.init().await.unwrap();
        let report = trainer
            .train(&inputs, &expected, &TrainOptions::new(2, 2))
            .await
            .unwrap();
        assert_eq!(report.passes.len(), 2);
        assert_eq!(report.steps, 2);

        let served = trainer.compute_batch(&inputs).await.unwrap();
        let mut master = trainer.into_master().await;
        assert_eq!(master.epoch(), 2);
        for (input, output) in inputs.iter().zip(&served) {
            assert_eq!(&master.compute(input).unwrap(), output);
        }
    }

    #[tokio::test]
    async fn test_terminated_trainer_rejects_work() {
        let mut trainer = ParallelTrainer::new(model(), ParallelConfig::new(2)).unwrap();
        trainer.init().await.unwrap();
        trainer.terminate().await.unwrap();
        trainer.terminate().await.unwrap();
        assert!(matches!(trainer.compute(&[0.0, 0.0]).await, Err(Error::Terminated)));
        assert!(matches!(trainer.init().await, Err(Error::Terminated)));
    }

    #[tokio::test]
    async fn test_invalid_samples_leave_master_untouched() {
        let mut trainer = ParallelTrainer::new(model(), ParallelConfig::new(2)).unwrap();
        trainer.init().await.unwrap();
        let before = trainer.master().snapshot();
        let result = trainer
            .train(&[vec![0.0, 1.0, 2.0]], &[vec![1.0]], &TrainOptions::default())
            .await;
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
        assert_eq!(trainer.master().snapshot(), before);
        trainer.terminate().await.unwrap();
    }
}
