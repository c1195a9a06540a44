//! Feed-forward neural network training engine
//!
//! `zen-dense` trains stacks of fully connected layers with backpropagation.
//! All layer buffers, optimizer moments and per-sample deltas live in a
//! per-model chunked arena, so training a compiled model allocates nothing
//! beyond its arena chunks.
//!
//! ## Building blocks
//!
//! - **Activations**: sigmoid, tanh, linear, (leaky) ReLU, softmax
//! - **Losses**: mean squared / absolute error, categorical and binary cross-entropy
//! - **Optimizers**: SGD, momentum, Nesterov, RMSProp, Adam, with inverse-time decay
//! - **Layers**: [`Dense`] with initializers, dropout and L1/L2 regularization
//! - **Models**: [`Sequential`], [`ChainModel`] (sub-models end to end, each
//!   trainable or frozen) and [`GenerativeAdversarialModel`]
//! - **Parallel training**: [`ParallelTrainer`] splits every mini-batch across
//!   worker replicas and produces the same weights as serial training
//!
//! ## Quick start
//!
//! ```rust
//! use zen_dense::{Activation, Dense, Loss, Optimizer, Sequential, TrainOptions};
//!
//! let mut model = Sequential::builder()
//!     .input(2)
//!     .layer(Dense::new(4).with_activation(Activation::Tanh))
//!     .dense(1, Activation::Linear)
//!     .optimizer(Optimizer::adam(0.01))
//!     .loss(Loss::mse())
//!     .build()?;
//!
//! let inputs = vec![vec![0.0, 0.5], vec![1.0, 0.25]];
//! let expected = vec![vec![0.5], vec![1.25]];
//! let report = model.train(&inputs, &expected, &TrainOptions::new(20, 2))?;
//! assert_eq!(report.passes.len(), 20);
//!
//! let evaluation = model.evaluate(&inputs, &expected)?;
//! assert!(evaluation.loss.is_finite());
//! # Ok::<(), zen_dense::Error>(())
//! ```

pub mod activations;
pub mod error;
pub mod initializers;
pub mod kernels;
pub mod layers;
pub mod losses;
pub mod memory;
pub mod model;
pub mod optimizers;
pub mod parallel;
pub mod serialization;

// Re-export main types
pub use activations::Activation;
pub use error::{Error, Result};
pub use initializers::Initializer;
pub use layers::{Dense, Regularization};
pub use losses::Loss;
pub use memory::{Arena, ArenaConfig, ArenaError, Slice};
pub use model::{
    BatchDeltas, ChainModel, DeltaBlock, Evaluation, GanPassReport, GanReport, GenerativeAdversarialModel,
    LayerParameters, LayerStack, ModelConfig, PassReport, Sequential, SequentialBuilder, Snapshot, TrainOptions,
    TrainReport,
};
pub use optimizers::{MomentSnapshot, Optimizer, OptimizerKind};
pub use parallel::{Capability, ParallelConfig, ParallelTrainer, Replica};
pub use serialization::{ChainDescriptor, GanDescriptor, LayerDescriptor, ModelDescriptor, OptimizerDescriptor};
