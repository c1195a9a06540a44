/**
 * @file src/memory/mod.rs
 * @brief Arena-backed tensor storage for layer parameters and scratch buffers
 *
 * Every numeric buffer a model touches during training lives in an [`Arena`]:
 * weight rows, biases, optimizer moments, per-layer activation caches and the
 * per-sample delta frames used for gradient accumulation.
 *
 * ## Allocation model
 *
 * - Memory is carved from large chunks; a chunk holds `chunk_size` elements
 *   (or twice the request when a single allocation is larger).
 * - Allocation takes the tail of the most recently created chunk with room.
 * - Freeing marks a region disposed; trailing disposed regions are reclaimed
 *   immediately, so strictly LIFO usage recycles memory without growth.
 * - Non-trailing frees are deferred until everything above them is released.
 * - A [`Slice`] is not `Clone` and [`Arena::free`] consumes it, so a region
 *   cannot be freed twice; the only failure left is a foreign handle.
 *
 * Sizes are counted in `f64` elements, never bytes.
 */

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod arena;

pub use arena::{Arena, ArenaStats, Slice};

/// Default number of elements in a freshly created chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Arena configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ArenaConfig {
    /// Elements per chunk
    pub chunk_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ArenaConfig {
    /// Set the chunk size in elements.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Arena failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("Invalid slice handle: chunk {chunk} does not belong to this arena ({chunks} chunks)")]
    InvalidHandle { chunk: usize, chunks: usize },

    #[error("Invalid arena configuration: {message}")]
    ConfigError { message: String },
}
