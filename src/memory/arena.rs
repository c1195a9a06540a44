//! Chunked arena allocator handing out disjoint `f64` slices.
//!
//! A [`Slice`] is an exclusive view into one region of a chunk. Slices are not
//! `Clone`, and the arena never hands out overlapping live regions, so each
//! slice may be read and written through ordinary `&[f64]` / `&mut [f64]`
//! borrows. Chunk storage is reference counted: a slice keeps its chunk alive
//! even if the arena is dropped first.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use log::trace;

use super::{ArenaConfig, ArenaError};

/// Backing storage of one chunk.
struct ChunkStorage {
    cells: Box<[UnsafeCell<f64>]>,
}

impl ChunkStorage {
    fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| UnsafeCell::new(0.0)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.cells.len()
    }

    /// Raw pointer to the element at `offset` (may be one past the end).
    fn element_ptr(&self, offset: usize) -> *mut f64 {
        debug_assert!(offset <= self.cells.len());
        UnsafeCell::raw_get(self.cells.as_ptr().wrapping_add(offset))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    len: usize,
    disposed: bool,
}

struct Chunk {
    storage: Rc<ChunkStorage>,
    available: usize,
    entries: Vec<Entry>,
}

impl Chunk {
    fn capacity(&self) -> usize {
        self.storage.len()
    }
}

/// Exclusive handle to a region of arena memory.
pub struct Slice {
    storage: Rc<ChunkStorage>,
    chunk: usize,
    offset: usize,
    len: usize,
}

impl Slice {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the chunk this slice lives in.
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Element offset inside the chunk.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_slice(&self) -> &[f64] {
        // SAFETY: the region [offset, offset + len) lies inside the chunk and
        // is owned by this handle alone; the arena never issues overlapping
        // live regions and `Slice` is not `Clone`.
        unsafe { std::slice::from_raw_parts(self.storage.element_ptr(self.offset), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        // SAFETY: see `as_slice`; `&mut self` guarantees exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(self.storage.element_ptr(self.offset), self.len)
        }
    }
}

impl Deref for Slice {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        self.as_slice()
    }
}

impl DerefMut for Slice {
    fn deref_mut(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }
}

impl AsRef<[f64]> for Slice {
    fn as_ref(&self) -> &[f64] {
        self.as_slice()
    }
}

impl AsMut<[f64]> for Slice {
    fn as_mut(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("chunk", &self.chunk)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Allocation statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    pub chunks: usize,
    pub capacity: usize,
    pub available: usize,
    /// Regions not yet reclaimed (live or disposed-but-buried).
    pub entries: usize,
}

/// Chunked tensor arena
pub struct Arena {
    config: ArenaConfig,
    chunks: Vec<Chunk>,
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        if config.chunk_size == 0 {
            return Err(ArenaError::ConfigError {
                message: "chunk_size must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            config,
            chunks: Vec::new(),
        })
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Allocate a zero-filled slice of `len` elements.
    pub fn alloc(&mut self, len: usize) -> Slice {
        let index = match self.chunks.iter().rposition(|chunk| chunk.available >= len) {
            Some(index) => index,
            None => self.push_chunk(self.config.chunk_size.max(len * 2)),
        };

        let chunk = &mut self.chunks[index];
        let offset = chunk.capacity() - chunk.available;
        chunk.available -= len;
        chunk.entries.push(Entry {
            offset,
            len,
            disposed: false,
        });

        let mut slice = Slice {
            storage: Rc::clone(&chunk.storage),
            chunk: index,
            offset,
            len,
        };
        // Regions may be recycled after a free.
        slice.fill(0.0);
        slice
    }

    /// Allocate a slice holding a copy of `values`.
    pub fn alloc_from(&mut self, values: &[f64]) -> Slice {
        let mut slice = self.alloc(values.len());
        slice.copy_from_slice(values);
        slice
    }

    /// Release a slice.
    ///
    /// The region is reclaimed immediately when it is the last live region of
    /// its chunk; otherwise reclamation waits for everything above it.
    pub fn free(&mut self, slice: Slice) -> Result<(), ArenaError> {
        let chunks = self.chunks.len();
        let foreign = ArenaError::InvalidHandle {
            chunk: slice.chunk,
            chunks,
        };
        let Some(chunk) = self
            .chunks
            .get_mut(slice.chunk)
            .filter(|chunk| Rc::ptr_eq(&chunk.storage, &slice.storage))
        else {
            return Err(foreign);
        };

        // live regions never share an offset
        let entry = chunk
            .entries
            .iter_mut()
            .rev()
            .find(|entry| !entry.disposed && entry.offset == slice.offset)
            .ok_or(foreign)?;
        entry.disposed = true;

        while let Some(last) = chunk.entries.last() {
            if !last.disposed {
                break;
            }
            chunk.available += last.len;
            chunk.entries.pop();
        }
        Ok(())
    }

    /// Number of chunks created so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Free elements remaining at the tail of a chunk.
    pub fn available(&self, chunk: usize) -> Option<usize> {
        self.chunks.get(chunk).map(|chunk| chunk.available)
    }

    pub fn stats(&self) -> ArenaStats {
        self.chunks.iter().fold(
            ArenaStats {
                chunks: self.chunks.len(),
                ..ArenaStats::default()
            },
            |mut stats, chunk| {
                stats.capacity += chunk.capacity();
                stats.available += chunk.available;
                stats.entries += chunk.entries.len();
                stats
            },
        )
    }

    fn push_chunk(&mut self, capacity: usize) -> usize {
        trace!("arena: creating chunk {} with {} elements", self.chunks.len(), capacity);
        self.chunks.push(Chunk {
            storage: Rc::new(ChunkStorage::new(capacity)),
            available: capacity,
            entries: Vec::new(),
        });
        self.chunks.len() - 1
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self {
            config: ArenaConfig::default(),
            chunks: Vec::new(),
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
