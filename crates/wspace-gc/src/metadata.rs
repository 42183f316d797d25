//! Task pools built from fixed-capacity vector blocks
//!
//! ## Design
//!
//! - A [`VectorBlock`] is one segment of a stack of pointer-sized tasks
//! - A [`Pool`] hands whole blocks between threads under a lock, so a block
//!   is only ever owned by one thread at a time
//! - A [`TaskStack`] is a thread's local segment; it spills full blocks to
//!   its pool and refills from the pool when empty
//! - [`GcMetadata`] owns every pool of a collector plus the recycled empty
//!   blocks; it grows on demand unless given a block limit

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::class::RefKind;
use crate::error::{GcError, Result};

/// Fixed-capacity buffer of task entries
#[derive(Debug, Default)]
pub struct VectorBlock {
    entries: Vec<usize>,
    capacity: usize,
}

impl VectorBlock {
    /// Empty block holding up to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry; returns it back when the block is full
    pub fn push(&mut self, entry: usize) -> std::result::Result<(), usize> {
        if self.is_full() {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove the most recent entry
    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop()
    }

    /// Whether no more entries fit
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Whether the block holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entry capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().copied()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Synchronized pool of blocks
#[derive(Debug, Default)]
pub struct Pool {
    blocks: Mutex<Vec<VectorBlock>>,
    /// Block count readable without the lock
    len: CachePadded<AtomicUsize>,
}

impl Pool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a block, if any
    pub fn get_entry(&self) -> Option<VectorBlock> {
        let mut blocks = self.blocks.lock();
        let block = blocks.pop();
        self.len.store(blocks.len(), Ordering::Release);
        block
    }

    /// Hand a block to the pool
    pub fn put_entry(&self, block: VectorBlock) {
        let mut blocks = self.blocks.lock();
        blocks.push(block);
        self.len.store(blocks.len(), Ordering::Release);
    }

    /// Whether the pool holds no blocks
    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Remove every block and return all entries
    pub fn drain_entries(&self) -> Vec<usize> {
        let mut blocks = self.blocks.lock();
        let entries = blocks.iter().flat_map(VectorBlock::iter).collect();
        blocks.clear();
        self.len.store(0, Ordering::Release);
        entries
    }

    /// Copy of every entry, leaving the pool intact
    pub fn entries(&self) -> Vec<usize> {
        self.blocks.lock().iter().flat_map(VectorBlock::iter).collect()
    }

    /// Move every block of `other` into this pool
    pub fn absorb(&self, other: &Pool) {
        let moved: Vec<VectorBlock> = {
            let mut theirs = other.blocks.lock();
            other.len.store(0, Ordering::Release);
            std::mem::take(&mut *theirs)
        };
        let mut blocks = self.blocks.lock();
        blocks.extend(moved.into_iter().filter(|b| !b.is_empty()));
        self.len.store(blocks.len(), Ordering::Release);
    }
}

/// Every pool used by one collector instance
#[derive(Debug)]
pub struct GcMetadata {
    block_capacity: usize,
    block_limit: Option<usize>,
    blocks_allocated: AtomicUsize,
    /// Recycled empty blocks
    pub free_task_pool: Pool,
    /// Shared mark stack
    pub mark_task_pool: Pool,
    /// Root slot addresses for the current cycle
    pub rootset_pool: Pool,
    /// Mature objects holding nursery references
    pub remset_pool: Pool,
    /// Objects grayed by the insertion barrier during marking
    pub dirty_obj_pool: Pool,
    /// Soft reference objects found while marking
    pub softref_pool: Pool,
    /// Weak reference objects found while marking
    pub weakref_pool: Pool,
    /// Phantom reference objects found while marking
    pub phanref_pool: Pool,
}

impl GcMetadata {
    /// Create pools of `block_capacity`-entry blocks, optionally capped at
    /// `block_limit` blocks in total
    pub fn new(block_capacity: usize, block_limit: Option<usize>) -> Self {
        Self {
            block_capacity,
            block_limit,
            blocks_allocated: AtomicUsize::new(0),
            free_task_pool: Pool::new(),
            mark_task_pool: Pool::new(),
            rootset_pool: Pool::new(),
            remset_pool: Pool::new(),
            dirty_obj_pool: Pool::new(),
            softref_pool: Pool::new(),
            weakref_pool: Pool::new(),
            phanref_pool: Pool::new(),
        }
    }

    /// Entries per block
    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    /// Blocks created so far
    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    /// Pool collecting reference objects of `kind`
    pub fn ref_pool(&self, kind: RefKind) -> Option<&Pool> {
        match kind {
            RefKind::Soft => Some(&self.softref_pool),
            RefKind::Weak => Some(&self.weakref_pool),
            RefKind::Phantom => Some(&self.phanref_pool),
            RefKind::None => None,
        }
    }

    /// An empty block, recycled or newly created
    pub fn try_free_block(&self) -> Result<VectorBlock> {
        if let Some(block) = self.free_task_pool.get_entry() {
            return Ok(block);
        }
        let reserved = self
            .blocks_allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                match self.block_limit {
                    Some(limit) if n >= limit => None,
                    _ => Some(n + 1),
                }
            });
        match reserved {
            Ok(_) => Ok(VectorBlock::new(self.block_capacity)),
            Err(_) => Err(GcError::MetadataExhausted),
        }
    }

    /// An empty block; running out of metadata is fatal
    pub fn free_block(&self) -> VectorBlock {
        match self.try_free_block() {
            Ok(block) => block,
            Err(_) => {
                tracing::error!(
                    target: "wspace::gc",
                    blocks = self.blocks_allocated(),
                    "Run out of GC metadata"
                );
                std::process::abort();
            }
        }
    }

    /// Return a block to the free pool
    pub fn recycle(&self, mut block: VectorBlock) {
        if block.capacity() == 0 {
            return;
        }
        block.clear();
        self.free_task_pool.put_entry(block);
    }
}

/// A thread's local segment of a shared stack
pub struct TaskStack<'m> {
    metadata: &'m GcMetadata,
    pool: &'m Pool,
    block: VectorBlock,
}

impl<'m> TaskStack<'m> {
    /// Local segment spilling into `pool`
    pub fn new(metadata: &'m GcMetadata, pool: &'m Pool) -> Self {
        Self {
            metadata,
            pool,
            block: metadata.free_block(),
        }
    }

    /// Push a task; a full segment is handed to the pool first
    pub fn push(&mut self, task: usize) {
        if self.block.is_full() {
            let full = std::mem::replace(&mut self.block, self.metadata.free_block());
            self.pool.put_entry(full);
        }
        // Fresh blocks always have room.
        let _ = self.block.push(task);
    }

    /// Pop a task, refilling from the pool when the local segment is empty
    pub fn pop(&mut self) -> Option<usize> {
        if let Some(task) = self.block.pop() {
            return Some(task);
        }
        let next = self.pool.get_entry()?;
        let empty = std::mem::replace(&mut self.block, next);
        self.metadata.recycle(empty);
        self.block.pop()
    }

    /// Whether the local segment is empty
    pub fn is_local_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// Hand the local segment to the pool if it holds anything
    pub fn flush(&mut self) {
        if !self.block.is_empty() {
            let block = std::mem::replace(&mut self.block, self.metadata.free_block());
            self.pool.put_entry(block);
        }
    }
}

impl Drop for TaskStack<'_> {
    fn drop(&mut self) {
        let block = std::mem::take(&mut self.block);
        if block.is_empty() {
            self.metadata.recycle(block);
        } else {
            self.pool.put_entry(block);
        }
    }
}
