//! The mature space ("wspace"): address-ordered chunks, a size-segregated
//! free-chunk registry and per-slot-size allocation pools.
//!
//! ## Design
//!
//! - Structural changes (carving, merging) take `&mut Wspace` and happen at
//!   safepoints only
//! - Slot allocation takes `&self`: chunks are claimed from a pool and slots
//!   are claimed with a CAS on the color table
//! - A chunk handle is its base address; carving keeps the base of the
//!   piece that is handed out

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::chunk::{Chunk, ChunkHandle, ChunkStatus};
use crate::object::WORD;

/// Size classes for slotted allocation, in bytes.
/// Objects above the largest class get their own abnormal chunk.
pub const SIZE_CLASSES: &[usize] = &[
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 1024, 2048,
];

/// Objects larger than this go to super chunks
pub const LARGE_OBJECT_THRESHOLD: usize = 2048;

/// Smallest size class holding `size` bytes
#[inline]
pub fn size_class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().copied().find(|&sc| sc >= size)
}

/// How a carved chunk is linked into the adjacency chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linking {
    /// Both adjacency links are maintained
    Linked,
    /// The carved chunk's `adj_prev` is left unset; used while objects are
    /// being forwarded, repaired by the remerge pass
    Deferred,
}

/// The mature space
pub struct Wspace {
    base: usize,
    size: usize,
    normal_chunk_size: usize,
    chunk_granule: usize,
    pub(crate) chunks: BTreeMap<usize, Chunk>,
    /// (size, base) of every free chunk
    pub(crate) free_registry: BTreeSet<(usize, usize)>,
    /// Chunks with free slots, per slot size
    pfc_pools: Mutex<FxHashMap<usize, Vec<ChunkHandle>>>,
}

impl Wspace {
    /// Create a space made of one free chunk
    pub fn new(base: usize, size: usize, normal_chunk_size: usize, chunk_granule: usize) -> Self {
        let mut chunks = BTreeMap::new();
        chunks.insert(base, Chunk::new_free(base, size));
        let mut free_registry = BTreeSet::new();
        free_registry.insert((size, base));
        Self {
            base,
            size,
            normal_chunk_size,
            chunk_granule,
            chunks,
            free_registry,
            pfc_pools: Mutex::new(FxHashMap::default()),
        }
    }

    /// First address of the space
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last address
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `addr` lies inside the space
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Normal chunk size
    pub fn normal_chunk_size(&self) -> usize {
        self.normal_chunk_size
    }

    /// Chunk containing `addr`
    pub fn chunk_at(&self, addr: usize) -> Option<&Chunk> {
        let (_, chunk) = self.chunks.range(..=addr).next_back()?;
        chunk.contains(addr).then_some(chunk)
    }

    /// Chunk by handle
    pub fn chunk(&self, handle: ChunkHandle) -> Option<&Chunk> {
        self.chunks.get(&handle.0)
    }

    /// Chunks in address order
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Chunk and slot index of the object starting at `addr`
    pub fn locate(&self, addr: usize) -> Option<(&Chunk, usize)> {
        let chunk = self.chunk_at(addr)?;
        if chunk.is_free() {
            return None;
        }
        chunk.slot_index(addr).map(|i| (chunk, i))
    }

    /// Free chunks as (base, size), in address order
    pub fn free_chunks(&self) -> Vec<(usize, usize)> {
        let mut free: Vec<_> = self
            .free_registry
            .iter()
            .map(|&(size, base)| (base, size))
            .collect();
        free.sort_unstable();
        free
    }

    /// Bytes in free chunks
    pub fn free_bytes(&self) -> usize {
        self.free_registry.iter().map(|&(size, _)| size).sum()
    }

    /// Carve a normal chunk for `slot_size` and put it in that pool
    pub fn alloc_normal_chunk(&mut self, slot_size: usize, linking: Linking) -> Option<ChunkHandle> {
        let size = self.normal_chunk_size;
        let handle = self.carve(size, linking, |base, size| {
            Chunk::new_normal(base, size, slot_size)
        })?;
        self.pfc_pools
            .get_mut()
            .entry(slot_size)
            .or_default()
            .push(handle);
        Some(handle)
    }

    /// Carve an abnormal chunk for one object of `object_size` bytes
    pub fn alloc_super_chunk(&mut self, object_size: usize, linking: Linking) -> Option<ChunkHandle> {
        let size = object_size
            .max(WORD)
            .div_ceil(self.chunk_granule)
            * self.chunk_granule;
        self.carve(size, linking, Chunk::new_super)
    }

    /// Split the best-fitting free chunk into `[base, base + size)` built by
    /// `make` and a free remainder
    fn carve(
        &mut self,
        size: usize,
        linking: Linking,
        make: impl FnOnce(usize, usize) -> Chunk,
    ) -> Option<ChunkHandle> {
        let &(free_size, base) = self.free_registry.range((size, 0)..).next()?;
        self.free_registry.remove(&(free_size, base));
        let old = self.chunks.remove(&base)?;

        let mut carved = make(base, size);
        carved.adj_prev = match linking {
            Linking::Linked => old.adj_prev,
            Linking::Deferred => None,
        };
        if free_size > size {
            let rest_base = base + size;
            let mut rest = Chunk::new_free(rest_base, free_size - size);
            rest.adj_prev = Some(ChunkHandle(base));
            rest.adj_next = old.adj_next;
            if let Some(next) = old.adj_next.and_then(|n| self.chunks.get_mut(&n.0)) {
                next.adj_prev = Some(ChunkHandle(rest_base));
            }
            carved.adj_next = Some(ChunkHandle(rest_base));
            self.free_registry.insert((rest.size(), rest_base));
            self.chunks.insert(rest_base, rest);
        } else {
            carved.adj_next = old.adj_next;
        }
        let handle = carved.handle();
        self.chunks.insert(base, carved);
        Some(handle)
    }

    /// Claim a slot of `slot_size` bytes from the pool for that size
    ///
    /// Chunks that turn out full are marked `USED` and leave the pool.
    pub fn alloc_slot(&self, slot_size: usize, color: usize) -> Option<usize> {
        let mut pools = self.pfc_pools.lock();
        let pool = pools.get_mut(&slot_size)?;
        while let Some(&handle) = pool.last() {
            let Some(chunk) = self.chunk(handle) else {
                pool.pop();
                continue;
            };
            if let Some(index) = chunk.claim_free_slot(color) {
                return Some(chunk.slot_addr(index));
            }
            chunk.set_status(chunk.status().with(ChunkStatus::USED));
            pool.pop();
        }
        None
    }

    /// Claim the object slot of a freshly carved super chunk
    pub fn claim_super(&self, handle: ChunkHandle, color: usize) -> Option<usize> {
        let chunk = self.chunk(handle)?;
        chunk.claim_free_slot(color).map(|i| chunk.slot_addr(i))
    }

    /// Replace every allocation pool with the chunks the sweeper found reusable
    pub fn install_pfc(&mut self, mut pfc: Vec<ChunkHandle>) {
        // Lowest addresses are allocated from first.
        pfc.sort_unstable_by(|a, b| b.cmp(a));
        let pools = self.pfc_pools.get_mut();
        pools.clear();
        for handle in pfc {
            if let Some(chunk) = self.chunks.get(&handle.0) {
                pools.entry(chunk.slot_size()).or_default().push(handle);
            }
        }
    }

    /// Chunks currently in the allocation pool for `slot_size`
    pub fn pfc_chunks(&self, slot_size: usize) -> Vec<ChunkHandle> {
        self.pfc_pools
            .lock()
            .get(&slot_size)
            .cloned()
            .unwrap_or_default()
    }

    /// Rebuild adjacency links from address order
    pub fn rebuild_adjacency(&mut self) {
        let mut prev: Option<(usize, usize)> = None;
        let bases: Vec<(usize, usize)> = self.chunks.values().map(|c| (c.base(), c.end())).collect();
        for &(base, end) in &bases {
            let linked_prev = prev.filter(|&(_, prev_end)| prev_end == base);
            if let Some(chunk) = self.chunks.get_mut(&base) {
                chunk.adj_prev = linked_prev.map(|(b, _)| ChunkHandle(b));
                chunk.adj_next = None;
            }
            if let Some((prev_base, _)) = linked_prev {
                if let Some(p) = self.chunks.get_mut(&prev_base) {
                    p.adj_next = Some(ChunkHandle(base));
                }
            }
            prev = Some((base, end));
        }
    }
}
