//! Chunks: contiguous pieces of the mature space
//!
//! A normal chunk is cut into equal slots and carries one color-table
//! nibble per slot. An abnormal ("super") chunk holds a single oversized
//! object at index 0 and a one-word table. Free chunks own no memory.
//!
//! ## Layout
//!
//! ```text
//! Chunk (normal, slot_size = 16):
//! ┌──────────┬──────────┬─────┬──────────┐
//! │ slot 0   │ slot 1   │ ... │ slot N-1 │   words: Box<[AtomicUsize]>
//! └──────────┴──────────┴─────┴──────────┘
//! table: ceil(N / 16) words, 4 bits per slot
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::color::{self, ALLOCATED_MASK, CycleColors, SLOTS_PER_WORD};
use crate::object::{ObjectRef, WORD};

/// Stable identity of a chunk: its base address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle(pub(crate) usize);

impl ChunkHandle {
    /// Base address
    pub fn base(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHandle({:#x})", self.0)
    }
}

/// Chunk status bit set
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkStatus(u8);

impl ChunkStatus {
    /// Not in use
    pub const FREE: Self = Self(1 << 0);
    /// Slotted chunk
    pub const NORMAL: Self = Self(1 << 1);
    /// Single oversized object
    pub const ABNORMAL: Self = Self(1 << 2);
    /// Too full to be considered for allocation
    pub const USED: Self = Self(1 << 3);
    /// Free chunk waiting for the merger
    pub const TO_MERGE: Self = Self(1 << 4);

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Difference
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl fmt::Debug for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::FREE, "FREE"),
            (Self::NORMAL, "NORMAL"),
            (Self::ABNORMAL, "ABNORMAL"),
            (Self::USED, "USED"),
            (Self::TO_MERGE, "TO_MERGE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ChunkStatus({})", set.join("|"))
    }
}

/// A chunk of the mature space
pub struct Chunk {
    base: usize,
    size: usize,
    slot_size: usize,
    slot_num: usize,
    alloc_num: AtomicUsize,
    first_free_word: AtomicUsize,
    status: AtomicU8,
    table: Box<[AtomicUsize]>,
    words: Box<[AtomicUsize]>,
    pub(crate) adj_prev: Option<ChunkHandle>,
    pub(crate) adj_next: Option<ChunkHandle>,
}

fn atomic_words(n: usize) -> Box<[AtomicUsize]> {
    (0..n).map(|_| AtomicUsize::new(0)).collect()
}

impl Chunk {
    /// Free chunk covering `[base, base + size)`
    pub fn new_free(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            slot_size: 0,
            slot_num: 0,
            alloc_num: AtomicUsize::new(0),
            first_free_word: AtomicUsize::new(0),
            status: AtomicU8::new(ChunkStatus::FREE.bits()),
            table: Box::new([]),
            words: Box::new([]),
            adj_prev: None,
            adj_next: None,
        }
    }

    /// Slotted chunk
    pub fn new_normal(base: usize, size: usize, slot_size: usize) -> Self {
        debug_assert!(slot_size >= WORD && slot_size.is_multiple_of(WORD));
        let slot_num = size / slot_size;
        Self {
            slot_size,
            slot_num,
            status: AtomicU8::new(ChunkStatus::NORMAL.bits()),
            table: atomic_words(slot_num.div_ceil(SLOTS_PER_WORD)),
            words: atomic_words(size / WORD),
            ..Self::new_free(base, size)
        }
    }

    /// Chunk holding a single oversized object
    pub fn new_super(base: usize, size: usize) -> Self {
        Self {
            slot_size: size,
            slot_num: 1,
            status: AtomicU8::new(ChunkStatus::ABNORMAL.bits()),
            table: atomic_words(1),
            words: atomic_words(size / WORD),
            ..Self::new_free(base, size)
        }
    }

    /// Handle of this chunk
    pub fn handle(&self) -> ChunkHandle {
        ChunkHandle(self.base)
    }

    /// Base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Slot size in bytes (chunk size for abnormal chunks)
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots
    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    /// Slots handed out
    pub fn alloc_num(&self) -> usize {
        self.alloc_num.load(Ordering::Acquire)
    }

    pub(crate) fn set_alloc_num(&self, n: usize) {
        self.alloc_num.store(n, Ordering::Release);
    }

    /// First table word that may contain a free slot
    pub fn first_free_word(&self) -> usize {
        self.first_free_word.load(Ordering::Acquire)
    }

    pub(crate) fn set_first_free_word(&self, word: usize) {
        self.first_free_word.store(word, Ordering::Release);
    }

    /// Current status
    pub fn status(&self) -> ChunkStatus {
        ChunkStatus(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ChunkStatus) {
        self.status.store(status.bits(), Ordering::Release);
    }

    /// Whether the chunk is free
    pub fn is_free(&self) -> bool {
        self.status().contains(ChunkStatus::FREE)
    }

    /// Whether the chunk holds a single oversized object
    pub fn is_abnormal(&self) -> bool {
        self.status().contains(ChunkStatus::ABNORMAL)
    }

    /// Color table words
    pub fn table(&self) -> &[AtomicUsize] {
        &self.table
    }

    /// Physically adjacent lower chunk
    pub fn adj_prev(&self) -> Option<ChunkHandle> {
        self.adj_prev
    }

    /// Physically adjacent higher chunk
    pub fn adj_next(&self) -> Option<ChunkHandle> {
        self.adj_next
    }

    pub(crate) fn grow(&mut self, extra: usize) {
        debug_assert!(self.is_free());
        self.size += extra;
    }

    /// Whether `addr` lies inside the chunk
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Memory word at `addr`
    pub fn word(&self, addr: usize) -> Option<&AtomicUsize> {
        if !self.contains(addr) {
            return None;
        }
        self.words.get((addr - self.base) / WORD)
    }

    /// Slot index of an object starting at `addr`
    ///
    /// Checked division: addresses that do not start a slot yield `None`.
    pub fn slot_index(&self, addr: usize) -> Option<usize> {
        if self.slot_num == 0 || !self.contains(addr) {
            return None;
        }
        let offset = addr - self.base;
        if !offset.is_multiple_of(self.slot_size) {
            return None;
        }
        let index = offset / self.slot_size;
        (index < self.slot_num).then_some(index)
    }

    /// Address of slot `index`
    pub fn slot_addr(&self, index: usize) -> usize {
        self.base + index * self.slot_size
    }

    /// Color word and bit offset of slot `index`
    ///
    /// Abnormal chunks always answer word 0.
    pub fn color_word(&self, index: usize) -> Option<(&AtomicUsize, u32)> {
        let (word, shift) = if self.is_abnormal() {
            (0, 0)
        } else {
            color::color_position(index)
        };
        self.table.get(word).map(|w| (w, shift))
    }

    /// Slots in table word `word` that belong to the chunk
    pub fn valid_slots_in_word(&self, word: usize) -> usize {
        if self.is_abnormal() {
            return 1;
        }
        self.slot_num
            .saturating_sub(word * SLOTS_PER_WORD)
            .min(SLOTS_PER_WORD)
    }

    /// Claim a free slot with a CAS on the color table, starting at the
    /// `first_free_word` bookmark. The slot gets `color` and its memory is zeroed.
    pub fn claim_free_slot(&self, color: usize) -> Option<usize> {
        if self.is_free() {
            return None;
        }
        let start = self.first_free_word();
        for word_index in start..self.table.len() {
            let valid = self.valid_slots_in_word(word_index);
            if let Some(pos) = color::claim_free(&self.table[word_index], valid, color) {
                if word_index != start {
                    self.set_first_free_word(word_index);
                }
                self.alloc_num.fetch_add(1, Ordering::AcqRel);
                let index = if self.is_abnormal() {
                    0
                } else {
                    word_index * SLOTS_PER_WORD + pos
                };
                self.zero_slot(index);
                return Some(index);
            }
        }
        None
    }

    fn zero_slot(&self, index: usize) {
        let first = index * self.slot_size / WORD;
        let count = self.slot_size / WORD;
        for w in &self.words[first..first + count] {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Whether slot `index` is allocated
    pub fn is_slot_allocated(&self, index: usize) -> bool {
        self.color_word(index)
            .is_some_and(|(w, shift)| color::load_nibble(w, shift) & ALLOCATED_MASK != 0)
    }

    /// Indices of allocated slots
    pub fn allocated_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slot_num).filter(move |&i| self.is_slot_allocated(i))
    }

    /// Slots carrying the black color of `colors`
    pub fn live_slots(&self, colors: &CycleColors) -> usize {
        let mask = if self.is_abnormal() { colors.black } else { colors.mark_mask };
        self.table
            .iter()
            .map(|w| (w.load(Ordering::Acquire) & mask).count_ones() as usize)
            .sum()
    }

    /// Objects in allocated slots
    pub fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.allocated_slots()
            .filter_map(move |i| ObjectRef::new(self.slot_addr(i)))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("slot_size", &self.slot_size)
            .field("slot_num", &self.slot_num)
            .field("alloc_num", &self.alloc_num())
            .field("status", &self.status())
            .finish()
    }
}
